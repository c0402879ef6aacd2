use {
    async_trait::async_trait,
    clap::Parser,
    filetime::FileTime,
    log::{debug, info},
    ninep::{
        errno::*,
        srv::{Config, ConnInfo, FId, Filesystem, Srv},
        user::{OsUsers, Users},
        *,
    },
    std::{
        io::SeekFrom,
        os::unix::fs::PermissionsExt,
        path::{Path, PathBuf},
        sync::Arc,
    },
    tokio::{
        fs,
        io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
        sync::{Mutex, RwLock},
    },
    tokio_stream::{StreamExt, wrappers::ReadDirStream},
};

mod utils;
use crate::utils::*;

#[derive(Default)]
struct UfsFId {
    realpath: RwLock<PathBuf>,
    file: Mutex<Option<fs::File>>,
    dirents: Mutex<DirSnapshot>,
}

/// Serves a host directory
struct Ufs {
    realroot: PathBuf,
    users: Arc<dyn Users>,
}

impl Ufs {
    async fn path_of(&self, fid: &FId<UfsFId>) -> PathBuf {
        fid.aux.realpath.read().await.clone()
    }

    async fn open_file(path: &Path, mode: u8, create: Option<u32>) -> Result<fs::File> {
        let (read, write) = access(mode);
        let mut options = fs::OpenOptions::new();
        options
            .read(read)
            .write(write)
            .truncate(write && mode & om::TRUNC != 0);
        if let Some(perm) = create {
            options.create(true).mode(perm);
        }
        Ok(options.open(path).await?)
    }

    /// Build the stat records a directory read at offset 0 starts from
    async fn snapshot(&self, dir: &Path, dotu: bool) -> Result<DirSnapshot> {
        let mut snap = DirSnapshot::default();
        let mut entries = ReadDirStream::new(fs::read_dir(dir).await?);
        while let Some(entry) = entries.next().await {
            let path = entry?.path();
            match get_stat(&path, dotu, &*self.users).await {
                Ok(stat) => snap.push(&stat, dotu)?,
                // Gone since the listing, or unreadable
                Err(e) => debug!("stat of {:?}: {}", path, e),
            }
        }
        Ok(snap)
    }
}

#[async_trait]
impl Filesystem for Ufs {
    type FId = UfsFId;

    async fn rattach(
        &self,
        fid: &FId<Self::FId>,
        _afid: Option<&FId<Self::FId>>,
        aname: &str,
    ) -> Result<FCall> {
        let path = join_path(&self.realroot, &self.realroot, aname)?;
        let qid = get_qid(&path).await?;
        *fid.aux.realpath.write().await = path;

        Ok(FCall::RAttach { qid })
    }

    async fn rwalk(
        &self,
        fid: &FId<Self::FId>,
        newfid: &FId<Self::FId>,
        wnames: &[String],
    ) -> Result<FCall> {
        let mut wqids = Vec::new();
        let mut path = self.path_of(fid).await;

        for (i, name) in wnames.iter().enumerate() {
            let next = join_name(&self.realroot, &path, name)?;
            let qid = match get_qid(&next).await {
                Ok(qid) => qid,
                Err(e) => {
                    if i == 0 {
                        return Err(e);
                    } else {
                        break;
                    }
                }
            };

            wqids.push(qid);
            path = next;
        }

        if wqids.len() == wnames.len() {
            *newfid.aux.realpath.write().await = path;
        }

        Ok(FCall::RWalk { wqids })
    }

    async fn ropen(&self, fid: &FId<Self::FId>, mode: u8) -> Result<FCall> {
        let realpath = self.path_of(fid).await;
        let qid = get_qid(&realpath).await?;

        if !qid.typ.contains(QIdType::DIR) {
            let file = Ufs::open_file(&realpath, mode, None).await?;
            *fid.aux.file.lock().await = Some(file);
        }

        Ok(FCall::ROpen { qid, iounit: 0 })
    }

    async fn rcreate(
        &self,
        fid: &FId<Self::FId>,
        name: &str,
        perm: u32,
        mode: u8,
        extension: &str,
    ) -> Result<FCall> {
        let dir = self.path_of(fid).await;
        let path = match join_name(&self.realroot, &dir, name)? {
            ref p if p.parent() == Some(dir.as_path()) => p.clone(),
            _ => return res!(EINVAL),
        };
        let dotu = fid.dotu();

        let mut file = None;
        if perm & dm::DIR != 0 {
            fs::create_dir(&path).await?;
            fs::set_permissions(&path, PermissionsExt::from_mode(perm & 0o777)).await?;
        } else if perm & dm::SYMLINK != 0 {
            fs::symlink(extension, &path).await?;
        } else if perm & dm::NAMEDPIPE != 0 {
            let mode = nix::sys::stat::Mode::from_bits_truncate(perm & 0o777);
            nix::unistd::mkfifo(&path, mode)?;
        } else if perm & (dm::LINK | dm::DEVICE | dm::SOCKET) != 0 {
            return res!(EOPNOTSUPP);
        } else {
            let perm = unix_mode(perm, dotu);
            file = Some(Ufs::open_file(&path, mode, Some(perm)).await?);
        }

        let qid = get_qid(&path).await?;
        *fid.aux.realpath.write().await = path;
        *fid.aux.file.lock().await = file;

        Ok(FCall::RCreate { qid, iounit: 0 })
    }

    async fn rread(&self, fid: &FId<Self::FId>, offset: u64, count: u32) -> Result<FCall> {
        if fid.qtype().contains(QIdType::DIR) {
            let mut dirents = fid.aux.dirents.lock().await;
            if offset == 0 {
                let realpath = self.path_of(fid).await;
                *dirents = self.snapshot(&realpath, fid.dotu()).await?;
            }
            let data = dirents.chunk(offset, count)?.to_vec();
            return Ok(FCall::RRead { data: Data(data) });
        }

        let buf = {
            let mut file = fid.aux.file.lock().await;
            let file = file.as_mut().ok_or_else(|| INVALID_FID!())?;
            file.seek(SeekFrom::Start(offset)).await?;

            let mut buf = vec![0; count as usize];
            let bytes = file.read(&mut buf[..]).await?;
            buf.truncate(bytes);
            buf
        };

        Ok(FCall::RRead { data: Data(buf) })
    }

    async fn rwrite(&self, fid: &FId<Self::FId>, offset: u64, data: &Data) -> Result<FCall> {
        let count = {
            let mut file = fid.aux.file.lock().await;
            let file = file.as_mut().ok_or_else(|| INVALID_FID!())?;
            file.seek(SeekFrom::Start(offset)).await?;
            file.write(&data.0).await? as u32
        };

        Ok(FCall::RWrite { count })
    }

    async fn rremove(&self, fid: &FId<Self::FId>) -> Result<FCall> {
        let path = self.path_of(fid).await;
        if path == self.realroot {
            return res!(EBUSY);
        }

        match fs::symlink_metadata(&path).await? {
            ref attr if attr.is_dir() => fs::remove_dir(&path).await?,
            _ => fs::remove_file(&path).await?,
        };

        Ok(FCall::RRemove)
    }

    async fn rstat(&self, fid: &FId<Self::FId>) -> Result<FCall> {
        let path = self.path_of(fid).await;
        let stat = get_stat(&path, fid.dotu(), &*self.users).await?;

        Ok(FCall::RStat { stat })
    }

    async fn rwstat(&self, fid: &FId<Self::FId>, stat: &Stat) -> Result<FCall> {
        let keep = Stat::dont_touch();
        let dotu = fid.dotu();
        let mut filepath = self.path_of(fid).await;

        if stat.mode != keep.mode {
            let mode = unix_mode(stat.mode, dotu);
            fs::set_permissions(&filepath, PermissionsExt::from_mode(mode)).await?;
        }

        let mut uid = if dotu && stat.n_uid != NOUID {
            Some(stat.n_uid)
        } else {
            None
        };
        let mut gid = if dotu && stat.n_gid != NOUID {
            Some(stat.n_gid)
        } else {
            None
        };
        if uid.is_none() && !stat.uid.is_empty() {
            uid = Some(self.users.uname2user(&stat.uid).ok_or(EINVAL)?.id);
        }
        if gid.is_none() && !stat.gid.is_empty() {
            gid = Some(self.users.gname2group(&stat.gid).ok_or(EINVAL)?.id);
        }
        if uid.is_some() || gid.is_some() {
            nix::unistd::chown(
                &filepath,
                uid.map(nix::unistd::Uid::from_raw),
                gid.map(nix::unistd::Gid::from_raw),
            )?;
        }

        if !stat.name.is_empty() {
            let parent = filepath.parent().unwrap_or(self.realroot.as_path()).to_owned();
            let newpath = join_path(&self.realroot, &parent, &stat.name)?;
            if newpath == self.realroot {
                return res!(EINVAL);
            }
            fs::rename(&filepath, &newpath).await?;
            *fid.aux.realpath.write().await = newpath.clone();
            filepath = newpath;
        }

        if stat.length != keep.length {
            fs::OpenOptions::new()
                .write(true)
                .create(false)
                .open(&filepath)
                .await?
                .set_len(stat.length)
                .await?;
        }

        if stat.atime != keep.atime || stat.mtime != keep.mtime {
            let attr = fs::metadata(&filepath).await?;
            let atime = if stat.atime != keep.atime {
                FileTime::from_unix_time(stat.atime as i64, 0)
            } else {
                FileTime::from_last_access_time(&attr)
            };

            let mtime = if stat.mtime != keep.mtime {
                FileTime::from_unix_time(stat.mtime as i64, 0)
            } else {
                FileTime::from_last_modification_time(&attr)
            };

            tokio::task::spawn_blocking(move || filetime::set_file_times(filepath, atime, mtime))
                .await
                .map_err(|e| Error::Io(std::io::Error::other(e)))??;
        }

        Ok(FCall::RWStat)
    }

    fn conn_opened(&self, conn: &ConnInfo) {
        info!("{}: connection {} opened", conn.peer, conn.id);
    }

    fn conn_closed(&self, conn: &ConnInfo) {
        info!("{}: connection {} closed", conn.peer, conn.id);
    }

    fn fid_destroy(&self, fid: &FId<Self::FId>) {
        if let Ok(mut file) = fid.aux.file.try_lock() {
            file.take();
        }
    }
}

#[derive(Debug, clap::Parser)]
struct Cli {
    /// proto!address!port
    /// where: proto = tcp | unix
    address: String,

    /// Directory to export
    exportdir: PathBuf,

    /// Largest message size offered to clients
    #[arg(long, default_value_t = MSIZE)]
    msize: u32,

    /// Speak plain 9P2000 only
    #[arg(long)]
    no_dotu: bool,

    /// Workers per connection, 0 for a task per request
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// Requests queued per connection
    #[arg(long, default_value_t = 32)]
    maxpend: usize,
}

async fn ufs_main(
    Cli {
        address,
        exportdir,
        msize,
        no_dotu,
        workers,
        maxpend,
    }: Cli,
) -> ninep::Result<i32> {
    if !fs::try_exists(&exportdir).await? {
        fs::create_dir_all(&exportdir).await?;
    }
    if !fs::metadata(&exportdir).await?.is_dir() {
        return res!(io_err!(Other, "mount point must be a directory"));
    }
    let realroot = fs::canonicalize(&exportdir).await?;

    let config = Config {
        msize,
        dotu: !no_dotu,
        nworkers: workers,
        maxpend,
    };
    let ufs = Ufs {
        realroot,
        users: Arc::new(OsUsers::new()),
    };

    println!("[*] Exporting {:?}", ufs.realroot);
    println!("[*] Ready to accept clients: {}", address);
    Srv::new(ufs).config(config).listen(&address).await.and(Ok(0))
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = ufs_main(Cli::parse()).await.unwrap_or_else(|e| {
        eprintln!("Error: {:?}", e);
        -1
    });

    std::process::exit(exit_code);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("ufs-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn dotdot_never_leaves_the_root() {
        let root = Path::new("/srv/export");
        let sub = root.join("a");
        assert_eq!(join_name(root, &sub, "..").unwrap(), root);
        assert_eq!(join_name(root, root, "..").unwrap(), root);
        assert_eq!(join_name(root, root, ".").unwrap(), root);
        assert_eq!(join_name(root, root, "b").unwrap(), root.join("b"));
        assert!(join_name(root, root, "b/c").is_err());
        assert!(join_name(root, root, "/etc").is_err());

        assert_eq!(
            join_path(root, &sub, "../../../etc").unwrap(),
            root.join("etc")
        );
        assert_eq!(join_path(root, &sub, "/x/y").unwrap(), root.join("x/y"));
    }

    #[test]
    fn open_modes() {
        assert_eq!(access(om::READ), (true, false));
        assert_eq!(access(om::WRITE | om::TRUNC), (false, true));
        assert_eq!(access(om::RDWR), (true, true));
        assert_eq!(access(om::EXEC), (true, false));
    }

    #[test]
    fn setuid_bits_need_dotu() {
        let mode = dm::SETUID | dm::SETGID | 0o755;
        assert_eq!(unix_mode(mode, true), 0o6755);
        assert_eq!(unix_mode(mode, false), 0o755);
        assert_eq!(unix_mode(dm::DIR | 0o700, true), 0o700);
    }

    #[tokio::test]
    async fn stats_describe_host_files() {
        let dir = scratch("stat");
        std::fs::write(dir.join("file"), b"twelve bytes").unwrap();
        std::os::unix::fs::symlink("file", dir.join("link")).unwrap();
        let users = OsUsers::new();

        let st = get_stat(&dir.join("file"), true, &users).await.unwrap();
        assert_eq!(st.name, "file");
        assert_eq!(st.length, 12);
        assert_eq!(st.mode & dm::DIR, 0);
        assert_eq!(st.qid.typ, QIdType::FILE);
        assert_eq!(st.n_uid, nix::unistd::getuid().as_raw());

        let st = get_stat(&dir.join("link"), true, &users).await.unwrap();
        assert_ne!(st.mode & dm::SYMLINK, 0);
        assert_eq!(st.extension, "file");
        assert!(st.qid.typ.contains(QIdType::SYMLINK));

        let st = get_stat(&dir.join("link"), false, &users).await.unwrap();
        assert_eq!(st.mode & dm::SYMLINK, 0);
        assert_eq!(st.extension, "");
        assert_eq!(st.n_uid, NOUID);

        let st = get_stat(&dir, true, &users).await.unwrap();
        assert_ne!(st.mode & dm::DIR, 0);
        assert_eq!(st.length, 0);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn directory_reads_never_split_records() {
        let dir = scratch("snapshot");
        for name in ["a", "bb", "ccc"] {
            std::fs::write(dir.join(name), b"").unwrap();
        }
        let ufs = Ufs {
            realroot: dir.clone(),
            users: Arc::new(OsUsers::new()),
        };

        let snap = ufs.snapshot(&dir, true).await.unwrap();
        let all = snap.chunk(0, u32::MAX).unwrap().to_vec();
        let (stats, used) = serialize::unpack_dir(&all, true).unwrap();
        assert_eq!(used, all.len());
        assert_eq!(stats.len(), 3);

        let first = stats[0].size(true) as u32;
        assert_eq!(snap.chunk(0, first + 10).unwrap().len(), first as usize);
        assert!(snap.chunk(0, first - 1).is_err());
        let rest = snap.chunk(first as u64, u32::MAX).unwrap();
        assert_eq!(rest.len(), all.len() - first as usize);
        assert!(snap.chunk(all.len() as u64, 100).unwrap().is_empty());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
