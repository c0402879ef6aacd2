use {
    ninep::{errno::*, fcall::*, user::Users, *},
    std::{
        fs::Metadata,
        os::unix::prelude::*,
        path::{Component, Path, PathBuf},
    },
    tokio::fs,
};

#[macro_export]
macro_rules! INVALID_FID {
    () => {
        io_err!(InvalidInput, "Invalid fid")
    };
}

pub async fn get_qid<T: AsRef<Path> + ?Sized>(path: &T) -> ninep::Result<QId> {
    Ok(qid_from_attr(&fs::symlink_metadata(path.as_ref()).await?))
}

pub fn qid_from_attr(attr: &Metadata) -> QId {
    QId {
        typ: From::from(attr.file_type()),
        // Milliseconds are enough for clients to notice a change
        version: (attr.mtime() as u64 * 1000 + attr.mtime_nsec() as u64 / 1_000_000) as u32,
        path: attr.ino(),
    }
}

/// Permission bits of `Stat.mode`, file type bits included
pub fn npmode(attr: &Metadata, dotu: bool) -> u32 {
    let ft = attr.file_type();
    let mut mode = attr.mode() & 0o777;
    if ft.is_dir() {
        mode |= dm::DIR;
    }

    if dotu {
        if ft.is_symlink() {
            mode |= dm::SYMLINK;
        }
        if ft.is_socket() {
            mode |= dm::SOCKET;
        }
        if ft.is_fifo() {
            mode |= dm::NAMEDPIPE;
        }
        if ft.is_block_device() || ft.is_char_device() {
            mode |= dm::DEVICE;
        }
        if attr.mode() & 0o4000 != 0 {
            mode |= dm::SETUID;
        }
        if attr.mode() & 0o2000 != 0 {
            mode |= dm::SETGID;
        }
    }

    mode
}

/// Host permission bits for a `Stat.mode` or `Tcreate` perm
pub fn unix_mode(mode: u32, dotu: bool) -> u32 {
    let mut ret = mode & 0o777;
    if dotu {
        if mode & dm::SETUID != 0 {
            ret |= 0o4000;
        }
        if mode & dm::SETGID != 0 {
            ret |= 0o2000;
        }
    }
    ret
}

/// Read and write access asked for by an open mode
pub fn access(mode: u8) -> (bool, bool) {
    match mode & 3 {
        om::WRITE => (false, true),
        om::RDWR => (true, true),
        _ => (true, false),
    }
}

fn owner(users: &dyn Users, uid: u32) -> String {
    users
        .uid2user(uid)
        .map(|u| u.name)
        .unwrap_or_else(|| uid.to_string())
}

fn group(users: &dyn Users, gid: u32) -> String {
    users
        .gid2group(gid)
        .map(|g| g.name)
        .unwrap_or_else(|| gid.to_string())
}

/// Describe `path` as a 9P stat, names resolved through `users`
pub async fn get_stat(path: &Path, dotu: bool, users: &dyn Users) -> ninep::Result<Stat> {
    let attr = fs::symlink_metadata(path).await?;
    let ft = attr.file_type();

    let extension = if !dotu {
        String::new()
    } else if ft.is_symlink() {
        fs::read_link(path)
            .await
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default()
    } else if ft.is_block_device() || ft.is_char_device() {
        let kind = if ft.is_block_device() { 'b' } else { 'c' };
        let rdev = attr.rdev();
        format!(
            "{} {} {}",
            kind,
            nix::sys::stat::major(rdev),
            nix::sys::stat::minor(rdev)
        )
    } else {
        String::new()
    };

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "/".to_owned());

    Ok(Stat {
        typ: 0,
        dev: 0,
        qid: qid_from_attr(&attr),
        mode: npmode(&attr, dotu),
        atime: attr.atime() as u32,
        mtime: attr.mtime() as u32,
        length: if ft.is_dir() { 0 } else { attr.len() },
        name,
        uid: owner(users, attr.uid()),
        gid: group(users, attr.gid()),
        muid: "none".to_owned(),
        extension,
        n_uid: if dotu { attr.uid() } else { NOUID },
        n_gid: if dotu { attr.gid() } else { NOUID },
        n_muid: NOUID,
    })
}

/// Append the single name `name` to `path` without ever leaving `root`
pub fn join_name(root: &Path, path: &Path, name: &str) -> ninep::Result<PathBuf> {
    let mut comps = Path::new(name).components();
    match (comps.next(), comps.next()) {
        (Some(Component::ParentDir), None) => {
            let mut path = path.to_owned();
            if path != root {
                path.pop();
            }
            Ok(path)
        }
        (Some(Component::CurDir), None) | (None, None) => Ok(path.to_owned()),
        (Some(Component::Normal(n)), None) => Ok(path.join(n)),
        _ => res!(EINVAL),
    }
}

/// Resolve a relative (or root-anchored) slash path under `root`
pub fn join_path(root: &Path, path: &Path, rel: &str) -> ninep::Result<PathBuf> {
    let mut cur = if rel.starts_with('/') {
        root.to_owned()
    } else {
        path.to_owned()
    };
    for name in rel.split('/').filter(|s| !s.is_empty()) {
        cur = join_name(root, &cur, name)?;
    }
    Ok(cur)
}

/// Packed stat records of a directory, as served to one fid
#[derive(Debug, Default)]
pub struct DirSnapshot {
    data: Vec<u8>,
    // Offset just past each record
    ends: Vec<usize>,
}

impl DirSnapshot {
    pub fn push(&mut self, stat: &Stat, dotu: bool) -> ninep::Result<()> {
        self.data.extend(serialize::stat_vec(stat, dotu)?);
        self.ends.push(self.data.len());
        Ok(())
    }

    /// Whole records from `offset` that fit in `count` bytes
    pub fn chunk(&self, offset: u64, count: u32) -> ninep::Result<&[u8]> {
        let start = offset as usize;
        if start >= self.data.len() {
            return Ok(&[]);
        }

        let limit = start.saturating_add(count as usize);
        let fit = self.ends.partition_point(|&e| e <= limit);
        let end = match fit {
            0 => start,
            n => self.ends[n - 1].max(start),
        };
        // The next record alone is larger than the read
        if end == start {
            return res!(EINVAL);
        }
        Ok(&self.data[start..end])
    }
}
