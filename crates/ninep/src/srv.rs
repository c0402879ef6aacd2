//! Asynchronous server side 9P library.
//!
//! A `Srv` owns a `Filesystem` and serves any number of connections. Each
//! connection gets a receive task, a send task and a pool of workers (or a
//! task per request). Requests go through three stages: the engine checks the
//! fids and arguments, the backend produces exactly one response, and the
//! engine updates its fid table from that response before it is sent.
//!
//! # Protocol
//! 9P2000/9P2000.u

use {
    crate::{
        error::{Error, Request, errno::*},
        fcall::*,
        io_err, res, serialize,
        user::{Auth, OsUsers, User, Users},
        utils::{self, Result, lock},
    },
    async_trait::async_trait,
    bitflags::bitflags,
    bytes::Bytes,
    futures::sink::SinkExt,
    log::{debug, error, info, trace, warn},
    std::{
        collections::{HashMap, hash_map::Entry},
        mem,
        path::{Path, PathBuf},
        sync::{
            Arc, Mutex,
            atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        },
    },
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::{TcpListener, UnixListener},
        sync::mpsc,
        task::JoinSet,
    },
    tokio_stream::StreamExt,
    tokio_util::codec::{BytesCodec, FramedRead, FramedWrite},
};

#[derive(Copy, Clone, Debug, Default)]
struct FIdState {
    opened: bool,
    omode: u8,
    qtype: QIdType,
    diroffset: u64,
}

/// Represents a fid of clients holding associated `Filesystem::FId`.
pub struct FId<T> {
    /// Raw client side fid.
    fid: u32,

    /// `Filesystem::FId` associated with this fid.
    /// Changing this value affects the continuous callbacks.
    pub aux: T,

    user: User,
    dotu: bool,
    state: Mutex<FIdState>,
    refs: AtomicU32,
    // Whether the fid table holds a reference
    bound: AtomicBool,
    destroyed: AtomicBool,
}

impl<T: Default> FId<T> {
    fn new(fid: u32, user: User, dotu: bool) -> Self {
        FId {
            fid,
            aux: Default::default(),
            user,
            dotu,
            state: Mutex::new(Default::default()),
            refs: AtomicU32::new(1),
            bound: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        }
    }
}

impl<T> FId<T> {
    /// Get the raw fid.
    pub fn fid(&self) -> u32 {
        self.fid
    }

    /// The user this fid was attached (or authenticated) as.
    pub fn user(&self) -> &User {
        &self.user
    }

    /// Whether the fid's connection speaks 9P2000.u, which decides how
    /// directory entries are encoded.
    pub fn dotu(&self) -> bool {
        self.dotu
    }

    /// Type of the file the fid points to, as of its last attach, walk or create.
    pub fn qtype(&self) -> QIdType {
        lock(&self.state).qtype
    }

    pub fn is_open(&self) -> bool {
        lock(&self.state).opened
    }

    /// Mode given to the successful `Topen`/`Tcreate`.
    pub fn omode(&self) -> u8 {
        lock(&self.state).omode
    }

    fn state(&self) -> FIdState {
        *lock(&self.state)
    }
}

/// What the backend may know about the connection a call comes from.
#[derive(Clone, Debug)]
pub struct ConnInfo {
    /// Unique per server process
    pub id: u64,
    /// Remote address, or a description of the transport
    pub peer: String,
    pub msize: u32,
    pub dotu: bool,
}

/// Server settings
#[derive(Clone, Debug)]
pub struct Config {
    /// Largest message size the server accepts; `Tversion` may only narrow it
    pub msize: u32,
    /// Whether 9P2000.u is offered
    pub dotu: bool,
    /// Workers per connection; zero spawns one task per request
    pub nworkers: usize,
    /// Requests queued per connection before the receive task waits
    pub maxpend: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            msize: MSIZE,
            dotu: true,
            nworkers: 1,
            maxpend: 32,
        }
    }
}

/// Filesystem server trait for implementing 9P2000/9P2000.u servers.
///
/// Implementors can represent an error condition by returning an `Err`.
/// Otherwise, they must return the appropriate `FCall` response with required fields.
/// Whatever a handler returns is sent as the only response to the request.
///
/// The engine has already checked the fids and arguments described on each method
/// by the time it is called, and updates the fid (type, opened state, table
/// reference) from a successful response afterwards.
///
/// # Error Handling
/// Return `Err(Error::No(errno))` to send an error to the client. Its description
/// becomes the `ename` of `RError`, and its number the `errno` under 9P2000.u.
///
/// # Example
/// ```no_run
/// use ninep::{error::Error, errno::*, srv::{Filesystem, FId}, fcall::*, Result};
/// use async_trait::async_trait;
///
/// struct Hello;
///
/// #[async_trait]
/// impl Filesystem for Hello {
///     type FId = ();
///
///     async fn rattach(&self, _: &FId<()>, _: Option<&FId<()>>, _: &str) -> Result<FCall> {
///         Ok(FCall::RAttach {
///             qid: QId { typ: QIdType::DIR, version: 0, path: 0 },
///         })
///     }
///
///     async fn rwalk(&self, _: &FId<()>, _: &FId<()>, wnames: &[String]) -> Result<FCall> {
///         if wnames.is_empty() {
///             Ok(FCall::RWalk { wqids: Vec::new() })
///         } else {
///             Err(Error::No(ENOENT))
///         }
///     }
/// }
///
/// #[tokio::main]
/// async fn main() -> Result<()> {
///     ninep::srv::srv_async(Hello, "tcp!127.0.0.1!5640").await
/// }
/// ```
#[async_trait]
pub trait Filesystem: Send + Sync + 'static {
    /// User defined fid type to be associated with a client's fid.
    ///
    /// This type stores per-fid state such as the current path or open file
    /// handle. It is created with `Default` when the fid is, so it needs
    /// interior mutability to be filled in by `rattach`/`rwalk`.
    type FId: Send + Sync + Default + 'static;

    /// Attach to the root of the tree named `aname`.
    ///
    /// `fid` is new and carries the resolved user. `afid` is the auth fid, already
    /// accepted by the server's `Auth`, if the client authenticated.
    ///
    /// # Returns
    /// `FCall::RAttach` with the qid of the root.
    async fn rattach(
        &self,
        _: &FId<Self::FId>,
        _afid: Option<&FId<Self::FId>>,
        _aname: &str,
    ) -> Result<FCall> {
        Err(Error::No(EOPNOTSUPP))
    }

    /// Walk `wnames` from `fid`, leaving the result in `newfid`.
    ///
    /// `fid` is not open and is a directory if `wnames` is not empty. `newfid`
    /// is the same object as `fid` when the client asked to walk in place.
    /// It only becomes a valid fid when every name is walked; a partial walk
    /// releases it.
    ///
    /// # Returns
    /// `FCall::RWalk` with one qid per name walked. Failing on the first
    /// name must be an error instead.
    async fn rwalk(
        &self,
        _: &FId<Self::FId>,
        _newfid: &FId<Self::FId>,
        _wnames: &[String],
    ) -> Result<FCall> {
        Err(Error::No(EOPNOTSUPP))
    }

    /// Open the file `fid` points to.
    ///
    /// `fid` is not open yet, and `mode` is `om::READ` for directories.
    ///
    /// # Returns
    /// `FCall::ROpen` with the qid and an iounit (0 lets the client pick).
    async fn ropen(&self, _: &FId<Self::FId>, _mode: u8) -> Result<FCall> {
        Err(Error::No(EOPNOTSUPP))
    }

    /// Create `name` in the directory `fid` points to, then open it.
    ///
    /// On success `fid` refers to the new file. Special files (symlinks, devices,
    /// pipes, sockets) only come through under 9P2000.u, with `extension`
    /// describing them.
    ///
    /// # Returns
    /// `FCall::RCreate` with the qid of the new file and an iounit.
    async fn rcreate(
        &self,
        _: &FId<Self::FId>,
        _name: &str,
        _perm: u32,
        _mode: u8,
        _extension: &str,
    ) -> Result<FCall> {
        Err(Error::No(EOPNOTSUPP))
    }

    /// Read from an open fid.
    ///
    /// `count` fits in the negotiated msize. For directories `offset` is either
    /// 0 or where the previous read stopped, and the data must be whole stat
    /// records in the fid's dialect (see `FId::dotu` and `serialize::stat_vec`).
    ///
    /// # Returns
    /// `FCall::RRead` with at most `count` bytes.
    async fn rread(&self, _: &FId<Self::FId>, _offset: u64, _count: u32) -> Result<FCall> {
        Err(Error::No(EOPNOTSUPP))
    }

    /// Write to a fid opened for writing.
    ///
    /// # Returns
    /// `FCall::RWrite` containing the number of bytes written.
    async fn rwrite(&self, _: &FId<Self::FId>, _offset: u64, _data: &Data) -> Result<FCall> {
        Err(Error::No(EOPNOTSUPP))
    }

    /// Forget a fid.
    ///
    /// The fid leaves the table whatever this returns.
    async fn rclunk(&self, _: &FId<Self::FId>) -> Result<FCall> {
        Ok(FCall::RClunk)
    }

    /// Remove the file `fid` points to.
    ///
    /// The fid leaves the table whatever this returns.
    async fn rremove(&self, _: &FId<Self::FId>) -> Result<FCall> {
        Err(Error::No(EOPNOTSUPP))
    }

    /// # Returns
    /// `FCall::RStat` describing the file `fid` points to.
    async fn rstat(&self, _: &FId<Self::FId>) -> Result<FCall> {
        Err(Error::No(EOPNOTSUPP))
    }

    /// Change the fields of `stat` that are not "don't touch" values.
    ///
    /// `typ`, `dev` and the qid are already known to be untouched, and a mode
    /// change never turns a file into a directory or back.
    async fn rwstat(&self, _: &FId<Self::FId>, _stat: &Stat) -> Result<FCall> {
        Err(Error::No(EOPNOTSUPP))
    }

    /// A request which already reached the backend has been flushed.
    ///
    /// Its eventual response is dropped. Implementations may use this to
    /// cut a blocking call short.
    async fn rflush(&self, _req: &FCall) {}

    fn conn_opened(&self, _: &ConnInfo) {}

    fn conn_closed(&self, _: &ConnInfo) {}

    /// The last reference to a fid went away. Called exactly once per fid.
    fn fid_destroy(&self, _: &FId<Self::FId>) {}
}

bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    struct Status: u8 {
        const FLUSH     = 0x01;
        const WORK      = 0x02;
        const RESPONDED = 0x04;
        const DONE      = 0x08;
    }
}

#[derive(Copy, Clone)]
enum Slot {
    Fid,
    AFid,
    NewFid,
}

// References a request holds until it is responded to
struct ReqFIds<T> {
    fid: Option<Arc<FId<T>>>,
    afid: Option<Arc<FId<T>>>,
    newfid: Option<Arc<FId<T>>>,
}

impl<T> Default for ReqFIds<T> {
    fn default() -> Self {
        ReqFIds {
            fid: None,
            afid: None,
            newfid: None,
        }
    }
}

impl<T> ReqFIds<T> {
    fn slot(&mut self, slot: Slot) -> &mut Option<Arc<FId<T>>> {
        match slot {
            Slot::Fid => &mut self.fid,
            Slot::AFid => &mut self.afid,
            Slot::NewFid => &mut self.newfid,
        }
    }
}

struct ReqState<T> {
    status: Status,
    flushers: Vec<Arc<Req<T>>>,
    fids: ReqFIds<T>,
}

struct Req<T> {
    tag: u16,
    body: FCall,
    state: Mutex<ReqState<T>>,
}

impl<T> Req<T> {
    fn new(tag: u16, body: FCall) -> Self {
        Req {
            tag,
            body,
            state: Mutex::new(ReqState {
                status: Status::empty(),
                flushers: Vec::new(),
                fids: Default::default(),
            }),
        }
    }
}

static CONN_ID: AtomicU64 = AtomicU64::new(0);

struct Conn<Fs: Filesystem> {
    id: u64,
    peer: String,
    fs: Arc<Fs>,
    users: Arc<dyn Users>,
    auth: Option<Arc<dyn Auth>>,
    max_msize: u32,
    allow_dotu: bool,
    msize: AtomicU32,
    dotu: AtomicBool,
    fids: Mutex<HashMap<u32, Arc<FId<Fs::FId>>>>,
    reqs: Mutex<HashMap<u16, Arc<Req<Fs::FId>>>>,
    out: mpsc::UnboundedSender<Bytes>,
}

fn rerror(e: &Error) -> FCall {
    FCall::RError {
        ename: e.ename(),
        errno: e.errno() as u32,
    }
}

impl<Fs: Filesystem> Conn<Fs> {
    fn msize(&self) -> u32 {
        self.msize.load(Ordering::SeqCst)
    }

    fn dotu(&self) -> bool {
        self.dotu.load(Ordering::SeqCst)
    }

    fn info(&self) -> ConnInfo {
        ConnInfo {
            id: self.id,
            peer: self.peer.clone(),
            msize: self.msize(),
            dotu: self.dotu(),
        }
    }

    fn fid_get(&self, fid: u32) -> Result<Arc<FId<Fs::FId>>> {
        let fids = lock(&self.fids);
        let f = fids.get(&fid).ok_or(Request::UnknownFid)?;
        f.refs.fetch_add(1, Ordering::SeqCst);
        Ok(f.clone())
    }

    fn fid_new(&self, fid: u32, user: User) -> Result<Arc<FId<Fs::FId>>> {
        let mut fids = lock(&self.fids);
        if fid == NOFID || fids.contains_key(&fid) {
            return res!(Request::AlreadyInUse);
        }
        let f = Arc::new(FId::new(fid, user, self.dotu()));
        fids.insert(fid, f.clone());
        trace!("{}: new fid {}", self.peer, fid);
        Ok(f)
    }

    fn fid_decref(&self, f: &Arc<FId<Fs::FId>>) {
        let last = {
            let mut fids = lock(&self.fids);
            let last = f.refs.fetch_sub(1, Ordering::SeqCst) == 1;
            if last && fids.get(&f.fid).is_some_and(|g| Arc::ptr_eq(g, f)) {
                fids.remove(&f.fid);
            }
            last
        };
        if last {
            self.fid_destroy(f);
        }
    }

    fn fid_destroy(&self, f: &FId<Fs::FId>) {
        if !f.destroyed.swap(true, Ordering::SeqCst) {
            trace!("{}: destroy fid {}", self.peer, f.fid);
            self.fs.fid_destroy(f);
        }
    }

    /// Give the table a reference to `f`
    fn bind(&self, f: &Arc<FId<Fs::FId>>) {
        if !f.bound.swap(true, Ordering::SeqCst) {
            f.refs.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Take `f` out of the table and drop the table's reference
    fn unbind(&self, f: &Arc<FId<Fs::FId>>) {
        {
            let mut fids = lock(&self.fids);
            if fids.get(&f.fid).is_some_and(|g| Arc::ptr_eq(g, f)) {
                fids.remove(&f.fid);
            }
        }
        if f.bound.swap(false, Ordering::SeqCst) {
            self.fid_decref(f);
        }
    }

    fn hold(&self, req: &Req<Fs::FId>, slot: Slot, fid: u32) -> Result<Arc<FId<Fs::FId>>> {
        let f = self.fid_get(fid)?;
        *lock(&req.state).fids.slot(slot) = Some(f.clone());
        Ok(f)
    }

    fn hold_new(
        &self,
        req: &Req<Fs::FId>,
        slot: Slot,
        fid: u32,
        user: User,
    ) -> Result<Arc<FId<Fs::FId>>> {
        let f = self.fid_new(fid, user)?;
        *lock(&req.state).fids.slot(slot) = Some(f.clone());
        Ok(f)
    }

    fn user(&self, uname: &str, n_uname: u32) -> Result<User> {
        let user = if uname.is_empty() && n_uname != NOUID {
            self.users.uid2user(n_uname)
        } else {
            self.users.uname2user(uname)
        };
        user.ok_or_else(|| Request::UnknownUser.into())
    }

    fn enqueue(&self, mut msg: Msg) {
        let dotu = self.dotu();
        let msize = self.msize() as usize;

        let mut buf = Vec::new();
        let encoded = serialize::write_msg(&mut buf, &msg, dotu).and_then(|n| {
            if n > msize {
                res!(EMSGSIZE)
            } else {
                Ok(n)
            }
        });
        if let Err(e) = encoded {
            error!("{}: cannot send {}: {}", self.peer, msg, e);
            buf.clear();
            msg.body = rerror(&e);
            if let Err(e) = serialize::write_msg(&mut buf, &msg, dotu) {
                error!("{}: cannot send {}: {}", self.peer, msg, e);
                return;
            }
        }

        debug!("\t→ {}", msg);
        if self.out.send(Bytes::from(buf)).is_err() {
            debug!("{}: connection gone, dropped response to tag {}", self.peer, msg.tag);
        }
    }

    /// Send the one response `req` gets, unless it has been flushed
    fn respond(&self, req: &Arc<Req<Fs::FId>>, result: Result<FCall>) {
        let (flushed, worked, fids) = {
            let mut st = lock(&req.state);
            if st.status.contains(Status::RESPONDED) {
                return;
            }
            st.status.insert(Status::RESPONDED);
            (
                st.status.contains(Status::FLUSH),
                st.status.contains(Status::WORK),
                mem::take(&mut st.fids),
            )
        };

        let result = if !flushed {
            self.post(req, &fids, result)
        } else {
            // The backend may have let go of a fid it was asked to clunk
            if worked {
                self.forget_clunked(req, &fids);
            }
            result
        };
        for f in [fids.fid, fids.afid, fids.newfid].into_iter().flatten() {
            self.fid_decref(&f);
        }

        let flushers = {
            let mut st = lock(&req.state);
            {
                let mut reqs = lock(&self.reqs);
                if reqs.get(&req.tag).is_some_and(|r| Arc::ptr_eq(r, req)) {
                    reqs.remove(&req.tag);
                }
            }
            if !flushed {
                let body = result.unwrap_or_else(|e| rerror(&e));
                self.enqueue(Msg { tag: req.tag, body });
            }
            st.status.insert(Status::DONE);
            mem::take(&mut st.flushers)
        };

        for f in flushers {
            self.respond(&f, Ok(FCall::RFlush));
        }
    }

    fn version(&self, tag: u16, msize: u32, version: &str) -> Option<u32> {
        if msize < IOHDRSZ {
            self.enqueue(Msg {
                tag,
                body: rerror(&Request::MsizeTooSmall.into()),
            });
            return None;
        }

        if !version.starts_with(P92000) {
            self.enqueue(Msg {
                tag,
                body: FCall::RVersion {
                    msize,
                    version: VERSION_UNKNOWN.to_owned(),
                },
            });
            return None;
        }

        // A new session aborts everything of the old one
        self.abort_inflight();
        let fids: Vec<_> = lock(&self.fids).values().cloned().collect();
        for f in fids {
            self.unbind(&f);
        }

        let msize = msize.min(self.max_msize);
        let dotu = self.allow_dotu && version == P92000U;
        self.msize.store(msize, Ordering::SeqCst);
        self.dotu.store(dotu, Ordering::SeqCst);
        info!(
            "{}: version negotiated, msize {} dotu {}",
            self.peer, msize, dotu
        );

        self.enqueue(Msg {
            tag,
            body: FCall::RVersion {
                msize,
                version: if dotu { P92000U } else { P92000 }.to_owned(),
            },
        });
        Some(msize)
    }

    /// Forget every request in flight. None of them reaches the wire; the
    /// backend hears about the ones it is working on through `rflush`.
    fn abort_inflight(&self) {
        let inflight: Vec<_> = lock(&self.reqs).drain().map(|(_, r)| r).collect();
        for r in inflight {
            let started = {
                let mut st = lock(&r.state);
                st.status.insert(Status::FLUSH);
                st.status.contains(Status::WORK) && !st.status.contains(Status::RESPONDED)
            };
            if started {
                let fs = self.fs.clone();
                tokio::spawn(async move { fs.rflush(&r.body).await });
            }
        }
    }

    fn flush(&self, freq: &Arc<Req<Fs::FId>>, oldtag: u16) {
        let target = lock(&self.reqs).get(&oldtag).cloned();
        let target = match target {
            Some(t) if !Arc::ptr_eq(&t, freq) => t,
            _ => return self.respond(freq, Ok(FCall::RFlush)),
        };

        let started = {
            let mut st = lock(&target.state);
            if st.status.contains(Status::DONE) {
                None
            } else {
                st.status.insert(Status::FLUSH);
                st.flushers.push(freq.clone());
                Some(st.status.intersects(Status::WORK | Status::RESPONDED))
            }
        };

        match started {
            None => self.respond(freq, Ok(FCall::RFlush)),
            Some(false) => self.respond(&target, Err(Error::No(EINTR))),
            Some(true) => {
                let fs = self.fs.clone();
                tokio::spawn(async move { fs.rflush(&target.body).await });
            }
        }
    }

    async fn process(self: Arc<Self>, req: Arc<Req<Fs::FId>>) {
        let flushed = {
            let mut st = lock(&req.state);
            if !st.status.contains(Status::FLUSH) {
                st.status.insert(Status::WORK);
            }
            st.status.contains(Status::FLUSH)
        };
        // Flushed while queued: answer without bothering the backend
        let result = if flushed {
            Err(Error::No(EINTR))
        } else {
            self.dispatch(&req).await
        };
        self.respond(&req, result);
    }

    async fn dispatch(&self, req: &Req<Fs::FId>) -> Result<FCall> {
        use crate::FCall::*;

        let fs = &self.fs;
        match req.body {
            TAuth {
                afid,
                ref uname,
                ref aname,
                n_uname,
            } => {
                let auth = self.auth.as_ref().ok_or(Request::NoAuth)?;
                if afid == NOFID {
                    return res!(Request::UnknownFid);
                }
                let user = self.user(uname, n_uname)?;
                let af = self.hold_new(req, Slot::NewFid, afid, user)?;
                lock(&af.state).qtype = QIdType::AUTH;
                let aqid = auth.init(afid, af.user(), aname).await?;
                Ok(RAuth { aqid })
            }

            TAttach {
                fid,
                afid,
                ref uname,
                ref aname,
                n_uname,
            } => {
                let user = self.user(uname, n_uname)?;
                let f = self.hold_new(req, Slot::NewFid, fid, user)?;
                let af = if afid != NOFID {
                    Some(self.hold(req, Slot::AFid, afid)?)
                } else {
                    None
                };
                match (self.auth.as_ref(), af.as_ref()) {
                    (Some(auth), af) => auth.check(af.map(|a| a.fid), f.user(), aname).await?,
                    (None, Some(_)) => return res!(Request::NoAuth),
                    (None, None) => {}
                }
                fs.rattach(&f, af.as_deref(), aname).await
            }

            TWalk {
                fid,
                newfid,
                ref wnames,
            } => {
                let f = self.hold(req, Slot::Fid, fid)?;
                let st = f.state();
                if !wnames.is_empty() && !st.qtype.contains(QIdType::DIR) {
                    return res!(Request::NotADirectory);
                }
                if st.opened {
                    return res!(Request::BadUse);
                }
                let nf = if newfid == fid {
                    self.hold(req, Slot::NewFid, fid)?
                } else {
                    self.hold_new(req, Slot::NewFid, newfid, f.user().clone())?
                };
                fs.rwalk(&f, &nf, wnames).await
            }

            TOpen { fid, mode } => {
                let f = self.hold(req, Slot::Fid, fid)?;
                let st = f.state();
                if st.opened {
                    return res!(Request::AlreadyOpen);
                }
                if st.qtype.contains(QIdType::DIR) && mode != om::READ {
                    return res!(Request::PermissionDenied);
                }
                fs.ropen(&f, mode).await
            }

            TCreate {
                fid,
                ref name,
                perm,
                mode,
                ref extension,
            } => {
                let f = self.hold(req, Slot::Fid, fid)?;
                let st = f.state();
                if st.opened {
                    return res!(Request::AlreadyOpen);
                }
                if !st.qtype.contains(QIdType::DIR) {
                    return res!(Request::NotADirectory);
                }
                if perm & dm::DIR != 0 && mode != om::READ {
                    return res!(Request::PermissionDenied);
                }
                if perm & dm::SPECIAL != 0 && !self.dotu() {
                    return res!(Request::PermissionDenied);
                }
                fs.rcreate(&f, name, perm, mode, extension).await
            }

            TRead { fid, offset, count } => {
                let f = self.hold(req, Slot::Fid, fid)?;
                if count as u64 + IOHDRSZ as u64 > self.msize() as u64 {
                    return res!(Request::TooLarge);
                }
                let st = f.state();
                if st.qtype.contains(QIdType::AUTH) {
                    let auth = self.auth.as_ref().ok_or(Request::NoAuth)?;
                    let data = auth.read(fid, offset, count).await?;
                    return Ok(RRead { data: Data(data) });
                }
                if !st.opened || st.omode & 3 == om::WRITE {
                    return res!(Request::BadUse);
                }
                if st.qtype.contains(QIdType::DIR) && offset != 0 && offset != st.diroffset {
                    return res!(Request::BadOffset);
                }
                fs.rread(&f, offset, count).await
            }

            TWrite {
                fid,
                offset,
                ref data,
            } => {
                let f = self.hold(req, Slot::Fid, fid)?;
                if data.0.len() as u64 + IOHDRSZ as u64 > self.msize() as u64 {
                    return res!(Request::TooLarge);
                }
                let st = f.state();
                if st.qtype.contains(QIdType::AUTH) {
                    let auth = self.auth.as_ref().ok_or(Request::NoAuth)?;
                    let count = auth.write(fid, offset, &data.0).await?;
                    return Ok(RWrite { count });
                }
                let writable = matches!(st.omode & 3, om::WRITE | om::RDWR);
                if !st.opened || st.qtype.contains(QIdType::DIR) || !writable {
                    return res!(Request::BadUse);
                }
                fs.rwrite(&f, offset, data).await
            }

            TClunk { fid } => {
                let f = self.hold(req, Slot::Fid, fid)?;
                if f.qtype().contains(QIdType::AUTH) {
                    if let Some(auth) = self.auth.as_ref() {
                        auth.destroy(fid);
                    }
                    return Ok(RClunk);
                }
                fs.rclunk(&f).await
            }

            TRemove { fid } => {
                let f = self.hold(req, Slot::Fid, fid)?;
                fs.rremove(&f).await
            }

            TStat { fid } => {
                let f = self.hold(req, Slot::Fid, fid)?;
                fs.rstat(&f).await
            }

            TWStat { fid, ref stat } => {
                let f = self.hold(req, Slot::Fid, fid)?;
                let keep = Stat::dont_touch();
                if stat.typ != keep.typ
                    || stat.dev != keep.dev
                    || stat.qid.version != keep.qid.version
                    || stat.qid.path != keep.qid.path
                {
                    return res!(Request::PermissionDenied);
                }
                let isdir = f.qtype().contains(QIdType::DIR);
                if stat.mode != keep.mode && (stat.mode & dm::DIR != 0) != isdir {
                    return res!(Request::DirChange);
                }
                fs.rwstat(&f, stat).await
            }

            ref body => res!(Error::Protocol(format!(
                "unexpected {:?} at dispatch",
                MsgType::from(body)
            ))),
        }
    }

    /// Bring the fid table up to date with the outcome of a request
    /// A clunked or removed fid is gone even when the backend failed
    fn forget_clunked(&self, req: &Req<Fs::FId>, fids: &ReqFIds<Fs::FId>) {
        if let (FCall::TClunk { .. } | FCall::TRemove { .. }, Some(f)) = (&req.body, &fids.fid) {
            self.unbind(f);
        }
    }

    fn post(
        &self,
        req: &Req<Fs::FId>,
        fids: &ReqFIds<Fs::FId>,
        result: Result<FCall>,
    ) -> Result<FCall> {
        use crate::FCall::*;

        self.forget_clunked(req, fids);

        let rc = result?;
        if Some(MsgType::from(&rc)) != MsgType::from(&req.body).response() {
            error!(
                "{}: backend answered {:?} with {:?}",
                self.peer,
                MsgType::from(&req.body),
                MsgType::from(&rc)
            );
            return res!(EPROTO);
        }

        match (&req.body, &rc, &fids.fid, &fids.newfid) {
            (TAuth { .. }, RAuth { aqid }, _, Some(af)) => {
                lock(&af.state).qtype = aqid.typ | QIdType::AUTH;
                self.bind(af);
            }
            (TAttach { .. }, RAttach { qid }, _, Some(f)) => {
                lock(&f.state).qtype = qid.typ;
                self.bind(f);
            }
            (TWalk { wnames, .. }, RWalk { wqids }, Some(f), Some(nf)) => {
                if wqids.len() > wnames.len() {
                    error!("{}: walk of {} names gave {} qids", self.peer, wnames.len(), wqids.len());
                    return res!(EPROTO);
                }
                if !wnames.is_empty() && wqids.is_empty() {
                    return res!(ENOENT);
                }
                if wqids.len() == wnames.len() {
                    let qtype = wqids.last().map(|q| q.typ).unwrap_or_else(|| f.qtype());
                    lock(&nf.state).qtype = qtype;
                    self.bind(nf);
                }
            }
            (TOpen { mode, .. }, ROpen { .. }, Some(f), _) => {
                let mut st = lock(&f.state);
                st.opened = true;
                st.omode = *mode;
                st.diroffset = 0;
            }
            (TCreate { mode, .. }, RCreate { qid, .. }, Some(f), _) => {
                let mut st = lock(&f.state);
                st.opened = true;
                st.omode = *mode;
                st.qtype = qid.typ;
                st.diroffset = 0;
            }
            (TRead { offset, .. }, RRead { data }, Some(f), _) => {
                let mut st = lock(&f.state);
                if st.qtype.contains(QIdType::DIR) {
                    st.diroffset = offset + data.0.len() as u64;
                }
            }
            _ => {}
        }

        Ok(rc)
    }
}

/// A 9P server: a filesystem plus the settings and services it is served with
pub struct Srv<Fs> {
    fs: Arc<Fs>,
    config: Config,
    users: Arc<dyn Users>,
    auth: Option<Arc<dyn Auth>>,
}

impl<Fs> Clone for Srv<Fs> {
    fn clone(&self) -> Self {
        Srv {
            fs: self.fs.clone(),
            config: self.config.clone(),
            users: self.users.clone(),
            auth: self.auth.clone(),
        }
    }
}

impl<Fs: Filesystem> Srv<Fs> {
    /// Serve `filesystem` with the default `Config` and the host's users
    pub fn new(filesystem: Fs) -> Self {
        Srv {
            fs: Arc::new(filesystem),
            config: Default::default(),
            users: Arc::new(OsUsers::new()),
            auth: None,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn users(mut self, users: Arc<dyn Users>) -> Self {
        self.users = users;
        self
    }

    pub fn auth(mut self, auth: Arc<dyn Auth>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn filesystem(&self) -> &Arc<Fs> {
        &self.fs
    }

    /// Serve one connection until the client goes away
    ///
    /// Returns an error when the byte stream breaks the protocol; the
    /// connection is torn down either way.
    pub async fn serve_conn<Reader, Writer>(
        &self,
        reader: Reader,
        writer: Writer,
        peer: &str,
    ) -> Result<()>
    where
        Reader: AsyncRead + Send + Unpin,
        Writer: 'static + AsyncWrite + Send + Unpin,
    {
        let (out, mut outq) = mpsc::unbounded_channel::<Bytes>();
        let conn = Arc::new(Conn {
            id: CONN_ID.fetch_add(1, Ordering::SeqCst),
            peer: peer.to_owned(),
            fs: self.fs.clone(),
            users: self.users.clone(),
            auth: self.auth.clone(),
            max_msize: self.config.msize,
            allow_dotu: self.config.dotu,
            msize: AtomicU32::new(self.config.msize),
            dotu: AtomicBool::new(false),
            fids: Mutex::new(HashMap::new()),
            reqs: Mutex::new(HashMap::new()),
            out,
        });

        let sender = {
            let peer = conn.peer.clone();
            tokio::spawn(async move {
                let mut framedwrite = FramedWrite::new(writer, BytesCodec::new());
                while let Some(bytes) = outq.recv().await {
                    if let Err(e) = framedwrite.send(bytes).await {
                        error!("{}: send failed: {}", peer, e);
                        break;
                    }
                }
            })
        };

        let nworkers = self.config.nworkers;
        let (work, queue) = mpsc::channel::<Arc<Req<Fs::FId>>>(self.config.maxpend.max(1));
        let queue = Arc::new(tokio::sync::Mutex::new(queue));
        // Workers, or with `nworkers == 0` one task per request
        let mut tasks = JoinSet::new();
        for _ in 0..nworkers {
            let conn = conn.clone();
            let queue = queue.clone();
            tasks.spawn(async move {
                loop {
                    let req = queue.lock().await.recv().await;
                    match req {
                        Some(req) => conn.clone().process(req).await,
                        None => break,
                    }
                }
            });
        }

        conn.fs.conn_opened(&conn.info());
        info!("{}: connection {} opened", conn.peer, conn.id);

        let mut framedread = FramedRead::new(reader, utils::frame_codec(self.config.msize));

        let result = loop {
            let bytes = match framedread.next().await {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => break Err(Error::from(e)),
                None => break Ok(()),
            };

            let msg = match serialize::unpack(&bytes, conn.dotu()) {
                Ok((msg, _)) => msg,
                Err(e) => break Err(e),
            };
            debug!("\t← {}", msg);

            let Msg { tag, body } = msg;
            if let FCall::TVersion { msize, ref version } = body {
                if let Some(msize) = conn.version(tag, msize, version) {
                    framedread
                        .decoder_mut()
                        .set_max_frame_length(msize as usize);
                }
                continue;
            }
            if !MsgType::from(&body).is_t() {
                break Err(Error::Protocol(format!(
                    "unexpected {:?} from client",
                    MsgType::from(&body)
                )));
            }

            let req = Arc::new(Req::new(tag, body));
            let fresh = match lock(&conn.reqs).entry(tag) {
                Entry::Occupied(_) => false,
                Entry::Vacant(v) => {
                    v.insert(req.clone());
                    true
                }
            };
            if !fresh {
                break Err(Error::Protocol(format!("tag {} already in use", tag)));
            }

            if let FCall::TFlush { oldtag } = req.body {
                conn.flush(&req, oldtag);
            } else if nworkers == 0 {
                while let Some(done) = tasks.try_join_next() {
                    if let Err(e) = done {
                        error!("{}: request task failed: {}", conn.peer, e);
                    }
                }
                tasks.spawn(conn.clone().process(req));
            } else if work.send(req).await.is_err() {
                break Ok(());
            }
        };

        if let Err(ref e) = result {
            warn!("{}: closing connection: {}", conn.peer, e);
        }

        conn.abort_inflight();
        drop(work);
        // Backends must be done with every fid before it is destroyed
        while let Some(done) = tasks.join_next().await {
            if let Err(e) = done {
                error!("{}: request task failed: {}", conn.peer, e);
            }
        }

        conn.fs.conn_closed(&conn.info());
        let fids: Vec<_> = lock(&conn.fids).drain().map(|(_, f)| f).collect();
        for f in fids {
            conn.fid_destroy(&f);
        }
        info!("{}: connection {} closed", conn.peer, conn.id);

        drop(conn);
        if let Err(e) = sender.await {
            error!("send task failed: {}", e);
        }

        result
    }

    /// Listen on `addr` (`tcp!host!port` or `unix!path!suffix`) and serve
    /// every connection accepted
    pub async fn listen(self, addr: &str) -> Result<()> {
        let (proto, listen_addr, port) = utils::parse_proto(addr)
            .ok_or_else(|| io_err!(InvalidInput, "Invalid protocol or address"))?;

        match proto {
            "tcp" => srv_async_tcp(self, &format!("{}:{}", listen_addr, port)).await,
            "unix" => srv_async_unix(self, format!("{}:{}", listen_addr, port)).await,
            _ => Err(From::from(io_err!(InvalidInput, "Protocol not supported"))),
        }
    }
}

async fn srv_async_tcp<Fs: Filesystem>(srv: Srv<Fs>, addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("listening on tcp {}", addr);

    loop {
        let (stream, peer) = listener.accept().await?;
        info!("accepted: {:?}", peer);

        let srv = srv.clone();
        tokio::spawn(async move {
            let (readhalf, writehalf) = stream.into_split();
            let res = srv.serve_conn(readhalf, writehalf, &peer.to_string()).await;
            if let Err(e) = res {
                error!("Error: {}: {:?}", e, e);
            }
        });
    }
}

struct DeleteOnDrop {
    path: PathBuf,
    listener: UnixListener,
}

impl DeleteOnDrop {
    fn bind(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_owned();
        UnixListener::bind(&path).map(|listener| DeleteOnDrop { path, listener })
    }
}

impl std::ops::Deref for DeleteOnDrop {
    type Target = UnixListener;

    fn deref(&self) -> &Self::Target {
        &self.listener
    }
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove socket file {:?}: {}", self.path, e);
        }
    }
}

/// Serve on a unix domain socket until SIGTERM or SIGINT
pub async fn srv_async_unix<Fs: Filesystem>(srv: Srv<Fs>, addr: impl AsRef<Path>) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let listener = DeleteOnDrop::bind(addr)?;
    info!("listening on unix {:?}", listener.path);

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, _) = result?;
                let peer = format!("unix:{}", listener.path.display());
                info!("accepted: {}", peer);

                let srv = srv.clone();
                tokio::spawn(async move {
                    let (readhalf, writehalf) = tokio::io::split(stream);
                    let res = srv.serve_conn(readhalf, writehalf, &peer).await;
                    if let Err(e) = res {
                        error!("Error: {:?}", e);
                    }
                });
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully");
                break;
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully");
                break;
            }
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Serve `filesystem` on `addr` with the default settings
pub async fn srv_async<Fs: Filesystem>(filesystem: Fs, addr: &str) -> Result<()> {
    Srv::new(filesystem).listen(addr).await
}
