//! Asynchronous client side 9P library.
//!
//! A `Clnt` multiplexes concurrent calls over one connection: every call takes a
//! tag, is queued for the send task, and waits for the receive task to match the
//! response by tag. `Fid` wraps a fid number the client owns; dropping it clunks
//! it in the background. `Fsys` adds path based helpers on top of an attached
//! root, and `File` keeps an offset for sequential I/O.
//!
//! # Protocol
//! 9P2000/9P2000.u

use {
    crate::{
        error::{Error, Request, errno::*, string},
        fcall::*,
        io_err, pool::Pool,
        res, serialize,
        utils::{self, Result, lock},
    },
    bytes::Bytes,
    futures::sink::SinkExt,
    log::{debug, error, info, warn},
    std::{
        collections::HashMap,
        fmt, mem,
        sync::{
            Arc, Mutex,
            atomic::{AtomicBool, AtomicU32, Ordering},
        },
    },
    tokio::{
        io::{AsyncRead, AsyncWrite, AsyncWriteExt},
        net::{TcpStream, UnixStream},
        sync::{mpsc, oneshot},
    },
    tokio_stream::StreamExt,
    tokio_util::{
        codec::{BytesCodec, FramedRead, FramedWrite},
        sync::CancellationToken,
    },
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ConnState {
    Active,
    Closing,
    Closed,
}

struct Pending {
    ty: MsgType,
    tx: oneshot::Sender<Result<FCall>>,
}

struct State {
    conn: ConnState,
    pending: HashMap<u16, Pending>,
}

struct Inner {
    msize: AtomicU32,
    dotu: AtomicBool,
    tagpool: Pool,
    fidpool: Pool,
    state: Mutex<State>,
    out: mpsc::UnboundedSender<Bytes>,
    done: CancellationToken,
}

impl Inner {
    fn dotu(&self) -> bool {
        self.dotu.load(Ordering::SeqCst)
    }

    /// Hand a response to the call waiting for its tag
    fn complete(&self, msg: Msg) -> Result<()> {
        let Msg { tag, body } = msg;
        let pending = lock(&self.state).pending.remove(&tag);
        let p = pending.ok_or_else(|| Error::Protocol(format!("response to unknown tag {}", tag)))?;
        if tag != NOTAG {
            self.tagpool.put(tag as u32);
        }

        let rtype = MsgType::from(&body);
        if rtype != MsgType::RError && Some(rtype) != p.ty.response() {
            let why = format!("{:?} answered with {:?}", p.ty, rtype);
            let _ = p.tx.send(Err(Error::Protocol(why.clone())));
            return res!(Error::Protocol(why));
        }

        let result = match body {
            FCall::RError { ename, errno } => Err(Error::Server {
                ename,
                ecode: errno,
            }),
            body => Ok(body),
        };
        // The caller may have given up waiting
        let _ = p.tx.send(result);
        Ok(())
    }

    fn shutdown(&self, why: &Error) {
        self.done.cancel();
        let pending = {
            let mut st = lock(&self.state);
            st.conn = ConnState::Closed;
            mem::take(&mut st.pending)
        };

        match why {
            Error::ConnectionClosed => info!("connection closed"),
            e => warn!("connection closed: {}", e),
        }
        for (tag, p) in pending {
            if tag != NOTAG {
                self.tagpool.put(tag as u32);
            }
            let _ = p.tx.send(Err(Error::ConnectionClosed));
        }
    }
}

async fn recv<Reader>(inner: Arc<Inner>, reader: Reader, msize: u32)
where
    Reader: AsyncRead + Send + Unpin,
{
    let mut framedread = FramedRead::new(reader, utils::frame_codec(msize));

    let why = loop {
        let bytes = tokio::select! {
            _ = inner.done.cancelled() => break Error::ConnectionClosed,
            bytes = framedread.next() => bytes,
        };
        let bytes = match bytes {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => break Error::from(e),
            None => break Error::ConnectionClosed,
        };

        let msg = match serialize::unpack(&bytes, inner.dotu()) {
            Ok((msg, _)) => msg,
            Err(e) => break e,
        };
        debug!("\t← {}", msg);

        if let Err(e) = inner.complete(msg) {
            break e;
        }
    };

    inner.shutdown(&why);
}

async fn send<Writer>(
    done: CancellationToken,
    writer: Writer,
    mut outq: mpsc::UnboundedReceiver<Bytes>,
) where
    Writer: AsyncWrite + Send + Unpin,
{
    let mut framedwrite = FramedWrite::new(writer, BytesCodec::new());
    loop {
        tokio::select! {
            _ = done.cancelled() => break,
            bytes = outq.recv() => match bytes {
                Some(bytes) => {
                    if let Err(e) = framedwrite.send(bytes).await {
                        error!("send failed: {}", e);
                        done.cancel();
                        break;
                    }
                }
                None => break,
            },
        }
    }

    // Let the server see the end of the stream
    if let Err(e) = framedwrite.get_mut().shutdown().await {
        debug!("shutdown of the connection failed: {}", e);
    }
}

fn unexpected(rc: FCall) -> Error {
    Error::Protocol(format!("unexpected {:?}", MsgType::from(&rc)))
}

/// A client connection to a 9P server
#[derive(Clone)]
pub struct Clnt {
    inner: Arc<Inner>,
}

impl fmt::Debug for Clnt {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Clnt")
            .field("msize", &self.msize())
            .field("dotu", &self.dotu())
            .finish()
    }
}

impl Clnt {
    /// Start a connection over `reader`/`writer` and negotiate the version.
    ///
    /// The negotiated msize is the smaller of `msize` and the server's, and
    /// 9P2000.u is used when asked for and the server agrees.
    pub async fn connect<Reader, Writer>(
        reader: Reader,
        writer: Writer,
        msize: u32,
        dotu: bool,
    ) -> Result<Clnt>
    where
        Reader: 'static + AsyncRead + Send + Unpin,
        Writer: 'static + AsyncWrite + Send + Unpin,
    {
        if msize < IOHDRSZ {
            return res!(Request::MsizeTooSmall);
        }

        let (out, outq) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            msize: AtomicU32::new(msize),
            dotu: AtomicBool::new(false),
            tagpool: Pool::new(NOTAG as u32),
            fidpool: Pool::new(NOFID),
            state: Mutex::new(State {
                conn: ConnState::Active,
                pending: HashMap::new(),
            }),
            out,
            done: CancellationToken::new(),
        });

        tokio::spawn(recv(inner.clone(), reader, msize));
        tokio::spawn(send(inner.done.clone(), writer, outq));

        let clnt = Clnt { inner };
        if let Err(e) = clnt.version(msize, dotu).await {
            clnt.close();
            return Err(e);
        }
        Ok(clnt)
    }

    /// Connect to `tcp!host!port` or `unix!path!suffix`
    pub async fn dial(addr: &str, msize: u32, dotu: bool) -> Result<Clnt> {
        let (proto, host, port) = utils::parse_proto(addr)
            .ok_or_else(|| io_err!(InvalidInput, "Invalid protocol or address"))?;

        match proto {
            "tcp" => {
                let stream = TcpStream::connect(format!("{}:{}", host, port)).await?;
                let (readhalf, writehalf) = stream.into_split();
                Clnt::connect(readhalf, writehalf, msize, dotu).await
            }
            "unix" => {
                let stream = UnixStream::connect(format!("{}:{}", host, port)).await?;
                let (readhalf, writehalf) = stream.into_split();
                Clnt::connect(readhalf, writehalf, msize, dotu).await
            }
            _ => Err(From::from(io_err!(InvalidInput, "Protocol not supported"))),
        }
    }

    async fn version(&self, msize: u32, dotu: bool) -> Result<()> {
        let tc = FCall::TVersion {
            msize,
            version: if dotu { P92000U } else { P92000 }.to_owned(),
        };

        match self.rpc(tc).await? {
            FCall::RVersion {
                msize: smsize,
                version,
            } => {
                if version != P92000 && version != P92000U {
                    return res!(Error::Protocol(format!(
                        "server speaks '{}', not 9P2000",
                        version
                    )));
                }
                if smsize < IOHDRSZ {
                    return res!(Error::Protocol(format!("server msize {} too small", smsize)));
                }
                let msize = msize.min(smsize);
                let dotu = dotu && version == P92000U;
                self.inner.msize.store(msize, Ordering::SeqCst);
                self.inner.dotu.store(dotu, Ordering::SeqCst);
                info!("version negotiated, msize {} dotu {}", msize, dotu);
                Ok(())
            }
            rc => Err(unexpected(rc)),
        }
    }

    /// Negotiated maximum message size
    pub fn msize(&self) -> u32 {
        self.inner.msize.load(Ordering::SeqCst)
    }

    /// Whether 9P2000.u is in use
    pub fn dotu(&self) -> bool {
        self.inner.dotu()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner.state).conn != ConnState::Active
    }

    /// Close the connection. Calls still waiting fail with `ConnectionClosed`.
    pub fn close(&self) {
        {
            let mut st = lock(&self.inner.state);
            if st.conn == ConnState::Active {
                st.conn = ConnState::Closing;
            }
        }
        self.inner.done.cancel();
    }

    /// Wait until the connection is gone
    pub async fn closed(&self) {
        self.inner.done.cancelled().await
    }

    /// Send `tc` and wait for its response.
    ///
    /// An `RError` comes back as `Error::Server`.
    pub async fn rpc(&self, tc: FCall) -> Result<FCall> {
        let ty = MsgType::from(&tc);
        let mut buf = serialize::pack_vec(&tc, self.dotu())?;
        if buf.len() > self.msize() as usize {
            return res!(EMSGSIZE);
        }

        let tag = if ty == MsgType::TVersion {
            NOTAG
        } else {
            tokio::select! {
                tag = self.inner.tagpool.get() => tag as u16,
                _ = self.inner.done.cancelled() => return res!(Error::ConnectionClosed),
            }
        };
        serialize::set_tag(&mut buf, tag)?;

        let (tx, rx) = oneshot::channel();
        {
            let mut st = lock(&self.inner.state);
            if st.conn != ConnState::Active {
                drop(st);
                if tag != NOTAG {
                    self.inner.tagpool.put(tag as u32);
                }
                return res!(Error::ConnectionClosed);
            }
            st.pending.insert(tag, Pending { ty, tx });
        }

        debug!("\t→ {}", Msg { tag, body: tc });
        // A dead send task has cancelled `done`; the receive task fails the call
        let _ = self.inner.out.send(Bytes::from(buf));

        rx.await.unwrap_or(Err(Error::ConnectionClosed))
    }

    async fn fid_new(&self, user: &str) -> Result<Fid> {
        let fid = tokio::select! {
            fid = self.inner.fidpool.get() => fid,
            _ = self.inner.done.cancelled() => return res!(Error::ConnectionClosed),
        };
        Ok(Fid {
            clnt: self.clone(),
            fid,
            qid: Default::default(),
            iounit: 0,
            mode: None,
            walked: false,
            live: true,
            user: user.to_owned(),
        })
    }

    /// Start authenticating as `user` for `aname`, returning the auth fid
    pub async fn auth(&self, user: &str, aname: &str) -> Result<Fid> {
        let mut afid = self.fid_new(user).await?;
        let tc = FCall::TAuth {
            afid: afid.fid,
            uname: user.to_owned(),
            aname: aname.to_owned(),
            n_uname: NOUID,
        };

        match self.rpc(tc).await? {
            FCall::RAuth { aqid } => {
                afid.qid = aqid;
                afid.walked = true;
                Ok(afid)
            }
            rc => Err(unexpected(rc)),
        }
    }

    /// Attach to the root of `aname` as `user`
    pub async fn attach(&self, afid: Option<&Fid>, user: &str, aname: &str) -> Result<Fid> {
        let mut fid = self.fid_new(user).await?;
        let tc = FCall::TAttach {
            fid: fid.fid,
            afid: afid.map_or(NOFID, |f| f.fid),
            uname: user.to_owned(),
            aname: aname.to_owned(),
            n_uname: NOUID,
        };

        match self.rpc(tc).await? {
            FCall::RAttach { qid } => {
                fid.qid = qid;
                fid.walked = true;
                Ok(fid)
            }
            rc => Err(unexpected(rc)),
        }
    }
}

/// A fid owned by the client.
///
/// The fid number stays reserved for as long as the value lives. Consuming it
/// with `clunk` or `remove` gives it back; dropping it clunks it in the background.
pub struct Fid {
    clnt: Clnt,
    fid: u32,
    qid: QId,
    iounit: u32,
    mode: Option<u8>,
    // Known to the server
    walked: bool,
    // Still owns its number
    live: bool,
    user: String,
}

impl fmt::Debug for Fid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Fid")
            .field("fid", &self.fid)
            .field("qid", &self.qid)
            .field("iounit", &self.iounit)
            .field("mode", &self.mode)
            .finish()
    }
}

impl Drop for Fid {
    fn drop(&mut self) {
        if !self.live {
            return;
        }
        let (clnt, fid) = (self.clnt.clone(), self.fid);
        if !self.walked {
            clnt.inner.fidpool.put(fid);
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    if let Err(e) = clnt.rpc(FCall::TClunk { fid }).await {
                        debug!("background clunk of fid {}: {}", fid, e);
                    }
                    clnt.inner.fidpool.put(fid);
                });
            }
            Err(_) => warn!("fid {} dropped outside a runtime, not clunked", fid),
        }
    }
}

impl Fid {
    pub fn fid(&self) -> u32 {
        self.fid
    }

    pub fn qid(&self) -> QId {
        self.qid
    }

    /// Mode the fid was opened with, if it is open
    pub fn mode(&self) -> Option<u8> {
        self.mode
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn clnt(&self) -> &Clnt {
        &self.clnt
    }

    /// Largest count a single read or write on this fid carries
    pub fn iounit(&self) -> u32 {
        let max = self.clnt.msize().saturating_sub(IOHDRSZ);
        if self.iounit == 0 || self.iounit > max {
            max
        } else {
            self.iounit
        }
    }

    /// Walk `names` from this fid into a new one.
    ///
    /// More than `MAXWELEM` names take several `Twalk`s. Anything short of the
    /// full path is an error, and whatever fid was made on the way is released.
    pub async fn walk<S: AsRef<str>>(&self, names: &[S]) -> Result<Fid> {
        let names: Vec<String> = names.iter().map(|s| s.as_ref().to_owned()).collect();
        let mut newfid = self.clnt.fid_new(&self.user).await?;
        newfid.qid = self.qid;

        let mut chunks: Vec<&[String]> = names.chunks(MAXWELEM).collect();
        if chunks.is_empty() {
            chunks.push(&[]);
        }

        for chunk in chunks {
            let from = if newfid.walked { newfid.fid } else { self.fid };
            let tc = FCall::TWalk {
                fid: from,
                newfid: newfid.fid,
                wnames: chunk.to_vec(),
            };

            let wqids = match self.clnt.rpc(tc).await? {
                FCall::RWalk { wqids } => wqids,
                rc => return Err(unexpected(rc)),
            };
            if wqids.len() != chunk.len() {
                return res!(Error::Server {
                    ename: string::ENOENT.to_owned(),
                    ecode: ENOENT as u32,
                });
            }

            newfid.walked = true;
            if let Some(qid) = wqids.last() {
                newfid.qid = *qid;
            }
        }

        Ok(newfid)
    }

    pub async fn open(&mut self, mode: u8) -> Result<()> {
        match self.clnt.rpc(FCall::TOpen { fid: self.fid, mode }).await? {
            FCall::ROpen { qid, iounit } => {
                self.qid = qid;
                self.iounit = iounit;
                self.mode = Some(mode);
                Ok(())
            }
            rc => Err(unexpected(rc)),
        }
    }

    /// Create `name` in this directory; the fid then refers to the new file, opened.
    pub async fn create(&mut self, name: &str, perm: u32, mode: u8, extension: &str) -> Result<()> {
        let tc = FCall::TCreate {
            fid: self.fid,
            name: name.to_owned(),
            perm,
            mode,
            extension: extension.to_owned(),
        };

        match self.clnt.rpc(tc).await? {
            FCall::RCreate { qid, iounit } => {
                self.qid = qid;
                self.iounit = iounit;
                self.mode = Some(mode);
                Ok(())
            }
            rc => Err(unexpected(rc)),
        }
    }

    /// One `Tread` of at most `iounit` bytes
    pub async fn read(&self, offset: u64, count: u32) -> Result<Vec<u8>> {
        let count = count.min(self.iounit());
        match self.clnt.rpc(FCall::TRead { fid: self.fid, offset, count }).await? {
            FCall::RRead { data } => Ok(data.0),
            rc => Err(unexpected(rc)),
        }
    }

    /// Read until `count` bytes arrived or the server returns nothing
    pub async fn readn(&self, offset: u64, count: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(count);
        while buf.len() < count {
            let want = (count - buf.len()).min(u32::MAX as usize) as u32;
            let data = self.read(offset + buf.len() as u64, want).await?;
            if data.is_empty() {
                break;
            }
            buf.extend_from_slice(&data);
        }
        Ok(buf)
    }

    /// One `Twrite` of at most `iounit` bytes; returns the count the server took
    pub async fn write(&self, offset: u64, data: &[u8]) -> Result<u32> {
        let n = data.len().min(self.iounit() as usize);
        let tc = FCall::TWrite {
            fid: self.fid,
            offset,
            data: Data(data[..n].to_vec()),
        };

        match self.clnt.rpc(tc).await? {
            FCall::RWrite { count } => Ok(count),
            rc => Err(unexpected(rc)),
        }
    }

    /// Write until all of `data` is taken or the server takes nothing
    pub async fn writen(&self, offset: u64, data: &[u8]) -> Result<usize> {
        let mut done = 0;
        while done < data.len() {
            let n = self.write(offset + done as u64, &data[done..]).await?;
            if n == 0 {
                break;
            }
            done += n as usize;
        }
        Ok(done)
    }

    pub async fn stat(&self) -> Result<Stat> {
        match self.clnt.rpc(FCall::TStat { fid: self.fid }).await? {
            FCall::RStat { stat } => Ok(stat),
            rc => Err(unexpected(rc)),
        }
    }

    /// Change the fields of `stat` that are not "don't touch" (see `Stat::dont_touch`)
    pub async fn wstat(&self, stat: &Stat) -> Result<()> {
        let tc = FCall::TWStat {
            fid: self.fid,
            stat: stat.clone(),
        };

        match self.clnt.rpc(tc).await? {
            FCall::RWStat => Ok(()),
            rc => Err(unexpected(rc)),
        }
    }

    /// Release the fid on the server and locally
    pub async fn clunk(mut self) -> Result<()> {
        let rc = self.clnt.rpc(FCall::TClunk { fid: self.fid }).await;
        self.release();
        match rc? {
            FCall::RClunk => Ok(()),
            rc => Err(unexpected(rc)),
        }
    }

    /// Remove the file; the fid is gone whether or not that worked
    pub async fn remove(mut self) -> Result<()> {
        let rc = self.clnt.rpc(FCall::TRemove { fid: self.fid }).await;
        self.release();
        match rc? {
            FCall::RRemove => Ok(()),
            rc => Err(unexpected(rc)),
        }
    }

    fn release(&mut self) {
        self.live = false;
        self.clnt.inner.fidpool.put(self.fid);
    }
}

/// A mounted file tree: a connection plus the fid of its root
#[derive(Debug)]
pub struct Fsys {
    clnt: Clnt,
    root: Fid,
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

impl Fsys {
    /// Connect over `reader`/`writer` and attach to `aname` as `user`
    pub async fn mount<Reader, Writer>(
        reader: Reader,
        writer: Writer,
        aname: &str,
        user: &str,
        msize: u32,
        dotu: bool,
    ) -> Result<Fsys>
    where
        Reader: 'static + AsyncRead + Send + Unpin,
        Writer: 'static + AsyncWrite + Send + Unpin,
    {
        let clnt = Clnt::connect(reader, writer, msize, dotu).await?;
        Fsys::attach(clnt, aname, user).await
    }

    /// Dial `addr` and attach to `aname` as `user`
    pub async fn dial(addr: &str, aname: &str, user: &str) -> Result<Fsys> {
        let clnt = Clnt::dial(addr, MSIZE, true).await?;
        Fsys::attach(clnt, aname, user).await
    }

    async fn attach(clnt: Clnt, aname: &str, user: &str) -> Result<Fsys> {
        match clnt.attach(None, user, aname).await {
            Ok(root) => Ok(Fsys { clnt, root }),
            Err(e) => {
                clnt.close();
                Err(e)
            }
        }
    }

    pub fn clnt(&self) -> &Clnt {
        &self.clnt
    }

    pub fn root(&self) -> &Fid {
        &self.root
    }

    /// Clunk the root and close the connection
    pub async fn unmount(self) -> Result<()> {
        let Fsys { clnt, root } = self;
        let rc = root.clunk().await;
        clnt.close();
        rc
    }

    /// Walk a slash separated path from the root
    pub async fn fwalk(&self, path: &str) -> Result<Fid> {
        self.root.walk(&split_path(path)).await
    }

    pub async fn fopen(&self, path: &str, mode: u8) -> Result<File> {
        let mut fid = self.fwalk(path).await?;
        fid.open(mode).await?;
        Ok(File::new(fid))
    }

    /// Create the last element of `path` in the directory the rest names
    pub async fn fcreate(&self, path: &str, perm: u32, mode: u8) -> Result<File> {
        let mut names = split_path(path);
        let name = names
            .pop()
            .ok_or_else(|| io_err!(InvalidInput, "empty path"))?;
        let mut fid = self.root.walk(&names).await?;
        fid.create(name, perm, mode, "").await?;
        Ok(File::new(fid))
    }

    pub async fn fremove(&self, path: &str) -> Result<()> {
        self.fwalk(path).await?.remove().await
    }

    pub async fn fstat(&self, path: &str) -> Result<Stat> {
        let fid = self.fwalk(path).await?;
        let stat = fid.stat().await;
        fid.clunk().await?;
        stat
    }
}

/// An open fid with a current offset
#[derive(Debug)]
pub struct File {
    fid: Fid,
    offset: u64,
}

impl File {
    pub fn new(fid: Fid) -> File {
        File { fid, offset: 0 }
    }

    pub fn fid(&self) -> &Fid {
        &self.fid
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn seek(&mut self, offset: u64) {
        self.offset = offset;
    }

    pub async fn read(&mut self, count: u32) -> Result<Vec<u8>> {
        let data = self.fid.read(self.offset, count).await?;
        self.offset += data.len() as u64;
        Ok(data)
    }

    pub async fn readn(&mut self, count: usize) -> Result<Vec<u8>> {
        let data = self.fid.readn(self.offset, count).await?;
        self.offset += data.len() as u64;
        Ok(data)
    }

    pub async fn read_at(&self, count: u32, offset: u64) -> Result<Vec<u8>> {
        self.fid.read(offset, count).await
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let n = self.fid.write(self.offset, data).await? as usize;
        self.offset += n as u64;
        Ok(n)
    }

    pub async fn writen(&mut self, data: &[u8]) -> Result<usize> {
        let n = self.fid.writen(self.offset, data).await?;
        self.offset += n as u64;
        Ok(n)
    }

    /// Write at `offset` without moving the file offset
    pub async fn write_at(&self, data: &[u8], offset: u64) -> Result<usize> {
        Ok(self.fid.write(offset, data).await? as usize)
    }

    /// Read the next batch of directory entries; empty at the end
    pub async fn readdir(&mut self) -> Result<Vec<Stat>> {
        let data = self.fid.read(self.offset, self.fid.iounit()).await?;
        let (stats, used) = serialize::unpack_dir(&data, self.fid.clnt.dotu())?;
        if used != data.len() {
            warn!(
                "fid {}: {} bytes of a partial directory entry",
                self.fid.fid,
                data.len() - used
            );
        }
        self.offset += data.len() as u64;
        Ok(stats)
    }

    pub async fn stat(&self) -> Result<Stat> {
        self.fid.stat().await
    }

    pub async fn close(self) -> Result<()> {
        self.fid.clunk().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::{
        io::{DuplexStream, ReadHalf, WriteHalf},
        task::JoinHandle,
    };
    use tokio_util::codec::LengthDelimitedCodec;

    /// Server end driven by hand, one message at a time
    struct Peer {
        rd: FramedRead<ReadHalf<DuplexStream>, LengthDelimitedCodec>,
        wr: WriteHalf<DuplexStream>,
    }

    impl Peer {
        async fn recv(&mut self) -> Msg {
            let bytes = self.rd.next().await.unwrap().unwrap();
            serialize::unpack(&bytes, false).unwrap().0
        }

        async fn send(&mut self, tag: u16, body: FCall) {
            let mut buf = serialize::pack_vec(&body, false).unwrap();
            serialize::set_tag(&mut buf, tag).unwrap();
            self.wr.write_all(&buf).await.unwrap();
        }
    }

    async fn connected() -> (Clnt, Peer) {
        let (client, server) = tokio::io::duplex(8192);
        let (crd, cwr) = tokio::io::split(client);
        let (srd, swr) = tokio::io::split(server);
        let mut peer = Peer {
            rd: FramedRead::new(srd, utils::frame_codec(MSIZE)),
            wr: swr,
        };

        let clnt = tokio::spawn(Clnt::connect(crd, cwr, MSIZE, false));
        let tversion = peer.recv().await;
        assert_eq!(tversion.tag, NOTAG);
        peer.send(
            NOTAG,
            FCall::RVersion {
                msize: MSIZE,
                version: P92000.to_owned(),
            },
        )
        .await;
        (clnt.await.unwrap().unwrap(), peer)
    }

    fn calls(clnt: &Clnt) -> (JoinHandle<Result<FCall>>, JoinHandle<Result<FCall>>) {
        let (c1, c2) = (clnt.clone(), clnt.clone());
        (
            tokio::spawn(async move { c1.rpc(FCall::TStat { fid: 0 }).await }),
            tokio::spawn(async move { c2.rpc(FCall::TClunk { fid: 1 }).await }),
        )
    }

    #[test]
    fn paths_split_on_slashes() {
        assert_eq!(split_path("/usr//glenda/lib/"), vec!["usr", "glenda", "lib"]);
        assert!(split_path("/").is_empty());
        assert_eq!(split_path("a/../b"), vec!["a", "..", "b"]);
    }

    #[tokio::test]
    async fn msize_below_header_is_refused() {
        let (client, _server) = tokio::io::duplex(64);
        let (rd, wr) = tokio::io::split(client);
        match Clnt::connect(rd, wr, IOHDRSZ - 1, false).await {
            Err(Error::Request(Request::MsizeTooSmall)) => {}
            r => panic!("connected with a {} byte msize: {:?}", IOHDRSZ - 1, r.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn response_to_unknown_tag_closes_connection() {
        let (clnt, mut peer) = connected().await;
        let (stat, clunk) = calls(&clnt);
        let a = peer.recv().await;
        let b = peer.recv().await;
        let unused = (0..=u16::MAX).find(|t| *t != a.tag && *t != b.tag).unwrap();

        peer.send(unused, FCall::RClunk).await;

        assert!(matches!(stat.await.unwrap(), Err(Error::ConnectionClosed)));
        assert!(matches!(clunk.await.unwrap(), Err(Error::ConnectionClosed)));
        clnt.closed().await;
        assert!(clnt.is_closed());
        assert!(matches!(
            clnt.rpc(FCall::TClunk { fid: 2 }).await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn response_of_wrong_type_closes_connection() {
        let (clnt, mut peer) = connected().await;
        let (stat, clunk) = calls(&clnt);
        let mut stat_tag = None;
        for _ in 0..2 {
            let msg = peer.recv().await;
            if let FCall::TStat { .. } = msg.body {
                stat_tag = Some(msg.tag);
            }
        }

        peer.send(stat_tag.unwrap(), FCall::RClunk).await;

        assert!(matches!(stat.await.unwrap(), Err(Error::Protocol(_))));
        assert!(matches!(clunk.await.unwrap(), Err(Error::ConnectionClosed)));
        assert!(clnt.is_closed());
    }
}
