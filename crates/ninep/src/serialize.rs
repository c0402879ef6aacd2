//! Serialize/deserialize 9P messages into/from binary.
//!
//! Every `Encodable`/`Decodable` takes the dialect flag `dotu`: when it is set
//! the 9P2000.u fields are put on (or expected from) the wire.

use crate::{
    error::{Error, Framing},
    fcall::*,
    io_err, res,
    utils::Result,
};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use num_traits::FromPrimitive;
use std::io::{self, Cursor, Read};
use std::mem;
use std::ops::Shl;

macro_rules! decode {
    ($decoder:expr, $dotu:expr) => {
        Decodable::decode(&mut $decoder, $dotu)?
    };

    ($typ:ident, $buf:expr, $dotu:expr) => {
        $typ::from_bits_retain(decode!($buf, $dotu))
    };
}

fn read_exact<R: Read + ?Sized>(r: &mut R, size: usize) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(size.min(64 * 1024));
    r.take(size as u64).read_to_end(&mut buf)?;
    if buf.len() != size {
        return res!(io_err!(UnexpectedEof, "short field"));
    }
    Ok(buf)
}

/// A serializing specific result to overload operators on `Result`
///
/// # Overloaded operators
/// <<, ?
pub struct SResult<T>(::std::io::Result<T>);

/// A wrapper class of WriteBytesExt to provide operator overloads
/// for serializing
///
/// Operator '<<' serializes the right hand side argument into
/// the left hand side encoder
#[derive(Clone, Debug)]
pub struct Encoder<W> {
    writer: W,
    bytes: usize,
    dotu: bool,
}

impl<W: WriteBytesExt> Encoder<W> {
    pub fn new(writer: W, dotu: bool) -> Encoder<W> {
        Encoder {
            writer,
            bytes: 0,
            dotu,
        }
    }

    /// Return total bytes written
    pub fn bytes_written(&self) -> usize {
        self.bytes
    }

    /// Encode data, equivalent to: encoder << data
    pub fn encode<T: Encodable>(&mut self, data: &T) -> io::Result<usize> {
        let bytes = data.encode(&mut self.writer, self.dotu)?;
        self.bytes += bytes;
        Ok(bytes)
    }

    /// Get inner writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for Encoder<W> {
    type Output = SResult<Encoder<W>>;
    fn shl(mut self, rhs: &'a T) -> Self::Output {
        match self.encode(rhs) {
            Ok(_) => SResult(Ok(self)),
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for SResult<Encoder<W>> {
    type Output = Self;
    fn shl(self, rhs: &'a T) -> Self::Output {
        match self.0 {
            Ok(mut encoder) => match encoder.encode(rhs) {
                Ok(_) => SResult(Ok(encoder)),
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<T: WriteBytesExt> SResult<Encoder<T>> {
    fn written(self) -> io::Result<usize> {
        self.0.map(|enc| enc.bytes_written())
    }
}

/// Trait representing a type which can be serialized into binary
pub trait Encodable {
    /// Encode self to w and returns the number of bytes encoded
    fn encode<W: WriteBytesExt>(&self, w: &mut W, dotu: bool) -> io::Result<usize>;

    /// Number of bytes `encode` would write
    fn encoded_size(&self, dotu: bool) -> io::Result<usize> {
        self.encode(&mut io::sink(), dotu)
    }
}

impl Encodable for u8 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W, _: bool) -> io::Result<usize> {
        w.write_u8(*self).and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u16 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W, _: bool) -> io::Result<usize> {
        w.write_u16::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W, _: bool) -> io::Result<usize> {
        w.write_u32::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u64 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W, _: bool) -> io::Result<usize> {
        w.write_u64::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for String {
    fn encode<W: WriteBytesExt>(&self, w: &mut W, dotu: bool) -> io::Result<usize> {
        let len = u16::try_from(self.len()).map_err(|_| io_err!(InvalidInput, "string too long"))?;
        let mut bytes = len.encode(w, dotu)?;
        bytes += w.write_all(self.as_bytes()).and(Ok(self.len()))?;
        Ok(bytes)
    }
}

impl Encodable for QId {
    fn encode<W: WriteBytesExt>(&self, w: &mut W, dotu: bool) -> io::Result<usize> {
        (Encoder::new(w, dotu) << &self.typ.bits() << &self.version << &self.path).written()
    }
}

/// The `nstat` field in front of a stat in `Rstat` and `Twstat`
fn stat_len(stat: &Stat, dotu: bool) -> io::Result<u16> {
    u16::try_from(stat.size(dotu)).map_err(|_| io_err!(InvalidInput, "stat too long"))
}

impl Encodable for Stat {
    fn encode<W: WriteBytesExt>(&self, w: &mut W, dotu: bool) -> io::Result<usize> {
        // The leading size field does not count itself
        let size = u16::try_from(self.size(dotu) - 2)
            .map_err(|_| io_err!(InvalidInput, "stat too long"))?;
        let buf = Encoder::new(w, dotu)
            << &size
            << &self.typ
            << &self.dev
            << &self.qid
            << &self.mode
            << &self.atime
            << &self.mtime
            << &self.length
            << &self.name
            << &self.uid
            << &self.gid
            << &self.muid;
        let buf = if dotu {
            buf << &self.extension << &self.n_uid << &self.n_gid << &self.n_muid
        } else {
            buf
        };
        buf.written()
    }
}

impl Encodable for Data {
    fn encode<W: WriteBytesExt>(&self, w: &mut W, dotu: bool) -> io::Result<usize> {
        let size = self.0.len();
        let count = u32::try_from(size).map_err(|_| io_err!(InvalidInput, "data too long"))?;
        let bytes = count.encode(w, dotu)? + size;
        w.write_all(&self.0)?;
        Ok(bytes)
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W, dotu: bool) -> io::Result<usize> {
        let len = u16::try_from(self.len()).map_err(|_| io_err!(InvalidInput, "list too long"))?;
        self.iter()
            .fold(Encoder::new(w, dotu) << &len, |acc, s| acc << s)
            .written()
    }
}

impl Encodable for FCall {
    fn encode<W: WriteBytesExt>(&self, w: &mut W, dotu: bool) -> io::Result<usize> {
        use crate::FCall::*;

        let buf = Encoder::new(w, dotu);
        let buf = match *self {
            TVersion {
                ref msize,
                ref version,
            } => buf << msize << version,
            RVersion {
                ref msize,
                ref version,
            } => buf << msize << version,
            TAuth {
                ref afid,
                ref uname,
                ref aname,
                ref n_uname,
            } => {
                let buf = buf << afid << uname << aname;
                if dotu { buf << n_uname } else { buf }
            }
            RAuth { ref aqid } => buf << aqid,
            TAttach {
                ref fid,
                ref afid,
                ref uname,
                ref aname,
                ref n_uname,
            } => {
                let buf = buf << fid << afid << uname << aname;
                if dotu { buf << n_uname } else { buf }
            }
            RAttach { ref qid } => buf << qid,
            RError {
                ref ename,
                ref errno,
            } => {
                let buf = buf << ename;
                if dotu { buf << errno } else { buf }
            }
            TFlush { ref oldtag } => buf << oldtag,
            RFlush => SResult(Ok(buf)),
            TWalk {
                ref fid,
                ref newfid,
                ref wnames,
            } => buf << fid << newfid << wnames,
            RWalk { ref wqids } => buf << wqids,
            TOpen { ref fid, ref mode } => buf << fid << mode,
            ROpen {
                ref qid,
                ref iounit,
            } => buf << qid << iounit,
            TCreate {
                ref fid,
                ref name,
                ref perm,
                ref mode,
                ref extension,
            } => {
                let buf = buf << fid << name << perm << mode;
                if dotu { buf << extension } else { buf }
            }
            RCreate {
                ref qid,
                ref iounit,
            } => buf << qid << iounit,
            TRead {
                ref fid,
                ref offset,
                ref count,
            } => buf << fid << offset << count,
            RRead { ref data } => buf << data,
            TWrite {
                ref fid,
                ref offset,
                ref data,
            } => buf << fid << offset << data,
            RWrite { ref count } => buf << count,
            TClunk { ref fid } => buf << fid,
            RClunk => SResult(Ok(buf)),
            TRemove { ref fid } => buf << fid,
            RRemove => SResult(Ok(buf)),
            TStat { ref fid } => buf << fid,
            RStat { ref stat } => buf << &stat_len(stat, dotu)? << stat,
            TWStat { ref fid, ref stat } => buf << fid << &stat_len(stat, dotu)? << stat,
            RWStat => SResult(Ok(buf)),
        };

        buf.written()
    }
}

impl Encodable for Msg {
    fn encode<W: WriteBytesExt>(&self, w: &mut W, dotu: bool) -> io::Result<usize> {
        let typ = MsgType::from(&self.body);
        let size = u32::try_from(HDRSZ + self.body.encoded_size(dotu)?)
            .map_err(|_| io_err!(InvalidInput, "message too long"))?;

        (Encoder::new(w, dotu) << &size << &(typ as u8) << &self.tag << &self.body).written()
    }
}

/// Trait representing a type which can be deserialized from binary
pub trait Decodable: Sized {
    fn decode<R: ReadBytesExt>(r: &mut R, dotu: bool) -> io::Result<Self>;
}

impl Decodable for u8 {
    fn decode<R: ReadBytesExt>(r: &mut R, _: bool) -> io::Result<Self> {
        r.read_u8()
    }
}

impl Decodable for u16 {
    fn decode<R: ReadBytesExt>(r: &mut R, _: bool) -> io::Result<Self> {
        r.read_u16::<LittleEndian>()
    }
}

impl Decodable for u32 {
    fn decode<R: ReadBytesExt>(r: &mut R, _: bool) -> io::Result<Self> {
        r.read_u32::<LittleEndian>()
    }
}

impl Decodable for u64 {
    fn decode<R: ReadBytesExt>(r: &mut R, _: bool) -> io::Result<Self> {
        r.read_u64::<LittleEndian>()
    }
}

impl Decodable for String {
    fn decode<R: ReadBytesExt>(r: &mut R, dotu: bool) -> io::Result<Self> {
        let len: u16 = Decodable::decode(r, dotu)?;
        String::from_utf8(read_exact(r, len as usize)?)
            .map_err(|_| io_err!(InvalidData, "Invalid UTF-8 sequence"))
    }
}

impl Decodable for QId {
    fn decode<R: ReadBytesExt>(r: &mut R, dotu: bool) -> io::Result<Self> {
        Ok(QId {
            typ: decode!(QIdType, *r, dotu),
            version: Decodable::decode(r, dotu)?,
            path: Decodable::decode(r, dotu)?,
        })
    }
}

impl Decodable for Stat {
    fn decode<R: ReadBytesExt>(r: &mut R, dotu: bool) -> io::Result<Self> {
        let size: u16 = Decodable::decode(r, dotu)?;
        let record = read_exact(r, size as usize)?;
        let mut buf = Cursor::new(&record[..]);

        let mut stat = Stat {
            typ: decode!(buf, dotu),
            dev: decode!(buf, dotu),
            qid: decode!(buf, dotu),
            mode: decode!(buf, dotu),
            atime: decode!(buf, dotu),
            mtime: decode!(buf, dotu),
            length: decode!(buf, dotu),
            name: decode!(buf, dotu),
            uid: decode!(buf, dotu),
            gid: decode!(buf, dotu),
            muid: decode!(buf, dotu),
            ..Default::default()
        };

        // A plain stat sent on a .u connection simply stops after muid
        if dotu && (buf.position() as usize) < record.len() {
            stat.extension = decode!(buf, dotu);
            stat.n_uid = decode!(buf, dotu);
            stat.n_gid = decode!(buf, dotu);
            stat.n_muid = decode!(buf, dotu);
        }

        Ok(stat)
    }
}

impl Decodable for Data {
    fn decode<R: ReadBytesExt>(r: &mut R, dotu: bool) -> io::Result<Self> {
        let len: u32 = Decodable::decode(r, dotu)?;
        Ok(Data(read_exact(r, len as usize)?))
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn decode<R: ReadBytesExt>(r: &mut R, dotu: bool) -> io::Result<Self> {
        let len: u16 = Decodable::decode(r, dotu)?;
        let mut buf = Vec::with_capacity(len as usize);
        for _ in 0..len {
            buf.push(Decodable::decode(r, dotu)?);
        }
        Ok(buf)
    }
}

/// Decode the fields of a message whose header has already been read
fn decode_body<R: ReadBytesExt>(msg_type: MsgType, r: &mut R, dotu: bool) -> io::Result<FCall> {
    use crate::MsgType::*;

    let mut buf = r;

    let body = match msg_type {
        TVersion => FCall::TVersion {
            msize: decode!(buf, dotu),
            version: decode!(buf, dotu),
        },
        RVersion => FCall::RVersion {
            msize: decode!(buf, dotu),
            version: decode!(buf, dotu),
        },
        TAuth => FCall::TAuth {
            afid: decode!(buf, dotu),
            uname: decode!(buf, dotu),
            aname: decode!(buf, dotu),
            n_uname: if dotu { decode!(buf, dotu) } else { NOUID },
        },
        RAuth => FCall::RAuth {
            aqid: decode!(buf, dotu),
        },
        TAttach => FCall::TAttach {
            fid: decode!(buf, dotu),
            afid: decode!(buf, dotu),
            uname: decode!(buf, dotu),
            aname: decode!(buf, dotu),
            n_uname: if dotu { decode!(buf, dotu) } else { NOUID },
        },
        RAttach => FCall::RAttach {
            qid: decode!(buf, dotu),
        },
        RError => FCall::RError {
            ename: decode!(buf, dotu),
            errno: if dotu { decode!(buf, dotu) } else { 0 },
        },
        TFlush => FCall::TFlush {
            oldtag: decode!(buf, dotu),
        },
        RFlush => FCall::RFlush,
        TWalk => FCall::TWalk {
            fid: decode!(buf, dotu),
            newfid: decode!(buf, dotu),
            wnames: decode!(buf, dotu),
        },
        RWalk => FCall::RWalk {
            wqids: decode!(buf, dotu),
        },
        TOpen => FCall::TOpen {
            fid: decode!(buf, dotu),
            mode: decode!(buf, dotu),
        },
        ROpen => FCall::ROpen {
            qid: decode!(buf, dotu),
            iounit: decode!(buf, dotu),
        },
        TCreate => FCall::TCreate {
            fid: decode!(buf, dotu),
            name: decode!(buf, dotu),
            perm: decode!(buf, dotu),
            mode: decode!(buf, dotu),
            extension: if dotu { decode!(buf, dotu) } else { String::new() },
        },
        RCreate => FCall::RCreate {
            qid: decode!(buf, dotu),
            iounit: decode!(buf, dotu),
        },
        TRead => FCall::TRead {
            fid: decode!(buf, dotu),
            offset: decode!(buf, dotu),
            count: decode!(buf, dotu),
        },
        RRead => FCall::RRead {
            data: decode!(buf, dotu),
        },
        TWrite => FCall::TWrite {
            fid: decode!(buf, dotu),
            offset: decode!(buf, dotu),
            data: decode!(buf, dotu),
        },
        RWrite => FCall::RWrite {
            count: decode!(buf, dotu),
        },
        TClunk => FCall::TClunk {
            fid: decode!(buf, dotu),
        },
        RClunk => FCall::RClunk,
        TRemove => FCall::TRemove {
            fid: decode!(buf, dotu),
        },
        RRemove => FCall::RRemove,
        TStat => FCall::TStat {
            fid: decode!(buf, dotu),
        },
        RStat => {
            let _n: u16 = decode!(buf, dotu);
            FCall::RStat {
                stat: decode!(buf, dotu),
            }
        }
        TWStat => {
            let fid = decode!(buf, dotu);
            let _n: u16 = decode!(buf, dotu);
            FCall::TWStat {
                fid,
                stat: decode!(buf, dotu),
            }
        }
        RWStat => FCall::RWStat,
        TError => return res!(io_err!(Other, "Invalid message type")),
    };

    Ok(body)
}

impl Decodable for Msg {
    fn decode<R: ReadBytesExt>(r: &mut R, dotu: bool) -> io::Result<Self> {
        let size: u32 = decode!(*r, dotu);
        let size = (size as usize)
            .checked_sub(4)
            .ok_or_else(|| io_err!(InvalidData, "message size too small"))?;
        let frame = read_exact(r, size)?;
        let mut buf = Cursor::new(&frame[..]);

        let msg_type = MsgType::from_u8(decode!(buf, dotu))
            .ok_or_else(|| io_err!(InvalidData, "Invalid message type"))?;
        let tag = decode!(buf, dotu);
        let body = decode_body(msg_type, &mut buf, dotu)?;
        if buf.position() as usize != frame.len() {
            return res!(io_err!(InvalidData, "trailing bytes after message"));
        }

        Ok(Msg { tag, body })
    }
}

fn framing(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::UnexpectedEof => Error::Framing(Framing::InvalidMessageSize),
        io::ErrorKind::InvalidData => Error::Framing(Framing::InvalidString),
        io::ErrorKind::InvalidInput => Error::Framing(Framing::TooLong),
        io::ErrorKind::WriteZero => Error::Framing(Framing::BufferTooSmall),
        io::ErrorKind::Other => Error::Framing(Framing::InvalidMessageType),
        _ => Error::Io(e),
    }
}

impl Msg {
    /// Exact number of bytes of the encoded message, header included
    pub fn size(&self, dotu: bool) -> Result<usize> {
        Ok(HDRSZ + self.body.encoded_size(dotu).map_err(framing)?)
    }
}

/// Encode `msg` into the front of `buf` and return the number of bytes written
///
/// Fails with `BufferTooSmall` without writing anything when `buf` cannot hold
/// the whole message.
pub fn pack(msg: &Msg, dotu: bool, buf: &mut [u8]) -> Result<usize> {
    let size = msg.size(dotu)?;
    if buf.len() < size {
        return res!(Framing::BufferTooSmall);
    }

    let mut cursor = Cursor::new(&mut buf[..size]);
    msg.encode(&mut cursor, dotu).map_err(framing)
}

/// Encode `body` with the placeholder tag `NOTAG` into a fresh buffer
///
/// The tag is filled in later with `set_tag`.
pub fn pack_vec(body: &FCall, dotu: bool) -> Result<Vec<u8>> {
    let msg = Msg {
        tag: NOTAG,
        body: body.clone(),
    };
    let mut buf = vec![0; msg.size(dotu)?];
    pack(&msg, dotu, &mut buf)?;
    Ok(buf)
}

/// Patch the tag of an already encoded message in place
pub fn set_tag(buf: &mut [u8], tag: u16) -> Result<()> {
    if buf.len() < HDRSZ {
        return res!(Framing::BufferTooSmall);
    }
    LittleEndian::write_u16(&mut buf[5..HDRSZ], tag);
    Ok(())
}

/// Peek the size a buffered message declares, if enough bytes are there to tell
pub fn peek_size(buf: &[u8]) -> Option<usize> {
    if buf.len() < 4 {
        None
    } else {
        Some(LittleEndian::read_u32(&buf[..4]) as usize)
    }
}

/// Decode one message from the front of `buf`
///
/// Returns the message and the number of bytes it occupied. A buffer shorter
/// than the declared size gives `BufferUnderflow`; nothing is consumed and the
/// call can be retried once more bytes have arrived.
pub fn unpack(buf: &[u8], dotu: bool) -> Result<(Msg, usize)> {
    let size = peek_size(buf).ok_or(Framing::BufferUnderflow)?;
    if size < HDRSZ {
        return res!(Framing::InvalidMessageSize);
    }
    if buf.len() < size {
        return res!(Framing::BufferUnderflow);
    }

    let msg_type = match MsgType::from_u8(buf[4]) {
        Some(MsgType::TError) | None => return res!(Framing::InvalidMessageType),
        Some(t) => t,
    };
    if size - HDRSZ < msg_type.min_size(dotu) {
        return res!(Framing::InvalidMessageSize);
    }
    let tag = LittleEndian::read_u16(&buf[5..HDRSZ]);

    let mut body = Cursor::new(&buf[HDRSZ..size]);
    let fcall = decode_body(msg_type, &mut body, dotu).map_err(framing)?;
    if body.position() as usize != size - HDRSZ {
        return res!(Framing::InvalidMessageSize);
    }

    Ok((Msg { tag, body: fcall }, size))
}

/// Encode a single stat record into the front of `buf`
pub fn pack_stat(stat: &Stat, dotu: bool, buf: &mut [u8]) -> Result<usize> {
    let size = stat.size(dotu);
    if buf.len() < size {
        return res!(Framing::BufferTooSmall);
    }

    let mut cursor = Cursor::new(&mut buf[..size]);
    stat.encode(&mut cursor, dotu).map_err(framing)
}

/// Encode a single stat record, as it appears in a directory read
pub fn stat_vec(stat: &Stat, dotu: bool) -> Result<Vec<u8>> {
    let mut buf = vec![0; stat.size(dotu)];
    pack_stat(stat, dotu, &mut buf)?;
    Ok(buf)
}

/// Decode one stat record from the front of `buf`
pub fn unpack_stat(buf: &[u8], dotu: bool) -> Result<(Stat, usize)> {
    if buf.len() < 2 {
        return res!(Framing::BufferUnderflow);
    }
    let size = LittleEndian::read_u16(&buf[..2]) as usize + 2;
    if buf.len() < size {
        return res!(Framing::BufferUnderflow);
    }

    let mut cursor = Cursor::new(&buf[..size]);
    let stat = Stat::decode(&mut cursor, dotu).map_err(framing)?;
    Ok((stat, size))
}

/// Decode the back-to-back stat records returned by a directory read
///
/// Stops at a trailing partial record; the second value tells how many bytes
/// were consumed so the caller can resume from there.
pub fn unpack_dir(buf: &[u8], dotu: bool) -> Result<(Vec<Stat>, usize)> {
    let mut stats = Vec::new();
    let mut pos = 0;

    while pos < buf.len() {
        match unpack_stat(&buf[pos..], dotu) {
            Ok((stat, size)) => {
                stats.push(stat);
                pos += size;
            }
            Err(Error::Framing(Framing::BufferUnderflow)) => break,
            Err(e) => return Err(e),
        }
    }

    Ok((stats, pos))
}

/// Helper function to write a 9P message into a byte-oriented stream
pub fn write_msg<W: WriteBytesExt>(w: &mut W, msg: &Msg, dotu: bool) -> Result<usize> {
    msg.encode(w, dotu).map_err(framing)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qid(path: u64) -> QId {
        QId {
            typ: QIdType::DIR,
            version: 7,
            path,
        }
    }

    fn stat() -> Stat {
        Stat {
            typ: 1,
            dev: 2,
            qid: qid(3),
            mode: dm::DIR | 0o755,
            atime: 10,
            mtime: 11,
            length: 0,
            name: "usr".to_owned(),
            uid: "glenda".to_owned(),
            gid: "sys".to_owned(),
            muid: "glenda".to_owned(),
            extension: String::new(),
            n_uid: 1000,
            n_gid: 100,
            n_muid: 1000,
        }
    }

    fn samples() -> Vec<FCall> {
        vec![
            FCall::TVersion {
                msize: MSIZE,
                version: P92000U.to_owned(),
            },
            FCall::RVersion {
                msize: 4096,
                version: P92000.to_owned(),
            },
            FCall::TAuth {
                afid: 1,
                uname: "glenda".to_owned(),
                aname: String::new(),
                n_uname: 1000,
            },
            FCall::RAuth { aqid: qid(9) },
            FCall::TAttach {
                fid: 0,
                afid: NOFID,
                uname: "glenda".to_owned(),
                aname: "/tmp".to_owned(),
                n_uname: 1000,
            },
            FCall::RAttach { qid: qid(1) },
            FCall::RError {
                ename: "file not found".to_owned(),
                errno: 2,
            },
            FCall::TFlush { oldtag: 5 },
            FCall::RFlush,
            FCall::TWalk {
                fid: 0,
                newfid: 1,
                wnames: vec!["usr".to_owned(), "glenda".to_owned()],
            },
            FCall::RWalk {
                wqids: vec![qid(4), qid(5)],
            },
            FCall::TOpen {
                fid: 1,
                mode: om::RDWR | om::TRUNC,
            },
            FCall::ROpen {
                qid: qid(5),
                iounit: 0,
            },
            FCall::TCreate {
                fid: 1,
                name: "link".to_owned(),
                perm: dm::SYMLINK | 0o777,
                mode: om::READ,
                extension: "/target".to_owned(),
            },
            FCall::RCreate {
                qid: qid(6),
                iounit: 8168,
            },
            FCall::TRead {
                fid: 1,
                offset: 1 << 40,
                count: 8168,
            },
            FCall::RRead {
                data: Data(b"hello".to_vec()),
            },
            FCall::TWrite {
                fid: 1,
                offset: 3,
                data: Data(vec![0; 300]),
            },
            FCall::RWrite { count: 300 },
            FCall::TClunk { fid: 1 },
            FCall::RClunk,
            FCall::TRemove { fid: 1 },
            FCall::RRemove,
            FCall::TStat { fid: 1 },
            FCall::RStat { stat: stat() },
            FCall::TWStat {
                fid: 1,
                stat: Stat::dont_touch(),
            },
            FCall::RWStat,
        ]
    }

    // Fields absent from plain 9P2000 come back with their "not present" values
    fn strip_dotu(body: FCall) -> FCall {
        let plain = |mut st: Stat| {
            st.extension.clear();
            st.n_uid = NOUID;
            st.n_gid = NOUID;
            st.n_muid = NOUID;
            st
        };
        match body {
            FCall::TAuth {
                afid, uname, aname, ..
            } => FCall::TAuth {
                afid,
                uname,
                aname,
                n_uname: NOUID,
            },
            FCall::TAttach {
                fid,
                afid,
                uname,
                aname,
                ..
            } => FCall::TAttach {
                fid,
                afid,
                uname,
                aname,
                n_uname: NOUID,
            },
            FCall::RError { ename, .. } => FCall::RError { ename, errno: 0 },
            FCall::TCreate {
                fid,
                name,
                perm,
                mode,
                ..
            } => FCall::TCreate {
                fid,
                name,
                perm,
                mode,
                extension: String::new(),
            },
            FCall::RStat { stat } => FCall::RStat { stat: plain(stat) },
            FCall::TWStat { fid, stat } => FCall::TWStat {
                fid,
                stat: plain(stat),
            },
            other => other,
        }
    }

    #[test]
    fn encoder_test1() {
        let expected: Vec<u8> = (0..10).collect();
        let mut encoder = Vec::new();
        for i in 0..10 {
            (&(i as u8)).encode(&mut encoder, false).unwrap();
        }
        assert_eq!(expected, encoder);
    }

    #[test]
    fn decoder_test1() {
        let expected: Vec<u8> = (0..10).collect();
        let mut decoder = Cursor::new(expected.clone());
        let mut actual: Vec<u8> = Vec::new();
        while let Ok(i) = Decodable::decode(&mut decoder, false) {
            actual.push(i);
        }
        assert_eq!(expected, actual);
    }

    #[test]
    fn every_kind_survives_both_dialects() {
        for dotu in [false, true] {
            for (i, body) in samples().into_iter().enumerate() {
                let msg = Msg {
                    tag: i as u16,
                    body,
                };
                let mut buf = vec![0; 1024];
                let n = pack(&msg, dotu, &mut buf).unwrap();
                assert_eq!(n, msg.size(dotu).unwrap());

                let (decoded, used) = unpack(&buf[..n], dotu).unwrap();
                assert_eq!(used, n);
                let expected = if dotu {
                    msg.clone()
                } else {
                    Msg {
                        tag: msg.tag,
                        body: strip_dotu(msg.body.clone()),
                    }
                };
                assert_eq!(decoded, expected, "dotu={} {}", dotu, msg);
            }
        }
    }

    #[test]
    fn header_is_little_endian() {
        let msg = Msg {
            tag: 0x0102,
            body: FCall::TClunk { fid: 0x0a0b0c0d },
        };
        let mut buf = [0u8; 11];
        assert_eq!(pack(&msg, false, &mut buf).unwrap(), 11);
        assert_eq!(
            buf,
            [11, 0, 0, 0, 120, 0x02, 0x01, 0x0d, 0x0c, 0x0b, 0x0a]
        );
    }

    #[test]
    fn pack_rejects_small_buffer() {
        let msg = Msg {
            tag: 1,
            body: FCall::RStat { stat: stat() },
        };
        let size = msg.size(true).unwrap();
        let mut buf = vec![0xaa; size - 1];
        match pack(&msg, true, &mut buf) {
            Err(Error::Framing(Framing::BufferTooSmall)) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert!(buf.iter().all(|&b| b == 0xaa));
    }

    #[test]
    fn oversized_stat_is_refused() {
        let mut st = stat();
        st.extension = "x".repeat(70_000);
        for body in [
            FCall::RStat { stat: st.clone() },
            FCall::TWStat {
                fid: 1,
                stat: st.clone(),
            },
        ] {
            match pack_vec(&body, true) {
                Err(Error::Framing(Framing::TooLong)) => {}
                other => panic!("unexpected {:?}", other.map(|b| b.len())),
            }
            // Plain 9P2000 never sends the extension
            assert!(pack_vec(&body, false).is_ok());
        }
    }

    #[test]
    fn short_buffer_underflows_then_retries() {
        let msg = Msg {
            tag: 9,
            body: FCall::TWalk {
                fid: 1,
                newfid: 2,
                wnames: vec!["a".to_owned(), "b".to_owned()],
            },
        };
        let mut bytes = Vec::new();
        write_msg(&mut bytes, &msg, true).unwrap();

        for cut in [0, 3, 4, 7, bytes.len() - 1] {
            match unpack(&bytes[..cut], true) {
                Err(Error::Framing(Framing::BufferUnderflow)) => {}
                other => panic!("cut {}: unexpected {:?}", cut, other),
            }
        }

        // Two messages back to back decode one at a time
        let mut stream = bytes.clone();
        stream.extend_from_slice(&bytes);
        let (first, used) = unpack(&stream, true).unwrap();
        assert_eq!(first, msg);
        let (second, _) = unpack(&stream[used..], true).unwrap();
        assert_eq!(second, msg);
    }

    #[test]
    fn trailing_bytes_are_a_framing_error() {
        let mut bytes = Vec::new();
        write_msg(
            &mut bytes,
            &Msg {
                tag: 1,
                body: FCall::TClunk { fid: 4 },
            },
            false,
        )
        .unwrap();
        bytes.push(0);
        LittleEndian::write_u32(&mut bytes[..4], 12);

        match unpack(&bytes, false) {
            Err(Error::Framing(Framing::InvalidMessageSize)) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn undersized_and_unknown_types_are_rejected() {
        // Tattach needs 16 payload bytes under .u, 12 under 9P2000
        let mut bytes = vec![0u8; HDRSZ + 12];
        LittleEndian::write_u32(&mut bytes[..4], (HDRSZ + 12) as u32);
        bytes[4] = MsgType::TAttach as u8;
        match unpack(&bytes, true) {
            Err(Error::Framing(Framing::InvalidMessageSize)) => {}
            other => panic!("unexpected {:?}", other),
        }

        bytes[4] = MsgType::TError as u8;
        match unpack(&bytes, false) {
            Err(Error::Framing(Framing::InvalidMessageType)) => {}
            other => panic!("unexpected {:?}", other),
        }

        bytes[4] = 99;
        match unpack(&bytes, false) {
            Err(Error::Framing(Framing::InvalidMessageType)) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn set_tag_patches_only_the_tag() {
        let body = FCall::TStat { fid: 42 };
        let mut buf = pack_vec(&body, false).unwrap();
        let before = buf.clone();
        set_tag(&mut buf, 0x1234).unwrap();

        assert_eq!(&buf[..5], &before[..5]);
        assert_eq!(&buf[HDRSZ..], &before[HDRSZ..]);
        let (msg, _) = unpack(&buf, false).unwrap();
        assert_eq!(msg.tag, 0x1234);
        assert_eq!(msg.body, body);
    }

    #[test]
    fn statsz_matches_encoder() {
        let names = ["", "a", "a-much-longer-file-name.txt"];
        for dotu in [false, true] {
            for name in names {
                for ext in names {
                    let mut st = stat();
                    st.name = name.to_owned();
                    st.muid = ext.to_owned();
                    st.extension = ext.to_owned();
                    let mut out = Vec::new();
                    let n = st.encode(&mut out, dotu).unwrap();
                    assert_eq!(n, st.size(dotu));
                    assert_eq!(out.len(), st.size(dotu));
                    assert_eq!(LittleEndian::read_u16(&out[..2]) as usize, n - 2);
                }
            }
        }
    }

    #[test]
    fn pack_stat_rejects_small_buffer() {
        let st = stat();
        let mut buf = vec![0; st.size(true) - 1];
        assert!(matches!(
            pack_stat(&st, true, &mut buf),
            Err(Error::Framing(Framing::BufferTooSmall))
        ));
        let mut buf = vec![0; st.size(true)];
        assert_eq!(pack_stat(&st, true, &mut buf).unwrap(), st.size(true));
        assert_eq!(unpack_stat(&buf, true).unwrap().0, st);
    }

    #[test]
    fn dir_stream_tolerates_partial_tail() {
        let mut a = stat();
        a.name = "a".to_owned();
        let mut b = stat();
        b.name = "bee".to_owned();

        let mut data = stat_vec(&a, true).unwrap();
        let first = data.len();
        data.extend(stat_vec(&b, true).unwrap());

        let (stats, used) = unpack_dir(&data[..data.len() - 5], true).unwrap();
        assert_eq!(stats, vec![a.clone()]);
        assert_eq!(used, first);

        let (stats, used) = unpack_dir(&data, true).unwrap();
        assert_eq!(stats, vec![a, b]);
        assert_eq!(used, data.len());
    }
}
