//! 9P error representations.
//!
//! In 9P2000 errors travel as a string, 9P2000.u adds a numeric errno.
//! `Error` carries enough to produce both.

use std::{error as stderror, fmt, io};

use crate::error::errno::*;

/// Error strings sent in `RError` for the errors the server engine detects by itself
pub mod string {
    pub const EUNKNOWNFID: &str = "unknown fid";
    pub const ENOAUTH: &str = "no authentication required";
    pub const EINUSE: &str = "fid already in use";
    pub const EBADUSE: &str = "bad use of fid";
    pub const EOPEN: &str = "fid already opened";
    pub const ENOTDIR: &str = "not a directory";
    pub const EPERM: &str = "permission denied";
    pub const ETOOLARGE: &str = "i/o count too large";
    pub const EBADOFFSET: &str = "bad offset in directory read";
    pub const EDIRCHANGE: &str = "cannot convert between files and directories";
    pub const ENOUSER: &str = "unknown user";
    pub const EMSIZE: &str = "msize too small";
    pub const ENOENT: &str = "file not found";
    pub const ECLOSED: &str = "connection closed";
}

/// Errno, error numbers
pub mod errno {
    pub use nix::errno::Errno::*;
}

/// Malformed bytes on the wire
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Framing {
    /// Destination buffer cannot hold the encoded message
    BufferTooSmall,
    /// Fewer bytes buffered than the message declares; retry with more
    BufferUnderflow,
    /// Declared size is below the minimum for the type, above msize,
    /// or disagrees with the fields
    InvalidMessageSize,
    /// Type byte outside the 9P2000 range, or `TError`
    InvalidMessageType,
    /// A string which is not valid UTF-8
    InvalidString,
    /// A string or list too long for its length prefix
    TooLong,
}

impl Framing {
    fn as_str(&self) -> &'static str {
        match *self {
            Framing::BufferTooSmall => "buffer too small",
            Framing::BufferUnderflow => "buffer underflow",
            Framing::InvalidMessageSize => "invalid message size",
            Framing::InvalidMessageType => "invalid message type",
            Framing::InvalidString => "invalid UTF-8 string",
            Framing::TooLong => "field too long",
        }
    }
}

/// Request-level errors the server engine answers without consulting the backend
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Request {
    UnknownFid,
    NoAuth,
    AlreadyInUse,
    BadUse,
    AlreadyOpen,
    NotADirectory,
    PermissionDenied,
    TooLarge,
    BadOffset,
    DirChange,
    UnknownUser,
    MsizeTooSmall,
}

impl Request {
    pub fn as_str(&self) -> &'static str {
        match *self {
            Request::UnknownFid => string::EUNKNOWNFID,
            Request::NoAuth => string::ENOAUTH,
            Request::AlreadyInUse => string::EINUSE,
            Request::BadUse => string::EBADUSE,
            Request::AlreadyOpen => string::EOPEN,
            Request::NotADirectory => string::ENOTDIR,
            Request::PermissionDenied => string::EPERM,
            Request::TooLarge => string::ETOOLARGE,
            Request::BadOffset => string::EBADOFFSET,
            Request::DirChange => string::EDIRCHANGE,
            Request::UnknownUser => string::ENOUSER,
            Request::MsizeTooSmall => string::EMSIZE,
        }
    }

    pub fn errno(&self) -> nix::errno::Errno {
        match *self {
            Request::NotADirectory => ENOTDIR,
            Request::PermissionDenied => EPERM,
            _ => EINVAL,
        }
    }
}

/// 9P error type which is convertible to an errno.
///
/// The value of `Error::errno()` will be used for the `errno` of `RError`
/// when 9P2000.u is in use, `Error::ename()` for its `ename`.
#[derive(Debug)]
pub enum Error {
    /// System error containing an errno
    No(nix::errno::Errno),
    /// I/O error
    Io(io::Error),
    /// Bytes that do not frame as a 9P message
    Framing(Framing),
    /// The peer broke the protocol: unexpected tag, wrong response type, bad version
    Protocol(String),
    /// `RError` received from the server
    Server { ename: String, ecode: u32 },
    /// Rejected by the server engine before reaching the backend
    Request(Request),
    /// The connection went away while the call was outstanding
    ConnectionClosed,
}

impl Error {
    /// Get an errno representations
    pub fn errno(&self) -> nix::errno::Errno {
        match *self {
            Error::No(ref e) => *e,
            Error::Io(ref e) => errno_from_ioerror(e),
            Error::Framing(_) | Error::Protocol(_) => EPROTO,
            Error::Server { ecode, .. } => nix::errno::Errno::from_raw(ecode as i32),
            Error::Request(ref r) => r.errno(),
            Error::ConnectionClosed => ECONNRESET,
        }
    }

    /// Get the error string sent in `RError`
    pub fn ename(&self) -> String {
        match *self {
            Error::No(ref e) => e.desc().to_owned(),
            Error::Io(ref e) => e.to_string(),
            Error::Framing(ref f) => f.as_str().to_owned(),
            Error::Protocol(ref s) => s.clone(),
            Error::Server { ref ename, .. } => ename.clone(),
            Error::Request(ref r) => r.as_str().to_owned(),
            Error::ConnectionClosed => string::ECLOSED.to_owned(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::No(ref e) => write!(f, "System error: {}", e.desc()),
            Error::Io(ref e) => write!(f, "I/O error: {}", e),
            Error::Framing(ref e) => write!(f, "Framing error: {}", e.as_str()),
            Error::Protocol(ref s) => write!(f, "Protocol error: {}", s),
            Error::Server { ref ename, ecode } => write!(f, "{} ({})", ename, ecode),
            Error::Request(ref r) => write!(f, "{}", r.as_str()),
            Error::ConnectionClosed => write!(f, "{}", string::ECLOSED),
        }
    }
}

impl stderror::Error for Error {
    fn source(&self) -> Option<&(dyn stderror::Error + 'static)> {
        match *self {
            Error::No(ref e) => Some(e),
            Error::Io(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(e: nix::errno::Errno) -> Self {
        Error::No(e)
    }
}

impl From<Framing> for Error {
    fn from(e: Framing) -> Self {
        Error::Framing(e)
    }
}

impl From<Request> for Error {
    fn from(e: Request) -> Self {
        Error::Request(e)
    }
}

fn errno_from_ioerror(e: &io::Error) -> nix::errno::Errno {
    use std::io::ErrorKind::*;

    e.raw_os_error()
        .map(nix::errno::Errno::from_raw)
        .unwrap_or(match e.kind() {
            NotFound => ENOENT,
            PermissionDenied => EPERM,
            ConnectionRefused => ECONNREFUSED,
            ConnectionReset => ECONNRESET,
            ConnectionAborted => ECONNABORTED,
            NotConnected => ENOTCONN,
            AddrInUse => EADDRINUSE,
            AddrNotAvailable => EADDRNOTAVAIL,
            BrokenPipe => EPIPE,
            AlreadyExists => EEXIST,
            WouldBlock => EAGAIN,
            InvalidInput => EINVAL,
            InvalidData => EINVAL,
            TimedOut => ETIMEDOUT,
            WriteZero => EAGAIN,
            Interrupted => EINTR,
            _ => EIO,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_errors_use_plan9_strings() {
        let e = Error::from(Request::BadOffset);
        assert_eq!(e.ename(), "bad offset in directory read");
        assert_eq!(e.errno(), EINVAL);
        assert_eq!(Error::from(Request::NotADirectory).errno(), ENOTDIR);
    }

    #[test]
    fn wire_errors_become_eproto() {
        let e = Error::from(Framing::InvalidMessageSize);
        assert_eq!(e.errno(), EPROTO);
        assert_eq!(e.ename(), "invalid message size");
        assert_eq!(Error::ConnectionClosed.ename(), string::ECLOSED);
    }

    #[test]
    fn io_errors_map_to_errno() {
        let e = Error::from(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert_eq!(e.errno(), ENOENT);
    }
}
