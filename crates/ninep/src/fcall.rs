//! 9P protocol data types and constants.
//!
//! # Protocol
//! 9P2000/9P2000.u

use std::fmt;
use std::mem::size_of;

use bitflags::bitflags;
use enum_primitive::*;

/// 9P2000 version string
pub const P92000: &str = "9P2000";

/// 9P2000.u version string
pub const P92000U: &str = "9P2000.u";

/// The version string that comes with RVersion when the server does not understand
/// the client's version string
pub const VERSION_UNKNOWN: &str = "unknown";

/*
 * 9P magic numbers
 */
/// Special tag which `TVersion`/`RVersion` must use as `tag`
pub const NOTAG: u16 = !0;

/// Special value which `TAttach` with no auth must use as `afid`
///
/// If the client does not wish to authenticate the connection, or knows that authentication is
/// not required, the afid field in the attach message should be set to `NOFID`
pub const NOFID: u32 = !0;

/// Special uid which `TAuth`/`TAttach` use as `n_uname` to indicate no uid is specified
pub const NOUID: u32 = !0;

/// Ample room for `TWrite`/`RRead` header
///
/// size[4] TRead/TWrite[2] tag[2] fid[4] offset[8] count[4]
pub const IOHDRSZ: u32 = 24;

/// Message size used when neither side asks for anything else
pub const MSIZE: u32 = 8192 + IOHDRSZ;

/// Maximum number of names a single `TWalk` may carry
pub const MAXWELEM: usize = 16;

/// size[4] type[1] tag[2]
pub const HDRSZ: usize = 7;

/// The type of I/O
///
/// Open mode to be checked against the permissions for the file.
pub mod om {
    /// Open for read
    pub const READ: u8 = 0;
    /// Write
    pub const WRITE: u8 = 1;
    /// Read and write
    pub const RDWR: u8 = 2;
    /// Execute, == read but check execute permission
    pub const EXEC: u8 = 3;
    /// Or'ed in (except for exec), truncate file first
    pub const TRUNC: u8 = 16;
    /// Or'ed in, close on exec
    pub const CEXEC: u8 = 32;
    /// Or'ed in, remove on close
    pub const RCLOSE: u8 = 64;
}

/// Bits in Stat.mode
pub mod dm {
    /// Mode bit for directories
    pub const DIR: u32 = 0x80000000;
    /// Mode bit for append only files
    pub const APPEND: u32 = 0x40000000;
    /// Mode bit for exclusive use files
    pub const EXCL: u32 = 0x20000000;
    /// Mode bit for mounted channel
    pub const MOUNT: u32 = 0x10000000;
    /// Mode bit for authentication file
    pub const AUTH: u32 = 0x08000000;
    /// Mode bit for non-backed-up files
    pub const TMP: u32 = 0x04000000;
    /// Mode bit for symbolic links (9P2000.u)
    pub const SYMLINK: u32 = 0x02000000;
    /// Mode bit for hard links (9P2000.u)
    pub const LINK: u32 = 0x01000000;
    /// Mode bit for device files (9P2000.u)
    pub const DEVICE: u32 = 0x00800000;
    /// Mode bit for named pipes (9P2000.u)
    pub const NAMEDPIPE: u32 = 0x00200000;
    /// Mode bit for sockets (9P2000.u)
    pub const SOCKET: u32 = 0x00100000;
    /// Mode bit for setuid (9P2000.u)
    pub const SETUID: u32 = 0x00080000;
    /// Mode bit for setgid (9P2000.u)
    pub const SETGID: u32 = 0x00040000;
    /// Mode bit for read permission
    pub const READ: u32 = 0x4;
    /// Mode bit for write permission
    pub const WRITE: u32 = 0x2;
    /// Mode bit for execute permission
    pub const EXEC: u32 = 0x1;

    /// Bits that only make sense when 9P2000.u has been negotiated
    pub const SPECIAL: u32 = SYMLINK | LINK | DEVICE | NAMEDPIPE | SOCKET;
}

bitflags! {
    /// Bits in QId.typ
    ///
    /// # Protocol
    /// 9P2000/9P2000.u
    #[derive(Copy, Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct QIdType: u8 {
        #[doc = "Type bit for directories"]
        const DIR       = 0x80;
        #[doc = "Type bit for append only files"]
        const APPEND    = 0x40;
        #[doc = "Type bit for exclusive use files"]
        const EXCL      = 0x20;
        #[doc = "Type bit for mounted channel"]
        const MOUNT     = 0x10;
        #[doc = "Type bit for authentication file"]
        const AUTH      = 0x08;
        #[doc = "Type bit for not-backed-up file"]
        const TMP       = 0x04;
        #[doc = "Type bits for symbolic links (9P2000.u)"]
        const SYMLINK   = 0x02;
        #[doc = "Type bits for hard-link (9P2000.u)"]
        const LINK      = 0x01;
        #[doc = "Plain file"]
        const FILE      = 0x00;
    }
}

impl From<::std::fs::FileType> for QIdType {
    fn from(typ: ::std::fs::FileType) -> Self {
        From::from(&typ)
    }
}

impl<'a> From<&'a ::std::fs::FileType> for QIdType {
    fn from(typ: &'a ::std::fs::FileType) -> Self {
        let mut qid_type = QIdType::FILE;

        if typ.is_dir() {
            qid_type.insert(QIdType::DIR)
        }

        if typ.is_symlink() {
            qid_type.insert(QIdType::SYMLINK)
        }

        qid_type
    }
}

impl QIdType {
    /// The qid type implied by the high byte of a Stat.mode / TCreate.perm
    pub fn from_mode(mode: u32) -> Self {
        QIdType::from_bits_truncate((mode >> 24) as u8)
    }
}

/// Server side data type for path tracking
///
/// The server's unique identification for the file being accessed
///
/// # Protocol
/// 9P2000/9P2000.u
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QId {
    /// Specify whether the file is a directory, append-only file, etc.
    pub typ: QIdType,
    /// Version number for a file; typically, it is incremented every time the file is modified
    pub version: u32,
    /// An integer which is unique among all files in the hierarchy
    pub path: u64,
}

impl QId {
    pub const SIZE: usize = size_of::<u8>() + size_of::<u32>() + size_of::<u64>();
}

impl fmt::Display for QId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({:x} {} {:#x})", self.path, self.version, self.typ.bits())
    }
}

/// Plan 9 Namespace metadata (somewhat like a unix fstat)
///
/// The last four fields only travel on the wire when 9P2000.u is in use.
/// A stat decoded on a plain 9P2000 connection has `NOUID` in the numeric ids.
///
/// NOTE: Defined as `Dir` in libc.h of Plan 9
///
/// # Protocol
/// 9P2000/9P2000.u
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stat {
    /// Server type
    pub typ: u16,
    /// Server subtype
    pub dev: u32,
    /// Unique id from server
    pub qid: QId,
    /// Permissions
    pub mode: u32,
    /// Last read time
    pub atime: u32,
    /// Last write time
    pub mtime: u32,
    /// File length
    pub length: u64,
    /// Last element of path
    pub name: String,
    /// Owner name
    pub uid: String,
    /// Group name
    pub gid: String,
    /// Last modifier name
    pub muid: String,
    /// Symlink target or device description (9P2000.u)
    pub extension: String,
    /// Numeric owner id (9P2000.u)
    pub n_uid: u32,
    /// Numeric group id (9P2000.u)
    pub n_gid: u32,
    /// Numeric last modifier id (9P2000.u)
    pub n_muid: u32,
}

impl Default for Stat {
    fn default() -> Self {
        Stat {
            typ: 0,
            dev: 0,
            qid: QId::default(),
            mode: 0,
            atime: 0,
            mtime: 0,
            length: 0,
            name: String::new(),
            uid: String::new(),
            gid: String::new(),
            muid: String::new(),
            extension: String::new(),
            n_uid: NOUID,
            n_gid: NOUID,
            n_muid: NOUID,
        }
    }
}

impl Stat {
    /// Bytes taken by the fixed-width part of a 9P2000 stat, its own size field included
    pub const FIXED_SIZE: usize = 2 + 2 + 4 + QId::SIZE + 4 + 4 + 4 + 8 + 4 * 2;

    /// Additional fixed-width bytes of a 9P2000.u stat
    pub const FIXED_SIZE_U: usize = 2 + 4 * 3;

    /// A stat whose every field means "don't touch" in a `TWStat`
    pub fn dont_touch() -> Self {
        Stat {
            typ: !0,
            dev: !0,
            qid: QId {
                typ: QIdType::from_bits_retain(!0),
                version: !0,
                path: !0,
            },
            mode: !0,
            atime: !0,
            mtime: !0,
            length: !0,
            ..Default::default()
        }
    }

    /// Total number of bytes this stat occupies on the wire, its leading size field included
    pub fn size(&self, dotu: bool) -> usize {
        let mut sz = Self::FIXED_SIZE
            + self.name.len()
            + self.uid.len()
            + self.gid.len()
            + self.muid.len();
        if dotu {
            sz += Self::FIXED_SIZE_U + self.extension.len();
        }
        sz
    }
}

/// Data type used in `RRead` and `TWrite`
///
/// # Protocol
/// 9P2000/9P2000.u
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Data(pub Vec<u8>);

impl fmt::Debug for Data {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Data({} bytes)", self.0.len())
    }
}

enum_from_primitive! {
    #[doc = "Message type, 9P operations"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub enum MsgType {
        TVersion        = 100,
        RVersion,
        TAuth           = 102,
        RAuth,
        TAttach         = 104,
        RAttach,
        TError          = 106,  // Illegal, never used
        RError,
        TFlush          = 108,
        RFlush,
        TWalk           = 110,
        RWalk,
        TOpen           = 112,
        ROpen,
        TCreate         = 114,
        RCreate,
        TRead           = 116,
        RRead,
        TWrite          = 118,
        RWrite,
        TClunk          = 120,
        RClunk,
        TRemove         = 122,
        RRemove,
        TStat           = 124,
        RStat,
        TWStat          = 126,
        RWStat,
    }
}

impl MsgType {
    /// If the message type is T-message
    pub fn is_t(&self) -> bool {
        !self.is_r()
    }

    /// If the message type is R-message
    pub fn is_r(&self) -> bool {
        (*self as u8) & 1 == 1
    }

    /// The response type that answers this request type
    pub fn response(&self) -> Option<MsgType> {
        if self.is_t() && *self != MsgType::TError {
            MsgType::from_u8(*self as u8 + 1)
        } else {
            None
        }
    }

    /// Smallest payload (bytes after the 7-byte header) a message of this type can have
    pub fn min_size(&self, dotu: bool) -> usize {
        use crate::MsgType::*;

        let stat = Stat::FIXED_SIZE + if dotu { Stat::FIXED_SIZE_U } else { 0 };
        match (*self, dotu) {
            (TAuth, false) => 8,
            (TAuth, true) => 12,
            (TAttach, false) => 12,
            (TAttach, true) => 16,
            (RError, false) => 2,
            (RError, true) => 6,
            (TCreate, false) => 11,
            (TCreate, true) => 13,
            (TVersion, _) | (RVersion, _) => 6,
            (RAuth, _) | (RAttach, _) => QId::SIZE,
            (TError, _) => 0,
            (TFlush, _) => 2,
            (TWalk, _) => 10,
            (RWalk, _) => 2,
            (TOpen, _) => 5,
            (ROpen, _) | (RCreate, _) => QId::SIZE + 4,
            (TRead, _) | (TWrite, _) => 16,
            (RRead, _) | (RWrite, _) => 4,
            (TClunk, _) | (TRemove, _) | (TStat, _) => 4,
            (RStat, _) => 2 + stat,
            (TWStat, _) => 4 + 2 + stat,
            (RFlush, _) | (RClunk, _) | (RRemove, _) | (RWStat, _) => 0,
        }
    }
}

impl<'a> From<&'a FCall> for MsgType {
    fn from(fcall: &'a FCall) -> MsgType {
        match *fcall {
            FCall::TVersion { .. } => MsgType::TVersion,
            FCall::RVersion { .. } => MsgType::RVersion,
            FCall::TAuth { .. } => MsgType::TAuth,
            FCall::RAuth { .. } => MsgType::RAuth,
            FCall::TAttach { .. } => MsgType::TAttach,
            FCall::RAttach { .. } => MsgType::RAttach,
            FCall::RError { .. } => MsgType::RError,
            FCall::TFlush { .. } => MsgType::TFlush,
            FCall::RFlush => MsgType::RFlush,
            FCall::TWalk { .. } => MsgType::TWalk,
            FCall::RWalk { .. } => MsgType::RWalk,
            FCall::TOpen { .. } => MsgType::TOpen,
            FCall::ROpen { .. } => MsgType::ROpen,
            FCall::TCreate { .. } => MsgType::TCreate,
            FCall::RCreate { .. } => MsgType::RCreate,
            FCall::TRead { .. } => MsgType::TRead,
            FCall::RRead { .. } => MsgType::RRead,
            FCall::TWrite { .. } => MsgType::TWrite,
            FCall::RWrite { .. } => MsgType::RWrite,
            FCall::TClunk { .. } => MsgType::TClunk,
            FCall::RClunk => MsgType::RClunk,
            FCall::TRemove { .. } => MsgType::TRemove,
            FCall::RRemove => MsgType::RRemove,
            FCall::TStat { .. } => MsgType::TStat,
            FCall::RStat { .. } => MsgType::RStat,
            FCall::TWStat { .. } => MsgType::TWStat,
            FCall::RWStat => MsgType::RWStat,
        }
    }
}

/// A data type encapsulating the various 9P messages
///
/// Fields that exist only in 9P2000.u (`n_uname`, `errno`, `extension`) are
/// carried on every value and simply skipped by the codec when the connection
/// speaks plain 9P2000.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FCall {
    TVersion {
        msize: u32,
        version: String,
    },
    RVersion {
        msize: u32,
        version: String,
    },
    TAuth {
        afid: u32,
        uname: String,
        aname: String,
        n_uname: u32,
    },
    RAuth {
        aqid: QId,
    },
    TAttach {
        fid: u32,
        afid: u32,
        uname: String,
        aname: String,
        n_uname: u32,
    },
    RAttach {
        qid: QId,
    },
    RError {
        ename: String,
        errno: u32,
    },
    TFlush {
        oldtag: u16,
    },
    RFlush,
    TWalk {
        fid: u32,
        newfid: u32,
        wnames: Vec<String>,
    },
    RWalk {
        wqids: Vec<QId>,
    },
    TOpen {
        fid: u32,
        mode: u8,
    },
    ROpen {
        qid: QId,
        iounit: u32,
    },
    TCreate {
        fid: u32,
        name: String,
        perm: u32,
        mode: u8,
        extension: String,
    },
    RCreate {
        qid: QId,
        iounit: u32,
    },
    TRead {
        fid: u32,
        offset: u64,
        count: u32,
    },
    RRead {
        data: Data,
    },
    TWrite {
        fid: u32,
        offset: u64,
        data: Data,
    },
    RWrite {
        count: u32,
    },
    TClunk {
        fid: u32,
    },
    RClunk,
    TRemove {
        fid: u32,
    },
    RRemove,
    TStat {
        fid: u32,
    },
    RStat {
        stat: Stat,
    },
    TWStat {
        fid: u32,
        stat: Stat,
    },
    RWStat,
}

/// Envelope for 9P messages
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Msg {
    /// Chosen and used by the client to identify the message.
    /// The reply to the message will have the same tag
    pub tag: u16,
    /// Message body encapsulating the various 9P messages
    pub body: FCall,
}

impl fmt::Display for Stat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "'{}' '{}' '{}' '{}' q {} m {:#o} at {} mt {} l {} t {} d {}",
            self.name,
            self.uid,
            self.gid,
            self.muid,
            self.qid,
            self.mode,
            self.atime,
            self.mtime,
            self.length,
            self.typ,
            self.dev
        )?;
        if !self.extension.is_empty() || self.n_uid != NOUID {
            write!(
                f,
                " ext '{}' uidnum {} gidnum {} muidnum {}",
                self.extension, self.n_uid, self.n_gid, self.n_muid
            )?;
        }
        Ok(())
    }
}

impl fmt::Display for Msg {
    #[rustfmt::skip]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use crate::FCall::*;

        let tag = self.tag;
        match self.body {
            TVersion { msize, ref version }                         => write!(f, "Tversion tag {} msize {} version '{}'", tag, msize, version),
            RVersion { msize, ref version }                         => write!(f, "Rversion tag {} msize {} version '{}'", tag, msize, version),
            TAuth { afid, ref uname, ref aname, n_uname }           => write!(f, "Tauth tag {} afid {} uname '{}' aname '{}' nuname {}", tag, afid, uname, aname, n_uname),
            RAuth { aqid }                                          => write!(f, "Rauth tag {} aqid {}", tag, aqid),
            TAttach { fid, afid, ref uname, ref aname, n_uname }    => write!(f, "Tattach tag {} fid {} afid {} uname '{}' aname '{}' nuname {}", tag, fid, afid, uname, aname, n_uname),
            RAttach { qid }                                         => write!(f, "Rattach tag {} qid {}", tag, qid),
            RError { ref ename, errno }                             => write!(f, "Rerror tag {} ename '{}' ecode {}", tag, ename, errno),
            TFlush { oldtag }                                       => write!(f, "Tflush tag {} oldtag {}", tag, oldtag),
            RFlush                                                  => write!(f, "Rflush tag {}", tag),
            TWalk { fid, newfid, ref wnames }                       => write!(f, "Twalk tag {} fid {} newfid {} {:?}", tag, fid, newfid, wnames),
            RWalk { ref wqids }                                     => write!(f, "Rwalk tag {} nwqid {}", tag, wqids.len()),
            TOpen { fid, mode }                                     => write!(f, "Topen tag {} fid {} mode {:x}", tag, fid, mode),
            ROpen { qid, iounit }                                   => write!(f, "Ropen tag {} qid {} iounit {}", tag, qid, iounit),
            TCreate { fid, ref name, perm, mode, ref extension }    => write!(f, "Tcreate tag {} fid {} name '{}' perm {:#o} mode {:x} ext '{}'", tag, fid, name, perm, mode, extension),
            RCreate { qid, iounit }                                 => write!(f, "Rcreate tag {} qid {} iounit {}", tag, qid, iounit),
            TRead { fid, offset, count }                            => write!(f, "Tread tag {} fid {} offset {} count {}", tag, fid, offset, count),
            RRead { ref data }                                      => write!(f, "Rread tag {} count {}", tag, data.0.len()),
            TWrite { fid, offset, ref data }                        => write!(f, "Twrite tag {} fid {} offset {} count {}", tag, fid, offset, data.0.len()),
            RWrite { count }                                        => write!(f, "Rwrite tag {} count {}", tag, count),
            TClunk { fid }                                          => write!(f, "Tclunk tag {} fid {}", tag, fid),
            RClunk                                                  => write!(f, "Rclunk tag {}", tag),
            TRemove { fid }                                         => write!(f, "Tremove tag {} fid {}", tag, fid),
            RRemove                                                 => write!(f, "Rremove tag {}", tag),
            TStat { fid }                                           => write!(f, "Tstat tag {} fid {}", tag, fid),
            RStat { ref stat }                                      => write!(f, "Rstat tag {} st ({})", tag, stat),
            TWStat { fid, ref stat }                                => write!(f, "Twstat tag {} fid {} st ({})", tag, fid, stat),
            RWStat                                                  => write!(f, "Rwstat tag {}", tag),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_types_pair_with_requests() {
        assert_eq!(MsgType::TWalk.response(), Some(MsgType::RWalk));
        assert_eq!(MsgType::TWStat.response(), Some(MsgType::RWStat));
        assert_eq!(MsgType::TError.response(), None);
        assert_eq!(MsgType::RRead.response(), None);
        assert!(MsgType::RError.is_r());
        assert!(MsgType::TVersion.is_t());
    }

    #[test]
    fn stat_size_counts_strings_and_extension() {
        let st = Stat {
            name: "file".to_owned(),
            uid: "glenda".to_owned(),
            gid: "sys".to_owned(),
            muid: String::new(),
            extension: "b 1 2".to_owned(),
            ..Default::default()
        };
        assert_eq!(st.size(false), 49 + 4 + 6 + 3);
        assert_eq!(st.size(true), 49 + 4 + 6 + 3 + 14 + 5);
    }

    #[test]
    fn qid_type_from_mode_uses_high_byte() {
        assert_eq!(QIdType::from_mode(dm::DIR | 0o755), QIdType::DIR);
        assert_eq!(QIdType::from_mode(dm::SYMLINK), QIdType::SYMLINK);
        assert_eq!(QIdType::from_mode(0o644), QIdType::FILE);
    }

    #[test]
    fn display_uses_trace_form() {
        let msg = Msg {
            tag: 3,
            body: FCall::TRead {
                fid: 1,
                offset: 0,
                count: 8168,
            },
        };
        assert_eq!(msg.to_string(), "Tread tag 3 fid 1 offset 0 count 8168");
    }
}
