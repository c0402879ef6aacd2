use crate::error;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio_util::codec::length_delimited::LengthDelimitedCodec;

pub type Result<T> = ::std::result::Result<T, error::Error>;

#[macro_export]
macro_rules! io_err {
    ($kind:ident, $msg:expr) => {
        ::std::io::Error::new(::std::io::ErrorKind::$kind, $msg)
    };
}

#[macro_export]
macro_rules! res {
    ($err:expr) => {
        Err(From::from($err))
    };
}

/// Split a dial string of the form `proto!addr!port`
pub fn parse_proto(arg: &str) -> Option<(&str, &str, &str)> {
    let mut split = arg.split('!');
    let (proto, addr, port) = (split.next()?, split.next()?, split.next()?);

    Some((proto, addr, port))
}

/// Frames 9P messages by their leading size field.
///
/// The size counts itself, so each frame is the whole message, size field
/// included, as `serialize::unpack` expects it. Messages over `msize` are
/// refused.
pub fn frame_codec(msize: u32) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(0)
        .num_skip(0)
        .max_frame_length(msize as usize)
        .little_endian()
        .new_codec()
}

/// Lock a std mutex, carrying on with the data if a holder panicked
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fcall::*, serialize};
    use bytes::BytesMut;
    use tokio_util::codec::Decoder;

    #[test]
    fn frames_hold_whole_messages() {
        let tversion = serialize::pack_vec(
            &FCall::TVersion {
                msize: 8192,
                version: P92000U.to_owned(),
            },
            true,
        )
        .unwrap();
        let tclunk = serialize::pack_vec(&FCall::TClunk { fid: 3 }, true).unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&tversion);
        buf.extend_from_slice(&tclunk[..5]);

        let mut codec = frame_codec(8192);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], &tversion[..]);
        let (msg, n) = serialize::unpack(&frame, true).unwrap();
        assert_eq!(n, tversion.len());
        assert!(matches!(msg.body, FCall::TVersion { msize: 8192, .. }));

        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&tclunk[5..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], &tclunk[..]);
        assert!(buf.is_empty());
    }

    #[test]
    fn frames_over_msize_are_refused() {
        let twrite = serialize::pack_vec(
            &FCall::TWrite {
                fid: 1,
                offset: 0,
                data: Data(vec![0; 200]),
            },
            false,
        )
        .unwrap();
        let mut buf = BytesMut::from(&twrite[..]);
        assert!(frame_codec(128).decode(&mut buf).is_err());
        assert!(frame_codec(twrite.len() as u32).decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn parse_proto_splits_three_fields() {
        assert_eq!(
            parse_proto("tcp!127.0.0.1!564"),
            Some(("tcp", "127.0.0.1", "564"))
        );
        assert_eq!(
            parse_proto("unix!/tmp/ninep.sock!0"),
            Some(("unix", "/tmp/ninep.sock", "0"))
        );
        assert_eq!(parse_proto("tcp!localhost"), None);
    }
}
