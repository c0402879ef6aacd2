#![forbid(unsafe_code)]
//! Asynchronous 9P2000 and 9P2000.u client and server library for Rust.
//!
//! This crate provides a tokio-based implementation of the Plan 9 file protocol
//! in its original form and with the Unix extensions (numeric ids, errno in
//! errors, special files). Both ends of a connection are covered: a server
//! engine that turns any [`srv::Filesystem`] into a 9P service, and a client
//! that multiplexes concurrent calls over one connection.
//!
//! # Serving a file tree
//!
//! 1. Define a type to hold per-fid state (or use `()`)
//! 2. Implement [`srv::Filesystem`]; unimplemented calls answer `EOPNOTSUPP`
//! 3. Serve it with [`srv::srv_async`], or build a [`srv::Srv`] for custom
//!    settings, users and authentication
//!
//! The engine checks fids and arguments before the backend sees a request,
//! keeps track of what each fid points to, and handles `Tversion` and `Tflush`
//! itself.
//!
//! # Using a server
//!
//! ```no_run
//! use ninep::{clnt::Fsys, fcall::om, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let fsys = Fsys::dial("tcp!127.0.0.1!564", "", "glenda").await?;
//!     let mut file = fsys.fopen("/lib/profile", om::READ).await?;
//!     let data = file.readn(8192).await?;
//!     println!("{}", String::from_utf8_lossy(&data));
//!     file.close().await?;
//!     fsys.unmount().await
//! }
//! ```
//!
//! # Transport
//!
//! Any `AsyncRead`/`AsyncWrite` pair carries a connection. Dial strings name
//! the usual ones:
//! - **TCP**: `"tcp!host!port"` (e.g., `"tcp!0.0.0.0!564"`)
//! - **Unix Domain Sockets**: `"unix!path!suffix"` (e.g., `"unix!/tmp/socket!0"`)
//!
//! # Errors
//!
//! Everything returns [`Error`]. Errors from a backend go to the client as
//! `RError` built from [`Error::ename`] and, under 9P2000.u, [`Error::errno`];
//! the client gets them back as [`Error::Server`].
pub mod clnt;
pub mod error;
pub mod fcall;
pub mod pool;
pub mod serialize;
pub mod srv;
pub mod user;
#[macro_use]
pub mod utils;

pub use crate::error::Error;
pub use crate::error::errno;
pub use crate::error::string as errstr;
pub use crate::fcall::*;
pub use crate::utils::Result;
