//! gosp-dispatch library
//!
//! Routes HTTP requests for page files to per-page worker processes:
//! - Configuration with nested, inheriting contexts
//! - Socket/plugin path layout under a work directory
//! - Worker protocol over Unix-domain sockets
//! - Compiler and worker process control behind a `Toolchain` trait
//! - A cross-process lock serializing rebuilds
//! - The rebuild/relaunch/retry state machine and the request dispatcher

pub mod backend;
pub mod config;
pub mod dispatch;
pub mod lifecycle;
pub mod lock;
pub mod paths;
pub mod status;
pub mod transport;
