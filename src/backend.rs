//! Compiler and worker process control.
//!
//! The lifecycle manager never spawns anything itself; it goes through a
//! [`Toolchain`]. The production implementation runs real subprocesses;
//! tests substitute a fake that records calls.

mod process;

pub use process::ProcessToolchain;

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::ContextConfig;
use crate::status::Step;

/// Builds plugins and starts or stops the workers that serve them.
#[async_trait]
pub trait Toolchain: Send + Sync {
    /// Compile `page` into `plugin`.
    ///
    /// Returns needs-action if the compiler executable does not exist.
    async fn compile(&self, page: &Path, plugin: &Path, ctx: &ContextConfig) -> Result<Step>;

    /// Start a worker that loads `plugin` and listens on `socket`.
    ///
    /// The worker is validated with a dry run first; on success a detached
    /// worker is left running. Returns needs-action if the worker executable
    /// does not exist.
    async fn launch(&self, plugin: &Path, socket: &Path, ctx: &ContextConfig) -> Result<Step>;

    /// Make sure process `pid` is gone, killing it once `grace` expires.
    async fn terminate(&self, pid: u32, grace: Duration) -> Result<()>;
}
