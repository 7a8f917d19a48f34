//! Unix-domain socket client for page workers.
//!
//! Every call opens its own connection, performs one request/response
//! exchange, and closes it. A socket nobody is listening on is not an error
//! here: it tells the caller the worker needs to be (re)started.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UnixStream;
use tracing::debug;

use super::protocol::{parse_pid_reply, RequestContext, ResponseEnvelope, ServiceRequest};
use super::{recv_response, send_request};
use crate::config::Timeouts;
use crate::status::{NeedsAction, Step};

/// Client for one worker's socket.
#[derive(Debug, Clone)]
pub struct WorkerSocket {
    path: PathBuf,
    connect_timeout: Duration,
    response_timeout: Duration,
    probe_timeout: Duration,
}

impl WorkerSocket {
    pub fn new(path: impl Into<PathBuf>, timeouts: &Timeouts) -> Self {
        Self {
            path: path.into(),
            connect_timeout: timeouts.connect,
            response_timeout: timeouts.response,
            probe_timeout: timeouts.probe,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Connect to the worker.
    ///
    /// Any failure to connect means no usable worker is listening and is
    /// reported as needs-action.
    pub async fn connect(&self) -> Step<UnixStream> {
        match tokio::time::timeout(self.connect_timeout, UnixStream::connect(&self.path)).await {
            Ok(Ok(stream)) => Step::Ready(stream),
            Ok(Err(e)) => {
                debug!(socket = %self.path.display(), error = %e, "Failed to connect to worker");
                Step::NeedsAction(NeedsAction::SocketUnavailable(self.path.clone()))
            }
            Err(_) => {
                debug!(socket = %self.path.display(), "Timed out connecting to worker");
                Step::NeedsAction(NeedsAction::SocketUnavailable(self.path.clone()))
            }
        }
    }

    /// Connect, send `req`, and collect the raw reply.
    async fn exchange(
        &self,
        req: &ServiceRequest<'_>,
        response_timeout: Duration,
    ) -> Result<Step<Vec<u8>>> {
        let mut stream = match self.connect().await {
            Step::Ready(stream) => stream,
            Step::NeedsAction(why) => return Ok(Step::NeedsAction(why)),
        };

        send_request(&mut stream, req)
            .await
            .with_context(|| format!("Failed to send request to socket {}", self.path.display()))?;

        recv_response(&mut stream, &self.path, response_timeout).await
    }

    /// Have the worker render a page and parse its reply.
    pub async fn request(&self, ctx: &RequestContext) -> Result<Step<ResponseEnvelope>> {
        debug!(socket = %self.path.display(), page = %ctx.filename, "Communicating with worker");

        let req = ServiceRequest::page(ctx);
        let raw = match self.exchange(&req, self.response_timeout).await? {
            Step::Ready(raw) => raw,
            Step::NeedsAction(why) => return Ok(Step::NeedsAction(why)),
        };

        let envelope = ResponseEnvelope::parse(&raw).with_context(|| {
            format!("Malformed response from worker on {}", self.path.display())
        })?;
        Ok(Step::Ready(envelope))
    }

    /// Ask the worker to exit. Returns the pid it reported.
    pub async fn request_exit(&self) -> Result<Step<u32>> {
        self.pid_exchange(&ServiceRequest::exit_now()).await
    }

    /// Ask the worker for its pid; a reply proves it is responsive.
    pub async fn query_pid(&self) -> Result<Step<u32>> {
        self.pid_exchange(&ServiceRequest::get_pid()).await
    }

    /// Control messages get the short probe timeout: a worker that cannot
    /// answer them promptly is treated as hung.
    async fn pid_exchange(&self, req: &ServiceRequest<'_>) -> Result<Step<u32>> {
        let raw = match self.exchange(req, self.probe_timeout).await? {
            Step::Ready(raw) => raw,
            Step::NeedsAction(why) => return Ok(Step::NeedsAction(why)),
        };
        let pid = parse_pid_reply(&raw)
            .with_context(|| format!("Bad reply from worker on {}", self.path.display()))?;
        Ok(Step::Ready(pid))
    }
}
