//! Per-request entry point.
//!
//! A request for a page first goes straight to the page's worker if the
//! plugin is up to date. If that is not possible the worker manager
//! rebuilds and relaunches it under the global lock and retries.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tracing::{debug, error, info, instrument};

use crate::backend::Toolchain;
use crate::config::{Config, ServerConfig, Timeouts};
use crate::lifecycle::{is_stale, WorkerManager};
use crate::lock::GlobalLock;
use crate::paths::{ensure_directory_for, PagePaths};
use crate::status::Step;
use crate::transport::protocol::{parse_get_args, parse_post_data, HTTP_OK};
use crate::transport::{RequestContext, ResponseEnvelope};

pub const HTTP_NOT_FOUND: u16 = 404;
pub const HTTP_INTERNAL_SERVER_ERROR: u16 = 500;

/// An inbound HTTP request, as handed over by the host server.
#[derive(Debug, Clone, Default)]
pub struct HostRequest {
    pub scheme: String,
    pub local_hostname: String,
    pub port: u16,
    pub uri: String,
    pub path_info: String,
    /// Raw query string, without the `?`.
    pub query_args: String,
    pub url: String,
    pub method: String,
    pub request_line: String,
    /// Milliseconds since the Unix epoch.
    pub request_time: i64,
    pub remote_hostname: String,
    pub remote_ip: String,
    /// Canonical path of the page source.
    pub filename: PathBuf,
    pub admin_email: String,
    /// Request headers in arrival order.
    pub headers: Vec<(String, String)>,
    pub environment: BTreeMap<String, String>,
    pub body: Vec<u8>,
    /// HEAD request: only headers were asked for.
    pub header_only: bool,
}

impl HostRequest {
    /// Build the context sent to the worker.
    ///
    /// POST bodies are decoded as form data. For repeated headers the last
    /// value wins.
    pub fn to_context(&self) -> Result<RequestContext> {
        let post_data = if self.method.eq_ignore_ascii_case("POST") {
            parse_post_data(&self.body).context("Failed to parse POST data")?
        } else {
            BTreeMap::new()
        };

        Ok(RequestContext {
            scheme: self.scheme.clone(),
            local_hostname: self.local_hostname.clone(),
            port: self.port,
            uri: self.uri.clone(),
            path_info: self.path_info.clone(),
            query_args: self.query_args.clone(),
            url: self.url.clone(),
            method: self.method.clone(),
            request_line: self.request_line.clone(),
            request_time: self.request_time,
            remote_hostname: self.remote_hostname.clone(),
            remote_ip: self.remote_ip.clone(),
            filename: self.filename.to_string_lossy().into_owned(),
            admin_email: self.admin_email.clone(),
            post_data,
            get_data: parse_get_args(&self.query_args),
            header_data: self.headers.iter().cloned().collect(),
            environment: self.environment.clone(),
        })
    }
}

/// Current time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

/// What the host should send back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpOutcome {
    pub status: u16,
    pub content_type: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpOutcome {
    /// A bodiless outcome with the given status.
    pub const fn status(status: u16) -> Self {
        Self {
            status,
            content_type: None,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub const fn is_success(&self) -> bool {
        self.status == HTTP_OK
    }

    /// Set `name`, dropping any earlier values (names compare
    /// case-insensitively).
    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.to_string()));
    }

    /// Add another value for `name`.
    pub fn append_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }
}

impl From<ResponseEnvelope> for HttpOutcome {
    fn from(envelope: ResponseEnvelope) -> Self {
        let mut outcome = Self {
            status: envelope.status,
            content_type: envelope.mime_type,
            headers: Vec::new(),
            body: envelope.body,
        };
        for field in &envelope.headers {
            if field.replace {
                outcome.set_header(&field.name, &field.value);
            } else {
                outcome.append_header(&field.name, &field.value);
            }
        }
        outcome
    }
}

/// Result of handing a request to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled {
    /// Not ours; the host serves it itself.
    Declined,
    Served(HttpOutcome),
}

/// Create the work directory and the global lock.
///
/// Run once before serving any requests.
pub fn initialize(server: &ServerConfig) -> Result<GlobalLock> {
    info!(work_dir = %server.work_dir.display(), "Using work directory");
    ensure_directory_for(&server.work_dir, true, server.owner())?;
    GlobalLock::create(&server.lock_path()?, server.owner())
}

/// Routes page requests to their workers.
pub struct Dispatcher<T> {
    config: Config,
    manager: WorkerManager<T>,
}

impl<T: Toolchain> Dispatcher<T> {
    pub const fn new(config: Config, toolchain: T, lock: GlobalLock, timeouts: Timeouts) -> Self {
        Self {
            config,
            manager: WorkerManager::new(toolchain, lock, timeouts),
        }
    }

    pub const fn manager(&self) -> &WorkerManager<T> {
        &self.manager
    }

    fn page_paths(&self, page: &Path) -> Result<PagePaths> {
        PagePaths::resolve(&self.config.server.work_dir, page)
    }

    /// Handle one request. Never fails: hard errors become a 500.
    #[instrument(skip_all, fields(page = %req.filename.display(), method = %req.method))]
    pub async fn handle(&self, req: &HostRequest) -> Handled {
        if req.header_only {
            return Handled::Declined;
        }

        if let Err(e) = std::fs::metadata(&req.filename) {
            info!(error = %e, "Failed to query page");
            return Handled::Served(HttpOutcome::status(HTTP_NOT_FOUND));
        }

        match self.serve(req).await {
            Ok(outcome) => Handled::Served(outcome),
            Err(e) => {
                error!(error = %format!("{e:#}"), "Failed to serve page");
                Handled::Served(HttpOutcome::status(HTTP_INTERNAL_SERVER_ERROR))
            }
        }
    }

    async fn serve(&self, req: &HostRequest) -> Result<HttpOutcome> {
        let page = req.filename.as_path();
        let paths = self.page_paths(page)?;
        let ctx = self.config.context_for(page);
        let request = req.to_context()?;

        let mut failure = None;
        if !is_stale(page, &paths)? {
            match self.manager.socket(&paths).request(&request).await? {
                Step::Ready(envelope) => return Ok(envelope.into()),
                Step::NeedsAction(why) => {
                    debug!(%why, "Worker unavailable; rebuilding");
                    failure = Some(why);
                }
            }
        }

        match self
            .manager
            .rebuild_relaunch_retry(page, &paths, &ctx, &request, failure.as_ref())
            .await?
        {
            Step::Ready(envelope) => Ok(envelope.into()),
            Step::NeedsAction(why) => Err(anyhow::Error::new(why)).with_context(|| {
                format!("Worker for {} never became ready", page.display())
            }),
        }
    }

    /// Stop a page's worker and discard its plugin.
    pub async fn kill(&self, page: &Path) -> Result<()> {
        let paths = self.page_paths(page)?;
        let guard = self
            .manager
            .lock()
            .acquire(self.manager.timeouts().lock)
            .await?;
        let outcome = self.manager.kill_worker(&paths).await;
        guard.release()?;
        outcome
    }
}
