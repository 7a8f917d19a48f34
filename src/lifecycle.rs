//! Worker lifecycle: stop, rebuild, relaunch, retry.
//!
//! Everything that creates or deletes a page's socket or plugin runs under
//! the global lock. Staleness is checked once before taking the lock and
//! again after, with the same predicate, so a page rebuilt by someone else
//! while we waited is not rebuilt twice.

use std::io;
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::backend::Toolchain;
use crate::config::{ContextConfig, Timeouts};
use crate::lock::GlobalLock;
use crate::paths::{is_newer_than, PagePaths};
use crate::status::{NeedsAction, Step};
use crate::transport::{RequestContext, ResponseEnvelope, WorkerSocket};

/// True if `page` must be recompiled before it can be served.
pub fn is_stale(page: &Path, paths: &PagePaths) -> Result<bool> {
    is_newer_than(page, &paths.plugin)
}

/// Drives compile/launch/kill for page workers.
pub struct WorkerManager<T> {
    toolchain: T,
    lock: GlobalLock,
    timeouts: Timeouts,
}

impl<T: Toolchain> WorkerManager<T> {
    pub const fn new(toolchain: T, lock: GlobalLock, timeouts: Timeouts) -> Self {
        Self {
            toolchain,
            lock,
            timeouts,
        }
    }

    pub const fn toolchain(&self) -> &T {
        &self.toolchain
    }

    pub const fn lock(&self) -> &GlobalLock {
        &self.lock
    }

    pub const fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// Client for the worker behind `paths`.
    pub fn socket(&self, paths: &PagePaths) -> WorkerSocket {
        WorkerSocket::new(&paths.socket, &self.timeouts)
    }

    /// Stop the page's worker and delete its socket and plugin.
    ///
    /// Asking the worker to exit is best-effort. Must be called with the
    /// global lock held.
    pub async fn kill_worker(&self, paths: &PagePaths) -> Result<()> {
        match self.socket(paths).request_exit().await {
            Ok(Step::Ready(pid)) => {
                debug!(pid, socket = %paths.socket.display(), "Worker acknowledged exit request");
                if let Err(e) = self.toolchain.terminate(pid, self.timeouts.exit_wait).await {
                    warn!(pid, error = %format!("{e:#}"), "Failed to stop worker");
                }
            }
            Ok(Step::NeedsAction(why)) => debug!(%why, "No worker to stop"),
            Err(e) => warn!(error = %format!("{e:#}"), "Failed to ask worker to exit"),
        }

        remove_if_exists(&paths.socket)
            .with_context(|| format!("Failed to remove socket {}", paths.socket.display()))?;
        remove_if_exists(&paths.plugin)
            .with_context(|| format!("Failed to remove plugin {}", paths.plugin.display()))?;
        Ok(())
    }

    /// Bring up a fresh worker for `page` and have it serve `request`.
    ///
    /// `failure` is why the caller's own attempt on the worker failed, if it
    /// made one. A worker that timed out is not tried again without the lock.
    ///
    /// Returns needs-action only if the relaunched worker never answered
    /// within the launch window.
    #[instrument(skip_all, fields(page = %page.display()))]
    pub async fn rebuild_relaunch_retry(
        &self,
        page: &Path,
        paths: &PagePaths,
        ctx: &ContextConfig,
        request: &RequestContext,
        failure: Option<&NeedsAction>,
    ) -> Result<Step<ResponseEnvelope>> {
        let mut guard = self.lock.acquire(self.timeouts.lock).await?;

        let hung = matches!(failure, Some(NeedsAction::ResponseTimeout { .. }));
        if !hung && !is_stale(page, paths)? {
            // Someone rebuilt it while we waited. Try it without the lock.
            guard.release()?;
            debug!("Plugin is already fresh; retrying the worker");
            if let Step::Ready(envelope) = self.socket(paths).request(request).await? {
                return Ok(Step::Ready(envelope));
            }
            guard = self.lock.acquire(self.timeouts.lock).await?;
        }

        let outcome = self.rebuild_locked(page, paths, ctx, request).await;
        let released = guard.release();
        let step = outcome?;
        released?;
        Ok(step)
    }

    async fn rebuild_locked(
        &self,
        page: &Path,
        paths: &PagePaths,
        ctx: &ContextConfig,
        request: &RequestContext,
    ) -> Result<Step<ResponseEnvelope>> {
        if is_stale(page, paths)? {
            self.kill_worker(paths).await?;
            if let Step::NeedsAction(why) = self.toolchain.compile(page, &paths.plugin, ctx).await? {
                return Err(anyhow::Error::new(why))
                    .with_context(|| format!("Failed to compile {}", page.display()));
            }
        }

        // Another process may have launched the worker between our checks.
        let socket = self.socket(paths);
        match socket.query_pid().await {
            Ok(Step::Ready(pid)) => debug!(pid, "Worker is already running"),
            probe => {
                match probe {
                    Ok(Step::NeedsAction(NeedsAction::ResponseTimeout { .. })) => warn!(
                        socket = %paths.socket.display(),
                        "Worker is not responding; abandoning it"
                    ),
                    Err(e) => debug!(error = %format!("{e:#}"), "Worker probe failed"),
                    _ => {}
                }
                // The new worker binds a fresh socket.
                remove_if_exists(&paths.socket).with_context(|| {
                    format!("Failed to remove socket {}", paths.socket.display())
                })?;
                info!(socket = %paths.socket.display(), "Starting worker");
                if let Step::NeedsAction(why) =
                    self.toolchain.launch(&paths.plugin, &paths.socket, ctx).await?
                {
                    return Err(anyhow::Error::new(why))
                        .with_context(|| format!("Failed to launch a worker for {}", page.display()));
                }
            }
        }

        self.retry_until_ready(&socket, request).await
    }

    /// Poll the worker until it serves the request or the window closes.
    async fn retry_until_ready(
        &self,
        socket: &WorkerSocket,
        request: &RequestContext,
    ) -> Result<Step<ResponseEnvelope>> {
        let start = Instant::now();
        loop {
            match socket.request(request).await? {
                Step::Ready(envelope) => return Ok(Step::Ready(envelope)),
                Step::NeedsAction(why) => debug!(%why, "Worker not ready yet"),
            }
            if start.elapsed() >= self.timeouts.launch_wait {
                break;
            }
            tokio::time::sleep(self.timeouts.retry_interval).await;
        }

        Ok(Step::NeedsAction(NeedsAction::WorkerUnresponsive {
            socket: socket.path().to_path_buf(),
            waited: self.timeouts.launch_wait,
        }))
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::Owner;
    use async_trait::async_trait;
    use std::fs::{self, File};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::{Duration, SystemTime};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;

    const FAKE_PID: u32 = 4242;

    #[derive(Default)]
    struct FakeToolchain {
        compiles: AtomicUsize,
        launches: AtomicUsize,
        terminated: Mutex<Vec<u32>>,
        fail_compile: bool,
        start_worker: bool,
    }

    #[async_trait]
    impl Toolchain for FakeToolchain {
        async fn compile(&self, _page: &Path, plugin: &Path, _ctx: &ContextConfig) -> Result<Step> {
            self.compiles.fetch_add(1, Ordering::SeqCst);
            anyhow::ensure!(!self.fail_compile, "Nonzero exit code (1) from gosp2go");
            fs::create_dir_all(plugin.parent().unwrap())?;
            fs::write(plugin, b"plugin")?;
            Ok(Step::Ready(()))
        }

        async fn launch(&self, _plugin: &Path, socket: &Path, _ctx: &ContextConfig) -> Result<Step> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            if self.start_worker {
                fake_worker(socket);
            }
            Ok(Step::Ready(()))
        }

        async fn terminate(&self, pid: u32, _grace: Duration) -> Result<()> {
            self.terminated.lock().unwrap().push(pid);
            Ok(())
        }
    }

    /// Serve requests on `socket` until asked to exit.
    fn fake_worker(socket: &Path) {
        fs::create_dir_all(socket.parent().unwrap()).unwrap();
        let _ = fs::remove_file(socket);
        let listener = UnixListener::bind(socket).unwrap();
        tokio::spawn(async move {
            while let Ok((mut conn, _)) = listener.accept().await {
                let mut raw = Vec::new();
                if conn.read_to_end(&mut raw).await.is_err() {
                    continue;
                }
                let req: serde_json::Value = serde_json::from_slice(&raw).unwrap_or_default();
                let exit = req.get("ExitNow").is_some();
                let reply = if exit || req.get("GetPID").is_some() {
                    format!("gosp-pid {FAKE_PID}\n")
                } else {
                    "http-status 200\nend-header\nfresh".to_string()
                };
                let _ = conn.write_all(reply.as_bytes()).await;
                let _ = conn.shutdown().await;
                if exit {
                    return;
                }
            }
        });
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        page: std::path::PathBuf,
        paths: PagePaths,
        lock: GlobalLock,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        let page = dir.path().join("site/index.gosp");
        fs::create_dir_all(page.parent().unwrap()).unwrap();
        fs::write(&page, b"<p>hi</p>").unwrap();
        set_mtime(&page, SystemTime::now() - Duration::from_secs(60));

        let paths = PagePaths::resolve(&work, &page).unwrap();
        let lock = GlobalLock::create(&work.join("global.lock"), Owner::default()).unwrap();
        Fixture {
            _dir: dir,
            page,
            paths,
            lock,
        }
    }

    fn set_mtime(path: &Path, time: SystemTime) {
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(time)
            .unwrap();
    }

    fn timeouts() -> Timeouts {
        Timeouts {
            response: Duration::from_millis(500),
            connect: Duration::from_millis(100),
            lock: Some(Duration::from_secs(2)),
            launch_wait: Duration::from_millis(200),
            retry_interval: Duration::from_millis(20),
            exit_wait: Duration::from_millis(50),
            probe: Duration::from_millis(100),
        }
    }

    fn manager(fx: &Fixture, toolchain: FakeToolchain) -> WorkerManager<FakeToolchain> {
        WorkerManager::new(toolchain, fx.lock.clone(), timeouts())
    }

    #[tokio::test]
    async fn kill_worker_tolerates_missing_files() {
        let fx = fixture();
        let mgr = manager(&fx, FakeToolchain::default());
        mgr.kill_worker(&fx.paths).await.unwrap();
        assert!(mgr.toolchain().terminated.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn kill_worker_stops_worker_and_removes_files() {
        let fx = fixture();
        fake_worker(&fx.paths.socket);
        fs::create_dir_all(fx.paths.plugin.parent().unwrap()).unwrap();
        fs::write(&fx.paths.plugin, b"old").unwrap();

        let mgr = manager(&fx, FakeToolchain::default());
        mgr.kill_worker(&fx.paths).await.unwrap();

        assert_eq!(*mgr.toolchain().terminated.lock().unwrap(), [FAKE_PID]);
        assert!(!fx.paths.socket.exists());
        assert!(!fx.paths.plugin.exists());
    }

    #[tokio::test]
    async fn missing_plugin_is_compiled_launched_and_served() {
        let fx = fixture();
        let mgr = manager(
            &fx,
            FakeToolchain {
                start_worker: true,
                ..FakeToolchain::default()
            },
        );

        let step = mgr
            .rebuild_relaunch_retry(
                &fx.page,
                &fx.paths,
                &ContextConfig::default(),
                &RequestContext::default(),
                None,
            )
            .await
            .unwrap();

        assert_eq!(step.ready().unwrap().body, b"fresh");
        assert_eq!(mgr.toolchain().compiles.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.toolchain().launches.load(Ordering::SeqCst), 1);
        assert!(!is_stale(&fx.page, &fx.paths).unwrap());
    }

    #[tokio::test]
    async fn fresh_plugin_with_dead_worker_is_relaunched_not_recompiled() {
        let fx = fixture();
        fs::create_dir_all(fx.paths.plugin.parent().unwrap()).unwrap();
        fs::write(&fx.paths.plugin, b"plugin").unwrap();

        let mgr = manager(
            &fx,
            FakeToolchain {
                start_worker: true,
                ..FakeToolchain::default()
            },
        );
        let step = mgr
            .rebuild_relaunch_retry(
                &fx.page,
                &fx.paths,
                &ContextConfig::default(),
                &RequestContext::default(),
                None,
            )
            .await
            .unwrap();

        assert!(step.is_ready());
        assert_eq!(mgr.toolchain().compiles.load(Ordering::SeqCst), 0);
        assert_eq!(mgr.toolchain().launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn compile_failure_releases_lock() {
        let fx = fixture();
        let mgr = manager(
            &fx,
            FakeToolchain {
                fail_compile: true,
                ..FakeToolchain::default()
            },
        );

        let err = mgr
            .rebuild_relaunch_retry(
                &fx.page,
                &fx.paths,
                &ContextConfig::default(),
                &RequestContext::default(),
                None,
            )
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("Nonzero exit code"));
        assert_eq!(mgr.toolchain().launches.load(Ordering::SeqCst), 0);

        let guard = fx.lock.acquire(Some(Duration::ZERO)).await.unwrap();
        guard.release().unwrap();
    }

    #[tokio::test]
    async fn unresponsive_worker_gives_up_after_launch_window() {
        let fx = fixture();
        let mgr = manager(&fx, FakeToolchain::default());

        let start = Instant::now();
        let step = mgr
            .rebuild_relaunch_retry(
                &fx.page,
                &fx.paths,
                &ContextConfig::default(),
                &RequestContext::default(),
                None,
            )
            .await
            .unwrap();

        assert!(matches!(
            step,
            Step::NeedsAction(NeedsAction::WorkerUnresponsive { .. })
        ));
        let t = timeouts();
        assert!(start.elapsed() < t.lock.unwrap() + t.launch_wait + Duration::from_secs(1));

        let guard = fx.lock.acquire(Some(Duration::ZERO)).await.unwrap();
        guard.release().unwrap();
    }
}
