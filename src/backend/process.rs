//! Subprocess toolchain.
//!
//! Runs the page compiler and the worker binary with `tokio::process`. Every
//! child inherits our environment plus the Go build settings from the
//! context. Child stdout is discarded: ours may be carrying a response body.

use std::ffi::{OsStr, OsString};
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use super::Toolchain;
use crate::config::{ContextConfig, ServerConfig};
use crate::paths::ensure_directory_for;
use crate::status::{NeedsAction, Step};

/// Exit code the compiler uses for "nothing to do"; tolerated as success.
///
/// This is `APR_ENOTIMPL` (70023) as seen through an 8-bit exit status.
pub const NOT_IMPLEMENTED_EXIT_CODE: i32 = 70_023 % 256;

/// Poll interval while waiting for a worker to exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Toolchain that spawns real processes.
#[derive(Debug, Clone)]
pub struct ProcessToolchain {
    server: ServerConfig,
}

impl ProcessToolchain {
    #[must_use]
    pub const fn new(server: ServerConfig) -> Self {
        Self { server }
    }

    /// Environment added to every child's inherited environment.
    fn child_env(&self, ctx: &ContextConfig) -> Result<Vec<(&'static str, OsString)>> {
        let mut env = vec![("GOCACHE", self.server.build_cache_dir()?.into_os_string())];
        if let Some(go_path) = &ctx.go_path {
            env.push(("GOPATH", go_path.into()));
        }
        if let Some(cache) = &ctx.go_mod_cache {
            env.push(("GOMODCACHE", cache.into()));
        }
        let replacements = ctx.mod_replacements();
        if !replacements.is_empty() {
            env.push(("GOSP_MOD_REPLACE", replacements.join(",").into()));
        }
        Ok(env)
    }

    fn command(&self, program: &Path, args: &[OsString], ctx: &ContextConfig) -> Result<Command> {
        debug!(command = %command_line(program, args), "Command line");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(self.child_env(ctx)?)
            .stdin(Stdio::null())
            .stdout(Stdio::null());
        Ok(cmd)
    }
}

#[async_trait]
impl Toolchain for ProcessToolchain {
    #[instrument(skip_all, fields(page = %page.display(), plugin = %plugin.display()))]
    async fn compile(&self, page: &Path, plugin: &Path, ctx: &ContextConfig) -> Result<Step> {
        info!("Compiling page");
        ensure_directory_for(plugin, false, self.server.owner())?;

        let args = compile_args(page, plugin, ctx);
        let cmd = self.command(ctx.gosp2go(), &args, ctx)?;
        run_and_wait(cmd, ctx.gosp2go()).await
    }

    #[instrument(skip_all, fields(plugin = %plugin.display(), socket = %socket.display()))]
    async fn launch(&self, plugin: &Path, socket: &Path, ctx: &ContextConfig) -> Result<Step> {
        let program = ctx.gosp_server();
        info!(server = %program.display(), "Launching worker");
        ensure_directory_for(socket, false, self.server.owner())?;

        // A foreground dry run surfaces startup errors we could not see
        // from the detached worker.
        let dry_run = self.command(program, &worker_args(plugin, socket, ctx, true), ctx)?;
        if let Step::NeedsAction(why) = run_and_wait(dry_run, program).await? {
            return Ok(Step::NeedsAction(why));
        }

        let mut cmd = self.command(program, &worker_args(plugin, socket, ctx, false), ctx)?;
        cmd.stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0);
        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Step::NeedsAction(NeedsAction::ExecutableNotFound(
                    program.to_path_buf(),
                )));
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to run {}", program.display()));
            }
        };

        // Dropping the handle leaves the worker running; tokio reaps it once
        // it exits.
        debug!(pid = child.id(), "Worker detached");
        drop(child);
        Ok(Step::Ready(()))
    }

    async fn terminate(&self, pid: u32, grace: Duration) -> Result<()> {
        let pid = libc::pid_t::try_from(pid).with_context(|| format!("Invalid pid {pid}"))?;

        let start = Instant::now();
        while start.elapsed() < grace {
            if !is_running(pid)? {
                debug!(pid, "Worker exited");
                return Ok(());
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }

        // Gone between the last poll and now.
        if !is_running(pid)? {
            return Ok(());
        }
        warn!(pid, ?grace, "Worker did not exit; killing it");
        signal(pid, libc::SIGKILL)?;
        Ok(())
    }
}

/// Compiler argument vector (without the program name).
pub fn compile_args(page: &Path, plugin: &Path, ctx: &ContextConfig) -> Vec<OsString> {
    vec![
        "--build".into(),
        "-o".into(),
        plugin.into(),
        "--go".into(),
        ctx.go_cmd().into(),
        "--allowed".into(),
        ctx.allowed_imports().into(),
        "--max-top".into(),
        ctx.max_top().to_string().into(),
        page.into(),
    ]
}

/// Worker argument vector (without the program name).
pub fn worker_args(plugin: &Path, socket: &Path, ctx: &ContextConfig, dry_run: bool) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "-plugin".into(),
        plugin.into(),
        "-socket".into(),
        socket.into(),
    ];
    if let Some(idle) = &ctx.max_idle {
        args.push("-max-idle".into());
        args.push(idle.into());
    }
    if dry_run {
        args.push("-dry-run".into());
    }
    args
}

/// Spawn `cmd` and wait for it to finish cleanly.
async fn run_and_wait(mut cmd: Command, program: &Path) -> Result<Step> {
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(program = %program.display(), "Executable not found");
            return Ok(Step::NeedsAction(NeedsAction::ExecutableNotFound(
                program.to_path_buf(),
            )));
        }
        Err(e) => return Err(e).with_context(|| format!("Failed to run {}", program.display())),
    };

    let status = child
        .wait()
        .await
        .with_context(|| format!("{} was supposed to finish but didn't", program.display()))?;
    check_exit_status(program, status)?;
    Ok(Step::Ready(()))
}

fn check_exit_status(program: &Path, status: ExitStatus) -> Result<()> {
    match status.code() {
        Some(0 | NOT_IMPLEMENTED_EXIT_CODE) => Ok(()),
        Some(code) => bail!("Nonzero exit code ({code}) from {}", program.display()),
        None => bail!(
            "Abnormal exit from {} (signal {})",
            program.display(),
            status.signal().unwrap_or_default()
        ),
    }
}

/// Send `sig` to `pid`. Returns `Ok(false)` if the process does not exist.
fn signal(pid: libc::pid_t, sig: libc::c_int) -> Result<bool> {
    // SAFETY: kill has no memory-safety preconditions.
    #[allow(unsafe_code)]
    let result = unsafe { libc::kill(pid, sig) };
    if result == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(false);
    }
    Err(err).with_context(|| format!("Failed to signal process {pid}"))
}

/// True while `pid` exists and has not exited.
///
/// A worker we launched lingers as a zombie until tokio reaps it, and
/// `kill(pid, 0)` still succeeds on a zombie, so those count as exited.
fn is_running(pid: libc::pid_t) -> Result<bool> {
    Ok(signal(pid, 0)? && !is_zombie(pid))
}

fn is_zombie(pid: libc::pid_t) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            stat.rsplit_once(')')
                .map(|(_, rest)| rest.trim_start().starts_with('Z'))
        })
        .unwrap_or(false)
}

fn command_line(program: &Path, args: &[OsString]) -> String {
    std::iter::once(program.as_os_str())
        .chain(args.iter().map(OsString::as_os_str))
        .map(OsStr::to_string_lossy)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn strings(args: &[OsString]) -> Vec<String> {
        args.iter().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    fn toolchain(work_dir: &Path) -> ProcessToolchain {
        ProcessToolchain::new(ServerConfig {
            work_dir: work_dir.to_path_buf(),
            ..ServerConfig::default()
        })
    }

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("/bin/sh");
        cmd.args(["-c", script]);
        cmd
    }

    #[test]
    fn compile_args_use_defaults() {
        let args = compile_args(
            Path::new("/srv/www/p.gosp"),
            Path::new("/w/pages/srv/www/p.gosp.so"),
            &ContextConfig::default(),
        );
        assert_eq!(
            strings(&args),
            [
                "--build",
                "-o",
                "/w/pages/srv/www/p.gosp.so",
                "--go",
                "go",
                "--allowed",
                "NONE",
                "--max-top",
                "1000000000",
                "/srv/www/p.gosp",
            ]
        );
    }

    #[test]
    fn compile_args_strip_plus_from_imports() {
        let ctx = ContextConfig {
            go_cmd: Some("/opt/go/bin/go".into()),
            allowed_imports: Some("+fmt,os".into()),
            max_top: Some(3),
            ..ContextConfig::default()
        };
        let args = strings(&compile_args(Path::new("/p"), Path::new("/p.so"), &ctx));
        assert_eq!(args[4], "/opt/go/bin/go");
        assert_eq!(args[6], "fmt,os");
        assert_eq!(args[8], "3");
    }

    #[test]
    fn worker_args_with_idle_and_dry_run() {
        let ctx = ContextConfig {
            max_idle: Some("5m".into()),
            ..ContextConfig::default()
        };
        let plugin = Path::new("/w/pages/p.so");
        let socket = Path::new("/w/sockets/p.sock");

        assert_eq!(
            strings(&worker_args(plugin, socket, &ctx, true)),
            ["-plugin", "/w/pages/p.so", "-socket", "/w/sockets/p.sock", "-max-idle", "5m", "-dry-run"]
        );
        assert_eq!(
            strings(&worker_args(plugin, socket, &ContextConfig::default(), false)),
            ["-plugin", "/w/pages/p.so", "-socket", "/w/sockets/p.sock"]
        );
    }

    #[test]
    fn child_env_carries_build_settings() {
        let ctx = ContextConfig {
            go_path: Some("/home/site/go".into()),
            go_mod_cache: Some("/var/cache/gomod".into()),
            mod_replace: Some(BTreeMap::from([
                ("example.com/a".to_string(), Some("/src/a".to_string())),
                ("example.com/b".to_string(), Some("/src/b".to_string())),
            ])),
            ..ContextConfig::default()
        };
        let env: BTreeMap<_, _> = toolchain(Path::new("/w"))
            .child_env(&ctx)
            .unwrap()
            .into_iter()
            .collect();

        assert_eq!(env["GOCACHE"], OsString::from("/w/go-build"));
        assert_eq!(env["GOPATH"], OsString::from("/home/site/go"));
        assert_eq!(env["GOMODCACHE"], OsString::from("/var/cache/gomod"));
        assert_eq!(
            env["GOSP_MOD_REPLACE"],
            OsString::from("example.com/a=/src/a,example.com/b=/src/b")
        );
    }

    #[test]
    fn child_env_minimal() {
        let env = toolchain(Path::new("/w"))
            .child_env(&ContextConfig::default())
            .unwrap();
        assert_eq!(env.len(), 1);
        assert_eq!(env[0].0, "GOCACHE");
    }

    #[test]
    fn command_line_joins_words() {
        let line = command_line(Path::new("gosp2go"), &["--build".into(), "-o".into()]);
        assert_eq!(line, "gosp2go --build -o");
    }

    #[tokio::test]
    async fn clean_exit_is_ready() {
        let step = run_and_wait(sh("exit 0"), Path::new("/bin/sh")).await.unwrap();
        assert!(step.is_ready());
    }

    #[tokio::test]
    async fn not_implemented_exit_is_tolerated() {
        let step = run_and_wait(sh("exit 135"), Path::new("/bin/sh")).await.unwrap();
        assert!(step.is_ready());
    }

    #[tokio::test]
    async fn nonzero_exit_is_fatal() {
        let err = run_and_wait(sh("exit 3"), Path::new("/bin/sh"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Nonzero exit code (3)"));
    }

    #[tokio::test]
    async fn killed_child_is_abnormal() {
        let err = run_and_wait(sh("kill -9 $$"), Path::new("/bin/sh"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Abnormal exit"));
    }

    #[tokio::test]
    async fn missing_program_needs_action() {
        let program = PathBuf::from("/nonexistent/gosp-server");
        let step = run_and_wait(Command::new(&program), &program).await.unwrap();
        assert!(matches!(
            step,
            Step::NeedsAction(NeedsAction::ExecutableNotFound(p)) if p == program
        ));
    }

    #[tokio::test]
    async fn launch_missing_worker_needs_action() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ContextConfig {
            gosp_server: Some(dir.path().join("no-such-server")),
            ..ContextConfig::default()
        };
        let step = toolchain(dir.path())
            .launch(
                &dir.path().join("pages/p.so"),
                &dir.path().join("sockets/p.sock"),
                &ctx,
            )
            .await
            .unwrap();
        assert!(!step.is_ready());
        // The socket directory is prepared before spawning.
        assert!(dir.path().join("sockets").is_dir());
    }

    #[tokio::test]
    async fn launch_runs_dry_run_then_detaches() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ContextConfig {
            gosp_server: Some("true".into()),
            ..ContextConfig::default()
        };
        let step = toolchain(dir.path())
            .launch(
                &dir.path().join("pages/p.so"),
                &dir.path().join("sockets/p.sock"),
                &ctx,
            )
            .await
            .unwrap();
        assert!(step.is_ready());
    }

    #[tokio::test]
    async fn launch_dry_run_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ContextConfig {
            gosp_server: Some("false".into()),
            ..ContextConfig::default()
        };
        let result = toolchain(dir.path())
            .launch(
                &dir.path().join("pages/p.so"),
                &dir.path().join("sockets/p.sock"),
                &ctx,
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn terminate_kills_stubborn_process() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        toolchain(Path::new("/w"))
            .terminate(child.id(), Duration::from_millis(50))
            .await
            .unwrap();
        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(libc::SIGKILL));
    }

    #[tokio::test]
    async fn child_stdout_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let args: Vec<OsString> = vec![
            "-c".into(),
            r#"test "$(readlink /proc/$$/fd/1)" = /dev/null"#.into(),
        ];
        let cmd = toolchain(dir.path())
            .command(Path::new("/bin/sh"), &args, &ContextConfig::default())
            .unwrap();
        let step = run_and_wait(cmd, Path::new("/bin/sh")).await.unwrap();
        assert!(step.is_ready());
    }

    #[tokio::test]
    async fn terminate_treats_zombie_as_exited() {
        // Never waited on until the end, so it stays a zombie meanwhile.
        let mut child = std::process::Command::new("true").spawn().unwrap();

        let start = Instant::now();
        toolchain(Path::new("/w"))
            .terminate(child.id(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(child.wait().unwrap().success());
    }

    #[test]
    fn live_process_is_not_a_zombie() {
        let pid = libc::pid_t::try_from(std::process::id()).unwrap();
        assert!(!is_zombie(pid));
        assert!(is_running(pid).unwrap());
    }

    #[tokio::test]
    async fn terminate_returns_once_process_is_gone() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        let start = Instant::now();
        toolchain(Path::new("/w"))
            .terminate(pid, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
