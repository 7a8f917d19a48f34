//! Dispatcher configuration.
//!
//! Configuration is JSON, read from the `GOSP_CONFIG` environment variable or
//! a file. It has two parts: server-wide settings (work directory, ownership)
//! and per-context settings (compiler, worker binary, build limits). Contexts
//! inherit from one another the way nested directory blocks do: a child value
//! overrides its parent's, except where a leading `+` asks to extend it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::paths::{secure_join, Owner};

/// Environment variable holding the JSON configuration.
pub const CONFIG_ENV_VAR: &str = "GOSP_CONFIG";

/// Work directory used when none is configured.
pub const DEFAULT_WORK_DIR: &str = "/var/cache/apache2/mod_gosp";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server-wide settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Base context applied to every page.
    #[serde(default)]
    pub context: ContextConfig,

    /// Nested contexts, each applying to pages under `prefix`.
    #[serde(default)]
    pub contexts: Vec<ScopedContext>,
}

/// Server-wide settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Directory holding sockets, plugins, the build cache, and the lock file.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// User that should own directories created for workers.
    #[serde(default)]
    pub user_id: Option<u32>,

    /// Group that should own directories created for workers.
    #[serde(default)]
    pub group_id: Option<u32>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            user_id: None,
            group_id: None,
        }
    }
}

impl ServerConfig {
    /// Ownership applied to created directories.
    pub const fn owner(&self) -> Owner {
        Owner {
            uid: self.user_id,
            gid: self.group_id,
        }
    }

    /// Path of the file backing the global lock.
    pub fn lock_path(&self) -> Result<PathBuf> {
        secure_join(&self.work_dir, &["global.lock"])
    }

    /// Directory used as the compiler's build cache.
    pub fn build_cache_dir(&self) -> Result<PathBuf> {
        secure_join(&self.work_dir, &["go-build"])
    }
}

/// A context that applies to pages under a directory prefix.
#[derive(Debug, Clone, Deserialize)]
pub struct ScopedContext {
    /// Pages whose path starts with this prefix use this context.
    pub prefix: PathBuf,

    #[serde(flatten)]
    pub context: ContextConfig,
}

/// Per-context settings. `None` means "not set here; inherit".
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ContextConfig {
    /// Go compiler executable handed to the page compiler.
    #[serde(default)]
    pub go_cmd: Option<String>,

    /// Page compiler executable.
    #[serde(default)]
    pub gosp2go: Option<PathBuf>,

    /// Worker executable.
    #[serde(default)]
    pub gosp_server: Option<PathBuf>,

    /// `GOPATH` for builds. A leading `+` prepends to the parent's value.
    #[serde(default)]
    pub go_path: Option<String>,

    /// `GOMODCACHE` for builds.
    #[serde(default)]
    pub go_mod_cache: Option<String>,

    /// Idle time after which a worker exits on its own (e.g. `"5m"`).
    #[serde(default)]
    pub max_idle: Option<String>,

    /// Maximum number of top-level blocks per page.
    #[serde(default)]
    pub max_top: Option<u64>,

    /// Comma-separated allowed imports, `ALL`, or `NONE`. A leading `+`
    /// appends to the parent's list.
    #[serde(default)]
    pub allowed_imports: Option<String>,

    /// Module replacements. A `null` path deletes an inherited replacement.
    #[serde(default)]
    pub mod_replace: Option<BTreeMap<String, Option<String>>>,
}

/// Default Go compiler command.
pub const DEFAULT_GO_COMMAND: &str = "go";

/// Default page compiler.
pub const DEFAULT_GOSP2GO: &str = "gosp2go";

/// Default worker executable.
pub const DEFAULT_GOSP_SERVER: &str = "gosp-server";

/// Imports allowed when none are configured.
pub const DEFAULT_ALLOWED_IMPORTS: &str = "NONE";

/// Top-level block limit when none is configured.
pub const DEFAULT_MAX_TOP: u64 = 1_000_000_000;

const GO_PATH_SEPARATOR: char = ':';

impl ContextConfig {
    /// Merge `child` over `parent`.
    pub fn merge(parent: &Self, child: &Self) -> Self {
        let allowed_imports = match child.allowed_imports.as_deref() {
            Some(extra) if extra.starts_with('+') => {
                let base = parent.allowed_imports.as_deref().unwrap_or("ALL");
                Some(format!("{base},{}", &extra[1..]))
            }
            Some(own) => Some(own.to_string()),
            None => parent.allowed_imports.clone(),
        };

        let go_path = match (child.go_path.as_deref(), parent.go_path.as_deref()) {
            (Some(extra), Some(base)) if extra.starts_with('+') => {
                Some(format!("{}{GO_PATH_SEPARATOR}{base}", &extra[1..]))
            }
            (Some(own), _) => Some(own.to_string()),
            (None, inherited) => inherited.map(str::to_string),
        };

        let mod_replace = match (&parent.mod_replace, &child.mod_replace) {
            (Some(base), Some(over)) => {
                let mut merged = base.clone();
                merged.extend(over.iter().map(|(k, v)| (k.clone(), v.clone())));
                Some(merged)
            }
            (base, over) => over.clone().or_else(|| base.clone()),
        };

        Self {
            go_cmd: child.go_cmd.clone().or_else(|| parent.go_cmd.clone()),
            gosp2go: child.gosp2go.clone().or_else(|| parent.gosp2go.clone()),
            gosp_server: child
                .gosp_server
                .clone()
                .or_else(|| parent.gosp_server.clone()),
            go_path,
            go_mod_cache: child
                .go_mod_cache
                .clone()
                .or_else(|| parent.go_mod_cache.clone()),
            max_idle: child.max_idle.clone().or_else(|| parent.max_idle.clone()),
            max_top: child.max_top.or(parent.max_top),
            allowed_imports,
            mod_replace,
        }
    }

    pub fn go_cmd(&self) -> &str {
        self.go_cmd.as_deref().unwrap_or(DEFAULT_GO_COMMAND)
    }

    pub fn gosp2go(&self) -> &Path {
        self.gosp2go
            .as_deref()
            .unwrap_or_else(|| Path::new(DEFAULT_GOSP2GO))
    }

    pub fn gosp_server(&self) -> &Path {
        self.gosp_server
            .as_deref()
            .unwrap_or_else(|| Path::new(DEFAULT_GOSP_SERVER))
    }

    pub fn max_top(&self) -> u64 {
        self.max_top.unwrap_or(DEFAULT_MAX_TOP)
    }

    /// Allowed imports as passed to the compiler.
    ///
    /// A `+` left over from merging has nothing to extend at this point and
    /// is dropped.
    pub fn allowed_imports(&self) -> &str {
        let imports = self
            .allowed_imports
            .as_deref()
            .unwrap_or(DEFAULT_ALLOWED_IMPORTS);
        imports.strip_prefix('+').unwrap_or(imports)
    }

    /// Active module replacements as `module=path` pairs.
    pub fn mod_replacements(&self) -> Vec<String> {
        self.mod_replace
            .iter()
            .flatten()
            .filter_map(|(module, path)| path.as_ref().map(|p| format!("{module}={p}")))
            .collect()
    }
}

impl Config {
    /// Load configuration from the `GOSP_CONFIG` environment variable.
    ///
    /// An unset variable yields the defaults.
    pub fn from_env() -> Result<Self> {
        match std::env::var(CONFIG_ENV_VAR) {
            Ok(json) => Self::from_json(&json).context("Failed to parse GOSP_CONFIG"),
            Err(_) => {
                debug!("GOSP_CONFIG not set, using default configuration");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&json)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        Ok(config)
    }

    /// Effective context for `page`: the base context with every matching
    /// scoped context merged on top, shortest prefix first.
    pub fn context_for(&self, page: &Path) -> ContextConfig {
        let mut scoped: Vec<&ScopedContext> = self
            .contexts
            .iter()
            .filter(|s| page.starts_with(&s.prefix))
            .collect();
        scoped.sort_by_key(|s| s.prefix.components().count());

        scoped
            .into_iter()
            .fold(self.context.clone(), |merged, s| {
                ContextConfig::merge(&merged, &s.context)
            })
    }
}

fn default_work_dir() -> PathBuf {
    DEFAULT_WORK_DIR.into()
}

/// Wait limits used by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Longest wait for one chunk of a worker's response.
    pub response: Duration,

    /// Longest wait to connect to a worker socket.
    pub connect: Duration,

    /// Longest wait for the global lock. `None` waits indefinitely.
    pub lock: Option<Duration>,

    /// How long to keep retrying a freshly launched worker.
    pub launch_wait: Duration,

    /// Pause between retries while a worker starts up.
    pub retry_interval: Duration,

    /// Grace period for a worker to exit after being asked to.
    pub exit_wait: Duration,

    /// Longest wait for a worker to answer `GetPID` or `ExitNow`.
    pub probe: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            response: Duration::from_secs(600),
            connect: Duration::from_secs(1),
            lock: Some(Duration::from_secs(10)),
            launch_wait: Duration::from_secs(3),
            retry_interval: Duration::from_millis(100),
            exit_wait: Duration::from_secs(1),
            probe: Duration::from_secs(1),
        }
    }
}
