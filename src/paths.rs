//! Filesystem layout under the work directory.
//!
//! Every page maps to a socket and a compiled plugin whose names mirror the
//! page's own path:
//!
//! ```text
//! <work>/sockets/<page>.sock
//! <work>/pages/<page>.so
//! <work>/go-build/
//! <work>/global.lock
//! ```

use std::fs::{self, DirBuilder};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};
use tracing::debug;

/// Permission bits for directories we create (rwxr-xr-x).
pub const DIR_MODE: u32 = 0o755;

/// Suffix appended to a page path to name its worker socket.
pub const SOCKET_SUFFIX: &str = ".sock";

/// Suffix appended to a page path to name its compiled plugin.
pub const PLUGIN_SUFFIX: &str = ".so";

/// Ownership applied to directories created on behalf of workers.
///
/// `None` leaves the corresponding id unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Owner {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

/// Socket and plugin locations for one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagePaths {
    /// Unix-domain socket the page's worker listens on.
    pub socket: PathBuf,
    /// Compiled artifact the worker loads.
    pub plugin: PathBuf,
}

impl PagePaths {
    /// Derive the socket and plugin names for `page` under `work_dir`.
    pub fn resolve(work_dir: &Path, page: &Path) -> Result<Self> {
        ensure!(
            page.file_name().is_some(),
            "Page path {} does not name a file",
            page.display()
        );

        let socket = with_suffix(
            secure_join(work_dir, &[Path::new("sockets"), page])
                .context("Failed to construct a socket name")?,
            SOCKET_SUFFIX,
        );
        let plugin = with_suffix(
            secure_join(work_dir, &[Path::new("pages"), page])
                .context("Failed to construct the name of the plugin")?,
            PLUGIN_SUFFIX,
        );

        Ok(Self { socket, plugin })
    }
}

/// Join `segments` onto `root`, refusing any result that escapes it.
///
/// A leading `/` on a segment is dropped so absolute page paths nest under
/// the root. Each segment is resolved relative to everything joined before
/// it, and a `..` that would climb above that point is an error.
pub fn secure_join<P: AsRef<Path>>(root: &Path, segments: &[P]) -> Result<PathBuf> {
    ensure!(
        root.is_absolute(),
        "Root {} is not an absolute path",
        root.display()
    );

    let mut joined = root.to_path_buf();
    for segment in segments {
        let segment = segment.as_ref();
        let relative = segment.strip_prefix("/").unwrap_or(segment);
        let floor = joined.components().count();

        for component in relative.components() {
            match component {
                Component::Normal(part) => joined.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if joined.components().count() <= floor {
                        bail!(
                            "Failed to securely merge {} and {}",
                            joined.display(),
                            segment.display()
                        );
                    }
                    joined.pop();
                }
                Component::RootDir | Component::Prefix(_) => bail!(
                    "Failed to securely merge {} and {}",
                    joined.display(),
                    segment.display()
                ),
            }
        }
    }

    Ok(joined)
}

fn with_suffix(path: PathBuf, suffix: &str) -> PathBuf {
    let mut name = path.into_os_string();
    name.push(suffix);
    name.into()
}

/// Make sure the directory holding `path` exists and belongs to `owner`.
///
/// With `is_dir` set, `path` is itself the directory. Missing ancestors are
/// created with [`DIR_MODE`]; only the final directory is chowned.
pub fn ensure_directory_for(path: &Path, is_dir: bool, owner: Owner) -> Result<()> {
    let dir = if is_dir {
        path
    } else {
        path.parent()
            .with_context(|| format!("{} has no parent directory", path.display()))?
    };

    let meta = match fs::metadata(dir) {
        Ok(meta) => meta,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "Failed to query directory; creating it");
            DirBuilder::new()
                .recursive(true)
                .mode(DIR_MODE)
                .create(dir)
                .with_context(|| format!("Failed to create directory {}", dir.display()))?;
            fs::metadata(dir)
                .with_context(|| format!("Failed to query directory {}", dir.display()))?
        }
    };

    ensure!(
        meta.is_dir(),
        "Failed to create directory {} because it already exists as a non-directory",
        dir.display()
    );

    std::os::unix::fs::chown(dir, owner.uid, owner.gid)
        .with_context(|| format!("Failed to change ownership of directory {}", dir.display()))?;

    Ok(())
}

/// Report whether `first` was modified after `second`.
///
/// A missing `second` counts as older than anything. `first` must exist;
/// failing to stat it is an error, as is any failure other than not-found
/// on `second`. Equal timestamps are not newer.
pub fn is_newer_than(first: &Path, second: &Path) -> Result<bool> {
    let second_mtime = match fs::metadata(second) {
        Ok(meta) => meta
            .modified()
            .with_context(|| format!("Failed to read mtime of {}", second.display()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to query {}", second.display()));
        }
    };

    let first_mtime = fs::metadata(first)
        .and_then(|meta| meta.modified())
        .with_context(|| format!("Failed to query {}", first.display()))?;

    Ok(first_mtime > second_mtime)
}
