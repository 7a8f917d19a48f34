//! Three-level outcome used throughout the dispatcher.
//!
//! Every fallible operation returns `anyhow::Result<Step<T>>`:
//! - `Ok(Step::Ready(v))`: the operation succeeded.
//! - `Ok(Step::NeedsAction(why))`: a transient condition the caller should
//!   answer by rebuilding or relaunching the worker and retrying.
//! - `Err(e)`: a hard failure; the request is aborted with a 500.

use std::path::PathBuf;
use std::time::Duration;

/// Transient conditions that drive the rebuild/relaunch state machine.
///
/// These never reach the client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NeedsAction {
    /// Nothing is accepting connections on the worker socket.
    #[error("worker socket {0} is not accepting connections")]
    SocketUnavailable(PathBuf),

    /// The worker accepted the request but stopped sending data.
    #[error("worker on {socket} sent nothing for {timeout:?}")]
    ResponseTimeout { socket: PathBuf, timeout: Duration },

    /// The program to spawn does not exist (yet).
    #[error("executable {0} does not exist")]
    ExecutableNotFound(PathBuf),

    /// A relaunched worker never answered within the retry window.
    #[error("worker on {socket} did not become responsive within {waited:?}")]
    WorkerUnresponsive { socket: PathBuf, waited: Duration },
}

/// Successful or needs-action outcome of a step.
#[derive(Debug)]
#[must_use]
pub enum Step<T = ()> {
    Ready(T),
    NeedsAction(NeedsAction),
}

impl<T> Step<T> {
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    /// Return the ready value or `None`.
    pub fn ready(self) -> Option<T> {
        match self {
            Self::Ready(v) => Some(v),
            Self::NeedsAction(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn needs_action_has_no_ready_value() {
        let step: Step<u32> =
            Step::NeedsAction(NeedsAction::SocketUnavailable(PathBuf::from("/x.sock")));
        assert!(!step.is_ready());
        assert!(step.ready().is_none());
    }

    #[test]
    fn needs_action_messages_name_the_path() {
        let why = NeedsAction::ResponseTimeout {
            socket: PathBuf::from("/w/sockets/p.sock"),
            timeout: Duration::from_secs(2),
        };
        assert!(why.to_string().contains("/w/sockets/p.sock"));
    }
}
