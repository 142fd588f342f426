//! Public error taxonomy of the agent runtime.

use ivy_wire::BusError;

#[derive(Debug, thiserror::Error)]
pub enum IvyError {
    /// `start` called on a running agent.
    #[error("agent is already running")]
    AlreadyRunning,

    /// `stop` (or another lifecycle call) on a stopped agent.
    #[error("agent is not running")]
    NotRunning,

    /// `unbind_msg` for an id we never handed out or already removed.
    #[error("no subscription with id {0}")]
    UnknownSubscription(u32),

    /// Timer API call for a dead or unknown timer id.
    #[error("no timer with id {0}")]
    UnknownTimer(u64),

    /// A peer for that address (or announced agent id) already exists.
    #[error("peer already registered: {0}")]
    DuplicatePeer(String),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
