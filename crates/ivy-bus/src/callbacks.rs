//! Application callback slots and the panic-absorbing invocation wrapper.
//!
//! A misbehaving callback must never take a handler task down with it, so
//! every invocation goes through [`run_callback`], which catches panics and
//! logs them.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::error;

use crate::peer::Peer;

/// Connection lifecycle events delivered to the application callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplicationEvent {
    Connected,
    Disconnected,
}

/// A peer added or removed one of its subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegexpEvent {
    Added,
    Removed,
}

/// Verdict of the die callback.  Anything but `ShouldNotDie` shuts the
/// agent down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DieAction {
    Die,
    ShouldNotDie,
}

pub type AppCallback = Arc<dyn Fn(&Arc<Peer>, ApplicationEvent) + Send + Sync>;
pub type DieCallback = Arc<dyn Fn(&Arc<Peer>, i64) -> DieAction + Send + Sync>;
pub type DirectMsgCallback = Arc<dyn Fn(&Arc<Peer>, i64, &str) + Send + Sync>;
pub type RegexpChangeCallback = Arc<dyn Fn(&Arc<Peer>, RegexpEvent, i64, &str) + Send + Sync>;
pub type PongCallback = Arc<dyn Fn(&Arc<Peer>, Duration) + Send + Sync>;

/// Callback bound to one of our subscriptions: invoked with the sending
/// peer and one string per capture group.
pub type MsgCallback = Arc<dyn Fn(&Arc<Peer>, &[String]) + Send + Sync>;

/// The registered callback slots, each settable at any time.
#[derive(Default)]
pub(crate) struct CallbackSlots {
    pub app: RwLock<Option<AppCallback>>,
    pub die: RwLock<Option<DieCallback>>,
    pub direct: RwLock<Option<DirectMsgCallback>>,
    pub regexp_change: RwLock<Option<RegexpChangeCallback>>,
    pub pong: RwLock<Option<PongCallback>>,
}

impl CallbackSlots {
    pub fn app(&self) -> Option<AppCallback> {
        self.app.read().unwrap().clone()
    }

    pub fn die(&self) -> Option<DieCallback> {
        self.die.read().unwrap().clone()
    }

    pub fn direct(&self) -> Option<DirectMsgCallback> {
        self.direct.read().unwrap().clone()
    }

    pub fn regexp_change(&self) -> Option<RegexpChangeCallback> {
        self.regexp_change.read().unwrap().clone()
    }

    pub fn pong(&self) -> Option<PongCallback> {
        self.pong.read().unwrap().clone()
    }
}

/// Invoke a callback, absorbing any panic it raises.  Returns the callback
/// result, or `on_panic` if it panicked.
pub(crate) fn run_callback<T>(
    description: &str,
    on_panic: T,
    f: impl FnOnce() -> T,
) -> T {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(_) => {
            error!(callback = description, "callback panicked");
            on_panic
        }
    }
}
