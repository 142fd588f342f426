//! Repeating timers bound to the agent's lifetime.
//!
//! A timer sleeps `delay_ms`, fires its callback, and repeats `count`
//! times (`0` = forever).  The delay is re-read before every sleep, so
//! `modify` takes effect after the sleep in progress.  Timers stop when
//! removed or when the agent stops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::callbacks::run_callback;

pub(crate) type TimerCallback = Arc<dyn Fn() + Send + Sync>;

struct TimerEntry {
    delay_ms: Arc<AtomicU64>,
    abort: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// All live timers of one agent.  Ids are monotonic and never reused.
#[derive(Default)]
pub(crate) struct TimerTable {
    entries: Mutex<HashMap<u64, TimerEntry>>,
    next_id: AtomicU64,
}

impl TimerTable {
    /// Spawn a timer task and return its id.  `alive` is the agent's
    /// liveness flag; the timer exits on its own once the agent stops.
    pub fn spawn(
        &self,
        count: u32,
        delay_ms: u64,
        callback: TimerCallback,
        alive: Arc<AtomicBool>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let delay = Arc::new(AtomicU64::new(delay_ms));
        let abort = Arc::new(AtomicBool::new(false));

        let task_delay = delay.clone();
        let task_abort = abort.clone();
        let handle = tokio::spawn(async move {
            let mut remaining = count;
            loop {
                let ms = task_delay.load(Ordering::Relaxed);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                if task_abort.load(Ordering::Relaxed) || !alive.load(Ordering::Relaxed) {
                    break;
                }
                run_callback("timer callback", (), || callback());
                if count != 0 {
                    remaining -= 1;
                    if remaining == 0 {
                        break;
                    }
                }
            }
            debug!(timer = id, "timer terminated");
        });

        self.entries.lock().unwrap().insert(
            id,
            TimerEntry {
                delay_ms: delay,
                abort,
                handle,
            },
        );
        id
    }

    /// Change a timer's delay; effective after the sleep in progress.
    pub fn modify(&self, id: u64, delay_ms: u64) -> bool {
        match self.entries.lock().unwrap().get(&id) {
            Some(entry) => {
                entry.delay_ms.store(delay_ms, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Stop and forget a timer.
    pub fn remove(&self, id: u64) -> bool {
        match self.entries.lock().unwrap().remove(&id) {
            Some(entry) => {
                entry.abort.store(true, Ordering::Relaxed);
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Stop every timer; used on agent shutdown.
    pub fn clear(&self) {
        for (_, entry) in self.entries.lock().unwrap().drain() {
            entry.abort.store(true, Ordering::Relaxed);
            entry.handle.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
