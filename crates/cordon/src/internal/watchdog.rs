use std::{
    collections::BTreeMap,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use parking_lot::{Condvar, Mutex};

use crate::internal::core::{InterruptCause, InterruptState};

/// Shared state behind the process-wide deadline clock.
struct WatchdogShared {
    deadlines: Mutex<BTreeMap<(Instant, u64), Arc<InterruptState>>>,
    changed: Condvar,
    next_id: AtomicU64,
}

/// Process-wide deadline clock for run timeouts.
///
/// A single background thread tracks every registered deadline and flags the
/// associated interrupt when it passes. Cancellation stays cooperative: the
/// flag is observed at the evaluator's suspension points, the clock never
/// preempts a run mid-operation.
pub(crate) struct Watchdog {
    shared: Arc<WatchdogShared>,
}

/// Keeps a deadline armed. Dropping it disarms the deadline.
pub(crate) struct DeadlineGuard {
    key: (Instant, u64),
    shared: Arc<WatchdogShared>,
}

impl Watchdog {
    fn new() -> std::io::Result<Self> {
        let shared = Arc::new(WatchdogShared {
            deadlines: Mutex::new(BTreeMap::new()),
            changed: Condvar::new(),
            next_id: AtomicU64::new(1),
        });

        let shared_bg = Arc::clone(&shared);
        std::thread::Builder::new()
            .name("cordon-watchdog".to_string())
            .spawn(move || watchdog_loop(&shared_bg))?;

        Ok(Self { shared })
    }

    pub fn register(&self, deadline: Instant, interrupt: Arc<InterruptState>) -> DeadlineGuard {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let key = (deadline, id);
        let mut deadlines = self.shared.deadlines.lock();
        deadlines.insert(key, interrupt);
        drop(deadlines);
        self.shared.changed.notify_one();

        DeadlineGuard {
            key,
            shared: Arc::clone(&self.shared),
        }
    }
}

fn watchdog_loop(shared: &WatchdogShared) {
    let mut deadlines = shared.deadlines.lock();
    loop {
        let now = Instant::now();
        while let Some((&key, _)) = deadlines.first_key_value() {
            if key.0 > now {
                break;
            }
            if let Some(interrupt) = deadlines.remove(&key) {
                interrupt.trigger(InterruptCause::Timeout);
            }
        }

        match deadlines.first_key_value() {
            Some((&(next, _), _)) => {
                let _ = shared.changed.wait_until(&mut deadlines, next);
            }
            None => shared.changed.wait(&mut deadlines),
        }
    }
}

impl Drop for DeadlineGuard {
    fn drop(&mut self) {
        let mut deadlines = self.shared.deadlines.lock();
        deadlines.remove(&self.key);
    }
}

pub(crate) fn global_watchdog() -> std::io::Result<&'static Watchdog> {
    static GLOBAL_WATCHDOG: OnceLock<
        core::result::Result<Watchdog, (std::io::ErrorKind, String)>,
    > = OnceLock::new();

    let watchdog =
        GLOBAL_WATCHDOG.get_or_init(|| Watchdog::new().map_err(|e| (e.kind(), e.to_string())));
    match watchdog {
        Ok(watchdog) => Ok(watchdog),
        Err((kind, message)) => Err(std::io::Error::new(*kind, message.clone())),
    }
}
