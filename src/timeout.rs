//! Pending operation timeouts

use std::sync::{OnceLock, Weak};
use std::time::{Duration, Instant};

use log::{error, trace};
use parking_lot::Mutex;

const CHECK_INTERVAL: Duration = Duration::from_millis(250);

/// A registry entry scanned periodically for expired deadlines.
pub(crate) trait PendingDeadline: Send + Sync {
    /// Handles any deadlines that expired by `now`. Returns true once the
    /// owner is finished and can be dropped from the registry.
    fn check(&self, now: Instant) -> bool;
}

/// Process-wide deadline scanner.
///
/// Connections register weakly and are swept on a dedicated thread, so
/// expiry does not depend on any async runtime staying alive.
pub(crate) struct TimeoutChecker {
    entries: Mutex<Vec<Weak<dyn PendingDeadline>>>,
}

impl TimeoutChecker {
    pub(crate) fn shared() -> &'static TimeoutChecker {
        static SHARED: OnceLock<&'static TimeoutChecker> = OnceLock::new();
        SHARED.get_or_init(|| {
            let checker: &'static TimeoutChecker = Box::leak(Box::new(TimeoutChecker {
                entries: Mutex::new(Vec::new()),
            }));
            let spawned = std::thread::Builder::new()
                .name("ldap-timeout-checker".to_owned())
                .spawn(|| loop {
                    std::thread::sleep(CHECK_INTERVAL);
                    checker.sweep(Instant::now());
                });
            if let Err(e) = spawned {
                error!("Failed to spawn the timeout checker: {}", e);
            }
            checker
        })
    }

    pub(crate) fn register(&self, entry: Weak<dyn PendingDeadline>) {
        self.entries.lock().push(entry);
    }

    fn sweep(&self, now: Instant) {
        let mut entries = self.entries.lock();
        entries.retain(|weak| match weak.upgrade() {
            Some(entry) => !entry.check(now),
            None => false,
        });
        trace!("Timeout sweep done, {} connections tracked", entries.len());
    }
}
