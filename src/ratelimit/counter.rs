//! In-process fixed-window counter.
//!
//! Used whenever the shared store is unconfigured or unreachable. Limits are enforced per
//! process rather than globally.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::backend::CounterBackend;
use super::clock::{Clock, SystemClock};
use super::decision::{BackendKind, Decision};
use super::identifier::Identifier;
use super::policy::{Category, RateLimitPolicy};
use crate::error::Result;

/// Per-key window state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterEntry {
    /// Requests seen in the current window
    pub count: u64,
    /// When the current window ends
    pub window_reset_at: DateTime<Utc>,
}

impl CounterEntry {
    fn start(now: DateTime<Utc>, window_seconds: u64) -> Self {
        Self {
            count: 1,
            window_reset_at: now + window_delta(window_seconds),
        }
    }

    /// An entry is expired once its reset time has been reached.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.window_reset_at
    }
}

fn window_delta(window_seconds: u64) -> chrono::Duration {
    chrono::Duration::seconds(window_seconds.min(u32::MAX as u64) as i64)
}

/// Composite key used by the local counter, `category:identifier`.
pub fn local_key(category: Category, identifier: &Identifier) -> String {
    format!("{}:{}", category, identifier)
}

/// A concurrent map of fixed-window counters with an optional background sweeper.
///
/// Checks on the same key are serialized by the map's shard lock, so increments are
/// never lost. Checks on keys in different shards proceed in parallel.
pub struct LocalCounter {
    entries: DashMap<String, CounterEntry>,
    clock: Arc<dyn Clock>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl LocalCounter {
    /// Create a counter on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a counter with a custom clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            sweeper: Mutex::new(None),
        }
    }

    /// Count one request for `key` and decide admission.
    pub fn check(&self, key: &str, limit: u64, window_seconds: u64) -> Decision {
        let now = self.clock.now();

        let (count, window_reset_at) = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.is_expired(now) {
                    *entry = CounterEntry::start(now, window_seconds);
                    debug!(key = %key, limit, "Window expired, starting a new one");
                } else {
                    entry.count += 1;
                }
                (entry.count, entry.window_reset_at)
            }
            Entry::Vacant(vacant) => {
                let entry = vacant.insert(CounterEntry::start(now, window_seconds));
                debug!(key = %key, limit, window_seconds, "Creating new local counter");
                (entry.count, entry.window_reset_at)
            }
        };

        trace!(key = %key, count, limit, "Local counter incremented");

        Decision::from_count(count, limit, window_reset_at, BackendKind::Local)
    }

    /// Remove every entry whose window has ended. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Start the periodic sweeper on the current tokio runtime.
    ///
    /// Returns `false` if no runtime is available. Calling this while a sweeper is already
    /// running is a no-op.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> bool {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("No tokio runtime available, local counter sweeper not started");
                return false;
            }
        };

        let mut slot = self.sweeper.lock();
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return true;
        }

        let counter = Arc::downgrade(self);
        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(counter) = counter.upgrade() else {
                    break;
                };
                let evicted = counter.sweep();
                if evicted > 0 {
                    debug!(evicted, live = counter.len(), "Swept expired local counters");
                }
            }
        });

        info!(interval_secs = interval.as_secs_f64(), "Local counter sweeper started");
        *slot = Some(handle);
        true
    }

    /// Start the sweeper unless it is already running.
    ///
    /// A sweeper whose runtime has shut down counts as stopped and is spawned again on the
    /// current runtime.
    pub fn ensure_sweeper(self: &Arc<Self>, interval: Duration) {
        if !self.is_sweeping() {
            self.start_sweeper(interval);
        }
    }

    /// Whether the sweeper task is running.
    pub fn is_sweeping(&self) -> bool {
        self.sweeper
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Clear all counters, leaving the sweeper running.
    pub fn reset(&self) {
        self.entries.clear();
    }

    /// Stop the sweeper and clear all counters.
    pub fn destroy(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
            info!("Local counter sweeper stopped");
        }
        self.entries.clear();
    }

    /// The live entry for a key, if any.
    pub fn entry(&self, key: &str) -> Option<CounterEntry> {
        self.entries.get(key).map(|e| *e)
    }

    /// Number of tracked keys, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no keys are tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for LocalCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LocalCounter {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl CounterBackend for LocalCounter {
    async fn hit(&self, policy: &RateLimitPolicy, identifier: &Identifier) -> Result<Decision> {
        let key = local_key(policy.category, identifier);
        Ok(self.check(&key, policy.limit, policy.window_seconds))
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }
}
