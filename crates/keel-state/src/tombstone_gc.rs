//! Tombstone garbage collection scheduling.
//!
//! `TombstoneGc` does not touch the store. It tracks which indexes have
//! tombstones waiting to expire and, once their TTL passes, emits the
//! highest expired index on a channel. The consensus layer turns each
//! emitted index into a replicated `reap_tombstones` write, so every
//! replica reaps at the same log position.
//!
//! Hints are bucketed by `granularity` so a burst of deletes produces one
//! expiration instead of one per key.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use keel_core::GcConfig;

struct GcState {
    enabled: bool,
    /// Bucket deadline (offset from `epoch`) → highest index hinted into it.
    expires: BTreeMap<Duration, u64>,
}

/// Cloneable handle; all clones share one schedule.
#[derive(Clone)]
pub struct TombstoneGc {
    ttl: Duration,
    granularity: Duration,
    epoch: Instant,
    state: Arc<Mutex<GcState>>,
    expire_tx: mpsc::UnboundedSender<u64>,
}

impl TombstoneGc {
    /// Create a collector and the receiver its expirations are sent to.
    pub fn new(ttl: Duration, granularity: Duration) -> (Self, mpsc::UnboundedReceiver<u64>) {
        let (expire_tx, expire_rx) = mpsc::unbounded_channel();
        let gc = Self {
            ttl,
            granularity: granularity.max(Duration::from_millis(1)),
            epoch: Instant::now(),
            state: Arc::new(Mutex::new(GcState {
                enabled: true,
                expires: BTreeMap::new(),
            })),
            expire_tx,
        };
        (gc, expire_rx)
    }

    pub fn from_config(config: &GcConfig) -> (Self, mpsc::UnboundedReceiver<u64>) {
        let (gc, rx) = Self::new(config.ttl(), config.granularity());
        gc.set_enabled(config.enabled);
        (gc, rx)
    }

    /// Enable or disable collection. Disabling forgets every pending hint;
    /// only the leader should be collecting.
    pub fn set_enabled(&self, enabled: bool) {
        let mut state = self.state.lock();
        if !enabled {
            state.expires.clear();
        }
        state.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    /// Note that tombstones exist at `index`.
    pub fn hint(&self, index: u64) {
        self.hint_at(Instant::now(), index);
    }

    pub(crate) fn hint_at(&self, now: Instant, index: u64) {
        let mut state = self.state.lock();
        if !state.enabled {
            return;
        }
        let offset = now.saturating_duration_since(self.epoch).saturating_add(self.ttl);
        let deadline = self.bucket(offset);
        let slot = state.expires.entry(deadline).or_insert(index);
        if index > *slot {
            *slot = index;
        }
    }

    /// True while at least one bucket is waiting to expire.
    pub fn pending_expiration(&self) -> bool {
        !self.state.lock().expires.is_empty()
    }

    /// Emit every bucket whose deadline is at or before `now`. Returns the
    /// indexes sent, in deadline order.
    pub(crate) fn expire_due(&self, now: Instant) -> Vec<u64> {
        let elapsed = now.saturating_duration_since(self.epoch);
        let due: Vec<u64> = {
            let mut state = self.state.lock();
            let later = state.expires.split_off(&(elapsed + Duration::from_nanos(1)));
            std::mem::replace(&mut state.expires, later)
                .into_values()
                .collect()
        };
        for index in &due {
            debug!(index, "tombstones expired");
            let _ = self.expire_tx.send(*index);
        }
        due
    }

    /// Check for expirations every `granularity` until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(ttl = ?self.ttl, granularity = ?self.granularity, "tombstone gc started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.granularity) => {
                    self.expire_due(Instant::now());
                }
                _ = shutdown.changed() => {
                    debug!("tombstone gc shutting down");
                    break;
                }
            }
        }
    }

    /// Round an offset up to the next multiple of the granularity, saturating
    /// at `Duration::MAX`.
    fn bucket(&self, offset: Duration) -> Duration {
        const NANOS_PER_SEC: u128 = 1_000_000_000;
        let g = self.granularity.as_nanos();
        let n = offset.as_nanos().div_ceil(g) * g;
        u64::try_from(n / NANOS_PER_SEC)
            .map(|secs| Duration::new(secs, (n % NANOS_PER_SEC) as u32))
            .unwrap_or(Duration::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hints_in_one_bucket_coalesce() {
        let (gc, mut rx) = TombstoneGc::new(Duration::from_secs(10), Duration::from_secs(5));
        let now = Instant::now();
        gc.hint_at(now, 100);
        gc.hint_at(now, 105);
        gc.hint_at(now, 103);
        assert!(gc.pending_expiration());

        assert!(gc.expire_due(now).is_empty());
        let due = gc.expire_due(now + Duration::from_secs(20));
        assert_eq!(due, vec![105]);
        assert_eq!(rx.try_recv().unwrap(), 105);
        assert!(!gc.pending_expiration());
    }

    #[test]
    fn separate_buckets_expire_in_order() {
        let (gc, _rx) = TombstoneGc::new(Duration::from_secs(10), Duration::from_secs(1));
        let now = Instant::now();
        gc.hint_at(now, 1);
        gc.hint_at(now + Duration::from_secs(3), 2);

        assert_eq!(gc.expire_due(now + Duration::from_secs(12)), vec![1]);
        assert_eq!(gc.expire_due(now + Duration::from_secs(15)), vec![2]);
    }

    #[test]
    fn huge_ttl_never_expires_early() {
        let ttl = Duration::from_secs(600 * 365 * 24 * 3600);
        let (gc, _rx) = TombstoneGc::new(ttl, Duration::from_secs(30));
        let now = Instant::now();
        gc.hint_at(now, 9);
        assert!(gc.expire_due(now + Duration::from_secs(3600)).is_empty());
        assert!(gc.pending_expiration());

        let (gc, _rx) = TombstoneGc::new(Duration::MAX, Duration::from_secs(30));
        gc.hint_at(now, 10);
        assert!(gc.expire_due(now + Duration::from_secs(3600)).is_empty());
        assert!(gc.pending_expiration());
    }

    #[test]
    fn disabling_drops_pending_hints() {
        let (gc, _rx) = TombstoneGc::new(Duration::from_secs(1), Duration::from_secs(1));
        gc.hint(7);
        assert!(gc.pending_expiration());
        gc.set_enabled(false);
        assert!(!gc.pending_expiration());
        gc.hint(8);
        assert!(!gc.pending_expiration());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (gc, _rx) = TombstoneGc::new(Duration::from_secs(60), Duration::from_millis(5));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(gc.run(rx));
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
