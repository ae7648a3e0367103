//! Lock-delay tracking.
//!
//! When a session holding a lock is invalidated, the lock cannot be taken
//! again until its delay expires. Expirations live only in memory; they are
//! not part of snapshots.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Default)]
pub(crate) struct Delay {
    expirations: Mutex<HashMap<String, Instant>>,
}

impl Delay {
    /// The instant before which `key` must not be locked, if still pending.
    pub fn get_expiration(&self, key: &str) -> Option<Instant> {
        let mut expirations = self.expirations.lock();
        match expirations.get(key) {
            Some(at) if *at > Instant::now() => Some(*at),
            Some(_) => {
                expirations.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn set_expiration(&self, key: &str, now: Instant, delay: Duration) {
        let at = now + delay;
        let mut expirations = self.expirations.lock();
        expirations.retain(|_, t| *t > now);
        let slot = expirations.entry(key.to_string()).or_insert(at);
        if *slot < at {
            *slot = at;
        }
    }
}
