//! One-shot timer service and clocks
//!
//! Nothing in the router blocks. Every wait is an armed timer that the owner
//! polls with the current time; a timer fires at most once per arm.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Identifies an armed timer. Zero never names a live timer.
pub type TimerId = u32;

/// Seconds between the unix epoch and 1990-01-01, the PakBus time base.
pub const PAKBUS_EPOCH_OFFSET_SECS: u64 = 631_152_000;

/// Time source for the router
pub trait Clock: Send + Sync {
    /// Monotonic milliseconds
    fn now_msec(&self) -> u64;

    /// Wall clock as (seconds since 1990, nanoseconds)
    fn wall_time(&self) -> (u32, u32);
}

/// Clock backed by `Instant` and `SystemTime`
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_msec(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn wall_time(&self) -> (u32, u32) {
        let since_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let secs = since_unix.as_secs().saturating_sub(PAKBUS_EPOCH_OFFSET_SECS);
        (secs as u32, since_unix.subsec_nanos())
    }
}

/// Manually advanced clock for simulations and tests
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_msec: u64) -> Self {
        Self {
            now: AtomicU64::new(start_msec),
        }
    }

    /// Move time forward
    pub fn advance(&self, msec: u64) {
        self.now.fetch_add(msec, Ordering::SeqCst);
    }

    pub fn set(&self, msec: u64) {
        self.now.store(msec, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_msec(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn wall_time(&self) -> (u32, u32) {
        let now = self.now_msec();
        ((now / 1000) as u32, ((now % 1000) * 1_000_000) as u32)
    }
}

#[derive(Debug, Clone)]
struct Armed<C> {
    client: C,
    base: u64,
    delay: u64,
}

impl<C> Armed<C> {
    fn deadline(&self) -> u64 {
        self.base.saturating_add(self.delay)
    }
}

/// Shared one-shot timer service
///
/// `C` tags the client that should be told when the timer fires.
#[derive(Debug)]
pub struct OneShot<C> {
    next_id: TimerId,
    timers: BTreeMap<TimerId, Armed<C>>,
}

impl<C: Clone> OneShot<C> {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            timers: BTreeMap::new(),
        }
    }

    /// Arm a timer that fires `delay_msec` after `now`.
    pub fn arm(&mut self, client: C, now: u64, delay_msec: u32) -> TimerId {
        let mut id = self.next_id;
        while id == 0 || self.timers.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        self.next_id = id.wrapping_add(1);
        self.timers.insert(
            id,
            Armed {
                client,
                base: now,
                delay: delay_msec as u64,
            },
        );
        id
    }

    /// Disarm the timer and clear the caller's handle. Unknown ids are ignored.
    pub fn disarm(&mut self, id: &mut TimerId) {
        if *id != 0 {
            self.timers.remove(id);
            *id = 0;
        }
    }

    /// Restart an armed timer with its original delay. Returns false if it is not armed.
    pub fn reset(&mut self, id: TimerId, now: u64) -> bool {
        match self.timers.get_mut(&id) {
            Some(armed) => {
                armed.base = now;
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self, id: TimerId) -> bool {
        id != 0 && self.timers.contains_key(&id)
    }

    pub fn armed_count(&self) -> usize {
        self.timers.len()
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<u64> {
        self.timers.values().map(Armed::deadline).min()
    }

    /// Remove and return every timer due at `now`, earliest deadline first.
    pub fn expired(&mut self, now: u64) -> Vec<(TimerId, C)> {
        let mut due: Vec<(u64, TimerId)> = self
            .timers
            .iter()
            .filter(|(_, armed)| armed.deadline() <= now)
            .map(|(id, armed)| (armed.deadline(), *id))
            .collect();
        due.sort();
        due.into_iter()
            .filter_map(|(_, id)| self.timers.remove(&id).map(|armed| (id, armed.client)))
            .collect()
    }
}

impl<C: Clone> Default for OneShot<C> {
    fn default() -> Self {
        Self::new()
    }
}
