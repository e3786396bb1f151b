//! Time and identifier sources.
//!
//! # Purpose
//! Every deadline in the console (session idle/absolute expiry, transaction
//! leases, cookie staleness) is computed against a [`Clock`] so tests can move
//! time deterministically with [`ManualClock`].
//!
//! # Notes
//! Monotonic time (`Instant`) drives deadlines; wall time (unix seconds) is
//! only used for `issued_at` stamps that travel inside cookies.
use rand::RngCore;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync + Debug {
    /// Monotonic "now" used for all in-process deadlines.
    fn now(&self) -> Instant;
    /// Wall-clock seconds since the unix epoch.
    fn unix_seconds(&self) -> u64;
}

pub type SharedClock = Arc<dyn Clock>;

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn unix_seconds(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to.
///
/// Both the monotonic and the wall reading advance together, so a cookie
/// sealed "two hours ago" and a session idle for two hours agree.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    base_unix: u64,
    offset_ms: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            base_unix: SystemClock.unix_seconds(),
            offset_ms: AtomicU64::new(0),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.offset_ms
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    fn offset(&self) -> Duration {
        Duration::from_millis(self.offset_ms.load(Ordering::SeqCst))
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.offset()
    }

    fn unix_seconds(&self) -> u64 {
        self.base_unix + self.offset().as_secs()
    }
}

/// Fill a fixed-size buffer from the OS-seeded thread RNG.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Unguessable 128-bit identifier, hex encoded.
///
/// Used for session ids, transaction ids and cookie nonces.
pub fn new_id() -> String {
    hex::encode(random_bytes::<16>())
}

/// Short prefix of an identifier, safe to put in logs.
pub fn log_prefix(id: &str) -> &str {
    let end = id
        .char_indices()
        .nth(8)
        .map(|(index, _)| index)
        .unwrap_or(id.len());
    &id[..end]
}
