use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Wall-clock source in Unix milliseconds.
pub trait Clock {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// A clock moved explicitly, used when replaying captured traffic and in tests.
/// Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now_ms: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: Arc::new(AtomicI64::new(now_ms)),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

pub fn local_naive_from_ms(timestamp_ms: i64) -> Option<NaiveDateTime> {
    Local
        .timestamp_millis_opt(timestamp_ms)
        .single()
        .map(|timestamp| timestamp.naive_local())
}

pub fn ms_from_local_naive(local_time: NaiveDateTime) -> Option<i64> {
    Local
        .from_local_datetime(&local_time)
        .earliest()
        .map(|timestamp| timestamp.timestamp_millis())
}

pub fn utc_from_ms(timestamp_ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(timestamp_ms)
        .single()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::{local_naive_from_ms, ms_from_local_naive, Clock, ManualClock};

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::new(1_000);
        let handle = clock.clone();

        handle.advance(500);
        assert_eq!(clock.now_ms(), 1_500);

        handle.set(42);
        assert_eq!(clock.now_ms(), 42);
    }

    #[test]
    fn local_conversions_roundtrip() {
        let timestamp_ms = 1_767_607_205_000;
        let local_time = local_naive_from_ms(timestamp_ms).expect("Expected local time");
        assert_eq!(ms_from_local_naive(local_time), Some(timestamp_ms));
    }
}
