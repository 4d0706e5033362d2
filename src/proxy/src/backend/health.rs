use crate::backend::DestinationKey;

use dashmap::DashMap;
use rand::Rng;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Granularity of delayed-disconnect scheduling.
pub const DISCONNECT_INTERVAL_MSECS: u64 = 100;

/// How a counted connect attempt ended. `Abandoned` covers attempts that
/// were given up before the socket reported anything (fail-fast).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Failure,
    Abandoned,
}

#[derive(Debug, Default)]
struct HealthState {
    waiting: u32,
    active: u32,
    delayed_disconnects: u32,
    disconnects_in_batch: u32,
    last_success: Option<Instant>,
    last_failure: Option<Instant>,
    disconnect_batch_start: Option<Instant>,
}

/// Shared per-destination record. All mutation goes through the mutex, so
/// concurrent proxies always observe a consistent snapshot.
#[derive(Debug)]
pub struct HealthRecord {
    key: DestinationKey,
    state: Mutex<HealthState>,
}

impl HealthRecord {
    fn new(key: DestinationKey, now: Instant) -> Self {
        Self {
            key,
            state: Mutex::new(HealthState {
                // A brand-new record must not trip fail-fast on the very
                // first attempt.
                last_success: now.checked_sub(Duration::from_secs(1)),
                ..Default::default()
            }),
        }
    }

    pub fn key(&self) -> DestinationKey {
        self.key
    }

    pub fn attempt_begin(&self) {
        let mut s = self.state.lock().unwrap();
        s.waiting += 1;
    }

    pub fn attempt_end(&self, outcome: AttemptOutcome, attempt_created: Instant) {
        self.attempt_end_at(outcome, attempt_created, Instant::now())
    }

    fn attempt_end_at(&self, outcome: AttemptOutcome, attempt_created: Instant, now: Instant) {
        let mut s = self.state.lock().unwrap();
        s.waiting = s.waiting.saturating_sub(1);
        match outcome {
            AttemptOutcome::Success => {
                s.active += 1;
                s.last_success = Some(now);
            }
            AttemptOutcome::Failure => {
                // A success since this attempt began demotes the failure to
                // an incidental one.
                if s.last_success.map_or(true, |ls| attempt_created > ls) {
                    s.last_failure = Some(now);
                }
            }
            AttemptOutcome::Abandoned => {}
        }
    }

    pub fn active_end(&self) {
        let mut s = self.state.lock().unwrap();
        s.active = s.active.saturating_sub(1);
    }

    /// The destination is considered down when failures postdate the last
    /// success by more than `window` and another probe is already in flight.
    /// A sole probe is never fast-failed so the host can recover.
    pub fn should_fail_fast(&self, window: Duration) -> bool {
        self.should_fail_fast_at(window, Instant::now())
    }

    fn should_fail_fast_at(&self, window: Duration, _now: Instant) -> bool {
        if window.is_zero() {
            return false;
        }
        let s = self.state.lock().unwrap();
        let Some(last_failure) = s.last_failure else {
            return false;
        };
        let gap = match s.last_success {
            Some(last_success) if last_failure > last_success => last_failure - last_success,
            Some(_) => return false,
            None => window + Duration::from_millis(1),
        };
        gap > window && s.waiting > 1
    }

    /// Successful connects start the disconnect batch over.
    pub fn reset_disconnect_batch(&self) {
        let mut s = self.state.lock().unwrap();
        s.disconnects_in_batch = 0;
        s.disconnect_batch_start = None;
    }

    /// How long this disconnect should wait so a mass logout against the
    /// destination spreads over `max_delay_secs` seconds. Zero disables
    /// pacing entirely.
    pub fn delay_disconnect(&self, max_delay_secs: u64) -> Duration {
        if max_delay_secs == 0 {
            return Duration::ZERO;
        }
        let jitter = rand::thread_rng().gen_range(0..DISCONNECT_INTERVAL_MSECS);
        self.delay_disconnect_at(max_delay_secs, Instant::now(), jitter)
    }

    fn delay_disconnect_at(&self, max_delay_secs: u64, now: Instant, jitter_ms: u64) -> Duration {
        let mut s = self.state.lock().unwrap();
        if s.disconnects_in_batch == 0 {
            s.disconnect_batch_start = Some(now + Duration::from_millis(jitter_ms));
        }
        s.disconnects_in_batch += 1;

        let sessions = s.active as u64 + s.delayed_disconnects as u64;
        let per_sec = (sessions / max_delay_secs).max(1);
        if (s.disconnects_in_batch as u64) <= per_sec && s.delayed_disconnects == 0 {
            // The first second's worth of disconnects goes out immediately.
            return Duration::ZERO;
        }
        s.delayed_disconnects += 1;

        let mut offset_ms = (s.disconnects_in_batch as u64) * 1000 / per_sec;
        offset_ms -= offset_ms % DISCONNECT_INTERVAL_MSECS;
        let target = s.disconnect_batch_start.unwrap_or(now) + Duration::from_millis(offset_ms);
        target.saturating_duration_since(now)
    }

    pub fn delayed_disconnect_done(&self) {
        let mut s = self.state.lock().unwrap();
        s.delayed_disconnects = s.delayed_disconnects.saturating_sub(1);
    }

    pub fn waiting_count(&self) -> u32 {
        self.state.lock().unwrap().waiting
    }

    pub fn active_count(&self) -> u32 {
        self.state.lock().unwrap().active
    }
}

/// Process-wide `(ip, port)` → [`HealthRecord`] table. Records are created
/// on first use and stay for the life of the process; handles remain valid
/// across the registry.
#[derive(Debug, Default)]
pub struct HealthRegistry {
    records: DashMap<DestinationKey, Arc<HealthRecord>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, ip: IpAddr, port: u16) -> Arc<HealthRecord> {
        let key = (ip, port);
        self.records
            .entry(key)
            .or_insert_with(|| Arc::new(HealthRecord::new(key, Instant::now())))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
