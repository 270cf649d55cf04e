//! Per-sensor rate limiting
//!
//! Fixed-window requests-per-second counters, one window per sensor ID.
//! Bursts at window boundaries are accepted; the window is the wall-clock
//! UTC second, so the first call observing a new second resets the bucket.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

type NowFn = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Default requests per second when the configured value is zero.
const DEFAULT_RPS: u32 = 50;

#[derive(Default)]
struct Windows {
    /// sensor -> last observed wall-clock second
    last_tick: HashMap<String, u64>,
    /// sensor -> requests counted in the current second
    count: HashMap<String, u32>,
}

/// Enforces per-sensor request rate limits.
///
/// `rps == 0` selects the default of 50; a negative `rps` disables
/// limiting entirely ([`allow`](Self::allow) always returns true).
pub struct PerSensorLimiter {
    /// Effective limit; 0 means disabled.
    rps: u32,
    windows: Mutex<Windows>,
    now_fn: NowFn,
}

impl PerSensorLimiter {
    /// Create a limiter allowing `rps` requests per second per sensor.
    pub fn new(rps: i64) -> Self {
        Self::with_clock(rps, || {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_secs())
        })
    }

    /// Create a limiter with an injected clock returning unix seconds.
    pub fn with_clock(rps: i64, now_fn: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        let effective = match rps {
            0 => DEFAULT_RPS,
            r if r < 0 => 0,
            r => r as u32,
        };
        Self {
            rps: effective,
            windows: Mutex::new(Windows::default()),
            now_fn: Arc::new(now_fn),
        }
    }

    /// Returns true if the sensor is within its limit; false means the
    /// caller should answer 429.
    pub fn allow(&self, sensor_id: &str) -> bool {
        if self.rps == 0 {
            return true;
        }
        let now = (self.now_fn)();
        let mut windows = self.windows.lock();
        let tick = windows.last_tick.get(sensor_id).copied();
        if tick != Some(now) {
            windows.last_tick.insert(sensor_id.to_string(), now);
            windows.count.insert(sensor_id.to_string(), 0);
        }
        let count = windows.count.entry(sensor_id.to_string()).or_insert(0);
        if *count >= self.rps {
            return false;
        }
        *count += 1;
        true
    }

    /// Suggested Retry-After value in seconds when rate limited.
    pub fn retry_after_seconds(&self) -> u64 {
        1
    }
}
