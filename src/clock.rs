//! Wall-clock access.
//!
//! This node does not discipline the system clock — it only reads it.
//! `read_clock` returns a raw NTP 64-bit fixed-point timestamp (32.32,
//! seconds since 1900-01-01) with synthetic jitter injected below the
//! caller's claimed precision floor, so a remote observer cannot infer
//! more about the local clock's internal state than the precision field
//! already discloses.

use rand::RngCore;
use std::time::{SystemTime, UNIX_EPOCH};

/// Difference between the NTP epoch (1900-01-01) and the Unix epoch
/// (1970-01-01), in seconds.
pub const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// Source of wall-clock time, abstracted so tests can inject a fixed
/// clock instead of reading the real system time.
pub trait Clock: Send + Sync {
    /// Seconds since the Unix epoch, as a float with sub-second precision.
    fn unix_time(&self) -> f64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl SystemClock {
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    fn precise_unix_time() -> f64 {
        use libc::{clock_gettime, timespec, CLOCK_REALTIME};
        use std::mem::MaybeUninit;

        unsafe {
            let mut ts = MaybeUninit::<timespec>::uninit();
            if clock_gettime(CLOCK_REALTIME, ts.as_mut_ptr()) == 0 {
                let ts = ts.assume_init();
                ts.tv_sec as f64 + ts.tv_nsec as f64 / 1e9
            } else {
                Self::fallback_unix_time()
            }
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    fn precise_unix_time() -> f64 {
        Self::fallback_unix_time()
    }

    fn fallback_unix_time() -> f64 {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before Unix epoch");
        d.as_secs_f64()
    }
}

impl Clock for SystemClock {
    fn unix_time(&self) -> f64 {
        Self::precise_unix_time()
    }
}

/// Read the clock and encode it as a 64-bit NTP fixed-point timestamp,
/// jittering away any bits finer than `precision` (log2 seconds, e.g.
/// -20 for ~1µs). Mirrors the read_clock() contract every client and
/// server call site uses to timestamp wire events.
pub fn read_clock(precision: i8) -> u64 {
    read_clock_with(&SystemClock, precision)
}

pub fn read_clock_with<C: Clock + ?Sized>(clock: &C, precision: i8) -> u64 {
    let ntp_seconds = clock.unix_time() + NTP_UNIX_OFFSET as f64;
    let fixed = (ntp_seconds * (1u64 << 32) as f64) as u64;

    let jitter_bits = (32 + precision as i32).clamp(0, 64) as u32;
    let mask: u64 = if jitter_bits >= 64 {
        u64::MAX
    } else {
        (1u64 << jitter_bits) - 1
    };

    let jitter = rand::thread_rng().next_u64() & mask;
    fixed ^ jitter
}
