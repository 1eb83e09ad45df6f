// SPDX-License-Identifier: GPL-3.0-only

//! Clock helpers: MSC comparisons, target adjustment and the emulated clock
//! used whenever no backend can report a real one.

use super::PresentOptions;
use smithay::utils::{Clock, Monotonic};
use std::time::Duration;

/// A (UST, MSC) sample. UST is in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UstMsc {
    pub ust: u64,
    pub msc: u64,
}

impl UstMsc {
    pub fn new(ust: u64, msc: u64) -> Self {
        Self { ust, msc }
    }
}

/// `a` is strictly after `b`, tolerating counter wrap-around
pub fn msc_is_after(a: u64, b: u64) -> bool {
    (a.wrapping_sub(b) as i64) > 0
}

pub fn msc_is_equal_or_after(a: u64, b: u64) -> bool {
    (a.wrapping_sub(b) as i64) >= 0
}

/// Pick the MSC a request should execute at.
///
/// A target that is still ahead of `crtc_msc` is kept as is. A target that has
/// already passed is moved to the next MSC satisfying
/// `msc % divisor == remainder`, or to the next frame when `divisor` is zero.
/// Asynchronous requests may land on the current MSC.
pub fn adjust_timings(
    options: PresentOptions,
    crtc_msc: u64,
    target_msc: u64,
    divisor: u64,
    remainder: u64,
) -> u64 {
    if !msc_is_equal_or_after(crtc_msc, target_msc) {
        return target_msc;
    }

    let is_async = options.contains(PresentOptions::ASYNC);
    if divisor == 0 {
        return if is_async {
            crtc_msc
        } else {
            crtc_msc.wrapping_add(1)
        };
    }

    let mut target = crtc_msc
        .wrapping_sub(crtc_msc % divisor)
        .wrapping_add(remainder);
    let behind = if is_async {
        msc_is_after(crtc_msc, target)
    } else {
        msc_is_equal_or_after(crtc_msc, target)
    };
    if behind {
        target = target.wrapping_add(divisor);
    }
    target
}

/// Current monotonic time in microseconds
pub fn ust_now(clock: &Clock<Monotonic>) -> u64 {
    Duration::from(clock.now()).as_micros() as u64
}

/// Monotonic frame counter derived from the system clock
#[derive(Debug)]
pub struct FakeClock {
    clock: Clock<Monotonic>,
    interval: Duration,
}

impl FakeClock {
    pub fn new(interval: Duration) -> Self {
        Self {
            clock: Clock::new(),
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn ust_msc(&self) -> UstMsc {
        let ust = ust_now(&self.clock);
        let interval = (self.interval.as_micros() as u64).max(1);
        UstMsc::new(ust, (ust + interval / 2) / interval)
    }
}
