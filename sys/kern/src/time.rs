// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel time: the monotonic tick counter and its interrupt hook.
//!
//! The tick timer is only good for periodic interrupts -- its counter is
//! small and counts down -- so each interrupt advances the `TICKS` global,
//! which is the real kernel timestamp. `TICKS` is a pair of `AtomicU32`
//! because we want interior mutability but ARMv7-M has no 64-bit atomic
//! operations; the tick interrupt cannot preempt kernel code that reads
//! it, so the split is fine.
//!
//! After the increment, the interrupt invokes a single optional hook.
//! The scheduler installs its tick callback here at boot and removes it
//! at shutdown.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// In-kernel timestamp, measured in ticks since the counter was started.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
#[repr(transparent)]
pub struct Ticks(u64);

impl Ticks {
    pub const ZERO: Self = Ticks(0);

    /// Also serves as the "wait forever" deadline: it compares greater
    /// than any reachable timestamp.
    pub const MAX: Self = Ticks(u64::MAX);

    /// Deadline `count` ticks after `self`, pinned to `MAX` on overflow
    /// so a huge timeout degrades into "forever".
    pub fn saturating_add(self, count: u64) -> Self {
        Ticks(self.0.saturating_add(count))
    }

    /// Whole ticks from `earlier` to `self`.
    pub fn since(self, earlier: Ticks) -> u64 {
        self.0 - earlier.0
    }
}

impl From<u64> for Ticks {
    fn from(v: u64) -> Self {
        Ticks(v)
    }
}

impl From<Ticks> for u64 {
    fn from(v: Ticks) -> Self {
        v.0
    }
}

/// Kernel timestamp storage. `TICKS[0]` is the least significant half.
static TICKS: [AtomicU32; 2] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const ZERO: AtomicU32 = AtomicU32::new(0);
    [ZERO; 2]
};

/// Tick period in microseconds. Defaults to one millisecond.
static TICK_PERIOD_US: AtomicU32 = AtomicU32::new(1000);

/// The optional tick hook, stored as the address of a `fn(Ticks)`; zero
/// means no hook. See `set_hook`.
static TICK_HOOK: AtomicUsize = AtomicUsize::new(0);

pub type TickHook = fn(Ticks);

/// Reads the tick counter.
pub fn now() -> Ticks {
    // The tick interrupt cannot preempt kernel code, so reading in two
    // non-atomic parts is fine.
    let lo = TICKS[0].load(Ordering::Relaxed);
    let hi = TICKS[1].load(Ordering::Relaxed);
    Ticks(u64::from(lo) | u64::from(hi) << 32)
}

/// Advances kernel time by one tick and runs the hook. Called from the
/// tick interrupt handler (and from the hosted test harness standing in
/// for it).
pub(crate) fn on_tick() {
    let lo = TICKS[0].load(Ordering::Relaxed);
    if let Some(lo) = lo.checked_add(1) {
        TICKS[0].store(lo, Ordering::Relaxed);
    } else {
        // Low half rolled over. Checked addition on the high half: an
        // overflow there means state corruption we'd like to discover.
        TICKS[0].store(0, Ordering::Relaxed);
        let hi = TICKS[1].load(Ordering::Relaxed);
        TICKS[1].store(hi.checked_add(1).unwrap(), Ordering::Relaxed);
    }

    let hook = TICK_HOOK.load(Ordering::Relaxed);
    if hook != 0 {
        // Safety: the only writers of TICK_HOOK store addresses of
        // `fn(Ticks)` items (or zero), so the transmute recovers exactly
        // what was stored.
        let hook: TickHook = unsafe { core::mem::transmute(hook) };
        hook(now());
    }
}

/// Installs or removes the tick hook.
pub(crate) fn set_hook(hook: Option<TickHook>) {
    TICK_HOOK.store(hook.map_or(0, |f| f as usize), Ordering::Relaxed);
}

pub(crate) fn hook_installed() -> bool {
    TICK_HOOK.load(Ordering::Relaxed) != 0
}

/// Configures the tick period in microseconds and starts the tick timer.
///
/// The reload value is derived from the registered core clock, so
/// `arch::set_clock_freq` must have happened first.
pub fn set_period_us(us: u32) {
    TICK_PERIOD_US.store(us, Ordering::Relaxed);
    let clock_hz = crate::arch::clock_freq_khz() as u64 * 1000;
    let reload = clock_hz * us as u64 / 1_000_000;
    crate::arch::start_tick_timer(reload as u32);
}

/// Configures the tick period in milliseconds and starts the tick timer.
pub fn set_period_ms(ms: u32) {
    set_period_us(ms * 1000);
}

pub fn period_us() -> u32 {
    TICK_PERIOD_US.load(Ordering::Relaxed)
}

/// Test hook: advance kernel time as the tick interrupt would.
#[cfg(not(target_os = "none"))]
pub fn advance(ticks: u64) {
    for _ in 0..ticks {
        on_tick();
    }
}

/// Test hook: put kernel time back in its reset state.
#[cfg(not(target_os = "none"))]
pub fn reset() {
    TICKS[0].store(0, Ordering::Relaxed);
    TICKS[1].store(0, Ordering::Relaxed);
    TICK_PERIOD_US.store(1000, Ordering::Relaxed);
    TICK_HOOK.store(0, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn ticks_advance_and_compose() {
        let _world = testutil::fresh_world();
        assert_eq!(now(), Ticks::ZERO);
        advance(3);
        assert_eq!(u64::from(now()), 3);
    }

    #[test]
    fn low_half_rollover_carries() {
        let _world = testutil::fresh_world();
        TICKS[0].store(u32::MAX, Ordering::Relaxed);
        advance(1);
        assert_eq!(u64::from(now()), 1 << 32);
        advance(1);
        assert_eq!(u64::from(now()), (1 << 32) + 1);
    }

    #[test]
    fn hook_runs_after_increment() {
        use std::sync::atomic::AtomicU64;
        static SEEN: AtomicU64 = AtomicU64::new(0);

        fn hook(now: Ticks) {
            SEEN.store(u64::from(now), Ordering::Relaxed);
        }

        let _world = testutil::fresh_world();
        SEEN.store(0, Ordering::Relaxed);
        set_hook(Some(hook));
        advance(5);
        // The hook observes the already-incremented counter.
        assert_eq!(SEEN.load(Ordering::Relaxed), 5);
        set_hook(None);
        advance(1);
        assert_eq!(SEEN.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn forever_outcompares_everything() {
        assert!(Ticks::MAX > Ticks::from(u64::MAX - 1));
        assert_eq!(Ticks::from(10).saturating_add(u64::MAX), Ticks::MAX);
    }
}
