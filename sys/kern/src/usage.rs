// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! CPU and memory usage accounting.
//!
//! Each task (and the kernel itself) carries a pair of meters. The
//! "current" set accumulates across context switches; when kernel time
//! crosses the measurement-window boundary, the scheduler freezes
//! "current" into "last" for every live task and starts a new window, so
//! readers always see one complete, coherent period.
//!
//! CPU usage is expressed as a fraction of the window. The
//! cycles-per-window calibration is recomputed from the *actual* elapsed
//! window, the registered core clock, and the configured tick period, so
//! the fraction stays honest under scheduling jitter and non-default tick
//! rates.

use crate::time::Ticks;

/// Per-window CPU meter: cycles consumed and times dispatched.
#[derive(Debug)]
pub struct CpuUsage {
    cur_cycles: u64,
    cur_switches: u32,
    last_cycles: u64,
    last_switches: u32,
    last_usage: f32,
}

impl CpuUsage {
    pub const fn new() -> Self {
        CpuUsage {
            cur_cycles: 0,
            cur_switches: 0,
            last_cycles: 0,
            last_switches: 0,
            last_usage: 0.0,
        }
    }

    /// Adds one scheduling's worth of consumed cycles.
    pub(crate) fn record(&mut self, cycles: u64) {
        self.cur_cycles += cycles;
        self.cur_switches += 1;
    }

    /// Freezes the current window. `window_fraction_per_cycle` converts a
    /// cycle count into a fraction of the just-finished window.
    pub(crate) fn rollover(&mut self, window_fraction_per_cycle: f32) {
        self.last_usage = self.cur_cycles as f32 * window_fraction_per_cycle;
        self.last_cycles = self.cur_cycles;
        self.last_switches = self.cur_switches;
        self.cur_cycles = 0;
        self.cur_switches = 0;
    }

    /// Fraction of the last completed window this meter's owner ran,
    /// 0.0..=1.0 under normal calibration.
    pub fn last_usage(&self) -> f32 {
        self.last_usage
    }

    pub fn last_cycles(&self) -> u64 {
        self.last_cycles
    }

    pub fn last_switches(&self) -> u32 {
        self.last_switches
    }
}

impl Default for CpuUsage {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-window memory meter: min/max/mean of bytes in use, sampled at
/// every context switch.
#[derive(Debug)]
pub struct MemUsage {
    cur_sum: u64,
    cur_min: usize,
    cur_max: usize,
    cur_samples: u32,
    last_mean: usize,
    last_min: usize,
    last_max: usize,
    last_usage: f32,
}

impl MemUsage {
    pub const fn new() -> Self {
        MemUsage {
            cur_sum: 0,
            cur_min: usize::MAX,
            cur_max: 0,
            cur_samples: 0,
            last_mean: 0,
            last_min: 0,
            last_max: 0,
            last_usage: 0.0,
        }
    }

    pub(crate) fn record(&mut self, used: usize) {
        self.cur_sum += used as u64;
        self.cur_min = self.cur_min.min(used);
        self.cur_max = self.cur_max.max(used);
        self.cur_samples += 1;
    }

    /// Freezes the current window. A task that never switched during the
    /// window has no samples; its instantaneous `current_used` stands in
    /// for the whole period.
    pub(crate) fn rollover(&mut self, current_used: usize, total: usize) {
        if self.cur_samples > 0 {
            self.last_mean =
                (self.cur_sum / u64::from(self.cur_samples)) as usize;
            self.last_min = self.cur_min;
            self.last_max = self.cur_max;
        } else {
            self.last_mean = current_used;
            self.last_min = current_used;
            self.last_max = current_used;
        }
        self.last_usage = if total > 0 {
            self.last_mean as f32 / total as f32
        } else {
            0.0
        };
        self.cur_sum = 0;
        self.cur_min = usize::MAX;
        self.cur_max = 0;
        self.cur_samples = 0;
    }

    /// Mean fraction of the owner's buffer in use over the last window.
    pub fn last_usage(&self) -> f32 {
        self.last_usage
    }

    pub fn last_mean(&self) -> usize {
        self.last_mean
    }

    pub fn last_min(&self) -> usize {
        self.last_min
    }

    pub fn last_max(&self) -> usize {
        self.last_max
    }
}

impl Default for MemUsage {
    fn default() -> Self {
        Self::new()
    }
}

/// Kernel-wide window bookkeeping: when the next measurement window ends
/// and how cycles convert into window fractions.
#[derive(Debug)]
pub struct UsageWindow {
    target_ticks: u32,
    next_target: Ticks,
    window_fraction_per_cycle: f32,
    closing: bool,
    last_window_end: Option<Ticks>,
}

/// Default measurement window, in ticks.
pub const DEFAULT_TARGET_TICKS: u32 = 1000;

impl UsageWindow {
    pub const fn new() -> Self {
        UsageWindow {
            target_ticks: DEFAULT_TARGET_TICKS,
            next_target: Ticks::ZERO,
            window_fraction_per_cycle: 0.0,
            closing: false,
            last_window_end: None,
        }
    }

    /// Changes the window length. Takes effect when the current window
    /// ends.
    pub fn set_target_ticks(&mut self, ticks: u32) -> Result<(), tarn_abi::Code> {
        if ticks == 0 {
            return Err(tarn_abi::Code::InvalidParams);
        }
        self.target_ticks = ticks;
        Ok(())
    }

    pub fn target_ticks(&self) -> u32 {
        self.target_ticks
    }

    /// True for exactly the one scheduling pass that closes a window;
    /// the scheduler flushes every meter while this holds.
    pub fn closing(&self) -> bool {
        self.closing
    }

    pub fn window_fraction_per_cycle(&self) -> f32 {
        self.window_fraction_per_cycle
    }

    /// Timestamp of the last completed window, for anyone correlating
    /// measurements against a trace.
    pub fn last_window_end(&self) -> Option<Ticks> {
        self.last_window_end
    }

    /// Checks `now` against the window boundary and, when crossed,
    /// recalibrates and schedules the next boundary. The first crossing
    /// only starts the clock; there is no completed window to flush yet.
    pub(crate) fn update_target(
        &mut self,
        now: Ticks,
        clock_hz: u64,
        period_us: u32,
    ) {
        self.closing = false;

        if self.next_target > now {
            return;
        }

        if self.next_target != Ticks::ZERO {
            self.closing = true;
        }

        // The real window may have overshot the target if scheduling was
        // delayed; calibrate against what actually elapsed, and pull the
        // next boundary back to keep boundaries near the ideal cadence.
        let overshoot = now.since(self.next_target);
        let window_ticks = u64::from(self.target_ticks) + overshoot;
        let cycles_in_window = clock_hz as f32 * window_ticks as f32
            * period_us as f32
            / 1_000_000.0;
        self.window_fraction_per_cycle = if cycles_in_window > 0.0 {
            1.0 / cycles_in_window
        } else {
            0.0
        };

        let remaining =
            u64::from(self.target_ticks).saturating_sub(overshoot);
        self.next_target = now.saturating_add(remaining);
        self.last_window_end = Some(now);
    }
}

impl Default for UsageWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_meter_accumulates_then_freezes() {
        let mut cpu = CpuUsage::new();
        cpu.record(300);
        cpu.record(200);
        assert_eq!(cpu.last_cycles(), 0);

        // 1000 cycles per window -> 0.5 of the window.
        cpu.rollover(1.0 / 1000.0);
        assert_eq!(cpu.last_cycles(), 500);
        assert_eq!(cpu.last_switches(), 2);
        assert!((cpu.last_usage() - 0.5).abs() < 1e-6);

        // The new window starts empty.
        cpu.rollover(1.0 / 1000.0);
        assert_eq!(cpu.last_cycles(), 0);
        assert_eq!(cpu.last_usage(), 0.0);
    }

    #[test]
    fn mem_meter_tracks_extremes_and_mean() {
        let mut mem = MemUsage::new();
        mem.record(100);
        mem.record(300);
        mem.record(200);
        mem.rollover(0, 1000);
        assert_eq!(mem.last_min(), 100);
        assert_eq!(mem.last_max(), 300);
        assert_eq!(mem.last_mean(), 200);
        assert!((mem.last_usage() - 0.2).abs() < 1e-6);
    }

    #[test]
    fn mem_meter_without_samples_uses_instantaneous_value() {
        let mut mem = MemUsage::new();
        mem.rollover(640, 1280);
        assert_eq!(mem.last_mean(), 640);
        assert_eq!(mem.last_min(), 640);
        assert!((mem.last_usage() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn first_boundary_arms_without_closing() {
        let mut w = UsageWindow::new();
        w.update_target(Ticks::ZERO, 100_000_000, 1000);
        assert!(!w.closing());

        // Mid-window: nothing happens.
        w.update_target(Ticks::from(500), 100_000_000, 1000);
        assert!(!w.closing());

        // Boundary crossed: this pass closes the window.
        w.update_target(Ticks::from(1000), 100_000_000, 1000);
        assert!(w.closing());

        // And the pass right after does not.
        w.update_target(Ticks::from(1001), 100_000_000, 1000);
        assert!(!w.closing());
    }

    #[test]
    fn calibration_scales_with_tick_period() {
        let mut w = UsageWindow::new();
        w.update_target(Ticks::ZERO, 100_000_000, 1000);
        let per_ms_tick = w.window_fraction_per_cycle();

        let mut w = UsageWindow::new();
        w.update_target(Ticks::ZERO, 100_000_000, 100);
        let per_100us_tick = w.window_fraction_per_cycle();

        // A ten-times-shorter tick means ten times fewer cycles per
        // window, so each cycle is worth ten times more of it.
        assert!((per_100us_tick / per_ms_tick - 10.0).abs() < 1e-3);
    }

    #[test]
    fn overshoot_pulls_next_boundary_back() {
        let mut w = UsageWindow::new();
        w.update_target(Ticks::ZERO, 100_000_000, 1000);
        // Scheduling was held up: the boundary is observed 50 ticks late.
        w.update_target(Ticks::from(1050), 100_000_000, 1000);
        assert!(w.closing());
        assert_eq!(w.last_window_end(), Some(Ticks::from(1050)));
        // Next boundary lands at 2000, not 2050.
        w.update_target(Ticks::from(1999), 100_000_000, 1000);
        assert!(!w.closing());
        w.update_target(Ticks::from(2000), 100_000_000, 1000);
        assert!(w.closing());
    }
}
