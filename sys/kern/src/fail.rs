// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for recording kernel failures such that they can be found by
//! tooling.
//!
//! Binary interface for debuggers:
//!
//! - `KERNEL_HAS_FAILED` is a `bool`, cleared before the kernel starts
//!   and set if the kernel dies (explicitly or through `panic!`).
//! - `KERNEL_EPITAPH` is a byte array holding as much of the failure
//!   reason (UTF-8) as fits, NUL-padded.
//!
//! A fatal condition here means a *kernel bug* -- a sentinel mismatch, an
//! impossible state transition -- never a runtime condition, which is why
//! the response is to stop, not to recover.

use core::fmt::{Display, Write};
use core::sync::atomic::Ordering;

/// Flag set by all failure reporting paths, giving tools a one-stop shop
/// for kernel triage.
#[used]
static mut KERNEL_HAS_FAILED: bool = false;

const EPITAPH_LEN: usize = 128;

/// Holds up to `EPITAPH_LEN` bytes describing the failure, NUL-padded.
#[used]
static mut KERNEL_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

fn begin_epitaph() -> &'static mut [u8; EPITAPH_LEN] {
    // Safety: this is the only site that touches the flag, and it runs
    // at most once to completion -- a second entry means a recursive
    // panic, which parks below instead of recursing.
    let previous_fail = unsafe {
        core::ptr::replace(core::ptr::addr_of_mut!(KERNEL_HAS_FAILED), true)
    };
    if previous_fail {
        loop {
            core::sync::atomic::fence(Ordering::SeqCst);
        }
    }

    // Safety: only one execution gets here, per the flag above.
    unsafe { &mut *core::ptr::addr_of_mut!(KERNEL_EPITAPH) }
}

/// Records `msg` for posterity and stops. The spin is deliberate: kernel
/// state stays frozen for a debugger to find.
pub fn die(msg: impl Display) -> ! {
    let buf = begin_epitaph();
    let mut writer = Eulogist { dest: buf };
    write!(writer, "{msg}").ok();

    loop {
        core::sync::atomic::fence(Ordering::SeqCst);
    }
}

struct Eulogist {
    dest: &'static mut [u8],
}

impl Write for Eulogist {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let s = s.as_bytes();
        let n = s.len().min(self.dest.len());
        let (dest, leftovers) = {
            let taken = core::mem::take(&mut self.dest);
            taken.split_at_mut(n)
        };
        dest.copy_from_slice(&s[..n]);
        self.dest = leftovers;
        Ok(())
    }
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    die(info)
}
