// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared scaffolding for the hosted tests.
//!
//! The kernel is a process-wide singleton, so tests that install it must
//! not overlap: `fresh_world` hands out a guard on a global lock and
//! resets every piece of global state (kernel pointer, scheduler flags,
//! kernel time, the simulated machine) on the way in.

use std::sync::{Mutex, MutexGuard, OnceLock};

/// Exclusive, reset view of all kernel globals. Hold it for the duration
/// of the test.
pub struct World {
    _guard: MutexGuard<'static, ()>,
}

pub fn fresh_world() -> World {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let guard = LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        // A panicking test poisons the lock; the globals get reset
        // below either way.
        .unwrap_or_else(|e| e.into_inner());

    crate::startup::reset_for_test();
    crate::sched::reset_for_test();
    crate::time::reset();
    crate::arch::reset();

    World { _guard: guard }
}

/// A `World` with an installed kernel: clock registered, kernel buffer
/// allocated and initialized.
pub struct KernelWorld {
    _world: World,
    _buffer: Box<[u64]>,
}

pub fn fresh_kernel() -> KernelWorld {
    let world = fresh_world();

    // 100 MHz core clock, 1 ms tick (the default period).
    crate::arch::set_clock_freq(100_000);

    let words = crate::api::init_buffer_size() / 8 + 1;
    let mut buffer = vec![0u64; words].into_boxed_slice();
    // Safety: freshly allocated, 8-aligned, big enough, and kept alive
    // by the returned fixture.
    unsafe {
        crate::api::init(buffer.as_mut_ptr().cast()).unwrap();
    }

    KernelWorld {
        _world: world,
        _buffer: buffer,
    }
}

/// An 8-aligned, zeroed task buffer of at least `bytes` bytes (rounded
/// up to whole words).
pub struct TaskBuffer {
    mem: Box<[u64]>,
}

impl TaskBuffer {
    pub fn new(bytes: usize) -> Self {
        TaskBuffer {
            mem: vec![0u64; bytes.div_ceil(8)].into_boxed_slice(),
        }
    }

    pub fn base(&mut self) -> *mut u8 {
        self.mem.as_mut_ptr().cast()
    }

    pub fn len(&self) -> usize {
        self.mem.len() * 8
    }
}
