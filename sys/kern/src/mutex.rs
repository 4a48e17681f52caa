// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ownership mutex over a binary semaphore.
//!
//! The owner field is a weak back-reference: it identifies the owning
//! task and is never used for lifetime management. Lock and unlock take
//! the acting task explicitly -- the scheduler retries a blocked lock on
//! behalf of the *waiting* task during its signal sweep, and passing the
//! identity in keeps ownership attribution correct without any global
//! state.
//!
//! A re-lock by the owner succeeds without counting, so one unlock fully
//! releases the mutex. Unlock by anyone else is refused.

use core::ptr::NonNull;

use tarn_abi::Code;

use crate::semaphore::Semaphore;
use crate::task::TaskControl;

#[derive(Debug)]
pub struct Mutex {
    sem: Semaphore,
    owner: Option<NonNull<TaskControl>>,
}

impl Mutex {
    pub const fn new() -> Self {
        Mutex {
            sem: Semaphore::new(1, 1),
            owner: None,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.sem.available() == 0
    }

    /// Identity of the current owner, while locked.
    pub fn owner(&self) -> Option<NonNull<TaskControl>> {
        if self.is_locked() {
            self.owner
        } else {
            None
        }
    }

    /// Attempts to lock on behalf of `who`.
    ///
    /// Re-locking by the current owner is an idempotent success (not
    /// counted). `Retry` means the semaphore was contended or lost
    /// arbitration; the signal-wait machinery tries again on the next
    /// scheduling pass.
    pub fn lock(&mut self, who: NonNull<TaskControl>) -> Result<(), Code> {
        if self.is_locked() && self.owner == Some(who) {
            return Ok(());
        }
        if self.sem.acquire() {
            self.owner = Some(who);
            Ok(())
        } else {
            Err(Code::Retry)
        }
    }

    /// Attempts to unlock on behalf of `who`.
    ///
    /// Unlocking an unlocked mutex succeeds; unlocking somebody else's
    /// lock does not.
    pub fn unlock(&mut self, who: NonNull<TaskControl>) -> Result<(), Code> {
        if !self.is_locked() {
            return Ok(());
        }
        if self.owner != Some(who) {
            return Err(Code::InvalidCaller);
        }
        if self.sem.release() {
            self.owner = None;
            Ok(())
        } else {
            Err(Code::Retry)
        }
    }

    /// The underlying semaphore, for availability checks.
    pub fn semaphore(&self) -> &Semaphore {
        &self.sem
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Tasks here are just distinct addresses; the mutex only compares
    // identities.
    fn task_ids() -> (NonNull<TaskControl>, NonNull<TaskControl>) {
        let a = NonNull::new(0x1000 as *mut TaskControl).unwrap();
        let b = NonNull::new(0x2000 as *mut TaskControl).unwrap();
        (a, b)
    }

    #[test]
    fn lock_then_unlock_restores_availability() {
        let (a, _) = task_ids();
        let mut m = Mutex::new();
        assert_eq!(m.lock(a), Ok(()));
        assert_eq!(m.semaphore().available(), 0);
        assert_eq!(m.unlock(a), Ok(()));
        assert_eq!(m.semaphore().available(), 1);
        assert_eq!(m.owner(), None);
    }

    #[test]
    fn relock_by_owner_is_idempotent() {
        let (a, _) = task_ids();
        let mut m = Mutex::new();
        assert_eq!(m.lock(a), Ok(()));
        assert_eq!(m.lock(a), Ok(()));
        // One unlock fully releases: there is no depth counter.
        assert_eq!(m.unlock(a), Ok(()));
        assert!(!m.is_locked());
    }

    #[test]
    fn lock_contention_reports_retry() {
        let (a, b) = task_ids();
        let mut m = Mutex::new();
        assert_eq!(m.lock(a), Ok(()));
        assert_eq!(m.lock(b), Err(Code::Retry));
        assert_eq!(m.owner(), Some(a));
    }

    #[test]
    fn unlock_by_non_owner_is_refused() {
        let (a, b) = task_ids();
        let mut m = Mutex::new();
        assert_eq!(m.lock(a), Ok(()));
        assert_eq!(m.unlock(b), Err(Code::InvalidCaller));
        assert!(m.is_locked());
    }

    #[test]
    fn unlock_when_unlocked_is_fine() {
        let (a, _) = task_ids();
        let mut m = Mutex::new();
        assert_eq!(m.unlock(a), Ok(()));
        assert!(!m.is_locked());
    }
}
