// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The lock-free activity counter behind deferred close.
//!
//! The whole protocol lives in a single atomic word so that "acquire" and "begin close" are
//! totally ordered: either an acquire lands before the close and the close is deferred until
//! it is released, or the close lands first and the acquire fails.

use std::hint::spin_loop;
use std::sync::atomic::{AtomicU64, Ordering};

/// Set while new activity may be acquired.
const ACCEPTING: u64 = 1 << 63;

/// Set while a close waits for the count to reach zero.
const CLOSING: u64 = 1 << 62;

const COUNT_MASK: u64 = CLOSING - 1;

#[derive(Debug)]
pub(crate) struct ActivityGate {
    word: AtomicU64,
}

impl ActivityGate {
    pub(crate) const fn new() -> Self {
        Self {
            word: AtomicU64::new(0),
        }
    }

    /// Starts accepting activity.
    pub(crate) fn open(&self) {
        let previous = self.word.swap(ACCEPTING, Ordering::AcqRel);
        debug_assert_eq!(previous, 0, "activity gate opened twice or with activity outstanding");
    }

    /// Counts one more unit of activity, unless a close has begun.
    #[cfg_attr(test, mutants::skip)] // Critical primitive - causes test timeouts if tampered.
    pub(crate) fn try_acquire(&self) -> bool {
        let mut current = self.word.load(Ordering::Acquire);

        loop {
            if current & ACCEPTING == 0 {
                return false;
            }

            assert!(current & COUNT_MASK < COUNT_MASK, "service activity count overflow");

            match self
                .word
                .compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => {
                    current = actual;
                    spin_loop();
                }
            }
        }
    }

    /// Drops one unit of activity.
    ///
    /// Returns `true` if this was the last unit of a deferred close, in which case the caller
    /// must run the close.
    ///
    /// # Panics
    ///
    /// Panics if no activity is outstanding.
    #[cfg_attr(test, mutants::skip)] // Critical primitive - causes test timeouts if tampered.
    pub(crate) fn release(&self) -> bool {
        let mut current = self.word.load(Ordering::Acquire);

        loop {
            let count = current & COUNT_MASK;
            assert!(count > 0, "service activity released more often than it was acquired");

            let closes = count == 1 && current & CLOSING != 0;
            let next = if closes { (current - 1) & !CLOSING } else { current - 1 };

            match self
                .word
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return closes,
                Err(actual) => {
                    current = actual;
                    spin_loop();
                }
            }
        }
    }

    /// Stops accepting activity.
    ///
    /// Returns `true` if activity is outstanding. In that case the close is deferred and the
    /// closer itself holds one unit of activity, which it must [`release()`][Self::release]
    /// once it has announced the deferral.
    #[cfg_attr(test, mutants::skip)] // Critical primitive - causes test timeouts if tampered.
    pub(crate) fn begin_close(&self) -> bool {
        let mut current = self.word.load(Ordering::Acquire);

        loop {
            let deferred = current & COUNT_MASK != 0;
            let next = if deferred {
                ((current & !ACCEPTING) | CLOSING) + 1
            } else {
                current & !ACCEPTING
            };

            match self
                .word
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return deferred,
                Err(actual) => {
                    current = actual;
                    spin_loop();
                }
            }
        }
    }

    pub(crate) fn reset(&self) {
        self.word.store(0, Ordering::Release);
    }

    pub(crate) fn count(&self) -> u64 {
        self.word.load(Ordering::Acquire) & COUNT_MASK
    }
}
