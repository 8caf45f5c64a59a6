// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use std::{
    cell::UnsafeCell,
    hint,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU32, Ordering},
};

/// Sentinel tries budget meaning "spin until acquired".
pub const TRIES_GUARANTEE: u64 = u64::MAX;

/// A read/write spin lock with a bounded-tries acquisition mode.
///
/// All cache-internal locks are expected to be held for a handful of
/// nanoseconds, so parking the thread is never worth it. What the callers do
/// need is the ability to give up: a lookup that cannot get hold of a bucket
/// within its tries budget reports "busy" to the caller instead of blocking.
/// Acquisition is therefore a value-returning operation; the guard is only
/// produced when the lock was actually taken.
///
/// Layout of the state word: bit 31 is the writer bit, the low 28 bits count
/// active readers.
pub struct ReadWriteSpinLock<T> {
    state: AtomicU32,
    data: UnsafeCell<T>,
}

const WRITE: u32 = 0x1000_0000;
const READ_MASK: u32 = 0x0fff_ffff;

unsafe impl<T: Send> Send for ReadWriteSpinLock<T> {}
unsafe impl<T: Send + Sync> Sync for ReadWriteSpinLock<T> {}

impl<T> ReadWriteSpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            state: AtomicU32::new(0),
            data: UnsafeCell::new(data),
        }
    }

    pub fn read(&self) -> ReadGuard<T> {
        self.try_read(TRIES_GUARANTEE)
            .expect("unbounded read acquisition cannot fail")
    }

    pub fn try_read(&self, max_tries: u64) -> Option<ReadGuard<T>> {
        let mut tries: u64 = 0;
        while tries < max_tries {
            let state = self.state.load(Ordering::Relaxed);
            if state & WRITE == 0 {
                debug_assert!(state & READ_MASK < READ_MASK);
                if self
                    .state
                    .compare_exchange_weak(
                        state,
                        state + 1,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    return Some(ReadGuard { lock: self });
                }
            }
            tries = tries.saturating_add(1);
            hint::spin_loop();
        }
        None
    }

    pub fn write(&self) -> WriteGuard<T> {
        self.try_write(TRIES_GUARANTEE)
            .expect("unbounded write acquisition cannot fail")
    }

    pub fn try_write(&self, max_tries: u64) -> Option<WriteGuard<T>> {
        let mut tries: u64 = 0;
        while tries < max_tries {
            if self
                .state
                .compare_exchange_weak(0, WRITE, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Some(WriteGuard { lock: self });
            }
            tries = tries.saturating_add(1);
            hint::spin_loop();
        }
        None
    }

    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != 0
    }

    pub fn is_write_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) & WRITE != 0
    }
}

pub struct ReadGuard<'a, T> {
    lock: &'a ReadWriteSpinLock<T>,
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.fetch_sub(1, Ordering::Release);
    }
}

pub struct WriteGuard<'a, T> {
    lock: &'a ReadWriteSpinLock<T>,
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.fetch_and(!WRITE, Ordering::Release);
    }
}
