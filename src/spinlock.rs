//! Ticket spinlock guarding per-CPU scheduler and softint queues.
//!
//! Callers must not block while holding one of these; the hold times in this
//! crate are all bounded queue operations.

use core::{
    cell::UnsafeCell,
    sync::atomic::{AtomicU64, Ordering},
};

#[repr(align(64))]
struct AlignedAtomicU64(AtomicU64);

pub struct Spinlock<T> {
    next_ticket: AlignedAtomicU64,
    current: AlignedAtomicU64,
    cell: UnsafeCell<T>,
}

impl<T> Spinlock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            next_ticket: AlignedAtomicU64(AtomicU64::new(0)),
            current: AlignedAtomicU64(AtomicU64::new(0)),
            cell: UnsafeCell::new(data),
        }
    }

    #[track_caller]
    pub fn lock(&self) -> LockGuard<'_, T> {
        let ticket = self.next_ticket.0.fetch_add(1, Ordering::Relaxed);
        while self.current.0.load(Ordering::Acquire) != ticket {
            core::hint::spin_loop();
        }
        LockGuard { lock: self }
    }

    fn release(&self) {
        let next = self.current.0.load(Ordering::Relaxed) + 1;
        self.current.0.store(next, Ordering::Release);
    }
}

pub struct LockGuard<'a, T> {
    lock: &'a Spinlock<T>,
}

impl<T> core::ops::Deref for LockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.cell.get() }
    }
}

impl<T> core::ops::DerefMut for LockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.cell.get() }
    }
}

impl<T> Drop for LockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

unsafe impl<T> Send for Spinlock<T> where T: Send {}
unsafe impl<T> Sync for Spinlock<T> where T: Send {}
unsafe impl<T> Send for LockGuard<'_, T> where T: Send {}
unsafe impl<T> Sync for LockGuard<'_, T> where T: Send + Sync {}

/// Spin until `until` produces a value, invoking `relax` between polls.
pub fn spin_wait_until<T>(mut until: impl FnMut() -> Option<T>, mut relax: impl FnMut()) -> T {
    loop {
        if let Some(v) = until() {
            return v;
        }
        relax();
        core::hint::spin_loop();
    }
}
