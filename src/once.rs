//! One-shot initialization cell for state created at attach time and never
//! torn down (dispatch threads, tunables snapshots).

use core::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    sync::atomic::{AtomicU32, Ordering},
};

use crate::spinlock::spin_wait_until;

pub struct Once<T> {
    status: AtomicU32,
    data: UnsafeCell<MaybeUninit<T>>,
}

// SAFETY: once call_once has completed, the data is immutable; consistency
// between the cell and the status word is managed internally.
unsafe impl<T: Send + Sync> Sync for Once<T> {}
unsafe impl<T: Send> Send for Once<T> {}

const INCOMPLETE: u32 = 0;
const RUNNING: u32 = 1;
const COMPLETE: u32 = 2;

impl<T> Once<T> {
    pub const fn new() -> Self {
        Self {
            status: AtomicU32::new(INCOMPLETE),
            data: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Run `f` exactly once to initialize the cell; racing callers block
    /// until the winner finishes, then all return the shared reference.
    pub fn call_once<F: FnOnce() -> T>(&self, f: F) -> &T {
        if self.status.load(Ordering::SeqCst) == INCOMPLETE
            && self
                .status
                .compare_exchange(INCOMPLETE, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            // SAFETY: we won the cmpxchg, so we are the only writer.
            unsafe {
                (*self.data.get()).as_mut_ptr().write(f());
            }
            self.status.store(COMPLETE, Ordering::SeqCst);
            // SAFETY: just initialized above.
            return unsafe { self.force_get() };
        }
        self.wait()
    }

    unsafe fn force_get(&self) -> &T {
        &*(*self.data.get()).as_ptr()
    }

    /// Return the data if ready, without blocking on an in-flight init.
    pub fn poll(&self) -> Option<&T> {
        if self.status.load(Ordering::SeqCst) == COMPLETE {
            // SAFETY: status COMPLETE implies the data is initialized.
            Some(unsafe { self.force_get() })
        } else {
            None
        }
    }

    /// Wait until someone has initialized the cell.
    pub fn wait(&self) -> &T {
        spin_wait_until(
            || match self.status.load(Ordering::SeqCst) {
                COMPLETE => Some(()),
                _ => None,
            },
            || {},
        );
        // SAFETY: status COMPLETE implies the data is initialized.
        unsafe { self.force_get() }
    }
}

impl<T> Drop for Once<T> {
    fn drop(&mut self) {
        if self.status.load(Ordering::SeqCst) == COMPLETE {
            unsafe {
                core::ptr::drop_in_place((*self.data.get()).as_mut_ptr());
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::Once;

    #[test]
    fn single_init() {
        let once: Once<u32> = Once::new();
        assert!(once.poll().is_none());
        assert_eq!(*once.call_once(|| 7), 7);
        assert_eq!(*once.call_once(|| 8), 7);
        assert_eq!(*once.wait(), 7);
    }
}
