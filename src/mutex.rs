//! Locking for the heap's state.
//!
//! The engine never synchronizes on its own. A [`Heap`](crate::Heap) keeps all
//! of its state in a [`Mutex`] and every public entry point holds that mutex
//! for the whole operation. The `L` parameter picks the lock:
//!
//! * [`SingleThreadedLock`] leaves the heap `!Sync` and turns re-entry (a
//!   logger or callback allocating from the heap it was called by) into a
//!   panic.
//! * [`SpinLock`] makes the heap `Sync`, which a `#[global_allocator]` needs.

use core::{
    cell::{Cell, UnsafeCell},
    hint,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

/// Mutual exclusion over a heap's state.
///
/// # Safety
///
/// * When the implementing type is `Sync`, heaps using it are `Sync` too, so
///   `lock` must keep any other thread out until the matching `unlock`.
///
/// * `lock` must never succeed while the lock is already held, even on the
///   holding thread. Panicking, aborting or blocking forever are all
///   acceptable ways to refuse.
pub unsafe trait Lock {
    /// Acquire the lock.
    fn lock(&self);

    /// Release the lock. Only called by the current holder.
    fn unlock(&self);
}

/// A [`Lock`] for heaps that stay on one thread.
///
/// It is a checked flag, in the manner of `RefCell`: taking it twice panics.
#[derive(Debug)]
pub struct SingleThreadedLock {
    held: Cell<bool>,
}

impl SingleThreadedLock {
    /// An unheld lock.
    #[inline]
    pub const fn new() -> Self {
        SingleThreadedLock {
            held: Cell::new(false),
        }
    }
}

impl Default for SingleThreadedLock {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Lock for SingleThreadedLock {
    #[inline]
    fn lock(&self) {
        assert!(!self.held.replace(true), "heap re-entered while locked");
    }

    #[inline]
    fn unlock(&self) {
        debug_assert!(self.held.get());
        self.held.set(false);
    }
}

/// A test-and-set spin lock.
///
/// Re-entering it from the holding thread spins forever.
#[derive(Debug)]
pub struct SpinLock {
    held: AtomicBool,
}

impl SpinLock {
    /// An unheld lock.
    #[inline]
    pub const fn new() -> Self {
        SpinLock {
            held: AtomicBool::new(false),
        }
    }
}

impl Default for SpinLock {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Lock for SpinLock {
    #[inline]
    fn lock(&self) {
        while self
            .held
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // Spin on a plain load so waiters do not keep the line exclusive.
            while self.held.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
    }

    #[inline]
    fn unlock(&self) {
        self.held.store(false, Ordering::Release);
    }
}

/// A value guarded by a [`Lock`].
pub(crate) struct Mutex<T, L> {
    lock: L,
    value: UnsafeCell<T>,
}

// Safety: sending the mutex sends the value and the lock, nothing else.
unsafe impl<T: Send, L: Send> Send for Mutex<T, L> {}

// Safety: `Lock`'s contract gives exclusive access to the value across
// threads whenever `L: Sync`. `T: Send` is still needed, since a guard on
// another thread can move the value out through `&mut T`.
unsafe impl<T: Send, L: Lock + Sync> Sync for Mutex<T, L> {}

impl<T, L: Lock> Mutex<T, L> {
    pub(crate) const fn new(value: T, lock: L) -> Self {
        Mutex {
            lock,
            value: UnsafeCell::new(value),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, T, L> {
        self.lock.lock();
        MutexGuard { mutex: self }
    }
}

/// Proof that the lock is held. Unlocks on drop.
pub(crate) struct MutexGuard<'a, T, L: Lock> {
    mutex: &'a Mutex<T, L>,
}

impl<T, L: Lock> Drop for MutexGuard<'_, T, L> {
    fn drop(&mut self) {
        self.mutex.lock.unlock();
    }
}

impl<T, L: Lock> Deref for MutexGuard<'_, T, L> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: the guard exists only while the lock is held.
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T, L: Lock> DerefMut for MutexGuard<'_, T, L> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: as above, and `&mut self` makes this the only borrow.
        unsafe { &mut *self.mutex.value.get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "re-entered")]
    fn single_threaded_lock_rejects_reentry() {
        let mutex = Mutex::new(0u32, SingleThreadedLock::new());
        let _guard = mutex.lock();
        let _again = mutex.lock();
    }

    #[test]
    fn single_threaded_lock_is_reusable() {
        let mutex = Mutex::new(0u32, SingleThreadedLock::new());
        *mutex.lock() += 1;
        *mutex.lock() += 1;
        assert_eq!(*mutex.lock(), 2);
    }

    #[test]
    fn spin_lock_serializes_threads() {
        use std::{sync::Arc, thread, vec::Vec};

        let mutex = Arc::new(Mutex::new(0u64, SpinLock::new()));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let mutex = Arc::clone(&mutex);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        *mutex.lock() += 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*mutex.lock(), 4000);
    }
}
