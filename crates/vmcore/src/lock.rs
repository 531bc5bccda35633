//! 自旋锁与读写锁
//!
//! 基于 `lock_api` 的原始锁实现，`SpinLock` 保护帧分配器和页表池等共享状态，
//! `RwLock` 作为每个地址空间的单写者锁。

use core::hint;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use lock_api::{GuardSend, RawMutex, RawRwLock};

/// 原始自旋锁
pub struct RawSpinLock {
    locked: AtomicBool,
}

unsafe impl RawMutex for RawSpinLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        locked: AtomicBool::new(false),
    };

    type GuardMarker = GuardSend;

    fn lock(&self) {
        while !self.try_lock() {
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
    }

    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

/// 写者标志位；低位为读者计数
const WRITER: usize = 1 << (usize::BITS - 1);

/// 原始读写自旋锁（写者互斥，读者共享）
pub struct RawRwSpinLock {
    state: AtomicUsize,
}

unsafe impl RawRwLock for RawRwSpinLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        state: AtomicUsize::new(0),
    };

    type GuardMarker = GuardSend;

    fn lock_shared(&self) {
        while !self.try_lock_shared() {
            hint::spin_loop();
        }
    }

    fn try_lock_shared(&self) -> bool {
        let cur = self.state.load(Ordering::Relaxed);
        cur & WRITER == 0
            && self
                .state
                .compare_exchange(cur, cur + 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
    }

    unsafe fn unlock_shared(&self) {
        self.state.fetch_sub(1, Ordering::Release);
    }

    fn lock_exclusive(&self) {
        while !self.try_lock_exclusive() {
            hint::spin_loop();
        }
    }

    fn try_lock_exclusive(&self) -> bool {
        self.state
            .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock_exclusive(&self) {
        self.state.store(0, Ordering::Release);
    }

    fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != 0
    }
}

/// 自旋互斥锁
pub type SpinLock<T> = lock_api::Mutex<RawSpinLock, T>;
/// 自旋互斥锁的守卫
pub type SpinLockGuard<'a, T> = lock_api::MutexGuard<'a, RawSpinLock, T>;
/// 读写自旋锁
pub type RwLock<T> = lock_api::RwLock<RawRwSpinLock, T>;
/// 读守卫
pub type RwLockReadGuard<'a, T> = lock_api::RwLockReadGuard<'a, RawRwSpinLock, T>;
/// 写守卫
pub type RwLockWriteGuard<'a, T> = lock_api::RwLockWriteGuard<'a, RawRwSpinLock, T>;
