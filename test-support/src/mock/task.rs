//! 调度器 / 信号投递的 Mock 实现
//!
//! 每个测试持有自己的实例，记录收到的信号和让出 CPU 的次数。

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Mock 的故障任务
pub struct MockTask {
    signals: AtomicUsize,
    last_signal: AtomicU32,
    yields: AtomicUsize,
}

impl MockTask {
    pub const fn new() -> Self {
        Self {
            signals: AtomicUsize::new(0),
            last_signal: AtomicU32::new(0),
            yields: AtomicUsize::new(0),
        }
    }

    /// 记录一次信号投递
    pub fn deliver_fault_signal(&self, signo: u32) {
        self.last_signal.store(signo, Ordering::Relaxed);
        self.signals.fetch_add(1, Ordering::Relaxed);
    }

    /// 记录一次让出
    pub fn yield_now(&self) {
        self.yields.fetch_add(1, Ordering::Relaxed);
    }

    pub fn signals(&self) -> usize {
        self.signals.load(Ordering::Relaxed)
    }

    pub fn last_signal(&self) -> u32 {
        self.last_signal.load(Ordering::Relaxed)
    }

    pub fn yields(&self) -> usize {
        self.yields.load(Ordering::Relaxed)
    }
}

impl Default for MockTask {
    fn default() -> Self {
        Self::new()
    }
}
