//! 缺页统计

use core::sync::atomic::{AtomicUsize, Ordering};

/// 全局缺页统计
static FAULT_STATS: FaultStats = FaultStats::new();

/// 缺页计数器
pub struct FaultStats {
    total: AtomicUsize,
    kernel: AtomicUsize,
    cow: AtomicUsize,
    cow_reused: AtomicUsize,
    zero_fill: AtomicUsize,
    file: AtomicUsize,
    failures: AtomicUsize,
}

/// 某一时刻的计数快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultStatsSnapshot {
    /// 处理过的缺页总数
    pub total: usize,
    /// 页表元数据缺页
    pub kernel: usize,
    /// 写时复制（含原地复用）
    pub cow: usize,
    /// 写时复制中帧只剩一个引用、直接复用的次数
    pub cow_reused: usize,
    /// 匿名页清零装入
    pub zero_fill: usize,
    /// 文件页装入
    pub file: usize,
    /// 失败次数
    pub failures: usize,
}

impl FaultStats {
    const fn new() -> Self {
        Self {
            total: AtomicUsize::new(0),
            kernel: AtomicUsize::new(0),
            cow: AtomicUsize::new(0),
            cow_reused: AtomicUsize::new(0),
            zero_fill: AtomicUsize::new(0),
            file: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        }
    }

    pub(crate) fn incr_total(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_kernel(&self) {
        self.kernel.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_cow(&self, reused: bool) {
        self.cow.fetch_add(1, Ordering::Relaxed);
        if reused {
            self.cow_reused.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn incr_zero_fill(&self) {
        self.zero_fill.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_file(&self) {
        self.file.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_failures(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// 读取当前计数
    pub fn snapshot(&self) -> FaultStatsSnapshot {
        FaultStatsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            kernel: self.kernel.load(Ordering::Relaxed),
            cow: self.cow.load(Ordering::Relaxed),
            cow_reused: self.cow_reused.load(Ordering::Relaxed),
            zero_fill: self.zero_fill.load(Ordering::Relaxed),
            file: self.file.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// 全局缺页统计
pub fn fault_stats() -> &'static FaultStats {
    &FAULT_STATS
}
