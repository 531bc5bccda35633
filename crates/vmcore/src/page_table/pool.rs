//! 页表页池
//!
//! 早期启动阶段页表页来自一段预先切出的连续保留区（容量有界），
//! 之后从帧分配器动态获取；动态部分可以设置预算上限。
//! 池耗尽是遍历器唯一的失败来源，由调用方决定停机还是向上报告。

use crate::address::{Paddr, PageNum, PAGE_SIZE};
use crate::frame_allocator::{clear_frame, FrameAllocator, LockedFrameAllocator};
use crate::lock::SpinLock;
use alloc::sync::Arc;
use alloc::vec::Vec;

struct PoolInner {
    /// 启动保留区中空闲的页表页
    reserve: Vec<Paddr>,
    /// 保留区范围 `[start, end)`，用于归还时区分来源
    reserve_range: Option<(Paddr, Paddr)>,
    /// 剩余动态分配预算；None 表示不限
    budget: Option<usize>,
    /// 正在使用的页表页数
    in_use: usize,
}

/// 页表页池
pub struct TablePool {
    frames: Arc<dyn FrameAllocator>,
    inner: SpinLock<PoolInner>,
}

impl TablePool {
    /// 完全动态的页表池
    pub fn new(frames: Arc<dyn FrameAllocator>) -> Self {
        Self {
            frames,
            inner: SpinLock::new(PoolInner {
                reserve: Vec::new(),
                reserve_range: None,
                budget: None,
                in_use: 0,
            }),
        }
    }

    /// 动态分配至多 `max_tables` 张页表的池
    pub fn with_budget(frames: Arc<dyn FrameAllocator>, max_tables: usize) -> Self {
        let pool = Self::new(frames);
        pool.set_budget(Some(max_tables));
        pool
    }

    /// 先从 `allocator` 切出 `count` 张连续页作为启动保留区
    ///
    /// 保留区用完后回退到动态分配。
    pub fn with_boot_reserve(allocator: Arc<LockedFrameAllocator>, count: usize) -> Option<Self> {
        let range = allocator.alloc_contig(count)?;
        let start = range.start().start_addr();
        let end = range.end().start_addr();
        let reserve = range.iter().rev().map(|ppn| ppn.start_addr()).collect();
        let frames: Arc<dyn FrameAllocator> = allocator;
        let pool = Self::new(frames);
        {
            let mut inner = pool.inner.lock();
            inner.reserve = reserve;
            inner.reserve_range = Some((start, end));
        }
        Some(pool)
    }

    /// 底层帧分配器
    pub fn frames(&self) -> &Arc<dyn FrameAllocator> {
        &self.frames
    }

    /// 设置动态分配预算（None 表示不限）
    pub fn set_budget(&self, max_tables: Option<usize>) {
        self.inner.lock().budget = max_tables;
    }

    /// 正在使用的页表页数
    pub fn tables_in_use(&self) -> usize {
        self.inner.lock().in_use
    }

    /// 保留区剩余页数
    pub fn reserve_left(&self) -> usize {
        self.inner.lock().reserve.len()
    }

    /// 取一张清零的页表页
    pub fn alloc_table(&self) -> Option<Paddr> {
        let paddr = {
            let mut inner = self.inner.lock();
            let paddr = match inner.reserve.pop() {
                Some(paddr) => paddr,
                None => {
                    if inner.budget == Some(0) {
                        return None;
                    }
                    let paddr = self.frames.allocate_frame()?;
                    if let Some(budget) = inner.budget.as_mut() {
                        *budget -= 1;
                    }
                    paddr
                }
            };
            inner.in_use += 1;
            paddr
        };
        clear_frame(paddr);
        Some(paddr)
    }

    /// 把一个已分配的帧登记为页表页，之后可以经 [`TablePool::free_table`] 归还
    pub fn adopt_table(&self, paddr: Paddr) {
        debug_assert_eq!(paddr.0 % PAGE_SIZE, 0);
        let mut inner = self.inner.lock();
        inner.in_use += 1;
        if let Some(budget) = inner.budget.as_mut() {
            *budget = budget.saturating_sub(1);
        }
    }

    /// 归还一张页表页
    pub fn free_table(&self, paddr: Paddr) {
        debug_assert_eq!(paddr.0 % PAGE_SIZE, 0);
        let mut inner = self.inner.lock();
        inner.in_use -= 1;
        match inner.reserve_range {
            Some((start, end)) if paddr >= start && paddr < end => inner.reserve.push(paddr),
            _ => {
                if let Some(budget) = inner.budget.as_mut() {
                    *budget += 1;
                }
                self.frames.free_frame(paddr);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::test_allocator;

    #[test]
    fn test_boot_reserve_then_dynamic() {
        let frames = test_allocator(8);
        let pool = TablePool::with_boot_reserve(frames.clone(), 2).unwrap();
        assert_eq!(pool.reserve_left(), 2);
        let a = pool.alloc_table().unwrap();
        let b = pool.alloc_table().unwrap();
        assert_eq!(pool.reserve_left(), 0);
        // 保留区用完后走动态分配
        let c = pool.alloc_table().unwrap();
        assert_eq!(pool.tables_in_use(), 3);
        assert_eq!(frames.stats().1, 3);

        pool.free_table(a);
        pool.free_table(b);
        assert_eq!(pool.reserve_left(), 2);
        pool.free_table(c);
        assert_eq!(frames.stats().1, 2);
        assert_eq!(pool.tables_in_use(), 0);
    }

    #[test]
    fn test_budget_limits_dynamic_tables() {
        let frames = test_allocator(8);
        let pool = TablePool::with_budget(frames.clone(), 1);
        let a = pool.alloc_table().unwrap();
        assert!(pool.alloc_table().is_none());
        pool.free_table(a);
        assert!(pool.alloc_table().is_some());
    }

    #[test]
    fn test_tables_are_zeroed() {
        let frames = test_allocator(4);
        let pool = TablePool::new(frames.clone());
        let dirty = frames.allocate_frame().unwrap();
        unsafe { crate::frame_allocator::frame_bytes(dirty).fill(0xa5) };
        frames.free_frame(dirty);
        let table = pool.alloc_table().unwrap();
        assert_eq!(table, dirty);
        assert!(unsafe { crate::frame_allocator::frame_bytes(table) }.iter().all(|&b| b == 0));
    }
}
