//! 内存管理相关操作的 Mock 实现
//!
//! 注意：这里不直接依赖 `vmcore` crate（避免循环依赖）。
//! `vmcore` crate 在 `cfg(test)` 下为这些类型实现其 trait（例如 `ArchMmOps` / `MmConfig`）。

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use core::sync::atomic::{AtomicUsize, Ordering};

/// 模拟物理内存的起始物理地址
///
/// 选在 4GiB 以下，保证 32 位页表项也能编码全部帧。
pub const PHYS_BASE: usize = 0x1000_0000;

/// 模拟物理内存大小（128 MiB）
pub const ARENA_SIZE: usize = 128 * 1024 * 1024;

const PAGE_SIZE: usize = 4096;

/// 模拟物理内存
///
/// 在宿主堆上按页对齐申请一整块内存，物理地址 `PHYS_BASE + off`
/// 对应宿主地址 `host_base + off`。各测试通过 [`PhysArena::carve`]
/// 切出互不重叠的物理区间，彼此之间不会干扰。
pub struct PhysArena {
    host: AtomicUsize,
    next: AtomicUsize,
}

impl PhysArena {
    pub const fn new() -> Self {
        Self {
            host: AtomicUsize::new(0),
            next: AtomicUsize::new(0),
        }
    }

    fn layout() -> Layout {
        // 常量参数，不会失败
        match Layout::from_size_align(ARENA_SIZE, PAGE_SIZE) {
            Ok(layout) => layout,
            Err(_) => panic!("bad arena layout"),
        }
    }

    /// 宿主侧基址，首次调用时分配
    pub fn host_base(&self) -> usize {
        let cur = self.host.load(Ordering::Acquire);
        if cur != 0 {
            return cur;
        }
        let fresh = unsafe { alloc_zeroed(Self::layout()) } as usize;
        assert!(fresh != 0, "arena allocation failed");
        match self
            .host
            .compare_exchange(0, fresh, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => fresh,
            Err(winner) => {
                unsafe { dealloc(fresh as *mut u8, Self::layout()) };
                winner
            }
        }
    }

    /// 切出 `pages` 个连续物理页，返回 `[start, end)` 物理地址
    pub fn carve(&self, pages: usize) -> (usize, usize) {
        let bytes = pages * PAGE_SIZE;
        let off = self.next.fetch_add(bytes, Ordering::AcqRel);
        assert!(off + bytes <= ARENA_SIZE, "physical arena exhausted");
        (PHYS_BASE + off, PHYS_BASE + off + bytes)
    }

    /// 物理地址是否落在模拟物理内存内
    pub fn contains(&self, paddr: usize) -> bool {
        (PHYS_BASE..PHYS_BASE + ARENA_SIZE).contains(&paddr)
    }

    /// 物理地址 -> 宿主地址
    pub fn to_host(&self, paddr: usize) -> usize {
        assert!(self.contains(paddr), "paddr {:#x} outside arena", paddr);
        self.host_base() + (paddr - PHYS_BASE)
    }

    /// 宿主地址 -> 物理地址
    pub fn to_phys(&self, host: usize) -> usize {
        host - self.host_base() + PHYS_BASE
    }
}

/// 全局模拟物理内存
pub static PHYS_ARENA: PhysArena = PhysArena::new();

/// Mock 的内存管理架构操作
///
/// 直接映射落在 [`PHYS_ARENA`] 上；TLB 操作只做计数。
pub struct MockMmOps {
    invalidations: AtomicUsize,
    full_flushes: AtomicUsize,
}

impl MockMmOps {
    pub const fn new() -> Self {
        Self {
            invalidations: AtomicUsize::new(0),
            full_flushes: AtomicUsize::new(0),
        }
    }

    /// 将虚拟地址转换为物理地址
    ///
    /// # Safety
    /// 仅用于测试环境的可控输入。
    pub unsafe fn vaddr_to_paddr(&self, vaddr: usize) -> usize {
        PHYS_ARENA.to_phys(vaddr)
    }

    /// 将物理地址转换为虚拟地址
    pub fn paddr_to_vaddr(&self, paddr: usize) -> usize {
        PHYS_ARENA.to_host(paddr)
    }

    /// 使单个虚拟地址的 TLB 项失效（测试中只计数）
    pub fn tlb_invalidate(&self, _vaddr: usize) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    /// 使一段虚拟地址的 TLB 项失效（测试中只计数）
    pub fn tlb_invalidate_range(&self, _vaddr: usize, pages: usize) {
        self.invalidations.fetch_add(pages, Ordering::Relaxed);
    }

    /// 刷新整个 TLB（测试中只计数）
    pub fn tlb_invalidate_all(&self) {
        self.full_flushes.fetch_add(1, Ordering::Relaxed);
    }

    /// 已记录的单项失效次数
    pub fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::Relaxed)
    }

    /// 已记录的全量刷新次数
    pub fn full_flushes(&self) -> usize {
        self.full_flushes.load(Ordering::Relaxed)
    }
}

/// 全局 Mock 实例
pub static MOCK_MM_OPS: MockMmOps = MockMmOps::new();

/// Mock 的内存管理配置
pub struct MockMmConfig;

impl MockMmConfig {
    pub const fn new() -> Self {
        Self
    }

    pub fn user_space_start(&self) -> usize {
        0x1000
    }

    pub fn mmap_base(&self) -> usize {
        0x1000_0000
    }

    pub fn user_stack_top(&self) -> usize {
        0x8000_0000
    }

    pub fn user_stack_size(&self) -> usize {
        16 * PAGE_SIZE
    }

    pub fn max_user_heap_size(&self) -> usize {
        1024 * 1024
    }
}

/// 全局 Mock 实例
pub static MOCK_MM_CONFIG: MockMmConfig = MockMmConfig::new();
