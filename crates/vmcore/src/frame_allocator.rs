//! 帧分配器模块
//!
//! 本模块提供物理内存帧的分配、引用计数和跟踪功能。
//!
//! ## 协作者接口
//!
//! 虚拟内存核心只通过 [`FrameAllocator`] trait 使用物理帧：
//! 分配、释放、按内容复制（写时复制）以及引用计数增减。
//! 每个已装载的叶子页表项持有其物理帧的一个引用，最后一个引用消失时帧被回收。
//!
//! ## 分配策略（位图 + 引用计数）
//!
//! - **bitmap**：每个 bit 表示一个物理帧（0=空闲，1=已分配）
//! - **refcounts**：每个帧一个引用计数，分配时为 1
//! - **last_alloc_hint**：上次分配位置提示，利用局部性加速查找
//!
//! 不在管理范围内的帧（MMIO、内核镜像）视为非托管帧，对其的引用计数操作为空操作。
//!
//! ## RAII：自动回收
//!
//! [`FrameTracker`] 在 `Drop` 时归还一个引用；缺页处理的预分配帧即由它持有，
//! 只有真正装入页表项时才调用 [`FrameTracker::leak`] 交出所有权。

use crate::address::{Paddr, PageNum, Ppn, PpnRange, UsizeConvert, PAGE_SIZE};
use crate::lock::SpinLock;
use alloc::sync::Arc;
use alloc::vec::Vec;
use lazy_static::lazy_static;

// ============================================================================
// FrameAllocator - 协作者接口
// ============================================================================

/// 物理帧分配器接口
pub trait FrameAllocator: Send + Sync {
    /// 分配一个物理帧，引用计数为 1；内容未定义
    fn allocate_frame(&self) -> Option<Paddr>;

    /// 无条件释放一个物理帧（不论引用计数）
    fn free_frame(&self, frame: Paddr);

    /// 分配一个新帧并复制 `frame` 的内容，新帧引用计数为 1
    fn duplicate_frame(&self, frame: Paddr) -> Option<Paddr>;

    /// 增加一个引用
    fn add_reference(&self, frame: Paddr);

    /// 减少一个引用，返回剩余引用数；降为 0 时帧被回收
    fn remove_reference(&self, frame: Paddr) -> usize;

    /// 当前引用数（非托管帧为 0）
    fn reference_count(&self, frame: Paddr) -> usize;
}

// ============================================================================
// FrameTracker - 单帧 RAII 封装
// ============================================================================

/// 物理帧跟踪器。
/// 实现了 RAII 模式：当此结构体被 drop 时，它持有的引用会被归还给分配器。
pub struct FrameTracker<'a> {
    paddr: Paddr,
    frames: &'a dyn FrameAllocator,
}

impl<'a> FrameTracker<'a> {
    /// 从分配器取得一个帧
    pub fn alloc(frames: &'a dyn FrameAllocator) -> Option<Self> {
        frames
            .allocate_frame()
            .map(|paddr| FrameTracker { paddr, frames })
    }

    /// 帧的物理地址
    pub fn paddr(&self) -> Paddr {
        self.paddr
    }

    /// 将整帧清零
    pub fn zero(&self) {
        clear_frame(self.paddr);
    }

    /// 放弃跟踪，引用的所有权转交给调用者（通常是一个页表项）
    pub fn leak(self) -> Paddr {
        let paddr = self.paddr;
        core::mem::forget(self);
        paddr
    }
}

impl Drop for FrameTracker<'_> {
    fn drop(&mut self) {
        self.frames.remove_reference(self.paddr);
    }
}

impl core::fmt::Debug for FrameTracker<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("FrameTracker").field(&self.paddr).finish()
    }
}

// ============================================================================
// 辅助函数
// ============================================================================

/// 将指定的物理页帧清零。
pub fn clear_frame(paddr: Paddr) {
    // SAFETY: 直接映射覆盖所有物理帧，且帧由调用者独占
    unsafe { core::ptr::write_bytes(paddr.as_mut_ptr::<u8>(), 0, PAGE_SIZE) };
}

/// 将 `src` 帧的内容复制到 `dst` 帧。
pub fn copy_frame(dst: Paddr, src: Paddr) {
    // SAFETY: 两个帧都经直接映射可访问且互不重叠
    unsafe {
        core::ptr::copy_nonoverlapping(
            src.as_mut_ptr::<u8>() as *const u8,
            dst.as_mut_ptr::<u8>(),
            PAGE_SIZE,
        )
    };
}

/// 以字节切片的形式访问一个物理帧
///
/// # Safety
/// 调用者必须保证在返回切片存活期间没有其它对该帧的可变访问。
pub unsafe fn frame_bytes(paddr: Paddr) -> &'static mut [u8] {
    unsafe { core::slice::from_raw_parts_mut(paddr.as_mut_ptr::<u8>(), PAGE_SIZE) }
}

// ============================================================================
// 位图帧分配器
// ============================================================================

/// 物理帧分配器。
/// 采用位图策略跟踪每个物理帧的分配状态，并为每帧维护引用计数。
pub struct BitmapFrameAllocator {
    /// 物理帧的起始 Ppn。
    start: Ppn,
    /// 物理帧的结束 Ppn (不包含)。
    end: Ppn,
    /// 位图数据（每个 bit 表示一个帧：0=空闲，1=已分配）。
    bitmap: Vec<u64>,
    /// 每帧的引用计数
    refcounts: Vec<u32>,
    /// 总帧数。
    total_frames: usize,
    /// 已分配帧数（用于快速统计）。
    allocated_count: usize,
    /// 上次分配的位置提示（用于加速单帧分配）。
    last_alloc_hint: usize,
}

impl BitmapFrameAllocator {
    /// 创建一个未初始化的帧分配器实例。
    pub const fn new() -> Self {
        BitmapFrameAllocator {
            start: Ppn(0),
            end: Ppn(0),
            bitmap: Vec::new(),
            refcounts: Vec::new(),
            total_frames: 0,
            allocated_count: 0,
            last_alloc_hint: 0,
        }
    }

    /// 初始化帧分配器，设置可用的物理内存范围。
    pub fn init(&mut self, start: Ppn, end: Ppn) {
        self.start = start;
        self.end = end;
        self.total_frames = end.as_usize() - start.as_usize();
        self.bitmap = alloc::vec![0u64; self.total_frames.div_ceil(64)];
        self.refcounts = alloc::vec![0u32; self.total_frames];
        self.allocated_count = 0;
        self.last_alloc_hint = 0;
    }

    /// 帧是否由本分配器管理
    #[inline]
    pub fn manages(&self, ppn: Ppn) -> bool {
        ppn >= self.start && ppn < self.end
    }

    #[inline]
    fn index_of(&self, ppn: Ppn) -> usize {
        ppn.as_usize() - self.start.as_usize()
    }

    #[inline]
    fn is_free(&self, frame_idx: usize) -> bool {
        (self.bitmap[frame_idx / 64] & (1u64 << (frame_idx % 64))) == 0
    }

    #[inline]
    fn mark_allocated(&mut self, frame_idx: usize) {
        self.bitmap[frame_idx / 64] |= 1u64 << (frame_idx % 64);
        self.refcounts[frame_idx] = 1;
        self.allocated_count += 1;
    }

    #[inline]
    fn mark_free(&mut self, frame_idx: usize) {
        self.bitmap[frame_idx / 64] &= !(1u64 << (frame_idx % 64));
        self.refcounts[frame_idx] = 0;
        self.allocated_count -= 1;
    }

    /// 分配一个物理帧。
    /// 从 last_alloc_hint 开始循环查找第一个空闲位。
    pub fn alloc_frame(&mut self) -> Option<Ppn> {
        let bitmap_len = self.bitmap.len();
        for offset in 0..bitmap_len {
            let idx = (self.last_alloc_hint + offset) % bitmap_len;
            let word = self.bitmap[idx];
            // 快速跳过全满的 u64
            if word == u64::MAX {
                continue;
            }
            let frame_idx = idx * 64 + (!word).trailing_zeros() as usize;
            if frame_idx >= self.total_frames {
                continue;
            }
            self.mark_allocated(frame_idx);
            self.last_alloc_hint = idx;
            return Some(self.start + frame_idx);
        }
        None // 内存耗尽
    }

    /// 分配指定数量的**连续**物理帧。
    pub fn alloc_contig_frames(&mut self, num: usize) -> Option<PpnRange> {
        if num == 0 || num > self.total_frames - self.allocated_count {
            return None;
        }
        let mut consecutive = 0;
        let mut start_frame = 0;
        for frame_idx in 0..self.total_frames {
            if !self.is_free(frame_idx) {
                consecutive = 0;
                continue;
            }
            if consecutive == 0 {
                start_frame = frame_idx;
            }
            consecutive += 1;
            if consecutive == num {
                for i in 0..num {
                    self.mark_allocated(start_frame + i);
                }
                return Some(PpnRange::from_start_len(self.start + start_frame, num));
            }
        }
        None
    }

    /// 回收一个物理帧（忽略引用计数）。
    pub fn dealloc_frame(&mut self, ppn: Ppn) {
        if !self.manages(ppn) {
            return;
        }
        let frame_idx = self.index_of(ppn);
        debug_assert!(
            !self.is_free(frame_idx),
            "dealloc_frame: double free detected" // 检测到重复释放
        );
        if !self.is_free(frame_idx) {
            self.mark_free(frame_idx);
        }
    }

    /// 增加引用计数
    pub fn inc_ref(&mut self, ppn: Ppn) {
        if !self.manages(ppn) {
            return;
        }
        let frame_idx = self.index_of(ppn);
        debug_assert!(!self.is_free(frame_idx), "inc_ref: frame not allocated");
        self.refcounts[frame_idx] += 1;
    }

    /// 减少引用计数，降为 0 时回收，返回剩余计数
    pub fn dec_ref(&mut self, ppn: Ppn) -> usize {
        if !self.manages(ppn) {
            return 0;
        }
        let frame_idx = self.index_of(ppn);
        debug_assert!(
            self.refcounts[frame_idx] > 0,
            "dec_ref: double free detected" // 检测到重复释放
        );
        match self.refcounts[frame_idx] {
            0 => 0,
            1 => {
                self.mark_free(frame_idx);
                0
            }
            n => {
                self.refcounts[frame_idx] = n - 1;
                (n - 1) as usize
            }
        }
    }

    /// 当前引用计数
    pub fn ref_count(&self, ppn: Ppn) -> usize {
        if !self.manages(ppn) {
            return 0;
        }
        self.refcounts[self.index_of(ppn)] as usize
    }

    /// 获取帧分配器的当前状态：(总帧数, 已分配帧数, 空闲帧数)
    pub fn get_stats(&self) -> (usize, usize, usize) {
        (
            self.total_frames,
            self.allocated_count,
            self.total_frames - self.allocated_count,
        )
    }
}

impl Default for BitmapFrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// 带锁的分配器
// ============================================================================

/// 由自旋锁保护的位图分配器，实现 [`FrameAllocator`]
pub struct LockedFrameAllocator {
    inner: SpinLock<BitmapFrameAllocator>,
}

impl LockedFrameAllocator {
    /// 创建一个空分配器，需随后调用 [`LockedFrameAllocator::init`]
    pub const fn empty() -> Self {
        Self {
            inner: SpinLock::new(BitmapFrameAllocator::new()),
        }
    }

    /// 管理物理地址区间 `[start_addr, end_addr)` 的分配器
    pub fn new(start_addr: usize, end_addr: usize) -> Self {
        let allocator = Self::empty();
        allocator.init(start_addr, end_addr);
        allocator
    }

    /// 设置（或重置）可用物理内存范围
    pub fn init(&self, start_addr: usize, end_addr: usize) {
        // 起始地址向上取整、结束地址向下取整到页号
        let start_ppn = Ppn::from_addr_ceil(Paddr::from_usize(start_addr));
        let end_ppn = Ppn::from_addr_floor(Paddr::from_usize(end_addr));
        self.inner.lock().init(start_ppn, end_ppn);
    }

    /// 分配连续的物理帧（用于页表池的启动保留区）
    pub fn alloc_contig(&self, num: usize) -> Option<PpnRange> {
        self.inner.lock().alloc_contig_frames(num)
    }

    /// (总帧数, 已分配帧数, 空闲帧数)
    pub fn stats(&self) -> (usize, usize, usize) {
        self.inner.lock().get_stats()
    }
}

impl FrameAllocator for LockedFrameAllocator {
    fn allocate_frame(&self) -> Option<Paddr> {
        self.inner.lock().alloc_frame().map(Ppn::start_addr)
    }

    fn free_frame(&self, frame: Paddr) {
        self.inner.lock().dealloc_frame(Ppn::from_addr_floor(frame));
    }

    fn duplicate_frame(&self, frame: Paddr) -> Option<Paddr> {
        let copy = self.allocate_frame()?;
        copy_frame(copy, frame);
        Some(copy)
    }

    fn add_reference(&self, frame: Paddr) {
        self.inner.lock().inc_ref(Ppn::from_addr_floor(frame));
    }

    fn remove_reference(&self, frame: Paddr) -> usize {
        self.inner.lock().dec_ref(Ppn::from_addr_floor(frame))
    }

    fn reference_count(&self, frame: Paddr) -> usize {
        self.inner.lock().ref_count(Ppn::from_addr_floor(frame))
    }
}

// ============================================================================
// 全局帧分配器
// ============================================================================

lazy_static! {
    /// 全局物理帧分配器。
    static ref FRAME_ALLOCATOR: LockedFrameAllocator = LockedFrameAllocator::empty();
}

/// 使用可用的物理内存范围初始化全局帧分配器。
///
/// # 参数
///
/// * `start_addr` - 可用物理内存的起始地址
/// * `end_addr` - 可用物理内存的结束地址
pub fn init_frame_allocator(start_addr: usize, end_addr: usize) {
    FRAME_ALLOCATOR.init(start_addr, end_addr);
    let (total, _, _) = FRAME_ALLOCATOR.stats();
    log::info!(
        "frame allocator: [{:#x}, {:#x}) {} frames",
        start_addr,
        end_addr,
        total
    );
}

/// 全局帧分配器的句柄，可作为 `Arc<dyn FrameAllocator>` 交给地址空间
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalFrameAllocator;

impl GlobalFrameAllocator {
    /// 以 trait 对象形式返回
    pub fn shared() -> Arc<dyn FrameAllocator> {
        Arc::new(GlobalFrameAllocator)
    }

    /// 全局分配器的 (总帧数, 已分配帧数, 空闲帧数)
    pub fn stats() -> (usize, usize, usize) {
        FRAME_ALLOCATOR.stats()
    }
}

impl FrameAllocator for GlobalFrameAllocator {
    fn allocate_frame(&self) -> Option<Paddr> {
        FRAME_ALLOCATOR.allocate_frame()
    }

    fn free_frame(&self, frame: Paddr) {
        FRAME_ALLOCATOR.free_frame(frame)
    }

    fn duplicate_frame(&self, frame: Paddr) -> Option<Paddr> {
        FRAME_ALLOCATOR.duplicate_frame(frame)
    }

    fn add_reference(&self, frame: Paddr) {
        FRAME_ALLOCATOR.add_reference(frame)
    }

    fn remove_reference(&self, frame: Paddr) -> usize {
        FRAME_ALLOCATOR.remove_reference(frame)
    }

    fn reference_count(&self, frame: Paddr) -> usize {
        FRAME_ALLOCATOR.reference_count(frame)
    }
}
