//! 架构相关内存管理操作 trait 定义和注册

use core::sync::atomic::{AtomicUsize, Ordering};

/// 架构相关内存管理操作
///
/// 此 trait 抽象了架构特定的内存操作：内核直接映射下的地址转换，
/// 以及本地 TLB（地址转换缓存）的失效操作。
/// os crate 需要为具体架构实现此 trait。
pub trait ArchMmOps: Send + Sync {
    /// 将虚拟地址转换为物理地址（直接映射区域）
    ///
    /// # Safety
    /// 调用者必须确保虚拟地址已经映射
    unsafe fn vaddr_to_paddr(&self, vaddr: usize) -> usize;

    /// 将物理地址转换为虚拟地址（直接映射区域）
    ///
    /// 页表遍历器通过它读写任意一级页表。
    fn paddr_to_vaddr(&self, paddr: usize) -> usize;

    /// 使单个虚拟地址的地址转换缓存失效
    fn tlb_invalidate(&self, vaddr: usize);

    /// 使从 `vaddr` 开始的 `pages` 个页的地址转换缓存失效
    fn tlb_invalidate_range(&self, vaddr: usize, pages: usize);

    /// 使全部地址转换缓存失效
    fn tlb_invalidate_all(&self);
}

/// 超过此页数的批量失效直接退化为全量刷新
pub const TLB_FLUSH_ALL_THRESHOLD: usize = 64;

/// 按页数选择逐页失效或全量刷新
pub fn flush_range(vaddr: usize, pages: usize) {
    if pages == 0 {
        return;
    }
    if pages > TLB_FLUSH_ALL_THRESHOLD {
        arch_ops().tlb_invalidate_all();
    } else {
        arch_ops().tlb_invalidate_range(vaddr, pages);
    }
}

static ARCH_OPS_DATA: AtomicUsize = AtomicUsize::new(0);
static ARCH_OPS_VTABLE: AtomicUsize = AtomicUsize::new(0);

/// 注册架构操作实现
///
/// # Safety
/// 必须在单线程环境下调用，且只能调用一次
pub unsafe fn register_arch_ops(ops: &'static dyn ArchMmOps) {
    let ptr = ops as *const dyn ArchMmOps;
    // SAFETY: 将 fat pointer 拆分为 data 和 vtable 两部分存储
    let (data, vtable) =
        unsafe { core::mem::transmute::<*const dyn ArchMmOps, (usize, usize)>(ptr) };
    ARCH_OPS_VTABLE.store(vtable, Ordering::Release);
    ARCH_OPS_DATA.store(data, Ordering::Release);
}

/// 获取已注册的架构操作实现
///
/// # Panics
/// 如果尚未调用 [`register_arch_ops`] 注册实现，则 panic
#[inline]
pub fn arch_ops() -> &'static dyn ArchMmOps {
    let data = ARCH_OPS_DATA.load(Ordering::Acquire);
    let vtable = ARCH_OPS_VTABLE.load(Ordering::Acquire);
    if data == 0 {
        panic!("vmcore: ArchMmOps not registered");
    }
    // SAFETY: 重组 fat pointer
    unsafe { &*core::mem::transmute::<(usize, usize), *const dyn ArchMmOps>((data, vtable)) }
}
