//! 测试辅助与场景测试
//!
//! 协作者的 Mock 实现在 `test-support` 中；这里为它们实现本 crate 的 trait，
//! 并提供一个极简的 MMU 模拟：按页表翻译、检查权限、缺页后重试。

extern crate std;

mod fork;

use crate::address::{Paddr, UsizeConvert, Vaddr};
use crate::fault::{handle_page_fault, AccessKind, FaultError, FaultInfo, FaultTaskOps};
use crate::file::{MmFile, MmInode};
use crate::frame_allocator::LockedFrameAllocator;
use crate::memory_space::AddressSpace;
use crate::page_table::{PageTableEntry, PagingArch, TablePool, UniversalPTEFlag};
use crate::{ArchMmOps, MmConfig};
use alloc::sync::Arc;
use alloc::vec::Vec;
use std::sync::Once;
use test_support::mock::fs::{MockFile, MockInode};
use test_support::mock::mm::{MockMmConfig, MockMmOps, MOCK_MM_CONFIG, MOCK_MM_OPS, PHYS_ARENA};
use test_support::mock::task::MockTask;

impl ArchMmOps for MockMmOps {
    unsafe fn vaddr_to_paddr(&self, vaddr: usize) -> usize {
        unsafe { MockMmOps::vaddr_to_paddr(self, vaddr) }
    }

    fn paddr_to_vaddr(&self, paddr: usize) -> usize {
        MockMmOps::paddr_to_vaddr(self, paddr)
    }

    fn tlb_invalidate(&self, vaddr: usize) {
        MockMmOps::tlb_invalidate(self, vaddr)
    }

    fn tlb_invalidate_range(&self, vaddr: usize, pages: usize) {
        MockMmOps::tlb_invalidate_range(self, vaddr, pages)
    }

    fn tlb_invalidate_all(&self) {
        MockMmOps::tlb_invalidate_all(self)
    }
}

impl MmConfig for MockMmConfig {
    fn user_space_start(&self) -> usize {
        MockMmConfig::user_space_start(self)
    }

    fn mmap_base(&self) -> usize {
        MockMmConfig::mmap_base(self)
    }

    fn user_stack_top(&self) -> usize {
        MockMmConfig::user_stack_top(self)
    }

    fn user_stack_size(&self) -> usize {
        MockMmConfig::user_stack_size(self)
    }

    fn max_user_heap_size(&self) -> usize {
        MockMmConfig::max_user_heap_size(self)
    }
}

impl MmInode for MockInode {
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, isize> {
        MockInode::read_at(self, offset, buf)
    }

    fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize, isize> {
        MockInode::write_at(self, offset, buf)
    }
}

impl MmFile for MockFile {
    fn inode(&self) -> Result<Arc<dyn MmInode>, isize> {
        let inode: Arc<dyn MmInode> = self.inode.clone();
        Ok(inode)
    }
}

impl FaultTaskOps for MockTask {
    fn deliver_fault_signal(&self, signo: u32) {
        MockTask::deliver_fault_signal(self, signo)
    }

    fn yield_now(&self) {
        MockTask::yield_now(self)
    }
}

static INIT: Once = Once::new();

/// 注册 Mock 协作者（幂等）
pub fn setup() {
    INIT.call_once(|| unsafe {
        crate::register_arch_ops(&MOCK_MM_OPS);
        crate::register_config(&MOCK_MM_CONFIG);
    });
}

/// 在模拟物理内存中切出 `pages` 页，交给一个独立的帧分配器
pub fn test_allocator(pages: usize) -> Arc<LockedFrameAllocator> {
    setup();
    let (start, end) = PHYS_ARENA.carve(pages);
    Arc::new(LockedFrameAllocator::new(start, end))
}

/// 基于 `frames` 的动态页表池
pub fn test_pool(frames: &Arc<LockedFrameAllocator>) -> Arc<TablePool> {
    Arc::new(TablePool::new(frames.clone()))
}

/// 新建一个地址空间，返回它和底层帧分配器
pub fn test_space<A: PagingArch>(pages: usize) -> (AddressSpace<A>, Arc<LockedFrameAllocator>) {
    let frames = test_allocator(pages);
    let space = AddressSpace::new(test_pool(&frames)).unwrap();
    (space, frames)
}

/// 按页表检查一次用户态访问，允许时返回物理地址
pub fn check_access<A: PagingArch>(
    space: &AddressSpace<A>,
    va: Vaddr,
    access: AccessKind,
) -> Option<Paddr> {
    let (paddr, flags) = space.page_table().translate(va)?;
    let needed = match access {
        AccessKind::Read => UniversalPTEFlag::READABLE,
        AccessKind::Write => UniversalPTEFlag::WRITEABLE,
        AccessKind::Execute => UniversalPTEFlag::EXECUTABLE,
    };
    flags
        .contains(needed | UniversalPTEFlag::USER_ACCESSIBLE)
        .then_some(paddr)
}

/// 模拟一次用户态访问：缺页则处理后重试，返回经历的缺页次数
pub fn touch<A: PagingArch>(
    space: &mut AddressSpace<A>,
    va: Vaddr,
    access: AccessKind,
    task: &MockTask,
) -> Result<usize, FaultError> {
    for faults in 0..4 {
        if check_access(space, va, access).is_some() {
            if access == AccessKind::Write {
                // 硬件置脏
                let mut slot = space.page_table_mut().walk(va, A::LEAF_LEVEL, false).unwrap();
                let entry = slot.read().mark_dirty();
                slot.write(entry);
            }
            return Ok(faults);
        }
        handle_page_fault(space, &FaultInfo::user(va, access), task)?;
    }
    panic!("access at {:?} keeps faulting", va);
}

/// 模拟用户态写入
pub fn store<A: PagingArch>(
    space: &mut AddressSpace<A>,
    va: Vaddr,
    bytes: &[u8],
    task: &MockTask,
) -> Result<(), FaultError> {
    touch(space, va, AccessKind::Write, task)?;
    let paddr = check_access(space, va, AccessKind::Write).unwrap();
    let host = PHYS_ARENA.to_host(paddr.as_usize()) as *mut u8;
    unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), host, bytes.len()) };
    Ok(())
}

/// 模拟用户态读取
pub fn load<A: PagingArch>(
    space: &mut AddressSpace<A>,
    va: Vaddr,
    len: usize,
    task: &MockTask,
) -> Result<Vec<u8>, FaultError> {
    touch(space, va, AccessKind::Read, task)?;
    let paddr = check_access(space, va, AccessKind::Read).unwrap();
    let host = PHYS_ARENA.to_host(paddr.as_usize()) as *const u8;
    Ok(unsafe { core::slice::from_raw_parts(host, len) }.to_vec())
}

/// `va` 处叶子表项引用的物理帧
pub fn frame_at<A: PagingArch>(space: &AddressSpace<A>, va: Vaddr) -> Option<Paddr> {
    let (entry, _) = space.page_table().probe(va);
    entry.is_loaded().then(|| entry.frame_of())
}
