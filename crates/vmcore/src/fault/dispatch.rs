//! 缺页分派

use super::{fault_stats, AccessKind, FaultError, FaultInfo, Resolution};
use crate::address::{AlignOps, PageNum, Ppn, UsizeConvert, Vaddr};
use crate::arch_ops::arch_ops;
use crate::frame_allocator::{frame_bytes, FrameTracker};
use crate::memory_space::{AddressSpace, RegionProt};
use crate::page_table::{PageTableEntry, PagingArch, UniversalPTEFlag};

/// 经自映射窗口装入的页表页在上级表中的标志
///
/// 该项在真实页表树中是一个指向下级页表的表项，权限须不收窄其下的任何映射。
const fn table_page_flags() -> UniversalPTEFlag {
    UniversalPTEFlag::PROT_MASK
}

fn invalidate(va: Vaddr, slot_va: Vaddr) {
    let ops = arch_ops();
    ops.tlb_invalidate(va.as_usize());
    ops.tlb_invalidate(slot_va.as_usize());
}

impl<A: PagingArch> AddressSpace<A> {
    /// 解决一次缺页，成功时返回走过的分支
    ///
    /// 只负责 RESOLVED 的收尾（写入表项并失效 TLB）；失败的收尾
    /// （日志、停机或投递信号）由 [`crate::fault::handle_page_fault`] 完成。
    pub fn resolve_fault(&mut self, info: &FaultInfo) -> Result<Resolution, FaultError> {
        let stats = fault_stats();
        stats.incr_total();
        let result = self.dispatch(info);
        if result.is_err() {
            stats.incr_failures();
        }
        result
    }

    fn dispatch(&mut self, info: &FaultInfo) -> Result<Resolution, FaultError> {
        let page = info.va.align_down_to_page();
        let (snapshot, level) = self.page_table.probe(page);
        if snapshot.is_guard() {
            log::debug!("fault at {:?}: guard entry", info.va);
            return Err(FaultError::RegionOverrun);
        }

        // 叶子尚未装载时先预分配，用不上的分支在返回时自动归还
        let frames = self.frames.clone();
        let prealloc = if snapshot.is_loaded() {
            None
        } else {
            Some(FrameTracker::alloc(frames.as_ref()).ok_or(FaultError::OutOfMemory)?)
        };

        if info.privileged && A::in_self_map(info.va) {
            log::trace!("fault at {:?}: page table metadata", info.va);
            return self.resolve_kernel(page, prealloc);
        }

        let Some(region) = self.regions.find(page) else {
            return Err(FaultError::Unmapped);
        };

        if snapshot.is_loaded() {
            let cow = snapshot.is_write_protected()
                && info.access == AccessKind::Write
                && !info.privileged
                && region.prot().contains(RegionProt::WRITE);
            if !cow {
                return Err(FaultError::InvalidAccess);
            }
            if level != A::LEAF_LEVEL {
                log::warn!("fault at {:?}: copy-on-write of a huge entry", info.va);
                return Err(FaultError::InvalidAccess);
            }
            return self.resolve_cow(page, snapshot);
        }

        let frame = prealloc.ok_or(FaultError::OutOfMemory)?;
        let flags = region.prot().to_pte_flags(A::is_user_addr(page));
        frame.zero();
        let resolution = match region.file() {
            None => Resolution::Anonymous,
            Some(file) => {
                let offset = file.offset_of_page(region.page_index(page));
                // SAFETY: 预分配帧尚未装入任何页表，由本次缺页独占
                let buf = unsafe { frame_bytes(frame.paddr()) };
                let read = file.file.populate_page(buf, offset).map_err(|errno| {
                    log::warn!("fault at {:?}: populate at {:#x} failed ({})", info.va, offset, errno);
                    FaultError::IoError(errno)
                })?;
                log::trace!("fault at {:?}: {} bytes from offset {:#x}", info.va, read, offset);
                Resolution::File
            }
        };

        self.install(page, flags, frame)?;
        match resolution {
            Resolution::File => fault_stats().incr_file(),
            _ => fault_stats().incr_zero_fill(),
        }
        Ok(resolution)
    }

    fn install(
        &mut self,
        page: Vaddr,
        flags: UniversalPTEFlag,
        frame: FrameTracker<'_>,
    ) -> Result<(), FaultError> {
        let mut slot = self.page_table.walk(page, A::LEAF_LEVEL, true)?;
        if slot.level() != A::LEAF_LEVEL || slot.read().is_loaded() {
            return Err(FaultError::InvalidAccess);
        }
        slot.write(A::Entry::make_leaf(frame.leak(), flags).mark_loaded());
        invalidate(page, slot.slot_vaddr());
        Ok(())
    }

    fn resolve_kernel(
        &mut self,
        page: Vaddr,
        prealloc: Option<FrameTracker<'_>>,
    ) -> Result<Resolution, FaultError> {
        // 已装载：不是缺少页表，而是越权访问
        let frame = prealloc.ok_or(FaultError::InvalidAccess)?;
        frame.zero();
        let mut slot = self.page_table.walk(page, A::LEAF_LEVEL, true)?;
        if slot.level() != A::LEAF_LEVEL || !slot.read().is_empty() {
            return Err(FaultError::InvalidAccess);
        }
        let table = frame.leak();
        slot.write(
            A::Entry::make_leaf(table, table_page_flags())
                .mark_loaded()
                .mark_pinned(),
        );
        let slot_va = slot.slot_vaddr();
        self.page_table.pool().adopt_table(table);
        invalidate(page, slot_va);
        fault_stats().incr_kernel();
        Ok(Resolution::Kernel)
    }

    fn resolve_cow(&mut self, page: Vaddr, snapshot: A::Entry) -> Result<Resolution, FaultError> {
        let frames = self.frames.clone();
        let mut slot = self.page_table.walk(page, A::LEAF_LEVEL, false)?;
        let old = snapshot.frame_of();
        let reused = frames.reference_count(old) == 1;
        let entry = if reused {
            snapshot.mark_writable()
        } else {
            let copy = frames.duplicate_frame(old).ok_or(FaultError::OutOfMemory)?;
            frames.remove_reference(old);
            A::Entry::new_leaf(Ppn::from_addr_floor(copy), snapshot.flags())
                .mark_writable()
                .mark_clean()
                .mark_untouched()
        };
        log::debug!(
            "cow at {:?}: {:?} -> {:?}{}",
            page,
            old,
            entry.frame_of(),
            if reused { " (reused)" } else { "" }
        );
        slot.write(entry);
        invalidate(page, slot.slot_vaddr());
        fault_stats().incr_cow(reused);
        Ok(Resolution::Cow)
    }
}
