//! 地址空间核心实现

use core::cmp::Ordering;

use crate::address::{AlignOps, UsizeConvert, Vaddr, PAGE_SIZE};
use crate::arch_ops::{arch_ops, flush_range};
use crate::fault::{AccessKind, FaultInfo};
use crate::frame_allocator::FrameAllocator;
use crate::memory_space::{AreaType, MmapFile, Region, RegionAttrs, RegionList, RegionProt, ShareMode};
use crate::mm_config;
use crate::file::MmFile;
use crate::page_table::{
    PageTable, PageTableEntry, PagingArch, PagingError, PagingResult, TablePool, UniversalPTEFlag,
};
use alloc::sync::Arc;
use uapi::mm::{MapFlags, MsyncFlags, ProtFlags};

/// 一个地址空间：根页表 + 区域登记表
pub struct AddressSpace<A: PagingArch> {
    /// 与此地址空间关联的页表
    pub(crate) page_table: PageTable<A>,

    /// 此地址空间中的区域
    pub(crate) regions: RegionList,

    /// 物理帧分配器（与页表池共用）
    pub(crate) frames: Arc<dyn FrameAllocator>,

    /// 堆的起始地址 (brk 的下界)
    pub(crate) heap_start: Option<Vaddr>,
}

impl<A: PagingArch> AddressSpace<A> {
    /// 创建一个空地址空间
    pub fn new(pool: Arc<TablePool>) -> PagingResult<Self> {
        let frames = pool.frames().clone();
        Ok(Self {
            page_table: PageTable::new(pool)?,
            regions: RegionList::new(),
            frames,
            heap_start: None,
        })
    }

    /// 创建一个共享 `kernel` 内核映射的地址空间
    pub fn new_with_kernel(pool: Arc<TablePool>, kernel: &PageTable<A>) -> PagingResult<Self> {
        let frames = pool.frames().clone();
        Ok(Self {
            page_table: PageTable::new_with_kernel(pool, kernel)?,
            regions: RegionList::new(),
            frames,
            heap_start: None,
        })
    }

    /// 返回页表的引用
    pub fn page_table(&self) -> &PageTable<A> {
        &self.page_table
    }

    /// 返回页表的可变引用
    pub fn page_table_mut(&mut self) -> &mut PageTable<A> {
        &mut self.page_table
    }

    /// 返回区域登记表
    pub fn regions(&self) -> &RegionList {
        &self.regions
    }

    /// 物理帧分配器
    pub fn frames(&self) -> &Arc<dyn FrameAllocator> {
        &self.frames
    }

    /// 登记一个区域；页表项由缺页按需建立
    pub fn map_region(&mut self, region: Region) -> PagingResult<()> {
        log::debug!("map region {:?}", region);
        self.regions.insert(region)
    }

    /// 在 `va` 所在页放置保护哨兵
    pub fn set_guard(&mut self, va: Vaddr) -> PagingResult<()> {
        let mut slot = self
            .page_table
            .walk(va.align_down_to_page(), A::LEAF_LEVEL, true)?;
        if slot.level() != A::LEAF_LEVEL {
            return Err(PagingError::HugePageConflict);
        }
        if slot.read().is_loaded() {
            return Err(PagingError::AlreadyMapped);
        }
        slot.write(A::Entry::GUARD);
        Ok(())
    }

    /// 建立一个 mmap 映射，返回起始地址
    ///
    /// `file` 为 `(文件, 页对齐的偏移)`；匿名映射必须带 `MAP_ANONYMOUS` 且不带文件。
    pub fn mmap(
        &mut self,
        hint: Vaddr,
        len: usize,
        prot: ProtFlags,
        flags: MapFlags,
        file: Option<(Arc<dyn MmFile>, usize)>,
    ) -> PagingResult<Vaddr> {
        if len == 0 {
            return Err(PagingError::InvalidAddress);
        }
        if flags.contains(MapFlags::ANONYMOUS) == file.is_some() {
            return Err(PagingError::InvalidFlags);
        }
        if file.as_ref().is_some_and(|(_, offset)| offset % PAGE_SIZE != 0) {
            return Err(PagingError::InvalidAddress);
        }
        let share = ShareMode::from_mmap(prot, flags)?;
        let len = page_round_up(len)?;
        let user_start = mm_config().user_space_start();
        let user_end = A::user_space_end();
        let fixed = flags.contains(MapFlags::FIXED);

        let start = if fixed {
            if !hint.is_page_aligned()
                || hint.as_usize() < user_start
                || hint.as_usize().saturating_add(len) > user_end
            {
                return Err(PagingError::InvalidAddress);
            }
            hint
        } else {
            let base = Vaddr::from_usize(mm_config().mmap_base());
            let from = hint.checked_align_up_to_page().map_or(base, |hint| hint.max(base));
            self.regions
                .find_free(from, Vaddr::from_usize(user_end), len)
                .or_else(|| {
                    self.regions
                        .find_free(Vaddr::from_usize(user_start), Vaddr::from_usize(user_end), len)
                })
                .ok_or(PagingError::OutOfMemory)?
        };

        let attrs = RegionAttrs::new(RegionProt::from(prot), share, AreaType::UserMmap);
        let mut region = Region::from_start_len(start, len, attrs)?;
        if let Some((file, offset)) = file {
            region = region.with_file(MmapFile::new(file, offset, len));
        }
        // 所有检查通过后才替换旧映射
        if fixed {
            self.unmap(start, len)?;
        }
        self.map_region(region)?;
        Ok(start)
    }

    /// 解除 `[start, start + len)` 的映射
    ///
    /// 跨越边界的区域被切开；读写共享文件区域中的脏页先写回。
    pub fn unmap(&mut self, start: Vaddr, len: usize) -> PagingResult<()> {
        if !start.is_page_aligned() || len == 0 {
            return Err(PagingError::InvalidAddress);
        }
        let end = range_end(start, len)?;

        let removed = self.regions.carve(start, end)?;
        let mut result = Ok(());
        for region in &removed {
            if let Err(err) = writeback(&mut self.page_table, region, start, end, false) {
                log::warn!("munmap: writeback of {:?} failed: {}", region, err);
                result = Err(err);
            }
        }
        let released = self.page_table.unmap_range(start, end);
        flush_range(start.as_usize(), (end - start) / PAGE_SIZE);
        log::debug!(
            "munmap [{:?}, {:?}): {} regions, {} pages",
            start,
            end,
            removed.len(),
            released
        );
        for region in removed {
            region.release();
        }
        result
    }

    /// 将 `[start, start + len)` 中读写共享文件区域的脏页写回文件
    pub fn msync(&mut self, start: Vaddr, len: usize, flags: MsyncFlags) -> PagingResult<()> {
        if !start.is_page_aligned() {
            return Err(PagingError::InvalidAddress);
        }
        if flags.contains(MsyncFlags::ASYNC | MsyncFlags::SYNC) {
            return Err(PagingError::InvalidFlags);
        }
        let end = range_end(start, len)?;
        if !self.regions.overlaps(start, end) {
            return Err(PagingError::NotMapped);
        }
        let invalidate = flags.contains(MsyncFlags::INVALIDATE);
        for region in self.regions.iter() {
            if region.end() <= start || region.start() >= end {
                continue;
            }
            writeback(&mut self.page_table, region, start, end, invalidate)?;
        }
        Ok(())
    }

    /// 写回所有读写共享文件区域的脏页，返回写回的页数
    pub fn sync_shared_files(&mut self) -> PagingResult<usize> {
        let mut pages = 0;
        for region in self.regions.iter() {
            pages += writeback(&mut self.page_table, region, region.start(), region.end(), false)?;
        }
        Ok(pages)
    }

    /// 建立用户栈区域，并在其下方放置保护哨兵；返回栈顶
    pub fn setup_user_stack(&mut self) -> PagingResult<Vaddr> {
        let config = mm_config();
        let top = Vaddr::from_usize(config.user_stack_top());
        let bottom = top - config.user_stack_size();
        let stack = Region::new(bottom, top, RegionAttrs::private_rw(AreaType::UserStack))?;
        self.map_region(stack)?;
        self.set_guard(bottom - PAGE_SIZE)?;
        Ok(top)
    }

    /// 设置用户堆的起始地址（brk 的下界）
    pub fn init_heap(&mut self, start: Vaddr) -> PagingResult<()> {
        if !start.is_page_aligned() {
            return Err(PagingError::InvalidAddress);
        }
        self.heap_start = Some(start);
        Ok(())
    }

    /// 当前的 brk 值（堆的当前结束地址）
    pub fn current_brk(&self) -> Option<Vaddr> {
        self.regions
            .iter()
            .find(|r| r.area_type() == AreaType::UserHeap)
            .map(Region::end)
            .or(self.heap_start)
    }

    /// 把堆的结束地址调整到 `new_end`（向上取整到页），返回新的 brk
    pub fn brk(&mut self, new_end: Vaddr) -> PagingResult<Vaddr> {
        let heap_start = self.heap_start.ok_or(PagingError::InvalidAddress)?;
        let new_end = new_end
            .checked_align_up_to_page()
            .ok_or(PagingError::InvalidAddress)?;
        if new_end < heap_start {
            return Err(PagingError::ShrinkBelowStart);
        }
        if new_end - heap_start > mm_config().max_user_heap_size() {
            return Err(PagingError::OutOfMemory);
        }

        let current_end = match self.regions.find(heap_start) {
            Some(heap) if heap.area_type() == AreaType::UserHeap => heap.end(),
            Some(_) => return Err(PagingError::AlreadyMapped),
            None => {
                // 创建新的堆区域
                if new_end == heap_start {
                    return Ok(heap_start);
                }
                let heap = Region::new(
                    heap_start,
                    new_end,
                    RegionAttrs::private_rw(AreaType::UserHeap),
                )?;
                self.map_region(heap)?;
                return Ok(new_end);
            }
        };

        match new_end.cmp(&current_end) {
            Ordering::Greater => {
                if self.regions.overlaps(current_end, new_end) {
                    return Err(PagingError::AlreadyMapped);
                }
                if let Some(heap) = self.regions.find_mut(heap_start) {
                    heap.resize(new_end)?;
                }
            }
            Ordering::Less => {
                self.page_table.unmap_range(new_end, current_end);
                flush_range(new_end.as_usize(), (current_end - new_end) / PAGE_SIZE);
                if new_end == heap_start {
                    if let Some(heap) = self.regions.remove(heap_start) {
                        heap.release();
                    }
                } else if let Some(heap) = self.regions.find_mut(heap_start) {
                    heap.resize(new_end)?;
                }
            }
            Ordering::Equal => {}
        }
        log::trace!("brk: {:?} -> {:?}", current_end, new_end);
        Ok(new_end)
    }

    /// 向指定虚拟地址写入字节序列（跨页安全）
    ///
    /// 目标页必须已装载；写保护的页先完成写时复制，写入的页置脏。
    pub fn write_bytes_at(&mut self, va: Vaddr, bytes: &[u8]) -> PagingResult<()> {
        let mut written = 0usize;
        while written < bytes.len() {
            let cur_va = va
                .as_usize()
                .checked_add(written)
                .map(Vaddr::from_usize)
                .ok_or(PagingError::InvalidAddress)?;
            let (entry, _) = self.page_table.probe(cur_va);
            if entry.is_loaded() && entry.is_write_protected() {
                self.resolve_fault(&FaultInfo::user(cur_va, AccessKind::Write))?;
            }
            let (paddr, flags) = self
                .page_table
                .translate(cur_va)
                .ok_or(PagingError::NotMapped)?;
            if !flags.contains(UniversalPTEFlag::DIRTY) {
                let mut slot = self.page_table.walk(cur_va, A::LEAF_LEVEL, false)?;
                let entry = slot.read();
                if entry.is_loaded() {
                    slot.write(entry.mark_dirty());
                }
            }

            let take = core::cmp::min(bytes.len() - written, PAGE_SIZE - paddr.page_offset());
            let dst = arch_ops().paddr_to_vaddr(paddr.as_usize()) as *mut u8;
            // SAFETY: 目标在一个已装载的帧内，且不越过页尾
            unsafe {
                core::ptr::copy_nonoverlapping(bytes[written..].as_ptr(), dst, take);
            }
            written += take;
        }
        Ok(())
    }

    /// 从指定虚拟地址读取字节序列（跨页安全）
    pub fn read_bytes_at(&self, va: Vaddr, out: &mut [u8]) -> PagingResult<()> {
        let mut read = 0usize;
        while read < out.len() {
            let cur_va = va
                .as_usize()
                .checked_add(read)
                .map(Vaddr::from_usize)
                .ok_or(PagingError::InvalidAddress)?;
            let (paddr, _) = self
                .page_table
                .translate(cur_va)
                .ok_or(PagingError::NotMapped)?;

            let take = core::cmp::min(out.len() - read, PAGE_SIZE - paddr.page_offset());
            let src = arch_ops().paddr_to_vaddr(paddr.as_usize()) as *const u8;
            // SAFETY: 源在一个已装载的帧内，且不越过页尾
            unsafe {
                core::ptr::copy_nonoverlapping(src, out[read..].as_mut_ptr(), take);
            }
            read += take;
        }
        Ok(())
    }
}

/// 长度向上取整到页
fn page_round_up(len: usize) -> PagingResult<usize> {
    Vaddr::from_usize(len)
        .checked_align_up_to_page()
        .map(|len| len.as_usize())
        .ok_or(PagingError::InvalidAddress)
}

/// `[start, start + len)` 按页向上取整后的结束地址
fn range_end(start: Vaddr, len: usize) -> PagingResult<Vaddr> {
    start
        .as_usize()
        .checked_add(len)
        .and_then(|end| Vaddr::from_usize(end).checked_align_up_to_page())
        .ok_or(PagingError::InvalidAddress)
}

/// 把 `region` 与 `[start, end)` 交集中的脏页写回文件
///
/// 只处理读写共享的文件区域。`drop_pages` 为真时，写回后的页一并解除映射，
/// 下次访问重新从文件装入。返回写回的页数。
fn writeback<A: PagingArch>(
    page_table: &mut PageTable<A>,
    region: &Region,
    start: Vaddr,
    end: Vaddr,
    drop_pages: bool,
) -> PagingResult<usize> {
    let Some(mmap_file) = region.file() else {
        return Ok(0);
    };
    if region.share() != ShareMode::WriteShared {
        return Ok(0);
    }
    let lo = start.max(region.start());
    let hi = end.min(region.end());
    if lo >= hi {
        return Ok(0);
    }

    let frames = page_table.frames().clone();
    let mut pages = 0;
    let mut failure = None;
    page_table.for_each_leaf(lo, hi, |va, entry, _| {
        if failure.is_some() || !entry.is_loaded() {
            return;
        }
        if entry.is_dirty() {
            let page = region.page_index(va);
            let write_len = mmap_file.writeback_len(page);
            if write_len > 0 {
                // SAFETY: 已装载的帧经直接映射可读
                let buffer = unsafe { crate::frame_allocator::frame_bytes(entry.frame_of()) };
                let offset = mmap_file.offset_of_page(page);
                match mmap_file.file.writeback_page(&buffer[..write_len], offset) {
                    Ok(n) if n == write_len => {}
                    Ok(n) => {
                        log::error!(
                            "Partial write at offset {}: expected {}, got {}",
                            offset,
                            write_len,
                            n
                        );
                        failure = Some(PagingError::IoError(-uapi::errno::EIO));
                        return;
                    }
                    Err(errno) => {
                        failure = Some(PagingError::IoError(errno));
                        return;
                    }
                }
            }
            *entry = entry.mark_clean();
            pages += 1;
        }
        if drop_pages {
            frames.remove_reference(entry.frame_of());
            *entry = A::Entry::EMPTY;
        }
    });
    flush_range(lo.as_usize(), (hi - lo) / PAGE_SIZE);
    match failure {
        Some(err) => Err(err),
        None => Ok(pages),
    }
}

impl<A: PagingArch> Drop for AddressSpace<A> {
    fn drop(&mut self) {
        if let Err(err) = self.sync_shared_files() {
            log::warn!("address space teardown: writeback failed: {}", err);
        }
        self.regions.release_all();
        // 页表随后析构，归还所有帧引用与页表页
    }
}
