//! 页表遍历器
//!
//! [`PageTable`] 持有一张根页表和页表池，按 [`PagingArch`] 描述的结构逐级下降。
//!
//! # 访问方式
//!
//! 各级页表通过内核直接映射（[`crate::ArchMmOps::paddr_to_vaddr`]）读写，
//! 不依赖当前激活的是哪个地址空间。根页表最后一项仍安装为自映射：
//! 经自映射窗口访问页表的缺页（见 `fault` 模块）和表项所在虚拟地址的 TLB 失效都依赖它。
//!
//! # 不变量
//!
//! - 遍历中创建页表是纯增量的：已有的非空表项不会被替换。
//! - 遇到大页、保护哨兵或其它终止项时，遍历在该级停止并返回该表项。
//! - 根页表的自映射槽位和共享的内核槽位不参与复制与回收。

use super::arch::PagingArch;
use super::entry::{PageTableEntry, UniversalPTEFlag};
use super::pool::TablePool;
use super::{PagingError, PagingResult};
use crate::address::{AlignOps, Paddr, PageNum, Ppn, UsizeConvert, Vaddr};
use crate::frame_allocator::FrameAllocator;
use alloc::sync::Arc;
use core::marker::PhantomData;
use core::ptr::NonNull;

#[inline]
fn entry_ptr<A: PagingArch>(table: Paddr, index: usize) -> *mut A::Entry {
    debug_assert!(index < A::ENTRIES);
    // SAFETY: 页表页整页可经直接映射访问，index 在表内
    unsafe { table.as_mut_ptr::<A::Entry>().add(index) }
}

#[inline]
fn read_entry<E: PageTableEntry>(ptr: *const E) -> E {
    // SAFETY: ptr 来自 entry_ptr，指向有效的页表项
    unsafe { ptr.read_volatile() }
}

#[inline]
fn write_entry<E: PageTableEntry>(ptr: *mut E, entry: E) {
    // SAFETY: 同上
    unsafe { ptr.write_volatile(entry) }
}

/// 遍历得到的可编辑表项位置
///
/// 借用其所属的 [`PageTable`]，因此存活期间页表结构不会被其它路径修改。
pub struct EntrySlot<'a, A: PagingArch> {
    ptr: NonNull<A::Entry>,
    level: usize,
    va: Vaddr,
    _marker: PhantomData<&'a mut A::Entry>,
}

impl<A: PagingArch> EntrySlot<'_, A> {
    /// 读取表项
    pub fn read(&self) -> A::Entry {
        read_entry(self.ptr.as_ptr())
    }

    /// 写入表项
    pub fn write(&mut self, entry: A::Entry) {
        write_entry(self.ptr.as_ptr(), entry);
    }

    /// 表项所在的级
    pub fn level(&self) -> usize {
        self.level
    }

    /// 该表项映射的粒度（字节）
    pub fn granularity(&self) -> usize {
        A::level_size(self.level)
    }

    /// 经自映射窗口访问该表项的虚拟地址
    pub fn slot_vaddr(&self) -> Vaddr {
        A::slot_vaddr(self.va, self.level)
    }
}

/// 多级页表
pub struct PageTable<A: PagingArch> {
    root: Paddr,
    pool: Arc<TablePool>,
    /// 内核共享槽位是否归本页表所有（只有内核模板页表为 true）
    owns_kernel_slots: bool,
    _arch: PhantomData<A>,
}

// SAFETY: 页表内存只经由 &self / &mut self 访问，所有权随结构体转移
unsafe impl<A: PagingArch> Send for PageTable<A> {}
unsafe impl<A: PagingArch> Sync for PageTable<A> {}

impl<A: PagingArch> PageTable<A> {
    /// 分配根页表并安装自映射
    pub fn new(pool: Arc<TablePool>) -> PagingResult<Self> {
        let root = pool.alloc_table().ok_or(PagingError::OutOfTables)?;
        write_entry(
            entry_ptr::<A>(root, A::SELF_MAP_INDEX),
            A::Entry::new_table(Ppn::from_addr_floor(root)),
        );
        Ok(Self {
            root,
            pool,
            owns_kernel_slots: true,
            _arch: PhantomData,
        })
    }

    /// 分配根页表，并按指针共享 `kernel` 的内核槽位
    pub fn new_with_kernel(pool: Arc<TablePool>, kernel: &PageTable<A>) -> PagingResult<Self> {
        let mut table = Self::new(pool)?;
        table.owns_kernel_slots = false;
        for index in (A::KERNEL_ROOT_START..A::ENTRIES).filter(|&i| A::is_kernel_root_slot(i)) {
            let entry = read_entry(entry_ptr::<A>(kernel.root, index));
            write_entry(entry_ptr::<A>(table.root, index), entry);
        }
        Ok(table)
    }

    /// 根页表物理地址
    pub fn root(&self) -> Paddr {
        self.root
    }

    /// 页表池
    pub fn pool(&self) -> &Arc<TablePool> {
        &self.pool
    }

    /// 物理帧分配器
    pub fn frames(&self) -> &Arc<dyn FrameAllocator> {
        self.pool.frames()
    }

    fn locate(&self, va: Vaddr, level: usize, create: bool) -> PagingResult<(*mut A::Entry, usize)> {
        debug_assert!(level < A::LEVELS);
        let mut table = self.root;
        let mut cur = 0;
        loop {
            let ptr = entry_ptr::<A>(table, A::index_of(va, cur));
            if cur == level {
                return Ok((ptr, cur));
            }
            let entry = read_entry(ptr);
            if entry.is_empty() {
                if !create {
                    return Err(PagingError::NotMapped);
                }
                let child = self.pool.alloc_table().ok_or(PagingError::OutOfTables)?;
                write_entry(ptr, A::Entry::new_table(Ppn::from_addr_floor(child)));
                table = child;
            } else if entry.is_table(cur, A::LEAF_LEVEL) {
                table = entry.frame_of();
            } else {
                // 大页、哨兵或其它终止项
                return Ok((ptr, cur));
            }
            cur += 1;
        }
    }

    /// 定位（必要时创建）映射 `va` 的第 `level` 级表项
    ///
    /// - `create == false` 且中间页表缺失时返回 [`PagingError::NotMapped`]
    /// - 页表池耗尽时返回 [`PagingError::OutOfTables`]
    /// - 提前遇到终止项时返回该项，其 [`EntrySlot::level`] 小于 `level`
    pub fn walk(&mut self, va: Vaddr, level: usize, create: bool) -> PagingResult<EntrySlot<'_, A>> {
        let (ptr, at) = self.locate(va, level, create)?;
        Ok(EntrySlot {
            // SAFETY: entry_ptr 从不返回空指针
            ptr: unsafe { NonNull::new_unchecked(ptr) },
            level: at,
            va,
            _marker: PhantomData,
        })
    }

    /// 只读快照：返回映射 `va` 的终止表项及其级号，缺失时为空表项
    pub fn probe(&self, va: Vaddr) -> (A::Entry, usize) {
        let mut table = self.root;
        for level in 0..A::LEVELS {
            let entry = read_entry(entry_ptr::<A>(table, A::index_of(va, level)));
            if entry.is_table(level, A::LEAF_LEVEL) {
                table = entry.frame_of();
                continue;
            }
            return (entry, level);
        }
        unreachable!("leaf level never holds a table entry")
    }

    /// 翻译虚拟地址，返回物理地址和标志
    pub fn translate(&self, va: Vaddr) -> Option<(Paddr, UniversalPTEFlag)> {
        let (entry, level) = self.probe(va);
        if !entry.is_loaded() {
            return None;
        }
        let offset = va.as_usize() & (A::level_size(level) - 1);
        Some((entry.frame_of() + offset, entry.flags()))
    }

    /// 从 `va` 起连续写入至多 `count` 个叶子表项
    ///
    /// 第 i 项的物理帧为 `entry` 的帧加 `i * stride`；`stride` 决定写入的级，
    /// 大于基本页的粒度写为大页。只在页表池耗尽（或目标位置已被更粗粒度的终止项占据）时提前停止，
    /// 返回实际写入的项数；要求全部成功的调用方须比较返回值与 `count`。
    pub fn set_contiguous(&mut self, va: Vaddr, entry: A::Entry, stride: usize, count: usize) -> usize {
        let level = match A::level_for_granularity(stride) {
            Some(level) if level > 0 => level,
            _ => {
                log::warn!("set_contiguous: unsupported stride {:#x} on {}", stride, A::NAME);
                return 0;
            }
        };
        let flags = if level < A::LEAF_LEVEL {
            entry.flags() | UniversalPTEFlag::HUGE
        } else {
            entry.flags()
        };
        let base = entry.frame_of();

        let mut written = 0;
        while written < count {
            let cur = Vaddr::from_usize(va.as_usize() + written * stride);
            let (ptr, at) = match self.locate(cur, level, true) {
                Ok(found) => found,
                Err(err) => {
                    log::warn!("set_contiguous: {} after {}/{} entries", err, written, count);
                    break;
                }
            };
            if at != level {
                log::warn!("set_contiguous: {:?} covered by a level-{} entry", cur, at);
                break;
            }
            // 一次填满当前页表中剩余的连续槽位
            let run = (A::ENTRIES - A::index_of(cur, level)).min(count - written);
            for i in 0..run {
                let frame = base + (written + i) * stride;
                // SAFETY: run 不越过当前页表末尾
                let slot = unsafe { ptr.add(i) };
                write_entry(slot, A::Entry::new_leaf(Ppn::from_addr_floor(frame), flags));
            }
            written += run;
        }
        written
    }

    /// 与 [`PageTable::set_contiguous`] 相同，但未全部写入时返回 [`PagingError::OutOfTables`]
    ///
    /// 启动阶段建立内核映射使用，失败即不可恢复。
    pub fn map_exact(&mut self, va: Vaddr, entry: A::Entry, stride: usize, count: usize) -> PagingResult<()> {
        if !va.is_page_aligned() || !entry.frame_of().is_page_aligned() {
            return Err(PagingError::InvalidAddress);
        }
        match self.set_contiguous(va, entry, stride, count) {
            n if n == count => Ok(()),
            _ => Err(PagingError::OutOfTables),
        }
    }

    /// 访问 `[start, end)` 内所有非空终止表项
    ///
    /// 回调收到表项覆盖的起始地址、可修改的表项副本和级号；副本被修改时写回页表。
    pub fn for_each_leaf<F>(&mut self, start: Vaddr, end: Vaddr, mut f: F)
    where
        F: FnMut(Vaddr, &mut A::Entry, usize),
    {
        if start >= end {
            return;
        }
        let lo = start.as_usize() & Self::raw_mask();
        let hi = lo + (end.as_usize() - start.as_usize());
        self.visit_leaves(self.root, 0, 0, lo, hi, &mut f);
    }

    fn raw_mask() -> usize {
        if A::VA_BITS >= usize::BITS as usize {
            usize::MAX
        } else {
            (1usize << A::VA_BITS) - 1
        }
    }

    fn visit_leaves(
        &self,
        table: Paddr,
        level: usize,
        base: usize,
        lo: usize,
        hi: usize,
        f: &mut dyn FnMut(Vaddr, &mut A::Entry, usize),
    ) {
        let size = A::level_size(level);
        for index in 0..A::ENTRIES {
            if level == 0 && index == A::SELF_MAP_INDEX {
                continue;
            }
            let begin = base + index * size;
            if begin + size <= lo || begin >= hi {
                continue;
            }
            let ptr = entry_ptr::<A>(table, index);
            let entry = read_entry(ptr);
            if entry.is_empty() {
                continue;
            }
            if entry.is_table(level, A::LEAF_LEVEL) {
                self.visit_leaves(entry.frame_of(), level + 1, begin, lo, hi, f);
            } else {
                let mut edited = entry;
                f(A::canonicalize(begin), &mut edited, level);
                if edited != entry {
                    write_entry(ptr, edited);
                }
            }
        }
    }

    /// 清空 `[start, end)` 内的叶子表项并归还帧引用，返回清除的已装载项数
    ///
    /// 常驻表项保留。不回收变空的页表页，它们随整棵树一起释放。
    pub fn unmap_range(&mut self, start: Vaddr, end: Vaddr) -> usize {
        let frames = self.frames().clone();
        let mut released = 0;
        self.for_each_leaf(start, end, |_, entry, _| {
            if entry.is_pinned() {
                return;
            }
            if entry.is_loaded() {
                frames.remove_reference(entry.frame_of());
                released += 1;
            }
            *entry = A::Entry::EMPTY;
        });
        released
    }

    /// 将本页表的用户部分复制到 `dest`
    ///
    /// 中间页表在 `dest` 中重新分配，叶子表项按值复制并为已装载的帧增加一个引用；
    /// 自映射槽位与内核槽位不复制。失败时 `dest` 中已复制的部分保持一致状态，
    /// 随 `dest` 的析构一并回收。
    pub fn clone_user_tree(&self, dest: &mut PageTable<A>) -> PagingResult<()> {
        let frames = self.frames().clone();
        self.clone_level(dest, frames.as_ref(), self.root, dest.root, 0)
    }

    fn clone_level(
        &self,
        dest: &PageTable<A>,
        frames: &dyn FrameAllocator,
        src: Paddr,
        dst: Paddr,
        level: usize,
    ) -> PagingResult<()> {
        for index in 0..A::ENTRIES {
            if level == 0 && (index == A::SELF_MAP_INDEX || A::is_kernel_root_slot(index)) {
                continue;
            }
            let entry = read_entry(entry_ptr::<A>(src, index));
            if entry.is_empty() {
                continue;
            }
            if entry.is_table(level, A::LEAF_LEVEL) {
                let child = dest.pool.alloc_table().ok_or(PagingError::OutOfTables)?;
                // 先挂入再下降，失败时子表也能随 dest 回收
                write_entry(
                    entry_ptr::<A>(dst, index),
                    A::Entry::new_table(Ppn::from_addr_floor(child)),
                );
                self.clone_level(dest, frames, entry.frame_of(), child, level + 1)?;
            } else {
                if entry.is_loaded() {
                    frames.add_reference(entry.frame_of());
                }
                write_entry(entry_ptr::<A>(dst, index), entry);
            }
        }
        Ok(())
    }

    fn release_level(&self, table: Paddr, level: usize) {
        for index in 0..A::ENTRIES {
            if level == 0
                && (index == A::SELF_MAP_INDEX
                    || (!self.owns_kernel_slots && A::is_kernel_root_slot(index)))
            {
                continue;
            }
            let entry = read_entry(entry_ptr::<A>(table, index));
            if entry.is_empty() || entry.is_guard() {
                continue;
            }
            if entry.is_table(level, A::LEAF_LEVEL) {
                let child = entry.frame_of();
                self.release_level(child, level + 1);
                self.pool.free_table(child);
            } else if entry.is_loaded() {
                self.frames().remove_reference(entry.frame_of());
            }
        }
    }
}

impl<A: PagingArch> Drop for PageTable<A> {
    fn drop(&mut self) {
        self.release_level(self.root, 0);
        self.pool.free_table(self.root);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::PAGE_SIZE;
    use crate::page_table::{Aarch64, Aarch64Entry, I386, I386Entry, X86_64, X86_64Entry};
    use crate::tests::{test_allocator, test_pool};

    fn walk_twice_same_slot<A: PagingArch>() {
        let frames = test_allocator(64);
        let mut pt = PageTable::<A>::new(test_pool(&frames)).unwrap();
        let va = Vaddr(0x4000_3000);
        let first = pt.walk(va, A::LEAF_LEVEL, true).unwrap().ptr;
        let tables = pt.pool().tables_in_use();
        let second = pt.walk(va, A::LEAF_LEVEL, true).unwrap().ptr;
        assert_eq!(first, second);
        assert_eq!(pt.pool().tables_in_use(), tables);
        assert_eq!(tables, A::LEVELS);
    }

    #[test]
    fn test_walk_twice_returns_same_slot() {
        walk_twice_same_slot::<X86_64>();
        walk_twice_same_slot::<I386>();
        walk_twice_same_slot::<Aarch64>();
    }

    #[test]
    fn test_walk_without_create() {
        let frames = test_allocator(16);
        let mut pt = PageTable::<X86_64>::new(test_pool(&frames)).unwrap();
        assert_eq!(
            pt.walk(Vaddr(0x1000), 3, false).err(),
            Some(PagingError::NotMapped)
        );
        let (entry, level) = pt.probe(Vaddr(0x1000));
        assert!(entry.is_empty());
        assert_eq!(level, 0);
        assert_eq!(pt.pool().tables_in_use(), 1);
    }

    #[test]
    fn test_self_map_installed() {
        let frames = test_allocator(8);
        let pt = PageTable::<X86_64>::new(test_pool(&frames)).unwrap();
        let entry = read_entry(entry_ptr::<X86_64>(pt.root(), X86_64::SELF_MAP_INDEX));
        assert!(entry.is_loaded());
        assert_eq!(entry.frame_of(), pt.root());
        // 经自映射窗口遍历根页表自身：四级都回到根页表
        let window = X86_64::slot_vaddr(Vaddr(0), 0);
        assert_eq!(window, Vaddr(0xffff_ffff_ffff_f000));
        assert_eq!(pt.translate(window).map(|(pa, _)| pa), Some(pt.root()));
    }

    #[test]
    fn test_walk_pool_exhaustion() {
        let frames = test_allocator(16);
        let pool = test_pool(&frames);
        let mut pt = PageTable::<X86_64>::new(pool.clone()).unwrap();
        pool.set_budget(Some(1));
        assert_eq!(
            pt.walk(Vaddr(0x20_0000), 3, true).err(),
            Some(PagingError::OutOfTables)
        );
        // 已创建的中间页表保留，再次遍历可继续
        pool.set_budget(None);
        assert!(pt.walk(Vaddr(0x20_0000), 3, true).is_ok());
    }

    #[test]
    fn test_walk_stops_at_huge_entry() {
        let frames = test_allocator(16);
        let mut pt = PageTable::<X86_64>::new(test_pool(&frames)).unwrap();
        let huge = X86_64Entry::make_leaf(Paddr(0x4000_0000), UniversalPTEFlag::kernel_rw())
            .mark_loaded();
        assert_eq!(pt.set_contiguous(Vaddr(0x4000_0000), huge, 0x20_0000, 2), 2);
        let slot = pt.walk(Vaddr(0x4020_1000), 3, true).unwrap();
        assert_eq!(slot.level(), 2);
        assert!(slot.read().is_huge());
        assert_eq!(
            pt.translate(Vaddr(0x4020_1234)).map(|(pa, _)| pa),
            Some(Paddr(0x4020_1234))
        );
    }

    #[test]
    fn test_set_contiguous_stops_on_pool_exhaustion() {
        let frames = test_allocator(16);
        let pool = test_pool(&frames);
        let mut pt = PageTable::<X86_64>::new(pool.clone()).unwrap();
        // 叶子页表已存在，从第 112 个槽位开始还剩 400 个
        let va = Vaddr(0x40_0000 + 112 * PAGE_SIZE);
        pt.walk(va, 3, true).unwrap();
        pool.set_budget(Some(0));

        let entry = X86_64Entry::make_leaf(Paddr(0x8000_0000), UniversalPTEFlag::kernel_rw())
            .mark_loaded();
        let written = pt.set_contiguous(va, entry, PAGE_SIZE, 1000);
        assert_eq!(written, 400);

        for i in [0usize, 1, 200, 399] {
            let (pa, _) = pt.translate(va + i * PAGE_SIZE).unwrap();
            assert_eq!(pa, Paddr(0x8000_0000 + i * PAGE_SIZE));
        }
        // 第 401 项所在页表从未创建
        let (next, level) = pt.probe(va + 400 * PAGE_SIZE);
        assert!(next.is_empty());
        assert_eq!(level, 2);
        assert!(pt.map_exact(va, entry, PAGE_SIZE, 1000).is_err());
    }

    #[test]
    fn test_for_each_leaf_and_unmap() {
        let frames = test_allocator(32);
        let mut pt = PageTable::<I386>::new(test_pool(&frames)).unwrap();
        let mut mapped = alloc::vec::Vec::new();
        for i in 0..3 {
            let frame = frames.allocate_frame().unwrap();
            let va = Vaddr(0x10_0000 + i * PAGE_SIZE);
            let mut slot = pt.walk(va, 1, true).unwrap();
            slot.write(I386Entry::make_leaf(frame, UniversalPTEFlag::user_rw()).mark_loaded());
            mapped.push(frame);
        }
        let mut seen = 0;
        pt.for_each_leaf(Vaddr(0x10_1000), Vaddr(0x10_3000), |_, _, level| {
            assert_eq!(level, 1);
            seen += 1;
        });
        assert_eq!(seen, 2);

        assert_eq!(pt.unmap_range(Vaddr(0x10_0000), Vaddr(0x10_2000)), 2);
        assert_eq!(frames.reference_count(mapped[0]), 0);
        assert_eq!(frames.reference_count(mapped[2]), 1);
        assert!(pt.translate(Vaddr(0x10_0000)).is_none());
    }

    #[test]
    fn test_drop_releases_tables_and_frames() {
        let frames = test_allocator(32);
        let pool = test_pool(&frames);
        {
            let mut pt = PageTable::<Aarch64>::new(pool.clone()).unwrap();
            let frame = frames.allocate_frame().unwrap();
            let mut slot = pt.walk(Vaddr(0x7000_0000), 3, true).unwrap();
            slot.write(Aarch64Entry::make_leaf(frame, UniversalPTEFlag::user_rw()).mark_loaded());
            assert_eq!(pool.tables_in_use(), 4);
        }
        assert_eq!(pool.tables_in_use(), 0);
        assert_eq!(frames.stats().1, 0);
    }

    #[test]
    fn test_kernel_slots_shared() {
        let frames = test_allocator(32);
        let pool = test_pool(&frames);
        let mut kernel = PageTable::<X86_64>::new(pool.clone()).unwrap();
        let kva = Vaddr(0xffff_8000_0000_0000);
        let entry = X86_64Entry::make_leaf(Paddr(0x20_0000), UniversalPTEFlag::kernel_rw())
            .mark_loaded();
        kernel.map_exact(kva, entry, PAGE_SIZE, 4).unwrap();
        let tables = pool.tables_in_use();
        {
            let user = PageTable::<X86_64>::new_with_kernel(pool.clone(), &kernel).unwrap();
            assert_eq!(user.translate(kva + PAGE_SIZE).map(|(pa, _)| pa), Some(Paddr(0x20_1000)));
            assert_eq!(pool.tables_in_use(), tables + 1);
        }
        // 用户页表析构不回收共享的内核页表
        assert_eq!(pool.tables_in_use(), tables);
        assert!(kernel.translate(kva).is_some());
    }
}
