//! 地址空间复制（fork）
//!
//! 复制分三步：区域登记表逐个浅复制，页表树按结构克隆（叶子按值复制、
//! 每个已装载的帧多一个引用），最后对写时复制区域在两棵树中同时清除可写位。
//!
//! 复制是事务性的：克隆页表树时页表池耗尽，半成品地址空间整体析构
//! （归还已增加的帧引用、已分配的页表页和区域），源地址空间保持原样；
//! 写保护只在克隆成功之后才施加。

use crate::address::{UsizeConvert, Vaddr, PAGE_SIZE};
use crate::arch_ops::flush_range;
use crate::memory_space::{AddressSpace, RegionList};
use crate::page_table::{PageTable, PageTableEntry, PagingArch, PagingResult};

impl<A: PagingArch> AddressSpace<A> {
    /// 复制地址空间，用于 fork
    pub fn duplicate(&mut self) -> PagingResult<Self> {
        let pool = self.page_table.pool().clone();
        let mut child = AddressSpace {
            page_table: PageTable::new_with_kernel(pool, &self.page_table)?,
            regions: RegionList::new(),
            frames: self.frames.clone(),
            heap_start: self.heap_start,
        };

        if let Err(err) = self.regions.copy_all(&mut child.regions) {
            child.regions.release_all();
            return Err(err);
        }

        if let Err(err) = self.page_table.clone_user_tree(&mut child.page_table) {
            log::warn!(
                "fork: {} after {} tables, rolling back",
                err,
                child.page_table.pool().tables_in_use()
            );
            // 先释放区域，析构时不再写回任何东西
            child.regions.release_all();
            return Err(err);
        }

        let mut protected = 0;
        for region in self.regions.iter().filter(|r| r.share().is_cow()) {
            protected += write_protect(&mut self.page_table, region.start(), region.end());
            protected += write_protect(&mut child.page_table, region.start(), region.end());
            // 两棵树使用同一组虚拟地址，一次失效覆盖两边
            flush_range(region.start().as_usize(), region.len() / PAGE_SIZE);
        }
        log::debug!(
            "fork: {} regions, {} entries write-protected",
            child.regions.len(),
            protected
        );
        Ok(child)
    }
}

fn write_protect<A: PagingArch>(table: &mut PageTable<A>, start: Vaddr, end: Vaddr) -> usize {
    let mut count = 0;
    table.for_each_leaf(start, end, |_, entry, _| {
        if entry.is_loaded() && !entry.is_pinned() {
            *entry = entry.mark_write_protected();
            count += 1;
        }
    });
    count
}
