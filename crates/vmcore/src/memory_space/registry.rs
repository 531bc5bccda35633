//! 区域登记表
//!
//! 每个地址空间一张，按起始地址升序保存互不重叠的 [`Region`]。

use crate::address::{AlignOps, UsizeConvert, Vaddr};
use crate::memory_space::Region;
use crate::page_table::{PagingError, PagingResult};
use alloc::vec::Vec;

/// 有序区域列表
#[derive(Debug, Default)]
pub struct RegionList {
    regions: Vec<Region>,
}

impl RegionList {
    /// 创建空列表
    pub const fn new() -> Self {
        Self {
            regions: Vec::new(),
        }
    }

    /// 区域个数
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// 是否没有任何区域
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// 按地址升序遍历
    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }

    /// 按地址升序可变遍历
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Region> {
        self.regions.iter_mut()
    }

    /// 第一个结束地址大于 `va` 的区域下标
    fn lower_bound(&self, va: Vaddr) -> usize {
        self.regions.partition_point(|r| r.end() <= va)
    }

    /// 插入区域，保持升序；与已有区域重叠时拒绝
    pub fn insert(&mut self, region: Region) -> PagingResult<()> {
        let pos = self.lower_bound(region.start());
        if let Some(next) = self.regions.get(pos) {
            if next.start() < region.end() {
                log::debug!("region {:?} overlaps {:?}", region, next);
                return Err(PagingError::AlreadyMapped);
            }
        }
        self.regions.insert(pos, region);
        Ok(())
    }

    fn position(&self, va: Vaddr) -> Option<usize> {
        let va = va.align_down_to_page();
        let pos = self.lower_bound(va);
        self.regions
            .get(pos)
            .filter(|r| r.contains(va))
            .map(|_| pos)
    }

    /// 查找包含 `va` 的区域
    pub fn find(&self, va: Vaddr) -> Option<&Region> {
        self.position(va).map(|i| &self.regions[i])
    }

    /// 查找包含 `va` 的区域（可变）
    pub fn find_mut(&mut self, va: Vaddr) -> Option<&mut Region> {
        self.position(va).map(move |i| &mut self.regions[i])
    }

    /// 移除包含 `va` 的区域并交给调用者（通常随后调用 [`Region::release`]）
    pub fn remove(&mut self, va: Vaddr) -> Option<Region> {
        self.position(va).map(|i| self.regions.remove(i))
    }

    /// `[start, end)` 是否与任何区域重叠
    pub fn overlaps(&self, start: Vaddr, end: Vaddr) -> bool {
        self.regions
            .get(self.lower_bound(start))
            .is_some_and(|r| r.start() < end)
    }

    /// 在 `[from, limit)` 中查找能容纳 `len` 字节的最低空闲地址
    pub fn find_free(&self, from: Vaddr, limit: Vaddr, len: usize) -> Option<Vaddr> {
        let mut current = from.align_up_to_page();
        let mut pos = self.lower_bound(current);
        loop {
            let end = current.as_usize().checked_add(len)?;
            if end > limit.as_usize() {
                return None;
            }
            match self.regions.get(pos) {
                // 下一个区域在候选区间之后：找到
                Some(next) if next.start().as_usize() >= end => return Some(current),
                None => return Some(current),
                Some(next) => {
                    current = current.max(next.end());
                    pos += 1;
                }
            }
        }
    }

    /// 把 `[start, end)` 从登记表中切出来
    ///
    /// 跨越边界的区域先被切开，完全落在范围内的部分被移除并按地址顺序返回。
    /// 范围内没有区域时返回空列表。
    pub fn carve(&mut self, start: Vaddr, end: Vaddr) -> PagingResult<Vec<Region>> {
        let first = self.lower_bound(start);
        if let Some(region) = self.regions.get_mut(first) {
            if region.start() < start && region.end() > start {
                let tail = region.split_off(start)?;
                self.regions.insert(first + 1, tail);
            }
        }
        let last = self.lower_bound(end);
        if let Some(region) = self.regions.get_mut(last) {
            if region.start() < end {
                let tail = region.split_off(end)?;
                self.regions.insert(last + 1, tail);
            }
        }
        let from = self.lower_bound(start);
        let to = self.regions.partition_point(|r| r.start() < end);
        Ok(self.regions.drain(from..to).collect())
    }

    /// 把所有区域复制到 `dest`，每个副本复制后调用其回调
    pub fn copy_all(&self, dest: &mut RegionList) -> PagingResult<()> {
        for region in &self.regions {
            let mut copy = region.duplicate();
            if let Some(hooks) = region.hooks() {
                hooks.on_copied(region, &mut copy);
            }
            dest.insert(copy)?;
        }
        Ok(())
    }

    /// 释放全部区域
    pub fn release_all(&mut self) {
        for region in self.regions.drain(..) {
            region.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::PAGE_SIZE;
    use crate::memory_space::{AreaType, MmapFile, RegionAttrs, RegionIndex};
    use crate::tests::setup;
    use alloc::sync::Arc;
    use test_support::mock::fs::MockFile;

    fn anon(start: usize, end: usize) -> Region {
        Region::new(
            Vaddr(start),
            Vaddr(end),
            RegionAttrs::private_rw(AreaType::UserMmap),
        )
        .unwrap()
    }

    fn bounds(list: &RegionList) -> Vec<(usize, usize)> {
        list.iter().map(|r| (r.start().0, r.end().0)).collect()
    }

    #[test]
    fn test_insert_keeps_order_and_rejects_overlap() {
        let mut list = RegionList::new();
        list.insert(anon(0x5000, 0x6000)).unwrap();
        list.insert(anon(0x1000, 0x3000)).unwrap();
        list.insert(anon(0x3000, 0x4000)).unwrap();
        assert_eq!(
            bounds(&list),
            [(0x1000, 0x3000), (0x3000, 0x4000), (0x5000, 0x6000)]
        );
        assert_eq!(
            list.insert(anon(0x2000, 0x5000)).err(),
            Some(PagingError::AlreadyMapped)
        );
        assert_eq!(
            list.insert(anon(0x5000, 0x7000)).err(),
            Some(PagingError::AlreadyMapped)
        );
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn test_find() {
        let mut list = RegionList::new();
        list.insert(anon(0x1000, 0x3000)).unwrap();
        list.insert(anon(0x8000, 0x9000)).unwrap();
        assert_eq!(list.find(Vaddr(0x2fff)).map(|r| r.start()), Some(Vaddr(0x1000)));
        assert!(list.find(Vaddr(0x3000)).is_none());
        assert!(list.find(Vaddr(0x0fff)).is_none());
        assert_eq!(list.find(Vaddr(0x8000)).map(|r| r.end()), Some(Vaddr(0x9000)));
        assert!(list.find_mut(Vaddr(0x8800)).is_some());
        assert!(list.overlaps(Vaddr(0x2000), Vaddr(0x2001)));
        assert!(!list.overlaps(Vaddr(0x3000), Vaddr(0x8000)));
    }

    #[test]
    fn test_find_free_skips_used_ranges() {
        let mut list = RegionList::new();
        list.insert(anon(0x10000, 0x12000)).unwrap();
        list.insert(anon(0x13000, 0x14000)).unwrap();
        let limit = Vaddr(0x20000);
        assert_eq!(list.find_free(Vaddr(0x10000), limit, PAGE_SIZE), Some(Vaddr(0x12000)));
        assert_eq!(list.find_free(Vaddr(0x10000), limit, 2 * PAGE_SIZE), Some(Vaddr(0x14000)));
        assert_eq!(list.find_free(Vaddr(0xe000), limit, 2 * PAGE_SIZE), Some(Vaddr(0xe000)));
        assert_eq!(list.find_free(Vaddr(0x1f000), limit, 2 * PAGE_SIZE), None);
    }

    #[test]
    fn test_carve_splits_boundaries() {
        let mut list = RegionList::new();
        list.insert(anon(0x1000, 0x5000)).unwrap();
        list.insert(anon(0x6000, 0x8000)).unwrap();

        // 中间挖洞
        let removed = list.carve(Vaddr(0x2000), Vaddr(0x3000)).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!((removed[0].start().0, removed[0].end().0), (0x2000, 0x3000));
        assert_eq!(
            bounds(&list),
            [(0x1000, 0x2000), (0x3000, 0x5000), (0x6000, 0x8000)]
        );

        // 跨两个区域：切掉后一段的前部和前一段的尾部
        let removed = list.carve(Vaddr(0x4000), Vaddr(0x7000)).unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(
            bounds(&list),
            [(0x1000, 0x2000), (0x3000, 0x4000), (0x7000, 0x8000)]
        );

        assert!(list.carve(Vaddr(0x9000), Vaddr(0xa000)).unwrap().is_empty());
    }

    #[test]
    fn test_copy_all_and_release_all() {
        setup();
        let file = Arc::new(MockFile::new(b"data"));
        let mut src = RegionList::new();
        let index = RegionIndex::new();
        let mut mapped =
            anon(0x1000, 0x2000).with_file(MmapFile::new(file.clone(), 0, PAGE_SIZE));
        mapped.bind_index(index.clone());
        src.insert(mapped).unwrap();
        src.insert(anon(0x4000, 0x5000)).unwrap();

        let mut dst = RegionList::new();
        src.copy_all(&mut dst).unwrap();
        assert_eq!(bounds(&dst), bounds(&src));
        assert_eq!(Arc::strong_count(&file), 3);

        dst.release_all();
        assert!(dst.is_empty());
        // 副本不携带回指，释放副本不影响源区域
        assert!(index.is_live());
        src.release_all();
        assert!(!index.is_live());
        assert_eq!(Arc::strong_count(&file), 1);
    }
}
