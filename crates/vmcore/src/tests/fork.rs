//! 地址空间复制场景

use super::{frame_at, load, store, test_space, touch};
use crate::address::Vaddr;
use crate::fault::{fault_stats, AccessKind, FaultError, FaultInfo, Resolution};
use crate::frame_allocator::FrameAllocator;
use crate::memory_space::{
    AddressSpace, AreaType, Region, RegionAttrs, RegionHooks, RegionIndex, RegionProt, ShareMode,
    VmSpace,
};
use crate::page_table::{
    Aarch64, I386, PageTableEntry, PagingArch, PagingError, UniversalPTEFlag, X86_64,
};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use test_support::mock::task::MockTask;

fn region(start: usize, end: usize, prot: RegionProt, share: ShareMode) -> Region {
    Region::new(
        Vaddr(start),
        Vaddr(end),
        RegionAttrs::new(prot, share, AreaType::UserData),
    )
    .unwrap()
}

fn is_write_protected<A: PagingArch>(space: &AddressSpace<A>, va: usize) -> bool {
    space.page_table().probe(Vaddr(va)).0.is_write_protected()
}

fn private_copy_on_write<A: PagingArch>() {
    let task = MockTask::new();
    let (mut parent, frames) = test_space::<A>(64);
    parent
        .map_region(region(0x1000, 0x3000, RegionProt::RW, ShareMode::Private))
        .unwrap();
    store(&mut parent, Vaddr(0x1000), b"parent", &task).unwrap();
    let old = frame_at(&parent, Vaddr(0x1000)).unwrap();

    let mut child = parent.duplicate().unwrap();
    assert_eq!(frame_at(&child, Vaddr(0x1000)), Some(old));
    assert_eq!(frames.reference_count(old), 2);
    assert!(is_write_protected(&parent, 0x1000));
    assert!(is_write_protected(&child, 0x1000));
    // 未装载的页不会出现在子空间
    assert!(frame_at(&child, Vaddr(0x2000)).is_none());

    // 读不触发复制
    assert_eq!(load(&mut child, Vaddr(0x1000), 6, &task).unwrap(), b"parent");
    let before = fault_stats().snapshot();
    assert_eq!(touch(&mut child, Vaddr(0x1000), AccessKind::Write, &task), Ok(1));
    let copy = frame_at(&child, Vaddr(0x1000)).unwrap();
    assert_ne!(copy, old);
    assert_eq!(frames.reference_count(old), 1);
    assert_eq!(frames.reference_count(copy), 1);
    assert!(!is_write_protected(&child, 0x1000));
    assert!(fault_stats().snapshot().cow > before.cow);

    store(&mut child, Vaddr(0x1000), b"child!", &task).unwrap();
    assert_eq!(load(&mut parent, Vaddr(0x1000), 6, &task).unwrap(), b"parent");
    assert_eq!(load(&mut child, Vaddr(0x1000), 6, &task).unwrap(), b"child!");

    // 只剩一个引用：原地复用
    let before = fault_stats().snapshot();
    assert_eq!(touch(&mut parent, Vaddr(0x1000), AccessKind::Write, &task), Ok(1));
    assert_eq!(frame_at(&parent, Vaddr(0x1000)), Some(old));
    assert!(fault_stats().snapshot().cow_reused > before.cow_reused);
    assert_eq!(task.signals(), 0);
}

#[test]
fn test_private_region_copy_on_write() {
    private_copy_on_write::<X86_64>();
    private_copy_on_write::<I386>();
    private_copy_on_write::<Aarch64>();
}

#[test]
fn test_cow_copy_starts_clean() {
    let task = MockTask::new();
    let (mut parent, _frames) = test_space::<X86_64>(32);
    parent
        .map_region(region(0x1000, 0x2000, RegionProt::RW, ShareMode::Private))
        .unwrap();
    store(&mut parent, Vaddr(0x1000), b"dirty", &task).unwrap();
    assert!(parent.page_table().probe(Vaddr(0x1000)).0.is_dirty());

    let mut child = parent.duplicate().unwrap();
    assert!(child.page_table().probe(Vaddr(0x1000)).0.is_dirty());
    let info = FaultInfo::user(Vaddr(0x1000), AccessKind::Write);
    assert_eq!(child.resolve_fault(&info), Ok(Resolution::Cow));
    let (copy, _) = child.page_table().probe(Vaddr(0x1000));
    assert!(!copy.is_write_protected());
    assert!(!copy.is_dirty());
    assert!(!copy.flags().contains(UniversalPTEFlag::ACCESSED));

    // 原地复用的一侧内容未变，脏位保留
    assert_eq!(parent.resolve_fault(&info), Ok(Resolution::Cow));
    assert!(parent.page_table().probe(Vaddr(0x1000)).0.is_dirty());
    assert_eq!(load(&mut child, Vaddr(0x1000), 5, &task).unwrap(), b"dirty");
}

#[test]
fn test_write_shared_region_is_never_copied() {
    let task = MockTask::new();
    let (mut parent, frames) = test_space::<X86_64>(32);
    parent
        .map_region(region(0x1000, 0x2000, RegionProt::RW, ShareMode::WriteShared))
        .unwrap();
    store(&mut parent, Vaddr(0x1000), b"shared", &task).unwrap();
    let frame = frame_at(&parent, Vaddr(0x1000)).unwrap();

    let mut child = parent.duplicate().unwrap();
    assert_eq!(frame_at(&child, Vaddr(0x1000)), Some(frame));
    assert_eq!(frames.reference_count(frame), 2);
    assert!(!is_write_protected(&parent, 0x1000));
    assert!(!is_write_protected(&child, 0x1000));

    store(&mut child, Vaddr(0x1000), b"update", &task).unwrap();
    assert_eq!(load(&mut parent, Vaddr(0x1000), 6, &task).unwrap(), b"update");
    assert_eq!(frame_at(&child, Vaddr(0x1000)), Some(frame));

    drop(child);
    assert_eq!(frames.reference_count(frame), 1);
    assert_eq!(load(&mut parent, Vaddr(0x1000), 6, &task).unwrap(), b"update");
}

#[test]
fn test_read_shared_region_stays_read_only() {
    let task = MockTask::new();
    let (mut parent, frames) = test_space::<Aarch64>(32);
    parent
        .map_region(region(0x1000, 0x2000, RegionProt::READ, ShareMode::ReadShared))
        .unwrap();
    touch(&mut parent, Vaddr(0x1000), AccessKind::Read, &task).unwrap();
    let frame = frame_at(&parent, Vaddr(0x1000)).unwrap();

    let mut child = parent.duplicate().unwrap();
    assert_eq!(frames.reference_count(frame), 2);
    assert!(is_write_protected(&child, 0x1000));
    assert_eq!(touch(&mut child, Vaddr(0x1000), AccessKind::Read, &task), Ok(0));
    // 区域本身不可写，不属于写时复制
    assert_eq!(
        touch(&mut child, Vaddr(0x1000), AccessKind::Write, &task),
        Err(FaultError::InvalidAccess)
    );
    assert_eq!(frame_at(&child, Vaddr(0x1000)), Some(frame));
}

#[test]
fn test_repeated_forks_share_one_frame() {
    let task = MockTask::new();
    let (mut parent, frames) = test_space::<X86_64>(64);
    parent
        .map_region(region(0x1000, 0x2000, RegionProt::RW, ShareMode::Private))
        .unwrap();
    store(&mut parent, Vaddr(0x1000), b"origin", &task).unwrap();
    let frame = frame_at(&parent, Vaddr(0x1000)).unwrap();

    let mut children: Vec<_> = (0..3).map(|_| parent.duplicate().unwrap()).collect();
    assert_eq!(frames.reference_count(frame), 4);

    for (i, child) in children.iter_mut().enumerate() {
        store(child, Vaddr(0x1000), b"copied", &task).unwrap();
        assert_ne!(frame_at(child, Vaddr(0x1000)), Some(frame));
        assert_eq!(frames.reference_count(frame), 3 - i);
    }
    assert_eq!(load(&mut parent, Vaddr(0x1000), 6, &task).unwrap(), b"origin");

    // 最后的持有者复用原帧
    store(&mut parent, Vaddr(0x1000), b"mine!!", &task).unwrap();
    assert_eq!(frame_at(&parent, Vaddr(0x1000)), Some(frame));
    for child in children.iter_mut() {
        assert_eq!(load(child, Vaddr(0x1000), 6, &task).unwrap(), b"copied");
    }
}

#[test]
fn test_fork_rolls_back_when_tables_run_out() {
    let task = MockTask::new();
    let (mut parent, frames) = test_space::<X86_64>(64);
    let pool = parent.page_table().pool().clone();
    // 三个页分布在不同的子树中
    let pages = [0x1000usize, 0x4000_0000, 0x80_0000_0000];
    for &va in &pages {
        parent
            .map_region(region(va, va + 0x1000, RegionProt::RW, ShareMode::Private))
            .unwrap();
        store(&mut parent, Vaddr(va), b"keep", &task).unwrap();
    }
    let tables = pool.tables_in_use();
    assert_eq!(tables, 9);
    let used = frames.stats().1;

    pool.set_budget(Some(4));
    assert_eq!(parent.duplicate().err(), Some(PagingError::OutOfTables));

    assert_eq!(pool.tables_in_use(), tables);
    assert_eq!(frames.stats().1, used);
    for &va in &pages {
        let frame = frame_at(&parent, Vaddr(va)).unwrap();
        assert_eq!(frames.reference_count(frame), 1);
        assert!(!is_write_protected(&parent, va));
        assert_eq!(touch(&mut parent, Vaddr(va), AccessKind::Write, &task), Ok(0));
    }

    // 预算恢复后可以正常复制
    pool.set_budget(None);
    let child = parent.duplicate().unwrap();
    assert_eq!(pool.tables_in_use(), 2 * tables);
    assert_eq!(child.regions().len(), pages.len());
}

#[test]
fn test_teardown_releases_everything() {
    let task = MockTask::new();
    let (mut parent, frames) = test_space::<I386>(64);
    parent
        .map_region(region(0x1000, 0x5000, RegionProt::RW, ShareMode::Private))
        .unwrap();
    parent
        .map_region(region(0x40_0000, 0x40_1000, RegionProt::RW, ShareMode::WriteShared))
        .unwrap();
    for va in [0x1000, 0x2000, 0x3000, 0x40_0000] {
        store(&mut parent, Vaddr(va), b"x", &task).unwrap();
    }
    let mut child = parent.duplicate().unwrap();
    store(&mut child, Vaddr(0x2000), b"y", &task).unwrap();
    touch(&mut child, Vaddr(0x4000), AccessKind::Read, &task).unwrap();

    drop(parent);
    assert!(frames.stats().1 > 0);
    drop(child);
    assert_eq!(frames.stats().1, 0);
}

struct CountingHooks {
    copied: AtomicUsize,
    released: AtomicUsize,
}

impl RegionHooks for CountingHooks {
    fn on_copied(&self, _src: &Region, dst: &mut Region) {
        self.copied.fetch_add(1, Ordering::Relaxed);
        dst.bind_index(RegionIndex::new());
    }

    fn on_release(&self, _region: &Region) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn test_fork_runs_region_hooks() {
    let (mut parent, _frames) = test_space::<X86_64>(16);
    let hooks = Arc::new(CountingHooks {
        copied: AtomicUsize::new(0),
        released: AtomicUsize::new(0),
    });
    let index = RegionIndex::new();
    let mut text = region(0x1000, 0x2000, RegionProt::READ | RegionProt::EXEC, ShareMode::Private)
        .with_hooks(hooks.clone());
    text.bind_index(index.clone());
    parent.map_region(text).unwrap();

    let child = parent.duplicate().unwrap();
    assert_eq!(hooks.copied.load(Ordering::Relaxed), 1);
    let copy = child.regions().find(Vaddr(0x1000)).unwrap();
    assert!(copy.index().is_some_and(RegionIndex::is_live));

    drop(child);
    assert_eq!(hooks.released.load(Ordering::Relaxed), 1);
    assert!(index.is_live());
    drop(parent);
    assert_eq!(hooks.released.load(Ordering::Relaxed), 2);
    assert!(!index.is_live());
}

#[test]
fn test_locked_space_fork_and_fault() {
    let task = MockTask::new();
    let (mut space, frames) = test_space::<X86_64>(32);
    space
        .map_region(region(0x1000, 0x2000, RegionProt::RW, ShareMode::Private))
        .unwrap();
    let parent = VmSpace::new(space);
    let info = FaultInfo::user(Vaddr(0x1000), AccessKind::Write);
    assert_eq!(parent.handle_page_fault(&info, &task), Ok(Resolution::Anonymous));
    parent.write().write_bytes_at(Vaddr(0x1000), b"lock").unwrap();

    let child = parent.fork().unwrap();
    assert_eq!(parent.handle_page_fault(&info, &task), Ok(Resolution::Cow));
    parent.write().write_bytes_at(Vaddr(0x1000), b"mine").unwrap();

    let mut buf = [0u8; 4];
    child.read().read_bytes_at(Vaddr(0x1000), &mut buf).unwrap();
    assert_eq!(&buf, b"lock");
    parent.read().read_bytes_at(Vaddr(0x1000), &mut buf).unwrap();
    assert_eq!(&buf, b"mine");
    let pa = frame_at(&*child.read(), Vaddr(0x1000)).unwrap();
    assert_eq!(frames.reference_count(pa), 1);
}
