//! 页表项编码
//!
//! 页表项在语义上是 {空, 指向下级页表, 叶子映射} 的标签联合。
//! 叶子映射携带物理帧地址与一组架构无关的状态位（[`UniversalPTEFlag`]），
//! 各架构把这些状态位编码到自己的硬件布局中。

use crate::address::{Paddr, PageNum, Ppn};
use bitflags::bitflags;
use core::fmt;

bitflags! {
    /// 架构无关的页表项标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct UniversalPTEFlag: usize {
        /// 已装载（硬件可见）
        const VALID = 1 << 0;
        /// 可读
        const READABLE = 1 << 1;
        /// 可写
        const WRITEABLE = 1 << 2;
        /// 可执行
        const EXECUTABLE = 1 << 3;
        /// 用户态可访问
        const USER_ACCESSIBLE = 1 << 4;
        /// 全局映射（切换地址空间时不失效）
        const GLOBAL = 1 << 5;
        /// 已访问
        const ACCESSED = 1 << 6;
        /// 已写脏
        const DIRTY = 1 << 7;
        /// 大页（在非最后一级终止遍历）
        const HUGE = 1 << 8;
        /// 写保护：写时复制候选，与“不可写”区分
        const WPROTECT = 1 << 9;
        /// 常驻，不随区域回收（自映射窗口内新装的页表页）
        const PINNED = 1 << 10;
    }
}

impl UniversalPTEFlag {
    /// 保护位：读 / 写 / 执行 / 用户态
    pub const PROT_MASK: Self = Self::READABLE
        .union(Self::WRITEABLE)
        .union(Self::EXECUTABLE)
        .union(Self::USER_ACCESSIBLE);

    /// 用户态只读
    pub const fn user_r() -> Self {
        Self::READABLE.union(Self::USER_ACCESSIBLE)
    }

    /// 用户态读写
    pub const fn user_rw() -> Self {
        Self::user_r().union(Self::WRITEABLE)
    }

    /// 内核读写
    pub const fn kernel_rw() -> Self {
        Self::READABLE.union(Self::WRITEABLE)
    }
}

/// 页表项编码能力接口
///
/// 必需方法描述一个架构的位布局；提供的方法都是按值进行的纯变换和谓词，
/// 遍历器、缺页处理器与复制器只使用这些方法。
pub trait PageTableEntry: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    /// 空表项
    const EMPTY: Self;

    /// 保护哨兵：永远缺页、且不会由正常分配产生的保留值
    const GUARD: Self;

    /// 构造指向下级页表的表项
    fn new_table(ppn: Ppn) -> Self;

    /// 按架构无关标志构造叶子表项
    fn new_leaf(ppn: Ppn, flags: UniversalPTEFlag) -> Self;

    /// 表项中的物理页号
    fn ppn(&self) -> Ppn;

    /// 解码出的架构无关标志
    fn flags(&self) -> UniversalPTEFlag;

    /// 原始位（调试用）
    fn bits(&self) -> u64;

    /// 以物理帧和保护位构造叶子表项（未装载）
    fn make_leaf(frame: Paddr, prot: UniversalPTEFlag) -> Self {
        Self::new_leaf(
            Ppn::from_addr_floor(frame),
            prot & UniversalPTEFlag::PROT_MASK,
        )
    }

    /// 表项引用的物理帧地址
    fn frame_of(&self) -> Paddr {
        self.ppn().start_addr()
    }

    /// 保护位
    fn protection(&self) -> UniversalPTEFlag {
        self.flags() & UniversalPTEFlag::PROT_MASK
    }

    /// 在保持帧地址的前提下改写标志
    fn with_flags(self, flags: UniversalPTEFlag) -> Self {
        Self::new_leaf(self.ppn(), flags)
    }

    /// 替换保护位，其余状态位不变
    fn set_protection(self, prot: UniversalPTEFlag) -> Self {
        let flags = self.flags().difference(UniversalPTEFlag::PROT_MASK)
            | (prot & UniversalPTEFlag::PROT_MASK);
        self.with_flags(flags)
    }

    /// 置可执行
    fn mark_executable(self) -> Self {
        self.with_flags(self.flags() | UniversalPTEFlag::EXECUTABLE)
    }

    /// 置可写并清除写保护
    fn mark_writable(self) -> Self {
        self.with_flags((self.flags() | UniversalPTEFlag::WRITEABLE) - UniversalPTEFlag::WPROTECT)
    }

    /// 清除可写并置写保护
    fn mark_write_protected(self) -> Self {
        self.with_flags((self.flags() - UniversalPTEFlag::WRITEABLE) | UniversalPTEFlag::WPROTECT)
    }

    /// 置大页
    fn mark_huge(self) -> Self {
        self.with_flags(self.flags() | UniversalPTEFlag::HUGE)
    }

    /// 置已装载
    fn mark_loaded(self) -> Self {
        self.with_flags(self.flags() | UniversalPTEFlag::VALID)
    }

    /// 置常驻
    fn mark_pinned(self) -> Self {
        self.with_flags(self.flags() | UniversalPTEFlag::PINNED)
    }

    /// 置脏
    fn mark_dirty(self) -> Self {
        self.with_flags(self.flags() | UniversalPTEFlag::DIRTY | UniversalPTEFlag::ACCESSED)
    }

    /// 清除脏位
    fn mark_clean(self) -> Self {
        self.with_flags(self.flags() - UniversalPTEFlag::DIRTY)
    }

    /// 清除访问位
    fn mark_untouched(self) -> Self {
        self.with_flags(self.flags() - UniversalPTEFlag::ACCESSED)
    }

    /// 是否为空
    fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }

    /// 是否为保护哨兵
    fn is_guard(&self) -> bool {
        *self == Self::GUARD
    }

    /// 是否已装载
    fn is_loaded(&self) -> bool {
        !self.is_guard() && self.flags().contains(UniversalPTEFlag::VALID)
    }

    /// 是否写保护
    fn is_write_protected(&self) -> bool {
        !self.is_guard() && self.flags().contains(UniversalPTEFlag::WPROTECT)
    }

    /// 是否为大页
    fn is_huge(&self) -> bool {
        !self.is_empty() && !self.is_guard() && self.flags().contains(UniversalPTEFlag::HUGE)
    }

    /// 是否常驻
    fn is_pinned(&self) -> bool {
        !self.is_guard() && self.flags().contains(UniversalPTEFlag::PINNED)
    }

    /// 是否为脏页
    fn is_dirty(&self) -> bool {
        !self.is_guard() && self.flags().contains(UniversalPTEFlag::DIRTY)
    }

    /// 在第 `level` 级（`leaf_level` 为最后一级）是否指向下级页表
    fn is_table(&self, level: usize, leaf_level: usize) -> bool {
        level < leaf_level && self.is_loaded() && !self.is_huge()
    }
}
