//! 分页结构描述与各架构页表项布局
//!
//! [`PagingArch`] 以关联常量描述一个架构（或寻址模式）的多级基数树：
//! 级数、每级索引位宽、虚拟地址宽度、规范化方式，以及根页表中由内核共享的槽位。
//! 根页表的最后一个槽位固定作为自映射槽位，指回根页表本身。

mod aarch64;
mod i386;
mod x86_64;

pub use aarch64::{Aarch64, Aarch64Entry};
pub use i386::{I386, I386Entry};
pub use x86_64::{X86_64, X86_64Entry};

use super::entry::PageTableEntry;
use crate::address::{PAGE_SHIFT, UsizeConvert, Vaddr};

/// 分页结构描述
pub trait PagingArch: Sized + Send + Sync + 'static {
    /// 该架构的页表项类型
    type Entry: PageTableEntry;

    /// 架构名（日志用）
    const NAME: &'static str;
    /// 页表级数，根为第 0 级
    const LEVELS: usize;
    /// 每级索引位宽
    const INDEX_BITS: usize;
    /// 页表翻译的虚拟地址位宽
    const VA_BITS: usize;
    /// 高半部分是否按最高有效位符号扩展
    const SIGN_EXTEND: bool;
    /// 根页表中自此下标起的槽位为内核映射，由所有地址空间共享
    const KERNEL_ROOT_START: usize;

    /// 每张页表的表项数
    const ENTRIES: usize = 1 << Self::INDEX_BITS;
    /// 自映射槽位：根页表的最后一项
    const SELF_MAP_INDEX: usize = Self::ENTRIES - 1;
    /// 最后一级（叶子页表）的级号
    const LEAF_LEVEL: usize = Self::LEVELS - 1;

    /// 第 `level` 级索引在虚拟地址中的起始位
    fn level_shift(level: usize) -> usize {
        PAGE_SHIFT + Self::INDEX_BITS * (Self::LEAF_LEVEL - level)
    }

    /// 第 `level` 级单个表项覆盖的字节数
    fn level_size(level: usize) -> usize {
        1 << Self::level_shift(level)
    }

    /// 虚拟地址在第 `level` 级页表中的下标
    fn index_of(va: Vaddr, level: usize) -> usize {
        (va.as_usize() >> Self::level_shift(level)) & (Self::ENTRIES - 1)
    }

    /// 粒度对应的级号；非法粒度返回 None
    fn level_for_granularity(size: usize) -> Option<usize> {
        (0..Self::LEVELS).find(|&level| Self::level_size(level) == size)
    }

    /// 由各级下标拼出的原始地址规范化为虚拟地址
    fn canonicalize(raw: usize) -> Vaddr {
        if Self::VA_BITS >= usize::BITS as usize {
            return Vaddr::from_usize(raw);
        }
        let mask = (1usize << Self::VA_BITS) - 1;
        let low = raw & mask;
        if Self::SIGN_EXTEND && low & (1 << (Self::VA_BITS - 1)) != 0 {
            Vaddr::from_usize(low | !mask)
        } else {
            Vaddr::from_usize(low)
        }
    }

    /// 用户地址空间上界（不含），即首个内核槽位覆盖的地址
    fn user_space_end() -> usize {
        Self::KERNEL_ROOT_START << Self::level_shift(0)
    }

    /// 是否为用户地址
    fn is_user_addr(va: Vaddr) -> bool {
        va.as_usize() < Self::user_space_end()
    }

    /// 根页表下标是否为内核共享槽位
    fn is_kernel_root_slot(index: usize) -> bool {
        index >= Self::KERNEL_ROOT_START && index != Self::SELF_MAP_INDEX
    }

    /// 自映射窗口的起始地址
    fn self_map_base() -> Vaddr {
        Self::canonicalize(Self::SELF_MAP_INDEX << Self::level_shift(0))
    }

    /// 地址是否落在自映射窗口内
    fn in_self_map(va: Vaddr) -> bool {
        let base = Self::self_map_base().as_usize();
        va.as_usize() >= base && va.as_usize() - base < Self::level_size(0)
    }

    /// 经自映射窗口访问“映射 `va` 的第 `level` 级页表项”所用的虚拟地址
    ///
    /// 前 `LEVELS - level` 级下标均取自映射槽位，其余依次取 `va` 的高位下标，
    /// 页内偏移为该项在页表中的字节偏移。
    fn slot_vaddr(va: Vaddr, level: usize) -> Vaddr {
        let recursive = Self::LEVELS - level;
        let mut raw = 0usize;
        for i in 0..Self::LEVELS {
            let idx = if i < recursive {
                Self::SELF_MAP_INDEX
            } else {
                Self::index_of(va, i - recursive)
            };
            raw |= idx << Self::level_shift(i);
        }
        raw += Self::index_of(va, level) * core::mem::size_of::<Self::Entry>();
        Self::canonicalize(raw)
    }
}
