//! 虚拟内存核心
//!
//! 提供架构无关的多级页表、按需分页的缺页处理、每个地址空间的区域登记表，
//! 以及 fork 使用的写时复制地址空间复制。
//!
//! # 架构解耦
//!
//! 通过 trait 抽象与架构特定组件解耦：
//! - [`PagingArch`] / [`PageTableEntry`]: 分页结构与页表项位布局，每个架构实现一次
//! - [`ArchMmOps`]: 直接映射地址转换、TLB 操作
//! - [`MmConfig`]: 用户地址空间布局常量
//! - [`FrameAllocator`]: 物理帧分配与引用计数
//! - [`MmFile`] / [`MmInode`]: 文件页的装入与写回
//! - [`FaultTaskOps`]: 缺页失败时的信号投递与调度
//!
//! 使用前必须调用 [`register_arch_ops`] 和 [`register_config`] 注册实现。

#![no_std]

extern crate alloc;

mod arch_ops;
mod config;
mod file;

pub mod address;
pub mod fault;
pub mod frame_allocator;
pub mod lock;
pub mod memory_space;
pub mod page_table;

pub use arch_ops::{arch_ops, flush_range, register_arch_ops, ArchMmOps, TLB_FLUSH_ALL_THRESHOLD};
pub use config::{mm_config, register_config, MmConfig};
pub use file::{MmFile, MmInode};

// Re-export 常用类型
pub use address::{AlignOps, PageNum, Paddr, Ppn, PpnRange, UsizeConvert, Vaddr, Vpn, VpnRange, PAGE_SIZE};
pub use fault::{
    fault_stats, handle_page_fault, AccessKind, FaultError, FaultInfo, FaultTaskOps, Resolution,
};
pub use frame_allocator::{
    init_frame_allocator, FrameAllocator, FrameTracker, GlobalFrameAllocator, LockedFrameAllocator,
};
pub use memory_space::{
    AddressSpace, AreaType, MmapFile, Region, RegionAttrs, RegionHooks, RegionIndex, RegionList,
    RegionProt, ShareMode, VmSpace,
};
pub use page_table::{
    PageTable, PageTableEntry, PagingArch, PagingError, PagingResult, TablePool, UniversalPTEFlag,
};

#[cfg(test)]
mod tests;
