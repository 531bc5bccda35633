//! 地址模块
//!
//! 此模块提供了用于处理物理地址和虚拟地址，
//! 以及内存管理系统中的页码的抽象。
//!
//! # 地址类型
//!
//! - [`Paddr`] - 物理地址类型
//! - [`Vaddr`] - 虚拟地址类型
//!
//! # 页码
//!
//! - [`PageNum`] - 表示页码的 Trait
//! - [`Ppn`] - 物理页码（Physical Page Number）
//! - [`Vpn`] - 虚拟页码（Virtual Page Number）
//! - [`PpnRange`] / [`VpnRange`] - 半开页码区间
//!
//! # 操作
//!
//! - [`UsizeConvert`] - 在类型和 usize 之间进行转换
//! - [`AlignOps`] - 页对齐操作
pub mod operations;
pub mod page_num;
pub mod types;

pub use operations::{AlignOps, UsizeConvert};
pub use page_num::{PageNum, PageNumRange, Ppn, PpnRange, Vpn, VpnRange};
pub use types::{Paddr, Vaddr};

/// 页大小的位数
pub const PAGE_SHIFT: usize = 12;

/// 基本页大小（所有架构均为 4KiB）
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
