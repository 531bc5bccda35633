//! 页表模块
//!
//! 本模块提供架构无关的多级页表抽象：
//!
//! - [`PageTableEntry`]：页表项编码能力接口，每个架构实现一次
//! - [`PagingArch`]：分页结构描述（级数、索引宽度、自映射槽位、内核共享槽位）
//! - [`TablePool`]：页表页的来源（启动保留区 + 动态分配）
//! - [`PageTable`]：页表遍历器，负责查找/创建各级页表、批量映射与翻译
//!
//! 遍历器、缺页处理和地址空间复制都只面向上述接口编写，不感知任何架构的位布局。

pub mod arch;
mod entry;
mod pool;
mod table;

pub use arch::{Aarch64, Aarch64Entry, I386, I386Entry, PagingArch, X86_64, X86_64Entry};
pub use entry::{PageTableEntry, UniversalPTEFlag};
pub use pool::TablePool;
pub use table::{EntrySlot, PageTable};

use core::fmt;

/// 分页操作中可能发生的错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingError {
    /// 虚拟地址未被映射
    NotMapped,
    /// 虚拟地址已被映射
    AlreadyMapped,
    /// 提供了无效的地址
    InvalidAddress,
    /// 提供了无效的标志（Flags）
    InvalidFlags,
    /// 页表池耗尽
    OutOfTables,
    /// 物理帧耗尽
    OutOfMemory,
    /// 由于与现有的巨页（Huge Page）映射冲突，操作失败。
    HugePageConflict,
    /// 区域不能收缩到其起始地址以下
    ShrinkBelowStart,
    /// 文件读写失败（负 errno）
    IoError(isize),
}

impl fmt::Display for PagingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PagingError::NotMapped => write!(f, "address not mapped"),
            PagingError::AlreadyMapped => write!(f, "address already mapped"),
            PagingError::InvalidAddress => write!(f, "invalid address"),
            PagingError::InvalidFlags => write!(f, "invalid flags"),
            PagingError::OutOfTables => write!(f, "page table pool exhausted"),
            PagingError::OutOfMemory => write!(f, "out of physical frames"),
            PagingError::HugePageConflict => write!(f, "conflicts with a huge mapping"),
            PagingError::ShrinkBelowStart => write!(f, "shrink below region start"),
            PagingError::IoError(errno) => write!(f, "file I/O failed ({})", errno),
        }
    }
}

impl PagingError {
    /// 转换为返回给用户态的负 errno
    pub fn to_errno(self) -> isize {
        use uapi::errno::*;
        match self {
            PagingError::NotMapped | PagingError::InvalidAddress => -EFAULT,
            PagingError::AlreadyMapped => -EEXIST,
            PagingError::InvalidFlags | PagingError::ShrinkBelowStart => -EINVAL,
            PagingError::OutOfTables | PagingError::OutOfMemory => -ENOMEM,
            PagingError::HugePageConflict => -EINVAL,
            PagingError::IoError(errno) => errno,
        }
    }
}

/// 分页操作的结果类型
pub type PagingResult<T> = Result<T, PagingError>;
