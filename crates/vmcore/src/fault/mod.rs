//! 缺页处理
//!
//! 一次缺页经过如下状态：
//!
//! ```text
//! ENTRY -> (guard?) -> 预分配 -> CLASSIFY -> { KERNEL | COW | ANON | FILE | UNRESOLVED }
//!       -> RESOLVED | FAILED
//! ```
//!
//! - ENTRY：记录缺页地址、特权级、该地址当前的页表项快照和匹配的区域
//! - guard：快照为保护哨兵时直接失败（[`FaultError::RegionOverrun`]）
//! - 预分配：叶子尚未装载时先取一个物理帧，最终用不上的分支会归还它
//! - KERNEL：经自映射窗口访问页表本身时缺页，把预分配帧装为常驻页表页
//! - COW：写保护页的用户态写，复制（或在只剩一个引用时原地复用）物理帧
//! - ANON / FILE：清零或从文件装入预分配帧
//!
//! [`AddressSpace::resolve_fault`](crate::memory_space::AddressSpace::resolve_fault)
//! 执行到 RESOLVED 或返回错误；[`handle_page_fault`] 负责 FAILED 的收尾：
//! 内核态失败即停机，用户态失败投递段错误信号并让出 CPU。

mod dispatch;
mod stats;

pub use stats::{fault_stats, FaultStats, FaultStatsSnapshot};

use crate::address::Vaddr;
use crate::memory_space::AddressSpace;
use crate::page_table::{PagingArch, PagingError};
use core::fmt;

/// 缺页嵌套的最大深度，超过即视为内部错误
pub const MAX_FAULT_DEPTH: usize = 10;

/// 触发缺页的访问类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    /// 读
    Read,
    /// 写
    Write,
    /// 取指
    Execute,
}

/// 一次缺页的上下文（由陷入处理代码填写）
#[derive(Debug, Clone, Copy)]
pub struct FaultInfo {
    /// 缺页地址
    pub va: Vaddr,
    /// 触发缺页的指令地址
    pub instruction: usize,
    /// 访问类型
    pub access: AccessKind,
    /// 是否发生在特权态
    pub privileged: bool,
    /// 当前缺页嵌套深度（最外层为 1）
    pub depth: usize,
}

impl FaultInfo {
    /// 用户态缺页
    pub fn user(va: Vaddr, access: AccessKind) -> Self {
        Self {
            va,
            instruction: 0,
            access,
            privileged: false,
            depth: 1,
        }
    }

    /// 内核态缺页
    pub fn kernel(va: Vaddr, access: AccessKind) -> Self {
        Self {
            privileged: true,
            ..Self::user(va, access)
        }
    }

    /// 记录触发指令地址
    pub fn at(mut self, instruction: usize) -> Self {
        self.instruction = instruction;
        self
    }

    /// 记录嵌套深度
    pub fn nested(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    fn mode(&self) -> &'static str {
        if self.privileged { "kernel" } else { "user" }
    }
}

/// 缺页失败原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    /// 页表池耗尽
    OutOfTables,
    /// 物理帧耗尽
    OutOfMemory,
    /// 访问了保护哨兵（栈/堆越界）
    RegionOverrun,
    /// 不能由写时复制解释的权限冲突
    InvalidAccess,
    /// 文件页装入失败（负 errno）
    IoError(isize),
    /// 没有区域覆盖缺页地址
    Unmapped,
}

impl fmt::Display for FaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultError::OutOfTables => write!(f, "page table pool exhausted"),
            FaultError::OutOfMemory => write!(f, "out of physical frames"),
            FaultError::RegionOverrun => write!(f, "guard page hit (region overrun)"),
            FaultError::InvalidAccess => write!(f, "invalid access"),
            FaultError::IoError(errno) => write!(f, "page populate failed ({})", errno),
            FaultError::Unmapped => write!(f, "no region covers the address"),
        }
    }
}

impl From<PagingError> for FaultError {
    fn from(err: PagingError) -> Self {
        match err {
            PagingError::OutOfTables => FaultError::OutOfTables,
            PagingError::OutOfMemory => FaultError::OutOfMemory,
            PagingError::IoError(errno) => FaultError::IoError(errno),
            PagingError::NotMapped => FaultError::Unmapped,
            _ => FaultError::InvalidAccess,
        }
    }
}

impl From<FaultError> for PagingError {
    fn from(err: FaultError) -> Self {
        match err {
            FaultError::OutOfTables => PagingError::OutOfTables,
            FaultError::OutOfMemory => PagingError::OutOfMemory,
            FaultError::IoError(errno) => PagingError::IoError(errno),
            FaultError::Unmapped => PagingError::NotMapped,
            FaultError::RegionOverrun | FaultError::InvalidAccess => PagingError::InvalidAddress,
        }
    }
}

/// 缺页成功时走过的分支
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// 装入了一张页表页
    Kernel,
    /// 写时复制
    Cow,
    /// 匿名页清零
    Anonymous,
    /// 文件页装入
    File,
}

/// 调度器 / 信号投递协作者
pub trait FaultTaskOps {
    /// 向触发缺页的线程投递信号
    fn deliver_fault_signal(&self, signo: u32);

    /// 让出 CPU
    fn yield_now(&self);
}

/// 处理一次缺页
///
/// 成功时陷入处理代码重新执行触发指令；用户态失败时已投递
/// `SIGSEGV` 并让出过 CPU，调用者不得再回到触发指令。
///
/// # Panics
///
/// 嵌套深度超过 [`MAX_FAULT_DEPTH`]，或特权态缺页无法解决时停机。
pub fn handle_page_fault<A: PagingArch>(
    space: &mut AddressSpace<A>,
    info: &FaultInfo,
    task: &dyn FaultTaskOps,
) -> Result<Resolution, FaultError> {
    if info.depth > MAX_FAULT_DEPTH {
        log::error!(
            "page fault nested too deep ({}) at {:?}, ip {:#x}",
            info.depth,
            info.va,
            info.instruction
        );
        panic!("page fault nesting exceeds {}", MAX_FAULT_DEPTH);
    }

    match space.resolve_fault(info) {
        Ok(resolution) => Ok(resolution),
        Err(err) => {
            log::error!(
                "unresolved page fault: {} at {:?}, ip {:#x}, {} mode, {:?} access",
                err,
                info.va,
                info.instruction,
                info.mode(),
                info.access
            );
            if info.privileged {
                panic!("unrecoverable kernel page fault at {:?}: {}", info.va, err);
            }
            task.deliver_fault_signal(uapi::signal::SIGSEGV);
            task.yield_now();
            Err(err)
        }
    }
}
