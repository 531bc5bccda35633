//! 内存映射相关的用户态接口定义（与 Linux 保持一致）

use bitflags::bitflags;

bitflags! {
    /// mmap / mprotect 的保护标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProtFlags: u32 {
        const NONE = 0x0;
        const READ = 0x1;
        const WRITE = 0x2;
        const EXEC = 0x4;
    }
}

bitflags! {
    /// mmap 的映射标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const SHARED = 0x01;
        const PRIVATE = 0x02;
        const FIXED = 0x10;
        const ANONYMOUS = 0x20;
    }
}

bitflags! {
    /// msync 标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MsyncFlags: u32 {
        const ASYNC = 0x1;
        const INVALIDATE = 0x2;
        const SYNC = 0x4;
    }
}

/// mmap 失败时返回给用户态的地址
pub const MAP_FAILED: usize = usize::MAX;
