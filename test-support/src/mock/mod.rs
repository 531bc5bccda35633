//! Mock 实现模块
//!
//! 提供内存子系统各个外部协作者的 Mock 实现，用于测试

pub mod fs;
pub mod mm;
pub mod task;
