//! 测试支持 crate
//!
//! 提供虚拟内存核心测试所需的 Mock 协作者：模拟物理内存、TLB、文件和任务。

#![no_std]

extern crate alloc;

pub mod mock;
