//! 内存空间模块
//!
//! 本模块定义了地址空间（Address Space）的相关结构和功能：
//! 区域与区域登记表、地址空间的创建与映射管理，以及 fork 时的地址空间复制。

mod fork;
mod mmap_file;
/// 内存区域相关定义与操作。
pub mod region;
mod registry;
mod space;
mod vmspace;

pub use mmap_file::MmapFile;
pub use region::{AreaType, Region, RegionAttrs, RegionHooks, RegionIndex, RegionProt, ShareMode};
pub use registry::RegionList;
pub use space::AddressSpace;
pub use vmspace::VmSpace;
