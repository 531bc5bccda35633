//! 带锁的地址空间
//!
//! 同一地址空间的页表与区域在任一时刻只允许一个修改者：
//! 缺页处理、fork 与映射修改取写锁，只读查询取读锁。

use crate::fault::{self, FaultError, FaultInfo, FaultTaskOps, Resolution};
use crate::lock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use crate::memory_space::AddressSpace;
use crate::page_table::{PagingArch, PagingResult};

/// 由读写锁保护的地址空间
pub struct VmSpace<A: PagingArch> {
    inner: RwLock<AddressSpace<A>>,
}

impl<A: PagingArch> VmSpace<A> {
    /// 包装一个地址空间
    pub fn new(space: AddressSpace<A>) -> Self {
        Self {
            inner: RwLock::new(space),
        }
    }

    /// 处理一次缺页（见 [`fault::handle_page_fault`]）
    pub fn handle_page_fault(
        &self,
        info: &FaultInfo,
        task: &dyn FaultTaskOps,
    ) -> Result<Resolution, FaultError> {
        fault::handle_page_fault(&mut self.inner.write(), info, task)
    }

    /// 复制出一个新的地址空间
    pub fn fork(&self) -> PagingResult<Self> {
        let child = self.inner.write().duplicate()?;
        Ok(Self::new(child))
    }

    /// 只读访问
    pub fn read(&self) -> RwLockReadGuard<'_, AddressSpace<A>> {
        self.inner.read()
    }

    /// 独占访问
    pub fn write(&self) -> RwLockWriteGuard<'_, AddressSpace<A>> {
        self.inner.write()
    }
}
