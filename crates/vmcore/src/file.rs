//! 文件映射接口 trait 定义

use crate::address::PAGE_SIZE;
use alloc::sync::Arc;

/// 可用于内存映射读写的 Inode 接口
///
/// 此 trait 抽象了文件 I/O 所需的最小接口。
pub trait MmInode: Send + Sync {
    /// 从指定偏移读取数据到缓冲区
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, isize>;

    /// 将缓冲区数据写入指定偏移
    fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize, isize>;
}

/// 可映射到内存的文件接口
///
/// vfs::File 需要实现此 trait。
pub trait MmFile: Send + Sync {
    /// 获取底层 Inode 用于读写操作
    fn inode(&self) -> Result<Arc<dyn MmInode>, isize>;

    /// 用文件 `offset` 处的内容填充一页
    ///
    /// `page` 调用前已清零；返回实际读入的字节数，文件末尾之后的部分保持为零。
    /// 可能阻塞在底层 I/O 上。
    fn populate_page(&self, page: &mut [u8], offset: usize) -> Result<usize, isize> {
        debug_assert_eq!(page.len(), PAGE_SIZE);
        self.inode()?.read_at(offset, page)
    }

    /// 将一页（文件末尾处可能不足一页）写回文件 `offset` 处
    ///
    /// 返回实际写入的字节数。
    fn writeback_page(&self, page: &[u8], offset: usize) -> Result<usize, isize> {
        self.inode()?.write_at(offset, page)
    }
}
