//! mmap 文件映射信息

use crate::address::PAGE_SIZE;
use crate::file::MmFile;
use alloc::sync::Arc;

/// 文件映射信息
///
/// 复制（`Clone`）即为文件对象增加一个引用，丢弃即关闭该引用。
#[derive(Clone)]
pub struct MmapFile {
    /// 文件对象引用
    pub file: Arc<dyn MmFile>,
    /// 区域起始处对应的文件偏移量（字节，页对齐）
    pub offset: usize,
    /// 映射长度（字节）
    pub len: usize,
}

impl MmapFile {
    /// 创建文件映射信息
    pub fn new(file: Arc<dyn MmFile>, offset: usize, len: usize) -> Self {
        Self { file, offset, len }
    }

    /// 区域内第 `page` 页对应的文件偏移
    pub fn offset_of_page(&self, page: usize) -> usize {
        self.offset + page * PAGE_SIZE
    }

    /// 写回第 `page` 页时应写入的字节数（不超过映射长度）
    pub fn writeback_len(&self, page: usize) -> usize {
        self.len.saturating_sub(page * PAGE_SIZE).min(PAGE_SIZE)
    }

    /// 在第 `pages` 页处切成两段
    pub fn split(&self, pages: usize) -> (Self, Self) {
        let cut = (pages * PAGE_SIZE).min(self.len);
        let left = Self::new(self.file.clone(), self.offset, cut);
        let right = Self::new(self.file.clone(), self.offset + pages * PAGE_SIZE, self.len - cut);
        (left, right)
    }

    /// 文件引用计数（调试用）
    pub fn references(&self) -> usize {
        Arc::strong_count(&self.file)
    }
}

// 手动实现 Debug，因为 dyn MmFile 没有实现 Debug
impl core::fmt::Debug for MmapFile {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MmapFile")
            .field("file", &"<dyn MmFile>")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}
