//! 文件对象的 Mock 实现
//!
//! 注意：这里不直接依赖 `vmcore` crate（避免循环依赖）。
//! `vmcore` crate 在 `cfg(test)` 下为这些类型实现 `MmFile` / `MmInode`。

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};

/// 文件内容：一个极简的自旋保护缓冲区
struct Contents {
    busy: AtomicBool,
    data: UnsafeCell<Vec<u8>>,
}

// SAFETY: 对 data 的访问都由 busy 串行化
unsafe impl Sync for Contents {}

impl Contents {
    fn with<R>(&self, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
        while self
            .busy
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        let r = f(unsafe { &mut *self.data.get() });
        self.busy.store(false, Ordering::Release);
        r
    }
}

/// Mock 的 Inode：内存中的字节数组
pub struct MockInode {
    contents: Contents,
    reads: AtomicUsize,
    writes: AtomicUsize,
    read_error: AtomicIsize,
}

impl MockInode {
    pub fn new(data: &[u8]) -> Self {
        Self {
            contents: Contents {
                busy: AtomicBool::new(false),
                data: UnsafeCell::new(data.to_vec()),
            },
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            read_error: AtomicIsize::new(0),
        }
    }

    /// 从 `offset` 读取，超过文件末尾的部分不填充
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, isize> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let err = self.read_error.load(Ordering::Relaxed);
        if err < 0 {
            return Err(err);
        }
        Ok(self.contents.with(|data| {
            if offset >= data.len() {
                return 0;
            }
            let n = buf.len().min(data.len() - offset);
            buf[..n].copy_from_slice(&data[offset..offset + n]);
            n
        }))
    }

    /// 写入 `offset`，必要时扩展文件
    pub fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize, isize> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(self.contents.with(|data| {
            if data.len() < offset + buf.len() {
                data.resize(offset + buf.len(), 0);
            }
            data[offset..offset + buf.len()].copy_from_slice(buf);
            buf.len()
        }))
    }

    /// 让后续读取全部以 `errno`（负值）失败
    pub fn fail_reads_with(&self, errno: isize) {
        self.read_error.store(errno, Ordering::Relaxed);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// 当前文件内容的拷贝
    pub fn snapshot(&self) -> Vec<u8> {
        self.contents.with(|data| data.clone())
    }
}

/// Mock 的可映射文件
pub struct MockFile {
    pub inode: Arc<MockInode>,
}

impl MockFile {
    pub fn new(data: &[u8]) -> Self {
        Self {
            inode: Arc::new(MockInode::new(data)),
        }
    }
}
