//! 地址与页码的通用操作

use super::PAGE_SIZE;

/// 与 usize 互相转换
pub trait UsizeConvert: Sized {
    /// 转换为 usize
    fn as_usize(&self) -> usize;
    /// 从 usize 构造
    fn from_usize(value: usize) -> Self;
}

/// 页对齐相关操作
pub trait AlignOps: UsizeConvert + Copy {
    /// 是否按页对齐
    fn is_page_aligned(&self) -> bool {
        self.as_usize() & (PAGE_SIZE - 1) == 0
    }

    /// 向下对齐到页边界
    fn align_down_to_page(self) -> Self {
        Self::from_usize(self.as_usize() & !(PAGE_SIZE - 1))
    }

    /// 向上对齐到页边界
    fn align_up_to_page(self) -> Self {
        Self::from_usize((self.as_usize() + PAGE_SIZE - 1) & !(PAGE_SIZE - 1))
    }

    /// 向上对齐到页边界，溢出时返回 None
    fn checked_align_up_to_page(self) -> Option<Self> {
        self.as_usize()
            .checked_add(PAGE_SIZE - 1)
            .map(|value| Self::from_usize(value & !(PAGE_SIZE - 1)))
    }

    /// 页内偏移
    fn page_offset(&self) -> usize {
        self.as_usize() & (PAGE_SIZE - 1)
    }
}

/// `impl_calc_ops!` 宏
///
/// 为 newtype 实现与 usize 的加减运算。
#[macro_export]
macro_rules! impl_calc_ops {
    ($type:ty) => {
        impl core::ops::Add<usize> for $type {
            type Output = Self;

            fn add(self, rhs: usize) -> Self {
                Self(self.0 + rhs)
            }
        }

        impl core::ops::AddAssign<usize> for $type {
            fn add_assign(&mut self, rhs: usize) {
                self.0 += rhs;
            }
        }

        impl core::ops::Sub<usize> for $type {
            type Output = Self;

            fn sub(self, rhs: usize) -> Self {
                Self(self.0 - rhs)
            }
        }

        impl core::ops::Sub<$type> for $type {
            type Output = usize;

            fn sub(self, rhs: $type) -> usize {
                self.0 - rhs.0
            }
        }
    };
}
