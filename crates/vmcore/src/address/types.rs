//! 物理地址与虚拟地址类型

use super::operations::{AlignOps, UsizeConvert};
use core::fmt;

macro_rules! impl_address {
    ($type:ident, $prefix:literal) => {
        impl UsizeConvert for $type {
            fn as_usize(&self) -> usize {
                self.0
            }

            fn from_usize(value: usize) -> Self {
                Self(value)
            }
        }

        impl AlignOps for $type {}

        $crate::impl_calc_ops!($type);

        impl fmt::Debug for $type {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "({:#x})"), self.0)
            }
        }

        impl fmt::Display for $type {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl From<usize> for $type {
            fn from(value: usize) -> Self {
                Self(value)
            }
        }
    };
}

/// 物理地址
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Paddr(pub usize);
impl_address!(Paddr, "Paddr");

/// 虚拟地址
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Vaddr(pub usize);
impl_address!(Vaddr, "Vaddr");

impl Paddr {
    /// 通过内核直接映射得到可访问的指针
    pub fn as_mut_ptr<T>(self) -> *mut T {
        crate::arch_ops().paddr_to_vaddr(self.0) as *mut T
    }
}

impl Vaddr {
    /// 转换为裸指针
    pub fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align() {
        let va = Vaddr::from_usize(0x1234);
        assert!(!va.is_page_aligned());
        assert_eq!(va.align_down_to_page(), Vaddr(0x1000));
        assert_eq!(va.align_up_to_page(), Vaddr(0x2000));
        assert_eq!(va.page_offset(), 0x234);
        assert_eq!(Vaddr(0x2000).align_up_to_page(), Vaddr(0x2000));
        assert_eq!(va.checked_align_up_to_page(), Some(Vaddr(0x2000)));
        assert_eq!(Vaddr(usize::MAX - 10).checked_align_up_to_page(), None);
        assert_eq!(
            Vaddr(usize::MAX & !0xfff).checked_align_up_to_page(),
            Some(Vaddr(usize::MAX & !0xfff))
        );
    }

    #[test]
    fn test_calc() {
        let pa = Paddr(0x1000) + 0x20;
        assert_eq!(pa, Paddr(0x1020));
        assert_eq!(Paddr(0x3000) - Paddr(0x1000), 0x2000);
    }
}
