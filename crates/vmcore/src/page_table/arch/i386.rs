//! i386 两级页表（32 位虚拟地址，无 PAE）

use super::PagingArch;
use crate::address::{Ppn, UsizeConvert};
use crate::page_table::entry::{PageTableEntry, UniversalPTEFlag};

const P: u32 = 1 << 0;
const RW: u32 = 1 << 1;
const US: u32 = 1 << 2;
const A: u32 = 1 << 5;
const D: u32 = 1 << 6;
const PS: u32 = 1 << 7;
const G: u32 = 1 << 8;
// 只有 9..=11 三个软件可用位，PINNED 无处存放，编码时丢弃
const SW_READ: u32 = 1 << 9;
const SW_WPROTECT: u32 = 1 << 10;
const SW_EXEC: u32 = 1 << 11;

const FRAME_MASK: u32 = 0xffff_f000;

/// i386 页表项
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct I386Entry(u32);

impl core::fmt::Debug for I386Entry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "I386Entry({:#010x})", self.0)
    }
}

impl PageTableEntry for I386Entry {
    const EMPTY: Self = Self(0);
    // 帧号全 1 且 P=0：最后一个物理页是 BIOS/MMIO 区，不会被分配
    const GUARD: Self = Self(FRAME_MASK | SW_READ | SW_WPROTECT | SW_EXEC);

    fn new_table(ppn: Ppn) -> Self {
        Self(((ppn.as_usize() as u32) << 12) & FRAME_MASK | P | RW | US)
    }

    fn new_leaf(ppn: Ppn, flags: UniversalPTEFlag) -> Self {
        let mut bits = ((ppn.as_usize() as u32) << 12) & FRAME_MASK;
        let map = [
            (UniversalPTEFlag::VALID, P),
            (UniversalPTEFlag::WRITEABLE, RW),
            (UniversalPTEFlag::USER_ACCESSIBLE, US),
            (UniversalPTEFlag::ACCESSED, A),
            (UniversalPTEFlag::DIRTY, D),
            (UniversalPTEFlag::HUGE, PS),
            (UniversalPTEFlag::GLOBAL, G),
            (UniversalPTEFlag::READABLE, SW_READ),
            (UniversalPTEFlag::WPROTECT, SW_WPROTECT),
            (UniversalPTEFlag::EXECUTABLE, SW_EXEC),
        ];
        for (flag, bit) in map {
            if flags.contains(flag) {
                bits |= bit;
            }
        }
        Self(bits)
    }

    fn ppn(&self) -> Ppn {
        Ppn::from_usize(((self.0 & FRAME_MASK) >> 12) as usize)
    }

    fn flags(&self) -> UniversalPTEFlag {
        let mut flags = UniversalPTEFlag::empty();
        flags.set(UniversalPTEFlag::VALID, self.0 & P != 0);
        flags.set(UniversalPTEFlag::WRITEABLE, self.0 & RW != 0);
        flags.set(UniversalPTEFlag::USER_ACCESSIBLE, self.0 & US != 0);
        flags.set(UniversalPTEFlag::ACCESSED, self.0 & A != 0);
        flags.set(UniversalPTEFlag::DIRTY, self.0 & D != 0);
        flags.set(UniversalPTEFlag::HUGE, self.0 & PS != 0);
        flags.set(UniversalPTEFlag::GLOBAL, self.0 & G != 0);
        flags.set(UniversalPTEFlag::READABLE, self.0 & SW_READ != 0);
        flags.set(UniversalPTEFlag::WPROTECT, self.0 & SW_WPROTECT != 0);
        flags.set(UniversalPTEFlag::EXECUTABLE, self.0 & SW_EXEC != 0);
        flags
    }

    fn bits(&self) -> u64 {
        self.0 as u64
    }
}

/// i386 两级分页（页目录 / 页表）
pub struct I386;

impl PagingArch for I386 {
    type Entry = I386Entry;

    const NAME: &'static str = "i386";
    const LEVELS: usize = 2;
    const INDEX_BITS: usize = 10;
    const VA_BITS: usize = 32;
    const SIGN_EXTEND: bool = false;
    const KERNEL_ROOT_START: usize = 768;
}
