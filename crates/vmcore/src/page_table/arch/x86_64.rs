//! x86_64 四级页表（48 位虚拟地址）

use super::PagingArch;
use crate::address::{Ppn, UsizeConvert};
use crate::page_table::entry::{PageTableEntry, UniversalPTEFlag};

const P: u64 = 1 << 0;
const RW: u64 = 1 << 1;
const US: u64 = 1 << 2;
const A: u64 = 1 << 5;
const D: u64 = 1 << 6;
const PS: u64 = 1 << 7;
const G: u64 = 1 << 8;
// 软件可用位
const SW_WPROTECT: u64 = 1 << 9;
const SW_PINNED: u64 = 1 << 10;
const SW_GUARD: u64 = 1 << 11;
const SW_READ: u64 = 1 << 52;
const NX: u64 = 1 << 63;

const FRAME_MASK: u64 = 0x000f_ffff_ffff_f000;

/// x86_64 页表项
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct X86_64Entry(u64);

impl core::fmt::Debug for X86_64Entry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "X86_64Entry({:#018x})", self.0)
    }
}

impl PageTableEntry for X86_64Entry {
    const EMPTY: Self = Self(0);
    const GUARD: Self = Self(SW_GUARD);

    fn new_table(ppn: Ppn) -> Self {
        Self(((ppn.as_usize() as u64) << 12) & FRAME_MASK | P | RW | US)
    }

    fn new_leaf(ppn: Ppn, flags: UniversalPTEFlag) -> Self {
        let mut bits = ((ppn.as_usize() as u64) << 12) & FRAME_MASK;
        let map = [
            (UniversalPTEFlag::VALID, P),
            (UniversalPTEFlag::WRITEABLE, RW),
            (UniversalPTEFlag::USER_ACCESSIBLE, US),
            (UniversalPTEFlag::ACCESSED, A),
            (UniversalPTEFlag::DIRTY, D),
            (UniversalPTEFlag::HUGE, PS),
            (UniversalPTEFlag::GLOBAL, G),
            (UniversalPTEFlag::WPROTECT, SW_WPROTECT),
            (UniversalPTEFlag::PINNED, SW_PINNED),
            (UniversalPTEFlag::READABLE, SW_READ),
        ];
        for (flag, bit) in map {
            if flags.contains(flag) {
                bits |= bit;
            }
        }
        if !flags.contains(UniversalPTEFlag::EXECUTABLE) {
            bits |= NX;
        }
        Self(bits)
    }

    fn ppn(&self) -> Ppn {
        Ppn::from_usize(((self.0 & FRAME_MASK) >> 12) as usize)
    }

    fn flags(&self) -> UniversalPTEFlag {
        if self.0 == 0 {
            return UniversalPTEFlag::empty();
        }
        let mut flags = UniversalPTEFlag::empty();
        flags.set(UniversalPTEFlag::VALID, self.0 & P != 0);
        flags.set(UniversalPTEFlag::WRITEABLE, self.0 & RW != 0);
        flags.set(UniversalPTEFlag::USER_ACCESSIBLE, self.0 & US != 0);
        flags.set(UniversalPTEFlag::ACCESSED, self.0 & A != 0);
        flags.set(UniversalPTEFlag::DIRTY, self.0 & D != 0);
        flags.set(UniversalPTEFlag::HUGE, self.0 & PS != 0);
        flags.set(UniversalPTEFlag::GLOBAL, self.0 & G != 0);
        flags.set(UniversalPTEFlag::WPROTECT, self.0 & SW_WPROTECT != 0);
        flags.set(UniversalPTEFlag::PINNED, self.0 & SW_PINNED != 0);
        flags.set(UniversalPTEFlag::READABLE, self.0 & SW_READ != 0);
        flags.set(UniversalPTEFlag::EXECUTABLE, self.0 & NX == 0);
        flags
    }

    fn bits(&self) -> u64 {
        self.0
    }
}

/// x86_64 四级分页（PML4 / PDPT / PD / PT）
pub struct X86_64;

impl PagingArch for X86_64 {
    type Entry = X86_64Entry;

    const NAME: &'static str = "x86_64";
    const LEVELS: usize = 4;
    const INDEX_BITS: usize = 9;
    const VA_BITS: usize = 48;
    const SIGN_EXTEND: bool = true;
    const KERNEL_ROOT_START: usize = 256;
}
