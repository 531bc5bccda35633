//! AArch64 四级页表（4KiB 粒度，TTBR0 下 48 位虚拟地址）

use super::PagingArch;
use crate::address::{Ppn, UsizeConvert};
use crate::page_table::entry::{PageTableEntry, UniversalPTEFlag};

const VALID: u64 = 1 << 0;
// 非最后一级：1 = 页表描述符，0 = 块描述符；最后一级必须为 1
const TABLE_OR_PAGE: u64 = 1 << 1;
const AP_USER: u64 = 1 << 6;
const AP_RO: u64 = 1 << 7;
const SH_INNER: u64 = 0b11 << 8;
const AF: u64 = 1 << 10;
const NG: u64 = 1 << 11;
const PXN: u64 = 1 << 53;
const UXN: u64 = 1 << 54;
// 软件保留位 55..=58（页表描述符中同样被硬件忽略）
const SW_WPROTECT: u64 = 1 << 55;
const SW_READ: u64 = 1 << 56;
const SW_DIRTY: u64 = 1 << 57;
const SW_PINNED: u64 = 1 << 58;
// AttrIndx[0]：编码只使用 MAIR 第 0 项，正常表项中恒为 0
const GUARD_MARK: u64 = 1 << 2;

const FRAME_MASK: u64 = 0x0000_ffff_ffff_f000;

/// AArch64 stage-1 描述符
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Aarch64Entry(u64);

impl core::fmt::Debug for Aarch64Entry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Aarch64Entry({:#018x})", self.0)
    }
}

impl PageTableEntry for Aarch64Entry {
    const EMPTY: Self = Self(0);
    const GUARD: Self = Self(GUARD_MARK);

    fn new_table(ppn: Ppn) -> Self {
        Self(((ppn.as_usize() as u64) << 12) & FRAME_MASK | VALID | TABLE_OR_PAGE)
    }

    fn new_leaf(ppn: Ppn, flags: UniversalPTEFlag) -> Self {
        let mut bits = ((ppn.as_usize() as u64) << 12) & FRAME_MASK | SH_INNER;
        let user = flags.contains(UniversalPTEFlag::USER_ACCESSIBLE);
        if flags.contains(UniversalPTEFlag::VALID) {
            bits |= VALID;
        }
        if !flags.contains(UniversalPTEFlag::HUGE) {
            bits |= TABLE_OR_PAGE;
        }
        if user {
            bits |= AP_USER;
        }
        if !flags.contains(UniversalPTEFlag::WRITEABLE) {
            bits |= AP_RO;
        }
        // 可执行只对对应特权级开放，另一侧始终禁止执行
        bits |= match (flags.contains(UniversalPTEFlag::EXECUTABLE), user) {
            (true, true) => PXN,
            (true, false) => UXN,
            (false, _) => PXN | UXN,
        };
        if flags.contains(UniversalPTEFlag::ACCESSED) {
            bits |= AF;
        }
        if !flags.contains(UniversalPTEFlag::GLOBAL) {
            bits |= NG;
        }
        let map = [
            (UniversalPTEFlag::WPROTECT, SW_WPROTECT),
            (UniversalPTEFlag::READABLE, SW_READ),
            (UniversalPTEFlag::DIRTY, SW_DIRTY),
            (UniversalPTEFlag::PINNED, SW_PINNED),
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
        if self.0 == 0 {
            return UniversalPTEFlag::empty();
        }
        let user = self.0 & AP_USER != 0;
        let xn = if user { UXN } else { PXN };
        let mut flags = UniversalPTEFlag::empty();
        flags.set(UniversalPTEFlag::VALID, self.0 & VALID != 0);
        flags.set(UniversalPTEFlag::HUGE, self.0 & TABLE_OR_PAGE == 0);
        flags.set(UniversalPTEFlag::USER_ACCESSIBLE, user);
        flags.set(UniversalPTEFlag::WRITEABLE, self.0 & AP_RO == 0);
        flags.set(UniversalPTEFlag::EXECUTABLE, self.0 & xn == 0);
        flags.set(UniversalPTEFlag::ACCESSED, self.0 & AF != 0);
        flags.set(UniversalPTEFlag::GLOBAL, self.0 & NG == 0);
        flags.set(UniversalPTEFlag::WPROTECT, self.0 & SW_WPROTECT != 0);
        flags.set(UniversalPTEFlag::READABLE, self.0 & SW_READ != 0);
        flags.set(UniversalPTEFlag::DIRTY, self.0 & SW_DIRTY != 0);
        flags.set(UniversalPTEFlag::PINNED, self.0 & SW_PINNED != 0);
        flags
    }

    fn bits(&self) -> u64 {
        self.0
    }
}

/// AArch64 四级分页（仅用户半区 TTBR0；内核位于 TTBR1，无共享槽位）
pub struct Aarch64;

impl PagingArch for Aarch64 {
    type Entry = Aarch64Entry;

    const NAME: &'static str = "aarch64";
    const LEVELS: usize = 4;
    const INDEX_BITS: usize = 9;
    const VA_BITS: usize = 48;
    const SIGN_EXTEND: bool = false;
    const KERNEL_ROOT_START: usize = 511;
}
