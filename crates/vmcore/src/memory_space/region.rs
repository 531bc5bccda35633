//! 内存区域
//!
//! [`Region`] 描述地址空间中一段页对齐的半开区间 `[start, end)`，
//! 携带保护位、共享方式和后备来源（匿名 / 文件 + 偏移）。
//! 区域本身只是元数据：页表项由缺页处理按需建立。

use crate::address::{AlignOps, PageNum, UsizeConvert, Vaddr, Vpn, VpnRange, PAGE_SIZE};
use crate::memory_space::MmapFile;
use crate::page_table::{PagingError, PagingResult, UniversalPTEFlag};
use alloc::sync::Arc;
use bitflags::bitflags;
use core::sync::atomic::{AtomicUsize, Ordering};
use uapi::mm::{MapFlags, ProtFlags};

bitflags! {
    /// 区域保护位
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionProt: u8 {
        /// 可读
        const READ = 1 << 0;
        /// 可写
        const WRITE = 1 << 1;
        /// 可执行
        const EXEC = 1 << 2;
    }
}

impl RegionProt {
    /// 读写
    pub const RW: Self = Self::READ.union(Self::WRITE);

    /// 转换为页表项标志（不含 VALID）
    pub fn to_pte_flags(self, user: bool) -> UniversalPTEFlag {
        let mut flags = UniversalPTEFlag::empty();
        if self.contains(Self::READ) {
            flags |= UniversalPTEFlag::READABLE;
        }
        if self.contains(Self::WRITE) {
            flags |= UniversalPTEFlag::WRITEABLE;
        }
        if self.contains(Self::EXEC) {
            flags |= UniversalPTEFlag::EXECUTABLE;
        }
        if user {
            flags |= UniversalPTEFlag::USER_ACCESSIBLE;
        }
        flags
    }
}

impl From<ProtFlags> for RegionProt {
    fn from(prot: ProtFlags) -> Self {
        let mut out = Self::empty();
        if prot.contains(ProtFlags::READ) {
            out |= Self::READ;
        }
        if prot.contains(ProtFlags::WRITE) {
            out |= Self::WRITE;
        }
        if prot.contains(ProtFlags::EXEC) {
            out |= Self::EXEC;
        }
        out
    }
}

/// 共享方式，决定 fork 时如何处理物理帧
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareMode {
    /// 私有：fork 后写时复制
    Private,
    /// 只读共享：fork 后写时复制
    ReadShared,
    /// 读写共享：fork 后两边共用同一帧，永不复制
    WriteShared,
}

impl ShareMode {
    /// 由 mmap 的标志推导共享方式；SHARED 与 PRIVATE 必须恰好给出一个
    pub fn from_mmap(prot: ProtFlags, flags: MapFlags) -> PagingResult<Self> {
        match (
            flags.contains(MapFlags::SHARED),
            flags.contains(MapFlags::PRIVATE),
        ) {
            (true, false) if prot.contains(ProtFlags::WRITE) => Ok(Self::WriteShared),
            (true, false) => Ok(Self::ReadShared),
            (false, true) => Ok(Self::Private),
            _ => Err(PagingError::InvalidFlags),
        }
    }

    /// fork 时是否需要写保护
    pub fn is_cow(self) -> bool {
        !matches!(self, Self::WriteShared)
    }
}

/// 内存区域的类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AreaType {
    /// 用户代码段
    UserText,
    /// 用户数据段
    UserData,
    /// 用户栈
    UserStack,
    /// 用户堆
    UserHeap,
    /// 用户 mmap 映射
    UserMmap,
    /// 内核区域
    Kernel,
}

/// 区域属性
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionAttrs {
    /// 保护位
    pub prot: RegionProt,
    /// 共享方式
    pub share: ShareMode,
    /// 区域类型
    pub area_type: AreaType,
}

impl RegionAttrs {
    /// 创建区域属性
    pub const fn new(prot: RegionProt, share: ShareMode, area_type: AreaType) -> Self {
        Self {
            prot,
            share,
            area_type,
        }
    }

    /// 私有匿名读写区域
    pub const fn private_rw(area_type: AreaType) -> Self {
        Self::new(RegionProt::RW, ShareMode::Private, area_type)
    }
}

/// 区域生命周期回调
///
/// 由拥有者按需挂接，例如在 fork 后登记新区域、在释放时撤销外部记账。
pub trait RegionHooks: Send + Sync {
    /// 区域被复制到新地址空间之后调用
    fn on_copied(&self, _src: &Region, _dst: &mut Region) {}

    /// 区域被释放之前调用
    fn on_release(&self, _region: &Region) {}
}

const UNBOUND: usize = usize::MAX;

/// 拥有者对区域的外部回指
///
/// 记录区域的起始地址；区域释放后被清空，持有者据此发现悬空引用。
#[derive(Debug, Clone)]
pub struct RegionIndex(Arc<AtomicUsize>);

impl RegionIndex {
    /// 创建一个未绑定的回指
    pub fn new() -> Self {
        Self(Arc::new(AtomicUsize::new(UNBOUND)))
    }

    /// 所指区域的起始地址；区域已释放时为 None
    pub fn get(&self) -> Option<Vaddr> {
        match self.0.load(Ordering::Acquire) {
            UNBOUND => None,
            start => Some(Vaddr::from_usize(start)),
        }
    }

    /// 所指区域是否仍然存在
    pub fn is_live(&self) -> bool {
        self.get().is_some()
    }

    fn set(&self, start: Vaddr) {
        self.0.store(start.as_usize(), Ordering::Release);
    }

    fn clear(&self) {
        self.0.store(UNBOUND, Ordering::Release);
    }
}

impl Default for RegionIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// 地址空间中的一个内存区域
pub struct Region {
    range: VpnRange,
    attrs: RegionAttrs,
    file: Option<MmapFile>,
    hooks: Option<Arc<dyn RegionHooks>>,
    index: Option<RegionIndex>,
}

impl Region {
    /// 创建区域 `[start, end)`，两端必须页对齐且非空
    pub fn new(start: Vaddr, end: Vaddr, attrs: RegionAttrs) -> PagingResult<Self> {
        if !start.is_page_aligned() || !end.is_page_aligned() || start >= end {
            return Err(PagingError::InvalidAddress);
        }
        Ok(Self {
            range: VpnRange::from_addrs(start, end),
            attrs,
            file: None,
            hooks: None,
            index: None,
        })
    }

    /// 创建区域 `[start, start + len)`
    pub fn from_start_len(start: Vaddr, len: usize, attrs: RegionAttrs) -> PagingResult<Self> {
        let end = start
            .as_usize()
            .checked_add(len)
            .ok_or(PagingError::InvalidAddress)?;
        Self::new(start, Vaddr::from_usize(end), attrs)
    }

    /// 以文件为后备
    pub fn with_file(mut self, file: MmapFile) -> Self {
        self.file = Some(file);
        self
    }

    /// 挂接生命周期回调
    pub fn with_hooks(mut self, hooks: Arc<dyn RegionHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// 登记外部回指
    pub fn bind_index(&mut self, index: RegionIndex) {
        index.set(self.start());
        self.index = Some(index);
    }

    /// 起始地址
    pub fn start(&self) -> Vaddr {
        self.range.start().start_addr()
    }

    /// 结束地址（不含）
    pub fn end(&self) -> Vaddr {
        self.range.end().start_addr()
    }

    /// 虚拟页号范围
    pub fn vpn_range(&self) -> VpnRange {
        self.range
    }

    /// 区域字节数
    pub fn len(&self) -> usize {
        self.range.len() * PAGE_SIZE
    }

    /// 是否为空区域
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// 是否包含 `va`（按所在页判断）
    pub fn contains(&self, va: Vaddr) -> bool {
        self.range.contains(Vpn::from_addr_floor(va))
    }

    /// 区域属性
    pub fn attrs(&self) -> RegionAttrs {
        self.attrs
    }

    /// 保护位
    pub fn prot(&self) -> RegionProt {
        self.attrs.prot
    }

    /// 共享方式
    pub fn share(&self) -> ShareMode {
        self.attrs.share
    }

    /// 区域类型
    pub fn area_type(&self) -> AreaType {
        self.attrs.area_type
    }

    /// 文件后备
    pub fn file(&self) -> Option<&MmapFile> {
        self.file.as_ref()
    }

    /// 生命周期回调
    pub fn hooks(&self) -> Option<&Arc<dyn RegionHooks>> {
        self.hooks.as_ref()
    }

    /// 外部回指
    pub fn index(&self) -> Option<&RegionIndex> {
        self.index.as_ref()
    }

    /// 是否为匿名（按需清零）区域
    pub fn is_anonymous(&self) -> bool {
        self.file.is_none()
    }

    /// `va` 所在页在区域内的页序号
    pub fn page_index(&self, va: Vaddr) -> usize {
        Vpn::from_addr_floor(va).as_usize() - self.range.start().as_usize()
    }

    /// `va` 所在页对应的文件偏移；匿名区域返回 None
    pub fn file_offset_of(&self, va: Vaddr) -> Option<usize> {
        self.file
            .as_ref()
            .map(|file| file.offset_of_page(self.page_index(va)))
    }

    /// 浅复制：共享文件对象（增加一个引用）与回调，不复制外部回指
    pub fn duplicate(&self) -> Self {
        Self {
            range: self.range,
            attrs: self.attrs,
            file: self.file.clone(),
            hooks: self.hooks.clone(),
            index: None,
        }
    }

    /// 在 `at` 处切开，`self` 保留前半段，返回后半段
    ///
    /// 外部回指留在前半段（起始地址不变）。
    pub fn split_off(&mut self, at: Vaddr) -> PagingResult<Self> {
        let at_vpn = Vpn::from_addr_floor(at);
        if !at.is_page_aligned()
            || at_vpn <= self.range.start()
            || at_vpn >= self.range.end()
        {
            return Err(PagingError::InvalidAddress);
        }
        let left_pages = self.page_index(at);
        let (left_file, right_file) = match self.file.as_ref().map(|f| f.split(left_pages)) {
            Some((left, right)) => (Some(left), Some(right)),
            None => (None, None),
        };
        let right = Self {
            range: VpnRange::new(at_vpn, self.range.end()),
            attrs: self.attrs,
            file: right_file,
            hooks: self.hooks.clone(),
            index: None,
        };
        self.range = VpnRange::new(self.range.start(), at_vpn);
        self.file = left_file;
        log::trace!("region split at {:?}", at);
        Ok(right)
    }

    /// 调整区域结束地址（堆伸缩）
    pub(crate) fn resize(&mut self, new_end: Vaddr) -> PagingResult<()> {
        if !new_end.is_page_aligned() {
            return Err(PagingError::InvalidAddress);
        }
        if new_end <= self.start() {
            return Err(PagingError::ShrinkBelowStart);
        }
        self.range = VpnRange::new(self.range.start(), Vpn::from_addr_floor(new_end));
        Ok(())
    }

    /// 释放区域：调用回调、关闭文件引用、清空外部回指
    pub fn release(mut self) {
        if let Some(hooks) = self.hooks.take() {
            hooks.on_release(&self);
        }
        if let Some(file) = self.file.take() {
            log::trace!("region {:?}: dropping file reference at offset {:#x}", self.start(), file.offset);
        }
        if let Some(index) = self.index.take() {
            index.clear();
        }
    }
}

impl core::fmt::Debug for Region {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Region")
            .field("start", &self.start())
            .field("end", &self.end())
            .field("attrs", &self.attrs)
            .field("file", &self.file)
            .finish()
    }
}
