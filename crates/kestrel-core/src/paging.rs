//! Page table management
//!
//! A four-level radix tree (512 entries per level) mapping virtual pages to
//! physical frames. Leaf entries use the x86_64 bit layout so the same
//! values can be loaded into hardware tables by an arch backend.
//!
//! The tree only records translations. Which frames back a page, and when
//! they are freed, is the address space's business.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ops::BitOr;

use crate::types::{Access, FrameNumber, PhysAddr, Prot, VirtAddr, PAGE_SHIFT, PAGE_SIZE};

/// Entries per table level
pub const ENTRIES_PER_TABLE: usize = 512;

/// Page table entry flag bits
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct PageFlags(u64);

impl PageFlags {
    pub const PRESENT: PageFlags = PageFlags(1);
    pub const WRITABLE: PageFlags = PageFlags(1 << 1);
    pub const USER: PageFlags = PageFlags(1 << 2);
    pub const WRITE_THROUGH: PageFlags = PageFlags(1 << 3);
    pub const NO_CACHE: PageFlags = PageFlags(1 << 4);
    pub const ACCESSED: PageFlags = PageFlags(1 << 5);
    pub const DIRTY: PageFlags = PageFlags(1 << 6);
    pub const NO_EXECUTE: PageFlags = PageFlags(1 << 63);

    const MASK: u64 = 0x7F | (1 << 63);

    pub const fn empty() -> Self {
        PageFlags(0)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn from_bits_truncate(bits: u64) -> Self {
        PageFlags(bits & Self::MASK)
    }

    pub const fn contains(self, other: PageFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn without(self, other: PageFlags) -> Self {
        PageFlags(self.0 & !other.0)
    }

    /// Flags for a user mapping with the given protection.
    ///
    /// `writable` is separate from `prot.write`: copy-on-write pages are
    /// writable by protection but mapped read-only until the first fault.
    pub fn user(prot: Prot, writable: bool) -> Self {
        let mut flags = Self::PRESENT | Self::USER;
        if writable {
            flags = flags | Self::WRITABLE;
        }
        if !prot.execute {
            flags = flags | Self::NO_EXECUTE;
        }
        flags
    }
}

impl BitOr for PageFlags {
    type Output = PageFlags;

    fn bitor(self, rhs: PageFlags) -> PageFlags {
        PageFlags(self.0 | rhs.0)
    }
}

/// A leaf entry: frame address + flags
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    pub fn new(frame: FrameNumber, flags: PageFlags) -> Self {
        PageTableEntry(((frame.0 << PAGE_SHIFT) & Self::ADDR_MASK) | flags.bits())
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn frame(self) -> FrameNumber {
        FrameNumber((self.0 & Self::ADDR_MASK) >> PAGE_SHIFT)
    }

    pub fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0)
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(PageFlags::PRESENT)
    }

    pub fn is_writable(self) -> bool {
        self.flags().contains(PageFlags::WRITABLE)
    }

    pub fn is_user(self) -> bool {
        self.flags().contains(PageFlags::USER)
    }

    pub fn is_executable(self) -> bool {
        !self.flags().contains(PageFlags::NO_EXECUTE)
    }

    pub fn with_flags(self, flags: PageFlags) -> Self {
        Self::new(self.frame(), flags)
    }

    /// Whether this entry permits `access` from user mode
    pub fn permits(self, access: Access) -> bool {
        self.is_present()
            && self.is_user()
            && match access {
                Access::Read => true,
                Access::Write => self.is_writable(),
                Access::Execute => self.is_executable(),
            }
    }
}

/// Page table errors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PagingError {
    /// Address not page aligned
    Misaligned(VirtAddr),
    /// Address in the non-canonical hole
    NonCanonical(VirtAddr),
    /// A translation already exists
    AlreadyMapped(VirtAddr),
    /// No translation exists
    NotMapped(VirtAddr),
    /// Range fails pointer validation
    BadAddress(VirtAddr),
}

// ============================================================================
// Radix tree
// ============================================================================

#[derive(Clone)]
enum Slot {
    Empty,
    Table(Box<Table>),
    Leaf(PageTableEntry),
}

#[derive(Clone)]
struct Table {
    slots: Box<[Slot; ENTRIES_PER_TABLE]>,
}

impl Table {
    fn new() -> Self {
        Self {
            slots: Box::new(core::array::from_fn(|_| Slot::Empty)),
        }
    }
}

/// Table indices for a virtual address, root first
fn indices(addr: VirtAddr) -> [usize; 4] {
    let mut out = [0usize; 4];
    for (level, slot) in out.iter_mut().enumerate() {
        let shift = 39 - 9 * level as u32;
        *slot = ((addr.0 >> shift) & (ENTRIES_PER_TABLE as u64 - 1)) as usize;
    }
    out
}

/// Reassemble a canonical address from table indices
fn address_of(indices: [usize; 4]) -> VirtAddr {
    let mut raw = 0u64;
    for (level, idx) in indices.iter().enumerate() {
        raw |= (*idx as u64) << (39 - 9 * level as u32);
    }
    if raw & (1 << 47) != 0 {
        raw |= 0xFFFF_0000_0000_0000;
    }
    VirtAddr(raw)
}

/// One address space's page tables
#[derive(Clone)]
pub struct PageMap {
    root: Table,
    mapped: usize,
}

impl PageMap {
    pub fn new() -> Self {
        Self {
            root: Table::new(),
            mapped: 0,
        }
    }

    /// Number of present leaf entries
    pub fn mapped_pages(&self) -> usize {
        self.mapped
    }

    /// Install a translation for one page.
    pub fn map_page(
        &mut self,
        addr: VirtAddr,
        frame: FrameNumber,
        flags: PageFlags,
    ) -> Result<(), PagingError> {
        check_page(addr)?;
        let slot = self.leaf_mut(addr, true).ok_or(PagingError::BadAddress(addr))?;
        if let Slot::Leaf(_) = slot {
            return Err(PagingError::AlreadyMapped(addr));
        }
        *slot = Slot::Leaf(PageTableEntry::new(frame, flags | PageFlags::PRESENT));
        self.mapped += 1;
        Ok(())
    }

    /// Point an existing translation at a different frame.
    ///
    /// Returns the replaced entry.
    pub fn remap_page(
        &mut self,
        addr: VirtAddr,
        frame: FrameNumber,
        flags: PageFlags,
    ) -> Result<PageTableEntry, PagingError> {
        check_page(addr)?;
        match self.leaf_mut(addr, false) {
            Some(Slot::Leaf(entry)) => {
                let old = *entry;
                *entry = PageTableEntry::new(frame, flags | PageFlags::PRESENT);
                Ok(old)
            }
            _ => Err(PagingError::NotMapped(addr)),
        }
    }

    /// Remove a translation, returning the old entry.
    pub fn unmap_page(&mut self, addr: VirtAddr) -> Result<PageTableEntry, PagingError> {
        check_page(addr)?;
        let slot = self
            .leaf_mut(addr, false)
            .ok_or(PagingError::NotMapped(addr))?;
        let old = match slot {
            Slot::Leaf(entry) => *entry,
            _ => return Err(PagingError::NotMapped(addr)),
        };
        *slot = Slot::Empty;
        self.mapped -= 1;
        Ok(old)
    }

    /// Change the flags of an existing translation, keeping its frame.
    pub fn protect(&mut self, addr: VirtAddr, flags: PageFlags) -> Result<(), PagingError> {
        check_page(addr)?;
        match self.leaf_mut(addr, false) {
            Some(Slot::Leaf(entry)) => {
                *entry = PageTableEntry::new(entry.frame(), flags | PageFlags::PRESENT);
                Ok(())
            }
            _ => Err(PagingError::NotMapped(addr)),
        }
    }

    /// Leaf entry for the page containing `addr`
    pub fn entry(&self, addr: VirtAddr) -> Option<PageTableEntry> {
        if !addr.is_canonical() {
            return None;
        }
        let idx = indices(addr);
        let mut table = &self.root;
        for &i in &idx[..3] {
            table = match &table.slots[i] {
                Slot::Table(next) => next.as_ref(),
                _ => return None,
            };
        }
        match table.slots[idx[3]] {
            Slot::Leaf(entry) => Some(entry),
            _ => None,
        }
    }

    /// Physical address `addr` translates to, with the leaf flags
    pub fn translate(&self, addr: VirtAddr) -> Option<(PhysAddr, PageFlags)> {
        self.entry(addr).map(|entry| {
            (
                PhysAddr(entry.frame().address().0 + addr.page_offset() as u64),
                entry.flags(),
            )
        })
    }

    /// Every present translation, in address order
    pub fn mappings(&self) -> Vec<(VirtAddr, PageTableEntry)> {
        let mut out = Vec::with_capacity(self.mapped);
        collect(&self.root, 0, [0; 4], &mut out);
        out
    }

    /// Validate a user buffer against the installed translations.
    ///
    /// Every page of `[base, base + len)` must be present, user accessible
    /// and permit `access`. Zero-length buffers are valid anywhere in the
    /// user half.
    pub fn check_user_pointer(
        &self,
        base: VirtAddr,
        len: usize,
        access: Access,
    ) -> Result<(), PagingError> {
        let end = user_range_end(base, len)?;
        let mut page = base.align_down();
        while page.0 < end {
            match self.entry(page) {
                Some(entry) if entry.permits(access) => {}
                _ => return Err(PagingError::BadAddress(page)),
            }
            page = page.offset(PAGE_SIZE as u64);
        }
        Ok(())
    }

    /// Validate a kernel buffer: entirely in the kernel half, no wrap.
    pub fn check_kernel_pointer(&self, base: VirtAddr, len: usize) -> Result<(), PagingError> {
        if !base.is_kernel() {
            return Err(PagingError::BadAddress(base));
        }
        base.0
            .checked_add(len as u64)
            .map(|_| ())
            .ok_or(PagingError::BadAddress(base))
    }

    fn leaf_mut(&mut self, addr: VirtAddr, create: bool) -> Option<&mut Slot> {
        let idx = indices(addr);
        let mut table = &mut self.root;
        for &i in &idx[..3] {
            let slot = &mut table.slots[i];
            if let Slot::Empty = slot {
                if !create {
                    return None;
                }
                *slot = Slot::Table(Box::new(Table::new()));
            }
            table = match slot {
                Slot::Table(next) => next.as_mut(),
                _ => return None,
            };
        }
        Some(&mut table.slots[idx[3]])
    }
}

impl Default for PageMap {
    fn default() -> Self {
        Self::new()
    }
}

fn collect(table: &Table, level: usize, mut prefix: [usize; 4], out: &mut Vec<(VirtAddr, PageTableEntry)>) {
    for (i, slot) in table.slots.iter().enumerate() {
        prefix[level] = i;
        match slot {
            Slot::Empty => {}
            Slot::Table(next) if level < 3 => collect(next, level + 1, prefix, out),
            Slot::Table(_) => {}
            Slot::Leaf(entry) => out.push((address_of(prefix), *entry)),
        }
    }
}

fn check_page(addr: VirtAddr) -> Result<(), PagingError> {
    if !addr.is_page_aligned() {
        return Err(PagingError::Misaligned(addr));
    }
    if !addr.is_canonical() {
        return Err(PagingError::NonCanonical(addr));
    }
    Ok(())
}

/// End of a user range, rejecting wraparound and anything reaching the
/// kernel half.
pub(crate) fn user_range_end(base: VirtAddr, len: usize) -> Result<u64, PagingError> {
    let end = base
        .0
        .checked_add(len as u64)
        .ok_or(PagingError::BadAddress(base))?;
    if !base.is_user() || end > crate::types::USER_TOP {
        return Err(PagingError::BadAddress(base));
    }
    Ok(end)
}
