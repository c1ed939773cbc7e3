//! Address spaces
//!
//! An address space is a page map plus an ordered set of regions, each
//! mapping a VM object. Frames are installed into the page map lazily by
//! `handle_page_fault`; every user-memory access from the kernel goes
//! through `copy_from_user` / `copy_to_user`, which validate against the
//! regions and resolve faults rather than touching raw pointers.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use serde::{Deserialize, Serialize};

use crate::error::KernelError;
use crate::paging::{user_range_end, PageFlags, PageMap};
use crate::phys::{PhysError, PhysicalMemory};
use crate::types::{
    pages_for, Access, AddressSpaceId, FrameNumber, Prot, VirtAddr, VmObjectId, PAGE_SIZE,
    USER_TOP,
};
use crate::vm::{VmObject, VmObjectKind};

/// A contiguous mapping of one VM object
#[derive(Clone, Debug)]
pub struct Region {
    pub base: VirtAddr,
    pub pages: usize,
    pub prot: Prot,
    pub object: Arc<VmObject>,
}

impl Region {
    pub fn size(&self) -> usize {
        self.pages * PAGE_SIZE
    }

    pub fn end(&self) -> VirtAddr {
        self.base.offset(self.size() as u64)
    }

    pub fn contains(&self, addr: VirtAddr) -> bool {
        addr >= self.base && addr < self.end()
    }

    fn page_index(&self, addr: VirtAddr) -> usize {
        ((addr.0 - self.base.0) as usize) / PAGE_SIZE
    }

    fn page_address(&self, index: usize) -> VirtAddr {
        self.base.offset((index * PAGE_SIZE) as u64)
    }
}

/// Serializable view of a region for dumps
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionInfo {
    pub base: VirtAddr,
    pub pages: usize,
    pub prot: Prot,
    pub object: VmObjectId,
    pub kind: VmObjectKind,
    pub copy_on_write: bool,
    pub map_count: usize,
    pub populated: usize,
}

/// Why a fault could not be resolved
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultError {
    /// No region covers the address
    Unmapped(VirtAddr),
    /// The region forbids the access
    ProtectionViolation(VirtAddr),
    /// No frame for the page
    OutOfMemory(PhysError),
}

impl From<FaultError> for KernelError {
    fn from(e: FaultError) -> Self {
        match e {
            FaultError::Unmapped(addr) | FaultError::ProtectionViolation(addr) => {
                KernelError::BadAddress(addr)
            }
            FaultError::OutOfMemory(e) => e.into(),
        }
    }
}

impl From<PhysError> for FaultError {
    fn from(e: PhysError) -> Self {
        FaultError::OutOfMemory(e)
    }
}

/// One process's view of memory
pub struct AddressSpace {
    id: AddressSpaceId,
    parent: Option<AddressSpaceId>,
    page_map: PageMap,
    regions: BTreeMap<VirtAddr, Region>,
    phys: Arc<PhysicalMemory>,
}

impl AddressSpace {
    pub fn new(id: AddressSpaceId, phys: Arc<PhysicalMemory>) -> Self {
        Self {
            id,
            parent: None,
            page_map: PageMap::new(),
            regions: BTreeMap::new(),
            phys,
        }
    }

    pub fn id(&self) -> AddressSpaceId {
        self.id
    }

    /// The space this one was forked from (non-owning)
    pub fn parent(&self) -> Option<AddressSpaceId> {
        self.parent
    }

    pub fn physical_memory(&self) -> &Arc<PhysicalMemory> {
        &self.phys
    }

    pub fn page_map(&self) -> &PageMap {
        &self.page_map
    }

    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.values()
    }

    pub fn dump(&self) -> Vec<RegionInfo> {
        self.regions
            .values()
            .map(|region| RegionInfo {
                base: region.base,
                pages: region.pages,
                prot: region.prot,
                object: region.object.id(),
                kind: region.object.kind(),
                copy_on_write: region.object.is_copy_on_write(),
                map_count: region.object.map_count(),
                populated: region.object.populated_pages(),
            })
            .collect()
    }

    /// Physical memory backing this space's regions
    pub fn used_physical_memory(&self) -> usize {
        self.regions.values().map(|r| r.object.used_memory()).sum()
    }

    // ========================================================================
    // Region lookup
    // ========================================================================

    pub fn region_at(&self, addr: VirtAddr) -> Option<&Region> {
        self.regions
            .range(..=addr)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.contains(addr))
    }

    pub fn address_to_vm_object(&self, addr: VirtAddr) -> Option<Arc<VmObject>> {
        self.region_at(addr).map(|region| region.object.clone())
    }

    /// Whether `[base, base + size)` lies inside a single region
    pub fn range_in_region(&self, base: VirtAddr, size: usize) -> bool {
        match (self.region_at(base), base.0.checked_add(size as u64)) {
            (Some(region), Some(end)) => end <= region.end().0,
            _ => false,
        }
    }

    /// Lowest free, page-aligned range of `pages` pages. Page 0 is never
    /// handed out.
    pub fn find_available(&self, pages: usize) -> Option<VirtAddr> {
        let size = (pages * PAGE_SIZE) as u64;
        let mut cursor = PAGE_SIZE as u64;
        for region in self.regions.values() {
            if region.base.0 >= cursor && region.base.0 - cursor >= size {
                return Some(VirtAddr(cursor));
            }
            cursor = cursor.max(region.end().0);
        }
        (USER_TOP - cursor >= size).then_some(VirtAddr(cursor))
    }

    fn is_free(&self, base: VirtAddr, pages: usize) -> bool {
        let end = base.0.saturating_add((pages * PAGE_SIZE) as u64);
        if base.0 < PAGE_SIZE as u64 || end > USER_TOP {
            return false;
        }
        match self.regions.range(..VirtAddr(end)).next_back() {
            Some((_, region)) => region.end().0 <= base.0,
            None => true,
        }
    }

    // ========================================================================
    // Mapping
    // ========================================================================

    /// Zero-filled private memory anywhere in the user half.
    pub fn allocate_anonymous(&mut self, size: usize, prot: Prot) -> Result<VirtAddr, KernelError> {
        let pages = checked_pages(size)?;
        let object = VmObject::anonymous(self.phys.clone(), pages);
        self.map_new(object, None, prot)
    }

    /// Zero-filled private memory at a fixed address.
    pub fn allocate_anonymous_at(
        &mut self,
        base: VirtAddr,
        size: usize,
        prot: Prot,
    ) -> Result<VirtAddr, KernelError> {
        let pages = checked_pages(size)?;
        let object = VmObject::anonymous(self.phys.clone(), pages);
        self.map_new(object, Some(base), prot)
    }

    /// Memory that stays shared with children across fork.
    pub fn allocate_shared(
        &mut self,
        size: usize,
        prot: Prot,
    ) -> Result<(VirtAddr, Arc<VmObject>), KernelError> {
        let pages = checked_pages(size)?;
        let object = VmObject::shared(self.phys.clone(), pages);
        let base = self.map_new(object.clone(), None, prot)?;
        Ok((base, object))
    }

    /// Install a freshly created object, consuming the mapping it was
    /// born with. On failure that mapping is released.
    pub fn map_new(
        &mut self,
        object: Arc<VmObject>,
        base: Option<VirtAddr>,
        prot: Prot,
    ) -> Result<VirtAddr, KernelError> {
        match self.place(object.pages(), base) {
            Ok(base) => {
                self.insert_region(base, prot, object);
                Ok(base)
            }
            Err(e) => {
                object.release_mapping();
                Err(e)
            }
        }
    }

    /// Map an object that is already mapped elsewhere. Increments its map
    /// count.
    pub fn map_object(
        &mut self,
        object: Arc<VmObject>,
        base: Option<VirtAddr>,
        prot: Prot,
    ) -> Result<VirtAddr, KernelError> {
        let base = self.place(object.pages(), base)?;
        object.acquire_mapping();
        self.insert_region(base, prot, object);
        Ok(base)
    }

    fn place(&self, pages: usize, base: Option<VirtAddr>) -> Result<VirtAddr, KernelError> {
        match base {
            Some(base) if !base.is_page_aligned() => Err(KernelError::InvalidArgument),
            Some(base) if !self.is_free(base, pages) => Err(KernelError::AddressInUse(base)),
            Some(base) => Ok(base),
            None => self.find_available(pages).ok_or(KernelError::OutOfMemory),
        }
    }

    fn insert_region(&mut self, base: VirtAddr, prot: Prot, object: Arc<VmObject>) {
        let pages = object.pages();
        self.regions.insert(
            base,
            Region {
                base,
                pages,
                prot,
                object,
            },
        );
    }

    /// Remove every region lying wholly inside `[base, base + size)`.
    ///
    /// Returns the number of regions removed.
    pub fn unmap(&mut self, base: VirtAddr, size: usize) -> Result<usize, KernelError> {
        if !base.is_page_aligned() {
            return Err(KernelError::InvalidArgument);
        }
        let end = base
            .0
            .checked_add(size as u64)
            .ok_or(KernelError::InvalidArgument)?;

        let doomed: Vec<VirtAddr> = self
            .regions
            .range(base..VirtAddr(end))
            .filter(|(_, region)| region.end().0 <= end)
            .map(|(key, _)| *key)
            .collect();

        for key in &doomed {
            if let Some(region) = self.regions.remove(key) {
                self.drop_region(region);
            }
        }
        Ok(doomed.len())
    }

    fn drop_region(&mut self, region: Region) {
        for index in 0..region.pages {
            // Lazily backed pages may never have been installed
            let _ = self.page_map.unmap_page(region.page_address(index));
        }
        region.object.release_mapping();
    }

    // ========================================================================
    // Faults
    // ========================================================================

    /// Resolve a fault at `addr` for `access`.
    pub fn handle_page_fault(&mut self, addr: VirtAddr, access: Access) -> Result<(), FaultError> {
        let page_addr = addr.align_down();
        let region = self.region_at(addr).ok_or(FaultError::Unmapped(addr))?;
        if !region.prot.allows(access) {
            return Err(FaultError::ProtectionViolation(addr));
        }
        let base = region.base;
        let prot = region.prot;
        let index = region.page_index(page_addr);
        let object = region.object.clone();

        if access == Access::Write && object.is_copy_on_write() {
            return self.resolve_copy_on_write(base, index, page_addr);
        }

        let frame = object.hit(index)?;
        let writable = prot.write && !object.is_copy_on_write();
        self.install(page_addr, frame, PageFlags::user(prot, writable));
        Ok(())
    }

    fn resolve_copy_on_write(
        &mut self,
        base: VirtAddr,
        index: usize,
        page_addr: VirtAddr,
    ) -> Result<(), FaultError> {
        let Some(region) = self.regions.get_mut(&base) else {
            return Err(FaultError::Unmapped(page_addr));
        };
        let prot = region.prot;
        let object = region.object.clone();

        if object.map_count() > 1 {
            // Still mapped by another space: take a private object
            let split = object.split_for_write(index)?;
            let frame = split.hit(index)?;
            region.object = split;
            object.release_mapping();
            self.install(page_addr, frame, PageFlags::user(prot, true));
            return Ok(());
        }

        let frame = if object.frame_is_shared(index) {
            object.copy_page_private(index)?
        } else {
            object.hit(index)?
        };
        self.install(page_addr, frame, PageFlags::user(prot, true));

        if !object.has_shared_frames() {
            object.clear_copy_on_write();
            self.restore_write(base);
        }
        Ok(())
    }

    /// Make every installed page of a region writable again.
    fn restore_write(&mut self, base: VirtAddr) {
        let Some(region) = self.regions.get(&base) else {
            return;
        };
        if !region.prot.write {
            return;
        }
        let flags = PageFlags::user(region.prot, true);
        let pages: Vec<VirtAddr> = (0..region.pages).map(|i| region.page_address(i)).collect();
        for page in pages {
            let _ = self.page_map.protect(page, flags);
        }
    }

    fn install(&mut self, page: VirtAddr, frame: FrameNumber, flags: PageFlags) {
        if self.page_map.entry(page).is_some() {
            let _ = self.page_map.remap_page(page, frame, flags);
        } else {
            let _ = self.page_map.map_page(page, frame, flags);
        }
    }

    /// Frame behind `addr`, faulting it in for `access` if needed
    fn resolve(&mut self, addr: VirtAddr, access: Access) -> Result<FrameNumber, KernelError> {
        if let Some(entry) = self.page_map.entry(addr) {
            if entry.permits(access) && self.region_at(addr).is_some() {
                return Ok(entry.frame());
            }
        }
        self.handle_page_fault(addr, access)?;
        self.page_map
            .entry(addr)
            .filter(|entry| entry.permits(access))
            .map(|entry| entry.frame())
            .ok_or(KernelError::BadAddress(addr))
    }

    // ========================================================================
    // User copies
    // ========================================================================

    /// Copy `buf.len()` bytes from user address `addr`.
    pub fn copy_from_user(&mut self, addr: VirtAddr, buf: &mut [u8]) -> Result<(), KernelError> {
        user_range_end(addr, buf.len()).map_err(|_| KernelError::BadAddress(addr))?;
        let mut done = 0;
        while done < buf.len() {
            let cursor = addr.offset(done as u64);
            let offset = cursor.page_offset();
            let chunk = (PAGE_SIZE - offset).min(buf.len() - done);
            let frame = self.resolve(cursor, Access::Read)?;
            self.phys.read(frame, offset, &mut buf[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Copy `data` to user address `addr`.
    pub fn copy_to_user(&mut self, addr: VirtAddr, data: &[u8]) -> Result<(), KernelError> {
        user_range_end(addr, data.len()).map_err(|_| KernelError::BadAddress(addr))?;
        let mut done = 0;
        while done < data.len() {
            let cursor = addr.offset(done as u64);
            let offset = cursor.page_offset();
            let chunk = (PAGE_SIZE - offset).min(data.len() - done);
            let frame = self.resolve(cursor, Access::Write)?;
            self.phys.write(frame, offset, &data[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    pub fn read_u64(&mut self, addr: VirtAddr) -> Result<u64, KernelError> {
        let mut bytes = [0u8; 8];
        self.copy_from_user(addr, &mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    // ========================================================================
    // Fork / teardown
    // ========================================================================

    /// Copy-on-write duplicate for a child process.
    pub fn fork(&mut self, child_id: AddressSpaceId) -> AddressSpace {
        let bases: Vec<VirtAddr> = self.regions.keys().copied().collect();
        for base in bases {
            let Some(region) = self.regions.get(&base) else {
                continue;
            };
            region.object.acquire_mapping();
            if region.prot.write && region.object.mark_copy_on_write() {
                let flags = PageFlags::user(region.prot, false);
                let pages: Vec<VirtAddr> =
                    (0..region.pages).map(|i| region.page_address(i)).collect();
                for page in pages {
                    let _ = self.page_map.protect(page, flags);
                }
            }
        }

        AddressSpace {
            id: child_id,
            parent: Some(self.id),
            page_map: self.page_map.clone(),
            regions: self.regions.clone(),
            phys: self.phys.clone(),
        }
    }

    /// Unmap everything and release every object.
    pub fn destroy(&mut self) {
        let regions = core::mem::take(&mut self.regions);
        for region in regions.into_values() {
            self.drop_region(region);
        }
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn checked_pages(size: usize) -> Result<usize, KernelError> {
    if size == 0 || size as u64 >= USER_TOP {
        return Err(KernelError::InvalidArgument);
    }
    Ok(pages_for(size))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space(frames: usize) -> (Arc<PhysicalMemory>, AddressSpace) {
        let phys = Arc::new(PhysicalMemory::new(frames));
        let space = AddressSpace::new(AddressSpaceId(1), phys.clone());
        (phys, space)
    }

    // ========================================================================
    // Placement
    // ========================================================================

    #[test]
    fn test_first_region_skips_page_zero() {
        let (_, mut space) = space(64);
        let base = space.allocate_anonymous(100, Prot::READ_WRITE).unwrap();
        assert_eq!(base, VirtAddr(PAGE_SIZE as u64));

        let next = space.allocate_anonymous(PAGE_SIZE * 2, Prot::READ).unwrap();
        assert_eq!(next, VirtAddr(2 * PAGE_SIZE as u64));
    }

    #[test]
    fn test_fixed_allocation_overlap_rejected() {
        let (_, mut space) = space(64);
        let base = VirtAddr(0x10_0000);
        space
            .allocate_anonymous_at(base, 4 * PAGE_SIZE, Prot::READ_WRITE)
            .unwrap();

        assert_eq!(
            space.allocate_anonymous_at(VirtAddr(0x10_2000), PAGE_SIZE, Prot::READ_WRITE),
            Err(KernelError::AddressInUse(VirtAddr(0x10_2000)))
        );
        assert_eq!(
            space.allocate_anonymous_at(VirtAddr(0x10_0800), PAGE_SIZE, Prot::READ_WRITE),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            space.allocate_anonymous_at(VirtAddr(0), PAGE_SIZE, Prot::READ_WRITE),
            Err(KernelError::AddressInUse(VirtAddr(0)))
        );
    }

    #[test]
    fn test_gap_reused() {
        let (_, mut space) = space(64);
        let a = space.allocate_anonymous(PAGE_SIZE, Prot::READ_WRITE).unwrap();
        let _b = space.allocate_anonymous(PAGE_SIZE, Prot::READ_WRITE).unwrap();
        space.unmap(a, PAGE_SIZE).unwrap();

        let c = space.allocate_anonymous(PAGE_SIZE, Prot::READ_WRITE).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn test_zero_size_rejected() {
        let (_, mut space) = space(8);
        assert_eq!(
            space.allocate_anonymous(0, Prot::READ),
            Err(KernelError::InvalidArgument)
        );
    }

    // ========================================================================
    // Lazy backing
    // ========================================================================

    #[test]
    fn test_first_touch_reads_zero() {
        let (phys, mut space) = space(64);
        let base = space.allocate_anonymous(8 * PAGE_SIZE, Prot::READ_WRITE).unwrap();
        assert_eq!(phys.stats().used, 1);

        let mut buf = [0xFFu8; 16];
        space.copy_from_user(base.offset(3 * PAGE_SIZE as u64), &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);
        assert_eq!(space.used_physical_memory(), PAGE_SIZE);
    }

    #[test]
    fn test_copy_across_page_boundary() {
        let (_, mut space) = space(64);
        let base = space.allocate_anonymous(2 * PAGE_SIZE, Prot::READ_WRITE).unwrap();
        let addr = base.offset(PAGE_SIZE as u64 - 3);
        space.copy_to_user(addr, b"kestrel").unwrap();

        let mut buf = [0u8; 7];
        space.copy_from_user(addr, &mut buf).unwrap();
        assert_eq!(&buf, b"kestrel");
    }

    #[test]
    fn test_bad_user_pointers() {
        let (_, mut space) = space(64);
        let base = space.allocate_anonymous(PAGE_SIZE, Prot::READ).unwrap();

        let mut buf = [0u8; 4];
        assert!(matches!(
            space.copy_from_user(VirtAddr(0x7000_0000), &mut buf),
            Err(KernelError::BadAddress(_))
        ));
        assert!(matches!(
            space.copy_to_user(base, b"nope"),
            Err(KernelError::BadAddress(_))
        ));
        assert!(matches!(
            space.copy_from_user(base.offset(PAGE_SIZE as u64 - 2), &mut buf),
            Err(KernelError::BadAddress(_))
        ));
    }

    #[test]
    fn test_fault_outside_region() {
        let (_, mut space) = space(8);
        assert_eq!(
            space.handle_page_fault(VirtAddr(0x5000), Access::Read),
            Err(FaultError::Unmapped(VirtAddr(0x5000)))
        );
    }

    // ========================================================================
    // Unmap
    // ========================================================================

    #[test]
    fn test_unmap_removes_only_whole_regions() {
        let (phys, mut space) = space(64);
        let a = space.allocate_anonymous(2 * PAGE_SIZE, Prot::READ_WRITE).unwrap();
        let b = space.allocate_anonymous(2 * PAGE_SIZE, Prot::READ_WRITE).unwrap();
        space.copy_to_user(a, b"a").unwrap();
        space.copy_to_user(b, b"b").unwrap();
        assert_eq!(phys.stats().used, 3);

        // Covers all of `a` and half of `b`
        assert_eq!(space.unmap(a, 3 * PAGE_SIZE).unwrap(), 1);
        assert!(space.region_at(a).is_none());
        assert!(space.region_at(b).is_some());
        assert_eq!(phys.stats().used, 2);
        assert!(space.page_map().entry(a).is_none());

        // A range starting inside `b` leaves it whole
        assert_eq!(space.unmap(b.offset(PAGE_SIZE as u64), PAGE_SIZE).unwrap(), 0);
        assert_eq!(space.region_at(b).unwrap().pages, 2);
        let mut byte = [0u8; 1];
        space.copy_from_user(b, &mut byte).unwrap();
        assert_eq!(&byte, b"b");
    }

    #[test]
    fn test_object_lookup_and_range_checks() {
        let (_, mut space) = space(16);
        let base = space.allocate_anonymous(2 * PAGE_SIZE, Prot::READ_WRITE).unwrap();
        let object = space.address_to_vm_object(base.offset(10)).unwrap();
        assert_eq!(object.pages(), 2);
        assert!(space.range_in_region(base, 2 * PAGE_SIZE));
        assert!(!space.range_in_region(base, 2 * PAGE_SIZE + 1));
        assert!(space.address_to_vm_object(VirtAddr(0x10)).is_none());
    }

    #[test]
    fn test_dump_describes_regions() {
        let (_, mut space) = space(16);
        space.allocate_anonymous(PAGE_SIZE, Prot::READ_WRITE).unwrap();
        let dump = space.dump();
        assert_eq!(dump.len(), 1);
        assert_eq!(dump[0].kind, VmObjectKind::Anonymous);
        assert_eq!(dump[0].map_count, 1);
    }

    // ========================================================================
    // Fork / copy-on-write
    // ========================================================================

    #[test]
    fn test_fork_shares_and_counts_mappings() {
        let (_, mut parent) = space(64);
        let base = parent.allocate_anonymous(PAGE_SIZE, Prot::READ_WRITE).unwrap();
        parent.copy_to_user(base, b"p").unwrap();

        let child = parent.fork(AddressSpaceId(2));
        let object = parent.address_to_vm_object(base).unwrap();
        assert_eq!(object.map_count(), 2);
        assert!(object.is_copy_on_write());
        assert_eq!(child.parent(), Some(AddressSpaceId(1)));

        // Both sides write-protected
        assert!(!parent.page_map().entry(base).unwrap().is_writable());
        assert!(!child.page_map().entry(base).unwrap().is_writable());

        drop(child);
        assert_eq!(object.map_count(), 1);
    }

    #[test]
    fn test_copy_on_write_isolation_both_directions() {
        let (_, mut parent) = space(64);
        let base = parent.allocate_anonymous(PAGE_SIZE, Prot::READ_WRITE).unwrap();
        parent.copy_to_user(base, b"orig").unwrap();

        let mut child = parent.fork(AddressSpaceId(2));
        child.copy_to_user(base, b"kid!").unwrap();
        parent.copy_to_user(base.offset(4), b"dad").unwrap();

        let mut buf = [0u8; 7];
        parent.copy_from_user(base, &mut buf).unwrap();
        assert_eq!(&buf, b"origdad");
        child.copy_from_user(base, &mut buf).unwrap();
        assert_eq!(&buf, b"kid!\0\0\0");
    }

    #[test]
    fn test_split_drops_original_count_by_one() {
        let (phys, mut parent) = space(64);
        let base = parent.allocate_anonymous(3 * PAGE_SIZE, Prot::READ_WRITE).unwrap();
        for page in 0..3u64 {
            parent
                .copy_to_user(base.offset(page * PAGE_SIZE as u64), &[page as u8])
                .unwrap();
        }
        let original = parent.address_to_vm_object(base).unwrap();

        let mut child = parent.fork(AddressSpaceId(2));
        assert_eq!(original.map_count(), 2);

        child
            .copy_to_user(base.offset(PAGE_SIZE as u64), &[0xAA])
            .unwrap();

        assert_eq!(original.map_count(), 1);
        let split = child.address_to_vm_object(base).unwrap();
        assert!(!Arc::ptr_eq(&split, &original));
        assert_eq!(split.frame(0), original.frame(0));
        assert_eq!(split.frame(2), original.frame(2));
        assert_ne!(split.frame(1), original.frame(1));
        // Only one new frame allocated
        assert_eq!(phys.stats().used, 1 + 3 + 1);

        let mut byte = [0u8; 1];
        parent
            .copy_from_user(base.offset(PAGE_SIZE as u64), &mut byte)
            .unwrap();
        assert_eq!(byte, [1]);
    }

    #[test]
    fn test_last_sharer_restores_write_in_place() {
        let (phys, mut parent) = space(64);
        let base = parent.allocate_anonymous(PAGE_SIZE, Prot::READ_WRITE).unwrap();
        parent.copy_to_user(base, b"x").unwrap();

        let child = parent.fork(AddressSpaceId(2));
        drop(child);

        let used = phys.stats().used;
        parent.copy_to_user(base, b"y").unwrap();
        assert_eq!(phys.stats().used, used);
        let object = parent.address_to_vm_object(base).unwrap();
        assert!(!object.is_copy_on_write());
        assert!(parent.page_map().entry(base).unwrap().is_writable());
    }

    #[test]
    fn test_shared_objects_stay_writable_across_fork() {
        let (_, mut parent) = space(64);
        let (base, object) = parent.allocate_shared(PAGE_SIZE, Prot::READ_WRITE).unwrap();
        parent.copy_to_user(base, b"s").unwrap();

        let mut child = parent.fork(AddressSpaceId(2));
        assert!(!object.is_copy_on_write());
        child.copy_to_user(base, b"t").unwrap();

        let mut buf = [0u8; 1];
        parent.copy_from_user(base, &mut buf).unwrap();
        assert_eq!(&buf, b"t");
    }

    #[test]
    fn test_map_object_into_second_space() {
        let (phys, mut first) = space(64);
        let (_, object) = first.allocate_shared(PAGE_SIZE, Prot::READ_WRITE).unwrap();
        let mut second = AddressSpace::new(AddressSpaceId(9), phys.clone());
        second
            .map_object(object.clone(), None, Prot::READ_WRITE)
            .unwrap();
        assert_eq!(object.map_count(), 2);

        second.destroy();
        assert_eq!(object.map_count(), 1);
        drop(first);
        assert_eq!(phys.stats().used, 1);
    }

    #[test]
    fn test_destroy_releases_every_frame() {
        let (phys, mut space) = space(64);
        let base = space.allocate_anonymous(4 * PAGE_SIZE, Prot::READ_WRITE).unwrap();
        space.copy_to_user(base, &[1u8; 4 * PAGE_SIZE]).unwrap();
        assert_eq!(phys.stats().used, 5);

        let object = space.address_to_vm_object(base).unwrap();
        space.destroy();
        assert_eq!(phys.stats().used, 1);
        assert_eq!(object.map_count(), 0);
    }

    #[test]
    fn test_out_of_frames_on_fault() {
        let (_, mut space) = space(2);
        let base = space.allocate_anonymous(2 * PAGE_SIZE, Prot::READ_WRITE).unwrap();
        space.copy_to_user(base, b"ok").unwrap();
        assert_eq!(
            space.copy_to_user(base.offset(PAGE_SIZE as u64), b"no"),
            Err(KernelError::OutOfMemory)
        );
    }
}
