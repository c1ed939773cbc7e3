//! VM objects
//!
//! A VM object is a page-granular run of memory whose frames are assigned
//! lazily. Address-space regions map objects; the object's map count is the
//! number of regions (across every address space) that currently map it.
//!
//! # Counted ownership
//!
//! The `Arc` only keeps the struct alive. Frames are owned through the map
//! count: they are returned to the allocator exactly once, when the last
//! mapping is released. A new object is born holding one mapping for the
//! region its creator is about to install.
//!
//! # Copy-on-write
//!
//! Fork marks writable objects copy-on-write and maps them into the child.
//! The first write in an address space that still shares the object splits
//! it (`split_for_write`): the new object shares every other populated frame
//! and owns a private copy of the faulting page.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use kestrel_sync::{RefCount, Release, SpinLock};
use serde::{Deserialize, Serialize};

use crate::phys::{PhysError, PhysicalMemory};
use crate::types::{FrameNumber, VmObjectId, PAGE_SIZE};

static NEXT_VM_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// What an object backs
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmObjectKind {
    /// Zero-filled private memory (heap, stacks)
    Anonymous,
    /// Executable segment, populated eagerly at load
    ProcessImage,
    /// Memory shared between address spaces; never copy-on-write
    Shared,
}

/// A lazily backed run of pages
pub struct VmObject {
    id: VmObjectId,
    kind: VmObjectKind,
    pages: usize,
    frames: SpinLock<Vec<Option<FrameNumber>>>,
    map_count: RefCount,
    copy_on_write: AtomicBool,
    released: AtomicBool,
    phys: Arc<PhysicalMemory>,
}

impl VmObject {
    fn with_frames(
        phys: Arc<PhysicalMemory>,
        kind: VmObjectKind,
        frames: Vec<Option<FrameNumber>>,
        copy_on_write: bool,
    ) -> Self {
        Self {
            id: VmObjectId(NEXT_VM_OBJECT_ID.fetch_add(1, Ordering::Relaxed)),
            kind,
            pages: frames.len(),
            frames: SpinLock::with_spin_limit("vm-object", phys.spin_limit(), frames),
            map_count: RefCount::new(1),
            copy_on_write: AtomicBool::new(copy_on_write),
            released: AtomicBool::new(false),
            phys,
        }
    }

    /// Zero-filled private memory, backed on first touch.
    pub fn anonymous(phys: Arc<PhysicalMemory>, pages: usize) -> Arc<Self> {
        Arc::new(Self::with_frames(
            phys,
            VmObjectKind::Anonymous,
            alloc::vec![None; pages],
            false,
        ))
    }

    /// Memory meant to stay shared across fork.
    pub fn shared(phys: Arc<PhysicalMemory>, pages: usize) -> Arc<Self> {
        Arc::new(Self::with_frames(
            phys,
            VmObjectKind::Shared,
            alloc::vec![None; pages],
            false,
        ))
    }

    /// An executable segment: every page backed now, `data` copied in at
    /// byte `offset`, the rest zero.
    pub fn image(
        phys: Arc<PhysicalMemory>,
        pages: usize,
        data: &[u8],
        offset: usize,
    ) -> Result<Arc<Self>, PhysError> {
        debug_assert!(offset + data.len() <= pages * PAGE_SIZE);

        let mut frames = Vec::with_capacity(pages);
        for _ in 0..pages {
            match phys.allocate_frame() {
                Ok(frame) => frames.push(Some(frame)),
                Err(e) => {
                    for frame in frames.into_iter().flatten() {
                        phys.release_frame(frame);
                    }
                    return Err(e);
                }
            }
        }

        let mut cursor = offset;
        let mut written = 0;
        while written < data.len() {
            let page = cursor / PAGE_SIZE;
            let in_page = cursor % PAGE_SIZE;
            let chunk = (PAGE_SIZE - in_page).min(data.len() - written);
            if let Some(frame) = frames[page] {
                phys.write(frame, in_page, &data[written..written + chunk]);
            }
            cursor += chunk;
            written += chunk;
        }

        Ok(Arc::new(Self::with_frames(
            phys,
            VmObjectKind::ProcessImage,
            frames,
            false,
        )))
    }

    pub fn id(&self) -> VmObjectId {
        self.id
    }

    pub fn kind(&self) -> VmObjectKind {
        self.kind
    }

    /// Size in pages
    pub fn pages(&self) -> usize {
        self.pages
    }

    pub fn size(&self) -> usize {
        self.pages * PAGE_SIZE
    }

    /// Frame backing `page`, allocating a zero frame on first touch.
    pub fn hit(&self, page: usize) -> Result<FrameNumber, PhysError> {
        let mut frames = self.frames.lock();
        if let Some(frame) = frames[page] {
            return Ok(frame);
        }
        let frame = self.phys.allocate_frame()?;
        frames[page] = Some(frame);
        Ok(frame)
    }

    /// Frame backing `page`, if it has been touched
    pub fn frame(&self, page: usize) -> Option<FrameNumber> {
        self.frames.lock().get(page).copied().flatten()
    }

    pub fn frames(&self) -> Vec<Option<FrameNumber>> {
        self.frames.lock().clone()
    }

    pub fn populated_pages(&self) -> usize {
        self.frames.lock().iter().filter(|f| f.is_some()).count()
    }

    /// Bytes of physical memory currently backing this object
    pub fn used_memory(&self) -> usize {
        self.populated_pages() * PAGE_SIZE
    }

    // ========================================================================
    // Mapping count
    // ========================================================================

    /// Regions currently mapping this object
    pub fn map_count(&self) -> usize {
        self.map_count.get()
    }

    pub fn acquire_mapping(&self) -> usize {
        self.map_count.acquire()
    }

    /// Drop one mapping. The last one returns the frames.
    pub fn release_mapping(&self) -> Release {
        let release = self.map_count.release();
        if release == Release::Last {
            self.release_frames();
        }
        release
    }

    fn release_frames(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let frames = core::mem::take(&mut *self.frames.lock());
        for frame in frames.into_iter().flatten() {
            self.phys.release_frame(frame);
        }
    }

    // ========================================================================
    // Copy-on-write
    // ========================================================================

    pub fn is_copy_on_write(&self) -> bool {
        self.copy_on_write.load(Ordering::Acquire)
    }

    /// Mark for copy-on-write. Shared objects refuse.
    pub fn mark_copy_on_write(&self) -> bool {
        if self.kind == VmObjectKind::Shared {
            return false;
        }
        self.copy_on_write.store(true, Ordering::Release);
        true
    }

    pub fn clear_copy_on_write(&self) {
        self.copy_on_write.store(false, Ordering::Release);
    }

    /// Whether the frame behind `page` has another owner
    pub fn frame_is_shared(&self, page: usize) -> bool {
        self.frame(page)
            .map(|frame| self.phys.owners(frame) > 1)
            .unwrap_or(false)
    }

    pub fn has_shared_frames(&self) -> bool {
        self.frames
            .lock()
            .iter()
            .flatten()
            .any(|frame| self.phys.owners(*frame) > 1)
    }

    /// Private copy of this object for the address space writing `page`.
    ///
    /// The copy of the faulting page is made first and every other populated
    /// frame gains an owner before the caller releases its mapping of `self`,
    /// so no frame can be freed while still referenced.
    pub fn split_for_write(&self, page: usize) -> Result<Arc<VmObject>, PhysError> {
        let fresh = self.phys.allocate_frame()?;

        let mut copied = self.frames.lock().clone();
        if let Some(source) = copied[page] {
            self.phys.copy_frame(source, fresh);
        }
        for (index, slot) in copied.iter().enumerate() {
            if let (true, Some(frame)) = (index != page, slot) {
                self.phys.share(*frame);
            }
        }
        copied[page] = Some(fresh);

        Ok(Arc::new(Self::with_frames(
            self.phys.clone(),
            self.kind,
            copied,
            true,
        )))
    }

    /// Replace a shared frame with a private copy, dropping this object's
    /// share of the original.
    pub fn copy_page_private(&self, page: usize) -> Result<FrameNumber, PhysError> {
        let fresh = self.phys.allocate_frame()?;
        let previous = {
            let mut frames = self.frames.lock();
            let previous = frames[page];
            if let Some(source) = previous {
                self.phys.copy_frame(source, fresh);
            }
            frames[page] = Some(fresh);
            previous
        };
        if let Some(frame) = previous {
            self.phys.release_frame(frame);
        }
        Ok(fresh)
    }
}

impl Drop for VmObject {
    fn drop(&mut self) {
        // Objects dropped before their creator installed them still own frames
        self.release_frames();
    }
}

impl core::fmt::Debug for VmObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmObject")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("pages", &self.pages)
            .field("map_count", &self.map_count())
            .field("copy_on_write", &self.is_copy_on_write())
            .finish()
    }
}
