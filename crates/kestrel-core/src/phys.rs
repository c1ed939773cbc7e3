//! Physical frame allocator
//!
//! The only source of physical memory for every layer above it.
//!
//! # Design
//!
//! - A bitmap is the single source of truth for free/used.
//! - Single-frame requests pop a free stack, O(1) amortized. Stack entries
//!   can go stale (a frame taken by a contiguous request or a reservation);
//!   stale entries are skipped on pop.
//! - Contiguous requests scan the bitmap from a next-fit hint. A request that
//!   fails with enough total free frames reports `Fragmented`; nothing is
//!   retried or compacted on the caller's behalf.
//! - Frames shared copy-on-write carry a share count. A shared frame returns
//!   to the free pool only when its last owner releases it.
//!
//! Frame 0 is permanently reserved so a zero frame number never escapes.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use kestrel_sync::{SpinLock, DEFAULT_SPIN_LIMIT};
use serde::{Deserialize, Serialize};

use crate::types::{FrameNumber, PAGE_SIZE};

/// Allocation failures
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhysError {
    /// Fewer free frames than requested
    OutOfMemory { requested: usize, free: usize },
    /// Enough free frames in total, but not contiguous
    Fragmented { requested: usize, free: usize },
    /// Zero-length request
    EmptyRequest,
}

/// A run of contiguous frames
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRange {
    pub start: FrameNumber,
    pub count: usize,
}

impl FrameRange {
    pub fn single(frame: FrameNumber) -> Self {
        Self {
            start: frame,
            count: 1,
        }
    }

    pub fn frames(&self) -> impl Iterator<Item = FrameNumber> {
        let start = self.start.0;
        (start..start + self.count as u64).map(FrameNumber)
    }

    pub fn contains(&self, frame: FrameNumber) -> bool {
        frame.0 >= self.start.0 && frame.0 < self.start.0 + self.count as u64
    }
}

/// Snapshot of allocator accounting
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysStats {
    /// Frames managed
    pub total: usize,
    /// Frames allocated or reserved
    pub used: usize,
    /// Frames available
    pub free: usize,
    /// Frames with more than one owner
    pub shared: usize,
}

// ============================================================================
// Frame allocator (metadata only)
// ============================================================================

/// Bitmap + free-stack allocator
pub struct FrameAllocator {
    bitmap: Vec<u64>,
    total: usize,
    used: usize,
    free_stack: Vec<FrameNumber>,
    next_hint: usize,
    /// Extra owners beyond the first, for copy-on-write shared frames
    shares: BTreeMap<FrameNumber, u32>,
}

impl FrameAllocator {
    /// Manage frames `0..total_frames`. Frame 0 starts reserved.
    pub fn new(total_frames: usize) -> Self {
        let total = total_frames.max(1);
        let mut allocator = Self {
            bitmap: alloc::vec![0u64; total.div_ceil(64)],
            total,
            used: 0,
            // Reversed so pops hand out low frames first
            free_stack: (1..total as u64).rev().map(FrameNumber).collect(),
            next_hint: 1,
            shares: BTreeMap::new(),
        };
        allocator.set(0);
        allocator.used = 1;
        allocator
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn free_frames(&self) -> usize {
        self.total - self.used
    }

    pub fn is_allocated(&self, frame: FrameNumber) -> bool {
        let idx = frame.0 as usize;
        idx < self.total && self.test(idx)
    }

    /// Number of owners of an allocated frame (0 when free)
    pub fn owners(&self, frame: FrameNumber) -> u32 {
        if !self.is_allocated(frame) {
            return 0;
        }
        1 + self.shares.get(&frame).copied().unwrap_or(0)
    }

    pub fn stats(&self) -> PhysStats {
        PhysStats {
            total: self.total,
            used: self.used,
            free: self.free_frames(),
            shared: self.shares.len(),
        }
    }

    /// Allocate `count` contiguous frames.
    pub fn allocate(&mut self, count: usize) -> Result<FrameRange, PhysError> {
        if count == 0 {
            return Err(PhysError::EmptyRequest);
        }
        let free = self.free_frames();
        if count > free {
            return Err(PhysError::OutOfMemory {
                requested: count,
                free,
            });
        }

        if count == 1 {
            return self
                .pop_free()
                .map(FrameRange::single)
                .ok_or(PhysError::OutOfMemory {
                    requested: 1,
                    free,
                });
        }

        let start = self.find_run(count).ok_or(PhysError::Fragmented {
            requested: count,
            free,
        })?;
        for idx in start..start + count {
            self.set(idx);
        }
        self.used += count;
        self.next_hint = start + count;
        Ok(FrameRange {
            start: FrameNumber(start as u64),
            count,
        })
    }

    /// Return frames to the pool.
    ///
    /// # Panics
    ///
    /// Freeing a frame that is not allocated, or one that is still shared,
    /// means the allocator metadata no longer matches reality. That is fatal.
    pub fn free(&mut self, range: FrameRange) {
        for frame in range.frames() {
            let idx = frame.0 as usize;
            if idx == 0 || idx >= self.total || !self.test(idx) {
                panic!("phys: free of unallocated frame {:#x}", frame.0);
            }
            if self.shares.contains_key(&frame) {
                panic!("phys: free of shared frame {:#x}", frame.0);
            }
            self.clear(idx);
            self.used -= 1;
            self.free_stack.push(frame);
        }
        self.maybe_compact();
    }

    /// Add an owner to an allocated frame.
    pub fn share(&mut self, frame: FrameNumber) {
        if !self.is_allocated(frame) {
            panic!("phys: share of unallocated frame {:#x}", frame.0);
        }
        *self.shares.entry(frame).or_insert(0) += 1;
    }

    /// Drop one owner. Returns `true` when the frame went back to the pool.
    pub fn release_frame(&mut self, frame: FrameNumber) -> bool {
        if let Some(extra) = self.shares.get_mut(&frame) {
            *extra -= 1;
            if *extra == 0 {
                self.shares.remove(&frame);
            }
            return false;
        }
        self.free(FrameRange::single(frame));
        true
    }

    /// Mark a region used (firmware tables, kernel image, boot modules).
    ///
    /// Returns how many frames changed state.
    pub fn reserve(&mut self, range: FrameRange) -> usize {
        let mut marked = 0;
        for frame in range.frames() {
            let idx = frame.0 as usize;
            if idx < self.total && !self.test(idx) {
                self.set(idx);
                self.used += 1;
                marked += 1;
            }
        }
        marked
    }

    /// Hand a reserved region back. Frame 0 and shared frames are kept.
    pub fn release(&mut self, range: FrameRange) -> usize {
        let mut released = 0;
        for frame in range.frames() {
            let idx = frame.0 as usize;
            if idx == 0 || idx >= self.total || !self.test(idx) || self.shares.contains_key(&frame)
            {
                continue;
            }
            self.clear(idx);
            self.used -= 1;
            self.free_stack.push(frame);
            released += 1;
        }
        released
    }

    /// Cross-check the counters against the bitmap.
    pub fn verify(&self) -> Result<(), &'static str> {
        let counted = (0..self.total).filter(|&idx| self.test(idx)).count();
        if counted != self.used {
            return Err("used counter disagrees with bitmap");
        }
        if !self.test(0) {
            return Err("frame 0 not reserved");
        }
        if self.shares.keys().any(|frame| !self.is_allocated(*frame)) {
            return Err("share count on a free frame");
        }
        Ok(())
    }

    fn pop_free(&mut self) -> Option<FrameNumber> {
        while let Some(frame) = self.free_stack.pop() {
            let idx = frame.0 as usize;
            if !self.test(idx) {
                self.set(idx);
                self.used += 1;
                return Some(frame);
            }
        }
        // Every entry was stale; fall back to the bitmap
        let idx = self.find_run(1)?;
        self.set(idx);
        self.used += 1;
        Some(FrameNumber(idx as u64))
    }

    fn find_run(&self, count: usize) -> Option<usize> {
        let search = |from: usize, to: usize| -> Option<usize> {
            let mut run_start = from;
            let mut run_len = 0;
            for idx in from..to {
                if self.test(idx) {
                    run_len = 0;
                    run_start = idx + 1;
                } else {
                    run_len += 1;
                    if run_len == count {
                        return Some(run_start);
                    }
                }
            }
            None
        };

        let hint = self.next_hint.clamp(1, self.total);
        search(hint, self.total).or_else(|| search(1, (hint + count - 1).min(self.total)))
    }

    fn maybe_compact(&mut self) {
        if self.free_stack.len() > 2 * self.total {
            let rebuilt: Vec<FrameNumber> = (1..self.total)
                .rev()
                .filter(|&idx| !self.test(idx))
                .map(|idx| FrameNumber(idx as u64))
                .collect();
            self.free_stack = rebuilt;
        }
    }

    fn test(&self, idx: usize) -> bool {
        self.bitmap[idx / 64] & (1 << (idx % 64)) != 0
    }

    fn set(&mut self, idx: usize) {
        self.bitmap[idx / 64] |= 1 << (idx % 64);
    }

    fn clear(&mut self, idx: usize) {
        self.bitmap[idx / 64] &= !(1 << (idx % 64));
    }
}

// ============================================================================
// Physical memory (allocator + frame contents)
// ============================================================================

/// Backing bytes for frames that have been written.
///
/// Frames with no entry read as zero. Content is discarded before a frame
/// returns to the pool, so every freshly allocated frame is zero-filled.
#[derive(Default)]
struct FrameStore {
    pages: BTreeMap<FrameNumber, Box<[u8; PAGE_SIZE]>>,
}

/// Physical memory shared by every address space.
///
/// Lock order: `frames` before `store`.
pub struct PhysicalMemory {
    frames: SpinLock<FrameAllocator>,
    store: SpinLock<FrameStore>,
    spin_limit: u32,
}

impl PhysicalMemory {
    pub fn new(total_frames: usize) -> Self {
        Self::with_spin_limit(total_frames, DEFAULT_SPIN_LIMIT)
    }

    /// Memory whose locks, and those of VM objects built on it, give up
    /// after `spin_limit` spins.
    pub fn with_spin_limit(total_frames: usize, spin_limit: u32) -> Self {
        Self {
            frames: SpinLock::with_spin_limit(
                "phys-frames",
                spin_limit,
                FrameAllocator::new(total_frames),
            ),
            store: SpinLock::with_spin_limit("phys-store", spin_limit, FrameStore::default()),
            spin_limit,
        }
    }

    pub fn spin_limit(&self) -> u32 {
        self.spin_limit
    }

    pub fn allocate(&self, count: usize) -> Result<FrameRange, PhysError> {
        self.frames.lock().allocate(count)
    }

    /// One zero-filled frame
    pub fn allocate_frame(&self) -> Result<FrameNumber, PhysError> {
        self.allocate(1).map(|range| range.start)
    }

    pub fn free(&self, range: FrameRange) {
        let mut frames = self.frames.lock();
        let mut store = self.store.lock();
        for frame in range.frames() {
            store.pages.remove(&frame);
        }
        drop(store);
        frames.free(range);
    }

    pub fn share(&self, frame: FrameNumber) {
        self.frames.lock().share(frame);
    }

    /// Drop one owner; the frame is freed with its last owner.
    pub fn release_frame(&self, frame: FrameNumber) -> bool {
        let mut frames = self.frames.lock();
        if frames.owners(frame) == 1 {
            self.store.lock().pages.remove(&frame);
        }
        frames.release_frame(frame)
    }

    pub fn owners(&self, frame: FrameNumber) -> u32 {
        self.frames.lock().owners(frame)
    }

    pub fn reserve(&self, range: FrameRange) -> usize {
        self.frames.lock().reserve(range)
    }

    pub fn release(&self, range: FrameRange) -> usize {
        self.frames.lock().release(range)
    }

    pub fn stats(&self) -> PhysStats {
        self.frames.lock().stats()
    }

    pub fn verify(&self) -> Result<(), &'static str> {
        self.frames.lock().verify()
    }

    /// Run `f` against the allocator metadata (invariant checks, tests).
    pub fn with_allocator<R>(&self, f: impl FnOnce(&FrameAllocator) -> R) -> R {
        f(&self.frames.lock())
    }

    // ========================================================================
    // Frame contents
    // ========================================================================

    pub fn read(&self, frame: FrameNumber, offset: usize, buf: &mut [u8]) {
        debug_assert!(offset + buf.len() <= PAGE_SIZE);
        match self.store.lock().pages.get(&frame) {
            Some(page) => buf.copy_from_slice(&page[offset..offset + buf.len()]),
            None => buf.fill(0),
        }
    }

    pub fn write(&self, frame: FrameNumber, offset: usize, data: &[u8]) {
        debug_assert!(offset + data.len() <= PAGE_SIZE);
        let mut store = self.store.lock();
        let page = store
            .pages
            .entry(frame)
            .or_insert_with(|| Box::new([0u8; PAGE_SIZE]));
        page[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Clear a frame to zero.
    pub fn zero(&self, frame: FrameNumber) {
        self.store.lock().pages.remove(&frame);
    }

    /// Copy one whole frame into another.
    pub fn copy_frame(&self, src: FrameNumber, dst: FrameNumber) {
        let mut store = self.store.lock();
        match store.pages.get(&src).cloned() {
            Some(page) => {
                store.pages.insert(dst, page);
            }
            None => {
                store.pages.remove(&dst);
            }
        }
    }
}

// ============================================================================
// Kani Proofs
// ============================================================================

#[cfg(kani)]
mod proofs {
    use super::*;

    #[kani::proof]
    #[kani::unwind(10)]
    fn allocate_then_free_conserves_frames() {
        let mut allocator = FrameAllocator::new(8);
        let count: usize = kani::any();
        kani::assume(count > 0 && count <= 3);
        if let Ok(range) = allocator.allocate(count) {
            assert!(allocator.used() == 1 + count);
            allocator.free(range);
        }
        assert!(allocator.used() + allocator.free_frames() == allocator.total());
    }
}

// ============================================================================
// Tests
// ============================================================================
