//! Core kernel types
//!
//! Identifiers, addresses and permission sets shared by every subsystem.
//! All types here are pure data.

use core::fmt;
use serde::{Deserialize, Serialize};

/// Bytes per page / physical frame
pub const PAGE_SIZE: usize = 4096;

/// log2(PAGE_SIZE)
pub const PAGE_SHIFT: u32 = 12;

/// First non-canonical address above the user half
pub const USER_TOP: u64 = 0x0000_8000_0000_0000;

/// Start of the kernel half
pub const KERNEL_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Number of pages needed to hold `bytes`
pub fn pages_for(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE)
}

// ============================================================================
// Identifiers
// ============================================================================

/// Process identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcessId(pub u64);

/// Thread identifier (global, never reused)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ThreadId(pub u64);

/// Logical core index
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CoreId(pub u32);

/// Kernel object identifier (monotonic, for logging only)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

/// Per-process handle identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HandleId(pub u32);

/// VM object identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VmObjectId(pub u64);

/// Address space identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AddressSpaceId(pub u64);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Addresses
// ============================================================================

/// Physical frame number (physical address >> PAGE_SHIFT)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FrameNumber(pub u64);

impl FrameNumber {
    pub fn address(self) -> PhysAddr {
        PhysAddr(self.0 << PAGE_SHIFT)
    }

    pub fn containing(addr: PhysAddr) -> Self {
        FrameNumber(addr.0 >> PAGE_SHIFT)
    }
}

/// Physical address
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PhysAddr(pub u64);

/// Virtual address
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VirtAddr(pub u64);

impl VirtAddr {
    pub fn align_down(self) -> Self {
        VirtAddr(self.0 & !(PAGE_SIZE as u64 - 1))
    }

    pub fn align_up(self) -> Self {
        VirtAddr((self.0 + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1))
    }

    pub fn is_page_aligned(self) -> bool {
        self.0 & (PAGE_SIZE as u64 - 1) == 0
    }

    pub fn page_offset(self) -> usize {
        (self.0 & (PAGE_SIZE as u64 - 1)) as usize
    }

    pub fn offset(self, bytes: u64) -> Self {
        VirtAddr(self.0.wrapping_add(bytes))
    }

    pub fn is_user(self) -> bool {
        self.0 < USER_TOP
    }

    pub fn is_kernel(self) -> bool {
        self.0 >= KERNEL_BASE
    }

    pub fn is_canonical(self) -> bool {
        self.is_user() || self.is_kernel()
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

// ============================================================================
// Permissions
// ============================================================================

/// Kind of memory access being attempted or validated
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Access {
    Read,
    Write,
    Execute,
}

/// Region protection (what user code may do with a mapping)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prot {
    /// Can read
    pub read: bool,
    /// Can write
    pub write: bool,
    /// Can execute
    pub execute: bool,
}

impl Prot {
    pub const READ: Prot = Prot {
        read: true,
        write: false,
        execute: false,
    };
    pub const READ_WRITE: Prot = Prot {
        read: true,
        write: true,
        execute: false,
    };
    pub const READ_EXECUTE: Prot = Prot {
        read: true,
        write: false,
        execute: true,
    };

    /// Syscall encoding: bit 0 read, bit 1 write, bit 2 execute
    pub fn from_bits(bits: u64) -> Self {
        Self {
            read: bits & 0x1 != 0,
            write: bits & 0x2 != 0,
            execute: bits & 0x4 != 0,
        }
    }

    pub fn bits(&self) -> u64 {
        (self.read as u64) | (self.write as u64) << 1 | (self.execute as u64) << 2
    }

    pub fn allows(&self, access: Access) -> bool {
        match access {
            Access::Read => self.read,
            Access::Write => self.write,
            Access::Execute => self.execute,
        }
    }
}
