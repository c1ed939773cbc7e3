//! Process images and the initial user stack
//!
//! The loader outside the core parses the executable and hands over an
//! [`ExecutableImage`]: loadable segments plus where the program headers
//! live. This module maps the segments and lays out the stack the new
//! program starts with.
//!
//! # Initial stack (low address at the top)
//!
//! ```text
//! sp ──► argc
//!        argv[0] .. argv[argc-1], 0
//!        envp[0] .. envp[n-1], 0
//!        auxv pairs .. AT_NULL, 0
//!        (padding)
//!        16-byte random seed        ◄── AT_RANDOM
//!        argument and environment strings
//! stack top
//! ```

use alloc::vec::Vec;

use crate::address_space::AddressSpace;
use crate::error::KernelError;
use crate::types::{pages_for, Prot, VirtAddr};
use crate::vm::VmObject;

pub const AT_NULL: u64 = 0;
pub const AT_PHDR: u64 = 3;
pub const AT_PHENT: u64 = 4;
pub const AT_PHNUM: u64 = 5;
pub const AT_ENTRY: u64 = 9;
pub const AT_RANDOM: u64 = 25;
pub const AT_EXECFN: u64 = 31;

/// One loadable segment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub vaddr: VirtAddr,
    /// Bytes of memory the segment occupies; the tail past `data` is zero
    pub mem_size: usize,
    pub data: Vec<u8>,
    pub prot: Prot,
}

/// Location of the program header table in the loaded image
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProgramHeaders {
    pub address: VirtAddr,
    pub count: u64,
    pub entry_size: u64,
}

/// A parsed executable ready to map
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutableImage {
    pub entry: VirtAddr,
    pub segments: Vec<Segment>,
    pub program_headers: ProgramHeaders,
}

/// Map every segment of `image` into `space`, each as its own process-image
/// object with the segment's protection.
pub fn load_image(space: &mut AddressSpace, image: &ExecutableImage) -> Result<(), KernelError> {
    for segment in &image.segments {
        if segment.mem_size == 0 {
            continue;
        }
        if segment.data.len() > segment.mem_size || !segment.vaddr.is_user() {
            return Err(KernelError::InvalidArgument);
        }
        let base = segment.vaddr.align_down();
        let offset = segment.vaddr.page_offset();
        let pages = pages_for(offset + segment.mem_size);
        let object = VmObject::image(
            space.physical_memory().clone(),
            pages,
            &segment.data,
            offset,
        )?;
        space.map_new(object, Some(base), segment.prot)?;
    }
    Ok(())
}

/// Arguments for [`build_initial_stack`]
pub struct StackArgs<'a> {
    pub argv: &'a [&'a str],
    pub envp: &'a [&'a str],
    pub exec_path: Option<&'a str>,
    pub seed: [u8; 16],
}

/// Lay out argc, argv, envp, the auxiliary vector and the random seed below
/// `top`, never writing below `floor`. Returns the initial stack pointer,
/// which points at argc and is 16-byte aligned.
pub fn build_initial_stack(
    space: &mut AddressSpace,
    top: VirtAddr,
    floor: VirtAddr,
    image: &ExecutableImage,
    args: &StackArgs<'_>,
) -> Result<VirtAddr, KernelError> {
    let mut writer = StackWriter {
        space,
        sp: top.0,
        floor: floor.0,
    };

    let exec_path = args
        .exec_path
        .map(|path| writer.push_str(path))
        .transpose()?;
    let argv = args
        .argv
        .iter()
        .map(|arg| writer.push_str(arg))
        .collect::<Result<Vec<_>, _>>()?;
    let envp = args
        .envp
        .iter()
        .map(|var| writer.push_str(var))
        .collect::<Result<Vec<_>, _>>()?;

    writer.sp &= !0xF;
    let random = writer.push(&args.seed)?;

    let mut words = Vec::with_capacity(argv.len() + envp.len() + 16);
    words.push(argv.len() as u64);
    words.extend(argv);
    words.push(0);
    words.extend(envp);
    words.push(0);
    words.extend([
        AT_PHDR,
        image.program_headers.address.0,
        AT_PHENT,
        image.program_headers.entry_size,
        AT_PHNUM,
        image.program_headers.count,
        AT_ENTRY,
        image.entry.0,
        AT_RANDOM,
        random,
    ]);
    if let Some(path) = exec_path {
        words.extend([AT_EXECFN, path]);
    }
    words.extend([AT_NULL, 0]);

    // Keep the final sp 16-byte aligned
    if words.len() % 2 == 1 {
        writer.push(&[0u8; 8])?;
    }
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    let sp = writer.push(&bytes)?;
    Ok(VirtAddr(sp))
}

struct StackWriter<'s> {
    space: &'s mut AddressSpace,
    sp: u64,
    floor: u64,
}

impl StackWriter<'_> {
    fn push(&mut self, bytes: &[u8]) -> Result<u64, KernelError> {
        let sp = self
            .sp
            .checked_sub(bytes.len() as u64)
            .filter(|sp| *sp >= self.floor)
            .ok_or(KernelError::InvalidArgument)?;
        self.space.copy_to_user(VirtAddr(sp), bytes)?;
        self.sp = sp;
        Ok(sp)
    }

    /// Push a NUL-terminated copy of `s`.
    fn push_str(&mut self, s: &str) -> Result<u64, KernelError> {
        let mut bytes = Vec::with_capacity(s.len() + 1);
        bytes.extend_from_slice(s.as_bytes());
        bytes.push(0);
        self.push(&bytes)
    }
}
