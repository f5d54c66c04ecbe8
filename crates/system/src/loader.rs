//! Turns a program into a process: segments mapped with their
//! permissions, then the main thread started at the entry point.

use goblin::elf::header::ET_DYN;
use goblin::elf::program_header::{PF_W, PF_X, PT_LOAD};
use goblin::elf::Elf;
use kernel::{Kernel, ProcessParams, ResourceLimitValues};
use log::{debug, info, warn};
use memory::AddressSpaceLayout;
use types::{align_down, align_up, MemoryPermission, MemoryState, VAddr, PAGE_SIZE};

use crate::error::LoaderError;

/// Priority of a main thread unless the image says otherwise.
pub const DEFAULT_MAIN_PRIORITY: u32 = 44;

/// One page-aligned piece of an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub addr: VAddr,
    /// Initial contents; the rest of `size` is zero-filled.
    pub data: Vec<u8>,
    pub size: u64,
    pub permission: MemoryPermission,
}

impl Segment {
    pub fn end(&self) -> VAddr {
        self.addr + self.size
    }

    fn state(&self) -> MemoryState {
        if self.permission.contains(MemoryPermission::EXECUTE) {
            MemoryState::Code
        } else {
            MemoryState::CodeData
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProgramImage {
    pub name: String,
    pub program_id: u64,
    pub entry: VAddr,
    pub segments: Vec<Segment>,
    pub priority: u32,
    /// `None` takes the kernel's configured main stack size.
    pub stack_size: Option<u64>,
    pub resource_limits: Option<ResourceLimitValues>,
}

impl ProgramImage {
    /// An image with a single executable segment of `code_size` bytes at
    /// the start of the code region; scripted guests need nothing more.
    pub fn code_only(name: &str, code_size: u64) -> Self {
        let addr = AddressSpaceLayout::CODE_START;
        Self {
            name: name.to_string(),
            program_id: ProcessParams::default().program_id,
            entry: addr,
            segments: vec![Segment {
                addr,
                data: Vec::new(),
                size: align_up(code_size.max(1), PAGE_SIZE),
                permission: MemoryPermission::READ_EXECUTE,
            }],
            priority: DEFAULT_MAIN_PRIORITY,
            stack_size: None,
            resource_limits: None,
        }
    }

    /// Collects the PT_LOAD segments of an ELF. Position-independent images
    /// are placed at the start of the code region.
    pub fn from_elf(name: &str, bytes: &[u8]) -> Result<Self, LoaderError> {
        let elf = Elf::parse(bytes)?;
        let base = if elf.header.e_type == ET_DYN {
            AddressSpaceLayout::CODE_START
        } else {
            0
        };

        let mut headers: Vec<_> = elf
            .program_headers
            .iter()
            .filter(|ph| ph.p_type == PT_LOAD && ph.p_memsz > 0)
            .collect();
        headers.sort_by_key(|ph| ph.p_vaddr);

        let mut segments: Vec<Segment> = Vec::with_capacity(headers.len());
        for ph in headers {
            let addr = base + ph.p_vaddr;
            let permission = segment_permission(ph.p_flags, addr)?;
            let file_start = ph.p_offset as usize;
            let file_end = file_start
                .checked_add(ph.p_filesz as usize)
                .filter(|&end| end <= bytes.len())
                .ok_or(LoaderError::Truncated { addr })?;

            let start = align_down(addr, PAGE_SIZE);
            let end = align_up(addr + ph.p_memsz.max(ph.p_filesz), PAGE_SIZE);
            if segments.last().map_or(false, |prev| prev.end() > start) {
                return Err(LoaderError::Overlap { addr });
            }
            let mut data = vec![0u8; (addr - start) as usize];
            data.extend_from_slice(&bytes[file_start..file_end]);
            debug!(
                "{}: segment {:#x}..{:#x} {:?} ({} bytes from file)",
                name, start, end, permission, ph.p_filesz
            );
            segments.push(Segment {
                addr: start,
                data,
                size: end - start,
                permission,
            });
        }
        if segments.is_empty() {
            return Err(LoaderError::Empty);
        }

        let entry = base + elf.entry;
        let executable = segments
            .iter()
            .any(|s| s.permission.contains(MemoryPermission::EXECUTE) && (s.addr..s.end()).contains(&entry));
        if !executable {
            return Err(LoaderError::BadEntry { entry });
        }

        Ok(Self {
            entry,
            segments,
            ..Self::code_only(name, 0)
        })
    }
}

fn segment_permission(flags: u32, addr: VAddr) -> Result<MemoryPermission, LoaderError> {
    match (flags & PF_W != 0, flags & PF_X != 0) {
        (true, true) => Err(LoaderError::WritableCode { addr }),
        (false, true) => Ok(MemoryPermission::READ_EXECUTE),
        (true, false) => Ok(MemoryPermission::READ_WRITE),
        (false, false) => Ok(MemoryPermission::READ),
    }
}

/// Creates a process for `image` and starts its main thread. Returns the
/// new pid; a half-built process is torn down on failure.
pub fn load_program(kernel: &Kernel, image: &ProgramImage) -> Result<u64, LoaderError> {
    if image.segments.is_empty() {
        return Err(LoaderError::Empty);
    }
    let params = ProcessParams {
        name: image.name.clone(),
        program_id: image.program_id,
        resource_limits: image.resource_limits,
        ..Default::default()
    };
    let pid = kernel.create_process(&params)?;
    let stack_size = image
        .stack_size
        .unwrap_or_else(|| kernel.config().main_stack_size);

    let started = image
        .segments
        .iter()
        .try_for_each(|s| kernel.map_segment(pid, s.addr, &s.data, s.size, s.state(), s.permission))
        .and_then(|()| kernel.start_process(pid, image.entry, image.priority, stack_size));
    match started {
        Ok(tid) => {
            info!(
                "loaded {} as pid {} (entry {:#x}, main thread {})",
                image.name, pid, image.entry, tid
            );
            Ok(pid)
        }
        Err(rc) => {
            warn!("loading {} failed: {}", image.name, rc);
            let _ = kernel.terminate_process(pid);
            Err(rc.into())
        }
    }
}

pub fn load_elf(kernel: &Kernel, name: &str, bytes: &[u8]) -> Result<u64, LoaderError> {
    load_program(kernel, &ProgramImage::from_elf(name, bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use goblin::elf::program_header::PF_R;

    #[test]
    fn writable_code_is_rejected() {
        assert!(matches!(
            segment_permission(PF_R | PF_W | PF_X, 0x1000),
            Err(LoaderError::WritableCode { addr: 0x1000 })
        ));
        assert_eq!(segment_permission(PF_R, 0).unwrap(), MemoryPermission::READ);
        assert_eq!(segment_permission(PF_R | PF_X, 0).unwrap(), MemoryPermission::READ_EXECUTE);
    }

    #[test]
    fn code_only_image_is_one_page_aligned_segment() {
        let image = ProgramImage::code_only("scripted", 0x1234);
        assert_eq!(image.segments.len(), 1);
        assert_eq!(image.segments[0].size, 0x2000);
        assert_eq!(image.entry, AddressSpaceLayout::CODE_START);
    }
}
