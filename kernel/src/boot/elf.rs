// SPDX-License-Identifier: MPL-2.0

//! ELF payload parsing: turn an executable module into the areas and the
//! entry point the process bring-up maps.

use xmas_elf::program::Type;
use xmas_elf::ElfFile;

use crate::error::{KernelError, Result};
use crate::prelude::*;

/// A loadable segment of a payload binary.
#[derive(Clone, Copy, Debug)]
pub struct PayloadArea {
    /// Virtual address the segment expects to live at.
    pub vaddr: Vaddr,
    /// Offset of the segment's bytes within the module image.
    pub file_offset: usize,
    /// Bytes present in the image.
    pub file_size: usize,
    /// Total bytes of memory the segment needs.
    pub mem_size: usize,
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

/// What a payload executable asks of its address space.
#[derive(Clone, Debug)]
pub struct PayloadLayout {
    pub entry: Vaddr,
    pub areas: Vec<PayloadArea>,
}

/// Parse an executable payload module.
pub fn parse(image: &[u8]) -> Result<PayloadLayout> {
    let elf = ElfFile::new(image).map_err(|_| KernelError::BadExecutable)?;
    let entry = elf.header.pt2.entry_point() as Vaddr;

    let mut areas = Vec::new();
    for header in elf.program_iter() {
        let kind = header
            .get_type()
            .map_err(|_| KernelError::BadExecutable)?;
        if kind != Type::Load {
            continue;
        }
        let flags = header.flags();
        areas.push(PayloadArea {
            vaddr: header.virtual_addr() as Vaddr,
            file_offset: header.offset() as usize,
            file_size: header.file_size() as usize,
            mem_size: header.mem_size() as usize,
            read: flags.is_read(),
            write: flags.is_write(),
            execute: flags.is_execute(),
        });
    }

    if areas.is_empty() {
        return Err(KernelError::BadExecutable);
    }
    Ok(PayloadLayout { entry, areas })
}
