// SPDX-License-Identifier: MPL-2.0

//! The payload packaging format.
//!
//! The build bundles the boot binaries into one blob a bootloader can hand
//! over as a trivial initrd:
//!
//! ```text
//! +----------------------------------------+
//! | number of modules present              | 32bits wide
//! +----------------------------------------+
//! ...then for each module...
//! +----------------------------------------+
//! | offset to first byte of module data    | 32bits wide
//! | offset to last byte of module data     | 32bits wide
//! | offset to first byte of comment string | 32bits wide
//! | must be 0x00000000                     | 32bits wide
//! +----------------------------------------+
//! | module comment string, null-terminated |
//! | module file data                       |
//! +----------------------------------------+
//! ```
//!
//! Offsets are measured from the start of the blob; all words are
//! little-endian. The comment is the module's filename with a prepended
//! `/` character.

use crate::error::{KernelError, Result};
use crate::prelude::*;

const RECORD_SIZE: usize = 16;

/// One module recovered from a payload blob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PayloadModule {
    /// Byte range of the module data within the blob.
    pub data: core::ops::Range<usize>,
    pub name: String,
}

fn read_u32(blob: &[u8], offset: usize) -> Result<u32> {
    let bytes = blob
        .get(offset..offset + 4)
        .ok_or(KernelError::NotEnoughBytes)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Walk a payload blob and list its modules.
pub fn parse(blob: &[u8]) -> Result<Vec<PayloadModule>> {
    let count = read_u32(blob, 0)? as usize;
    let mut modules = Vec::with_capacity(count);
    let mut cursor = 4;

    for _ in 0..count {
        let mod_start = read_u32(blob, cursor)? as usize;
        let mod_end = read_u32(blob, cursor + 4)? as usize;
        let string_offset = read_u32(blob, cursor + 8)? as usize;
        let reserved = read_u32(blob, cursor + 12)?;
        if reserved != 0 {
            return Err(KernelError::BadMagic);
        }
        if mod_start > mod_end || mod_end > blob.len() || string_offset >= blob.len() {
            return Err(KernelError::BadParams);
        }

        let name_bytes = &blob[string_offset..];
        let nul = name_bytes
            .iter()
            .position(|b| *b == 0)
            .ok_or(KernelError::NotEnoughBytes)?;
        let name = core::str::from_utf8(&name_bytes[..nul])
            .map_err(|_| KernelError::BadParams)?
            .to_string();

        modules.push(PayloadModule {
            data: mod_start..mod_end,
            name,
        });
        // the next record follows this module's data
        cursor = mod_end;
    }
    Ok(modules)
}

/// Build a payload blob out of named module images, the way the release
/// tooling does.
pub fn pack(modules: &[(&str, &[u8])]) -> Vec<u8> {
    let mut blob = Vec::new();
    blob.extend_from_slice(&(modules.len() as u32).to_le_bytes());

    let mut offset = 4usize;
    for (name, data) in modules {
        let string_offset = offset + RECORD_SIZE;
        // the comment is the filename with a prepended '/'
        let string_len = name.len() + 2;
        let mod_start = string_offset + string_len;
        let mod_end = mod_start + data.len();

        blob.extend_from_slice(&(mod_start as u32).to_le_bytes());
        blob.extend_from_slice(&(mod_end as u32).to_le_bytes());
        blob.extend_from_slice(&(string_offset as u32).to_le_bytes());
        blob.extend_from_slice(&0u32.to_le_bytes());
        blob.push(b'/');
        blob.extend_from_slice(name.as_bytes());
        blob.push(0);
        blob.extend_from_slice(data);

        offset = mod_end;
    }
    blob
}
