// SPDX-License-Identifier: MPL-2.0

use crate::config::{page_align_down, PAGE_SIZE};
use crate::error::{KernelError, Result};
use crate::mm::{self, VmaFlags, VmaKind};
use crate::port::PageFlags;
use crate::prelude::*;
use crate::process::Thread;
use crate::syscall::MemoryRequest;

/// A memory-area request as userspace phrases it.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
struct AreaRequest {
    ptr: usize,
    size: usize,
    flags: u32,
}

pub(super) fn memory(
    kernel: &Kernel,
    current: &Arc<Thread>,
    request: MemoryRequest,
) -> Result<usize> {
    let process = kernel
        .registry()
        .find(current.pid())
        .ok_or(KernelError::Failure)?;
    let pid = process.pid();
    let root = process.inner().read()?.page_root;

    match request {
        MemoryRequest::Create { request } => {
            let req: AreaRequest = mm::read_user_struct(kernel.port(), root, request)?;
            mm::check_user_area(req.ptr, req.size)?;
            let flags = VmaFlags::from_bits_truncate(req.flags) | VmaFlags::MEMSOURCE;
            let mut inner = process.inner().write()?;
            inner
                .space
                .add(kernel, pid, req.ptr, req.size, flags, VmaKind::Generic, 0)?;
            Ok(0)
        }
        MemoryRequest::Destroy { request } => {
            let req: AreaRequest = mm::read_user_struct(kernel.port(), root, request)?;
            let mut inner = process.inner().write()?;
            let (base, vma) = inner
                .space
                .find(req.ptr)
                .ok_or(KernelError::NotFound)?;
            let size = vma.size();
            inner.space.unlink(kernel, pid, base)?;
            drop(inner);

            // pull the mappings and hand owned frames back
            let mut offset = 0;
            while offset < size {
                if let Some(frame) = release_mapping(kernel, root, base + offset)? {
                    let _ = kernel.phys().release(frame);
                }
                offset += PAGE_SIZE;
            }
            Ok(0)
        }
        MemoryRequest::Resize { request } => {
            let req: AreaRequest = mm::read_user_struct(kernel.port(), root, request)?;
            let change = req.size as isize;
            let mut inner = process.inner().write()?;
            let (base, _) = inner
                .space
                .find(req.ptr)
                .ok_or(KernelError::NotFound)?;
            let new_size = inner.space.resize(base, change)?;
            Ok(new_size)
        }
        MemoryRequest::Access { request } => {
            let req: AreaRequest = mm::read_user_struct(kernel.port(), root, request)?;
            let mut inner = process.inner().write()?;
            let (base, _) = inner
                .space
                .find(req.ptr)
                .ok_or(KernelError::NotFound)?;
            inner
                .space
                .alter_access(base, VmaFlags::from_bits_truncate(req.flags))?;
            Ok(0)
        }
        MemoryRequest::Locate { request } => {
            let req: AreaRequest = mm::read_user_struct(kernel.port(), root, request)?;
            let inner = process.inner().read()?;
            let (base, vma) = inner
                .space
                .find(req.ptr)
                .ok_or(KernelError::NotFound)?;
            let reply = AreaRequest {
                ptr: base,
                size: vma.size(),
                flags: vma.flags().bits(),
            };
            drop(inner);
            mm::write_user_struct(kernel.port(), root, request, &reply)?;
            Ok(0)
        }
    }
}

/// Unmap one page, returning the frame when the mapping owned it.
fn release_mapping(
    kernel: &Kernel,
    root: PageTableRoot,
    vaddr: Vaddr,
) -> Result<Option<Paddr>> {
    let page = page_align_down(vaddr);
    let Some((_, flags)) = kernel.port().translate_user(root, page) else {
        return Ok(None);
    };
    let frame = kernel.port().unmap_4k(root, page)?;
    if flags.contains(PageFlags::ALLOCATED) {
        return Ok(frame);
    }
    Ok(None)
}
