// SPDX-License-Identifier: MPL-2.0

//! The kernel heap.
//!
//! First-fit over a sorted free list. Every allocation is preceded by a
//! block header whose magic word tells free from in-use and catches
//! corruption. Requests are rounded up to a small block multiple so blocks
//! can shrink and grow in place; when the free list cannot satisfy a
//! request the heap pulls a contiguous run of frames from the physical
//! stacks (high first, low on failure) and carves it as a fresh block.

use crate::config::{HEAP_BLOCK_MULTIPLE, PAGE_SIZE};
use crate::error::{KernelError, Result};
use crate::mm::phys::{PhysStacks, StackRegion};
use crate::port::Port;
use crate::prelude::*;
use crate::sync::Gate;

const HEAP_FREE_MAGIC: u32 = 0xdead_dead;
const HEAP_INUSE_MAGIC: u32 = 0xd105_d105;

const HEADER_SIZE: usize = core::mem::size_of::<BlockHeader>();

/// Header preceding every heap block, free or allocated.
#[repr(C)]
struct BlockHeader {
    magic: u32,
    _pad: u32,
    /// Bytes actually requested, including this header.
    size: usize,
    /// Bytes the block spans, including this header; a multiple of the
    /// block rounding except for whole fresh frame runs.
    capacity: usize,
    prev: *mut BlockHeader,
    next: *mut BlockHeader,
}

struct HeapInner {
    /// Free blocks sorted by ascending base address, adjacent ones merged.
    free: *mut BlockHeader,
    /// Allocated blocks, unsorted.
    allocated: *mut BlockHeader,
}

// Safety. The raw list heads are only touched under the heap gate.
unsafe impl Send for HeapInner {}
unsafe impl Sync for HeapInner {}

/// The kernel heap behind one gate.
pub struct KernelHeap {
    inner: Gate<HeapInner>,
}

fn pad_request(size: usize) -> usize {
    let gross = size + HEADER_SIZE;
    (gross + HEAP_BLOCK_MULTIPLE - 1) & !(HEAP_BLOCK_MULTIPLE - 1)
}

impl KernelHeap {
    pub const fn new() -> Self {
        Self {
            inner: Gate::new(HeapInner {
                free: core::ptr::null_mut(),
                allocated: core::ptr::null_mut(),
            }),
        }
    }

    /// Pull an initial block through the allocator and release it again,
    /// seeding the free list while contiguous frame runs are plentiful.
    pub fn prime(&self, port: &dyn Port, phys: &PhysStacks, bytes: usize) -> Result<()> {
        let seed = self.alloc(port, phys, bytes)?;
        self.free(seed)
    }

    /// Allocate `size` bytes of kernel memory.
    pub fn alloc(&self, port: &dyn Port, phys: &PhysStacks, size: usize) -> Result<*mut u8> {
        if size == 0 {
            return Err(KernelError::BadParams);
        }
        let padded = pad_request(size);

        let mut inner = self.inner.write()?;

        // first fit over the sorted free list
        let mut block = inner.free;
        unsafe {
            while !block.is_null() {
                if (*block).capacity >= padded {
                    break;
                }
                block = (*block).next;
            }

            if !block.is_null() {
                unlink(&mut inner.free, block);
            } else {
                // no free block fits; grab a fresh run of frames
                let frames = padded / PAGE_SIZE + 1;
                let base = phys
                    .request_contiguous(port, frames, StackRegion::High)
                    .or_else(|_| phys.request_contiguous(port, frames, StackRegion::Low))?;
                block = port.frame_to_ptr(base) as *mut BlockHeader;
                (*block).capacity = frames * PAGE_SIZE;
                trace!(
                    "heap: grabbed {} frames at {:#x} for a {} byte request",
                    frames,
                    base,
                    size
                );
            }

            // trim the excess off the block and put it back on the free list
            let spare = (*block).capacity - padded;
            if spare >= HEADER_SIZE + HEAP_BLOCK_MULTIPLE {
                let extra = (block as usize + padded) as *mut BlockHeader;
                (*extra).magic = HEAP_FREE_MAGIC;
                (*extra).size = 0;
                (*extra).capacity = spare;
                add_to_free(&mut inner.free, extra);
                (*block).capacity = padded;
            }

            (*block).magic = HEAP_INUSE_MAGIC;
            (*block).size = size + HEADER_SIZE;

            // head of the unsorted allocated list
            (*block).prev = core::ptr::null_mut();
            (*block).next = inner.allocated;
            if !inner.allocated.is_null() {
                (*inner.allocated).prev = block;
            }
            inner.allocated = block;

            Ok((block as *mut u8).add(HEADER_SIZE))
        }
    }

    /// Release a previously allocated block.
    pub fn free(&self, addr: *mut u8) -> Result<()> {
        if addr.is_null() {
            error!("heap: free of null pointer");
            return Err(KernelError::BadAddress);
        }
        let block = unsafe { addr.sub(HEADER_SIZE) } as *mut BlockHeader;

        let mut inner = self.inner.write()?;
        unsafe {
            if (*block).magic != HEAP_INUSE_MAGIC {
                error!(
                    "heap: block {:p} has wrong magic {:#x}",
                    block,
                    (*block).magic
                );
                return Err(KernelError::BadMagic);
            }

            unlink(&mut inner.allocated, block);
            (*block).magic = HEAP_FREE_MAGIC;
            add_to_free(&mut inner.free, block);
        }
        Ok(())
    }

    /// Resize an allocation, moving it only when the padded capacity of the
    /// existing block cannot hold the new size.
    pub fn realloc(
        &self,
        port: &dyn Port,
        phys: &PhysStacks,
        addr: *mut u8,
        new_size: usize,
    ) -> Result<*mut u8> {
        if addr.is_null() {
            return self.alloc(port, phys, new_size);
        }
        if new_size == 0 {
            return Err(KernelError::BadParams);
        }

        let block = unsafe { addr.sub(HEADER_SIZE) } as *mut BlockHeader;
        let (old_size, capacity) = {
            let _inner = self.inner.read()?;
            unsafe {
                if (*block).magic != HEAP_INUSE_MAGIC {
                    error!("heap: realloc of block {:p} with bad magic", block);
                    return Err(KernelError::BadMagic);
                }
                ((*block).size - HEADER_SIZE, (*block).capacity)
            }
        };

        if new_size + HEADER_SIZE <= capacity {
            let _inner = self.inner.write()?;
            unsafe {
                (*block).size = new_size + HEADER_SIZE;
            }
            return Ok(addr);
        }

        // grow beyond the padding: allocate-copy-free
        let fresh = self.alloc(port, phys, new_size)?;
        unsafe {
            core::ptr::copy_nonoverlapping(addr, fresh, old_size.min(new_size));
        }
        self.free(addr)?;
        Ok(fresh)
    }

    /// Total bytes sitting on the free list.
    pub fn free_total(&self) -> usize {
        let inner = self.inner.read().unwrap();
        let mut total = 0;
        let mut block = inner.free;
        unsafe {
            while !block.is_null() {
                total += (*block).capacity;
                block = (*block).next;
            }
        }
        total
    }

    /// Number of outstanding allocations.
    pub fn allocated_count(&self) -> usize {
        let inner = self.inner.read().unwrap();
        let mut count = 0;
        let mut block = inner.allocated;
        unsafe {
            while !block.is_null() {
                count += 1;
                block = (*block).next;
            }
        }
        count
    }

    /// Capacity in bytes of the block behind an allocation.
    pub fn block_capacity(&self, addr: *mut u8) -> usize {
        let block = unsafe { addr.sub(HEADER_SIZE) } as *mut BlockHeader;
        let _inner = self.inner.read().unwrap();
        unsafe { (*block).capacity }
    }
}

/// Unlink a block from whichever list currently holds it.
unsafe fn unlink(head: &mut *mut BlockHeader, block: *mut BlockHeader) {
    if !(*block).prev.is_null() {
        (*(*block).prev).next = (*block).next;
    }
    if !(*block).next.is_null() {
        (*(*block).next).prev = (*block).prev;
    }
    if *head == block {
        *head = (*block).next;
    }
    (*block).prev = core::ptr::null_mut();
    (*block).next = core::ptr::null_mut();
}

/// Insert a block into the free list at its sorted position, then merge
/// any blocks that sit flush against each other.
unsafe fn add_to_free(head: &mut *mut BlockHeader, block: *mut BlockHeader) {
    (*block).magic = HEAP_FREE_MAGIC;
    (*block).prev = core::ptr::null_mut();
    (*block).next = core::ptr::null_mut();

    if head.is_null() {
        *head = block;
    } else {
        let mut cursor = *head;
        loop {
            if block < cursor {
                // insert in front of cursor
                (*block).next = cursor;
                (*block).prev = (*cursor).prev;
                if (*cursor).prev.is_null() {
                    *head = block;
                } else {
                    (*(*cursor).prev).next = block;
                }
                (*cursor).prev = block;
                break;
            }
            if (*cursor).next.is_null() {
                (*cursor).next = block;
                (*block).prev = cursor;
                break;
            }
            cursor = (*cursor).next;
        }
    }

    // merge adjoining blocks
    let mut cursor = *head;
    while !cursor.is_null() {
        let target = (*cursor).next;
        if target.is_null() {
            break;
        }
        if target as usize == cursor as usize + (*cursor).capacity {
            (*cursor).next = (*target).next;
            if !(*target).next.is_null() {
                (*(*target).next).prev = cursor;
            }
            (*cursor).capacity += (*target).capacity;
            continue;
        }
        cursor = (*cursor).next;
    }
}
