// SPDX-License-Identifier: MPL-2.0

//! Kernel access to user memory.
//!
//! All movement between address spaces goes through the port's page-table
//! aware copy primitives; the helpers here add range validation and a
//! typed view for the fixed-layout control blocks the syscall ABI uses.

use crate::config::KERNEL_SPACE_BASE;
use crate::error::{KernelError, Result};
use crate::port::Port;
use crate::prelude::*;

/// Reject a user range that leaks into kernel space or wraps.
pub fn check_user_range(addr: Vaddr, len: usize) -> Result<()> {
    let end = addr.checked_add(len).ok_or(KernelError::BadAddress)?;
    if end > KERNEL_SPACE_BASE {
        return Err(KernelError::BadAddress);
    }
    Ok(())
}

/// Read a fixed-layout structure out of a user address space.
pub fn read_user_struct<T: Copy>(port: &dyn Port, root: PageTableRoot, addr: Vaddr) -> Result<T> {
    let size = core::mem::size_of::<T>();
    check_user_range(addr, size)?;
    let mut buf = vec![0u8; size];
    port.read_user(root, addr, &mut buf)?;
    // the buffer is exactly size_of::<T> bytes; alignment is handled by
    // the unaligned read
    Ok(unsafe { core::ptr::read_unaligned(buf.as_ptr() as *const T) })
}

/// Write a fixed-layout structure into a user address space.
pub fn write_user_struct<T: Copy>(
    port: &dyn Port,
    root: PageTableRoot,
    addr: Vaddr,
    value: &T,
) -> Result<()> {
    let size = core::mem::size_of::<T>();
    check_user_range(addr, size)?;
    let buf = unsafe { core::slice::from_raw_parts(value as *const T as *const u8, size) };
    port.write_user(root, addr, buf)
}

/// Copy bytes from one user address space to another, bouncing through a
/// page-sized kernel buffer.
pub fn copy_user_to_user(
    port: &dyn Port,
    dst_root: PageTableRoot,
    dst: Vaddr,
    src_root: PageTableRoot,
    src: Vaddr,
    len: usize,
) -> Result<()> {
    check_user_range(src, len).map_err(|_| KernelError::BadSourceAddress)?;
    check_user_range(dst, len).map_err(|_| KernelError::BadTargetAddress)?;

    let mut bounce = vec![0u8; len.min(PAGE_SIZE)];
    let mut moved = 0;
    while moved < len {
        let chunk = (len - moved).min(PAGE_SIZE);
        port.read_user(src_root, src + moved, &mut bounce[..chunk])
            .map_err(|_| KernelError::BadSourceAddress)?;
        port.write_user(dst_root, dst + moved, &bounce[..chunk])
            .map_err(|_| KernelError::BadTargetAddress)?;
        moved += chunk;
    }
    Ok(())
}
