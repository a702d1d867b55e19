// SPDX-License-Identifier: MPL-2.0

//! The fault-decision engine.
//!
//! On a fault the port calls in with the process, the address and the
//! access descriptor; the decision comes from the faulting process's area
//! tree and the page-table state of every process sharing the covering
//! area. The caller (or [`resolve_fault`]) performs the action.

use crate::config::{page_align_down, KERNEL_SPACE_BASE, PAGE_SIZE};
use crate::error::{KernelError, Result};
use crate::ipc;
use crate::mm::phys::FramePref;
use crate::mm::vma::{Vma, VmaFlags};
use crate::port::PageFlags;
use crate::prelude::*;
use crate::process::{Process, Role};

bitflags! {
    /// What the faulting access was trying to do.
    pub struct FaultAccess: u32 {
        const WRITE   = 1 << 0;
        const USER    = 1 << 1;
        /// The port observed a translation for the address.
        const PRESENT = 1 << 2;
    }
}

/// What to do about a fault.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FaultDecision {
    /// No area covers the address, or the access breaks its rules.
    BadAccess,
    /// The covering area is pager-backed; forward to userspace.
    External,
    /// Map a fresh private page.
    NewPage,
    /// Map one fresh page into every process sharing the area.
    NewSharedPage,
    /// Copy-on-write completion: give this process its own copy.
    ClonePage,
    /// Sole user of a present page: just set the writable bit.
    MakeWriteable,
}

fn page_map_flags(vma_flags: VmaFlags) -> PageFlags {
    let mut flags = PageFlags::PRESENT | PageFlags::USER | PageFlags::ALLOCATED;
    if vma_flags.contains(VmaFlags::WRITEABLE) {
        flags |= PageFlags::WRITE;
    }
    if vma_flags.contains(VmaFlags::NOCACHE) {
        flags |= PageFlags::NOCACHE;
    }
    flags
}

/// Decide what a fault at `addr` means for `process`.
pub fn decide(
    kernel: &Kernel,
    process: &Arc<Process>,
    addr: Vaddr,
    access: FaultAccess,
) -> FaultDecision {
    // user mode touching kernel space is never negotiable
    if addr >= KERNEL_SPACE_BASE && access.contains(FaultAccess::USER) {
        return FaultDecision::BadAccess;
    }

    let (found, root) = match process.inner().read() {
        Ok(inner) => (inner.space.find(addr), inner.page_root),
        Err(_) => return FaultDecision::BadAccess,
    };
    let Some((base, vma)) = found else {
        return FaultDecision::BadAccess;
    };

    let vma_flags = vma.flags();
    if access.contains(FaultAccess::WRITE) && !vma_flags.contains(VmaFlags::WRITEABLE) {
        return FaultDecision::BadAccess;
    }
    if !vma_flags.contains(VmaFlags::MEMSOURCE) {
        return FaultDecision::External;
    }

    let page = page_align_down(addr);
    let present = kernel.port().translate_user(root, page).is_some();

    if vma_flags.contains(VmaFlags::SHARED) {
        return if present {
            FaultDecision::MakeWriteable
        } else {
            FaultDecision::NewSharedPage
        };
    }

    match vma.refcount() {
        0 => FaultDecision::BadAccess,
        1 => {
            if present {
                FaultDecision::MakeWriteable
            } else {
                FaultDecision::NewPage
            }
        }
        _ => {
            if !present {
                return FaultDecision::NewPage;
            }
            // only clone while another process still shares the frame;
            // otherwise this is the tail end of an old copy-on-write
            let Some((my_phys, _)) = kernel.port().translate_user(root, page) else {
                return FaultDecision::BadAccess;
            };
            if another_user_shares_frame(kernel, process, &vma, base, page, my_phys) {
                FaultDecision::ClonePage
            } else {
                FaultDecision::MakeWriteable
            }
        }
    }
}

fn another_user_shares_frame(
    kernel: &Kernel,
    process: &Arc<Process>,
    vma: &Arc<Vma>,
    base: Vaddr,
    page: Vaddr,
    my_phys: Paddr,
) -> bool {
    let offset = page - base;
    for mapping in vma.mappings() {
        if mapping.pid == process.pid() {
            continue;
        }
        let Some(other) = kernel.registry().find(mapping.pid) else {
            continue;
        };
        let Ok(other_root) = other.inner().read().map(|i| i.page_root) else {
            continue;
        };
        if let Some((phys, _)) = kernel.port().translate_user(other_root, mapping.base + offset)
        {
            if phys == my_phys {
                return true;
            }
        }
    }
    false
}

/// Decide and act on a fault. Returns an error when the access cannot be
/// satisfied (bad access, out of frames, or pager-backed).
pub fn resolve_fault(
    kernel: &Kernel,
    process: &Arc<Process>,
    addr: Vaddr,
    access: FaultAccess,
) -> Result<()> {
    let decision = decide(kernel, process, addr, access);
    let page = page_align_down(addr);
    let (root, pid) = {
        let inner = process.inner().read()?;
        (inner.page_root, process.pid())
    };

    trace!(
        "vmm: fault at {:#x} in pid {} -> {:?}",
        addr,
        pid,
        decision
    );

    match decision {
        FaultDecision::BadAccess => Err(KernelError::BadAddress),
        FaultDecision::External => {
            // hand the fault to the pager process and fail the fast path
            if let Some(pager) = kernel.registry().role_lookup(Role::Pager) {
                let _ = ipc::send_kernel_signal(
                    kernel,
                    &pager,
                    ipc::SIG_KERNEL_PAGE_REQUEST,
                    (page / PAGE_SIZE) as u32,
                );
            }
            Err(KernelError::Failure)
        }
        FaultDecision::NewPage => {
            let (vma_flags, frame) = {
                let inner = process.inner().read()?;
                let (_, vma) = inner.space.find(addr).ok_or(KernelError::BadAddress)?;
                (
                    vma.flags(),
                    kernel.phys().request(kernel.port(), FramePref::Any)?,
                )
            };
            kernel
                .port()
                .map_4k(root, page, frame, page_map_flags(vma_flags))
        }
        FaultDecision::NewSharedPage => {
            let (base, vma) = {
                let inner = process.inner().read()?;
                inner.space.find(addr).ok_or(KernelError::BadAddress)?
            };
            resolve_shared_page(kernel, &vma, base, page)
        }
        FaultDecision::ClonePage => {
            let (my_phys, _) = kernel
                .port()
                .translate_user(root, page)
                .ok_or(KernelError::BadAddress)?;
            let vma_flags = {
                let inner = process.inner().read()?;
                let (_, vma) = inner.space.find(addr).ok_or(KernelError::BadAddress)?;
                vma.flags()
            };
            let frame = kernel.phys().request(kernel.port(), FramePref::Any)?;
            unsafe {
                core::ptr::copy_nonoverlapping(
                    kernel.port().frame_to_ptr(my_phys),
                    kernel.port().frame_to_ptr(frame),
                    PAGE_SIZE,
                );
            }
            kernel
                .port()
                .map_4k(root, page, frame, page_map_flags(vma_flags))
        }
        FaultDecision::MakeWriteable => {
            let (_, current) = kernel
                .port()
                .translate_user(root, page)
                .ok_or(KernelError::BadAddress)?;
            kernel
                .port()
                .set_page_flags(root, page, current | PageFlags::WRITE | PageFlags::PRESENT)
        }
    }
}

/// One frame for every user of a shared area: reuse a frame an existing
/// user already has, or allocate one, then map it everywhere and flush
/// stale translations on every other core.
fn resolve_shared_page(kernel: &Kernel, vma: &Arc<Vma>, my_base: Vaddr, page: Vaddr) -> Result<()> {
    let offset = page - my_base;
    let vma_flags = vma.flags();
    let mappings = vma.mappings();

    // find an existing frame among the users
    let mut frame = None;
    for mapping in &mappings {
        let Some(process) = kernel.registry().find(mapping.pid) else {
            continue;
        };
        let Ok(root) = process.inner().read().map(|i| i.page_root) else {
            continue;
        };
        if let Some((phys, _)) = kernel.port().translate_user(root, mapping.base + offset) {
            frame = Some(phys);
            break;
        }
    }
    let (frame, fresh) = match frame {
        Some(frame) => (frame, false),
        None => (
            kernel.phys().request(kernel.port(), FramePref::Any)?,
            true,
        ),
    };

    let mut first = fresh;
    let mut touched_roots = Vec::new();
    for mapping in &mappings {
        let Some(process) = kernel.registry().find(mapping.pid) else {
            continue;
        };
        let Ok(root) = process.inner().read().map(|i| i.page_root) else {
            continue;
        };
        let vaddr = mapping.base + offset;
        if kernel.port().translate_user(root, vaddr).is_none() {
            // the frame is owned by whichever mapping got it first
            let mut flags = page_map_flags(vma_flags);
            if !first {
                flags -= PageFlags::ALLOCATED;
            }
            first = false;
            kernel.port().map_4k(root, vaddr, frame, flags)?;
            touched_roots.push(root);
        }
    }

    // every other core must drop stale translations for these spaces
    for root in touched_roots {
        for cpu in kernel.cpus().iter() {
            if cpu.id() != crate::cpu::this_cpu() {
                kernel.port().ipi_flush_tlb(cpu.id(), root);
            }
        }
    }
    Ok(())
}

/// Pre-emptive fault resolution: before the kernel dereferences a user
/// range, drive the fault handler for every page that is absent or not
/// writable enough. Fails the caller's syscall if a page cannot be fixed.
pub fn resolve_user_range(
    kernel: &Kernel,
    process: &Arc<Process>,
    base: Vaddr,
    size: usize,
    needs: FaultAccess,
) -> Result<()> {
    if size == 0 {
        return Err(KernelError::BadParams);
    }
    crate::mm::check_user_range(base, size)?;
    let root = process.inner().read()?.page_root;

    let mut page = page_align_down(base);
    let end = base + size;
    while page < end {
        let satisfied = match kernel.port().translate_user(root, page) {
            Some((_, flags)) => {
                !needs.contains(FaultAccess::WRITE) || flags.contains(PageFlags::WRITE)
            }
            None => false,
        };
        if !satisfied {
            let mut access = needs | FaultAccess::USER;
            if kernel.port().translate_user(root, page).is_some() {
                access |= FaultAccess::PRESENT;
            }
            resolve_fault(kernel, process, page, access)?;
        }
        page += PAGE_SIZE;
    }
    Ok(())
}
