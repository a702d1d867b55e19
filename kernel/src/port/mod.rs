// SPDX-License-Identifier: MPL-2.0

//! The port boundary.
//!
//! Everything hardware-specific sits behind [`Port`]: page-table encoding,
//! register save/restore, inter-processor pokes and the linear mapping of
//! physical memory. The core never reaches past this trait.

use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::cpu::CpuId;
use crate::error::Result;
use crate::process::Thread;
use crate::{Paddr, PageTableRoot, Vaddr};

#[cfg(test)]
pub mod mock;

bitflags! {
    /// Architecture-neutral page mapping bits. The port translates these
    /// to real page-table entry encodings.
    pub struct PageFlags: u32 {
        const PRESENT   = 1 << 0;
        const WRITE     = 1 << 1;
        const USER      = 1 << 2;
        const NOCACHE   = 1 << 3;
        /// Software bit: the frame behind this mapping was taken from the
        /// physical stacks and must be returned when the space dies.
        const ALLOCATED = 1 << 4;
    }
}

/// A hardware I/O port transfer on architectures that have them.
#[derive(Clone, Copy, Debug)]
pub struct IoPortRequest {
    pub write: bool,
    pub size: u8,
    pub port: u16,
    pub data_out: u32,
}

/// The interface the portable core drives the machine through.
///
/// Implementations must be callable from any CPU; the core performs its own
/// serialisation above this layer.
pub trait Port: Send + Sync {
    /// Number of CPUs brought up by the low-level boot.
    fn cpu_count(&self) -> u32;

    /// Kernel-virtual access to a physical frame through the linear map.
    fn frame_to_ptr(&self, frame: Paddr) -> *mut u8;

    /// Create an address space holding only the kernel mappings.
    fn new_address_space(&self) -> Result<PageTableRoot>;

    /// Duplicate an address space for fork, marking writable user pages
    /// copy-on-write on both sides.
    fn clone_address_space(&self, src: PageTableRoot) -> Result<PageTableRoot>;

    /// Tear an address space down. Returns every frame the space owned
    /// (pages mapped with [`PageFlags::ALLOCATED`] that no other live
    /// space still references, plus the page-table frames themselves).
    fn destroy_address_space(&self, root: PageTableRoot) -> Result<Vec<Paddr>>;

    /// Make `root` the translation root on the executing CPU.
    fn load_address_space(&self, root: PageTableRoot);

    /// Walk the tables for a user address.
    fn translate_user(&self, root: PageTableRoot, vaddr: Vaddr) -> Option<(Paddr, PageFlags)>;

    fn map_4k(&self, root: PageTableRoot, vaddr: Vaddr, paddr: Paddr, flags: PageFlags)
        -> Result<()>;

    /// Remove a 4K mapping, handing back the frame that was mapped.
    fn unmap_4k(&self, root: PageTableRoot, vaddr: Vaddr) -> Result<Option<Paddr>>;

    /// Map a large (page-directory sized) block where supported. Ports
    /// without large pages decompose into 4K mappings.
    fn map_large(
        &self,
        root: PageTableRoot,
        vaddr: Vaddr,
        paddr: Paddr,
        flags: PageFlags,
    ) -> Result<()>;

    /// Rewrite the flags of an existing mapping (copy-on-write completion).
    fn set_page_flags(&self, root: PageTableRoot, vaddr: Vaddr, flags: PageFlags) -> Result<()>;

    /// Copy bytes out of a user address space into kernel memory.
    fn read_user(&self, root: PageTableRoot, vaddr: Vaddr, buf: &mut [u8]) -> Result<()>;

    /// Copy kernel bytes into a user address space.
    fn write_user(&self, root: PageTableRoot, vaddr: Vaddr, buf: &[u8]) -> Result<()>;

    /// Save `prev`'s register state and resume `next`, reloading the
    /// address-space root if it differs.
    fn context_switch(&self, prev: Option<&Arc<Thread>>, next: &Arc<Thread>);

    /// Poke another CPU to re-run its scheduler.
    fn ipi_reschedule(&self, cpu: CpuId);

    /// Tell another CPU to reload its translation root if it is running
    /// the named address space.
    fn ipi_flush_tlb(&self, cpu: CpuId, root: PageTableRoot);

    /// Perform a hardware I/O port transfer.
    fn io_port(&self, request: IoPortRequest) -> Result<u32>;

    /// Enter the first user thread from kernel boot. Does not return on
    /// real hardware.
    fn kickstart(&self);
}
