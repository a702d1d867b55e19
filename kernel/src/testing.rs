// SPDX-License-Identifier: MPL-2.0

//! Shared fixtures for the unit tests: a miniature kernel booted against
//! the mock port, plus helpers to spawn processes, mount user pages and
//! fabricate ELF payload images.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::boot::BootInfo;
use crate::config::PAGE_SIZE;
use crate::cpu;
use crate::mm::FramePref;
use crate::port::mock::MockPort;
use crate::port::PageFlags;
use crate::port::Port;
use crate::process::{process_new, Process, Thread, ThreadState};
use crate::{Kernel, Paddr, Vaddr};

pub struct TestKernel {
    kernel: &'static Kernel,
    port: &'static MockPort,
}

impl TestKernel {
    /// A kernel with initialised frame stacks, heap and scheduler pools,
    /// one CPU and no processes.
    pub fn bare() -> Self {
        Self::with_cpus(1)
    }

    pub fn with_cpus(cpus: u32) -> Self {
        let port = MockPort::leaked_with_cpus(32 * 1024 * 1024, cpus);
        let info = BootInfo {
            regions: alloc::vec![0..24 * 1024 * 1024],
            kernel_image: 4 * 1024 * 1024..8 * 1024 * 1024,
            modules: Vec::new(),
        };
        let kernel: &'static Kernel =
            alloc::boxed::Box::leak(alloc::boxed::Box::new(Kernel::new(port, &info)));
        kernel.late_init().unwrap();
        cpu::set_this_cpu(0);
        cpu::set_current_token(0);
        Self { kernel, port }
    }

    pub fn kernel(&self) -> &'static Kernel {
        self.kernel
    }

    pub fn port(&self) -> &'static MockPort {
        self.port
    }

    /// A boot-style process: fresh address space, one sleeping thread.
    pub fn spawn_process(&self) -> Arc<Process> {
        process_new(self.kernel, None, None).unwrap()
    }

    /// A boot-style child of `parent` (inherits layer, creds, bounds).
    pub fn spawn_child(&self, parent: &Arc<Process>) -> Arc<Process> {
        process_new(self.kernel, Some(parent), None).unwrap()
    }

    pub fn first_thread(&self, process: &Arc<Process>) -> Arc<Thread> {
        process.inner().read().unwrap().any_thread().unwrap()
    }

    /// Pretend `thread` is what this CPU is executing.
    pub fn run_as(&self, thread: &Arc<Thread>) {
        {
            let mut inner = thread.inner().write().unwrap();
            inner.state = ThreadState::Running;
            inner.cpu = cpu::this_cpu();
        }
        self.kernel
            .cpus()
            .cpu(cpu::this_cpu())
            .set_current(Some(thread.clone()));
    }

    /// Mount a writable, kernel-backed page at `vaddr` in the process and
    /// return the backing frame.
    pub fn map_user_page(&self, process: &Arc<Process>, vaddr: Vaddr) -> Paddr {
        let root = process.inner().read().unwrap().page_root;
        let frame = self
            .kernel
            .phys()
            .request(self.port, FramePref::Any)
            .unwrap();
        self.port
            .map_4k(
                root,
                vaddr,
                frame,
                PageFlags::PRESENT | PageFlags::USER | PageFlags::WRITE | PageFlags::ALLOCATED,
            )
            .unwrap();
        frame
    }

    pub fn write_user(&self, process: &Arc<Process>, vaddr: Vaddr, bytes: &[u8]) {
        let root = process.inner().read().unwrap().page_root;
        self.port.write_user(root, vaddr, bytes).unwrap();
    }

    pub fn read_user(&self, process: &Arc<Process>, vaddr: Vaddr, len: usize) -> Vec<u8> {
        let root = process.inner().read().unwrap().page_root;
        let mut buf = alloc::vec![0u8; len];
        self.port.read_user(root, vaddr, &mut buf).unwrap();
        buf
    }
}

/// Segment descriptor for [`build_elf`].
pub struct ElfSegment<'a> {
    pub vaddr: Vaddr,
    pub data: &'a [u8],
    pub write: bool,
    pub execute: bool,
}

/// Fabricate a minimal little-endian ELF64 executable image.
pub fn build_elf(entry: Vaddr, segments: &[ElfSegment]) -> Vec<u8> {
    const EHSIZE: usize = 64;
    const PHENTSIZE: usize = 56;

    let phoff = EHSIZE;
    let data_start = EHSIZE + segments.len() * PHENTSIZE;

    let mut image = Vec::new();
    // e_ident
    image.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    image.extend_from_slice(&2u16.to_le_bytes()); // e_type: EXEC
    image.extend_from_slice(&62u16.to_le_bytes()); // e_machine: x86-64
    image.extend_from_slice(&1u32.to_le_bytes()); // e_version
    image.extend_from_slice(&(entry as u64).to_le_bytes());
    image.extend_from_slice(&(phoff as u64).to_le_bytes());
    image.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
    image.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    image.extend_from_slice(&(EHSIZE as u16).to_le_bytes());
    image.extend_from_slice(&(PHENTSIZE as u16).to_le_bytes());
    image.extend_from_slice(&(segments.len() as u16).to_le_bytes());
    image.extend_from_slice(&0u16.to_le_bytes()); // e_shentsize
    image.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
    image.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx
    debug_assert_eq!(image.len(), EHSIZE);

    let mut offset = data_start;
    for segment in segments {
        let mut flags = 4u32; // R
        if segment.write {
            flags |= 2;
        }
        if segment.execute {
            flags |= 1;
        }
        image.extend_from_slice(&1u32.to_le_bytes()); // p_type: LOAD
        image.extend_from_slice(&flags.to_le_bytes());
        image.extend_from_slice(&(offset as u64).to_le_bytes());
        image.extend_from_slice(&(segment.vaddr as u64).to_le_bytes());
        image.extend_from_slice(&(segment.vaddr as u64).to_le_bytes()); // p_paddr
        image.extend_from_slice(&(segment.data.len() as u64).to_le_bytes());
        image.extend_from_slice(&(segment.data.len() as u64).to_le_bytes());
        image.extend_from_slice(&(PAGE_SIZE as u64).to_le_bytes()); // p_align
        offset += segment.data.len();
    }
    for segment in segments {
        image.extend_from_slice(segment.data);
    }
    image
}
