// SPDX-License-Identifier: MPL-2.0

//! An in-memory port for the test suite: a flat RAM arena, software page
//! tables per address space, and recorded IPIs/context switches the tests
//! can assert on.

use alloc::sync::Arc;
use alloc::vec::Vec;

use hashbrown::HashMap;

use crate::config::{page_align_down, PAGE_SIZE};
use crate::cpu::CpuId;
use crate::error::{KernelError, Result};
use crate::port::{IoPortRequest, PageFlags, Port};
use crate::process::Thread;
use crate::sync::SpinLock;
use crate::{Paddr, PageTableRoot, Vaddr};

#[derive(Clone, Copy, Debug)]
struct PageEntry {
    paddr: Paddr,
    flags: PageFlags,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpiRecord {
    Reschedule { cpu: CpuId },
    FlushTlb { cpu: CpuId, root: PageTableRoot },
}

pub struct MockPort {
    ram: *mut u8,
    ram_size: usize,
    cpu_count: u32,
    spaces: SpinLock<HashMap<PageTableRoot, HashMap<Vaddr, PageEntry>>>,
    next_root: SpinLock<PageTableRoot>,
    ipis: SpinLock<Vec<IpiRecord>>,
    switches: SpinLock<Vec<(Option<(u32, u32)>, (u32, u32))>>,
}

unsafe impl Send for MockPort {}
unsafe impl Sync for MockPort {}

impl MockPort {
    pub fn new(ram_size: usize) -> Self {
        Self::with_cpus(ram_size, 1)
    }

    pub fn with_cpus(ram_size: usize, cpu_count: u32) -> Self {
        let layout = core::alloc::Layout::from_size_align(ram_size, PAGE_SIZE).unwrap();
        let ram = unsafe { alloc::alloc::alloc_zeroed(layout) };
        assert!(!ram.is_null());
        Self {
            ram,
            ram_size,
            cpu_count,
            spaces: SpinLock::new(HashMap::new()),
            next_root: SpinLock::new(0x1000),
            ipis: SpinLock::new(Vec::new()),
            switches: SpinLock::new(Vec::new()),
        }
    }

    /// A port pinned for the lifetime of the test process.
    pub fn leaked(ram_size: usize) -> &'static MockPort {
        alloc::boxed::Box::leak(alloc::boxed::Box::new(Self::new(ram_size)))
    }

    pub fn leaked_with_cpus(ram_size: usize, cpu_count: u32) -> &'static MockPort {
        alloc::boxed::Box::leak(alloc::boxed::Box::new(Self::with_cpus(ram_size, cpu_count)))
    }

    pub fn ipis(&self) -> Vec<IpiRecord> {
        self.ipis.lock().clone()
    }

    pub fn clear_ipis(&self) {
        self.ipis.lock().clear();
    }

    pub fn switch_count(&self) -> usize {
        self.switches.lock().len()
    }

    /// Mapped pages in a space. Test support.
    pub fn mapped_pages(&self, root: PageTableRoot) -> usize {
        self.spaces
            .lock()
            .get(&root)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

impl Port for MockPort {
    fn cpu_count(&self) -> u32 {
        self.cpu_count
    }

    fn frame_to_ptr(&self, frame: Paddr) -> *mut u8 {
        assert!(frame < self.ram_size, "frame {frame:#x} outside mock RAM");
        unsafe { self.ram.add(frame) }
    }

    fn new_address_space(&self) -> Result<PageTableRoot> {
        let mut next = self.next_root.lock();
        let root = *next;
        *next += 0x1000;
        self.spaces.lock().insert(root, HashMap::new());
        Ok(root)
    }

    fn clone_address_space(&self, src: PageTableRoot) -> Result<PageTableRoot> {
        let mut next = self.next_root.lock();
        let root = *next;
        *next += 0x1000;
        drop(next);

        let mut spaces = self.spaces.lock();
        let mut cloned = spaces
            .get(&src)
            .cloned()
            .ok_or(KernelError::BadParams)?;
        // mark writable user pages copy-on-write on both sides
        if let Some(source) = spaces.get_mut(&src) {
            for entry in source.values_mut() {
                if entry.flags.contains(PageFlags::WRITE) {
                    entry.flags -= PageFlags::WRITE;
                }
            }
        }
        for entry in cloned.values_mut() {
            if entry.flags.contains(PageFlags::WRITE) {
                entry.flags -= PageFlags::WRITE;
            }
        }
        spaces.insert(root, cloned);
        Ok(root)
    }

    fn destroy_address_space(&self, root: PageTableRoot) -> Result<Vec<Paddr>> {
        let mut spaces = self.spaces.lock();
        let dead = spaces.remove(&root).ok_or(KernelError::BadParams)?;
        let mut frames = Vec::new();
        for entry in dead.values() {
            if !entry.flags.contains(PageFlags::ALLOCATED) {
                continue;
            }
            let shared = spaces
                .values()
                .any(|space| space.values().any(|e| e.paddr == entry.paddr));
            if !shared {
                frames.push(entry.paddr);
            }
        }
        Ok(frames)
    }

    fn load_address_space(&self, _root: PageTableRoot) {}

    fn translate_user(&self, root: PageTableRoot, vaddr: Vaddr) -> Option<(Paddr, PageFlags)> {
        let spaces = self.spaces.lock();
        let entry = spaces.get(&root)?.get(&page_align_down(vaddr))?;
        Some((entry.paddr + (vaddr - page_align_down(vaddr)), entry.flags))
    }

    fn map_4k(
        &self,
        root: PageTableRoot,
        vaddr: Vaddr,
        paddr: Paddr,
        flags: PageFlags,
    ) -> Result<()> {
        let mut spaces = self.spaces.lock();
        let space = spaces.get_mut(&root).ok_or(KernelError::BadParams)?;
        space.insert(page_align_down(vaddr), PageEntry { paddr, flags });
        Ok(())
    }

    fn unmap_4k(&self, root: PageTableRoot, vaddr: Vaddr) -> Result<Option<Paddr>> {
        let mut spaces = self.spaces.lock();
        let space = spaces.get_mut(&root).ok_or(KernelError::BadParams)?;
        Ok(space.remove(&page_align_down(vaddr)).map(|e| e.paddr))
    }

    fn map_large(
        &self,
        root: PageTableRoot,
        vaddr: Vaddr,
        paddr: Paddr,
        flags: PageFlags,
    ) -> Result<()> {
        // no large-page support in the mock MMU; decompose
        for page in 0..512 {
            self.map_4k(
                root,
                vaddr + page * PAGE_SIZE,
                paddr + page * PAGE_SIZE,
                flags,
            )?;
        }
        Ok(())
    }

    fn set_page_flags(&self, root: PageTableRoot, vaddr: Vaddr, flags: PageFlags) -> Result<()> {
        let mut spaces = self.spaces.lock();
        let space = spaces.get_mut(&root).ok_or(KernelError::BadParams)?;
        let entry = space
            .get_mut(&page_align_down(vaddr))
            .ok_or(KernelError::BadAddress)?;
        // keep the ownership bit whatever the new access bits say
        let allocated = entry.flags.contains(PageFlags::ALLOCATED);
        entry.flags = flags;
        if allocated {
            entry.flags |= PageFlags::ALLOCATED;
        }
        Ok(())
    }

    fn read_user(&self, root: PageTableRoot, vaddr: Vaddr, buf: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let addr = vaddr + done;
            let (paddr, _) = self
                .translate_user(root, addr)
                .ok_or(KernelError::BadAddress)?;
            let in_page = PAGE_SIZE - (addr % PAGE_SIZE);
            let chunk = in_page.min(buf.len() - done);
            unsafe {
                core::ptr::copy_nonoverlapping(
                    self.frame_to_ptr(paddr),
                    buf[done..].as_mut_ptr(),
                    chunk,
                );
            }
            done += chunk;
        }
        Ok(())
    }

    fn write_user(&self, root: PageTableRoot, vaddr: Vaddr, buf: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let addr = vaddr + done;
            let (paddr, _) = self
                .translate_user(root, addr)
                .ok_or(KernelError::BadAddress)?;
            let in_page = PAGE_SIZE - (addr % PAGE_SIZE);
            let chunk = in_page.min(buf.len() - done);
            unsafe {
                core::ptr::copy_nonoverlapping(
                    buf[done..].as_ptr(),
                    self.frame_to_ptr(paddr),
                    chunk,
                );
            }
            done += chunk;
        }
        Ok(())
    }

    fn context_switch(&self, prev: Option<&Arc<Thread>>, next: &Arc<Thread>) {
        self.switches.lock().push((
            prev.map(|t| (t.pid(), t.tid())),
            (next.pid(), next.tid()),
        ));
    }

    fn ipi_reschedule(&self, cpu: CpuId) {
        self.ipis.lock().push(IpiRecord::Reschedule { cpu });
    }

    fn ipi_flush_tlb(&self, cpu: CpuId, root: PageTableRoot) {
        self.ipis.lock().push(IpiRecord::FlushTlb { cpu, root });
    }

    fn io_port(&self, _request: IoPortRequest) -> Result<u32> {
        Err(KernelError::NotImplemented)
    }

    fn kickstart(&self) {}
}
