// SPDX-License-Identifier: MPL-2.0

//! Boot handoff.
//!
//! The loader gives the kernel a memory map and an ordered list of payload
//! modules. The first executable module becomes the system executive; the
//! rest start as its siblings in the executive layer.

pub mod elf;
pub mod payload;

use core::ops::Range;

use crate::config::{page_align_down, page_align_up, LAYER_EXECUTIVE, PAGE_SIZE};
use crate::error::{KernelError, Result};
use crate::mm::{VmaFlags, VmaKind};
use crate::port::PageFlags;
use crate::prelude::*;
use crate::process::{process_new, Process, ProcessFlags, Role, ThreadFlags};
use crate::sched;

/// One payload binary handed over by the bootloader.
#[derive(Clone, Debug)]
pub struct BootModule {
    pub start: Paddr,
    pub end: Paddr,
    pub name: String,
}

/// Everything the loader tells the kernel about the machine.
#[derive(Clone, Debug)]
pub struct BootInfo {
    /// Present RAM.
    pub regions: Vec<Range<Paddr>>,
    /// Physical footprint of the kernel image.
    pub kernel_image: Range<Paddr>,
    pub modules: Vec<BootModule>,
}

impl BootInfo {
    pub fn payload_ranges(&self) -> Vec<Range<Paddr>> {
        self.modules
            .iter()
            .map(|m| page_align_down(m.start)..page_align_up(m.end))
            .collect()
    }
}

/// Turn the loaded modules into processes ready to run. The first module
/// becomes the system executive (role 1, layer 0).
pub fn bring_up(kernel: &Kernel, boot: &BootInfo) -> Result<()> {
    let mut first: Option<Arc<Process>> = None;

    for module in &boot.modules {
        let image = unsafe {
            core::slice::from_raw_parts(
                kernel.port().frame_to_ptr(module.start),
                module.end - module.start,
            )
        };
        // give up if malformed binaries are in the payload
        let layout = elf::parse(image)?;

        let process = process_new(kernel, first.as_ref(), None)?;
        let is_first = first.is_none();
        if is_first {
            first = Some(process.clone());
        }
        info!("boot: preparing system process '{}'", module.name);

        let thread = {
            let mut inner = process.inner().write()?;
            let pid = process.pid();

            for area in &layout.areas {
                if !area.read && !area.execute {
                    continue;
                }
                let mut vflags = VmaFlags::FIXED | VmaFlags::MEMSOURCE;
                let mut pflags = PageFlags::PRESENT | PageFlags::USER;
                if area.write {
                    vflags |= VmaFlags::WRITEABLE;
                    pflags |= PageFlags::WRITE;
                }
                let kind = if area.execute {
                    vflags |= VmaFlags::EXECUTABLE;
                    VmaKind::Text
                } else {
                    VmaKind::Data
                };

                // the payload sits contiguous in physical memory; walk the
                // segment mapping page by page
                let mut virt = page_align_down(area.vaddr);
                let top = area.vaddr + area.mem_size;
                let mut phys = page_align_down(module.start + area.file_offset);
                while virt < page_align_up(top) {
                    kernel.port().map_4k(inner.page_root, virt, phys, pflags)?;
                    virt += PAGE_SIZE;
                    phys += PAGE_SIZE;
                }

                inner.space.add(
                    kernel,
                    pid,
                    page_align_down(area.vaddr),
                    page_align_up(top) - page_align_down(area.vaddr),
                    vflags,
                    kind,
                    0,
                )?;
            }

            // kernel payload binaries start in the executive layer with
            // the full rights set and a blank (all-allowed) I/O bitmap
            inner.entry = layout.entry;
            inner.layer = LAYER_EXECUTIVE;
            inner.flags |= ProcessFlags::RIGHTS_MASK;
            inner.io_bitmap = Some(vec![0u8; 8192].into_boxed_slice());

            inner.any_thread().ok_or(KernelError::Failure)?
        };

        {
            let mut regs = thread.inner().write()?;
            regs.regs.pc = layout.entry;
            regs.regs.sp = regs.stack_base;
            regs.flags |= ThreadFlags::IN_USER_MODE;
        }

        if is_first {
            kernel
                .registry()
                .role_add(kernel, &process, Role::Executive)?;
        }

        let cpu = sched::pick_queue(kernel, kernel.cpus().boot_cpu());
        sched::move_to_end(kernel, cpu, &thread);
    }

    Ok(())
}
