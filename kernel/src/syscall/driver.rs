// SPDX-License-Identifier: MPL-2.0

use crate::config::{is_page_aligned, PAGE_SIZE};
use crate::error::{KernelError, Result};
use crate::mm::{self, StackRegion, VmaFlags, VmaKind};
use crate::port::{IoPortRequest, PageFlags};
use crate::prelude::*;
use crate::process::{IrqEntry, PhysBlock, ProcessFlags, Thread, ThreadFlags};
use crate::sched;
use crate::syscall::DriverRequest;

/// A physical mapping request as userspace phrases it.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
struct PhysRequest {
    paddr: usize,
    vaddr: usize,
    size: usize,
    flags: u32,
}

/// An I/O port transfer request.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
struct PortIoRequest {
    write: u32,
    size: u8,
    _pad: [u8; 1],
    port: u16,
    data_out: u32,
    data_in: u32,
}

pub(super) fn driver(
    kernel: &Kernel,
    current: &Arc<Thread>,
    request: DriverRequest,
) -> Result<usize> {
    let process = kernel
        .registry()
        .find(current.pid())
        .ok_or(KernelError::Failure)?;

    // every driver operation needs the driver right
    if !process
        .inner()
        .read()?
        .flags
        .contains(ProcessFlags::CAN_BE_DRIVER)
    {
        return Err(KernelError::NoRights);
    }
    let root = process.inner().read()?.page_root;

    match request {
        DriverRequest::Register => {
            {
                let mut inner = current.inner().write()?;
                inner.flags |= ThreadFlags::IS_DRIVER;
                inner.priority = sched::PRIORITY_INTERRUPTS;
            }
            // re-queue into the interrupt band
            let cpu = current.inner().read()?.cpu;
            sched::move_to_end(kernel, cpu, current);
            Ok(0)
        }
        DriverRequest::Deregister => {
            {
                let mut inner = current.inner().write()?;
                inner.flags -= ThreadFlags::IS_DRIVER;
                let floor = inner.priority_low.max(sched::PRIORITY_MIN);
                inner.priority = floor;
            }
            sched::priority_calc(current, sched::PriorityRequest::Reset);
            let cpu = current.inner().read()?.cpu;
            sched::move_to_end(kernel, cpu, current);
            Ok(0)
        }
        DriverRequest::MapPhys { request } => {
            if !process
                .inner()
                .read()?
                .flags
                .contains(ProcessFlags::CAN_MAP_PHYS)
            {
                return Err(KernelError::NoRights);
            }
            let req: PhysRequest = mm::read_user_struct(kernel.port(), root, request)?;
            if !is_page_aligned(req.paddr) || !is_page_aligned(req.vaddr) {
                return Err(KernelError::NotPageAligned);
            }
            mm::check_user_range(req.vaddr, req.size)?;

            let mut vflags = VmaFlags::FIXED | VmaFlags::NOCACHE;
            let mut pflags = PageFlags::PRESENT | PageFlags::USER | PageFlags::NOCACHE;
            if req.flags & VmaFlags::WRITEABLE.bits() != 0 {
                vflags |= VmaFlags::WRITEABLE;
                pflags |= PageFlags::WRITE;
            }

            let mut inner = process.inner().write()?;
            inner.space.add(
                kernel,
                process.pid(),
                req.vaddr,
                req.size,
                vflags,
                VmaKind::Generic,
                0,
            )?;
            let mut offset = 0;
            while offset < req.size {
                kernel
                    .port()
                    .map_4k(root, req.vaddr + offset, req.paddr + offset, pflags)?;
                offset += PAGE_SIZE;
            }
            Ok(0)
        }
        DriverRequest::UnmapPhys { request } => {
            let req: PhysRequest = mm::read_user_struct(kernel.port(), root, request)?;
            let mut inner = process.inner().write()?;
            inner.space.unlink(kernel, process.pid(), req.vaddr)?;
            let mut offset = 0;
            while offset < req.size {
                let _ = kernel.port().unmap_4k(root, req.vaddr + offset)?;
                offset += PAGE_SIZE;
            }
            Ok(0)
        }
        DriverRequest::RegisterIrq { irq } => {
            let mut inner = process.inner().write()?;
            if inner.irqs.iter().any(|e| e.irq == irq) {
                return Err(KernelError::Exists);
            }
            inner.irqs.push(IrqEntry {
                irq,
                tid: current.tid(),
            });
            Ok(0)
        }
        DriverRequest::DeregisterIrq { irq } => {
            let mut inner = process.inner().write()?;
            let before = inner.irqs.len();
            inner.irqs.retain(|e| e.irq != irq);
            if inner.irqs.len() == before {
                return Err(KernelError::NotFound);
            }
            Ok(0)
        }
        DriverRequest::IoRequest { request } => {
            let req: PortIoRequest = mm::read_user_struct(kernel.port(), root, request)?;
            // a set bitmap bit denies the port
            {
                let inner = process.inner().read()?;
                let bitmap = inner.io_bitmap.as_ref().ok_or(KernelError::NoRights)?;
                let port = req.port as usize;
                if bitmap[port / 8] & (1 << (port % 8)) != 0 {
                    return Err(KernelError::NoRights);
                }
            }
            let data = kernel.port().io_port(IoPortRequest {
                write: req.write != 0,
                size: req.size,
                port: req.port,
                data_out: req.data_out,
            })?;
            let mut reply = req;
            reply.data_in = data;
            mm::write_user_struct(kernel.port(), root, request, &reply)?;
            Ok(0)
        }
        DriverRequest::ReqPhys { pages, low } => {
            if pages == 0 || pages > u16::MAX as usize {
                return Err(KernelError::BadParams);
            }
            let region = if low { StackRegion::Low } else { StackRegion::High };
            let base = kernel
                .phys()
                .request_contiguous(kernel.port(), pages, region)
                .or_else(|_| {
                    kernel
                        .phys()
                        .request_contiguous(kernel.port(), pages, StackRegion::Low)
                })?;
            process.inner().write()?.phys_blocks.push(PhysBlock {
                base,
                pages: pages as u16,
            });
            Ok(base)
        }
        DriverRequest::RetPhys { base } => {
            let mut inner = process.inner().write()?;
            let index = inner
                .phys_blocks
                .iter()
                .position(|b| b.base == base)
                .ok_or(KernelError::NotFound)?;
            let block = inner.phys_blocks.remove(index);
            drop(inner);
            for page in 0..block.pages as usize {
                kernel.phys().release(block.base + page * PAGE_SIZE)?;
            }
            Ok(0)
        }
    }
}

/// Processes with any IRQ registration against `irq`, with the handler
/// thread to poke. The port's interrupt entry uses this to route hardware
/// interrupts into driver threads.
pub fn irq_handlers(kernel: &Kernel, irq: u32) -> Vec<(Arc<crate::process::Process>, u32)> {
    let mut handlers = Vec::new();
    for process in kernel.registry().processes() {
        if let Ok(inner) = process.inner().read() {
            for entry in inner.irqs.iter().filter(|e| e.irq == irq) {
                handlers.push((process.clone(), entry.tid));
            }
        }
    }
    handlers
}

/// The port's interrupt entry: raise the irq kernel signal at every
/// registered driver process.
pub fn handle_irq(kernel: &Kernel, irq: u32) {
    for (process, _tid) in irq_handlers(kernel, irq) {
        let _ = crate::ipc::send_kernel_signal(kernel, &process, crate::ipc::SIG_KERNEL_IRQ, irq);
    }
}
