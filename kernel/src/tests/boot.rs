// SPDX-License-Identifier: MPL-2.0

use crate::boot::{self, payload, BootInfo, BootModule};
use crate::config::PAGE_SIZE;
use crate::cpu;
use crate::mm::VmaKind;
use crate::port::mock::MockPort;
use crate::port::Port;
use crate::prelude::*;
use crate::process::{Role, ThreadState};
use crate::testing::{build_elf, ElfSegment};
use crate::Kernel;

const MODULE_BASE: usize = 20 * 1024 * 1024;

fn boot_kernel_with_modules(images: &[(&str, Vec<u8>)]) -> (&'static Kernel, BootInfo) {
    let port = MockPort::leaked(32 * 1024 * 1024);

    // place the module images head to tail in high RAM, page aligned
    let mut modules = Vec::new();
    let mut cursor = MODULE_BASE;
    for (name, image) in images {
        unsafe {
            core::ptr::copy_nonoverlapping(
                image.as_ptr(),
                port.frame_to_ptr(cursor),
                image.len(),
            );
        }
        modules.push(BootModule {
            start: cursor,
            end: cursor + image.len(),
            name: name.to_string(),
        });
        cursor = crate::config::page_align_up(cursor + image.len());
    }

    let info = BootInfo {
        regions: vec![0..24 * 1024 * 1024],
        kernel_image: 4 * 1024 * 1024..8 * 1024 * 1024,
        modules,
    };
    let kernel: &'static Kernel = Box::leak(Box::new(Kernel::new(port, &info)));
    kernel.late_init().unwrap();
    cpu::set_this_cpu(0);
    cpu::set_current_token(0);
    (kernel, info)
}

fn test_executable() -> Vec<u8> {
    build_elf(
        0x10_0040,
        &[
            ElfSegment {
                vaddr: 0x10_0000,
                data: &[0x90u8; 64],
                write: false,
                execute: true,
            },
            ElfSegment {
                vaddr: 0x20_0000,
                data: &[7u8; 32],
                write: true,
                execute: false,
            },
        ],
    )
}

#[test]
fn first_module_becomes_the_executive() {
    let (kernel, info) = boot_kernel_with_modules(&[
        ("/init", test_executable()),
        ("/vfs", test_executable()),
    ]);
    boot::bring_up(kernel, &info).unwrap();

    assert_eq!(kernel.registry().count(), 2);
    let executive = kernel.registry().role_lookup(Role::Executive).unwrap();
    let exec_inner = executive.inner().read().unwrap();
    assert_eq!(exec_inner.layer, 0);
    assert_eq!(exec_inner.entry, 0x10_0040);

    // text and data areas, plus the first thread's stack area
    assert_eq!(exec_inner.space.len(), 3);
    let (_, text) = exec_inner.space.find(0x10_0000).unwrap();
    assert_eq!(text.inner().read().unwrap().kind, VmaKind::Text);
    let (_, data) = exec_inner.space.find(0x20_0000).unwrap();
    assert_eq!(data.inner().read().unwrap().kind, VmaKind::Data);
    assert!(data.flags().contains(crate::mm::VmaFlags::WRITEABLE));

    // the thread is queued and pointed at the entry
    let thread = exec_inner.any_thread().unwrap();
    assert_eq!(thread.state(), ThreadState::InRunQueue);
    assert_eq!(thread.inner().read().unwrap().regs.pc, 0x10_0040);
    drop(exec_inner);

    // siblings are children of the executive
    let exec_children = executive.inner().read().unwrap().children.clone();
    assert_eq!(exec_children.len(), 1);
}

#[test]
fn payload_frames_never_reach_the_free_stacks() {
    let image = test_executable();
    let image_len = image.len();
    let (kernel, _) = boot_kernel_with_modules(&[("/init", image)]);

    // every page under the module stays reserved
    let module_pages =
        (crate::config::page_align_up(MODULE_BASE + image_len) - MODULE_BASE) / PAGE_SIZE;
    let total_pages = 24 * 1024 * 1024 / PAGE_SIZE;
    let kernel_pages = 4 * 1024 * 1024 / PAGE_SIZE;
    let free = kernel.phys().free_frames() + kernel.phys().requested_frames();
    assert!(free <= total_pages - kernel_pages - module_pages);
}

#[test]
fn malformed_payload_aborts_bring_up() {
    let (kernel, info) =
        boot_kernel_with_modules(&[("/junk", b"this is not an executable".to_vec())]);
    assert!(boot::bring_up(kernel, &info).is_err());
}

#[test]
fn packed_payload_feeds_the_module_list() {
    let blob = payload::pack(&[("init", &test_executable()), ("vfs", b"not-elf")]);
    let modules = payload::parse(&blob).unwrap();
    assert_eq!(modules.len(), 2);

    // the first record round-trips into a bootable module
    let init = &blob[modules[0].data.clone()];
    assert!(boot::elf::parse(init).is_ok());
    assert_eq!(modules[1].name, "/vfs");
    assert!(boot::elf::parse(&blob[modules[1].data.clone()]).is_err());
}
