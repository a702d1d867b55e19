// SPDX-License-Identifier: MPL-2.0

//! System-wide constants.
//!
//! The layout numbers describe the fixed low-memory plan the physical frame
//! stacks assume: the kernel image sits between 4MB and 8MB, the frame
//! stacks descend from the 12MB mark, and frames below the 16MB line are
//! kept apart for DMA-capable hardware.

/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Physical mark the frame stacks descend from.
pub const PHYS_STACK_BASE: usize = 12 * 1024 * 1024;

/// Frames below this physical address belong to the DMA-capable stack.
pub const DMA_REGION_MARK: usize = 16 * 1024 * 1024;

/// Base of the kernel half of every virtual address space. User addresses
/// must fall below this line.
pub const KERNEL_SPACE_BASE: usize = 0xC000_0000;

/// Top of user space; thread stacks are carved downwards from here.
pub const USER_SPACE_TOP: usize = KERNEL_SPACE_BASE;

/// Pages reserved for each thread's user stack.
pub const THREAD_MAX_STACK_PAGES: usize = 4;

/// Kernel heap blocks are padded to a multiple of this to limit
/// fragmentation and allow in-place realloc.
pub const HEAP_BLOCK_MULTIPLE: usize = 128;

/// Reserved process/thread identifier; numbering starts after it.
pub const RESERVED_ID: u32 = 0;
pub const FIRST_PID: u32 = RESERVED_ID + 1;
pub const FIRST_TID: u32 = FIRST_PID;

/// System process/thread caps.
pub const PROC_MAX: u32 = 1024;
pub const THREAD_MAX: u32 = 1024;

/// Scheduler tick rate in Hz; one tick is 10ms.
pub const SCHED_FREQUENCY: u32 = 100;

/// Ticks a thread may hold the CPU before the scheduler rotates it out.
pub const SCHED_TIMESLICE: u32 = 10;

/// Ticks between cross-CPU maintenance passes.
pub const SCHED_CARETAKER: u32 = 100;

/// The kernel refuses to move individual messages larger than this.
pub const MSG_MAX_SIZE: usize = 4 * PAGE_SIZE;

/// Iterations a gate acquisition may spin before it is reported as a
/// probable deadlock in debug builds.
pub const GATE_SPIN_TIMEOUT: u32 = 50_000_000;

/// Highest privilege layer number (least privileged).
pub const LAYER_MAX: u8 = 255;
/// Layer reserved for the system executive.
pub const LAYER_EXECUTIVE: u8 = 0;

pub const fn page_align_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

pub const fn page_align_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

pub const fn is_page_aligned(addr: usize) -> bool {
    addr & (PAGE_SIZE - 1) == 0
}
