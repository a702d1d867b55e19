// SPDX-License-Identifier: MPL-2.0

//! Syscall dispatch.
//!
//! One trap vector, a number in a register, arguments in registers. The
//! frame is decoded into a typed request up front; each variant has its
//! handler module. Results return through the designated result register
//! as non-negative values, errors as negative [`KernelError`] codes.
//!
//! | number | call         |
//! |--------|--------------|
//! | 0      | exit         |
//! | 1      | fork         |
//! | 2      | kill         |
//! | 3      | thread-yield |
//! | 4      | thread-exit  |
//! | 5      | thread-fork  |
//! | 6      | thread-kill  |
//! | 7      | msg-send     |
//! | 8      | msg-recv     |
//! | 9      | privs        |
//! | 10     | info         |
//! | 11     | driver       |
//! | 12     | memory       |
//! | 13     | thread-sleep |
//! | 14     | alarm        |
//! | 15     | set-id       |
//! | 16     | debug-write  |

mod alarm;
mod debug_write;
mod driver;
mod exit;
mod fork;
mod info;
mod kill;
mod memory;
mod msg;
mod privs;
mod set_id;
mod sleep;
mod thread_ops;

pub use self::driver::{handle_irq, irq_handlers};

use crate::error::{KernelError, Result};
use crate::prelude::*;
use crate::process::Thread;
use crate::sched;

pub const SYSCALL_EXIT: u32 = 0;
pub const SYSCALL_FORK: u32 = 1;
pub const SYSCALL_KILL: u32 = 2;
pub const SYSCALL_THREAD_YIELD: u32 = 3;
pub const SYSCALL_THREAD_EXIT: u32 = 4;
pub const SYSCALL_THREAD_FORK: u32 = 5;
pub const SYSCALL_THREAD_KILL: u32 = 6;
pub const SYSCALL_MSG_SEND: u32 = 7;
pub const SYSCALL_MSG_RECV: u32 = 8;
pub const SYSCALL_PRIVS: u32 = 9;
pub const SYSCALL_INFO: u32 = 10;
pub const SYSCALL_DRIVER: u32 = 11;
pub const SYSCALL_MEMORY: u32 = 12;
pub const SYSCALL_THREAD_SLEEP: u32 = 13;
pub const SYSCALL_ALARM: u32 = 14;
pub const SYSCALL_SET_ID: u32 = 15;
pub const SYSCALL_DEBUG_WRITE: u32 = 16;

/// The register view of a trap, as preserved on the thread's kernel
/// stack by the port.
#[derive(Clone, Copy, Debug)]
pub struct SyscallFrame {
    pub number: u32,
    pub args: [usize; 5],
}

/// Reason codes for the privs call.
#[derive(Clone, Copy, Debug)]
pub enum PrivsRequest {
    LayerUp,
    ClearRights { bits: u32 },
    IoRightsRemove,
    IoRightsClear { port: u16, count: u16 },
    AcceptUnixSignals { mask: u32 },
    AcceptKernelSignals { mask: u32 },
}

/// Reason codes for the info call.
#[derive(Clone, Copy, Debug)]
pub enum InfoRequest {
    Thread { buffer: Vaddr },
    Process { buffer: Vaddr },
    Kernel { buffer: Vaddr },
    Statistics { buffer: Vaddr },
}

/// Reason codes for the driver call.
#[derive(Clone, Copy, Debug)]
pub enum DriverRequest {
    Register,
    Deregister,
    MapPhys { request: Vaddr },
    UnmapPhys { request: Vaddr },
    RegisterIrq { irq: u32 },
    DeregisterIrq { irq: u32 },
    IoRequest { request: Vaddr },
    ReqPhys { pages: usize, low: bool },
    RetPhys { base: Paddr },
}

/// Reason codes for the memory call.
#[derive(Clone, Copy, Debug)]
pub enum MemoryRequest {
    Create { request: Vaddr },
    Destroy { request: Vaddr },
    Resize { request: Vaddr },
    Access { request: Vaddr },
    Locate { request: Vaddr },
}

/// Reason codes for the set-id call.
#[derive(Clone, Copy, Debug)]
pub enum SetIdRequest {
    ProcessGroup { pid: u32, pgid: u32 },
    Session,
    EffectiveUser { id: u32 },
    RealUser { real: u32, effective: u32 },
    AllUser { real: u32, effective: u32, saved: u32 },
    EffectiveGroup { id: u32 },
    RealGroup { real: u32, effective: u32 },
    AllGroup { real: u32, effective: u32, saved: u32 },
    Role { role: u32 },
    WaitForRole { role: u32 },
}

/// A decoded trap.
#[derive(Clone, Copy, Debug)]
pub enum SyscallRequest {
    Exit,
    Fork,
    Kill { pid: u32 },
    ThreadYield,
    ThreadExit,
    ThreadFork,
    ThreadKill { tid: u32 },
    MsgSend { info: Vaddr },
    MsgRecv { info: Vaddr },
    Privs(PrivsRequest),
    Info(InfoRequest),
    Driver(DriverRequest),
    Memory(MemoryRequest),
    ThreadSleep { ticks: u32 },
    Alarm { ticks: u32 },
    SetId(SetIdRequest),
    DebugWrite { buffer: Vaddr, length: usize },
}

// sub-reason codes, part of the ABI
const PRIVS_LAYER_UP: usize = 0;
const PRIVS_RIGHTS_CLEAR: usize = 1;
const PRIVS_IORIGHTS_REMOVE: usize = 2;
const PRIVS_IORIGHTS_CLEAR: usize = 3;
const PRIVS_UNIX_SIGNALS: usize = 4;
const PRIVS_KERNEL_SIGNALS: usize = 5;

const INFO_THREAD: usize = 0;
const INFO_PROCESS: usize = 1;
const INFO_KERNEL: usize = 2;
const INFO_STATISTICS: usize = 3;

const DRIVER_REGISTER: usize = 0;
const DRIVER_DEREGISTER: usize = 1;
const DRIVER_MAP_PHYS: usize = 2;
const DRIVER_UNMAP_PHYS: usize = 3;
const DRIVER_REGISTER_IRQ: usize = 4;
const DRIVER_DEREGISTER_IRQ: usize = 5;
const DRIVER_IOREQUEST: usize = 6;
const DRIVER_REQ_PHYS: usize = 7;
const DRIVER_RET_PHYS: usize = 8;

const MEMORY_CREATE: usize = 0;
const MEMORY_DESTROY: usize = 1;
const MEMORY_RESIZE: usize = 2;
const MEMORY_ACCESS: usize = 3;
const MEMORY_LOCATE: usize = 4;

const SETID_PGID: usize = 1;
const SETID_SID: usize = 2;
const SETID_EUID: usize = 3;
const SETID_REUID: usize = 4;
const SETID_RESUID: usize = 5;
const SETID_EGID: usize = 6;
const SETID_REGID: usize = 7;
const SETID_RESGID: usize = 8;
const SETID_ROLE: usize = 9;
const SETID_WAIT_ROLE: usize = 10;

/// Turn a trap frame into a typed request.
pub fn decode(frame: &SyscallFrame) -> Result<SyscallRequest> {
    let args = frame.args;
    Ok(match frame.number {
        SYSCALL_EXIT => SyscallRequest::Exit,
        SYSCALL_FORK => SyscallRequest::Fork,
        SYSCALL_KILL => SyscallRequest::Kill { pid: args[0] as u32 },
        SYSCALL_THREAD_YIELD => SyscallRequest::ThreadYield,
        SYSCALL_THREAD_EXIT => SyscallRequest::ThreadExit,
        SYSCALL_THREAD_FORK => SyscallRequest::ThreadFork,
        SYSCALL_THREAD_KILL => SyscallRequest::ThreadKill { tid: args[0] as u32 },
        SYSCALL_MSG_SEND => SyscallRequest::MsgSend { info: args[0] },
        SYSCALL_MSG_RECV => SyscallRequest::MsgRecv { info: args[0] },
        SYSCALL_PRIVS => SyscallRequest::Privs(match args[0] {
            PRIVS_LAYER_UP => PrivsRequest::LayerUp,
            PRIVS_RIGHTS_CLEAR => PrivsRequest::ClearRights { bits: args[1] as u32 },
            PRIVS_IORIGHTS_REMOVE => PrivsRequest::IoRightsRemove,
            PRIVS_IORIGHTS_CLEAR => PrivsRequest::IoRightsClear {
                port: args[1] as u16,
                count: args[2] as u16,
            },
            PRIVS_UNIX_SIGNALS => PrivsRequest::AcceptUnixSignals { mask: args[1] as u32 },
            PRIVS_KERNEL_SIGNALS => PrivsRequest::AcceptKernelSignals { mask: args[1] as u32 },
            _ => return Err(KernelError::BadParams),
        }),
        SYSCALL_INFO => SyscallRequest::Info(match args[0] {
            INFO_THREAD => InfoRequest::Thread { buffer: args[1] },
            INFO_PROCESS => InfoRequest::Process { buffer: args[1] },
            INFO_KERNEL => InfoRequest::Kernel { buffer: args[1] },
            INFO_STATISTICS => InfoRequest::Statistics { buffer: args[1] },
            _ => return Err(KernelError::BadParams),
        }),
        SYSCALL_DRIVER => SyscallRequest::Driver(match args[0] {
            DRIVER_REGISTER => DriverRequest::Register,
            DRIVER_DEREGISTER => DriverRequest::Deregister,
            DRIVER_MAP_PHYS => DriverRequest::MapPhys { request: args[1] },
            DRIVER_UNMAP_PHYS => DriverRequest::UnmapPhys { request: args[1] },
            DRIVER_REGISTER_IRQ => DriverRequest::RegisterIrq { irq: args[1] as u32 },
            DRIVER_DEREGISTER_IRQ => DriverRequest::DeregisterIrq { irq: args[1] as u32 },
            DRIVER_IOREQUEST => DriverRequest::IoRequest { request: args[1] },
            DRIVER_REQ_PHYS => DriverRequest::ReqPhys {
                pages: args[1],
                low: args[2] != 0,
            },
            DRIVER_RET_PHYS => DriverRequest::RetPhys { base: args[1] },
            _ => return Err(KernelError::BadParams),
        }),
        SYSCALL_MEMORY => SyscallRequest::Memory(match args[0] {
            MEMORY_CREATE => MemoryRequest::Create { request: args[1] },
            MEMORY_DESTROY => MemoryRequest::Destroy { request: args[1] },
            MEMORY_RESIZE => MemoryRequest::Resize { request: args[1] },
            MEMORY_ACCESS => MemoryRequest::Access { request: args[1] },
            MEMORY_LOCATE => MemoryRequest::Locate { request: args[1] },
            _ => return Err(KernelError::BadParams),
        }),
        SYSCALL_THREAD_SLEEP => SyscallRequest::ThreadSleep { ticks: args[0] as u32 },
        SYSCALL_ALARM => SyscallRequest::Alarm { ticks: args[0] as u32 },
        SYSCALL_SET_ID => SyscallRequest::SetId(match args[0] {
            SETID_PGID => SetIdRequest::ProcessGroup {
                pid: args[1] as u32,
                pgid: args[2] as u32,
            },
            SETID_SID => SetIdRequest::Session,
            SETID_EUID => SetIdRequest::EffectiveUser { id: args[1] as u32 },
            SETID_REUID => SetIdRequest::RealUser {
                real: args[1] as u32,
                effective: args[2] as u32,
            },
            SETID_RESUID => SetIdRequest::AllUser {
                real: args[1] as u32,
                effective: args[2] as u32,
                saved: args[3] as u32,
            },
            SETID_EGID => SetIdRequest::EffectiveGroup { id: args[1] as u32 },
            SETID_REGID => SetIdRequest::RealGroup {
                real: args[1] as u32,
                effective: args[2] as u32,
            },
            SETID_RESGID => SetIdRequest::AllGroup {
                real: args[1] as u32,
                effective: args[2] as u32,
                saved: args[3] as u32,
            },
            SETID_ROLE => SetIdRequest::Role { role: args[1] as u32 },
            SETID_WAIT_ROLE => SetIdRequest::WaitForRole { role: args[1] as u32 },
            _ => return Err(KernelError::BadParams),
        }),
        SYSCALL_DEBUG_WRITE => SyscallRequest::DebugWrite {
            buffer: args[1],
            length: args[2],
        },
        _ => return Err(KernelError::NotImplemented),
    })
}

fn handle(kernel: &Kernel, current: &Arc<Thread>, request: SyscallRequest) -> Result<usize> {
    match request {
        SyscallRequest::Exit => exit::exit(kernel, current),
        SyscallRequest::Fork => fork::fork(kernel, current),
        SyscallRequest::Kill { pid } => kill::kill(kernel, current, pid),
        SyscallRequest::ThreadYield => thread_ops::yield_cpu(kernel, current),
        SyscallRequest::ThreadExit => thread_ops::thread_exit(kernel, current),
        SyscallRequest::ThreadFork => thread_ops::thread_fork(kernel, current),
        SyscallRequest::ThreadKill { tid } => thread_ops::thread_kill(kernel, current, tid),
        SyscallRequest::MsgSend { info } => msg::send(kernel, current, info),
        SyscallRequest::MsgRecv { info } => msg::recv(kernel, current, info),
        SyscallRequest::Privs(request) => privs::privs(kernel, current, request),
        SyscallRequest::Info(request) => info::info(kernel, current, request),
        SyscallRequest::Driver(request) => driver::driver(kernel, current, request),
        SyscallRequest::Memory(request) => memory::memory(kernel, current, request),
        SyscallRequest::ThreadSleep { ticks } => sleep::sleep(kernel, current, ticks),
        SyscallRequest::Alarm { ticks } => alarm::alarm(kernel, current, ticks),
        SyscallRequest::SetId(request) => set_id::set_id(kernel, current, request),
        SyscallRequest::DebugWrite { buffer, length } => {
            debug_write::debug_write(kernel, current, buffer, length)
        }
    }
}

/// The trap entry: decode, run the handler, post the result to the
/// caller's result register, then re-run the pick so any higher-priority
/// thread woken as a side-effect preempts immediately.
pub fn dispatch(kernel: &Kernel, frame: &SyscallFrame) -> isize {
    let Some(current) = kernel.current_thread() else {
        return KernelError::Failure.to_syscall();
    };

    let value = match decode(frame).and_then(|request| handle(kernel, &current, request)) {
        Ok(value) => value as isize,
        Err(err) => err.to_syscall(),
    };

    // the thread may be gone (exit paths seal its gate); ignore those
    if let Ok(mut inner) = current.inner().write() {
        inner.regs.result = value;
    }

    sched::pick(kernel);
    value
}
