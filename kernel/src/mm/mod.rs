// SPDX-License-Identifier: MPL-2.0

//! Memory management: physical frame stacks, the kernel heap and its typed
//! object pools, virtual memory areas and the fault-decision engine.

mod fault;
mod heap;
mod phys;
mod pool;
mod space;
mod uaccess;
mod vma;

pub use self::fault::{decide, resolve_fault, resolve_user_range, FaultAccess, FaultDecision};
pub use self::heap::KernelHeap;
pub use self::phys::{FramePref, PhysStacks, StackRegion};
pub use self::pool::{Pool, PoolHandle};
pub use self::space::AddressSpace;
pub(crate) use self::space::check_user_area;
pub use self::uaccess::{check_user_range, copy_user_to_user, read_user_struct, write_user_struct};
pub use self::vma::{Vma, VmaFlags, VmaKind, VmaMapping};
