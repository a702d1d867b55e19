// SPDX-License-Identifier: MPL-2.0

use crate::error::{KernelError, Result};
use crate::prelude::*;
use crate::process::Thread;
use crate::sched;

/// Sleep for `ticks` scheduler ticks; zero cancels any pending sleep.
pub(super) fn sleep(kernel: &Kernel, current: &Arc<Thread>, ticks: u32) -> Result<usize> {
    match sched::add_snoozer(kernel, current, ticks, sched::SnoozeAction::Wake) {
        Ok(()) | Err(KernelError::NotFound) => Ok(0),
        Err(err) => Err(err),
    }
}
