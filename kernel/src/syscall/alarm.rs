// SPDX-License-Identifier: MPL-2.0

use crate::error::{KernelError, Result};
use crate::prelude::*;
use crate::process::Thread;
use crate::sched;

/// Deliver SIGALRM to the calling process after `ticks` scheduler ticks.
/// Zero cancels outstanding timers. The thread keeps running either way.
pub(super) fn alarm(kernel: &Kernel, current: &Arc<Thread>, ticks: u32) -> Result<usize> {
    match sched::add_snoozer(kernel, current, ticks, sched::SnoozeAction::Alarm) {
        Ok(()) | Err(KernelError::NotFound) => Ok(0),
        Err(err) => Err(err),
    }
}
