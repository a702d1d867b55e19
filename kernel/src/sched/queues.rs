// SPDX-License-Identifier: MPL-2.0

use crate::prelude::*;
use crate::process::Thread;
use crate::sched::PRIORITY_LEVELS;

/// One CPU's run queues: a deque per priority level plus the hint naming
/// the best (numerically lowest) level with threads waiting.
pub struct RunQueues {
    queues: [VecDeque<Arc<Thread>>; PRIORITY_LEVELS],
    pub(super) lowest_filled: usize,
    /// Threads queued on this CPU (running included).
    pub(super) queued: u32,
}

impl RunQueues {
    pub fn new() -> Self {
        Self {
            queues: core::array::from_fn(|_| VecDeque::new()),
            lowest_filled: 0,
            queued: 0,
        }
    }

    pub(super) fn push_head(&mut self, priority: u8, thread: Arc<Thread>) {
        self.queues[priority as usize].push_front(thread);
        if self.lowest_filled > priority as usize {
            self.lowest_filled = priority as usize;
        }
    }

    pub(super) fn push_tail(&mut self, priority: u8, thread: Arc<Thread>) {
        self.queues[priority as usize].push_back(thread);
        if self.lowest_filled > priority as usize {
            self.lowest_filled = priority as usize;
        }
    }

    /// Unlink a thread from its level. Returns whether it was present.
    pub(super) fn unlink(&mut self, priority: u8, thread: &Arc<Thread>) -> bool {
        let queue = &mut self.queues[priority as usize];
        if let Some(pos) = queue.iter().position(|t| Arc::ptr_eq(t, thread)) {
            queue.remove(pos);
            return true;
        }
        false
    }

    /// Head of the best filled queue.
    pub(super) fn best(&self) -> Option<Arc<Thread>> {
        self.queues[self.lowest_filled].front().cloned()
    }

    /// Walk the levels and refresh the best-filled hint.
    pub(super) fn rescan(&mut self) {
        for level in 0..PRIORITY_LEVELS {
            if !self.level_is_empty(level as u8) {
                self.lowest_filled = level;
                return;
            }
        }
        self.lowest_filled = PRIORITY_LEVELS - 1;
    }

    pub(super) fn level_is_empty(&self, priority: u8) -> bool {
        self.queues[priority as usize].is_empty()
    }

    pub fn queued_count(&self) -> u32 {
        self.queued
    }

    /// Threads at a level, head first. Test support.
    pub fn level_threads(&self, priority: u8) -> Vec<Arc<Thread>> {
        self.queues[priority as usize].iter().cloned().collect()
    }
}
