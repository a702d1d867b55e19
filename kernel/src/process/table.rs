// SPDX-License-Identifier: MPL-2.0

//! The global process registry: the pid table, the role slots and the
//! per-role snoozer lists, all behind one gate.

use crate::config::{FIRST_PID, PROC_MAX};
use crate::error::{KernelError, Result};
use crate::prelude::*;
use crate::process::process::{Process, ProcessFlags};
use crate::process::{Pid, Tid};
use crate::sched;
use crate::sync::Gate;

/// Number of assignable roles.
pub const ROLE_COUNT: usize = 7;

/// A process's system-wide function, used for name-based IPC targeting.
/// At most one process holds each role at a time.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum Role {
    None = 0,
    Executive = 1,
    Vfs = 2,
    Pager = 3,
    NetworkStack = 4,
    ConsoleVideo = 5,
    ConsoleKeyboard = 6,
    PciManager = 7,
}

impl Role {
    pub fn from_u32(value: u32) -> Option<Role> {
        Some(match value {
            0 => Role::None,
            1 => Role::Executive,
            2 => Role::Vfs,
            3 => Role::Pager,
            4 => Role::NetworkStack,
            5 => Role::ConsoleVideo,
            6 => Role::ConsoleKeyboard,
            7 => Role::PciManager,
            _ => return None,
        })
    }

    fn slot(self) -> Option<usize> {
        match self {
            Role::None => None,
            other => Some(other as usize - 1),
        }
    }
}

struct RegistryInner {
    procs: HashMap<Pid, Arc<Process>>,
    next_pid: Pid,
    roles: [Option<Pid>; ROLE_COUNT],
    snoozers: [Vec<(Pid, Tid)>; ROLE_COUNT],
}

/// The process table and roles table, gated as one.
pub struct Registry {
    inner: Gate<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        const EMPTY: Vec<(Pid, Tid)> = Vec::new();
        Self {
            inner: Gate::new(RegistryInner {
                procs: HashMap::new(),
                next_pid: FIRST_PID,
                roles: [None; ROLE_COUNT],
                snoozers: [EMPTY; ROLE_COUNT],
            }),
        }
    }

    /// Assign the lowest free pid from the rolling cursor. The usable pid
    /// space is 1..PROC_MAX, so the table refuses before it fills.
    pub fn allocate_pid(&self) -> Result<Pid> {
        let mut inner = self.inner.write()?;
        if inner.procs.len() as u32 >= PROC_MAX - FIRST_PID {
            return Err(KernelError::Failure);
        }
        loop {
            let candidate = inner.next_pid;
            inner.next_pid += 1;
            if inner.next_pid >= PROC_MAX {
                inner.next_pid = FIRST_PID;
            }
            if !inner.procs.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
    }

    pub fn insert(&self, process: Arc<Process>) -> Result<()> {
        let mut inner = self.inner.write()?;
        if inner.procs.insert(process.pid(), process).is_some() {
            return Err(KernelError::Exists);
        }
        Ok(())
    }

    pub fn remove(&self, pid: Pid) -> Option<Arc<Process>> {
        self.inner.write().ok()?.procs.remove(&pid)
    }

    pub fn find(&self, pid: Pid) -> Option<Arc<Process>> {
        self.inner.read().ok()?.procs.get(&pid).cloned()
    }

    pub fn count(&self) -> usize {
        self.inner.read().map(|i| i.procs.len()).unwrap_or(0)
    }

    /// Snapshot of every live process, for table walks.
    pub fn processes(&self) -> Vec<Arc<Process>> {
        match self.inner.read() {
            Ok(inner) => inner.procs.values().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Confirm another process shares `pgid` (and `sid` unless zero),
    /// excluding `exclude`.
    pub fn is_valid_pgid(&self, pgid: u32, sid: u32, exclude: Pid) -> Result<()> {
        for process in self.processes() {
            if process.pid() == exclude {
                continue;
            }
            let inner = match process.inner().read() {
                Ok(inner) => inner,
                Err(_) => continue,
            };
            if inner.creds.pgid == pgid && (sid == 0 || inner.creds.sid == sid) {
                return Ok(());
            }
        }
        Err(KernelError::NotFound)
    }

    // ---------------------------- roles --------------------------------

    /// Register `process` for `role`. Requires the play-a-role right and a
    /// free slot; wakes every snoozer parked on the role.
    pub fn role_add(&self, kernel: &Kernel, process: &Arc<Process>, role: Role) -> Result<()> {
        let slot = role.slot().ok_or(KernelError::BadParams)?;
        let sleepers;
        {
            let mut inner = self.inner.write()?;
            {
                let mut proc_inner = process.inner().write()?;
                if !proc_inner.flags.contains(ProcessFlags::CAN_PLAY_ROLE) {
                    return Err(KernelError::NoRights);
                }
                if proc_inner.role != Role::None {
                    return Err(KernelError::BadParams);
                }
                if inner.roles[slot].is_some() {
                    return Err(KernelError::Exists);
                }
                inner.roles[slot] = Some(process.pid());
                proc_inner.role = role;
            }
            sleepers = core::mem::take(&mut inner.snoozers[slot]);
        }
        debug!("proc: pid {} registered role {:?}", process.pid(), role);

        // wake anyone who was sleep-waiting for this role to appear
        for (pid, tid) in sleepers {
            if let Some(thread) = self
                .find(pid)
                .and_then(|p| p.inner().read().ok()?.find_thread(tid))
            {
                if let Ok(mut t) = thread.inner().write() {
                    t.waiting_for_role = None;
                }
                let cpu = thread.inner().read().map(|t| t.cpu).unwrap_or(0);
                sched::add(kernel, cpu, &thread);
            }
        }
        Ok(())
    }

    /// Clear `role` from `process`.
    pub fn role_remove(&self, process: &Arc<Process>, role: Role) -> Result<()> {
        let slot = role.slot().ok_or(KernelError::BadParams)?;
        let mut inner = self.inner.write()?;
        let mut proc_inner = process.inner().write()?;
        if proc_inner.role != role {
            return Err(KernelError::NotFound);
        }
        inner.roles[slot] = None;
        proc_inner.role = Role::None;
        Ok(())
    }

    /// The process currently playing `role`.
    pub fn role_lookup(&self, role: Role) -> Option<Arc<Process>> {
        let slot = role.slot()?;
        let inner = self.inner.read().ok()?;
        let pid = inner.roles[slot]?;
        inner.procs.get(&pid).cloned()
    }

    /// Park `thread` until `role` is registered. Returns true if the role
    /// was already present and no parking was needed.
    pub fn wait_for_role(&self, kernel: &Kernel, thread: &Arc<Thread>, role: Role) -> Result<bool> {
        let slot = role.slot().ok_or(KernelError::BadParams)?;
        {
            let mut inner = self.inner.write()?;
            if inner.roles[slot].is_some() {
                return Ok(true);
            }
            inner.snoozers[slot].push((thread.pid(), thread.tid()));
            thread.inner().write()?.waiting_for_role = Some(role);
        }
        trace!(
            "proc: thread {}.{} sleep-waiting on role {:?}",
            thread.pid(),
            thread.tid(),
            role
        );
        sched::remove(kernel, thread, crate::process::ThreadState::Sleeping);
        Ok(false)
    }

    /// Drop any snoozer records for a dying thread.
    pub fn cancel_snoozer(&self, pid: Pid, tid: Tid) {
        if let Ok(mut inner) = self.inner.write() {
            for list in inner.snoozers.iter_mut() {
                list.retain(|entry| *entry != (pid, tid));
            }
        }
    }

    /// Pids currently parked on a role, oldest first. Test support.
    pub fn snoozers_on(&self, role: Role) -> Vec<(Pid, Tid)> {
        match role.slot() {
            Some(slot) => self
                .inner
                .read()
                .map(|i| i.snoozers[slot].clone())
                .unwrap_or_default(),
            None => Vec::new(),
        }
    }
}

use crate::process::thread::Thread;
