// SPDX-License-Identifier: MPL-2.0

//! Virtual memory areas.
//!
//! A VMA is a half-open range of a process's address space with uniform
//! access semantics. Areas are shareable: the refcount says how many
//! process trees link the area, and the mapping pool records the base
//! address each linked process placed it at (different processes may mount
//! the same shared area at different bases).

use crate::error::{KernelError, Result};
use crate::mm::pool::{Pool, PoolHandle};
use crate::prelude::*;
use crate::process::Pid;
use crate::sync::Gate;

bitflags! {
    /// Access and status bits for an area.
    pub struct VmaFlags: u32 {
        const WRITEABLE  = 1 << 0;
        /// On fault, the kernel maps a physical page itself; unset means
        /// an external userspace pager backs the area.
        const MEMSOURCE  = 1 << 1;
        const NOCACHE    = 1 << 2;
        /// Pages in this area are never swapped out.
        const FIXED      = 1 << 3;
        const EXECUTABLE = 1 << 4;
        /// Inhibit copy-on-write; all users see one set of frames.
        const SHARED     = 1 << 5;
    }
}

/// Semantic tag for an area.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum VmaKind {
    Generic,
    Text,
    Data,
    Stack,
}

/// One process's view of an area: who linked it and where.
#[derive(Clone, Copy, Debug)]
pub struct VmaMapping {
    pub pid: Pid,
    pub base: Vaddr,
}

#[derive(Debug)]
pub struct VmaInner {
    pub flags: VmaFlags,
    pub kind: VmaKind,
    pub size: usize,
    /// Private reference for the userspace pager.
    pub token: u32,
    /// Number of process trees linking this area.
    pub refcount: u32,
    mappings: Option<Pool<VmaMapping>>,
}

/// A shareable memory area behind its own gate.
#[derive(Debug)]
pub struct Vma {
    inner: Gate<VmaInner>,
}

impl Vma {
    pub fn new(
        kernel: &Kernel,
        flags: VmaFlags,
        kind: VmaKind,
        size: usize,
        token: u32,
    ) -> Result<Arc<Self>> {
        if size == 0 {
            return Err(KernelError::BadParams);
        }
        let mappings = Pool::new(kernel, 4)?;
        Ok(Arc::new(Self {
            inner: Gate::new(VmaInner {
                flags,
                kind,
                size,
                token,
                refcount: 0,
                mappings: Some(mappings),
            }),
        }))
    }

    pub fn inner(&self) -> &Gate<VmaInner> {
        &self.inner
    }

    pub fn flags(&self) -> VmaFlags {
        self.inner.read().unwrap().flags
    }

    pub fn size(&self) -> usize {
        self.inner.read().unwrap().size
    }

    pub fn refcount(&self) -> u32 {
        self.inner.read().unwrap().refcount
    }

    /// Record a new user of this area.
    pub(super) fn attach(&self, kernel: &Kernel, pid: Pid, base: Vaddr) -> Result<()> {
        let mut inner = self.inner.write()?;
        inner.refcount += 1;
        let mapping = VmaMapping { pid, base };
        inner
            .mappings
            .as_mut()
            .ok_or(KernelError::Failure)?
            .alloc(kernel, mapping)?;
        Ok(())
    }

    /// Drop a user. Returns true when that was the last link and the area
    /// should be considered destroyed; the gate is sealed in that case.
    pub(super) fn detach(&self, kernel: &Kernel, pid: Pid) -> Result<bool> {
        let mut inner = self.inner.write()?;
        let pool = inner.mappings.as_mut().ok_or(KernelError::Failure)?;
        if let Some(handle) = Self::mapping_handle(pool, pid) {
            pool.free(handle)?;
        }
        inner.refcount = inner.refcount.saturating_sub(1);
        if inner.refcount > 0 {
            return Ok(false);
        }
        let pool = inner.mappings.take().unwrap();
        pool.destroy(kernel)?;
        drop(inner);
        // seal the gate so late users fail rather than touch a dead area
        let seal = self.inner.write_destroy()?;
        drop(seal);
        Ok(true)
    }

    fn mapping_handle(pool: &Pool<VmaMapping>, pid: Pid) -> Option<PoolHandle> {
        pool.handles()
            .into_iter()
            .find(|h| pool.get(*h).map(|m| m.pid == pid).unwrap_or(false))
    }

    /// Where `pid` mounted this area, if it is a user.
    pub fn mapping_base(&self, pid: Pid) -> Option<Vaddr> {
        let inner = self.inner.read().ok()?;
        let pool = inner.mappings.as_ref()?;
        pool.handles()
            .into_iter()
            .filter_map(|h| pool.get(h).copied())
            .find(|m| m.pid == pid)
            .map(|m| m.base)
    }

    /// Snapshot of every (pid, base) user record.
    pub fn mappings(&self) -> Vec<VmaMapping> {
        match self.inner.read() {
            Ok(inner) => match inner.mappings.as_ref() {
                Some(pool) => pool
                    .handles()
                    .into_iter()
                    .filter_map(|h| pool.get(h).copied())
                    .collect(),
                None => Vec::new(),
            },
            Err(_) => Vec::new(),
        }
    }
}
