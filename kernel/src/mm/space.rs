// SPDX-License-Identifier: MPL-2.0

//! The per-process tree of memory areas.
//!
//! An ordered map keyed on base virtual address; two areas compare equal
//! when their ranges overlap, so insertion doubles as collision detection.
//! Linking an area bumps its refcount and records the mounting base in the
//! area's mapping pool.

use crate::config::is_page_aligned;
use crate::error::{KernelError, Result};
use crate::mm::vma::{Vma, VmaFlags, VmaKind};
use crate::prelude::*;
use crate::process::Pid;

/// One process's memory map.
pub struct AddressSpace {
    areas: BTreeMap<Vaddr, Arc<Vma>>,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self {
            areas: BTreeMap::new(),
        }
    }

    /// Would `[base, base+size)` overlap an existing area?
    fn collides(&self, base: Vaddr, size: usize) -> bool {
        if let Some((&prev_base, prev)) = self.areas.range(..=base).next_back() {
            if prev_base + prev.size() > base {
                return true;
            }
        }
        if let Some((&next_base, _)) = self.areas.range(base..).next() {
            if next_base < base + size {
                return true;
            }
        }
        false
    }

    /// Link an existing area into this tree at `base`.
    pub fn link(&mut self, kernel: &Kernel, pid: Pid, base: Vaddr, vma: &Arc<Vma>) -> Result<()> {
        let size = vma.size();
        if self.collides(base, size) {
            trace!("vmm: vma collision at {:#x}+{:#x} in pid {}", base, size, pid);
            return Err(KernelError::VmaExists);
        }
        vma.attach(kernel, pid, base)?;
        self.areas.insert(base, vma.clone());
        Ok(())
    }

    /// Create a fresh area and link it.
    pub fn add(
        &mut self,
        kernel: &Kernel,
        pid: Pid,
        base: Vaddr,
        size: usize,
        flags: VmaFlags,
        kind: VmaKind,
        token: u32,
    ) -> Result<Arc<Vma>> {
        let vma = Vma::new(kernel, flags, kind, size, token)?;
        self.link(kernel, pid, base, &vma)?;
        Ok(vma)
    }

    /// Unlink the area mounted at `base`. Destroys the area if this was
    /// its last user; returns whether that happened.
    pub fn unlink(&mut self, kernel: &Kernel, pid: Pid, base: Vaddr) -> Result<bool> {
        let vma = self.areas.remove(&base).ok_or(KernelError::NotFound)?;
        vma.detach(kernel, pid)
    }

    /// Find the area covering `addr`.
    pub fn find(&self, addr: Vaddr) -> Option<(Vaddr, Arc<Vma>)> {
        let (&base, vma) = self.areas.range(..=addr).next_back()?;
        if addr < base + vma.size() {
            Some((base, vma.clone()))
        } else {
            None
        }
    }

    /// Resize the area mounted at `base` by `change` bytes.
    pub fn resize(&mut self, base: Vaddr, change: isize) -> Result<usize> {
        let vma = self.areas.get(&base).ok_or(KernelError::NotFound)?.clone();
        let old = vma.size();
        let new = if change >= 0 {
            old + change as usize
        } else {
            old.checked_sub((-change) as usize)
                .filter(|n| *n > 0)
                .ok_or(KernelError::TooSmall)?
        };
        if change > 0 {
            // growth must not run into the next area
            if let Some((&next_base, _)) = self.areas.range(base + 1..).next() {
                if base + new > next_base {
                    return Err(KernelError::VmaExists);
                }
            }
        }
        vma.inner().write()?.size = new;
        Ok(new)
    }

    /// Rewrite the access bits of the area mounted at `base`.
    pub fn alter_access(&mut self, base: Vaddr, access: VmaFlags) -> Result<()> {
        let vma = self.areas.get(&base).ok_or(KernelError::NotFound)?;
        let mut inner = vma.inner().write()?;
        let keep = inner.flags - (VmaFlags::WRITEABLE | VmaFlags::EXECUTABLE | VmaFlags::NOCACHE | VmaFlags::SHARED);
        inner.flags = keep
            | (access & (VmaFlags::WRITEABLE | VmaFlags::EXECUTABLE | VmaFlags::NOCACHE | VmaFlags::SHARED));
        Ok(())
    }

    /// Link every area of `self` into `child` at the same bases (fork).
    pub fn duplicate_into(
        &self,
        kernel: &Kernel,
        child_pid: Pid,
        child: &mut AddressSpace,
    ) -> Result<()> {
        for (&base, vma) in self.areas.iter() {
            child.link(kernel, child_pid, base, vma)?;
        }
        Ok(())
    }

    /// Unlink everything (process teardown).
    pub fn destroy(&mut self, kernel: &Kernel, pid: Pid) -> Result<()> {
        let bases: Vec<Vaddr> = self.areas.keys().copied().collect();
        for base in bases {
            self.unlink(kernel, pid, base)?;
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Vaddr, &Arc<Vma>)> {
        self.areas.iter()
    }

    pub fn len(&self) -> usize {
        self.areas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }
}

/// Validate a user-supplied (base, size) pair for an area operation.
pub(crate) fn check_user_area(base: Vaddr, size: usize) -> Result<()> {
    use crate::config::KERNEL_SPACE_BASE;
    if !is_page_aligned(base) {
        return Err(KernelError::NotPageAligned);
    }
    if size == 0 {
        return Err(KernelError::TooSmall);
    }
    if base >= KERNEL_SPACE_BASE || base + size > KERNEL_SPACE_BASE {
        return Err(KernelError::BadAddress);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestKernel;

    fn flags() -> VmaFlags {
        VmaFlags::WRITEABLE | VmaFlags::MEMSOURCE
    }

    #[test]
    fn overlapping_ranges_collide() {
        let fixture = TestKernel::bare();
        let kernel = fixture.kernel();
        let mut space = AddressSpace::new();
        space
            .add(kernel, 1, 0x1000, 0x3000, flags(), VmaKind::Data, 0)
            .unwrap();
        // tail overlap
        assert_eq!(
            space
                .add(kernel, 1, 0x3000, 0x1000, flags(), VmaKind::Data, 0)
                .unwrap_err(),
            KernelError::VmaExists
        );
        // head overlap
        assert_eq!(
            space
                .add(kernel, 1, 0x0000, 0x2000, flags(), VmaKind::Data, 0)
                .unwrap_err(),
            KernelError::VmaExists
        );
        // flush against the end is fine
        space
            .add(kernel, 1, 0x4000, 0x1000, flags(), VmaKind::Data, 0)
            .unwrap();
    }

    #[test]
    fn find_covers_half_open_range() {
        let fixture = TestKernel::bare();
        let kernel = fixture.kernel();
        let mut space = AddressSpace::new();
        space
            .add(kernel, 1, 0x1000, 0x2000, flags(), VmaKind::Data, 0)
            .unwrap();
        assert!(space.find(0x0fff).is_none());
        assert_eq!(space.find(0x1000).unwrap().0, 0x1000);
        assert_eq!(space.find(0x2fff).unwrap().0, 0x1000);
        assert!(space.find(0x3000).is_none());
    }

    #[test]
    fn link_unlink_tracks_refcount_and_destroys_last() {
        let fixture = TestKernel::bare();
        let kernel = fixture.kernel();
        let mut parent = AddressSpace::new();
        let vma = parent
            .add(kernel, 1, 0x1000, 0x1000, flags(), VmaKind::Data, 0)
            .unwrap();
        assert_eq!(vma.refcount(), 1);

        let mut child = AddressSpace::new();
        parent.duplicate_into(kernel, 2, &mut child).unwrap();
        assert_eq!(vma.refcount(), 2);
        assert_eq!(vma.mapping_base(2), Some(0x1000));

        // refcount > 1: unlink decrements and leaves the area intact
        assert!(!child.unlink(kernel, 2, 0x1000).unwrap());
        assert_eq!(vma.refcount(), 1);

        // refcount 1: unlink destroys
        assert!(parent.unlink(kernel, 1, 0x1000).unwrap());
        assert!(vma.inner().is_defunct());
    }

    #[test]
    fn shared_area_may_mount_at_different_bases() {
        let fixture = TestKernel::bare();
        let kernel = fixture.kernel();
        let vma = Vma::new(
            kernel,
            flags() | VmaFlags::SHARED,
            VmaKind::Generic,
            0x2000,
            0,
        )
        .unwrap();
        let mut a = AddressSpace::new();
        let mut b = AddressSpace::new();
        a.link(kernel, 1, 0x10_0000, &vma).unwrap();
        b.link(kernel, 2, 0x20_0000, &vma).unwrap();
        assert_eq!(vma.mapping_base(1), Some(0x10_0000));
        assert_eq!(vma.mapping_base(2), Some(0x20_0000));
        assert_eq!(vma.refcount(), 2);
    }

    #[test]
    fn resize_respects_neighbours() {
        let fixture = TestKernel::bare();
        let kernel = fixture.kernel();
        let mut space = AddressSpace::new();
        space
            .add(kernel, 1, 0x1000, 0x1000, flags(), VmaKind::Data, 0)
            .unwrap();
        space
            .add(kernel, 1, 0x4000, 0x1000, flags(), VmaKind::Data, 0)
            .unwrap();
        assert_eq!(space.resize(0x1000, 0x2000).unwrap(), 0x3000);
        assert_eq!(
            space.resize(0x1000, 0x1000).unwrap_err(),
            KernelError::VmaExists
        );
        assert_eq!(space.resize(0x1000, -0x1000).unwrap(), 0x2000);
    }
}
