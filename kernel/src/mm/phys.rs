// SPDX-License-Identifier: MPL-2.0

//! Physical frame accounting.
//!
//! All free frames live on one of two descending stacks: a low stack for
//! frames under the DMA boundary and a high stack for the rest. Frames
//! holding the kernel image, the stacks themselves and the boot payload are
//! never pushed. The stacks are filled in ascending address order, so a run
//! of entries below the top descends one page at a time; contiguous
//! multi-frame requests rely on that shape.

use core::ops::Range;

use crate::config::{
    is_page_aligned, page_align_down, DMA_REGION_MARK, PAGE_SIZE, PHYS_STACK_BASE,
};
use crate::error::{KernelError, Result};
use crate::port::Port;
use crate::prelude::*;
use crate::sync::Gate;

/// Caller preference for where a frame should come from.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FramePref {
    /// Must be DMA-capable (below the boundary).
    LowOnly,
    /// Prefer the high stack, fall back to low.
    HighPreferred,
    /// No preference; the allocator picks (high first).
    Any,
}

/// Which stack a query walks.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StackRegion {
    Low,
    High,
}

struct Stacks {
    low: Vec<Paddr>,
    high: Vec<Paddr>,
    low_capacity: usize,
    high_capacity: usize,
    /// Frames pushed at boot.
    total: usize,
    /// Frames currently handed out.
    requested: usize,
}

/// The two free-frame stacks behind one gate.
pub struct PhysStacks {
    inner: Gate<Stacks>,
}

impl PhysStacks {
    /// Scan the boot memory map and classify every page of declared RAM:
    /// kernel image, stack region, payload, or free. Free frames are
    /// pushed onto the stack matching their address range.
    ///
    /// Returns the stacks and the physical region reserved to hold them.
    pub fn init(
        regions: &[Range<Paddr>],
        kernel: Range<Paddr>,
        payload: &[Range<Paddr>],
    ) -> (Self, Range<Paddr>) {
        // first pass: how many frames exist, so the stack region (one word
        // per frame, plus the fixed-size low stack) can be kept off the
        // free stacks
        let mut frame_count = 0usize;
        for region in regions {
            frame_count += (region.end - region.start) / PAGE_SIZE;
        }

        let low_capacity = DMA_REGION_MARK / PAGE_SIZE;
        let stack_bytes = (low_capacity + frame_count) * core::mem::size_of::<usize>();
        let stack_region =
            page_align_down(PHYS_STACK_BASE.saturating_sub(stack_bytes))..PHYS_STACK_BASE;

        let mut stacks = Stacks {
            low: Vec::with_capacity(low_capacity),
            high: Vec::with_capacity(frame_count),
            low_capacity,
            high_capacity: frame_count,
            total: 0,
            requested: 0,
        };

        let reserved = |frame: Paddr| {
            let in_range = |r: &Range<Paddr>| frame >= r.start && frame < r.end;
            in_range(&kernel) || in_range(&stack_region) || payload.iter().any(in_range)
        };

        for region in regions {
            let mut frame = region.start;
            let mut pushed = 0usize;
            let mut skipped = 0usize;
            while frame + PAGE_SIZE <= region.end {
                if reserved(frame) {
                    skipped += 1;
                } else if frame < DMA_REGION_MARK {
                    stacks.low.push(frame);
                    pushed += 1;
                } else {
                    stacks.high.push(frame);
                    pushed += 1;
                }
                frame += PAGE_SIZE;
            }
            debug!(
                "phys: region {:#x}..{:#x}: {} frames free, {} reserved",
                region.start, region.end, pushed, skipped
            );
        }

        stacks.total = stacks.low.len() + stacks.high.len();
        info!(
            "phys: {} frames available ({} low, {} high), stack region {:#x}..{:#x}",
            stacks.total,
            stacks.low.len(),
            stacks.high.len(),
            stack_region.start,
            stack_region.end
        );

        (
            Self {
                inner: Gate::new(stacks),
            },
            stack_region,
        )
    }

    /// Hand out a zeroed frame from the preferred stack.
    pub fn request(&self, port: &dyn Port, pref: FramePref) -> Result<Paddr> {
        let mut stacks = self.inner.write()?;
        let frame = match pref {
            FramePref::LowOnly => stacks.low.pop(),
            FramePref::HighPreferred | FramePref::Any => {
                let high = stacks.high.pop();
                if high.is_some() {
                    high
                } else {
                    stacks.low.pop()
                }
            }
        }
        .ok_or(KernelError::NoPhysPages)?;
        stacks.requested += 1;
        drop(stacks);

        // the frame may have held anything; scrub before reuse
        unsafe {
            core::ptr::write_bytes(port.frame_to_ptr(frame), 0, PAGE_SIZE);
        }
        Ok(frame)
    }

    /// Push a frame back onto the stack matching its address range.
    pub fn release(&self, frame: Paddr) -> Result<()> {
        if !is_page_aligned(frame) {
            error!("phys: returned frame {:#x} is not page aligned", frame);
            return Err(KernelError::NotPageAligned);
        }

        let mut stacks = self.inner.write()?;
        if frame < DMA_REGION_MARK {
            if stacks.low.len() >= stacks.low_capacity {
                error!("phys: low stack overflow returning {:#x}", frame);
                return Err(KernelError::PhysStackOverflow);
            }
            stacks.low.push(frame);
        } else {
            if stacks.high.len() >= stacks.high_capacity {
                error!("phys: high stack overflow returning {:#x}", frame);
                return Err(KernelError::PhysStackOverflow);
            }
            stacks.high.push(frame);
        }
        stacks.requested = stacks.requested.saturating_sub(1);
        Ok(())
    }

    /// Are there enough free frames, after reservations, to cover `bytes`?
    pub fn have_at_least(&self, bytes: usize) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }
        let stacks = self.inner.read()?;
        let needed = bytes / PAGE_SIZE + 1;
        if stacks.total - stacks.requested < needed {
            return Err(KernelError::NotEnoughPages);
        }
        Ok(())
    }

    /// Check a contiguous descending run of frames covering `bytes` sits at
    /// the top of the chosen stack.
    pub fn have_contiguous(&self, bytes: usize, region: StackRegion) -> Result<()> {
        let stacks = self.inner.read()?;
        let stack = match region {
            StackRegion::Low => &stacks.low,
            StackRegion::High => &stacks.high,
        };
        let frames = bytes / PAGE_SIZE;
        if stack.is_empty() {
            return Err(KernelError::NoPhysPages);
        }
        if stack.len() < frames {
            return Err(KernelError::NoPhysPages);
        }
        // entries below the top must each sit exactly one page lower
        let top = stack.len() - 1;
        for step in 0..frames {
            if stack[top - step] != stack[top] - step * PAGE_SIZE {
                return Err(KernelError::NotContiguous);
            }
        }
        Ok(())
    }

    /// Pop a verified contiguous run of `frames` frames; returns the lowest
    /// (base) address of the run.
    pub fn request_contiguous(
        &self,
        port: &dyn Port,
        frames: usize,
        region: StackRegion,
    ) -> Result<Paddr> {
        self.have_contiguous(frames * PAGE_SIZE, region)?;
        let mut base = 0;
        {
            let mut stacks = self.inner.write()?;
            let stack = match region {
                StackRegion::Low => &mut stacks.low,
                StackRegion::High => &mut stacks.high,
            };
            for _ in 0..frames {
                base = stack.pop().unwrap();
            }
            stacks.requested += frames;
        }
        unsafe {
            core::ptr::write_bytes(port.frame_to_ptr(base), 0, frames * PAGE_SIZE);
        }
        Ok(base)
    }

    pub fn free_frames(&self) -> usize {
        let stacks = self.inner.read().unwrap();
        stacks.low.len() + stacks.high.len()
    }

    pub fn free_low_frames(&self) -> usize {
        self.inner.read().unwrap().low.len()
    }

    pub fn free_high_frames(&self) -> usize {
        self.inner.read().unwrap().high.len()
    }

    pub fn requested_frames(&self) -> usize {
        self.inner.read().unwrap().requested
    }

    /// Snapshot of the low stack, top last. Test support for the boot
    /// integrity checks.
    pub fn low_stack_contents(&self) -> Vec<Paddr> {
        self.inner.read().unwrap().low.clone()
    }
}
