// SPDX-License-Identifier: MPL-2.0

#![allow(unused)]

pub(crate) use alloc::{
    boxed::Box,
    collections::{BTreeMap, VecDeque},
    string::{String, ToString},
    sync::{Arc, Weak},
    vec,
    vec::Vec,
};
pub(crate) use core::fmt::Debug;

pub(crate) use bitflags::bitflags;
pub(crate) use hashbrown::HashMap;
pub(crate) use log::{debug, error, info, trace, warn};

pub(crate) use crate::{
    config::PAGE_SIZE,
    error::{KernelError, Result},
    Kernel, Paddr, PageTableRoot, Vaddr,
};
