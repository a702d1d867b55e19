// SPDX-License-Identifier: MPL-2.0

use crate::error::{KernelError, Result};
use crate::prelude::*;

pub const SUPERUSER_ID: u32 = 0;

/// The POSIX-conformant real, effective and saved-set ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdTriple {
    pub real: u32,
    pub effective: u32,
    pub saved: u32,
}

impl IdTriple {
    pub const fn all(id: u32) -> Self {
        Self {
            real: id,
            effective: id,
            saved: id,
        }
    }

    fn may_assume(&self, id: u32) -> bool {
        id == self.real || id == self.effective || id == self.saved
    }
}

/// Per-process user/group identity plus job-control ids.
#[derive(Clone, Debug)]
pub struct Credentials {
    pub uid: IdTriple,
    pub gid: IdTriple,
    pub pgid: u32,
    pub sid: u32,
    /// Supplementary POSIX group ids, inherited on fork.
    pub groups: Vec<u32>,
}

impl Credentials {
    pub fn superuser() -> Self {
        Self {
            uid: IdTriple::all(SUPERUSER_ID),
            gid: IdTriple::all(SUPERUSER_ID),
            pgid: 0,
            sid: 0,
            groups: Vec::new(),
        }
    }

    pub fn is_superuser(&self) -> bool {
        self.uid.effective == SUPERUSER_ID
    }

    /// seteuid/setegid: the new effective id must already appear in the
    /// triple unless the caller is the superuser.
    pub fn set_effective(triple: &mut IdTriple, superuser: bool, id: u32) -> Result<()> {
        if !superuser && !triple.may_assume(id) {
            return Err(KernelError::NoRights);
        }
        triple.effective = id;
        Ok(())
    }

    /// setreuid/setregid semantics: change the real (and effective) ids.
    pub fn set_real(triple: &mut IdTriple, superuser: bool, real: u32, effective: u32) -> Result<()> {
        if !superuser && !(triple.may_assume(real) && triple.may_assume(effective)) {
            return Err(KernelError::NoRights);
        }
        triple.real = real;
        triple.effective = effective;
        Ok(())
    }

    /// setresuid/setresgid: replace the whole triple.
    pub fn set_all(triple: &mut IdTriple, superuser: bool, new: IdTriple) -> Result<()> {
        if !superuser
            && !(triple.may_assume(new.real)
                && triple.may_assume(new.effective)
                && triple.may_assume(new.saved))
        {
            return Err(KernelError::NoRights);
        }
        *triple = new;
        Ok(())
    }
}
