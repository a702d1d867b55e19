// SPDX-License-Identifier: MPL-2.0

use crate::error::{KernelError, Result};
use crate::prelude::*;
use crate::process::{Credentials, IdTriple, Role, Thread};
use crate::syscall::SetIdRequest;

/// POSIX-style identity management plus the diosix role registrations.
pub(super) fn set_id(
    kernel: &Kernel,
    current: &Arc<Thread>,
    request: SetIdRequest,
) -> Result<usize> {
    let process = kernel
        .registry()
        .find(current.pid())
        .ok_or(KernelError::Failure)?;

    match request {
        SetIdRequest::ProcessGroup { pid, pgid } => {
            // only the calling process or one of its children may move
            let target = if pid == 0 || pid == process.pid() {
                process.clone()
            } else {
                let is_child = process.inner().read()?.children.contains(&pid);
                if !is_child {
                    return Err(KernelError::NoRights);
                }
                kernel.registry().find(pid).ok_or(KernelError::NotFound)?
            };

            let pgid = if pgid == 0 { target.pid() } else { pgid };
            if pgid != target.pid() {
                // joining an existing group: it must live in this session
                let sid = target.inner().read()?.creds.sid;
                kernel.registry().is_valid_pgid(pgid, sid, target.pid())?;
            }
            target.inner().write()?.creds.pgid = pgid;
            Ok(0)
        }
        SetIdRequest::Session => {
            let pid = process.pid();
            let pgid = process.inner().read()?.creds.pgid;
            // a process-group leader with members cannot start a session
            if pgid == pid && kernel.registry().is_valid_pgid(pgid, 0, pid).is_ok() {
                return Err(KernelError::Failure);
            }
            let mut inner = process.inner().write()?;
            inner.creds.sid = pid;
            inner.creds.pgid = pid;
            Ok(pid as usize)
        }
        SetIdRequest::EffectiveUser { id } => {
            let mut inner = process.inner().write()?;
            let superuser = inner.creds.is_superuser();
            Credentials::set_effective(&mut inner.creds.uid, superuser, id)?;
            Ok(0)
        }
        SetIdRequest::RealUser { real, effective } => {
            let mut inner = process.inner().write()?;
            let superuser = inner.creds.is_superuser();
            Credentials::set_real(&mut inner.creds.uid, superuser, real, effective)?;
            Ok(0)
        }
        SetIdRequest::AllUser {
            real,
            effective,
            saved,
        } => {
            let mut inner = process.inner().write()?;
            let superuser = inner.creds.is_superuser();
            Credentials::set_all(
                &mut inner.creds.uid,
                superuser,
                IdTriple {
                    real,
                    effective,
                    saved,
                },
            )?;
            Ok(0)
        }
        SetIdRequest::EffectiveGroup { id } => {
            let mut inner = process.inner().write()?;
            let superuser = inner.creds.is_superuser();
            Credentials::set_effective(&mut inner.creds.gid, superuser, id)?;
            Ok(0)
        }
        SetIdRequest::RealGroup { real, effective } => {
            let mut inner = process.inner().write()?;
            let superuser = inner.creds.is_superuser();
            Credentials::set_real(&mut inner.creds.gid, superuser, real, effective)?;
            Ok(0)
        }
        SetIdRequest::AllGroup {
            real,
            effective,
            saved,
        } => {
            let mut inner = process.inner().write()?;
            let superuser = inner.creds.is_superuser();
            Credentials::set_all(
                &mut inner.creds.gid,
                superuser,
                IdTriple {
                    real,
                    effective,
                    saved,
                },
            )?;
            Ok(0)
        }
        SetIdRequest::Role { role } => {
            let role = Role::from_u32(role).ok_or(KernelError::BadParams)?;
            if role == Role::None {
                let held = process.inner().read()?.role;
                kernel.registry().role_remove(&process, held)?;
            } else {
                kernel.registry().role_add(kernel, &process, role)?;
            }
            Ok(0)
        }
        SetIdRequest::WaitForRole { role } => {
            let role = Role::from_u32(role).ok_or(KernelError::BadParams)?;
            kernel.registry().wait_for_role(kernel, current, role)?;
            Ok(0)
        }
    }
}
