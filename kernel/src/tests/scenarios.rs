// SPDX-License-Identifier: MPL-2.0

//! End-to-end behaviour scenarios with literal values.

use crate::ipc::{self, MsgFlags, MsgInfo};
use crate::mm::{self, FaultAccess, FaultDecision, VmaFlags, VmaKind};
use crate::prelude::*;
use crate::process::{
    kill_process, process_new, ProcessFlags, Role, ThreadState,
};
use crate::sched;
use crate::testing::TestKernel;

const MSG_ADDR: Vaddr = 0x40_0000;
const BUF_ADDR: Vaddr = 0x41_0000;

/// Process A (layer 5, priority 10) sends to process B (layer 2,
/// priority 15): A waits for the reply, B runs on A's borrowed priority
/// until its reply hands it back.
#[test]
fn priority_inheritance_lends_and_returns() {
    let fixture = TestKernel::bare();
    let kernel = fixture.kernel();

    let b = fixture.spawn_process();
    b.inner().write().unwrap().layer = 2;
    fixture.map_user_page(&b, MSG_ADDR);
    fixture.map_user_page(&b, BUF_ADDR);
    let b_thread = fixture.first_thread(&b);
    b_thread.inner().write().unwrap().priority = 15;

    let a = fixture.spawn_process();
    a.inner().write().unwrap().layer = 5;
    fixture.map_user_page(&a, MSG_ADDR);
    fixture.map_user_page(&a, BUF_ADDR);
    let a_thread = fixture.first_thread(&a);
    a_thread.inner().write().unwrap().priority = 10;

    // B blocks in receive
    let recv = MsgInfo {
        flags: MsgFlags::GENERIC.bits(),
        recv: BUF_ADDR,
        recv_max_size: 4096,
        ..Default::default()
    };
    let b_root = b.inner().read().unwrap().page_root;
    mm::write_user_struct(kernel.port(), b_root, MSG_ADDR, &recv).unwrap();
    ipc::recv(kernel, &b_thread, MSG_ADDR).unwrap();

    // A sends generic to B
    fixture.write_user(&a, BUF_ADDR, b"request");
    let send = MsgInfo {
        pid: b.pid(),
        flags: MsgFlags::GENERIC.bits(),
        send: BUF_ADDR,
        send_size: 7,
        recv: BUF_ADDR,
        recv_max_size: 4096,
        ..Default::default()
    };
    let a_root = a.inner().read().unwrap().page_root;
    mm::write_user_struct(kernel.port(), a_root, MSG_ADDR, &send).unwrap();
    ipc::send(kernel, &a_thread, MSG_ADDR).unwrap();

    // A waits; B inherited priority 10 and queued there
    assert_eq!(a_thread.state(), ThreadState::WaitingForReply);
    {
        let inner = b_thread.inner().read().unwrap();
        assert_eq!(inner.granted.as_ref().unwrap().level, 10);
        assert_eq!(
            inner.granted.as_ref().unwrap().by,
            (a.pid(), a_thread.tid())
        );
        assert_eq!(sched::determine_priority(&inner), 10);
        assert_eq!(inner.queued_at.unwrap().1, 10);
    }

    // B replies: the grant is cleared and B re-queues at 15
    let reply = MsgInfo {
        pid: a.pid(),
        tid: a_thread.tid(),
        flags: (MsgFlags::GENERIC | MsgFlags::REPLY).bits(),
        send: BUF_ADDR,
        send_size: 5,
        ..Default::default()
    };
    mm::write_user_struct(kernel.port(), b_root, MSG_ADDR, &reply).unwrap();
    ipc::send(kernel, &b_thread, MSG_ADDR).unwrap();

    {
        let inner = b_thread.inner().read().unwrap();
        assert!(inner.granted.is_none());
        assert_eq!(inner.queued_at.unwrap().1, 15);
    }
    assert_eq!(a_thread.state(), ThreadState::InRunQueue);
}

/// Fork copy-on-write: the child's first write clones the shared frame;
/// the area's refcount stays at two and each side ends up with a private
/// frame.
#[test]
fn copy_on_write_completes_with_a_private_frame() {
    let fixture = TestKernel::bare();
    let kernel = fixture.kernel();

    let parent = fixture.spawn_process();
    let data = 0x60_0000;
    {
        let mut inner = parent.inner().write().unwrap();
        let pid = parent.pid();
        inner
            .space
            .add(
                kernel,
                pid,
                data,
                0x1000,
                VmaFlags::WRITEABLE | VmaFlags::MEMSOURCE,
                VmaKind::Data,
                0,
            )
            .unwrap();
    }
    // fault the page in and fill it
    mm::resolve_user_range(kernel, &parent, data, 0x1000, FaultAccess::WRITE).unwrap();
    fixture.write_user(&parent, data, b"original contents");

    // fork: every area is linked, not copied; both sides lose the write bit
    let caller = fixture.first_thread(&parent);
    let child = process_new(kernel, Some(&parent), Some(&caller)).unwrap();
    let vma = parent.inner().read().unwrap().space.find(data).unwrap().1;
    assert_eq!(vma.refcount(), 2);

    let parent_root = parent.inner().read().unwrap().page_root;
    let child_root = child.inner().read().unwrap().page_root;
    let (parent_frame, pflags) = kernel.port().translate_user(parent_root, data).unwrap();
    assert!(!pflags.contains(crate::port::PageFlags::WRITE));

    // the child writes: clonepage
    assert_eq!(
        mm::decide(kernel, &child, data + 4, FaultAccess::WRITE | FaultAccess::USER),
        FaultDecision::ClonePage
    );
    mm::resolve_fault(kernel, &child, data + 4, FaultAccess::WRITE | FaultAccess::USER).unwrap();

    let (child_frame, cflags) = kernel.port().translate_user(child_root, data).unwrap();
    assert_ne!(child_frame, parent_frame);
    assert!(cflags.contains(crate::port::PageFlags::WRITE));
    // the copy carried the bytes across
    assert_eq!(
        fixture.read_user(&child, data, 17),
        b"original contents"
    );
    // the parent's mapping is untouched and the area still has two users
    let (still_parent_frame, _) = kernel.port().translate_user(parent_root, data).unwrap();
    assert_eq!(still_parent_frame, parent_frame);
    assert_eq!(vma.refcount(), 2);

    // the parent is now sole user of its frame: its own write just flips
    // the write bit back on
    assert_eq!(
        mm::decide(kernel, &parent, data, FaultAccess::WRITE | FaultAccess::USER),
        FaultDecision::MakeWriteable
    );
}

/// wait-for-role parks a thread until the role is registered, then the
/// registration wakes it.
#[test]
fn role_wait_parks_and_wakes() {
    let fixture = TestKernel::bare();
    let kernel = fixture.kernel();

    let q = fixture.spawn_process();
    let t = fixture.first_thread(&q);
    sched::add(kernel, 0, &t);

    // the vfs role is unassigned: T parks
    assert!(!kernel.registry().wait_for_role(kernel, &t, Role::Vfs).unwrap());
    assert_eq!(t.state(), ThreadState::Sleeping);
    assert_eq!(
        kernel.registry().snoozers_on(Role::Vfs),
        vec![(q.pid(), t.tid())]
    );

    // R registers the role: T returns to the run queue
    let r = fixture.spawn_process();
    r.inner()
        .write()
        .unwrap()
        .flags
        .insert(ProcessFlags::CAN_PLAY_ROLE);
    kernel.registry().role_add(kernel, &r, Role::Vfs).unwrap();

    assert_eq!(t.state(), ThreadState::InRunQueue);
    assert!(kernel.registry().snoozers_on(Role::Vfs).is_empty());
    assert_eq!(
        kernel.registry().role_lookup(Role::Vfs).unwrap().pid(),
        r.pid()
    );

    // a later wait finds the role already present and does not park
    let t2 = fixture.first_thread(&q);
    assert!(kernel.registry().wait_for_role(kernel, &t2, Role::Vfs).unwrap());
}

/// alarm(100): one hundred ticks later SIGALRM reaches the process; with
/// no handler receiving, it sits in the signal pool. alarm(0) cancels.
#[test]
fn alarm_fires_after_the_countdown() {
    let fixture = TestKernel::bare();
    let kernel = fixture.kernel();
    let process = fixture.spawn_process();
    let thread = fixture.first_thread(&process);
    process.inner().write().unwrap().signals.unix_accepted = 1 << (ipc::SIGALRM - 1);

    sched::add_snoozer(kernel, &thread, 100, sched::SnoozeAction::Alarm).unwrap();
    // the thread keeps running while the timer counts down
    assert_ne!(thread.state(), ThreadState::Sleeping);

    for _ in 0..99 {
        sched::tick(kernel);
    }
    let pool_count = || {
        process
            .inner()
            .read()
            .unwrap()
            .signals
            .system_pool
            .as_ref()
            .unwrap()
            .count_inuse()
    };
    assert_eq!(pool_count(), 0);
    sched::tick(kernel);
    assert_eq!(pool_count(), 1);
    assert_eq!(sched::snoozer_count(kernel, thread.pid(), thread.tid()), 0);

    // cancelling a fresh alarm removes the entry before it fires
    sched::add_snoozer(kernel, &thread, 50, sched::SnoozeAction::Alarm).unwrap();
    sched::add_snoozer(kernel, &thread, 0, sched::SnoozeAction::Alarm).unwrap();
    assert_eq!(sched::snoozer_count(kernel, thread.pid(), thread.tid()), 0);
}

/// Killing a process reparents its children to the system executive and
/// notifies the original parent with SIGCHLD.
#[test]
fn kill_reparents_children_to_the_executive() {
    let fixture = TestKernel::bare();
    let kernel = fixture.kernel();

    // the executive the orphans move to
    let executive = fixture.spawn_process();
    executive
        .inner()
        .write()
        .unwrap()
        .flags
        .insert(ProcessFlags::CAN_PLAY_ROLE);
    kernel
        .registry()
        .role_add(kernel, &executive, Role::Executive)
        .unwrap();

    let parent = fixture.spawn_process();
    let x = fixture.spawn_child(&parent);
    let y = fixture.spawn_child(&x);
    let z = fixture.spawn_child(&x);
    let x_pid = x.pid();

    let phys_free_before = kernel.phys().free_frames();
    kill_process(kernel, x_pid, None).unwrap();

    // X is gone and its gate is sealed
    assert!(kernel.registry().find(x_pid).is_none());
    assert!(x.inner().is_defunct());

    for orphan in [&y, &z] {
        let inner = orphan.inner().read().unwrap();
        assert_eq!(inner.parent, executive.pid());
        assert_eq!(inner.prev_parent, x_pid);
        assert!(executive
            .inner()
            .read()
            .unwrap()
            .children
            .contains(&orphan.pid()));
    }

    // SIGCHLD reached X's original parent
    let sigchld = parent
        .inner()
        .read()
        .unwrap()
        .signals
        .system_pool
        .as_ref()
        .unwrap()
        .handles()
        .len();
    assert_eq!(sigchld, 1);

    // nothing leaked: the kernel stacks and page tables went back
    assert!(kernel.phys().free_frames() >= phys_free_before);
}

/// Creating one process past the system cap fails cleanly: no partial
/// record, the registry untouched.
#[test]
fn process_cap_is_enforced_cleanly() {
    let fixture = TestKernel::bare();
    let kernel = fixture.kernel();

    let mut created = 0u32;
    loop {
        match process_new(kernel, None, None) {
            Ok(_) => created += 1,
            Err(err) => {
                assert_eq!(err, crate::error::KernelError::Failure);
                break;
            }
        }
        assert!(created < crate::config::PROC_MAX, "cap never enforced");
    }
    // the registry holds exactly the processes that were reported created
    assert_eq!(kernel.registry().count(), created as usize);
}

/// Cross-check: every thread in a run queue carries the queue's identity
/// in its record, and blocked threads are nowhere in the queues.
#[test]
fn queue_state_invariant_holds_through_transitions() {
    let fixture = TestKernel::bare();
    let kernel = fixture.kernel();
    let process = fixture.spawn_process();
    let thread = fixture.first_thread(&process);

    for state in [
        ThreadState::WaitingForMsg,
        ThreadState::WaitingForReply,
        ThreadState::Held,
        ThreadState::Sleeping,
    ] {
        sched::add(kernel, 0, &thread);
        {
            let inner = thread.inner().read().unwrap();
            let (cpu, priority) = inner.queued_at.unwrap();
            let present = kernel
                .cpus()
                .cpu(cpu)
                .queues
                .read()
                .unwrap()
                .level_threads(priority)
                .iter()
                .any(|t| Arc::ptr_eq(t, &thread));
            assert!(present);
            assert_eq!(inner.state, ThreadState::InRunQueue);
        }
        sched::remove(kernel, &thread, state);
        let inner = thread.inner().read().unwrap();
        assert_eq!(inner.state, state);
        assert!(inner.queued_at.is_none());
    }
}
