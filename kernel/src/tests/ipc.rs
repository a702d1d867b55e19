// SPDX-License-Identifier: MPL-2.0

use crate::error::KernelError;
use crate::ipc::{self, MsgFlags, MsgInfo, MsgMultipart, RecvOutcome, SendOutcome};
use crate::mm;
use crate::prelude::*;
use crate::process::{Process, ProcessFlags, Thread, ThreadState};
use crate::testing::TestKernel;

const MSG_ADDR: Vaddr = 0x40_0000;
const BUF_ADDR: Vaddr = 0x41_0000;
const SEND_ADDR: Vaddr = 0x42_0000;

struct Peer {
    process: Arc<Process>,
    thread: Arc<Thread>,
}

fn make_peer(fixture: &TestKernel, layer: u8) -> Peer {
    let process = fixture.spawn_process();
    process.inner().write().unwrap().layer = layer;
    fixture.map_user_page(&process, MSG_ADDR);
    fixture.map_user_page(&process, BUF_ADDR);
    fixture.map_user_page(&process, SEND_ADDR);
    let thread = fixture.first_thread(&process);
    Peer { process, thread }
}

fn write_msg(fixture: &TestKernel, peer: &Peer, msg: &MsgInfo) {
    let root = peer.process.inner().read().unwrap().page_root;
    mm::write_user_struct(fixture.kernel().port(), root, MSG_ADDR, msg).unwrap();
}

fn read_msg(fixture: &TestKernel, peer: &Peer) -> MsgInfo {
    let root = peer.process.inner().read().unwrap().page_root;
    mm::read_user_struct(fixture.kernel().port(), root, MSG_ADDR).unwrap()
}

/// Put a peer into blocking receive for the given accept bits.
fn start_recv(fixture: &TestKernel, peer: &Peer, accept: MsgFlags) -> RecvOutcome {
    let msg = MsgInfo {
        flags: accept.bits(),
        recv: BUF_ADDR,
        recv_max_size: 4096,
        ..Default::default()
    };
    write_msg(fixture, peer, &msg);
    ipc::recv(fixture.kernel(), &peer.thread, MSG_ADDR).unwrap()
}

fn send_generic(
    fixture: &TestKernel,
    sender: &Peer,
    target_pid: u32,
    payload: &[u8],
    extra_flags: MsgFlags,
) -> crate::error::Result<SendOutcome> {
    fixture.write_user(&sender.process, SEND_ADDR, payload);
    let msg = MsgInfo {
        pid: target_pid,
        flags: (MsgFlags::GENERIC | extra_flags).bits(),
        send: SEND_ADDR,
        send_size: payload.len(),
        recv: BUF_ADDR,
        recv_max_size: 4096,
        ..Default::default()
    };
    write_msg(fixture, sender, &msg);
    ipc::send(fixture.kernel(), &sender.thread, MSG_ADDR)
}

#[test]
fn send_and_recv_move_the_payload() {
    let fixture = TestKernel::bare();
    let receiver = make_peer(&fixture, 1);
    let sender = make_peer(&fixture, 2);

    assert_eq!(
        start_recv(&fixture, &receiver, MsgFlags::GENERIC),
        RecvOutcome::Blocked
    );
    assert_eq!(receiver.thread.state(), ThreadState::WaitingForMsg);

    let outcome =
        send_generic(&fixture, &sender, receiver.process.pid(), b"hello kernel", MsgFlags::empty())
            .unwrap();
    assert_eq!(outcome, SendOutcome::Delivered);

    // payload landed in the receive buffer
    assert_eq!(
        fixture.read_user(&receiver.process, BUF_ADDR, 12),
        b"hello kernel"
    );
    // control blocks updated on both ends
    let rmsg = read_msg(&fixture, &receiver);
    assert_eq!(rmsg.recv_size, 12);
    assert_eq!(rmsg.pid, sender.process.pid());
    let smsg = read_msg(&fixture, &sender);
    assert_eq!(smsg.pid, receiver.process.pid());

    // the sender waits for the reply; the receiver is runnable again
    assert_eq!(sender.thread.state(), ThreadState::WaitingForReply);
    assert_eq!(
        sender.thread.inner().read().unwrap().reply_source,
        Some((receiver.process.pid(), receiver.thread.tid()))
    );
    assert_eq!(receiver.thread.state(), ThreadState::InRunQueue);
}

#[test]
fn reply_completes_the_exchange() {
    let fixture = TestKernel::bare();
    let receiver = make_peer(&fixture, 1);
    let sender = make_peer(&fixture, 2);

    start_recv(&fixture, &receiver, MsgFlags::GENERIC);
    send_generic(&fixture, &sender, receiver.process.pid(), b"ping", MsgFlags::empty()).unwrap();

    // the receiver replies to exactly the blocked sender
    fixture.write_user(&receiver.process, SEND_ADDR, b"pong");
    let reply = MsgInfo {
        pid: sender.process.pid(),
        tid: sender.thread.tid(),
        flags: (MsgFlags::GENERIC | MsgFlags::REPLY).bits(),
        send: SEND_ADDR,
        send_size: 4,
        ..Default::default()
    };
    write_msg(&fixture, &receiver, &reply);
    ipc::send(fixture.kernel(), &receiver.thread, MSG_ADDR).unwrap();

    assert_eq!(fixture.read_user(&sender.process, BUF_ADDR, 4), b"pong");
    assert_eq!(sender.thread.state(), ThreadState::InRunQueue);
    assert_eq!(sender.thread.inner().read().unwrap().reply_source, None);
}

#[test]
fn reply_to_a_thread_not_waiting_fails() {
    let fixture = TestKernel::bare();
    let bystander = make_peer(&fixture, 1);
    let replier = make_peer(&fixture, 1);

    let reply = MsgInfo {
        pid: bystander.process.pid(),
        tid: bystander.thread.tid(),
        flags: (MsgFlags::GENERIC | MsgFlags::REPLY).bits(),
        send: SEND_ADDR,
        send_size: 0,
        ..Default::default()
    };
    write_msg(&fixture, &replier, &reply);
    assert_eq!(
        ipc::send(fixture.kernel(), &replier.thread, MSG_ADDR).unwrap_err(),
        KernelError::NoReceiver
    );
}

#[test]
fn sends_do_not_flow_up_the_layers() {
    let fixture = TestKernel::bare();
    // the would-be receiver sits in a *less* privileged layer
    let receiver = make_peer(&fixture, 5);
    let sender = make_peer(&fixture, 2);

    start_recv(&fixture, &receiver, MsgFlags::GENERIC);
    assert_eq!(
        send_generic(&fixture, &sender, receiver.process.pid(), b"nope", MsgFlags::empty())
            .unwrap_err(),
        KernelError::NoReceiver
    );
}

#[test]
fn multipart_overflow_rolls_back_whole() {
    let fixture = TestKernel::bare();
    let receiver = make_peer(&fixture, 1);
    let sender = make_peer(&fixture, 2);

    // shrink the receiver's window, then remember what its buffer held
    let msg = MsgInfo {
        flags: MsgFlags::GENERIC.bits(),
        recv: BUF_ADDR,
        recv_max_size: 64,
        ..Default::default()
    };
    write_msg(&fixture, &receiver, &msg);
    ipc::recv(fixture.kernel(), &receiver.thread, MSG_ADDR).unwrap();
    let pattern = [0x5au8; 64];
    fixture.write_user(&receiver.process, BUF_ADDR, &pattern);

    // two 48-byte parts: the second overruns the 64-byte window
    fixture.write_user(&sender.process, SEND_ADDR, &[1u8; 96]);
    let parts = [
        MsgMultipart {
            size: 48,
            data: SEND_ADDR,
        },
        MsgMultipart {
            size: 48,
            data: SEND_ADDR + 48,
        },
    ];
    let table = BUF_ADDR;
    let root = sender.process.inner().read().unwrap().page_root;
    for (index, part) in parts.iter().enumerate() {
        mm::write_user_struct(
            fixture.kernel().port(),
            root,
            table + index * core::mem::size_of::<MsgMultipart>(),
            part,
        )
        .unwrap();
    }
    let msg = MsgInfo {
        pid: receiver.process.pid(),
        flags: (MsgFlags::GENERIC | MsgFlags::MULTIPART).bits(),
        send: table,
        send_size: 2,
        recv: BUF_ADDR,
        recv_max_size: 4096,
        ..Default::default()
    };
    write_msg(&fixture, &sender, &msg);

    assert_eq!(
        ipc::send(fixture.kernel(), &sender.thread, MSG_ADDR).unwrap_err(),
        KernelError::TooBig
    );
    // nothing of the oversized message landed
    assert_eq!(
        fixture.read_user(&receiver.process, BUF_ADDR, 64),
        pattern.to_vec()
    );
    // and the sender did not block
    assert_ne!(sender.thread.state(), ThreadState::WaitingForReply);
}

#[test]
fn queue_me_parks_until_a_receiver_appears() {
    let fixture = TestKernel::bare();
    let receiver = make_peer(&fixture, 1);
    let sender = make_peer(&fixture, 2);

    // nobody is receiving yet
    let outcome =
        send_generic(&fixture, &sender, receiver.process.pid(), b"later", MsgFlags::QUEUE_ME)
            .unwrap();
    assert_eq!(outcome, SendOutcome::Queued);
    assert_eq!(sender.thread.state(), ThreadState::WaitingForMsg);
    assert_eq!(
        receiver
            .process
            .inner()
            .read()
            .unwrap()
            .msg_waiting
            .as_ref()
            .unwrap()
            .count_inuse(),
        1
    );

    // the receive retries the parked sender
    start_recv(&fixture, &receiver, MsgFlags::GENERIC);
    assert_eq!(fixture.read_user(&receiver.process, BUF_ADDR, 5), b"later");
    assert_eq!(sender.thread.state(), ThreadState::WaitingForReply);
    assert_eq!(
        receiver
            .process
            .inner()
            .read()
            .unwrap()
            .msg_waiting
            .as_ref()
            .unwrap()
            .count_inuse(),
        0
    );
}

#[test]
fn unheard_signal_is_recorded_and_collected_later() {
    let fixture = TestKernel::bare();
    let target = make_peer(&fixture, 1);
    {
        let mut inner = target.process.inner().write().unwrap();
        inner.signals.unix_accepted = 1 << (ipc::SIGTERM - 1);
    }

    ipc::send_kernel_signal(fixture.kernel(), &target.process, ipc::SIGTERM, 7).unwrap();
    assert_eq!(
        target
            .process
            .inner()
            .read()
            .unwrap()
            .signals
            .system_pool
            .as_ref()
            .unwrap()
            .count_inuse(),
        1
    );

    // a receive accepting signals drains the pool without blocking
    let outcome = start_recv(&fixture, &target, MsgFlags::SIGNAL);
    assert_eq!(outcome, RecvOutcome::Delivered);
    let msg = read_msg(&fixture, &target);
    assert_eq!(msg.signal.number, ipc::SIGTERM);
    assert_eq!(msg.signal.extra, 7);
}

#[test]
fn waiting_listener_receives_a_signal_directly() {
    let fixture = TestKernel::bare();
    let target = make_peer(&fixture, 1);
    {
        let mut inner = target.process.inner().write().unwrap();
        inner.signals.unix_accepted = 1 << (ipc::SIGHUP - 1);
    }
    start_recv(&fixture, &target, MsgFlags::SIGNAL);

    ipc::send_kernel_signal(fixture.kernel(), &target.process, ipc::SIGHUP, 0).unwrap();
    // the listener woke with the signal in its control block
    assert_eq!(target.thread.state(), ThreadState::InRunQueue);
    let msg = read_msg(&fixture, &target);
    assert_eq!(msg.signal.number, ipc::SIGHUP);
}

#[test]
fn group_signal_reaches_every_member() {
    let fixture = TestKernel::bare();
    let a = make_peer(&fixture, 1);
    let b = make_peer(&fixture, 1);
    let outsider = make_peer(&fixture, 1);
    a.process.inner().write().unwrap().creds.pgid = 44;
    b.process.inner().write().unwrap().creds.pgid = 44;
    outsider.process.inner().write().unwrap().creds.pgid = 45;

    ipc::send_group_signal(fixture.kernel(), 44, None, ipc::SIGTERM, 0).unwrap();

    let queued = |peer: &Peer| {
        peer.process
            .inner()
            .read()
            .unwrap()
            .signals
            .system_pool
            .as_ref()
            .unwrap()
            .count_inuse()
    };
    assert_eq!(queued(&a), 1);
    assert_eq!(queued(&b), 1);
    assert_eq!(queued(&outsider), 0);
}

#[test]
fn fault_signal_reentry_kills_the_process() {
    let fixture = TestKernel::bare();
    let target = make_peer(&fixture, 1);
    let pid = target.process.pid();
    {
        let mut inner = target.process.inner().write().unwrap();
        inner.signals.unix_accepted = 1 << (ipc::SIGSEGV - 1);
        // a SIGSEGV handler is already in flight
        inner.signals.unix_inprogress = 1 << (ipc::SIGSEGV - 1);
    }

    ipc::send_kernel_signal(fixture.kernel(), &target.process, ipc::SIGSEGV, 0).unwrap();
    assert!(fixture.kernel().registry().find(pid).is_none());
}

#[test]
fn user_senders_need_the_unix_signal_right() {
    let fixture = TestKernel::bare();
    let target = make_peer(&fixture, 1);
    let sender = make_peer(&fixture, 1);

    assert_eq!(
        ipc::send_signal(
            fixture.kernel(),
            Some(&sender.thread),
            &target.process,
            ipc::SIGTERM,
            0
        )
        .unwrap_err(),
        KernelError::NoRights
    );

    sender
        .process
        .inner()
        .write()
        .unwrap()
        .flags
        .insert(ProcessFlags::CAN_UNIX_SIGNAL);
    ipc::send_signal(
        fixture.kernel(),
        Some(&sender.thread),
        &target.process,
        ipc::SIGTERM,
        0,
    )
    .unwrap();
}

#[test]
fn reply_can_share_an_area() {
    let fixture = TestKernel::bare();
    let receiver = make_peer(&fixture, 1);
    let sender = make_peer(&fixture, 2);

    start_recv(&fixture, &receiver, MsgFlags::GENERIC);
    send_generic(&fixture, &sender, receiver.process.pid(), b"want pages", MsgFlags::empty())
        .unwrap();

    // the replier owns an area and shares it back
    let vma = {
        let mut inner = receiver.process.inner().write().unwrap();
        let pid = receiver.process.pid();
        inner
            .space
            .add(
                fixture.kernel(),
                pid,
                0x50_0000,
                0x2000,
                crate::mm::VmaFlags::WRITEABLE
                    | crate::mm::VmaFlags::MEMSOURCE
                    | crate::mm::VmaFlags::SHARED,
                crate::mm::VmaKind::Generic,
                0,
            )
            .unwrap()
    };

    let reply = MsgInfo {
        pid: sender.process.pid(),
        tid: sender.thread.tid(),
        flags: (MsgFlags::GENERIC | MsgFlags::REPLY | MsgFlags::SHARE_VMA).bits(),
        send: SEND_ADDR,
        send_size: 0,
        mem_req: ipc::ShareRequest {
            base: 0x50_0000,
            size: 0x2000,
        },
        ..Default::default()
    };
    write_msg(&fixture, &receiver, &reply);
    ipc::send(fixture.kernel(), &receiver.thread, MSG_ADDR).unwrap();

    assert_eq!(vma.refcount(), 2);
    assert_eq!(vma.mapping_base(sender.process.pid()), Some(0x50_0000));
    let found = sender
        .process
        .inner()
        .read()
        .unwrap()
        .space
        .find(0x50_0000)
        .is_some();
    assert!(found);
}
