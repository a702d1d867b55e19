// SPDX-License-Identifier: MPL-2.0

//! Synchronous message passing and signals.
//!
//! All IPC is thread-to-thread and synchronous: a sender blocks until the
//! receiver replies, inheriting scheduling priority downwards so a
//! privileged receiver cannot be starved while a privileged sender waits.
//! Signals ride the same delivery path as messages of type `SIGNAL`.

mod message;
mod signal;

pub use self::message::{
    drain_queued_senders, find_receiver, recv, send, MsgFlags, MsgInfo, MsgMultipart,
    QueuedSender, RecvOutcome, SendOutcome, ShareRequest, SignalField,
};
pub use self::signal::{
    send_group_signal, send_kernel_signal, send_signal, QueuedSignal, SIGALRM, SIGBUS, SIGCHLD,
    SIGHUP, SIGILL, SIGINT, SIGKILL, SIGSEGV, SIGTERM, SIGUSR1, SIGUSR2, SIG_KERNEL_IRQ,
    SIG_KERNEL_PAGE_REQUEST, SIG_KERNEL_PROC_CLONED, SIG_KERNEL_PROC_EXIT_REQ,
    SIG_KERNEL_PROC_KILLED, SIG_KERNEL_THREAD_EXIT_REQ, SIG_KERNEL_THREAD_KILLED,
};
