//! Attached-task state.
//!
//! Every client connection - local UDP, TCP-fronted remote, multicast
//! listener - and the in-process ACNET service task share one record shape;
//! the variant-specific behavior lives in [`TaskKind`]. Pool records refer
//! to tasks by [`TaskId`] and re-check the slot on every use, so a stale
//! owner reference can never dangle.

use crate::stats::{StatCounter, XmitStats};
use acnet_core::{TaskHandle, TaskId};
use std::collections::BTreeSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;

pub const MAX_TASKS: usize = 256;

/// Cap on simultaneously open, un-acked inbound requests per task.
pub const MAX_PENDING_REQUESTS: usize = 256;

/// A pid-less client must issue a command at least this often.
pub const KEEPALIVE_GRACE_SEC: u64 = 30;

/// Liveness probes run at most once a second per task.
pub const ALIVE_THROTTLE_SEC: u64 = 1;

/// Consecutive client-socket errors after which a task is written off.
pub const MAX_SOCKET_ERROR_STREAK: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// UDP client on the loopback; toggles request acceptance explicitly.
    Local { receiving: bool },
    /// TCP-fronted client on a remote machine; never receives.
    Remote { remote_addr: Ipv4Addr },
    /// Listener on a protocol multicast group; USMs only.
    Multicast { group: Ipv4Addr },
    /// The in-process ACNET service.
    Internal,
}

#[derive(Debug)]
pub struct TaskInfo {
    pub handle: TaskHandle,
    pub id: TaskId,
    pub kind: TaskKind,
    pub pid: u32,
    pub cmd_port: u16,
    pub data_port: u16,
    pub connected_sec: u64,

    pub requests: BTreeSet<u16>,
    pub replies: BTreeSet<u16>,
    pub pending_requests: usize,
    pub max_pending_requests: usize,

    pub stats: XmitStats,
    pub stat_lost_pkt: StatCounter,

    cont_socket_errors: u32,
    total_socket_errors: u32,
    last_command_sec: u64,
    last_alive_check_sec: u64,
}

impl TaskInfo {
    pub fn new(
        handle: TaskHandle,
        id: TaskId,
        kind: TaskKind,
        pid: u32,
        cmd_port: u16,
        data_port: u16,
        now_sec: u64,
    ) -> Self {
        TaskInfo {
            handle,
            id,
            kind,
            pid,
            cmd_port,
            data_port,
            connected_sec: now_sec,
            requests: BTreeSet::new(),
            replies: BTreeSet::new(),
            pending_requests: 0,
            max_pending_requests: 0,
            stats: XmitStats::default(),
            stat_lost_pkt: StatCounter::default(),
            cont_socket_errors: 0,
            total_socket_errors: 0,
            last_command_sec: now_sec,
            last_alive_check_sec: now_sec,
        }
    }

    pub fn internal(handle: TaskHandle, now_sec: u64) -> Self {
        TaskInfo::new(handle, TaskId(0), TaskKind::Internal, 0, 0, 0, now_sec)
    }

    pub fn is_internal(&self) -> bool {
        self.kind == TaskKind::Internal
    }

    pub fn accepts_usm(&self) -> bool {
        match self.kind {
            TaskKind::Local { receiving } => receiving,
            TaskKind::Remote { .. } => false,
            TaskKind::Multicast { .. } | TaskKind::Internal => true,
        }
    }

    pub fn accepts_requests(&self) -> bool {
        match self.kind {
            TaskKind::Local { receiving } => receiving,
            TaskKind::Internal => true,
            TaskKind::Remote { .. } | TaskKind::Multicast { .. } => false,
        }
    }

    pub fn is_receiving(&self) -> bool {
        self.accepts_usm() || self.accepts_requests()
    }

    /// Promiscuous handles may be shared by several tasks at once.
    pub fn is_promiscuous(&self) -> bool {
        self.is_internal()
    }

    pub fn cmd_addr(&self) -> SocketAddr {
        crate::transport::loopback(self.cmd_port)
    }

    pub fn data_addr(&self) -> SocketAddr {
        crate::transport::loopback(self.data_port)
    }

    pub fn command_received(&mut self, now_sec: u64) {
        self.last_command_sec = now_sec;
    }

    /// Track the outcome of a write to one of the client's sockets.
    pub fn note_send_result(&mut self, ok: bool) {
        if ok {
            self.cont_socket_errors = 0;
        } else {
            self.cont_socket_errors += 1;
            self.total_socket_errors += 1;
            self.stat_lost_pkt.bump();
        }
    }

    pub fn total_socket_errors(&self) -> u32 {
        self.total_socket_errors
    }

    /// Liveness check, throttled to one real probe per `throttle_sec`.
    /// Tasks that declared a pid must still exist as a process and not be
    /// drowning in socket errors; pid-less tasks live on keep-alives alone.
    pub fn still_alive(&mut self, now_sec: u64, throttle_sec: u64) -> bool {
        if self.is_internal() {
            return true;
        }

        if now_sec.saturating_sub(self.last_alive_check_sec) >= throttle_sec {
            self.last_alive_check_sec = now_sec;

            if self.pid != 0 {
                if self.cont_socket_errors > MAX_SOCKET_ERROR_STREAK {
                    return false;
                }
                if !process_exists(self.pid) {
                    return false;
                }
            } else {
                return now_sec.saturating_sub(self.last_command_sec) < KEEPALIVE_GRACE_SEC;
            }
        }

        true
    }

    /// Admission check for an inbound request.
    pub fn try_increment_pending(&mut self) -> bool {
        if self.pending_requests >= MAX_PENDING_REQUESTS {
            return false;
        }
        self.pending_requests += 1;
        self.max_pending_requests = self.max_pending_requests.max(self.pending_requests);
        true
    }

    pub fn decrement_pending(&mut self) -> bool {
        if self.pending_requests == 0 {
            return false;
        }
        self.pending_requests -= 1;
        true
    }

    /// Two commands from the same command port are the same client.
    pub fn same_connection(&self, cmd_port: u16) -> bool {
        !self.is_internal() && self.cmd_port == cmd_port
    }
}

/// Zero-signal probe stand-in: the platform exposes live pids in /proc.
fn process_exists(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}
