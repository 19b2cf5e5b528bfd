//! Client command channel codec.
//!
//! Clients drive the daemon over the loopback with a compact binary
//! protocol: a 10-byte header (opcode, client handle, virtual node name, all
//! network byte order) followed by a command-specific body. Every command is
//! answered on the sender's command socket with an ack that echoes an ack
//! opcode and a status.

use crate::taskpool::GlobalStats;
use acnet_core::{Error, NodeName, Result, Status, TaskHandle, TaskId};
use bytes::{Buf, BufMut};
use std::net::Ipv4Addr;

pub const COMMAND_HEADER_SIZE: usize = 10;

/// Command opcodes as they appear on the wire.
pub mod op {
    pub const KEEP_ALIVE: u16 = 0;
    pub const CONNECT: u16 = 1;
    pub const RENAME_TASK: u16 = 2;
    pub const DISCONNECT: u16 = 3;
    pub const SEND: u16 = 4;
    pub const SEND_REQUEST: u16 = 5;
    pub const RECEIVE_REQUESTS: u16 = 6;
    pub const SEND_REPLY: u16 = 7;
    pub const CANCEL: u16 = 8;
    pub const REQUEST_ACK: u16 = 9;
    pub const ADD_NODE: u16 = 10;
    pub const NAME_LOOKUP: u16 = 11;
    pub const NODE_LOOKUP: u16 = 12;
    pub const LOCAL_NODE: u16 = 13;
    pub const TASK_PID: u16 = 14;
    pub const GLOBAL_STATS: u16 = 15;
    pub const ACK_GLOBAL_STATS: u16 = 16;
    pub const DISCONNECT_SINGLE: u16 = 17;
    pub const SEND_REQUEST_WITH_TMO: u16 = 18;
    pub const IGNORE_REQUEST: u16 = 19;
    pub const BLOCK_REQUESTS: u16 = 20;
    pub const TCP_CONNECT: u16 = 21;
    pub const DEFAULT_NODE: u16 = 22;
}

/// Ack opcodes.
pub mod ack_op {
    pub const ACK: u16 = 0;
    pub const CONNECT: u16 = 1;
    pub const SEND_REQUEST: u16 = 2;
    pub const SEND_REPLY: u16 = 3;
    pub const NAME_LOOKUP: u16 = 4;
    pub const NODE_LOOKUP: u16 = 5;
    pub const TASK_PID: u16 = 6;
    pub const GLOBAL_STATS: u16 = 7;
}

/// Asynchronous control messages pushed to a client's data socket.
pub mod client_msg {
    pub const PING: u8 = 0;
    pub const DUMP_PROCESS_INCOMING_ON: u8 = 1;
    pub const DUMP_PROCESS_INCOMING_OFF: u8 = 2;
    pub const DUMP_TASK_INCOMING_ON: u8 = 3;
    pub const DUMP_TASK_INCOMING_OFF: u8 = 4;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    pub op: u16,
    pub client_name: TaskHandle,
    pub virtual_node: NodeName,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    KeepAlive,
    Connect {
        pid: u32,
        data_port: u16,
        remote_addr: Option<Ipv4Addr>,
    },
    RenameTask {
        new_name: TaskHandle,
    },
    Disconnect,
    DisconnectSingle,
    Send {
        task: TaskHandle,
        addr: u16,
        payload: Vec<u8>,
    },
    SendRequest {
        task: TaskHandle,
        addr: u16,
        flags: u16,
        tmo_ms: Option<u32>,
        payload: Vec<u8>,
    },
    SendReply {
        rpyid: u16,
        flags: u16,
        status: Status,
        payload: Vec<u8>,
    },
    IgnoreRequest {
        rpyid: u16,
    },
    RequestAck {
        rpyid: u16,
    },
    Cancel {
        reqid: u16,
    },
    ReceiveRequests,
    BlockRequests,
    AddNode {
        addr: u16,
        ip: Ipv4Addr,
        name: NodeName,
    },
    NameLookup {
        name: NodeName,
    },
    NodeLookup {
        addr: u16,
    },
    LocalNode,
    DefaultNode,
    TaskPid,
    GlobalStats,
    Unknown {
        op: u16,
    },
}

/// Parse one datagram from the client socket.
pub fn parse(buf: &[u8]) -> Result<(CommandHeader, Command)> {
    if buf.len() < COMMAND_HEADER_SIZE {
        return Err(Error::TruncatedCommand(buf.len()));
    }

    let mut b = buf;
    let header = CommandHeader {
        op: b.get_u16(),
        client_name: TaskHandle(b.get_u32()),
        virtual_node: NodeName(b.get_u32()),
    };

    fn need(b: &[u8], n: usize, total: usize) -> Result<()> {
        if b.remaining() < n {
            Err(Error::TruncatedCommand(total))
        } else {
            Ok(())
        }
    }

    let total = buf.len();
    let command = match header.op {
        op::KEEP_ALIVE => Command::KeepAlive,
        op::CONNECT => {
            need(b, 6, total)?;
            Command::Connect {
                pid: b.get_u32(),
                data_port: b.get_u16(),
                remote_addr: None,
            }
        }
        op::TCP_CONNECT => {
            need(b, 10, total)?;
            Command::Connect {
                pid: b.get_u32(),
                data_port: b.get_u16(),
                remote_addr: Some(Ipv4Addr::from(b.get_u32())),
            }
        }
        op::RENAME_TASK => {
            need(b, 4, total)?;
            Command::RenameTask {
                new_name: TaskHandle(b.get_u32()),
            }
        }
        op::DISCONNECT => Command::Disconnect,
        op::DISCONNECT_SINGLE => Command::DisconnectSingle,
        op::SEND => {
            need(b, 6, total)?;
            Command::Send {
                task: TaskHandle(b.get_u32()),
                addr: b.get_u16(),
                payload: b.to_vec(),
            }
        }
        op::SEND_REQUEST => {
            need(b, 8, total)?;
            Command::SendRequest {
                task: TaskHandle(b.get_u32()),
                addr: b.get_u16(),
                flags: b.get_u16(),
                tmo_ms: None,
                payload: b.to_vec(),
            }
        }
        op::SEND_REQUEST_WITH_TMO => {
            need(b, 12, total)?;
            Command::SendRequest {
                task: TaskHandle(b.get_u32()),
                addr: b.get_u16(),
                flags: b.get_u16(),
                tmo_ms: Some(b.get_u32()),
                payload: b.to_vec(),
            }
        }
        op::SEND_REPLY => {
            need(b, 6, total)?;
            Command::SendReply {
                rpyid: b.get_u16(),
                flags: b.get_u16(),
                status: Status::from_raw(b.get_i16()),
                payload: b.to_vec(),
            }
        }
        op::IGNORE_REQUEST => {
            need(b, 2, total)?;
            Command::IgnoreRequest { rpyid: b.get_u16() }
        }
        op::REQUEST_ACK => {
            need(b, 2, total)?;
            Command::RequestAck { rpyid: b.get_u16() }
        }
        op::CANCEL => {
            need(b, 2, total)?;
            Command::Cancel { reqid: b.get_u16() }
        }
        op::RECEIVE_REQUESTS => Command::ReceiveRequests,
        op::BLOCK_REQUESTS => Command::BlockRequests,
        op::ADD_NODE => {
            need(b, 14, total)?;
            let ip = Ipv4Addr::from(b.get_u32());
            let _opt_flags = b.get_u32();
            let addr = b.get_u16();
            let name = NodeName(b.get_u32());

            Command::AddNode { addr, ip, name }
        }
        op::NAME_LOOKUP => {
            need(b, 4, total)?;
            Command::NameLookup {
                name: NodeName(b.get_u32()),
            }
        }
        op::NODE_LOOKUP => {
            need(b, 2, total)?;
            Command::NodeLookup { addr: b.get_u16() }
        }
        op::LOCAL_NODE => Command::LocalNode,
        op::DEFAULT_NODE => Command::DefaultNode,
        op::TASK_PID => Command::TaskPid,
        op::GLOBAL_STATS => Command::GlobalStats,
        other => Command::Unknown { op: other },
    };

    Ok((header, command))
}

fn ack_header(op: u16, status: Status) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);

    buf.put_u16(op);
    buf.put_i16(status.raw());
    buf
}

pub fn ack(status: Status) -> Vec<u8> {
    ack_header(ack_op::ACK, status)
}

pub fn ack_connect(status: Status, id: TaskId, client_name: TaskHandle) -> Vec<u8> {
    let mut buf = ack_header(ack_op::CONNECT, status);

    buf.put_u8(id.raw());
    buf.put_u32(client_name.raw());
    buf
}

pub fn ack_send_request(status: Status, reqid: u16) -> Vec<u8> {
    let mut buf = ack_header(ack_op::SEND_REQUEST, status);

    buf.put_u16(reqid);
    buf
}

pub fn ack_send_reply(status: Status, reply_flags: u16) -> Vec<u8> {
    let mut buf = ack_header(ack_op::SEND_REPLY, status);

    buf.put_u16(reply_flags);
    buf
}

pub fn ack_name_lookup(status: Status, trunk: u8, node: u8) -> Vec<u8> {
    let mut buf = ack_header(ack_op::NAME_LOOKUP, status);

    buf.put_u8(trunk);
    buf.put_u8(node);
    buf
}

pub fn ack_node_lookup(status: Status, name: NodeName) -> Vec<u8> {
    let mut buf = ack_header(ack_op::NODE_LOOKUP, status);

    buf.put_u32(name.raw());
    buf
}

pub fn ack_task_pid(status: Status, pid: u32) -> Vec<u8> {
    let mut buf = ack_header(ack_op::TASK_PID, status);

    buf.put_u32(pid);
    buf
}

pub fn ack_global_stats(status: Status, stats: &GlobalStats) -> Vec<u8> {
    let mut buf = ack_header(ack_op::GLOBAL_STATS, status);

    buf.put_u32(stats.usm_rcv);
    buf.put_u32(stats.req_rcv);
    buf.put_u32(stats.rpy_rcv);
    buf.put_u32(stats.usm_xmt);
    buf.put_u32(stats.req_xmt);
    buf.put_u32(stats.rpy_xmt);
    buf.put_u32(stats.req_q_limit);
    buf
}

/// Async control message for a client's data socket.
pub fn client_message(pid: u32, task: TaskHandle, msg_type: u8) -> Vec<u8> {
    let mut buf = Vec::with_capacity(9);

    buf.put_u32(pid);
    buf.put_u32(task.raw());
    buf.put_u8(msg_type);
    buf
}
