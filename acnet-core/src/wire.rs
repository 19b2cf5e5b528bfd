//! ACNET packet header codec.
//!
//! The wire layout is the legacy 18-byte little-endian header:
//!
//! | offset | bytes | field |
//! |--------|-------|------------------------------------|
//! | 0      | 2     | flags |
//! | 2      | 2     | status (signed) |
//! | 4      | 1+1   | server trunk, node |
//! | 6      | 1+1   | client trunk, node |
//! | 8      | 4     | server task handle (RAD50) |
//! | 12     | 2     | client task id |
//! | 14     | 2     | message id |
//! | 16     | 2     | total length including the header |
//! | 18     | ...   | payload, padded to an even length |

use crate::types::{Status, TaskHandle, TrunkNode};
use crate::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};

/// Flag word values and masks.
pub mod flags {
    pub const USM: u16 = 0x0000;
    pub const MLT: u16 = 0x0001;
    pub const REQ: u16 = 0x0002;
    pub const RPY: u16 = 0x0004;
    pub const NBW: u16 = 0x0100;
    pub const CAN_BIT: u16 = 0x0200;
    pub const CAN: u16 = CAN_BIT | USM;
    pub const CHK: u16 = 0x0400;

    pub const TYPE_MASK: u16 = USM | REQ | RPY;
    /// The bits that distinguish a plain USM from a cancel.
    pub const USM_MASK: u16 = TYPE_MASK | CAN_BIT;
}

/// Request flag bit: the client wants multiple replies.
pub const REQ_M_MULTRPY: u16 = 0x0001;
/// Reply flag bit: this reply terminates a multiple-reply sequence.
pub const RPY_M_ENDMULT: u16 = 0x0002;

pub const HEADER_SIZE: usize = 18;

/// Largest datagram the daemon will build: a full UDP payload less the
/// IP and UDP headers.
pub const MAX_PACKET_SIZE: usize = 65534 - 20 - 8;
pub const MAX_USER_PACKET_SIZE: usize = MAX_PACKET_SIZE - HEADER_SIZE;

/// Payloads travel padded to an even byte count.
pub const fn padded_len(n: usize) -> usize {
    n + (n & 1)
}

/// Decoded ACNET packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcnetHeader {
    pub flags: u16,
    pub status: Status,
    pub server: TrunkNode,
    pub client: TrunkNode,
    pub svr_task: TaskHandle,
    pub clnt_task_id: u16,
    pub msg_id: u16,
    pub msg_len: u16,
}

impl AcnetHeader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        flags: u16,
        status: Status,
        server: TrunkNode,
        client: TrunkNode,
        svr_task: TaskHandle,
        clnt_task_id: u16,
        msg_id: u16,
        payload_len: usize,
    ) -> Self {
        AcnetHeader {
            flags,
            status,
            server,
            client,
            svr_task,
            clnt_task_id,
            msg_id,
            msg_len: (HEADER_SIZE + padded_len(payload_len)) as u16,
        }
    }

    /// Decode a header from the front of a datagram.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::TruncatedHeader(buf.len()));
        }

        let mut b = buf;
        let flags = b.get_u16_le();
        let status = Status::from_raw(b.get_i16_le());
        let s_trunk = b.get_u8();
        let s_node = b.get_u8();
        let c_trunk = b.get_u8();
        let c_node = b.get_u8();
        let svr_task = TaskHandle(b.get_u32_le());
        let clnt_task_id = b.get_u16_le();
        let msg_id = b.get_u16_le();
        let msg_len = b.get_u16_le();

        Ok(AcnetHeader {
            flags,
            status,
            server: TrunkNode::new(s_trunk, s_node),
            client: TrunkNode::new(c_trunk, c_node),
            svr_task,
            clnt_task_id,
            msg_id,
            msg_len,
        })
    }

    /// Encode the header followed by the (even-padded) payload.
    pub fn encode(&self, payload: &[u8]) -> Result<BytesMut> {
        if payload.len() > MAX_USER_PACKET_SIZE {
            return Err(Error::OversizedPayload(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + padded_len(payload.len()));

        buf.put_u16_le(self.flags);
        buf.put_i16_le(self.status.raw());
        buf.put_u8(self.server.trunk());
        buf.put_u8(self.server.node());
        buf.put_u8(self.client.trunk());
        buf.put_u8(self.client.node());
        buf.put_u32_le(self.svr_task.raw());
        buf.put_u16_le(self.clnt_task_id);
        buf.put_u16_le(self.msg_id);
        buf.put_u16_le(self.msg_len);
        buf.put_slice(payload);
        if payload.len() & 1 != 0 {
            buf.put_u8(0);
        }

        Ok(buf)
    }

    pub fn packet_type(&self) -> u16 {
        self.flags & flags::TYPE_MASK
    }

    pub fn is_request(&self) -> bool {
        self.packet_type() == flags::REQ
    }

    pub fn is_reply(&self) -> bool {
        self.packet_type() == flags::RPY
    }

    pub fn is_usm(&self) -> bool {
        self.flags & flags::USM_MASK == flags::USM
    }

    pub fn is_cancel(&self) -> bool {
        self.flags & flags::USM_MASK == flags::CAN
    }

    pub fn is_mult(&self) -> bool {
        self.flags & flags::MLT != 0
    }

    /// True when a reply terminates its request: single-shot replies always
    /// do, multiple replies on `ENDMULT` or any fatal status.
    pub fn is_emr(&self) -> bool {
        debug_assert!(self.is_reply());
        !self.is_mult() || self.status == Status::ENDMULT || self.status.is_fatal()
    }
}

/// Encode elapsed milliseconds as the legacy 48-bit triple of little-endian
/// 16-bit words.
pub fn ms_to_time48(ms: u64) -> [u8; 6] {
    let mut out = [0u8; 6];

    out[0..2].copy_from_slice(&(ms as u16).to_le_bytes());
    out[2..4].copy_from_slice(&((ms >> 16) as u16).to_le_bytes());
    out[4..6].copy_from_slice(&((ms >> 32) as u16).to_le_bytes());
    out
}
