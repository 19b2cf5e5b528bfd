#![forbid(unsafe_code)]

//! Shared ACNET protocol primitives.
//!
//! This crate holds everything both the daemon and its tests need to speak
//! the legacy ACNET wire protocol:
//! - the semantic newtypes (`Status`, `TrunkNode`, `TaskHandle`, ...),
//! - the RAD50 name codec behind the opaque 32-bit handles,
//! - the 18-byte packet header codec.
//!
//! Nothing in here performs I/O.

pub mod rad50;
pub mod types;
pub mod wire;

use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Decode/encode failures for the wire codec.
#[derive(Debug, Error)]
pub enum Error {
    #[error("datagram too short for an ACNET header: {0} bytes")]
    TruncatedHeader(usize),
    #[error("payload of {0} bytes exceeds the ACNET packet limit")]
    OversizedPayload(usize),
    #[error("command too short: {0} bytes")]
    TruncatedCommand(usize),
}

pub use types::{NodeName, ReqId, RpyId, Status, TaskHandle, TaskId, TrunkNode};
pub use wire::AcnetHeader;
