//! Semantic newtypes used throughout the daemon.
//!
//! All of these are thin wrappers over the integer the wire carries; the
//! wrapper only exists so a trunk/node can never be confused with a request
//! id or a task handle at a call site.

use crate::rad50;
use serde::{Deserialize, Serialize};
use std::fmt;

/// ACNET status word: a signed 16-bit value split into a facility code (low
/// byte) and an error number (high byte). Negative values are fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Status(i16);

impl Status {
    pub const fn of(facility: i16, err: i16) -> Self {
        Status(facility + err * 256)
    }

    pub const SUCCESS: Status = Status::of(0, 0);
    pub const PEND: Status = Status::of(1, 1);
    pub const ENDMULT: Status = Status::of(1, 2);
    pub const NLM: Status = Status::of(1, -2);
    pub const NOREMMEM: Status = Status::of(1, -3);
    pub const TMO: Status = Status::of(1, -6);
    pub const FUL: Status = Status::of(1, -7);
    pub const BUSY: Status = Status::of(1, -8);
    pub const NCN: Status = Status::of(1, -21);
    pub const IVM: Status = Status::of(1, -23);
    pub const NSR: Status = Status::of(1, -24);
    pub const REQREJ: Status = Status::of(1, -25);
    pub const NAME_IN_USE: Status = Status::of(1, -27);
    pub const NCR: Status = Status::of(1, -28);
    pub const NO_NODE: Status = Status::of(1, -30);
    pub const TRP: Status = Status::of(1, -32);
    pub const NOTASK: Status = Status::of(1, -33);
    pub const DISCONNECTED: Status = Status::of(1, -34);
    pub const LEVEL2: Status = Status::of(1, -35);
    pub const NODE_DOWN: Status = Status::of(1, -42);
    pub const BUG: Status = Status::of(1, -45);
    pub const INVARG: Status = Status::of(1, -50);

    pub const fn from_raw(raw: i16) -> Self {
        Status(raw)
    }

    pub fn raw(self) -> i16 {
        self.0
    }

    pub fn facility(self) -> i16 {
        self.0 - self.err() * 256
    }

    pub fn err(self) -> i16 {
        // Facility codes occupy the low half-byte range, so rounding to the
        // nearest multiple of 256 recovers the error number for negative
        // statuses too.
        (self.0 as i32 + 128).div_euclid(256) as i16
    }

    pub fn is_fatal(self) -> bool {
        self.0 < 0
    }

    pub fn is_success(self) -> bool {
        self == Status::SUCCESS
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} {}]", self.facility(), self.err())
    }
}

/// ACNET network address: a trunk byte selecting the segment and a node byte
/// within it. Zero is "blank"; trunk 255 is the multicast sentinel range.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TrunkNode(u16);

impl TrunkNode {
    /// The conventional multicast pseudo-node.
    pub const MULTICAST: TrunkNode = TrunkNode::new(255, 0);

    pub const fn new(trunk: u8, node: u8) -> Self {
        TrunkNode(((trunk as u16) << 8) | node as u16)
    }

    pub const fn from_raw(raw: u16) -> Self {
        TrunkNode(raw)
    }

    pub fn trunk(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn node(self) -> u8 {
        self.0 as u8
    }

    pub fn raw(self) -> u16 {
        self.0
    }

    pub fn is_blank(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for TrunkNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Opaque RAD50-encoded task handle. Zero is blank.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TaskHandle(pub u32);

impl TaskHandle {
    pub fn from_str(name: &str) -> Self {
        TaskHandle(rad50::pack(name))
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn is_blank(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", rad50::unpack(self.0))
    }
}

/// Opaque RAD50-encoded node name. Zero is blank. Interchangeable with a
/// task handle on the wire, distinct at call sites.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct NodeName(pub u32);

impl NodeName {
    /// The "about to be overwritten" marker used by node-table downloads.
    pub const PLACEHOLDER: NodeName = NodeName(0xffff_ffff);

    pub fn from_str(name: &str) -> Self {
        NodeName(rad50::pack(name))
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn is_blank(self) -> bool {
        self.0 == 0
    }
}

impl From<TaskHandle> for NodeName {
    fn from(h: TaskHandle) -> Self {
        NodeName(h.0)
    }
}

impl From<NodeName> for TaskHandle {
    fn from(n: NodeName) -> Self {
        TaskHandle(n.0)
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", rad50::unpack(self.0))
    }
}

/// Request id handed to a client; index into the request pool plus the
/// pool's random bank tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReqId(pub u16);

impl ReqId {
    pub fn raw(self) -> u16 {
        self.0
    }
}

impl fmt::Display for ReqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Reply id handed to a client; same structure as [`ReqId`] but drawn from
/// the reply pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RpyId(pub u16);

impl RpyId {
    pub fn raw(self) -> u16 {
        self.0
    }
}

impl fmt::Display for RpyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Index of a task within its virtual node's 256-slot table.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TaskId(pub u8);

impl TaskId {
    pub fn raw(self) -> u8 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_split() {
        assert_eq!(Status::SUCCESS.raw(), 0);
        assert_eq!(Status::PEND.raw(), 257);
        assert_eq!(Status::ENDMULT.raw(), 513);
        assert_eq!(Status::TMO.raw(), 1 + -6 * 256);
        assert!(Status::TMO.is_fatal());
        assert!(!Status::PEND.is_fatal());
        assert_eq!(Status::TMO.facility(), 1);
        assert_eq!(Status::TMO.err(), -6);
        assert_eq!(Status::NAME_IN_USE.err(), -27);
    }

    #[test]
    fn trunknode_parts() {
        let tn = TrunkNode::new(9, 2);
        assert_eq!(tn.trunk(), 9);
        assert_eq!(tn.node(), 2);
        assert_eq!(tn.raw(), 0x0902);
        assert!(TrunkNode::default().is_blank());
        assert_eq!(TrunkNode::MULTICAST.trunk(), 255);
    }

    #[test]
    fn handle_display_uses_rad50() {
        let h = TaskHandle::from_str("ACNET");
        assert_eq!(format!("{h}"), "ACNET");
        assert!(TaskHandle::default().is_blank());
    }
}
