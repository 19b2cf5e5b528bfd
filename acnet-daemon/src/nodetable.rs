//! Trunk/node to name/address table.
//!
//! A sparse 256x256 matrix: trunk rows are allocated lazily as whole
//! 256-entry rows the first time a node on that trunk appears. The table
//! also tracks the daemon's own identity (primary IP, discovered trunk/node,
//! hostname) and the refcounted multicast memberships.

use acnet_core::{rad50, NodeName, TrunkNode};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tracing::{info, warn};

/// Lowest and highest trunk numbers that map to IPv4 segments.
pub const MIN_TRUNK: u8 = 9;
pub const MAX_TRUNK: u8 = 14;

/// The well-known multicast group every daemon joins at startup.
pub const MCAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 128, 4, 1);

#[derive(Debug, Clone, Copy)]
pub struct IpEntry {
    pub name: NodeName,
    pub addr: Ipv4Addr,
    pub port: u16,
}

impl IpEntry {
    pub fn sockaddr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.addr, self.port))
    }

    pub fn is_multicast(&self) -> bool {
        self.addr.is_multicast()
    }
}

/// What a table update did; `Moved` means the node changed IP and all
/// traffic involving it must be cancelled by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrUpdate {
    Rejected,
    Unchanged,
    Moved,
}

pub struct NodeTable {
    trunks: HashMap<u8, Vec<Option<IpEntry>>>,
    peer_port: u16,
    my_ip: Option<Ipv4Addr>,
    my_node: TrunkNode,
    my_host_name: NodeName,
    last_download_sec: Option<u64>,
    mcast_refs: HashMap<Ipv4Addr, u32>,
}

impl NodeTable {
    pub fn new(my_ip: Option<Ipv4Addr>, my_host_name: NodeName, peer_port: u16) -> Self {
        let mut table = NodeTable {
            trunks: HashMap::new(),
            peer_port,
            my_ip,
            my_node: TrunkNode::default(),
            my_host_name,
            last_download_sec: None,
            mcast_refs: HashMap::new(),
        };

        // The generic multicast pseudo-node is always present.
        table.insert(
            TrunkNode::MULTICAST,
            NodeName::from_str("MCAST"),
            MCAST_GROUP,
        );
        table
    }

    fn insert(&mut self, tn: TrunkNode, name: NodeName, addr: Ipv4Addr) {
        let row = self
            .trunks
            .entry(tn.trunk())
            .or_insert_with(|| vec![None; 256]);
        let slot = &mut row[tn.node() as usize];

        match slot {
            Some(entry) => {
                if !name.is_blank() {
                    entry.name = name;
                }
                if !addr.is_unspecified() {
                    entry.addr = addr;
                    entry.port = self.peer_port;
                }
            }
            None => {
                *slot = Some(IpEntry {
                    name,
                    addr,
                    port: self.peer_port,
                });
            }
        }
    }

    fn erase(&mut self, tn: TrunkNode) {
        if let Some(row) = self.trunks.get_mut(&tn.trunk()) {
            row[tn.node() as usize] = None;
        }
    }

    pub fn entry(&self, tn: TrunkNode) -> Option<&IpEntry> {
        self.trunks
            .get(&tn.trunk())
            .and_then(|row| row[tn.node() as usize].as_ref())
    }

    /// Apply one node-table entry, with the self-identification and
    /// placeholder-substitution rules of the download protocol.
    pub fn update_addr(&mut self, tn: TrunkNode, name: NodeName, addr: Ipv4Addr) -> AddrUpdate {
        if tn.is_blank() {
            warn!("rejecting node table entry for the blank address");
            return AddrUpdate::Rejected;
        }

        let mut name = name;

        if self.my_ip == Some(addr) && !addr.is_unspecified() {
            if name == NodeName::PLACEHOLDER {
                name = self.my_host_name;
            }

            // The first entry carrying our own address tells us who we are;
            // the hostname may differ from the ACNET name, so the IP match
            // alone is enough.
            if self.my_node.is_blank() {
                info!(node = %tn, "discovered our own trunk/node");
                self.my_node = tn;
            }

            if name == self.my_host_name && self.my_node != tn {
                warn!(from = %self.my_node, to = %tn, "primary trunk/node for this machine changed");
                self.my_node = tn;
            }
        } else if name == NodeName::PLACEHOLDER {
            name = NodeName(rad50::pack("%%%%%%"));
        }

        if name.is_blank() && addr.is_unspecified() {
            self.erase(tn);
            return AddrUpdate::Unchanged;
        }

        let moved = match self.entry(tn) {
            Some(entry) => !addr.is_unspecified() && entry.addr != addr,
            None => false,
        };

        self.insert(tn, name, addr);

        if moved {
            AddrUpdate::Moved
        } else {
            AddrUpdate::Unchanged
        }
    }

    pub fn lookup_addr(&self, tn: TrunkNode) -> Option<SocketAddr> {
        self.entry(tn).map(IpEntry::sockaddr)
    }

    pub fn node_name(&self, tn: TrunkNode) -> Option<NodeName> {
        self.entry(tn).map(|entry| entry.name)
    }

    fn scan(&self, mut pred: impl FnMut(&IpEntry) -> bool) -> Option<TrunkNode> {
        for (&trunk, row) in &self.trunks {
            for (node, slot) in row.iter().enumerate() {
                if let Some(entry) = slot {
                    if pred(entry) {
                        return Some(TrunkNode::new(trunk, node as u8));
                    }
                }
            }
        }
        None
    }

    pub fn name_to_node(&self, name: NodeName) -> Option<TrunkNode> {
        self.scan(|entry| entry.name == name)
    }

    pub fn name_to_ip(&self, name: NodeName) -> Option<Ipv4Addr> {
        let tn = self.name_to_node(name)?;

        self.entry(tn).map(|entry| entry.addr)
    }

    pub fn addr_to_node(&self, addr: Ipv4Addr) -> Option<TrunkNode> {
        self.scan(|entry| entry.addr == addr)
    }

    pub fn is_multicast_node(&self, tn: TrunkNode) -> bool {
        self.entry(tn).is_some_and(IpEntry::is_multicast)
    }

    pub fn is_multicast_handle(&self, name: NodeName) -> bool {
        self.name_to_ip(name).is_some_and(|addr| addr.is_multicast())
    }

    pub fn is_this_machine(&self, tn: TrunkNode) -> bool {
        match (self.entry(tn), self.my_ip) {
            (Some(entry), Some(my_ip)) => entry.addr == my_ip,
            _ => false,
        }
    }

    pub fn trunk_exists(&self, trunk: u8) -> bool {
        self.trunks.contains_key(&trunk)
    }

    /// All trunk/node addresses currently mapped to our own IP; these are
    /// the targets of the killer-message broadcast.
    pub fn killer_targets(&self) -> Vec<TrunkNode> {
        let Some(my_ip) = self.my_ip else {
            return Vec::new();
        };
        let mut targets = Vec::new();

        for (&trunk, row) in &self.trunks {
            for (node, slot) in row.iter().enumerate() {
                if let Some(entry) = slot {
                    if entry.addr == my_ip {
                        targets.push(TrunkNode::new(trunk, node as u8));
                    }
                }
            }
        }
        targets
    }

    pub fn my_ip(&self) -> Option<Ipv4Addr> {
        self.my_ip
    }

    pub fn my_node(&self) -> TrunkNode {
        self.my_node
    }

    pub fn my_host_name(&self) -> NodeName {
        self.my_host_name
    }

    pub fn last_download_sec(&self) -> Option<u64> {
        self.last_download_sec
    }

    pub fn set_last_download(&mut self, now_sec: u64) {
        self.last_download_sec = Some(now_sec);
    }

    /// Count a new reference to a multicast group. Returns true when this is
    /// the first reference and the OS group must actually be joined.
    pub fn mcast_add_ref(&mut self, group: Ipv4Addr) -> bool {
        let count = self.mcast_refs.entry(group).or_insert(0);

        *count += 1;
        *count == 1
    }

    /// Drop a reference. Returns true when it was the last one and the OS
    /// group must be left.
    pub fn mcast_drop_ref(&mut self, group: Ipv4Addr) -> bool {
        match self.mcast_refs.get_mut(&group) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.mcast_refs.remove(&group);
                true
            }
            None => false,
        }
    }

    pub fn mcast_ref_count(&self, group: Ipv4Addr) -> u32 {
        self.mcast_refs.get(&group).copied().unwrap_or(0)
    }
}
