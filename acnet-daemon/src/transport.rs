//! Socket ownership and the `Wire` seam.
//!
//! The routing state machines never touch a socket directly: everything goes
//! through the [`Wire`] trait so the pools and dispatcher can be driven in
//! tests with a capture implementation. [`UdpWire`] is the production
//! implementation over the two daemon sockets.

use crate::nodetable::NodeTable;
use acnet_core::wire::{self, AcnetHeader};
use acnet_core::TrunkNode;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

/// Well-known peer UDP port.
pub const ACNET_PORT: u16 = 6801;
/// Loopback port the client command channel listens on.
pub const ACNET_CLIENT_PORT: u16 = ACNET_PORT + 1;

pub trait Wire {
    /// Fire-and-forget datagram to a peer daemon. UDP is best effort; the
    /// implementation logs and drops failures.
    fn send_to_peer(&mut self, dst: SocketAddr, frame: &[u8]);

    /// Datagram to a local client socket. The caller tracks failures (they
    /// feed the liveness accounting), so the result is reported.
    fn send_to_client(&mut self, dst: SocketAddr, frame: &[u8]) -> bool;

    fn join_group(&mut self, group: Ipv4Addr);

    fn leave_group(&mut self, group: Ipv4Addr);
}

/// Packet-dump toggles flipped by the internal debug service.
#[derive(Debug, Default, Clone, Copy)]
pub struct DumpFlags {
    pub incoming: bool,
    pub outgoing: bool,
}

/// Everything a routing operation needs besides the pool it lives in.
pub struct Ctx<'a> {
    pub wire: &'a mut dyn Wire,
    pub table: &'a mut NodeTable,
    pub dump: &'a mut DumpFlags,
    /// Monotonic milliseconds since daemon start.
    pub now_ms: u64,
    /// Wall-clock seconds since the Unix epoch.
    pub now_sec: u64,
}

impl Ctx<'_> {
    /// Route a built packet to the node the header addresses: replies go to
    /// the client side, everything else to the server side.
    pub fn send_to_network(&mut self, hdr: &AcnetHeader, payload: &[u8]) -> bool {
        let dst = if hdr.is_reply() { hdr.client } else { hdr.server };

        let Some(addr) = self.table.lookup_addr(dst) else {
            debug!(node = %dst, "dropping packet for unknown node");
            return false;
        };

        match hdr.encode(payload) {
            Ok(frame) => {
                if self.dump.outgoing {
                    dump_packet("out", hdr, payload);
                }
                self.wire.send_to_peer(addr, &frame);
                true
            }
            Err(err) => {
                warn!(%err, "could not encode outbound packet");
                false
            }
        }
    }

    /// Answer an inbound request with a terminal error reply.
    pub fn send_error_to_network(&mut self, hdr: &AcnetHeader, status: acnet_core::Status) {
        let rpy = AcnetHeader::new(
            wire::flags::RPY,
            status,
            hdr.server,
            hdr.client,
            hdr.svr_task,
            hdr.clnt_task_id,
            hdr.msg_id,
            0,
        );

        self.send_to_network(&rpy, &[]);
    }
}

/// Hex dump of a packet, gated by the debug toggles upstream.
pub fn dump_packet(dir: &str, hdr: &AcnetHeader, payload: &[u8]) {
    let hex: String = payload
        .iter()
        .take(64)
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ");

    trace!(
        dir,
        flags = hdr.flags,
        status = %hdr.status,
        server = %hdr.server,
        client = %hdr.client,
        task = %hdr.svr_task,
        msg_id = hdr.msg_id,
        len = hdr.msg_len,
        payload = %hex,
        "acnet packet"
    );
}

/// Production wire: the peer socket (0.0.0.0:6801) and the client loopback
/// socket (127.0.0.1:6802).
pub struct UdpWire {
    peer: Arc<UdpSocket>,
    client: Arc<UdpSocket>,
}

impl UdpWire {
    pub fn new(peer: Arc<UdpSocket>, client: Arc<UdpSocket>) -> Self {
        UdpWire { peer, client }
    }
}

impl Wire for UdpWire {
    fn send_to_peer(&mut self, dst: SocketAddr, frame: &[u8]) {
        if let Err(err) = self.peer.try_send_to(frame, dst) {
            debug!(%dst, %err, "peer send failed");
        }
    }

    fn send_to_client(&mut self, dst: SocketAddr, frame: &[u8]) -> bool {
        match self.client.try_send_to(frame, dst) {
            Ok(n) if n == frame.len() => true,
            Ok(_) => {
                warn!(%dst, "short write to client socket");
                false
            }
            Err(err) => {
                warn!(%dst, %err, "error writing to client socket");
                false
            }
        }
    }

    fn join_group(&mut self, group: Ipv4Addr) {
        if let Err(err) = self.peer.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED) {
            warn!(%group, %err, "couldn't join multicast group");
        } else {
            debug!(%group, "joined multicast group");
        }
    }

    fn leave_group(&mut self, group: Ipv4Addr) {
        if let Err(err) = self.peer.leave_multicast_v4(group, Ipv4Addr::UNSPECIFIED) {
            warn!(%group, %err, "couldn't drop multicast group");
        } else {
            debug!(%group, "dropped multicast group");
        }
    }
}

/// Bind a UDP socket with address reuse, non-blocking, registered with the
/// running tokio reactor.
pub fn bind_udp(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::DGRAM,
        None,
    )?;

    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;

    let std_sock: std::net::UdpSocket = socket.into();

    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

/// Deliver destination helper used when validating inbound traffic: the
/// sending node is the client side except for replies.
pub fn source_node(hdr: &AcnetHeader) -> TrunkNode {
    if hdr.is_reply() {
        hdr.server
    } else {
        hdr.client
    }
}

/// The node an inbound packet is destined for.
pub fn dest_node(hdr: &AcnetHeader) -> TrunkNode {
    if hdr.is_reply() {
        hdr.client
    } else {
        hdr.server
    }
}


/// Loopback socket address for a client port.
pub fn loopback(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}
