//! End-to-end exercises of the routing engine, driven through the capture
//! wire with a synthetic clock. Peer datagrams the daemon addresses to its
//! own node are looped back by hand, standing in for the kernel delivering
//! our own UDP traffic.

use crate::command::op;
use crate::config::DaemonConfig;
use crate::daemon::{rebind_pools, Daemon};
use crate::nodetable::NodeTable;
use crate::service;
use crate::taskpool::TaskPool;
use crate::transport::{loopback, testing::CaptureWire, Ctx, DumpFlags};
use acnet_core::wire::{flags, AcnetHeader, HEADER_SIZE, REQ_M_MULTRPY, RPY_M_ENDMULT};
use acnet_core::{NodeName, Status, TaskHandle, TaskId, TrunkNode};
use bytes::BufMut;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

const MY_IP: Ipv4Addr = Ipv4Addr::new(131, 225, 9, 10);
const PEER_IP: Ipv4Addr = Ipv4Addr::new(131, 225, 9, 2);
const OUR_NODE: TrunkNode = TrunkNode::new(9, 1);
const PEER_NODE: TrunkNode = TrunkNode::new(9, 2);

fn ack_status(frame: &[u8]) -> Status {
    Status::from_raw(i16::from_be_bytes([frame[2], frame[3]]))
}

fn cmd_frame(op_code: u16, client: TaskHandle, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(10 + body.len());

    buf.put_u16(op_code);
    buf.put_u32(client.raw());
    buf.put_u32(0);
    buf.extend_from_slice(body);
    buf
}

struct Harness {
    daemon: Daemon,
    wire: CaptureWire,
    now_ms: u64,
    now_sec: u64,
}

impl Harness {
    fn new() -> Self {
        let cfg = DaemonConfig::default();
        let mut daemon = Daemon::new(&cfg, Some(MY_IP), NodeName::from_str("CLX42"), 1_000);

        daemon
            .table
            .update_addr(OUR_NODE, NodeName::from_str("CLX42"), MY_IP);
        daemon
            .table
            .update_addr(PEER_NODE, NodeName::from_str("PEER"), PEER_IP);
        rebind_pools(&mut daemon.pools, &daemon.table);

        Harness {
            daemon,
            wire: CaptureWire::default(),
            now_ms: 0,
            now_sec: 1_000,
        }
    }

    fn advance(&mut self, ms: u64) {
        self.now_ms += ms;
        self.now_sec += ms / 1_000;
    }

    fn client_cmd(&mut self, cmd_port: u16, frame: &[u8]) {
        let src = loopback(cmd_port);

        self.daemon
            .handle_client_datagram(&mut self.wire, src, frame, self.now_ms, self.now_sec);
        self.daemon
            .drain_removed(&mut self.wire, self.now_ms, self.now_sec);
    }

    fn peer_packet(&mut self, src_ip: Ipv4Addr, frame: &[u8]) {
        let src = SocketAddr::new(IpAddr::V4(src_ip), 6801);

        self.daemon
            .handle_peer_datagram(&mut self.wire, src, frame, self.now_ms, self.now_sec);
        self.daemon
            .drain_removed(&mut self.wire, self.now_ms, self.now_sec);
    }

    /// Deliver the oldest pending peer frame back to ourselves.
    fn loop_back_peer(&mut self) {
        let (dst, frame) = self.wire.peer_sent.remove(0);

        assert_eq!(dst.ip(), IpAddr::V4(MY_IP), "frame was not self-addressed");
        self.peer_packet(MY_IP, &frame);
    }

    fn sweep(&mut self) {
        self.daemon
            .sweep_timers(&mut self.wire, self.now_ms, self.now_sec);
    }

    /// Pull every client-socket frame addressed to `port`.
    fn take_to_port(&mut self, port: u16) -> Vec<Vec<u8>> {
        let mut taken = Vec::new();

        self.wire.client_sent.retain(|(dst, frame)| {
            if dst.port() == port {
                taken.push(frame.clone());
                false
            } else {
                true
            }
        });
        taken
    }

    fn try_connect(&mut self, name: &str, cmd_port: u16, data_port: u16) -> (Status, TaskId) {
        let mut body = Vec::new();

        body.put_u32(std::process::id());
        body.put_u16(data_port);
        self.client_cmd(
            cmd_port,
            &cmd_frame(op::CONNECT, TaskHandle::from_str(name), &body),
        );

        let acks = self.take_to_port(cmd_port);
        let ack = acks.last().expect("no connect ack");

        (ack_status(ack), TaskId(ack[4]))
    }

    fn connect(&mut self, name: &str, cmd_port: u16, data_port: u16) -> TaskId {
        let (status, id) = self.try_connect(name, cmd_port, data_port);

        assert_eq!(status, Status::SUCCESS);
        id
    }

    fn receive_requests(&mut self, name: &str, cmd_port: u16) {
        self.client_cmd(
            cmd_port,
            &cmd_frame(op::RECEIVE_REQUESTS, TaskHandle::from_str(name), &[]),
        );

        let acks = self.take_to_port(cmd_port);

        assert_eq!(ack_status(acks.last().unwrap()), Status::SUCCESS);
    }

    /// Issue a request; returns the id from the ack (0 on failure).
    fn send_request(
        &mut self,
        name: &str,
        cmd_port: u16,
        target: &str,
        addr: u16,
        req_flags: u16,
        tmo_ms: u32,
        payload: &[u8],
    ) -> (Status, u16) {
        let mut body = Vec::new();

        body.put_u32(TaskHandle::from_str(target).raw());
        body.put_u16(addr);
        body.put_u16(req_flags);
        body.put_u32(tmo_ms);
        body.extend_from_slice(payload);
        self.client_cmd(
            cmd_port,
            &cmd_frame(op::SEND_REQUEST_WITH_TMO, TaskHandle::from_str(name), &body),
        );

        let acks = self.take_to_port(cmd_port);
        let ack = acks.last().expect("no request ack");

        (ack_status(ack), u16::from_be_bytes([ack[4], ack[5]]))
    }

    fn send_reply(
        &mut self,
        name: &str,
        cmd_port: u16,
        rpyid: u16,
        reply_flags: u16,
        status: Status,
        payload: &[u8],
    ) -> Status {
        let mut body = Vec::new();

        body.put_u16(rpyid);
        body.put_u16(reply_flags);
        body.put_i16(status.raw());
        body.extend_from_slice(payload);
        self.client_cmd(
            cmd_port,
            &cmd_frame(op::SEND_REPLY, TaskHandle::from_str(name), &body),
        );

        let acks = self.take_to_port(cmd_port);

        ack_status(acks.last().expect("no reply ack"))
    }

    fn pool(&self) -> &TaskPool {
        &self.daemon.pools[0]
    }
}

/// Decode the header of a captured client data frame.
fn decode(frame: &[u8]) -> AcnetHeader {
    AcnetHeader::decode(frame).expect("bad captured frame")
}

fn payload_of(frame: &[u8]) -> &[u8] {
    &frame[HEADER_SIZE..]
}

#[test]
fn usm_round_trip() {
    let mut h = Harness::new();

    h.connect("FOO", 4000, 4001);
    h.connect("BAR", 4010, 4011);
    h.receive_requests("BAR", 4010);

    let mut body = Vec::new();

    body.put_u32(TaskHandle::from_str("BAR").raw());
    body.put_u16(0); // default node
    body.extend_from_slice(b"hi");
    h.client_cmd(4000, &cmd_frame(op::SEND, TaskHandle::from_str("FOO"), &body));

    let acks = h.take_to_port(4000);

    assert_eq!(ack_status(acks.last().unwrap()), Status::SUCCESS);

    // The datagram goes out our own address; the network hands it back.
    h.loop_back_peer();

    let delivered = h.take_to_port(4011);

    assert_eq!(delivered.len(), 1);

    let hdr = decode(&delivered[0]);

    assert!(hdr.is_usm());
    assert_eq!(hdr.svr_task, TaskHandle::from_str("BAR"));
    assert_eq!(hdr.server, OUR_NODE);
    assert_eq!(&payload_of(&delivered[0])[..2], b"hi");
}

#[test]
fn usm_to_a_blocked_task_is_dropped() {
    let mut h = Harness::new();

    h.connect("FOO", 4000, 4001);
    h.connect("BAR", 4010, 4011); // never calls ReceiveRequests

    let mut body = Vec::new();

    body.put_u32(TaskHandle::from_str("BAR").raw());
    body.put_u16(0);
    body.extend_from_slice(b"hi");
    h.client_cmd(4000, &cmd_frame(op::SEND, TaskHandle::from_str("FOO"), &body));
    h.loop_back_peer();

    assert!(h.take_to_port(4011).is_empty());
}

#[test]
fn request_with_single_reply() {
    let mut h = Harness::new();

    h.connect("FOO", 4000, 4001);
    h.connect("BAR", 4010, 4011);
    h.receive_requests("BAR", 4010);

    let (status, req_id) = h.send_request("FOO", 4000, "BAR", 0, 0, 5_000, b"ping");

    assert_eq!(status, Status::SUCCESS);
    assert_ne!(req_id, 0);

    // B receives the request; the rewritten status field carries its
    // reply id.
    h.loop_back_peer();

    let delivered = h.take_to_port(4011);
    let hdr = decode(&delivered[0]);

    assert!(hdr.is_request());
    assert_eq!(hdr.msg_id, req_id);

    let rpy_id = hdr.status.raw() as u16;

    assert!(h
        .pool()
        .rpy_pool
        .get(acnet_core::RpyId(rpy_id))
        .is_some());

    // B answers with a terminal reply.
    let reply_status = h.send_reply("BAR", 4010, rpy_id, RPY_M_ENDMULT, Status::SUCCESS, b"ok");

    assert_eq!(reply_status, Status::SUCCESS);

    h.loop_back_peer();

    let answers: Vec<_> = h
        .take_to_port(4001)
        .into_iter()
        .filter(|frame| decode(frame).is_reply())
        .collect();

    assert_eq!(answers.len(), 1);

    let hdr = decode(&answers[0]);

    assert_eq!(hdr.status, Status::SUCCESS);
    assert_eq!(hdr.msg_id, req_id);
    assert_eq!(&payload_of(&answers[0])[..2], b"ok");

    // Both ids are released and the pending count drained.
    assert_eq!(h.pool().req_pool.active_count(), 0);
    assert_eq!(h.pool().rpy_pool.active_count(), 0);

    let replier = h.pool().tasks_for_handle(TaskHandle::from_str("BAR"))[0];

    assert_eq!(h.pool().get(replier).unwrap().pending_requests, 0);
}

#[test]
fn request_timeout_synthesizes_tmo() {
    let mut h = Harness::new();

    h.connect("FOO", 4000, 4001);

    let (status, req_id) = h.send_request("FOO", 4000, "XYZ", PEER_NODE.raw(), 0, 100, b"");

    assert_eq!(status, Status::SUCCESS);
    h.wire.peer_sent.clear(); // the outbound REQ to the peer

    h.advance(100);
    h.sweep();

    let delivered = h.take_to_port(4001);
    let hdr = decode(&delivered[0]);

    assert!(hdr.is_reply());
    assert_eq!(hdr.status, Status::TMO);
    assert_eq!(hdr.msg_id, req_id);
    assert_eq!(h.pool().req_pool.active_count(), 0);

    // The replier side is told to clean up.
    let (dst, can) = h.wire.peer_sent.remove(0);

    assert_eq!(dst.ip(), IpAddr::V4(PEER_IP));
    assert!(decode(&can).is_cancel());
}

#[test]
fn multi_reply_pend_beacons() {
    let mut h = Harness::new();

    h.connect("FOO", 4000, 4001);
    h.connect("BAR", 4010, 4011);
    h.receive_requests("BAR", 4010);

    let (_, req_id) = h.send_request("FOO", 4000, "BAR", 0, REQ_M_MULTRPY, 60_000, b"sub");

    h.loop_back_peer();

    let rpy_id = decode(&h.take_to_port(4011)[0]).status.raw() as u16;

    // Five seconds of silence from BAR: the daemon PENDs on its behalf.
    h.advance(5_000);
    h.sweep();
    h.loop_back_peer();

    let pend = h.take_to_port(4001);
    let hdr = decode(&pend[0]);

    assert_eq!(hdr.status, Status::PEND);
    assert_eq!(hdr.flags, flags::RPY | flags::MLT);

    // Re-running the sweep at the same instant emits nothing new.
    h.sweep();
    assert!(h.wire.peer_sent.is_empty());

    // Second beacon five seconds later.
    h.advance(5_000);
    h.sweep();
    h.loop_back_peer();
    assert_eq!(decode(&h.take_to_port(4001)[0]).status, Status::PEND);

    // The beacons also kept the request's own timeout fresh.
    assert_eq!(h.pool().req_pool.active_count(), 1);

    // BAR finally finishes the sequence.
    h.send_reply("BAR", 4010, rpy_id, RPY_M_ENDMULT, Status::SUCCESS, b"");
    h.loop_back_peer();

    let fin: Vec<_> = h
        .take_to_port(4001)
        .into_iter()
        .filter(|frame| decode(frame).is_reply())
        .collect();

    assert_eq!(decode(&fin[0]).status, Status::ENDMULT);
    assert_eq!(h.pool().req_pool.active_count(), 0, "EMR releases the request");
    assert_eq!(h.pool().rpy_pool.active_count(), 0);
}

#[test]
fn killer_message_acks_before_cancelling() {
    let mut h = Harness::new();

    h.connect("FOO", 4000, 4001);

    let (_, req_id) = h.send_request("FOO", 4000, "XYZ", PEER_NODE.raw(), 0, 60_000, b"");

    h.wire.peer_sent.clear();

    // The peer asks us (as a request to our ACNET task) to cancel all
    // traffic involving (9,2).
    let mut payload = Vec::new();

    payload.put_u16_le(0x020b); // subType 2, type 11
    payload.put_u16_le(1);
    payload.put_u16_le(PEER_NODE.raw());

    let killer = AcnetHeader::new(
        flags::REQ,
        Status::SUCCESS,
        OUR_NODE,
        PEER_NODE,
        TaskHandle::from_str("ACNET"),
        3,
        0x4242,
        payload.len(),
    );

    h.peer_packet(PEER_IP, &killer.encode(&payload).unwrap());

    // The acknowledgement went on the wire before any teardown.
    let (dst, ack) = h.wire.peer_sent.remove(0);

    assert_eq!(dst.ip(), IpAddr::V4(PEER_IP));

    let ack_hdr = decode(&ack);

    assert!(ack_hdr.is_reply());
    assert_eq!(ack_hdr.status, Status::SUCCESS);
    assert_eq!(ack_hdr.msg_id, 0x4242);

    // Our outstanding request toward (9,2) was torn down with a terminal
    // reply to its owner.
    let terminal = h.take_to_port(4001);
    let hdr = decode(&terminal[0]);

    assert_eq!(hdr.status, Status::NODE_DOWN);
    assert_eq!(hdr.msg_id, req_id);
    assert_eq!(h.pool().req_pool.active_count(), 0);
    assert_eq!(h.pool().rpy_pool.active_count(), 0, "killer reply id closed too");
}

#[test]
fn killer_message_generation_format() {
    let mut wire = CaptureWire::default();
    let mut table = NodeTable::new(Some(MY_IP), NodeName::from_str("CLX42"), 6801);
    let mut dump = DumpFlags::default();
    let mut pool = TaskPool::new(OUR_NODE, NodeName::from_str("CLX42"), 0);
    let mut ctx = Ctx {
        wire: &mut wire,
        table: &mut table,
        dump: &mut dump,
        now_ms: 0,
        now_sec: 0,
    };

    service::send_killer_message(&mut pool, &mut ctx, PEER_NODE);

    let (dst, frame) = wire.peer_sent.remove(0);

    assert_eq!(dst.ip(), IpAddr::V4(Ipv4Addr::new(239, 128, 4, 1)));

    let hdr = decode(&frame);

    assert!(hdr.is_usm());
    assert_eq!(hdr.server, TrunkNode::MULTICAST);
    assert_eq!(hdr.svr_task, TaskHandle::from_str("ACNET"));
    assert_eq!(
        payload_of(&frame),
        &[0x0b, 0x02, 0x01, 0x00, 0x02, 0x09]
    );
}

#[test]
fn name_in_use_until_the_holder_disconnects() {
    let mut h = Harness::new();

    h.connect("FOO", 4000, 4001);

    let (status, _) = h.try_connect("FOO", 4100, 4101);

    assert_eq!(status, Status::NAME_IN_USE);

    h.client_cmd(4000, &cmd_frame(op::DISCONNECT, TaskHandle::from_str("FOO"), &[]));

    let (status, _) = h.try_connect("FOO", 4100, 4101);

    assert_eq!(status, Status::SUCCESS);
}

#[test]
fn anonymous_connects_synthesize_a_port_name() {
    let mut h = Harness::new();
    let mut body = Vec::new();

    body.put_u32(std::process::id());
    body.put_u16(4001);
    h.client_cmd(4000, &cmd_frame(op::CONNECT, TaskHandle::default(), &body));

    let acks = h.take_to_port(4000);
    let ack = acks.last().unwrap();

    assert_eq!(ack_status(ack), Status::SUCCESS);

    let name = TaskHandle(u32::from_be_bytes([ack[5], ack[6], ack[7], ack[8]]));

    assert_eq!(name, TaskHandle::from_str("%04001"));
}

#[test]
fn pending_request_cap_rejects_with_nlm_on_the_wire() {
    let mut h = Harness::new();

    h.connect("BAR", 4010, 4011);
    h.receive_requests("BAR", 4010);

    for msg_id in 0..256u16 {
        let req = AcnetHeader::new(
            flags::REQ,
            Status::SUCCESS,
            OUR_NODE,
            PEER_NODE,
            TaskHandle::from_str("BAR"),
            1,
            msg_id,
            0,
        );

        h.peer_packet(PEER_IP, &req.encode(&[]).unwrap());
    }
    assert!(h.wire.peer_sent.is_empty(), "256 requests admitted quietly");

    let overflow = AcnetHeader::new(
        flags::REQ,
        Status::SUCCESS,
        OUR_NODE,
        PEER_NODE,
        TaskHandle::from_str("BAR"),
        1,
        0x0fff,
        0,
    );

    h.peer_packet(PEER_IP, &overflow.encode(&[]).unwrap());

    let (_, nlm) = h.wire.peer_sent.remove(0);

    assert_eq!(decode(&nlm).status, Status::NLM);
}

#[test]
fn request_for_absent_task_errors_fast() {
    let mut h = Harness::new();
    let req = AcnetHeader::new(
        flags::REQ,
        Status::SUCCESS,
        OUR_NODE,
        PEER_NODE,
        TaskHandle::from_str("NOBODY"),
        1,
        7,
        0,
    );

    h.peer_packet(PEER_IP, &req.encode(&[]).unwrap());

    let (_, err) = h.wire.peer_sent.remove(0);

    assert_eq!(decode(&err).status, Status::NOTASK);
}

#[test]
fn masquerading_source_is_dropped() {
    let mut h = Harness::new();

    h.connect("BAR", 4010, 4011);
    h.receive_requests("BAR", 4010);

    // Claims to be PEER_NODE but arrives from the wrong address.
    let req = AcnetHeader::new(
        flags::REQ,
        Status::SUCCESS,
        OUR_NODE,
        PEER_NODE,
        TaskHandle::from_str("BAR"),
        1,
        7,
        0,
    );

    h.peer_packet(Ipv4Addr::new(10, 0, 0, 99), &req.encode(&[]).unwrap());

    assert!(h.wire.peer_sent.is_empty());
    assert!(h.take_to_port(4011).is_empty());
}

#[test]
fn peer_cancel_tears_down_the_reply() {
    let mut h = Harness::new();

    h.connect("BAR", 4010, 4011);
    h.receive_requests("BAR", 4010);

    let req = AcnetHeader::new(
        flags::REQ | flags::MLT,
        Status::SUCCESS,
        OUR_NODE,
        PEER_NODE,
        TaskHandle::from_str("BAR"),
        1,
        0x1111,
        0,
    );

    h.peer_packet(PEER_IP, &req.encode(&[]).unwrap());
    assert_eq!(h.pool().rpy_pool.active_count(), 1);
    assert_eq!(h.pool().rpy_pool.target_count(PEER_NODE), 1);
    h.take_to_port(4011);

    let can = AcnetHeader::new(
        flags::CAN,
        Status::SUCCESS,
        OUR_NODE,
        PEER_NODE,
        TaskHandle::from_str("BAR"),
        1,
        0x1111,
        0,
    );

    h.peer_packet(PEER_IP, &can.encode(&[]).unwrap());

    assert_eq!(h.pool().rpy_pool.active_count(), 0);
    assert_eq!(h.pool().rpy_pool.target_count(PEER_NODE), 0);

    // The owner sees a synthesized CAN naming the request.
    let faked = h.take_to_port(4011);
    let hdr = decode(&faked[0]);

    assert!(hdr.is_cancel());
    assert_eq!(hdr.msg_id, 0x1111);
}

#[test]
fn block_requests_ends_replies_with_disconnected() {
    let mut h = Harness::new();

    h.connect("BAR", 4010, 4011);
    h.receive_requests("BAR", 4010);

    let req = AcnetHeader::new(
        flags::REQ,
        Status::SUCCESS,
        OUR_NODE,
        PEER_NODE,
        TaskHandle::from_str("BAR"),
        1,
        0x2222,
        0,
    );

    h.peer_packet(PEER_IP, &req.encode(&[]).unwrap());
    h.take_to_port(4011);
    h.wire.peer_sent.clear();

    h.client_cmd(
        4010,
        &cmd_frame(op::BLOCK_REQUESTS, TaskHandle::from_str("BAR"), &[]),
    );

    assert_eq!(h.pool().rpy_pool.active_count(), 0);

    // The far end got the terminal status on the wire.
    let (dst, fin) = h.wire.peer_sent.remove(0);

    assert_eq!(dst.ip(), IpAddr::V4(PEER_IP));
    assert_eq!(decode(&fin).status, Status::DISCONNECTED);
}

#[test]
fn multicast_listeners_share_one_membership() {
    let mut h = Harness::new();
    let group = Ipv4Addr::new(239, 128, 4, 9);

    h.daemon
        .table
        .update_addr(TrunkNode::new(10, 5), NodeName::from_str("MCGRP"), group);

    h.connect("MCGRP", 4000, 4001);
    h.connect("MCGRP", 4100, 4101);

    assert_eq!(h.wire.joined, vec![group]);
    assert_eq!(h.daemon.table.mcast_ref_count(group), 2);

    h.client_cmd(
        4000,
        &cmd_frame(op::DISCONNECT_SINGLE, TaskHandle::from_str("MCGRP"), &[]),
    );
    assert!(h.wire.left.is_empty());
    assert_eq!(h.daemon.table.mcast_ref_count(group), 1);

    h.client_cmd(
        4100,
        &cmd_frame(op::DISCONNECT_SINGLE, TaskHandle::from_str("MCGRP"), &[]),
    );
    assert_eq!(h.wire.left, vec![group]);
    assert_eq!(h.daemon.table.mcast_ref_count(group), 0);
}

#[test]
fn add_node_then_lookup_round_trip() {
    let mut h = Harness::new();
    let mut body = Vec::new();

    body.put_u32(u32::from(Ipv4Addr::new(131, 225, 9, 3)));
    body.put_u32(0);
    body.put_u16(TrunkNode::new(9, 3).raw());
    body.put_u32(NodeName::from_str("N3").raw());
    h.client_cmd(5000, &cmd_frame(op::ADD_NODE, TaskHandle::default(), &body));

    let acks = h.take_to_port(5000);

    assert_eq!(ack_status(acks.last().unwrap()), Status::SUCCESS);

    let mut lookup = Vec::new();

    lookup.put_u32(NodeName::from_str("N3").raw());
    h.client_cmd(
        5000,
        &cmd_frame(op::NAME_LOOKUP, TaskHandle::default(), &lookup),
    );

    let acks = h.take_to_port(5000);
    let ack = acks.last().unwrap();

    assert_eq!(ack_status(ack), Status::SUCCESS);
    assert_eq!((ack[4], ack[5]), (9, 3));
}

#[test]
fn ip_move_cancels_outstanding_traffic() {
    let mut h = Harness::new();

    h.connect("FOO", 4000, 4001);
    h.send_request("FOO", 4000, "XYZ", PEER_NODE.raw(), 0, 60_000, b"");
    h.wire.peer_sent.clear();

    // PEER moves to a new address.
    let mut body = Vec::new();

    body.put_u32(u32::from(Ipv4Addr::new(131, 225, 9, 77)));
    body.put_u32(0);
    body.put_u16(PEER_NODE.raw());
    body.put_u32(NodeName::from_str("PEER").raw());
    h.client_cmd(5000, &cmd_frame(op::ADD_NODE, TaskHandle::default(), &body));

    assert_eq!(h.pool().req_pool.active_count(), 0);

    let terminal = h.take_to_port(4001);

    assert_eq!(decode(&terminal[0]).status, Status::NODE_DOWN);
}

#[test]
fn internal_service_answers_ping_and_version() {
    let mut h = Harness::new();

    for (msg_id, type_word, expect) in [
        (1u16, 0x0000u16, vec![0u8, 0]),                   // ping
        (2, 0x0003, vec![0x14, 0x09, 0x04, 0x08, 0x00, 0x08]), // version
    ] {
        let mut payload = Vec::new();

        payload.put_u16_le(type_word);

        let req = AcnetHeader::new(
            flags::REQ,
            Status::SUCCESS,
            OUR_NODE,
            PEER_NODE,
            TaskHandle::from_str("ACNET"),
            1,
            msg_id,
            payload.len(),
        );

        h.peer_packet(PEER_IP, &req.encode(&payload).unwrap());

        let (_, frame) = h.wire.peer_sent.remove(0);
        let hdr = decode(&frame);

        assert_eq!(hdr.status, Status::SUCCESS);
        assert_eq!(hdr.msg_id, msg_id);
        assert_eq!(payload_of(&frame), expect.as_slice());
    }
}

#[test]
fn tasks_list_includes_the_count_word() {
    let mut h = Harness::new();

    h.connect("FOO", 4000, 4001);

    let mut payload = Vec::new();

    payload.put_u16_le(0x0004); // type 4, subType 0

    let req = AcnetHeader::new(
        flags::REQ,
        Status::SUCCESS,
        OUR_NODE,
        PEER_NODE,
        TaskHandle::from_str("ACNET"),
        1,
        9,
        payload.len(),
    );

    h.peer_packet(PEER_IP, &req.encode(&payload).unwrap());

    let (_, frame) = h.wire.peer_sent.remove(0);
    let body = payload_of(&frame);

    // Leading count word, then one handle per task (the service plus FOO).
    assert_eq!(u16::from_le_bytes([body[0], body[1]]), 2);

    let handles: Vec<u32> = (0..2)
        .map(|task| {
            u32::from_le_bytes([
                body[2 + task * 4],
                body[3 + task * 4],
                body[4 + task * 4],
                body[5 + task * 4],
            ])
        })
        .collect();

    assert!(handles.contains(&TaskHandle::from_str("ACNET").raw()));
    assert!(handles.contains(&TaskHandle::from_str("FOO").raw()));
}

#[test]
fn stale_request_ids_are_harmless_after_timeout() {
    let mut h = Harness::new();

    h.connect("FOO", 4000, 4001);

    let (_, req_id) = h.send_request("FOO", 4000, "XYZ", PEER_NODE.raw(), 0, 100, b"");

    h.wire.peer_sent.clear();
    h.advance(200);
    h.sweep();
    h.take_to_port(4001);
    h.wire.peer_sent.clear();

    // A straggler reply for the dead id is ignored.
    let stale = AcnetHeader::new(
        flags::RPY,
        Status::SUCCESS,
        PEER_NODE,
        OUR_NODE,
        TaskHandle::from_str("XYZ"),
        0,
        req_id,
        0,
    );

    h.peer_packet(PEER_IP, &stale.encode(&[]).unwrap());

    assert!(h.take_to_port(4001).is_empty());
    assert!(h.wire.peer_sent.is_empty());
}

#[test]
fn duplicate_request_ack_answers_bug_and_keeps_the_count() {
    let mut h = Harness::new();

    h.connect("BAR", 4010, 4011);
    h.receive_requests("BAR", 4010);

    // Two open requests, both un-acked.
    let mut rpy_ids = Vec::new();

    for msg_id in [0x0101u16, 0x0102] {
        let req = AcnetHeader::new(
            flags::REQ,
            Status::SUCCESS,
            OUR_NODE,
            PEER_NODE,
            TaskHandle::from_str("BAR"),
            1,
            msg_id,
            0,
        );

        h.peer_packet(PEER_IP, &req.encode(&[]).unwrap());
        rpy_ids.push(decode(&h.take_to_port(4011)[0]).status.raw() as u16);
    }

    let bar = h.pool().tasks_for_handle(TaskHandle::from_str("BAR"))[0];

    assert_eq!(h.pool().get(bar).unwrap().pending_requests, 2);

    let ack_one = |h: &mut Harness| {
        let mut body = Vec::new();

        body.put_u16(rpy_ids[0]);
        h.client_cmd(
            4010,
            &cmd_frame(op::REQUEST_ACK, TaskHandle::from_str("BAR"), &body),
        );

        let acks = h.take_to_port(4010);

        ack_status(acks.last().unwrap())
    };

    assert_eq!(ack_one(&mut h), Status::SUCCESS);
    assert_eq!(h.pool().get(bar).unwrap().pending_requests, 1);

    // Acking the same id again is a client bug and must not pay down the
    // count owed to the still-unacked second reply.
    assert_eq!(ack_one(&mut h), Status::BUG);
    assert_eq!(h.pool().get(bar).unwrap().pending_requests, 1);
}
