//! Per-virtual-node task registry and the operations that cut across the
//! registry, the request pool, and the reply pool.
//!
//! One `TaskPool` holds the entire state of one ACNET node, which is what
//! lets a single daemon host several "virtual" nodes. Slot 0 always belongs
//! to the in-process ACNET service, registered under both `ACNET` and
//! `ACNAUX`.

use crate::reqpool::RequestPool;
use crate::rpypool::{ReplyPool, RpyAllocError};
use crate::stats::{StatCounter, XmitStats};
use crate::task::{TaskInfo, TaskKind, ALIVE_THROTTLE_SEC, MAX_TASKS};
use crate::transport::Ctx;
use acnet_core::wire::{flags, AcnetHeader};
use acnet_core::{NodeName, ReqId, RpyId, Status, TaskHandle, TaskId, TrunkNode};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use tracing::{debug, warn};

/// Connection parameters carried by `Connect`/`TcpConnect`.
#[derive(Debug, Clone, Copy)]
pub struct ConnectParams {
    pub client_name: TaskHandle,
    pub pid: u32,
    pub cmd_port: u16,
    pub data_port: u16,
    pub remote_addr: Option<Ipv4Addr>,
}

/// Why an inbound request was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptError {
    /// Answer the peer with this terminal status.
    Reject(Status),
    /// Duplicate of a live request; drop the datagram.
    Drop,
}

/// Node-level counter snapshot returned by the `GlobalStats` command.
#[derive(Debug, Clone, Copy)]
pub struct GlobalStats {
    pub usm_rcv: u32,
    pub req_rcv: u32,
    pub rpy_rcv: u32,
    pub usm_xmt: u32,
    pub req_xmt: u32,
    pub rpy_xmt: u32,
    pub req_q_limit: u32,
}

pub struct TaskPool {
    node: TrunkNode,
    node_name: NodeName,
    tasks: Vec<Option<TaskInfo>>,
    active: HashMap<TaskHandle, Vec<TaskId>>,
    removed: Vec<TaskInfo>,
    pub req_pool: RequestPool,
    pub rpy_pool: ReplyPool,
    pub stats: XmitStats,
    pub stat_req_q_limit: StatCounter,
    pub stat_time_base_sec: u64,
    pub task_stat_time_base_sec: u64,
}

impl TaskPool {
    pub fn new(node: TrunkNode, node_name: NodeName, now_sec: u64) -> Self {
        let mut pool = TaskPool {
            node,
            node_name,
            tasks: (0..MAX_TASKS).map(|_| None).collect(),
            active: HashMap::new(),
            removed: Vec::new(),
            req_pool: RequestPool::default(),
            rpy_pool: ReplyPool::default(),
            stats: XmitStats::default(),
            stat_req_q_limit: StatCounter::default(),
            stat_time_base_sec: now_sec,
            task_stat_time_base_sec: now_sec,
        };

        let acnet = TaskHandle::from_str("ACNET");

        pool.tasks[0] = Some(TaskInfo::internal(acnet, now_sec));
        pool.active.insert(acnet, vec![TaskId(0)]);
        pool.active
            .insert(TaskHandle::from_str("ACNAUX"), vec![TaskId(0)]);
        pool
    }

    pub fn node(&self) -> TrunkNode {
        self.node
    }

    pub fn set_node(&mut self, node: TrunkNode) {
        self.node = node;
    }

    pub fn node_name(&self) -> NodeName {
        self.node_name
    }

    pub fn get(&self, id: TaskId) -> Option<&TaskInfo> {
        self.tasks[id.raw() as usize].as_ref()
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut TaskInfo> {
        self.tasks[id.raw() as usize].as_mut()
    }

    pub fn tasks_for_handle(&self, handle: TaskHandle) -> Vec<TaskId> {
        self.active.get(&handle).cloned().unwrap_or_default()
    }

    pub fn handle_exists(&self, handle: TaskHandle) -> bool {
        self.active
            .get(&handle)
            .is_some_and(|ids| !ids.is_empty())
    }

    /// A handle is promiscuous only while its sole holder says so.
    pub fn is_promiscuous_handle(&self, handle: TaskHandle) -> bool {
        match self.active.get(&handle).map(Vec::as_slice) {
            Some([id]) => self.get(*id).is_some_and(TaskInfo::is_promiscuous),
            _ => false,
        }
    }

    /// Find an existing connection: same handle, same command port.
    pub fn find_connection(&self, handle: TaskHandle, cmd_port: u16) -> Option<TaskId> {
        self.tasks_for_handle(handle)
            .into_iter()
            .find(|&id| self.get(id).is_some_and(|t| t.same_connection(cmd_port)))
    }

    fn next_free_id(&self) -> Option<TaskId> {
        (0..MAX_TASKS)
            .find(|&slot| self.tasks[slot].is_none())
            .map(|slot| TaskId(slot as u8))
    }

    fn register(&mut self, handle: TaskHandle, id: TaskId) {
        self.active.entry(handle).or_default().push(id);
    }

    fn unregister(&mut self, handle: TaskHandle, id: TaskId) {
        if let Some(ids) = self.active.get_mut(&handle) {
            ids.retain(|&other| other != id);
            if ids.is_empty() {
                self.active.remove(&handle);
            }
        }
    }

    /// Attach a client. An anonymous (blank) name becomes `%NNNNN` from the
    /// data port; a handle naming a multicast group creates a listener; an
    /// exclusively held handle is refused.
    pub fn connect(&mut self, ctx: &mut Ctx, params: ConnectParams) -> Result<TaskId, Status> {
        if params.data_port == 0 {
            return Err(Status::INVARG);
        }

        self.remove_inactive(ctx);

        let name = if params.client_name.is_blank() {
            TaskHandle::from_str(&format!("%{:05}", params.data_port))
        } else {
            params.client_name
        };

        if let Some(id) = self.find_connection(name, params.cmd_port) {
            return Ok(id);
        }

        let id = self.next_free_id().ok_or(Status::NLM)?;
        let group = ctx
            .table
            .name_to_ip(name.into())
            .filter(|addr| addr.is_multicast());

        let kind = match (group, params.remote_addr) {
            (Some(group), _) => TaskKind::Multicast { group },
            (None, Some(remote_addr)) => {
                if self.handle_exists(name) {
                    return Err(Status::NAME_IN_USE);
                }
                TaskKind::Remote { remote_addr }
            }
            (None, None) => {
                if self.handle_exists(name) {
                    return Err(Status::NAME_IN_USE);
                }
                TaskKind::Local { receiving: false }
            }
        };

        if let TaskKind::Multicast { group } = kind {
            if ctx.table.mcast_add_ref(group) {
                ctx.wire.join_group(group);
            }
        }

        let task = TaskInfo::new(
            name,
            id,
            kind,
            params.pid,
            params.cmd_port,
            params.data_port,
            ctx.now_sec,
        );

        self.tasks[id.raw() as usize] = Some(task);
        self.register(name, id);
        debug!(task = %name, id = %id, "connected");
        Ok(id)
    }

    /// Rename a task. Allowed only when the destination handle is free or
    /// held by a corpse (which is evicted first); multicast and promiscuous
    /// handles never rename.
    pub fn rename(&mut self, ctx: &mut Ctx, id: TaskId, new_handle: TaskHandle) -> bool {
        if ctx.table.is_multicast_handle(new_handle.into()) {
            return false;
        }
        if self.get(id).map_or(true, TaskInfo::is_promiscuous) {
            return false;
        }

        if let Some(&holder) = self.tasks_for_handle(new_handle).first() {
            let alive = self
                .get_mut(holder)
                .is_some_and(|t| t.still_alive(ctx.now_sec, ALIVE_THROTTLE_SEC));

            if alive {
                return false;
            }
            self.remove_task(ctx, holder);

            // Eviction may have swept the renaming task away with it.
            if self.get(id).is_none() {
                return false;
            }
        }

        let old = match self.get_mut(id) {
            Some(task) => {
                let old = task.handle;

                task.handle = new_handle;
                old
            }
            None => return false,
        };

        self.unregister(old, id);
        self.register(new_handle, id);
        true
    }

    /// Stage exactly this task for removal: cancel its requests (CAN on the
    /// wire), end its replies with `status`, then park the record until the
    /// next safe point.
    pub fn remove_only_task(
        &mut self,
        ctx: &mut Ctx,
        id: TaskId,
        status: Status,
        send_last_reply: bool,
    ) {
        if self.get(id).map_or(true, TaskInfo::is_internal) {
            return;
        }

        let last_reply = send_last_reply.then_some(status);

        // Requests first, so the owner's teardown never observes its own
        // already-ended replies. The teardown calls prune the owner's sets;
        // the explicit removal below only mops up stale entries.
        while let Some(req) = self
            .get(id)
            .and_then(|task| task.requests.iter().next().copied())
        {
            self.cancel_req_id(ctx, ReqId(req), true, last_reply);
            if let Some(task) = self.get_mut(id) {
                task.requests.remove(&req);
            }
        }
        while let Some(rpy) = self
            .get(id)
            .and_then(|task| task.replies.iter().next().copied())
        {
            self.end_rpy_id(ctx, RpyId(rpy), status);
            if let Some(task) = self.get_mut(id) {
                task.replies.remove(&rpy);
            }
        }

        let Some(task) = self.tasks[id.raw() as usize].take() else {
            return;
        };

        debug!(task = %task.handle, pid = task.pid, "removing task");
        self.unregister(task.handle, id);
        self.removed.push(task);
    }

    /// Remove every task belonging to the same process as `id`.
    pub fn remove_task(&mut self, ctx: &mut Ctx, id: TaskId) {
        let Some(pid) = self.get(id).map(|t| t.pid) else {
            return;
        };

        if pid == 0 {
            self.remove_only_task(ctx, id, Status::DISCONNECTED, false);
        } else {
            for slot in 0..MAX_TASKS {
                let matches = self.tasks[slot]
                    .as_ref()
                    .is_some_and(|t| !t.is_internal() && t.pid == pid);

                if matches {
                    self.remove_only_task(ctx, TaskId(slot as u8), Status::DISCONNECTED, false);
                }
            }
        }
    }

    /// Remove every task, as on node shutdown.
    pub fn remove_all_tasks(&mut self, ctx: &mut Ctx) {
        for slot in 0..MAX_TASKS {
            if self.tasks[slot].is_some() {
                self.remove_only_task(ctx, TaskId(slot as u8), Status::NODE_DOWN, true);
            }
        }
    }

    /// Sweep out clients that stopped responding, then free the parked
    /// records.
    pub fn remove_inactive(&mut self, ctx: &mut Ctx) {
        for slot in 0..MAX_TASKS {
            let dead = self.tasks[slot]
                .as_mut()
                .is_some_and(|t| !t.still_alive(ctx.now_sec, ALIVE_THROTTLE_SEC));

            if dead {
                self.remove_task(ctx, TaskId(slot as u8));
            }
        }
        self.drain_removed(ctx);
    }

    /// Free staged task records. Multicast listeners drop their group
    /// reference here, after any in-flight dispatch has finished with them.
    pub fn drain_removed(&mut self, ctx: &mut Ctx) {
        for task in self.removed.drain(..) {
            if let TaskKind::Multicast { group } = task.kind {
                if ctx.table.mcast_drop_ref(group) {
                    ctx.wire.leave_group(group);
                }
            }
        }
    }

    pub fn has_removed(&self) -> bool {
        !self.removed.is_empty()
    }

    /// Push a data frame at a client task. Returns false when the task
    /// should be retired (send failed and the liveness probe agrees).
    pub fn send_data_to_task(&mut self, ctx: &mut Ctx, id: TaskId, frame: &[u8]) -> bool {
        let Some(task) = self.get_mut(id) else {
            return false;
        };

        if task.is_internal() {
            return true;
        }

        let addr = task.data_addr();
        let ok = ctx.wire.send_to_client(addr, frame);

        task.note_send_result(ok);
        ok || task.still_alive(ctx.now_sec, ALIVE_THROTTLE_SEC)
    }

    /// Same contract for command-channel acks.
    pub fn send_ack_to_task(&mut self, ctx: &mut Ctx, id: TaskId, frame: &[u8]) -> bool {
        let Some(task) = self.get_mut(id) else {
            return false;
        };

        if task.is_internal() {
            return true;
        }

        let addr = task.cmd_addr();
        let ok = ctx.wire.send_to_client(addr, frame);

        task.note_send_result(ok);
        ok || task.still_alive(ctx.now_sec, ALIVE_THROTTLE_SEC)
    }

    // ----- request side ------------------------------------------------

    /// Cancel one request. `send_can` emits the CAN packet that lets the
    /// replier clean up; `last_reply` synthesizes a terminal reply with the
    /// given status to the local owner.
    pub fn cancel_req_id(
        &mut self,
        ctx: &mut Ctx,
        id: ReqId,
        send_can: bool,
        last_reply: Option<Status>,
    ) -> bool {
        let Some(info) = self.req_pool.release(id) else {
            return false;
        };

        if let Some(task) = self.get_mut(info.owner) {
            task.requests.remove(&id.raw());
        }

        if send_can {
            let hdr = AcnetHeader::new(
                flags::CAN,
                Status::SUCCESS,
                info.rem_node,
                info.lcl_node,
                info.task_name,
                info.owner.raw() as u16,
                id.raw(),
                0,
            );

            ctx.send_to_network(&hdr, &[]);
        }

        if let Some(status) = last_reply {
            let hdr = AcnetHeader::new(
                flags::RPY,
                status,
                info.rem_node,
                info.lcl_node,
                info.task_name,
                info.owner.raw() as u16,
                id.raw(),
                0,
            );

            if let Ok(frame) = hdr.encode(&[]) {
                self.send_data_to_task(ctx, info.owner, &frame);
                if let Some(task) = self.get_mut(info.owner) {
                    task.stats.rpy_rcv.bump();
                }
                self.stats.rpy_rcv.bump();
            }
        }

        true
    }

    /// Cancel everything in flight toward a node that moved or died. The
    /// owners get a terminal NODE_DOWN reply; no CAN goes on the wire since
    /// the address no longer means what it did.
    pub fn cancel_req_to_node(&mut self, ctx: &mut Ctx, tn: TrunkNode) {
        for id in self.req_pool.ids_to_node(tn) {
            self.cancel_req_id(ctx, id, false, Some(Status::NODE_DOWN));
        }
    }

    /// Expire overdue requests: each owner gets a synthesized TMO reply and
    /// the replier a CAN. Returns the absolute deadline of the next record.
    pub fn request_timeout_sweep(&mut self, ctx: &mut Ctx) -> Option<u64> {
        while let Some((id, info)) = self.req_pool.pop_expired(ctx.now_ms) {
            debug!(req = %id, node = %info.rem_node, "request timed out");

            if let Some(task) = self.get_mut(info.owner) {
                task.requests.remove(&id.raw());
            }

            let rpy = AcnetHeader::new(
                flags::RPY,
                Status::TMO,
                info.rem_node,
                info.lcl_node,
                info.task_name,
                info.owner.raw() as u16,
                id.raw(),
                0,
            );

            if let Ok(frame) = rpy.encode(&[]) {
                if !self.send_data_to_task(ctx, info.owner, &frame) {
                    self.remove_task(ctx, info.owner);
                }
                if let Some(task) = self.get_mut(info.owner) {
                    task.stats.rpy_rcv.bump();
                }
                self.stats.rpy_rcv.bump();
            }

            let can = AcnetHeader::new(
                flags::CAN,
                Status::SUCCESS,
                info.rem_node,
                info.lcl_node,
                info.task_name,
                info.owner.raw() as u16,
                id.raw(),
                0,
            );

            ctx.send_to_network(&can, &[]);
        }

        self.req_pool.next_deadline()
    }

    // ----- reply side ---------------------------------------------------

    /// Transmit one reply packet for an open reply id. Returns true when
    /// the transmission finishes the reply and the id must be released.
    pub fn xmit_reply(
        &mut self,
        ctx: &mut Ctx,
        id: RpyId,
        status: Status,
        data: &[u8],
        emr: bool,
    ) -> bool {
        let Some(rpy) = self.rpy_pool.get_mut(id) else {
            return false;
        };

        // The first outgoing reply implies the client accepted the request
        // even if it never said so.
        let implicit_ack = !rpy.acked;

        if implicit_ack {
            warn!(rpy = %id, "implicitly decremented the pending count");
            rpy.acked = true;
        }

        let mut hdr = AcnetHeader::new(
            flags::RPY,
            status,
            rpy.lcl_node,
            rpy.rem_node,
            rpy.task_name,
            rpy.clnt_task_id,
            rpy.req_id,
            data.len(),
        );

        let rep_done = if rpy.is_mult_replier() {
            if emr {
                if status == Status::SUCCESS {
                    hdr.status = Status::ENDMULT;
                }
                true
            } else {
                hdr.flags = flags::RPY | flags::MLT;
                false
            }
        } else {
            true
        };

        rpy.total_packets.bump();

        let owner = rpy.owner;

        self.rpy_pool.touch(id, ctx.now_ms, ctx.now_sec);
        if implicit_ack {
            if let Some(task) = self.get_mut(owner) {
                task.decrement_pending();
            }
        }

        ctx.send_to_network(&hdr, data);
        rep_done
    }

    /// A client's `SendReply`: verify it owns the id, transmit, and release
    /// on the final packet.
    pub fn send_reply_to_network(
        &mut self,
        ctx: &mut Ctx,
        caller: TaskId,
        id: RpyId,
        status: Status,
        data: &[u8],
        emr: bool,
    ) -> Status {
        let owned = self
            .rpy_pool
            .get(id)
            .is_some_and(|rpy| rpy.owner == caller);

        if !owned {
            return Status::NSR;
        }

        let rep_done = self.xmit_reply(ctx, id, status, data, emr);

        if let Some(task) = self.get_mut(caller) {
            task.stats.rpy_xmt.bump();
        }
        self.stats.rpy_xmt.bump();

        if rep_done {
            self.end_rpy_id(ctx, id, Status::SUCCESS);
        }
        Status::SUCCESS
    }

    /// Close a reply id. A non-SUCCESS status goes out on the wire as the
    /// terminal packet (suppressed for multicasted multi-replies, which the
    /// far end ignores anyway); the local owner always sees a synthesized
    /// CAN carrying the id so it can clean up.
    pub fn end_rpy_id(&mut self, ctx: &mut Ctx, id: RpyId, status: Status) {
        let Some(info) = self.rpy_pool.release(id) else {
            return;
        };

        if let Some(task) = self.get_mut(info.owner) {
            if !task.replies.remove(&id.raw()) {
                debug!(rpy = %id, task = %info.owner, "reply id was not in the owner's set");
            }
            if !info.acked {
                task.decrement_pending();
            }
        }

        if status != Status::SUCCESS && !(info.mcast && info.flags & flags::MLT != 0) {
            let hdr = AcnetHeader::new(
                flags::RPY,
                status,
                info.lcl_node,
                info.rem_node,
                info.task_name,
                info.clnt_task_id,
                info.req_id,
                0,
            );

            ctx.send_to_network(&hdr, &[]);
            if let Some(task) = self.get_mut(info.owner) {
                task.stats.rpy_xmt.bump();
            }
            self.stats.rpy_xmt.bump();
        }

        // Synthesized CAN: the status field smuggles the reply id so the
        // owner knows which one closed.
        let can = AcnetHeader::new(
            flags::CAN,
            Status::from_raw(id.raw() as i16),
            info.lcl_node,
            info.rem_node,
            info.task_name,
            info.owner.raw() as u16,
            info.req_id,
            0,
        );

        if let Ok(frame) = can.encode(&[]) {
            self.send_data_to_task(ctx, info.owner, &frame);
            if let Some(task) = self.get_mut(info.owner) {
                task.stats.usm_rcv.bump();
            }
            self.stats.usm_rcv.bump();
        }
    }

    /// End every reply owed to a node that moved or died.
    pub fn end_rpy_to_node(&mut self, ctx: &mut Ctx, tn: TrunkNode) {
        let ids = self.rpy_pool.ids_to_node(tn);
        let count = ids.len();

        for id in ids {
            if ctx.dump.outgoing {
                debug!(rpy = %id, "sending faked CANCEL for reply");
            }
            self.end_rpy_id(ctx, id, Status::SUCCESS);
        }

        if count > 0 {
            debug!(
                released = count,
                active = self.rpy_pool.active_count(),
                "released reply structures"
            );
        }
    }

    /// Emit overdue PEND beacons. Returns the next PEND deadline.
    pub fn pend_sweep(&mut self, ctx: &mut Ctx) -> Option<u64> {
        while let Some(id) = self.rpy_pool.pop_pend_due(ctx.now_ms) {
            self.xmit_reply(ctx, id, Status::PEND, &[], false);
        }
        self.rpy_pool.next_deadline()
    }

    // ----- bookkeeping --------------------------------------------------

    pub fn active_count(&self) -> usize {
        self.tasks.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn rum_handle_count(&self) -> usize {
        self.tasks
            .iter()
            .flatten()
            .filter(|t| t.is_receiving())
            .count()
    }

    pub fn request_count(&self) -> usize {
        self.tasks.iter().flatten().map(|t| t.requests.len()).sum()
    }

    pub fn reply_count(&self) -> usize {
        self.tasks.iter().flatten().map(|t| t.replies.len()).sum()
    }

    pub fn iter_tasks(&self) -> impl Iterator<Item = &TaskInfo> {
        self.tasks.iter().flatten()
    }

    pub fn global_stats(&self) -> GlobalStats {
        GlobalStats {
            usm_rcv: self.stats.usm_rcv.as_u32(),
            req_rcv: self.stats.req_rcv.as_u32(),
            rpy_rcv: self.stats.rpy_rcv.as_u32(),
            usm_xmt: self.stats.usm_xmt.as_u32(),
            req_xmt: self.stats.req_xmt.as_u32(),
            rpy_xmt: self.stats.rpy_xmt.as_u32(),
            req_q_limit: self.stat_req_q_limit.as_u32(),
        }
    }

    /// Answer an inbound REQ by allocating the reply side. The admission
    /// cap and pool exhaustion both surface as NLM to the peer.
    pub fn accept_request(
        &mut self,
        ctx: &mut Ctx,
        target: TaskId,
        hdr: &AcnetHeader,
    ) -> Result<RpyId, AcceptError> {
        let admitted = self
            .get_mut(target)
            .is_some_and(TaskInfo::try_increment_pending);

        if !admitted {
            self.stat_req_q_limit.bump();
            return Err(AcceptError::Reject(Status::NLM));
        }

        let mcast = ctx.table.is_multicast_node(hdr.server);
        let own_node = self.node;
        let result = self.rpy_pool.alloc(
            target,
            hdr.msg_id,
            hdr.clnt_task_id,
            hdr.svr_task,
            hdr.server,
            own_node,
            hdr.client,
            hdr.flags,
            mcast,
            ctx.now_ms,
            ctx.now_sec,
        );

        match result {
            Ok(id) => {
                if let Some(task) = self.get_mut(target) {
                    task.replies.insert(id.raw());
                }
                Ok(id)
            }
            Err(err) => {
                if let Some(task) = self.get_mut(target) {
                    task.decrement_pending();
                }
                match err {
                    RpyAllocError::Exhausted => {
                        self.stat_req_q_limit.bump();
                        Err(AcceptError::Reject(Status::NLM))
                    }
                    RpyAllocError::Duplicate => Err(AcceptError::Drop),
                }
            }
        }
    }
}
