//! Daemon context and event loop.
//!
//! All mutable state lives in one [`Daemon`] value owned by a single
//! current-thread task: the node table, one [`TaskPool`] per hosted virtual
//! node, the packet-dump toggles, and the service state. Each inbound
//! datagram or timer tick is processed to completion before the next is
//! read, which is the whole concurrency story.

use crate::command::{self, Command};
use crate::config::DaemonConfig;
use crate::dispatcher;
use crate::nodetable::{NodeTable, MCAST_GROUP};
use crate::reqpool::REQUEST_TIMEOUT_MS;
use crate::service::{self, ServiceState};
use crate::task::TaskKind;
use crate::taskpool::{ConnectParams, TaskPool};
use crate::transport::{self, bind_udp, Ctx, DumpFlags, UdpWire, Wire};
use acnet_core::wire::{self, AcnetHeader, MAX_USER_PACKET_SIZE, REQ_M_MULTRPY, RPY_M_ENDMULT};
use acnet_core::{NodeName, ReqId, RpyId, Status, TaskHandle, TaskId, TrunkNode};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

pub struct Daemon {
    pub table: NodeTable,
    pub pools: Vec<TaskPool>,
    pub dump: DumpFlags,
    pub service: ServiceState,
    reject: Vec<TaskHandle>,
}

/// Give every pool whose virtual node name now resolves to one of our
/// addresses its trunk/node. The primary pool tracks the table's idea of
/// our own node.
pub fn rebind_pools(pools: &mut [TaskPool], table: &NodeTable) {
    for (index, pool) in pools.iter_mut().enumerate() {
        if index == 0 {
            if !table.my_node().is_blank() {
                pool.set_node(table.my_node());
            }
        } else if pool.node().is_blank() {
            if let Some(tn) = table.name_to_node(pool.node_name()) {
                if table.is_this_machine(tn) {
                    pool.set_node(tn);
                }
            }
        }
    }
}

fn pool_index(pools: &[TaskPool], vnode: NodeName) -> Option<usize> {
    if vnode.is_blank() {
        Some(0)
    } else {
        pools.iter().position(|pool| pool.node_name() == vnode)
    }
}

impl Daemon {
    pub fn new(
        cfg: &DaemonConfig,
        my_ip: Option<Ipv4Addr>,
        host_name: NodeName,
        now_sec: u64,
    ) -> Self {
        let table = NodeTable::new(my_ip, host_name, cfg.peer_port);
        let mut pools = vec![TaskPool::new(TrunkNode::default(), host_name, now_sec)];

        for name in &cfg.nodes {
            pools.push(TaskPool::new(
                TrunkNode::default(),
                NodeName::from_str(name),
                now_sec,
            ));
        }

        Daemon {
            table,
            pools,
            dump: DumpFlags::default(),
            service: ServiceState::new(now_sec, cfg.report_dir.clone()),
            reject: cfg
                .reject_tasks
                .iter()
                .map(|name| TaskHandle::from_str(name))
                .collect(),
        }
    }

    /// One-time socket-level setup: the daemon itself holds a permanent
    /// reference on the generic multicast group.
    pub fn startup(&mut self, wire: &mut dyn Wire) {
        if self.table.mcast_add_ref(MCAST_GROUP) {
            wire.join_group(MCAST_GROUP);
        }
    }

    pub fn handle_peer_datagram(
        &mut self,
        wire: &mut dyn Wire,
        src: SocketAddr,
        buf: &[u8],
        now_ms: u64,
        now_sec: u64,
    ) {
        let Daemon {
            table,
            pools,
            dump,
            service,
            ..
        } = self;
        let mut ctx = Ctx {
            wire,
            table,
            dump,
            now_ms,
            now_sec,
        };

        dispatcher::handle_peer_packet(pools, 0, &mut ctx, service, src, buf);
    }

    pub fn handle_client_datagram(
        &mut self,
        wire: &mut dyn Wire,
        src: SocketAddr,
        buf: &[u8],
        now_ms: u64,
        now_sec: u64,
    ) {
        let (hdr, cmd) = match command::parse(buf) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(%src, %err, "unparseable client command");
                wire.send_to_client(src, &command::ack(Status::BUG));
                return;
            }
        };

        let Daemon {
            table,
            pools,
            dump,
            reject,
            ..
        } = self;
        let mut ctx = Ctx {
            wire,
            table,
            dump,
            now_ms,
            now_sec,
        };

        match cmd {
            Command::Connect {
                pid,
                data_port,
                remote_addr,
            } => {
                let Some(idx) = pool_index(pools, hdr.virtual_node) else {
                    let ack = command::ack_connect(Status::NO_NODE, TaskId(0), hdr.client_name);

                    ctx.wire.send_to_client(src, &ack);
                    return;
                };
                let params = ConnectParams {
                    client_name: hdr.client_name,
                    pid,
                    cmd_port: src.port(),
                    data_port,
                    remote_addr,
                };
                let ack = match pools[idx].connect(&mut ctx, params) {
                    Ok(id) => {
                        let name = pools[idx]
                            .get(id)
                            .map_or(hdr.client_name, |task| task.handle);

                        command::ack_connect(Status::SUCCESS, id, name)
                    }
                    Err(status) => {
                        warn!(task = %hdr.client_name, %status, "failed connect");
                        command::ack_connect(status, TaskId(0), hdr.client_name)
                    }
                };

                ctx.wire.send_to_client(src, &ack);
            }

            Command::AddNode { addr, ip, name } => {
                service::apply_addr_update(pools, &mut ctx, TrunkNode::from_raw(addr), name, ip);
                rebind_pools(pools, ctx.table);
                ctx.wire.send_to_client(src, &command::ack(Status::SUCCESS));
            }

            Command::NameLookup { name } => {
                let ack = match ctx.table.name_to_node(name) {
                    Some(tn) => command::ack_name_lookup(Status::SUCCESS, tn.trunk(), tn.node()),
                    None => command::ack_name_lookup(Status::NO_NODE, 0, 0),
                };

                ctx.wire.send_to_client(src, &ack);
            }

            Command::NodeLookup { addr } => {
                let ack = match ctx.table.node_name(TrunkNode::from_raw(addr)) {
                    Some(name) => command::ack_node_lookup(Status::SUCCESS, name),
                    None => command::ack_node_lookup(Status::NO_NODE, NodeName::default()),
                };

                ctx.wire.send_to_client(src, &ack);
            }

            Command::LocalNode => {
                let ack = match ctx.table.node_name(ctx.table.my_node()) {
                    Some(name) => command::ack_node_lookup(Status::SUCCESS, name),
                    None => command::ack_node_lookup(Status::NO_NODE, NodeName::default()),
                };

                ctx.wire.send_to_client(src, &ack);
            }

            Command::DefaultNode => {
                let ack = command::ack_node_lookup(Status::SUCCESS, pools[0].node_name());

                ctx.wire.send_to_client(src, &ack);
            }

            Command::Unknown { op } => {
                warn!(op, task = %hdr.client_name, "unknown client command");
                ctx.wire.send_to_client(src, &command::ack(Status::BUG));
            }

            other => {
                let Some(idx) = pool_index(pools, hdr.virtual_node) else {
                    ctx.wire.send_to_client(src, &command::ack(Status::NO_NODE));
                    return;
                };
                let Some(task_id) = pools[idx].find_connection(hdr.client_name, src.port())
                else {
                    ctx.wire.send_to_client(src, &command::ack(Status::NOTASK));
                    return;
                };

                if let Some(task) = pools[idx].get_mut(task_id) {
                    task.command_received(now_sec);
                }
                handle_task_command(pools, idx, task_id, &mut ctx, reject, other);
            }
        }
    }

    /// Run both timer sweeps on every pool; returns the soonest absolute
    /// deadline still outstanding.
    pub fn sweep_timers(&mut self, wire: &mut dyn Wire, now_ms: u64, now_sec: u64) -> Option<u64> {
        let Daemon {
            table, pools, dump, ..
        } = self;
        let mut ctx = Ctx {
            wire,
            table,
            dump,
            now_ms,
            now_sec,
        };
        let mut next: Option<u64> = None;

        for pool in pools.iter_mut() {
            for deadline in [
                pool.request_timeout_sweep(&mut ctx),
                pool.pend_sweep(&mut ctx),
            ]
            .into_iter()
            .flatten()
            {
                next = Some(next.map_or(deadline, |soonest| soonest.min(deadline)));
            }
        }
        next
    }

    /// Post-dispatch safe point: free the task records staged for removal.
    pub fn drain_removed(&mut self, wire: &mut dyn Wire, now_ms: u64, now_sec: u64) {
        let Daemon {
            table, pools, dump, ..
        } = self;
        let mut ctx = Ctx {
            wire,
            table,
            dump,
            now_ms,
            now_sec,
        };

        for pool in pools.iter_mut() {
            pool.drain_removed(&mut ctx);
        }
    }
}

fn ack_task(
    pools: &mut [TaskPool],
    idx: usize,
    ctx: &mut Ctx,
    task_id: TaskId,
    frame: &[u8],
) {
    if !pools[idx].send_ack_to_task(ctx, task_id, frame) {
        pools[idx].remove_task(ctx, task_id);
    }
}

fn is_remote(pools: &[TaskPool], idx: usize, task_id: TaskId) -> bool {
    pools[idx]
        .get(task_id)
        .is_some_and(|task| matches!(task.kind, TaskKind::Remote { .. }))
}

fn handle_task_command(
    pools: &mut [TaskPool],
    idx: usize,
    task_id: TaskId,
    ctx: &mut Ctx,
    reject: &[TaskHandle],
    cmd: Command,
) {
    match cmd {
        Command::KeepAlive => {
            ack_task(pools, idx, ctx, task_id, &command::ack(Status::SUCCESS));
        }

        Command::Disconnect => {
            // Ack first: disconnecting cannot fail and the client doesn't
            // have to wait around for the teardown.
            ack_task(pools, idx, ctx, task_id, &command::ack(Status::SUCCESS));
            pools[idx].remove_task(ctx, task_id);
        }

        Command::DisconnectSingle => {
            ack_task(pools, idx, ctx, task_id, &command::ack(Status::SUCCESS));
            pools[idx].remove_only_task(ctx, task_id, Status::DISCONNECTED, false);
        }

        Command::Send {
            task,
            addr,
            payload,
        } => {
            let mut status = Status::SUCCESS;

            if payload.len() > MAX_USER_PACKET_SIZE {
                status = Status::IVM;
            } else if is_remote(pools, idx, task_id) && reject.contains(&task) {
                status = Status::REQREJ;
            } else {
                let node = if addr == 0 {
                    pools[idx].node()
                } else {
                    TrunkNode::from_raw(addr)
                };

                if ctx.table.lookup_addr(node).is_none() {
                    status = Status::NO_NODE;
                } else {
                    let hdr = AcnetHeader::new(
                        wire::flags::USM,
                        Status::SUCCESS,
                        node,
                        pools[idx].node(),
                        task,
                        task_id.raw() as u16,
                        0,
                        payload.len(),
                    );

                    ctx.send_to_network(&hdr, &payload);
                    if let Some(sender) = pools[idx].get_mut(task_id) {
                        sender.stats.usm_xmt.bump();
                    }
                    pools[idx].stats.usm_xmt.bump();
                }
            }

            ack_task(pools, idx, ctx, task_id, &command::ack(status));
        }

        Command::SendRequest {
            task,
            addr,
            flags,
            tmo_ms,
            payload,
        } => {
            let ack = send_request(pools, idx, task_id, ctx, reject, task, addr, flags, tmo_ms, &payload);

            ack_task(pools, idx, ctx, task_id, &ack);
        }

        Command::SendReply {
            rpyid,
            flags,
            status,
            payload,
        } => {
            let result = if payload.len() > MAX_USER_PACKET_SIZE {
                Status::IVM
            } else {
                pools[idx].send_reply_to_network(
                    ctx,
                    task_id,
                    RpyId(rpyid),
                    status,
                    &payload,
                    flags & RPY_M_ENDMULT != 0,
                )
            };

            ack_task(pools, idx, ctx, task_id, &command::ack_send_reply(result, 0));
        }

        Command::IgnoreRequest { rpyid } => {
            let accepts = pools[idx]
                .get(task_id)
                .is_some_and(|task| task.accepts_requests());
            let status = if accepts {
                pools[idx].end_rpy_id(ctx, RpyId(rpyid), Status::SUCCESS);
                Status::SUCCESS
            } else {
                Status::IVM
            };

            ack_task(pools, idx, ctx, task_id, &command::ack(status));
        }

        Command::RequestAck { rpyid } => {
            let status = request_ack(pools, idx, task_id, RpyId(rpyid));

            ack_task(pools, idx, ctx, task_id, &command::ack(status));
        }

        Command::Cancel { reqid } => {
            let owned = pools[idx]
                .req_pool
                .get(ReqId(reqid))
                .is_some_and(|req| req.owner == task_id);
            let status = if owned {
                pools[idx].cancel_req_id(ctx, ReqId(reqid), true, None);
                Status::SUCCESS
            } else {
                Status::NSR
            };

            ack_task(pools, idx, ctx, task_id, &command::ack(status));
        }

        Command::RenameTask { new_name } => {
            let status = if pools[idx].rename(ctx, task_id, new_name) {
                Status::SUCCESS
            } else {
                Status::NAME_IN_USE
            };

            ack_task(pools, idx, ctx, task_id, &command::ack_send_reply(status, 0));
        }

        Command::TaskPid => {
            let pid = pools[idx].get(task_id).map_or(0, |task| task.pid);

            ack_task(
                pools,
                idx,
                ctx,
                task_id,
                &command::ack_task_pid(Status::SUCCESS, pid),
            );
        }

        Command::GlobalStats => {
            let stats = pools[idx].global_stats();

            ack_task(
                pools,
                idx,
                ctx,
                task_id,
                &command::ack_global_stats(Status::SUCCESS, &stats),
            );
        }

        Command::ReceiveRequests => {
            let status = match pools[idx].get_mut(task_id).map(|task| &mut task.kind) {
                Some(TaskKind::Local { receiving }) => {
                    *receiving = true;
                    Status::SUCCESS
                }
                _ => Status::IVM,
            };

            ack_task(pools, idx, ctx, task_id, &command::ack(status));
        }

        Command::BlockRequests => {
            let is_local = matches!(
                pools[idx].get(task_id).map(|task| task.kind),
                Some(TaskKind::Local { .. })
            );
            let status = if is_local {
                if let Some(TaskKind::Local { receiving }) =
                    pools[idx].get_mut(task_id).map(|task| &mut task.kind)
                {
                    *receiving = false;
                }

                // Blocking ends every reply the task was serving.
                let replies: Vec<u16> = pools[idx]
                    .get(task_id)
                    .map(|task| task.replies.iter().copied().collect())
                    .unwrap_or_default();

                for rpy in replies {
                    pools[idx].end_rpy_id(ctx, RpyId(rpy), Status::DISCONNECTED);
                }
                Status::SUCCESS
            } else {
                Status::IVM
            };

            ack_task(pools, idx, ctx, task_id, &command::ack(status));
        }

        // Connectionless commands are handled before task lookup; reaching
        // here is a dispatch bug.
        other => {
            warn!(?other, "command routed to a task handler unexpectedly");
            ack_task(pools, idx, ctx, task_id, &command::ack(Status::BUG));
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn send_request(
    pools: &mut [TaskPool],
    idx: usize,
    task_id: TaskId,
    ctx: &mut Ctx,
    reject: &[TaskHandle],
    task: TaskHandle,
    addr: u16,
    req_flags: u16,
    tmo_ms: Option<u32>,
    payload: &[u8],
) -> Vec<u8> {
    if payload.len() > MAX_USER_PACKET_SIZE {
        return command::ack_send_request(Status::IVM, 0);
    }
    if is_remote(pools, idx, task_id) && reject.contains(&task) {
        return command::ack_send_request(Status::REQREJ, 0);
    }

    let node = if addr == 0 {
        pools[idx].node()
    } else {
        TrunkNode::from_raw(addr)
    };

    if ctx.table.lookup_addr(node).is_none() {
        return command::ack_send_request(Status::NO_NODE, 0);
    }

    let mcast = ctx.table.is_multicast_node(node);
    let tmo = tmo_ms.map_or(REQUEST_TIMEOUT_MS, u64::from);
    let own_node = pools[idx].node();
    let allocated = pools[idx].req_pool.alloc(
        task_id,
        task,
        own_node,
        node,
        req_flags,
        tmo,
        mcast,
        ctx.now_ms,
        ctx.now_sec,
    );

    let Some(req_id) = allocated else {
        pools[idx].stat_req_q_limit.bump();
        return command::ack_send_request(Status::NLM, 0);
    };

    if let Some(sender) = pools[idx].get_mut(task_id) {
        sender.requests.insert(req_id.raw());
        sender.stats.req_xmt.bump();
    }
    pools[idx].stats.req_xmt.bump();

    let mult = if req_flags & REQ_M_MULTRPY != 0 {
        wire::flags::MLT
    } else {
        0
    };
    let hdr = AcnetHeader::new(
        wire::flags::REQ | mult,
        Status::SUCCESS,
        node,
        own_node,
        task,
        task_id.raw() as u16,
        req_id.raw(),
        payload.len(),
    );

    ctx.send_to_network(&hdr, payload);
    command::ack_send_request(Status::SUCCESS, req_id.raw())
}

fn request_ack(pools: &mut [TaskPool], idx: usize, task_id: TaskId, id: RpyId) -> Status {
    let owned = pools[idx]
        .rpy_pool
        .get(id)
        .is_some_and(|rpy| rpy.owner == task_id);

    if !owned {
        return Status::NSR;
    }

    let already_acked = pools[idx].rpy_pool.get(id).map_or(true, |rpy| rpy.acked);

    if let Some(rpy) = pools[idx].rpy_pool.get_mut(id) {
        rpy.acked = true;
    }

    // A repeated ack must not touch the counter; only the first one pays
    // down the pending count.
    let decremented = !already_acked
        && pools[idx]
            .get_mut(task_id)
            .is_some_and(|task| task.decrement_pending());

    if already_acked || !decremented {
        Status::BUG
    } else {
        Status::SUCCESS
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// Bind the sockets and run the event loop until a termination signal.
pub async fn run(mut daemon: Daemon, cfg: &DaemonConfig) -> anyhow::Result<()> {
    let peer = Arc::new(bind_udp(SocketAddr::new(
        IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        cfg.peer_port,
    ))?);
    let client = Arc::new(bind_udp(transport::loopback(cfg.client_port))?);
    let mut wire = UdpWire::new(peer.clone(), client.clone());

    daemon.startup(&mut wire);
    info!(
        peer_port = cfg.peer_port,
        client_port = cfg.client_port,
        "acnetd listening"
    );

    let start = Instant::now();
    let elapsed_ms = |start: &Instant| start.elapsed().as_millis() as u64;
    let mut peer_buf = vec![0u8; 65536];
    let mut client_buf = vec![0u8; 65536];

    loop {
        let now_ms = elapsed_ms(&start);
        let next = daemon.sweep_timers(&mut wire, now_ms, unix_now());
        let sleep_ms = next.map_or(3_600_000, |deadline| deadline.saturating_sub(now_ms).max(1));

        tokio::select! {
            received = peer.recv_from(&mut peer_buf) => match received {
                Ok((len, src)) => {
                    daemon.handle_peer_datagram(
                        &mut wire, src, &peer_buf[..len], elapsed_ms(&start), unix_now(),
                    );
                }
                Err(err) => warn!(%err, "error reading peer socket"),
            },
            received = client.recv_from(&mut client_buf) => match received {
                Ok((len, src)) => {
                    daemon.handle_client_datagram(
                        &mut wire, src, &client_buf[..len], elapsed_ms(&start), unix_now(),
                    );
                }
                Err(err) => warn!(%err, "error reading client socket"),
            },
            _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("termination signal");
                break;
            }
        }

        daemon.drain_removed(&mut wire, elapsed_ms(&start), unix_now());
    }

    Ok(())
}
