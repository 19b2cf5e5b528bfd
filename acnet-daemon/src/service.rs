//! The in-process ACNET service task.
//!
//! Requests (and a few USMs) addressed to the `ACNET`/`ACNAUX` handle carry
//! a leading 16-bit word of `(subType << 8) | type` selecting a diagnostic
//! or administrative operation. Every handler replies exactly once; size and
//! option validation failures answer `ACNET_LEVEL2`.

use crate::daemon::rebind_pools;
use crate::nodetable::{AddrUpdate, MIN_TRUNK};
use crate::report;
use crate::taskpool::TaskPool;
use crate::transport::Ctx;
use acnet_core::wire::ms_to_time48;
use acnet_core::{NodeName, RpyId, Status, TaskHandle, TaskId, TrunkNode};
use bytes::BufMut;
use chrono::{Datelike, Local, Timelike};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Reported by the version type code: daemon version, protocol version,
/// and the UTI interface version.
const VERSION_TRIPLE: [u16; 3] = [0x0914, 0x0804, 0x0800];

/// Detail queries cap their answer at this many records and report TRP
/// beyond it; the active-id lists just fill whatever the pool holds.
const MAX_DETAIL_RECORDS: usize = 16;

/// Report requests are honored at most once a minute.
const REPORT_HOLDOFF_SEC: u64 = 60;

pub struct ServiceState {
    pub boot_sec: u64,
    pub last_report_sec: u64,
    pub report_dir: PathBuf,
    pub killers_sent: bool,
}

impl ServiceState {
    pub fn new(boot_sec: u64, report_dir: PathBuf) -> Self {
        ServiceState {
            boot_sec,
            last_report_sec: 0,
            report_dir,
            killers_sent: false,
        }
    }
}

fn send_last_reply(
    pools: &mut [TaskPool],
    idx: usize,
    ctx: &mut Ctx,
    rpy_raw: u16,
    status: Status,
    data: &[u8],
) {
    // An invalid id (e.g. from a USM-borne killer message) quietly drops
    // the answer, which keeps every handler single-reply without special
    // cases.
    let _ = pools[idx].send_reply_to_network(ctx, TaskId(0), RpyId(rpy_raw), status, data, true);
}

fn word(data: &[u8], index: usize) -> u16 {
    u16::from_le_bytes([data[index * 2], data[index * 2 + 1]])
}

fn long(data: &[u8], byte_offset: usize) -> u32 {
    u32::from_le_bytes([
        data[byte_offset],
        data[byte_offset + 1],
        data[byte_offset + 2],
        data[byte_offset + 3],
    ])
}

/// Dispatch one service packet. `rpy_raw` is the reply id allocated for the
/// request, or garbage for USMs (whose replies then go nowhere).
pub fn handle_packet(
    pools: &mut [TaskPool],
    idx: usize,
    ctx: &mut Ctx,
    state: &mut ServiceState,
    rpy_raw: u16,
    payload: &[u8],
) {
    // The diagnostics historically operate on an array of 16-bit words.
    if payload.len() < 2 || payload.len() & 1 != 0 {
        if ctx.dump.incoming {
            warn!(size = payload.len(), "invalid service request size");
        }
        send_last_reply(pools, idx, ctx, rpy_raw, Status::LEVEL2, &[]);
        return;
    }

    let type_word = word(payload, 0);
    let type_code = (type_word & 0xff) as u8 as i8;
    let sub_type = (type_word >> 8) as u8;
    let data = &payload[2..];

    match type_code {
        0 => send_last_reply(pools, idx, ctx, rpy_raw, Status::SUCCESS, &[0, 0]),
        1 => task_id_handler(pools, idx, ctx, rpy_raw, data),
        2 => task_name_handler(pools, idx, ctx, rpy_raw, sub_type),
        3 => version_handler(pools, idx, ctx, rpy_raw),
        4 => tasks_handler(pools, idx, ctx, rpy_raw, sub_type),
        5 => task_resources_handler(pools, idx, ctx, rpy_raw),
        6 => node_stats_handler(pools, idx, ctx, rpy_raw, sub_type),
        7 => tasks_stats_handler(pools, idx, ctx, rpy_raw, sub_type),
        9 => packet_count_handler(pools, idx, ctx, state, rpy_raw),
        11 => killer_message_handler(pools, idx, ctx, rpy_raw, sub_type, data),
        17 => ip_node_table_handler(pools, idx, ctx, state, rpy_raw, sub_type, data),
        -1 => time_handler(pools, idx, ctx, rpy_raw, sub_type),
        -2 => debug_handler(pools, idx, ctx, rpy_raw, sub_type, data),
        -3 => active_requests(pools, idx, ctx, rpy_raw, sub_type, data),
        -4 => active_replies(pools, idx, ctx, rpy_raw, sub_type, data),
        -5 => request_detail(pools, idx, ctx, rpy_raw, data),
        -6 => reply_detail(pools, idx, ctx, rpy_raw, data),
        -7 => request_report(pools, idx, ctx, state, rpy_raw),
        other => {
            warn!(type_code = other, "unsupported ACNET type code");
            send_last_reply(pools, idx, ctx, rpy_raw, Status::LEVEL2, &[]);
        }
    }
}

fn task_id_handler(pools: &mut [TaskPool], idx: usize, ctx: &mut Ctx, rpy_raw: u16, data: &[u8]) {
    if data.len() < 4 {
        send_last_reply(pools, idx, ctx, rpy_raw, Status::LEVEL2, &[]);
        return;
    }

    let handle = TaskHandle(long(data, 0));

    match pools[idx].tasks_for_handle(handle).first() {
        Some(id) => {
            let rpy = (id.raw() as u16).to_le_bytes();

            send_last_reply(pools, idx, ctx, rpy_raw, Status::SUCCESS, &rpy);
        }
        None => send_last_reply(pools, idx, ctx, rpy_raw, Status::NOTASK, &[]),
    }
}

fn task_name_handler(pools: &mut [TaskPool], idx: usize, ctx: &mut Ctx, rpy_raw: u16, sub: u8) {
    match pools[idx].get(TaskId(sub)) {
        Some(task) => {
            let rpy = task.handle.raw().to_le_bytes();

            send_last_reply(pools, idx, ctx, rpy_raw, Status::SUCCESS, &rpy);
        }
        None => send_last_reply(pools, idx, ctx, rpy_raw, Status::NOTASK, &[]),
    }
}

fn version_handler(pools: &mut [TaskPool], idx: usize, ctx: &mut Ctx, rpy_raw: u16) {
    let mut rpy = Vec::with_capacity(6);

    for v in VERSION_TRIPLE {
        rpy.put_u16_le(v);
    }
    send_last_reply(pools, idx, ctx, rpy_raw, Status::SUCCESS, &rpy);
}

fn tasks_handler(pools: &mut [TaskPool], idx: usize, ctx: &mut Ctx, rpy_raw: u16, sub: u8) {
    if sub == 0 {
        pools[idx].remove_inactive(ctx);
    }

    let pool = &pools[idx];
    let mut rpy = Vec::new();

    match sub {
        0 | 2 => {
            let tasks: Vec<_> = pool.iter_tasks().collect();

            rpy.put_u16_le(tasks.len() as u16);
            for task in &tasks {
                rpy.put_u32_le(if sub == 2 { task.pid } else { task.handle.raw() });
            }
            for task in &tasks {
                rpy.put_u8(task.id.raw());
            }
            if tasks.len() & 1 != 0 {
                rpy.put_u8(0);
            }
        }
        1 => {
            let tasks: Vec<_> = pool.iter_tasks().filter(|t| t.is_receiving()).collect();

            rpy.put_u16_le(tasks.len() as u16);
            for task in &tasks {
                rpy.put_u32_le(task.handle.raw());
            }
            for task in &tasks {
                rpy.put_u8(task.id.raw());
            }
            if tasks.len() & 1 != 0 {
                rpy.put_u8(0);
            }
        }
        3 => {
            let tasks: Vec<_> = pool.iter_tasks().collect();

            rpy.put_u16_le(tasks.len() as u16);
            for task in &tasks {
                rpy.put_u8(task.id.raw());
                rpy.put_u8(u8::from(task.is_receiving()));
                rpy.put_u32_le(task.handle.raw());
                rpy.put_u32_le(task.pid);
            }
        }
        _ => {}
    }

    send_last_reply(pools, idx, ctx, rpy_raw, Status::SUCCESS, &rpy);
}

fn task_resources_handler(pools: &mut [TaskPool], idx: usize, ctx: &mut Ctx, rpy_raw: u16) {
    let pool = &pools[idx];
    let mut rpy = Vec::with_capacity(10);

    rpy.put_u16_le(0);
    rpy.put_u16_le(0);
    rpy.put_u16_le(pool.active_count() as u16);
    rpy.put_u16_le(pool.rum_handle_count() as u16);
    rpy.put_u16_le((pool.request_count() + pool.reply_count()) as u16);

    send_last_reply(pools, idx, ctx, rpy_raw, Status::SUCCESS, &rpy);
}

fn node_stats_handler(pools: &mut [TaskPool], idx: usize, ctx: &mut Ctx, rpy_raw: u16, sub: u8) {
    // A clock stepped backwards would make the elapsed stamp garbage.
    if ctx.now_sec < pools[idx].stat_time_base_sec {
        pools[idx].stat_time_base_sec = ctx.now_sec;
        pools[idx].stats.reset();
    }

    let pool = &pools[idx];
    let mut rpy = Vec::with_capacity(26);

    rpy.extend_from_slice(&ms_to_time48(
        (ctx.now_sec - pool.stat_time_base_sec) * 1000,
    ));
    for _ in 0..4 {
        rpy.put_u16_le(0);
    }
    rpy.put_u16_le(pool.stats.usm_xmt.as_u16());
    rpy.put_u16_le(pool.stats.req_xmt.as_u16());
    rpy.put_u16_le(pool.stats.rpy_xmt.as_u16());
    rpy.put_u16_le(pool.stats.usm_rcv.as_u16());
    rpy.put_u16_le(pool.stats.req_rcv.as_u16());
    rpy.put_u16_le(pool.stats.rpy_rcv.as_u16());

    if sub != 0 {
        pools[idx].stat_time_base_sec = ctx.now_sec;
        pools[idx].stats.reset();
    }

    send_last_reply(pools, idx, ctx, rpy_raw, Status::SUCCESS, &rpy);
}

fn tasks_stats_handler(pools: &mut [TaskPool], idx: usize, ctx: &mut Ctx, rpy_raw: u16, sub: u8) {
    pools[idx].remove_inactive(ctx);

    let base = pools[idx].task_stat_time_base_sec;
    let mut rpy = Vec::new();

    rpy.extend_from_slice(&ms_to_time48((ctx.now_sec - base) * 1000));

    let count = pools[idx].active_count();

    // Task count plus the type code of per-task stats.
    rpy.put_u16_le(0x900 + count as u16);

    for task in pools[idx].iter_tasks() {
        rpy.put_u16_le(task.id.raw() as u16);
        rpy.put_u32_le(task.handle.raw());
        rpy.put_u16_le(task.stats.usm_xmt.as_u16());
        rpy.put_u16_le(task.stats.req_xmt.as_u16());
        rpy.put_u16_le(task.stats.rpy_xmt.as_u16());
        rpy.put_u16_le(task.stats.usm_rcv.as_u16());
        rpy.put_u16_le(task.stats.req_rcv.as_u16());
        rpy.put_u16_le(task.stats.rpy_rcv.as_u16());
    }

    if sub & 1 != 0 {
        pools[idx].task_stat_time_base_sec = ctx.now_sec;
        for slot in 0..crate::task::MAX_TASKS {
            if let Some(task) = pools[idx].get_mut(TaskId(slot as u8)) {
                task.stats.reset();
            }
        }
    }

    send_last_reply(pools, idx, ctx, rpy_raw, Status::SUCCESS, &rpy);
}

fn packet_count_handler(
    pools: &mut [TaskPool],
    idx: usize,
    ctx: &mut Ctx,
    state: &mut ServiceState,
    rpy_raw: u16,
) {
    // A stepped-back clock loses the boot moment; restart the count there.
    if ctx.now_sec < state.boot_sec {
        state.boot_sec = ctx.now_sec;
    }

    let mut rpy = Vec::with_capacity(10);

    rpy.put_u32_le(pools[idx].stats.total().as_u32());
    rpy.extend_from_slice(&ms_to_time48((ctx.now_sec - state.boot_sec) * 1000));

    send_last_reply(pools, idx, ctx, rpy_raw, Status::SUCCESS, &rpy);
}

fn killer_message_handler(
    pools: &mut [TaskPool],
    idx: usize,
    ctx: &mut Ctx,
    rpy_raw: u16,
    sub: u8,
    data: &[u8],
) {
    // Respond to the requestor first: the cancellations below may destroy
    // the very reply id the acknowledgement rides on.
    let status = if sub == 2 { Status::SUCCESS } else { Status::LEVEL2 };

    send_last_reply(pools, idx, ctx, rpy_raw, status, &[]);

    if sub != 2 {
        return;
    }

    if data.len() < 4 {
        if ctx.dump.incoming {
            warn!(size = data.len(), "killer message too small, ignoring");
        }
        return;
    }

    let count = word(data, 0) as usize;

    if data.len() != (1 + count) * 2 {
        if ctx.dump.incoming {
            warn!(
                size = data.len(),
                expect = (1 + count) * 2,
                "killer message size mismatch, ignoring"
            );
        }
        return;
    }

    for entry in 0..count {
        let tn = TrunkNode::from_raw(word(data, 1 + entry));

        debug!(node = %tn, "killer message: cancelling traffic");
        for pool in pools.iter_mut() {
            pool.cancel_req_to_node(ctx, tn);
            pool.end_rpy_to_node(ctx, tn);
        }
    }
}

const WRITE_FLG: u8 = 0x80;
const SINGLE_FLG: u8 = 0x40;

fn ip_node_table_handler(
    pools: &mut [TaskPool],
    idx: usize,
    ctx: &mut Ctx,
    state: &mut ServiceState,
    rpy_raw: u16,
    sub: u8,
    data: &[u8],
) {
    let trunk_index = sub & 0x0f;
    let trunk = MIN_TRUNK + trunk_index;

    if sub & WRITE_FLG != 0 {
        if sub & SINGLE_FLG == 0 && data.len() >= 2 {
            let num_entries = word(data, 0) as usize;
            let body = &data[2..];

            if trunk_index == 0 && num_entries == 0 {
                // An all-zero download on trunk 0 finalizes the table.
                ctx.table.set_last_download(ctx.now_sec);
                send_last_reply(pools, idx, ctx, rpy_raw, Status::SUCCESS, &[]);
                announce_our_addresses(pools, idx, ctx, state);
                return;
            }

            if num_entries <= 256 {
                // New-style downloads carry addresses then names; older
                // applications send only the addresses.
                let with_names = body.len() == num_entries * 8;
                let addrs_only = body.len() == num_entries * 4;

                if with_names || addrs_only {
                    send_last_reply(pools, idx, ctx, rpy_raw, Status::SUCCESS, &[]);
                    for entry in 0..num_entries {
                        let tn = TrunkNode::new(trunk, entry as u8);
                        // Addresses travel in network order, names in the
                        // packet's native little-endian.
                        let off = entry * 4;
                        let ip = std::net::Ipv4Addr::new(
                            body[off],
                            body[off + 1],
                            body[off + 2],
                            body[off + 3],
                        );
                        let name = if with_names {
                            NodeName(long(body, num_entries * 4 + entry * 4))
                        } else {
                            NodeName::default()
                        };

                        apply_addr_update(pools, ctx, tn, name, ip);
                    }
                    rebind_pools(pools, ctx.table);
                    return;
                }
            }
        }
        send_last_reply(pools, idx, ctx, rpy_raw, Status::LEVEL2, &[]);
    } else if sub & SINGLE_FLG != 0 {
        if data.len() >= 2 && word(data, 0) < 256 {
            let tn = TrunkNode::new(trunk, word(data, 0) as u8);
            let addr = ctx
                .table
                .entry(tn)
                .map_or(0u32, |entry| u32::from(entry.addr));
            let rpy = addr.to_be_bytes();

            send_last_reply(pools, idx, ctx, rpy_raw, Status::SUCCESS, &rpy);
        } else {
            send_last_reply(pools, idx, ctx, rpy_raw, Status::LEVEL2, &[]);
        }
    } else if ctx.table.trunk_exists(trunk) {
        let mut rpy = Vec::with_capacity(1024);

        for node in 0..=255u8 {
            let addr = ctx
                .table
                .entry(TrunkNode::new(trunk, node))
                .map_or(0u32, |entry| u32::from(entry.addr));

            rpy.extend_from_slice(&addr.to_be_bytes());
        }
        send_last_reply(pools, idx, ctx, rpy_raw, Status::SUCCESS, &rpy);
    } else {
        send_last_reply(pools, idx, ctx, rpy_raw, Status::LEVEL2, &[]);
    }
}

/// Table mutation plus the traffic teardown an IP move implies.
pub fn apply_addr_update(
    pools: &mut [TaskPool],
    ctx: &mut Ctx,
    tn: TrunkNode,
    name: NodeName,
    ip: std::net::Ipv4Addr,
) {
    if ctx.table.update_addr(tn, name, ip) == AddrUpdate::Moved {
        // A node that moved IPs is effectively a new peer; nothing in
        // flight can be trusted to finish.
        for pool in pools.iter_mut() {
            pool.cancel_req_to_node(ctx, tn);
            pool.end_rpy_to_node(ctx, tn);
        }
    }
}

/// After the first complete download we know every trunk/node that maps to
/// our address; claim them so stale peers cancel traffic to the previous
/// owner.
fn announce_our_addresses(
    pools: &mut [TaskPool],
    idx: usize,
    ctx: &mut Ctx,
    state: &mut ServiceState,
) {
    rebind_pools(pools, ctx.table);

    if state.killers_sent {
        return;
    }
    state.killers_sent = true;

    for tn in ctx.table.killer_targets() {
        send_killer_message(&mut pools[idx], ctx, tn);
    }
}

/// Multicast the type 11/subType 2 administrative message naming `tn`.
pub fn send_killer_message(pool: &mut TaskPool, ctx: &mut Ctx, tn: TrunkNode) {
    let mut data = Vec::with_capacity(6);

    data.put_u16_le(0x020b);
    data.put_u16_le(1);
    data.put_u16_le(tn.raw());

    let hdr = acnet_core::AcnetHeader::new(
        acnet_core::wire::flags::USM,
        Status::SUCCESS,
        TrunkNode::MULTICAST,
        pool.node(),
        TaskHandle::from_str("ACNET"),
        0,
        0,
        data.len(),
    );

    ctx.send_to_network(&hdr, &data);
    pool.stats.usm_xmt.bump();
}

fn time_handler(pools: &mut [TaskPool], idx: usize, ctx: &mut Ctx, rpy_raw: u16, sub: u8) {
    if sub != 1 {
        send_last_reply(pools, idx, ctx, rpy_raw, Status::LEVEL2, &[]);
        return;
    }

    let now = Local::now();
    let mut rpy = Vec::with_capacity(16);

    rpy.put_u16_le((now.year() - 1900) as u16);
    rpy.put_u16_le(now.month() as u16);
    rpy.put_u16_le(now.day() as u16);
    rpy.put_u16_le(now.hour() as u16);
    rpy.put_u16_le(now.minute() as u16);
    rpy.put_u16_le(now.second() as u16);
    rpy.put_u16_le((now.timestamp_subsec_micros() / 10_000) as u16);
    rpy.put_u16_le(100);

    send_last_reply(pools, idx, ctx, rpy_raw, Status::SUCCESS, &rpy);
}

fn debug_handler(
    pools: &mut [TaskPool],
    idx: usize,
    ctx: &mut Ctx,
    rpy_raw: u16,
    sub: u8,
    data: &[u8],
) {
    use crate::command::client_msg;

    let mut status = Status::SUCCESS;

    match sub {
        1 => ctx.dump.incoming = true,
        2 => ctx.dump.outgoing = true,
        3 => {
            ctx.dump.incoming = true;
            ctx.dump.outgoing = true;
        }
        4 => ctx.dump.incoming = false,
        5 => ctx.dump.outgoing = false,
        6 => {
            ctx.dump.incoming = false;
            ctx.dump.outgoing = false;
        }
        7..=10 => {
            let msg_type = match sub {
                7 => client_msg::DUMP_TASK_INCOMING_ON,
                8 => client_msg::DUMP_TASK_INCOMING_OFF,
                9 => client_msg::DUMP_PROCESS_INCOMING_ON,
                _ => client_msg::DUMP_PROCESS_INCOMING_OFF,
            };

            if data.len() == 4 {
                let handle = TaskHandle(long(data, 0));

                if !send_message_to_clients(&mut pools[idx], ctx, handle, msg_type) {
                    status = Status::LEVEL2;
                }
            } else {
                status = Status::LEVEL2;
            }
        }
        _ => status = Status::LEVEL2,
    }

    send_last_reply(pools, idx, ctx, rpy_raw, status, &[]);
}

/// Fan an async control message out to every task holding `handle`.
fn send_message_to_clients(
    pool: &mut TaskPool,
    ctx: &mut Ctx,
    handle: TaskHandle,
    msg_type: u8,
) -> bool {
    let mut found = false;

    for id in pool.tasks_for_handle(handle) {
        let Some(task) = pool.get(id) else {
            continue;
        };

        if task.is_internal() {
            continue;
        }

        let frame = crate::command::client_message(task.pid, handle, msg_type);
        let addr = task.data_addr();
        let ok = ctx.wire.send_to_client(addr, &frame);

        if ok {
            found = true;
        }
        if let Some(task) = pool.get_mut(id) {
            task.note_send_result(ok);
        }
    }
    found
}

fn active_requests(
    pools: &mut [TaskPool],
    idx: usize,
    ctx: &mut Ctx,
    rpy_raw: u16,
    sub: u8,
    data: &[u8],
) {
    let pool = &pools[idx];
    let ids = pool.req_pool.fill_active(|info| {
        if data.is_empty() {
            return true;
        }
        match sub {
            0 => id_list_u16(data).any(|raw| info.rem_node.raw() == raw),
            1 => id_list_u32(data).any(|raw| info.task_name.raw() == raw),
            2 => id_list_u32(data).any(|raw| {
                pool.get(info.owner)
                    .is_some_and(|task| task.handle.raw() == raw)
            }),
            _ => false,
        }
    });

    send_id_list(pools, idx, ctx, rpy_raw, ids);
}

fn active_replies(
    pools: &mut [TaskPool],
    idx: usize,
    ctx: &mut Ctx,
    rpy_raw: u16,
    sub: u8,
    data: &[u8],
) {
    let pool = &pools[idx];
    let ids = pool.rpy_pool.fill_active(|info| {
        if data.is_empty() {
            return true;
        }
        match sub {
            0 => id_list_u16(data).any(|raw| info.rem_node.raw() == raw),
            1 => id_list_u32(data).any(|raw| info.task_name.raw() == raw),
            2 => id_list_u32(data).any(|raw| {
                pool.get(info.owner)
                    .is_some_and(|task| task.handle.raw() == raw)
            }),
            _ => false,
        }
    });

    send_id_list(pools, idx, ctx, rpy_raw, ids);
}

fn id_list_u16(data: &[u8]) -> impl Iterator<Item = u16> + '_ {
    data.chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
}

fn id_list_u32(data: &[u8]) -> impl Iterator<Item = u32> + '_ {
    data.chunks_exact(4)
        .map(|quad| u32::from_le_bytes([quad[0], quad[1], quad[2], quad[3]]))
}

fn send_id_list(pools: &mut [TaskPool], idx: usize, ctx: &mut Ctx, rpy_raw: u16, ids: Vec<u16>) {
    let mut rpy = Vec::with_capacity(ids.len() * 2);

    for id in ids {
        rpy.put_u16_le(id);
    }
    send_last_reply(pools, idx, ctx, rpy_raw, Status::SUCCESS, &rpy);
}

fn request_detail(pools: &mut [TaskPool], idx: usize, ctx: &mut Ctx, rpy_raw: u16, data: &[u8]) {
    let pool = &pools[idx];
    let mut rpy = Vec::new();
    let mut status = Status::SUCCESS;
    let mut total = 0;

    for id in id_list_u16(data) {
        if total == MAX_DETAIL_RECORDS {
            status = Status::TRP;
            break;
        }

        let owner_handle =
            |owner: TaskId| pool.get(owner).map_or(0, |task| task.handle.raw());

        if let Some(detail) = pool.req_pool.fill_detail(id, owner_handle) {
            rpy.put_u16_le(detail.id);
            rpy.put_u16_le(detail.rem_node);
            rpy.put_u32_le(detail.rem_name);
            rpy.put_u32_le(detail.lcl_name);
            rpy.put_u32_le(detail.init_time);
            rpy.put_u32_le(detail.last_update);
            total += 1;
        }
    }

    send_last_reply(pools, idx, ctx, rpy_raw, status, &rpy);
}

fn reply_detail(pools: &mut [TaskPool], idx: usize, ctx: &mut Ctx, rpy_raw: u16, data: &[u8]) {
    let pool = &pools[idx];
    let mut rpy = Vec::new();
    let mut status = Status::SUCCESS;
    let mut total = 0;

    for id in id_list_u16(data) {
        if total == MAX_DETAIL_RECORDS {
            status = Status::TRP;
            break;
        }

        let owner_handle =
            |owner: TaskId| pool.get(owner).map_or(0, |task| task.handle.raw());

        if let Some(detail) = pool.rpy_pool.fill_detail(id, owner_handle) {
            rpy.put_u16_le(detail.id);
            rpy.put_u16_le(detail.req_id);
            rpy.put_u16_le(detail.rem_node);
            rpy.put_u32_le(detail.rem_name);
            rpy.put_u32_le(detail.lcl_name);
            rpy.put_u32_le(detail.init_time);
            rpy.put_u32_le(detail.last_update);
            total += 1;
        }
    }

    send_last_reply(pools, idx, ctx, rpy_raw, status, &rpy);
}

fn request_report(
    pools: &mut [TaskPool],
    idx: usize,
    ctx: &mut Ctx,
    state: &mut ServiceState,
    rpy_raw: u16,
) {
    if ctx.now_sec.saturating_sub(state.last_report_sec) <= REPORT_HOLDOFF_SEC {
        send_last_reply(pools, idx, ctx, rpy_raw, Status::BUSY, &[]);
        return;
    }

    state.last_report_sec = ctx.now_sec;

    let status = match report::write_report(pools, ctx.table, &state.report_dir) {
        Ok(path) => {
            debug!(path = %path.display(), "report written");
            Status::SUCCESS
        }
        Err(err) => {
            warn!(%err, "report generation failed");
            Status::LEVEL2
        }
    };

    send_last_reply(pools, idx, ctx, rpy_raw, status, &[]);
}
