//! Inbound peer datagram classification.
//!
//! Each datagram from the network socket is validated (header shape, source
//! address against the node table, destination against our virtual nodes)
//! and then routed down the USM, REQ, RPY, or CAN path.

use crate::service::{self, ServiceState};
use crate::taskpool::{AcceptError, TaskPool};
use crate::transport::{dest_node, dump_packet, source_node, Ctx};
use acnet_core::wire::{AcnetHeader, HEADER_SIZE};
use acnet_core::{ReqId, Status, TaskId};
use std::net::SocketAddr;
use tracing::{debug, warn};

/// Route one datagram received on the peer socket.
pub fn handle_peer_packet(
    pools: &mut [TaskPool],
    default_pool: usize,
    ctx: &mut Ctx,
    state: &mut ServiceState,
    src: SocketAddr,
    buf: &[u8],
) {
    let hdr = match AcnetHeader::decode(buf) {
        Ok(hdr) => hdr,
        Err(err) => {
            if ctx.dump.incoming {
                warn!(%src, %err, "dropping malformed datagram");
            }
            return;
        }
    };

    let payload_len = (hdr.msg_len as usize)
        .min(buf.len())
        .saturating_sub(HEADER_SIZE);
    let payload = &buf[HEADER_SIZE..HEADER_SIZE + payload_len];

    if ctx.dump.incoming {
        dump_packet("in", &hdr, payload);
    }

    // The claimed source must resolve to the address the datagram actually
    // came from.
    let from = source_node(&hdr);
    let valid_source = ctx
        .table
        .lookup_addr(from)
        .is_some_and(|known| known.ip() == src.ip());

    if !valid_source {
        if ctx.dump.incoming {
            warn!(%src, node = %from, "dropping datagram from masquerading source");
        }
        return;
    }

    let dst = dest_node(&hdr);
    let idx = match pools.iter().position(|pool| pool.node() == dst) {
        Some(idx) => idx,
        None if ctx.table.is_multicast_node(dst) => default_pool,
        None => {
            if ctx.dump.incoming {
                warn!(node = %dst, "dropping datagram for a node we don't host");
            }
            return;
        }
    };

    if hdr.is_cancel() {
        handle_cancel(&mut pools[idx], ctx, &hdr);
    } else if hdr.is_usm() {
        handle_usm(pools, idx, ctx, state, &hdr, buf, payload);
    } else if hdr.is_request() {
        handle_request(pools, idx, ctx, state, &hdr, payload);
    } else if hdr.is_reply() {
        handle_reply(&mut pools[idx], ctx, &hdr, buf);
    } else if ctx.dump.incoming {
        warn!(flags = hdr.flags, "dropping datagram with unknown type");
    }
}

fn handle_usm(
    pools: &mut [TaskPool],
    idx: usize,
    ctx: &mut Ctx,
    state: &mut ServiceState,
    hdr: &AcnetHeader,
    frame: &[u8],
    payload: &[u8],
) {
    pools[idx].stats.usm_rcv.bump();

    let receivers: Vec<TaskId> = pools[idx]
        .tasks_for_handle(hdr.svr_task)
        .into_iter()
        .filter(|&id| pools[idx].get(id).is_some_and(|t| t.accepts_usm()))
        .collect();

    if receivers.is_empty() {
        debug!(task = %hdr.svr_task, "dropping USM with no receiving task");
        return;
    }

    for id in receivers {
        if let Some(task) = pools[idx].get_mut(id) {
            task.stats.usm_rcv.bump();
        }

        if pools[idx].get(id).is_some_and(|t| t.is_internal()) {
            // USMs carry no reply id; the service's answer path turns into
            // a no-op, which is exactly what the killer message relies on.
            let rpy_raw = hdr.status.raw() as u16;

            service::handle_packet(pools, idx, ctx, state, rpy_raw, payload);
        } else if !pools[idx].send_data_to_task(ctx, id, frame) {
            pools[idx].remove_task(ctx, id);
        }
    }
}

fn handle_request(
    pools: &mut [TaskPool],
    idx: usize,
    ctx: &mut Ctx,
    state: &mut ServiceState,
    hdr: &AcnetHeader,
    payload: &[u8],
) {
    pools[idx].stats.req_rcv.bump();

    let target = pools[idx]
        .tasks_for_handle(hdr.svr_task)
        .into_iter()
        .find(|&id| pools[idx].get(id).is_some_and(|t| t.accepts_requests()));

    let Some(target) = target else {
        debug!(task = %hdr.svr_task, "request for an absent task");
        ctx.send_error_to_network(hdr, Status::NOTASK);
        return;
    };

    let rpy_id = match pools[idx].accept_request(ctx, target, hdr) {
        Ok(id) => id,
        Err(AcceptError::Reject(status)) => {
            ctx.send_error_to_network(hdr, status);
            return;
        }
        Err(AcceptError::Drop) => {
            debug!(node = %hdr.client, msg_id = hdr.msg_id, "duplicate request dropped");
            return;
        }
    };

    if let Some(task) = pools[idx].get_mut(target) {
        task.stats.req_rcv.bump();
    }

    if pools[idx].get(target).is_some_and(|t| t.is_internal()) {
        // The service answers inline; its requests don't wait for an ack.
        if let Some(rpy) = pools[idx].rpy_pool.get_mut(rpy_id) {
            rpy.acked = true;
        }
        if let Some(task) = pools[idx].get_mut(target) {
            task.decrement_pending();
        }

        service::handle_packet(pools, idx, ctx, state, rpy_id.raw(), payload);
        return;
    }

    // The client learns its reply id through the delivered status field.
    let mut delivered = *hdr;

    delivered.status = Status::from_raw(rpy_id.raw() as i16);
    match delivered.encode(payload) {
        Ok(frame) => {
            if !pools[idx].send_data_to_task(ctx, target, &frame) {
                pools[idx].remove_task(ctx, target);
            }
        }
        Err(err) => {
            warn!(%err, "could not re-encode request for delivery");
        }
    }
}

fn handle_reply(pool: &mut TaskPool, ctx: &mut Ctx, hdr: &AcnetHeader, frame: &[u8]) {
    pool.stats.rpy_rcv.bump();

    let id = ReqId(hdr.msg_id);
    let Some(owner) = pool.req_pool.get(id).map(|req| req.owner) else {
        debug!(msg_id = hdr.msg_id, "reply for unknown request");
        return;
    };

    // Any reply, PENDs included, refreshes the request's timeout.
    pool.req_pool.touch(id, ctx.now_ms, ctx.now_sec);
    pool.req_pool.bump_packets(id);

    if let Some(task) = pool.get_mut(owner) {
        task.stats.rpy_rcv.bump();
    }

    let ok = pool.send_data_to_task(ctx, owner, frame);

    if hdr.is_emr() {
        if let Some(task) = pool.get_mut(owner) {
            task.requests.remove(&id.raw());
        }
        pool.req_pool.release(id);
    }

    if !ok {
        pool.remove_task(ctx, owner);
    }
}

fn handle_cancel(pool: &mut TaskPool, ctx: &mut Ctx, hdr: &AcnetHeader) {
    pool.stats.usm_rcv.bump();

    match pool.rpy_pool.by_node_req(hdr.client, hdr.msg_id) {
        Some(id) => pool.end_rpy_id(ctx, id, Status::SUCCESS),
        None => debug!(node = %hdr.client, req = hdr.msg_id, "cancel for unknown reply"),
    }
}
