//! Inbound request / outbound reply bookkeeping.
//!
//! A `RpyInfo` exists for every request a local task is serving as the
//! replier. Records are reachable three ways: by reply id, by the
//! `(remote node, request id)` pair the wire uses, and - for non-multicast
//! replies - through the PEND queue that drives the 5-second liveness
//! beacons. Each remote node also carries a live-reply refcount.

use crate::deadline::DeadlineQueue;
use crate::idpool::IdPool;
use crate::stats::StatCounter;
use acnet_core::wire::flags;
use acnet_core::{RpyId, TaskHandle, TaskId, TrunkNode};
use std::collections::HashMap;

pub const N_RPYID: usize = 4096;

/// Interval between PEND beacons on an open reply.
pub const REPLY_PEND_MS: u64 = 5_000;

fn node_key(tn: TrunkNode, req_id: u16) -> u32 {
    (tn.raw() as u32) << 16 | req_id as u32
}

#[derive(Debug)]
pub struct RpyInfo {
    pub owner: TaskId,
    pub req_id: u16,
    pub clnt_task_id: u16,
    pub task_name: TaskHandle,
    pub lcl_node: TrunkNode,
    pub rem_node: TrunkNode,
    pub flags: u16,
    pub mcast: bool,
    pub acked: bool,
    pub init_sec: u64,
    pub last_update_ms: u64,
    pub last_update_sec: u64,
    pub total_packets: StatCounter,
}

impl RpyInfo {
    pub fn is_mult_replier(&self) -> bool {
        self.flags & flags::MLT != 0
    }

    pub fn deadline(&self) -> u64 {
        self.last_update_ms + REPLY_PEND_MS
    }
}

/// Why an allocation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpyAllocError {
    /// Id pool exhausted; the peer gets `ACNET_NLM` on the wire.
    Exhausted,
    /// A record for this `(remote node, request id)` already exists; the
    /// duplicate request is dropped.
    Duplicate,
}

/// Detail record returned by the reply-detail diagnostic.
#[derive(Debug, Clone, Copy)]
pub struct RpyDetail {
    pub id: u16,
    pub req_id: u16,
    pub rem_node: u16,
    pub rem_name: u32,
    pub lcl_name: u32,
    pub init_time: u32,
    pub last_update: u32,
}

pub struct ReplyPool {
    pool: IdPool<RpyInfo>,
    active: HashMap<u32, u16>,
    targets: HashMap<TrunkNode, u32>,
    queue: DeadlineQueue,
}

impl Default for ReplyPool {
    fn default() -> Self {
        ReplyPool {
            pool: IdPool::new(N_RPYID),
            active: HashMap::new(),
            targets: HashMap::new(),
            queue: DeadlineQueue::default(),
        }
    }
}

impl ReplyPool {
    /// Register the reply side of a freshly accepted request. `lcl_node` is
    /// the node the request was addressed to; when that is a multicast
    /// address the record speaks as `own_node` instead.
    #[allow(clippy::too_many_arguments)]
    pub fn alloc(
        &mut self,
        owner: TaskId,
        req_id: u16,
        clnt_task_id: u16,
        task_name: TaskHandle,
        lcl_node: TrunkNode,
        own_node: TrunkNode,
        rem_node: TrunkNode,
        req_flags: u16,
        mcast: bool,
        now_ms: u64,
        now_sec: u64,
    ) -> Result<RpyId, RpyAllocError> {
        let key = node_key(rem_node, req_id);

        if self.active.contains_key(&key) {
            return Err(RpyAllocError::Duplicate);
        }

        let info = RpyInfo {
            owner,
            req_id,
            clnt_task_id,
            task_name,
            lcl_node: if mcast { own_node } else { lcl_node },
            rem_node,
            flags: req_flags,
            mcast,
            acked: false,
            init_sec: now_sec,
            last_update_ms: now_ms,
            last_update_sec: now_sec,
            total_packets: StatCounter::default(),
        };
        let deadline = info.deadline();
        let id = self.pool.alloc(info).ok_or(RpyAllocError::Exhausted)?;

        self.active.insert(key, id);
        *self.targets.entry(rem_node).or_insert(0) += 1;

        // Multicast replies don't PEND: the requester hears from many
        // nodes and can't track each one's liveness anyway.
        if !mcast {
            self.queue.insert(deadline, id);
        }
        Ok(RpyId(id))
    }

    pub fn get(&self, id: RpyId) -> Option<&RpyInfo> {
        self.pool.get(id.raw())
    }

    pub fn get_mut(&mut self, id: RpyId) -> Option<&mut RpyInfo> {
        self.pool.get_mut(id.raw())
    }

    /// Look up a reply by the wire identity of its request.
    pub fn by_node_req(&self, rem_node: TrunkNode, req_id: u16) -> Option<RpyId> {
        self.active
            .get(&node_key(rem_node, req_id))
            .copied()
            .map(RpyId)
    }

    /// Reposition the record in the PEND queue after a transmission.
    pub fn touch(&mut self, id: RpyId, now_ms: u64, now_sec: u64) {
        let Some(info) = self.pool.get_mut(id.raw()) else {
            return;
        };

        if info.mcast {
            return;
        }

        let old = info.deadline();

        info.last_update_ms = now_ms;
        info.last_update_sec = now_sec;

        self.queue.remove(old, id.raw());
        self.queue.insert(info.deadline(), id.raw());
    }

    /// Remove the record from every index.
    pub fn release(&mut self, id: RpyId) -> Option<RpyInfo> {
        let info = self.pool.release(id.raw())?;

        self.active.remove(&node_key(info.rem_node, info.req_id));
        if !info.mcast {
            self.queue.remove(info.deadline(), id.raw());
        }

        if let Some(count) = self.targets.get_mut(&info.rem_node) {
            *count -= 1;
            if *count == 0 {
                self.targets.remove(&info.rem_node);
            }
        }
        Some(info)
    }

    /// Pop one reply whose PEND beacon is due. The record stays allocated;
    /// the caller transmits the PEND, which repositions it.
    pub fn pop_pend_due(&mut self, now_ms: u64) -> Option<RpyId> {
        // The queue entry is consumed here; `touch` after the transmit
        // reinserts it. Re-running at the same instant is therefore a no-op
        // only after the touch, which moves the deadline a full interval out.
        let id = self.queue.pop_expired(now_ms)?;

        self.queue.insert(
            self.pool.get(id).map_or(now_ms, RpyInfo::deadline),
            id,
        );
        Some(RpyId(id))
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.queue.next_deadline()
    }

    /// Ids of every reply owed to the given node.
    pub fn ids_to_node(&self, tn: TrunkNode) -> Vec<RpyId> {
        self.iter()
            .filter(|(_, info)| info.rem_node == tn)
            .map(|(id, _)| RpyId(id))
            .collect()
    }

    /// Live-reply count toward a remote node.
    pub fn target_count(&self, tn: TrunkNode) -> u32 {
        self.targets.get(&tn).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &RpyInfo)> {
        self.pool.iter()
    }

    pub fn active_count(&self) -> usize {
        self.pool.active_count()
    }

    pub fn max_active_count(&self) -> usize {
        self.pool.max_active_count()
    }

    pub fn fill_active(&self, matches: impl Fn(&RpyInfo) -> bool) -> Vec<u16> {
        self.iter()
            .filter(|(_, info)| matches(info))
            .map(|(id, _)| id)
            .collect()
    }

    pub fn fill_detail(&self, id: u16, owner_handle: impl Fn(TaskId) -> u32) -> Option<RpyDetail> {
        let info = self.pool.get(id)?;

        Some(RpyDetail {
            id,
            req_id: info.req_id,
            rem_node: info.rem_node.raw(),
            rem_name: info.task_name.raw(),
            lcl_name: owner_handle(info.owner),
            init_time: info.init_sec as u32,
            last_update: info.last_update_sec as u32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REM: TrunkNode = TrunkNode::new(9, 2);
    const LCL: TrunkNode = TrunkNode::new(9, 1);

    fn alloc_one(pool: &mut ReplyPool, req_id: u16, mcast: bool) -> RpyId {
        pool.alloc(
            TaskId(5),
            req_id,
            7,
            TaskHandle::from_str("BAR"),
            LCL,
            LCL,
            REM,
            0,
            mcast,
            1_000,
            50,
        )
        .unwrap()
    }

    #[test]
    fn reachable_three_ways() {
        let mut pool = ReplyPool::default();
        let id = alloc_one(&mut pool, 0x1234, false);

        assert!(pool.get(id).is_some());
        assert_eq!(pool.by_node_req(REM, 0x1234), Some(id));
        assert_eq!(pool.next_deadline(), Some(6_000));
        assert_eq!(pool.target_count(REM), 1);
    }

    #[test]
    fn duplicate_node_req_rejected() {
        let mut pool = ReplyPool::default();
        let _id = alloc_one(&mut pool, 0x1234, false);

        let dup = pool.alloc(
            TaskId(6),
            0x1234,
            8,
            TaskHandle::from_str("BAZ"),
            LCL,
            LCL,
            REM,
            0,
            false,
            2_000,
            51,
        );
        assert_eq!(dup.unwrap_err(), RpyAllocError::Duplicate);
        assert_eq!(pool.active_count(), 1);
    }

    #[test]
    fn multicast_does_not_pend_and_rewrites_node() {
        let mut pool = ReplyPool::default();
        let mcast_src = TrunkNode::MULTICAST;
        let id = pool
            .alloc(
                TaskId(5),
                0x9999,
                7,
                TaskHandle::from_str("BAR"),
                mcast_src,
                LCL,
                REM,
                flags::MLT,
                true,
                1_000,
                50,
            )
            .unwrap();

        assert_eq!(pool.next_deadline(), None);
        assert_eq!(pool.get(id).map(|r| r.lcl_node), Some(LCL));
        assert!(pool.pop_pend_due(100_000).is_none());
    }

    #[test]
    fn pend_pops_and_reschedules() {
        let mut pool = ReplyPool::default();
        let id = alloc_one(&mut pool, 0x1234, false);

        assert!(pool.pop_pend_due(5_999).is_none());
        assert_eq!(pool.pop_pend_due(6_000), Some(id));

        // The transmit path touches the record, pushing the beacon out.
        pool.touch(id, 6_000, 55);
        assert_eq!(pool.next_deadline(), Some(11_000));
        assert!(pool.pop_pend_due(6_000).is_none());
    }

    #[test]
    fn release_clears_all_indexes() {
        let mut pool = ReplyPool::default();
        let id = alloc_one(&mut pool, 0x1234, false);

        let info = pool.release(id).unwrap();
        assert_eq!(info.req_id, 0x1234);
        assert!(pool.get(id).is_none());
        assert_eq!(pool.by_node_req(REM, 0x1234), None);
        assert_eq!(pool.next_deadline(), None);
        assert_eq!(pool.target_count(REM), 0);

        // The key is free for reuse now.
        let again = alloc_one(&mut pool, 0x1234, false);
        assert!(pool.get(again).is_some());
    }

    #[test]
    fn stale_id_misses_after_reallocation() {
        let mut pool = ReplyPool::default();
        let ids: Vec<RpyId> = (0..3).map(|n| alloc_one(&mut pool, n, false)).collect();

        pool.release(ids[0]);
        // Burn through the free list until the released index returns.
        let mut reused = alloc_one(&mut pool, 100, false);
        let mut n = 101;
        while reused.raw() & 0x0fff != ids[0].raw() & 0x0fff {
            reused = alloc_one(&mut pool, n, false);
            n += 1;
        }
        // Same slot, same bank within one pool lifetime: the id matches
        // again, but the released-and-not-reused ids still miss.
        pool.release(ids[1]);
        assert!(pool.get(ids[1]).is_none());
        assert!(pool.get(ids[2]).is_some());
    }

    #[test]
    fn target_counts_accumulate_per_node() {
        let mut pool = ReplyPool::default();
        let a = alloc_one(&mut pool, 1, false);
        let _b = alloc_one(&mut pool, 2, false);

        assert_eq!(pool.target_count(REM), 2);
        pool.release(a);
        assert_eq!(pool.target_count(REM), 1);
    }
}
