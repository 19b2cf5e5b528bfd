//! Outbound request bookkeeping.
//!
//! A `ReqInfo` exists for every request a local task has in flight toward a
//! remote node. Records live in the id pool and, while allocated, always
//! have an entry in the timeout queue; inbound replies refresh the deadline,
//! so a replier's periodic PENDs keep a request alive indefinitely.

use crate::deadline::DeadlineQueue;
use crate::idpool::IdPool;
use crate::stats::StatCounter;
use acnet_core::wire::flags;
use acnet_core::{ReqId, TaskHandle, TaskId, TrunkNode};

pub const N_REQID: usize = 4096;

/// Default request timeout when the client doesn't supply one.
pub const REQUEST_TIMEOUT_MS: u64 = 390_000;

#[derive(Debug)]
pub struct ReqInfo {
    pub owner: TaskId,
    pub task_name: TaskHandle,
    pub lcl_node: TrunkNode,
    pub rem_node: TrunkNode,
    pub flags: u16,
    pub tmo_ms: u64,
    pub mcast: bool,
    pub init_sec: u64,
    pub last_update_ms: u64,
    pub last_update_sec: u64,
    pub total_packets: StatCounter,
}

impl ReqInfo {
    pub fn wants_mult_replies(&self) -> bool {
        self.flags & flags::MLT != 0
    }

    pub fn deadline(&self) -> u64 {
        self.last_update_ms + self.tmo_ms
    }
}

/// Detail record returned by the request-detail diagnostic.
#[derive(Debug, Clone, Copy)]
pub struct ReqDetail {
    pub id: u16,
    pub rem_node: u16,
    pub rem_name: u32,
    pub lcl_name: u32,
    pub init_time: u32,
    pub last_update: u32,
}

pub struct RequestPool {
    pool: IdPool<ReqInfo>,
    queue: DeadlineQueue,
}

impl Default for RequestPool {
    fn default() -> Self {
        RequestPool {
            pool: IdPool::new(N_REQID),
            queue: DeadlineQueue::default(),
        }
    }
}

impl RequestPool {
    /// Reserve an id for a new in-flight request. The caller records the id
    /// in the owner's request set.
    #[allow(clippy::too_many_arguments)]
    pub fn alloc(
        &mut self,
        owner: TaskId,
        task_name: TaskHandle,
        lcl_node: TrunkNode,
        rem_node: TrunkNode,
        req_flags: u16,
        tmo_ms: u64,
        mcast: bool,
        now_ms: u64,
        now_sec: u64,
    ) -> Option<ReqId> {
        let info = ReqInfo {
            owner,
            task_name,
            lcl_node,
            rem_node,
            flags: req_flags,
            tmo_ms,
            mcast,
            init_sec: now_sec,
            last_update_ms: now_ms,
            last_update_sec: now_sec,
            total_packets: StatCounter::default(),
        };
        let deadline = info.deadline();
        let id = self.pool.alloc(info)?;

        self.queue.insert(deadline, id);
        Some(ReqId(id))
    }

    pub fn get(&self, id: ReqId) -> Option<&ReqInfo> {
        self.pool.get(id.raw())
    }

    /// Refresh the record's deadline; called for every reply (PENDs
    /// included) matched to the request.
    pub fn touch(&mut self, id: ReqId, now_ms: u64, now_sec: u64) {
        let Some(info) = self.pool.get_mut(id.raw()) else {
            return;
        };

        let old = info.deadline();

        info.last_update_ms = now_ms;
        info.last_update_sec = now_sec;
        let new = info.deadline();

        self.queue.remove(old, id.raw());
        self.queue.insert(new, id.raw());
    }

    pub fn bump_packets(&mut self, id: ReqId) {
        if let Some(info) = self.pool.get_mut(id.raw()) {
            info.total_packets.bump();
        }
    }

    /// Remove the record from the pool and the timeout queue.
    pub fn release(&mut self, id: ReqId) -> Option<ReqInfo> {
        let info = self.pool.release(id.raw())?;

        self.queue.remove(info.deadline(), id.raw());
        Some(info)
    }

    /// Pop one expired request, if any. The caller synthesizes the TMO
    /// reply and tears the request down.
    pub fn pop_expired(&mut self, now_ms: u64) -> Option<(ReqId, ReqInfo)> {
        let id = self.queue.pop_expired(now_ms)?;
        let info = self.pool.release(id)?;

        Some((ReqId(id), info))
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.queue.next_deadline()
    }

    /// Ids of every request addressed to the given node.
    pub fn ids_to_node(&self, tn: TrunkNode) -> Vec<ReqId> {
        self.iter()
            .filter(|(_, info)| info.rem_node == tn)
            .map(|(id, _)| ReqId(id))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &ReqInfo)> {
        self.pool.iter()
    }

    pub fn active_count(&self) -> usize {
        self.pool.active_count()
    }

    pub fn max_active_count(&self) -> usize {
        self.pool.max_active_count()
    }

    /// Active-id list for the diagnostic service, optionally filtered.
    /// Matches the legacy behavior: no filter data means "everything".
    pub fn fill_active(&self, matches: impl Fn(&ReqInfo) -> bool) -> Vec<u16> {
        self.iter()
            .filter(|(_, info)| matches(info))
            .map(|(id, _)| id)
            .collect()
    }

    pub fn fill_detail(&self, id: u16, owner_handle: impl Fn(TaskId) -> u32) -> Option<ReqDetail> {
        let info = self.pool.get(id)?;

        Some(ReqDetail {
            id,
            rem_node: info.rem_node.raw(),
            rem_name: info.task_name.raw(),
            lcl_name: owner_handle(info.owner),
            init_time: info.init_sec as u32,
            last_update: info.last_update_sec as u32,
        })
    }
}
