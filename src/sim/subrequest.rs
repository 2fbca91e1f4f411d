//! Requests and the per-plane sub-requests they fan out into.

use crate::flash::Location;
use crate::trace::Op;

pub type SubId = usize;

/// Phases of one sub-request through the channel/chip resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubState {
    /// Queued, no resource claimed yet.
    Wait,
    /// Command/address (and, for writes, data) cycles on the channel.
    CmdTransfer,
    /// Chip busy: tR for reads, tPROG for writes.
    FlashBusy,
    /// Read data moving from the page register over the channel.
    DataTransfer,
    Complete,
}

/// One trace record in flight.
#[derive(Debug)]
pub struct Request {
    pub id: u64,
    pub time: i64,
    pub lsn: u32,
    pub size: u32,
    pub operation: Op,
    pub begin_time: i64,
    /// Non-zero once the request has a final response time.
    pub response_time: i64,
    /// Sectors served directly from the write buffer.
    pub complete_lsn_count: u32,
    /// Per-lpn masks a read still has to fetch from flash (buffer misses).
    pub need_masks: Vec<(u32, u32)>,
    pub distributed: bool,
    pub subs: Vec<SubId>,
    pub meet_gc_flag: bool,
    pub meet_gc_remaining_time: i64,
}

#[derive(Debug)]
pub struct SubRequest {
    pub request_id: u64,
    pub lpn: u32,
    pub ppn: u32,
    /// Sub-page mask this sub-request covers.
    pub state: u32,
    /// Sub-pages transferred (popcount of `state`).
    pub size: u32,
    pub operation: Op,
    /// Known at creation for reads (from the mapping); assigned at dispatch
    /// for writes.
    pub location: Option<Location>,
    pub current_state: SubState,
    pub next_state: SubState,
    pub next_state_predict_time: i64,
    pub begin_time: i64,
    pub complete_time: i64,
    /// Read sibling that must finish before this (write) sub may program;
    /// carries the live sub-pages the write does not overwrite.
    pub update: Option<SubId>,
}

impl SubRequest {
    pub fn is_complete(&self, now: i64) -> bool {
        self.current_state == SubState::Complete
            || (self.next_state == SubState::Complete && self.next_state_predict_time <= now)
    }
}

/// Index-stable arena for in-flight sub-requests.
///
/// Queues (per-channel, per-device) refer to sub-requests by [`SubId`];
/// slots are recycled once the owning request has been emitted.
#[derive(Debug, Default)]
pub struct SubPool {
    slots: Vec<Option<SubRequest>>,
    free: Vec<SubId>,
}

impl SubPool {
    pub fn insert(&mut self, sub: SubRequest) -> SubId {
        if let Some(id) = self.free.pop() {
            self.slots[id] = Some(sub);
            id
        } else {
            self.slots.push(Some(sub));
            self.slots.len() - 1
        }
    }

    pub fn get(&self, id: SubId) -> &SubRequest {
        self.slots[id].as_ref().expect("stale sub-request id")
    }

    pub fn get_mut(&mut self, id: SubId) -> &mut SubRequest {
        self.slots[id].as_mut().expect("stale sub-request id")
    }

    pub fn remove(&mut self, id: SubId) -> SubRequest {
        let sub = self.slots[id].take().expect("stale sub-request id");
        self.free.push(id);
        sub
    }
}
