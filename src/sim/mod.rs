//! The per-disk simulator: device state, the event-driven scheduler, and the
//! sub-request engine.
//!
//! Virtual time advances by hopping to the nearest resource state change
//! (`find_nearest_event`) instead of ticking. Each `step` admits at most one
//! trace record, advances every serviceable sub-request one phase, gives the
//! GC engine a chance to run, and emits completed requests.

pub mod subrequest;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::buffer::WriteBuffer;
use crate::flash::{
    build_channels, popcount, Channel, ChannelState, ChipState, Geometry, Location,
};
use crate::ftl::gc::GcNode;
use crate::ftl::MapEntry;
use crate::output::OutputSet;
use crate::params::{AllocationScheme, Params, SECTOR_BYTES};
use crate::stats::Stats;
use crate::sync::GcLock;
use crate::trace::{Op, TraceError, TraceReader};

use subrequest::{Request, SubId, SubPool, SubRequest, SubState};

/// Service time for a request fully absorbed by DRAM.
const DRAM_SERVICE_NS: i64 = 1000;

#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Trace(#[from] TraceError),
    #[error("result file setup failed: {0}")]
    Io(#[from] std::io::Error),
    /// The allocator ran out of erased blocks: the workload expands beyond
    /// the device capacity.
    #[error("operation expands SSD capacity at channel {channel} chip {chip} die {die} plane {plane}")]
    CapacityExhausted {
        channel: u32,
        chip: u32,
        die: u32,
        plane: u32,
    },
}

/// What `admit` did with the next trace record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    /// One record entered the request queue.
    Admitted,
    /// The record exists but a resource event comes first (or the queue is
    /// full); time advanced, the record stays in the reader.
    Deferred,
    /// Trace exhausted.
    Eof,
}

/// Cross-device coordination switches for one disk.
#[derive(Debug, Default, Clone)]
pub struct SimOptions {
    pub diskid: u32,
    pub ndisk: u32,
    pub is_gcsync: bool,
    pub is_gclock: bool,
    pub is_gcdefer: bool,
    pub gc_time_window: i64,
    pub gclock: Option<Arc<Mutex<GcLock>>>,
}

/// One simulated SSD.
pub struct Ssd {
    pub params: Params,
    pub geo: Geometry,
    pub channels: Vec<Channel>,
    pub map: Vec<MapEntry>,
    pub buffer: WriteBuffer,
    pub stats: Stats,

    pub current_time: i64,
    /// Channel-level round-robin token for fully dynamic allocation.
    pub channel_token: u32,

    pub requests: VecDeque<Request>,
    pub subs: SubPool,
    /// Per-channel read sub-request queues.
    pub chan_subs_r: Vec<VecDeque<SubId>>,
    /// Per-channel write queues (static / channel-pinned allocation).
    pub chan_subs_w: Vec<VecDeque<SubId>>,
    /// Device-level write queue (fully dynamic allocation).
    pub dyn_subs_w: VecDeque<SubId>,
    /// Per-channel GC operation queues.
    pub gc_queues: Vec<Vec<GcNode>>,

    pub opts: SimOptions,

    pub simulation_start_time: i64,
    pub simulation_end_time: i64,
    pub next_request_time: i64,

    pub(crate) trace: TraceReader,
    pub out: Option<OutputSet>,
    next_request_id: u64,
}

impl Ssd {
    pub fn new(
        params: Params,
        trace: TraceReader,
        out: Option<OutputSet>,
        opts: SimOptions,
    ) -> Self {
        let geo = Geometry::new(&params);
        let channels = build_channels(&params);
        let nch = params.channel_number as usize;
        Self {
            map: vec![MapEntry::default(); geo.lpn_count()],
            buffer: WriteBuffer::new(params.dram_capacity),
            stats: Stats::new(),
            current_time: 0,
            channel_token: 0,
            requests: VecDeque::new(),
            subs: SubPool::default(),
            chan_subs_r: vec![VecDeque::new(); nch],
            chan_subs_w: vec![VecDeque::new(); nch],
            dyn_subs_w: VecDeque::new(),
            gc_queues: vec![Vec::new(); nch],
            opts,
            simulation_start_time: -1,
            simulation_end_time: 0,
            next_request_time: i64::MAX,
            trace,
            out,
            next_request_id: 0,
            geo,
            channels,
            params,
        }
    }

    // ----- arena accessors -------------------------------------------------

    pub fn plane(&self, channel: u32, chip: u32, die: u32, plane: u32) -> &crate::flash::Plane {
        &self.channels[channel as usize].chips[chip as usize].dies[die as usize].planes
            [plane as usize]
    }

    pub fn plane_mut(
        &mut self,
        channel: u32,
        chip: u32,
        die: u32,
        plane: u32,
    ) -> &mut crate::flash::Plane {
        &mut self.channels[channel as usize].chips[chip as usize].dies[die as usize].planes
            [plane as usize]
    }

    pub fn block(&self, loc: Location) -> &crate::flash::Block {
        &self.plane(loc.channel, loc.chip, loc.die, loc.plane).blocks[loc.block as usize]
    }

    pub fn block_mut(&mut self, loc: Location) -> &mut crate::flash::Block {
        &mut self
            .plane_mut(loc.channel, loc.chip, loc.die, loc.plane)
            .blocks[loc.block as usize]
    }

    pub fn page(&self, loc: Location) -> &crate::flash::Page {
        &self.block(loc).pages[loc.page as usize]
    }

    pub fn page_mut(&mut self, loc: Location) -> &mut crate::flash::Page {
        let page = loc.page as usize;
        &mut self.block_mut(loc).pages[page]
    }

    pub fn full_page(&self) -> u32 {
        self.geo.full_page_mask()
    }

    fn request_mut(&mut self, id: u64) -> Option<&mut Request> {
        self.requests.iter_mut().find(|r| r.id == id)
    }

    /// Record on the owning request that one of its sub-requests found its
    /// chip busy with garbage collection.
    fn note_meet_gc(&mut self, request_id: u64, remaining: i64) {
        if let Some(req) = self.request_mut(request_id) {
            req.meet_gc_flag = true;
            if remaining > req.meet_gc_remaining_time {
                req.meet_gc_remaining_time = remaining;
            }
        }
    }

    /// Merge freshly buffered sub-pages into the flash copy's cached bits.
    pub fn add_cached_bits(&mut self, lpn: u32, bits: u32) {
        let entry = self.map[lpn as usize];
        if entry.state == 0 || bits == 0 {
            return;
        }
        let loc = self.geo.location_of(entry.pn);
        let block = self.block_mut(loc);
        let page = &mut block.pages[loc.page as usize];
        if page.cached_state == 0 {
            block.cached_pages_num += 1;
        }
        page.cached_state |= bits;
    }

    /// Invalidate the page at `loc`: valid/free/cached cleared, lpn dropped,
    /// block counters updated. Pushes a direct-erase node when the block
    /// becomes fully invalid.
    pub fn invalidate_page(&mut self, loc: Location) {
        let page_block = self.geo.page_block;
        let block = self.block_mut(loc);
        let page = &mut block.pages[loc.page as usize];
        page.valid_state = 0;
        page.free_state = 0;
        page.lpn = 0;
        if page.cached_state != 0 {
            page.cached_state = 0;
            block.cached_pages_num -= 1;
        }
        block.invalid_page_num += 1;
        if block.invalid_page_num == page_block {
            self.plane_mut(loc.channel, loc.chip, loc.die, loc.plane)
                .erase_queue
                .push_back(loc.block);
        }
    }

    // ----- scheduler -------------------------------------------------------

    /// Run the whole trace to completion and write the statistics block.
    pub fn run(&mut self) -> Result<(), SimError> {
        self.prepare()?;
        log::info!(
            "begin simulating: {} ({} pages/plane)",
            self.params,
            self.geo.pages_per_plane()
        );
        while !self.step()? {}
        self.statistic_output();
        if let Some(out) = &mut self.out {
            out.flush();
        }
        Ok(())
    }

    /// Pre-condition the device: aging/warm-up, then the read pre-process
    /// pass over the trace.
    pub fn prepare(&mut self) -> Result<(), SimError> {
        if self.params.aged {
            if self.params.warmup {
                self.warmup();
            } else {
                self.make_aged();
            }
        }
        self.pre_process_page()?;
        Ok(())
    }

    /// One scheduler iteration. Returns `true` once the trace is exhausted
    /// and every request has been emitted.
    pub fn step(&mut self) -> Result<bool, SimError> {
        let admission = self.admit()?;
        if admission == Admission::Admitted {
            if self.buffer.enabled() {
                self.buffer_management();
                self.distribute();
            } else {
                self.no_buffer_distribute();
            }
            self.finish_if_buffer_served();
        }

        self.process()?;
        self.init_gc();
        self.gc_step()?;
        self.emit_completed();

        Ok(admission == Admission::Eof && self.requests.is_empty())
    }

    fn admit(&mut self) -> Result<Admission, SimError> {
        let Some(rec) = self.trace.peek()? else {
            let nearest = self.find_nearest_event();
            if nearest != i64::MAX && nearest > self.current_time {
                self.current_time = nearest;
            }
            self.simulation_end_time = self.current_time;
            return Ok(Admission::Eof);
        };

        if self.simulation_start_time < 0 {
            self.simulation_start_time = rec.time;
        }

        let nearest = self.find_nearest_event();
        if nearest == i64::MAX {
            if rec.time > self.current_time {
                self.current_time = rec.time;
            }
        } else if nearest < rec.time {
            // A resource wakes up before the next arrival: leave the record
            // in the reader and jump to the event.
            if self.current_time < nearest {
                self.current_time = nearest;
            }
            return Ok(Admission::Deferred);
        } else if self.requests.len() >= self.params.queue_length as usize {
            self.current_time = nearest;
            return Ok(Admission::Deferred);
        } else if rec.time > self.current_time {
            self.current_time = rec.time;
        }

        let rec = self.trace.next()?.expect("peeked record vanished");
        self.stats
            .note_request(rec.lsn, rec.size, rec.operation == Op::Read);
        let max_lsn = self.geo.max_lsn(self.params.overprovide).max(1);
        let lsn = rec.lsn % max_lsn;

        let id = self.next_request_id;
        self.next_request_id += 1;
        self.requests.push_back(Request {
            id,
            time: rec.time,
            lsn,
            size: rec.size,
            operation: rec.operation,
            begin_time: rec.time,
            response_time: 0,
            complete_lsn_count: 0,
            need_masks: Vec::new(),
            distributed: false,
            subs: Vec::new(),
            meet_gc_flag: false,
            meet_gc_remaining_time: 0,
        });
        self.next_request_time = self.trace.peek()?.map_or(i64::MAX, |r| r.time);
        Ok(Admission::Admitted)
    }

    /// Minimum over all resources of the next predicted idle (or data-ready)
    /// transition strictly after `current_time`.
    pub fn find_nearest_event(&self) -> i64 {
        let mut nearest = i64::MAX;
        for channel in &self.channels {
            if channel.state.next_state == ChannelState::Idle
                && channel.state.next_state_predict_time > self.current_time
            {
                nearest = nearest.min(channel.state.next_state_predict_time);
            }
            for chip in &channel.chips {
                if matches!(
                    chip.state.next_state,
                    ChipState::Idle | ChipState::DataTransfer
                ) && chip.state.next_state_predict_time > self.current_time
                {
                    nearest = nearest.min(chip.state.next_state_predict_time);
                }
            }
        }
        nearest
    }

    // ----- request fan-out -------------------------------------------------

    /// Sub-page mask of `lpn` that a request touching `[lsn, lsn+size)`
    /// actually covers; interior pages get the full mask, the first and last
    /// are trimmed.
    fn request_mask(&self, lpn: u32, lsn: u32, size: u32) -> u32 {
        let sp = self.geo.subpage_page;
        let full = self.full_page();
        let first_lpn = lsn / sp;
        let last_lpn = (lsn + size - 1) / sp;
        let mut state = full;
        if lpn == first_lpn {
            let offset = sp - ((lpn + 1) * sp - lsn);
            state &= full << offset;
        }
        if lpn == last_lpn {
            let offset = sp - ((lpn + 1) * sp).saturating_sub(lsn + size);
            if offset < 32 {
                state &= !(u32::MAX << offset);
            }
        }
        state
    }

    /// Route the newest request through the write buffer: writes are
    /// absorbed (possibly evicting older groups to flash), reads collect the
    /// masks they still need from flash.
    fn buffer_management(&mut self) {
        let req_idx = self.requests.len() - 1;
        let (id, lsn, size, operation) = {
            let req = &self.requests[req_idx];
            (req.id, req.lsn, req.size, req.operation)
        };
        if size == 0 {
            return;
        }
        let sp = self.geo.subpage_page;
        let first_lpn = lsn / sp;
        let last_lpn = (lsn + size - 1) / sp;

        for lpn in first_lpn..=last_lpn {
            if lpn as usize >= self.map.len() {
                // The request ran past the wrap bound; the tail is dropped.
                break;
            }
            let mask = self.request_mask(lpn, lsn, size);
            match operation {
                Op::Read => {
                    let hit = self.buffer.read_probe(lpn, mask);
                    let req = &mut self.requests[req_idx];
                    req.complete_lsn_count += popcount(hit);
                    let need = mask & !hit;
                    if need != 0 {
                        req.need_masks.push((lpn, need));
                    }
                }
                Op::Write => {
                    let evicted = self.buffer.insert(lpn, mask);
                    self.add_cached_bits(lpn, mask);
                    for (evicted_lpn, evicted_mask) in evicted {
                        self.create_write_sub(id, evicted_lpn, evicted_mask);
                    }
                }
            }
        }
    }

    /// Create read sub-requests for whatever the buffer could not serve.
    fn distribute(&mut self) {
        let req_idx = self.requests.len() - 1;
        if self.requests[req_idx].operation != Op::Read || self.requests[req_idx].distributed {
            self.requests[req_idx].distributed = true;
            return;
        }
        let id = self.requests[req_idx].id;
        let masks = std::mem::take(&mut self.requests[req_idx].need_masks);
        for (lpn, mask) in masks {
            let live = self.map[lpn as usize].state & mask;
            if live == 0 {
                // Nothing ever written there; served as zeroes.
                continue;
            }
            self.create_read_sub(id, lpn, live);
        }
        self.requests[req_idx].distributed = true;
    }

    /// Bufferless fan-out: reads fetch each page's live mask, writes program
    /// their trimmed masks directly.
    fn no_buffer_distribute(&mut self) {
        let req_idx = self.requests.len() - 1;
        let (id, lsn, size, operation) = {
            let req = &self.requests[req_idx];
            (req.id, req.lsn, req.size, req.operation)
        };
        if size == 0 {
            self.requests[req_idx].distributed = true;
            return;
        }
        let sp = self.geo.subpage_page;
        let first_lpn = lsn / sp;
        let last_lpn = (lsn + size - 1) / sp;

        for lpn in first_lpn..=last_lpn {
            if lpn as usize >= self.map.len() {
                break;
            }
            match operation {
                Op::Read => {
                    let state = self.map[lpn as usize].state;
                    if state == 0 {
                        log::debug!("read of unwritten lpn {lpn}, served as zeroes");
                        continue;
                    }
                    self.create_read_sub(id, lpn, state);
                }
                Op::Write => {
                    let mask = self.request_mask(lpn, lsn, size);
                    self.create_write_sub(id, lpn, mask);
                }
            }
        }
        self.requests[req_idx].distributed = true;
    }

    /// A request that produced no flash work is served from DRAM.
    fn finish_if_buffer_served(&mut self) {
        let req = self.requests.back_mut().expect("just admitted");
        if req.response_time == 0 && req.subs.is_empty() && req.need_masks.is_empty() {
            req.begin_time = self.current_time;
            req.response_time = self.current_time + DRAM_SERVICE_NS;
        }
    }

    fn create_read_sub(&mut self, request_id: u64, lpn: u32, state: u32) -> SubId {
        let entry = self.map[lpn as usize];
        let loc = self.geo.location_of(entry.pn);
        let sub = SubRequest {
            request_id,
            lpn,
            ppn: entry.pn,
            state,
            size: popcount(state),
            operation: Op::Read,
            location: Some(loc),
            current_state: SubState::Wait,
            next_state: SubState::Wait,
            next_state_predict_time: 0,
            begin_time: self.current_time,
            complete_time: 0,
            update: None,
        };
        let id = self.subs.insert(sub);
        self.chan_subs_r[loc.channel as usize].push_back(id);
        if let Some(req) = self.request_mut(request_id) {
            req.subs.push(id);
        }
        self.stats.read_subreq_count += 1;
        id
    }

    fn create_write_sub(&mut self, request_id: u64, lpn: u32, mask: u32) -> SubId {
        // Live sub-pages the write does not cover must be read back first and
        // folded into the program (read-modify-write).
        let entry = self.map[lpn as usize];
        let uncovered = entry.state & !mask;
        let update = if uncovered != 0 {
            let loc = self.geo.location_of(entry.pn);
            let upd = SubRequest {
                request_id,
                lpn,
                ppn: entry.pn,
                state: uncovered,
                size: popcount(uncovered),
                operation: Op::Read,
                location: Some(loc),
                current_state: SubState::Wait,
                next_state: SubState::Wait,
                next_state_predict_time: 0,
                begin_time: self.current_time,
                complete_time: 0,
                update: None,
            };
            let uid = self.subs.insert(upd);
            self.chan_subs_r[loc.channel as usize].push_back(uid);
            if let Some(req) = self.request_mut(request_id) {
                req.subs.push(uid);
            }
            self.stats.update_read_count += 1;
            Some(uid)
        } else {
            None
        };

        let sub = SubRequest {
            request_id,
            lpn,
            ppn: 0,
            state: mask,
            size: popcount(mask),
            operation: Op::Write,
            location: None,
            current_state: SubState::Wait,
            next_state: SubState::Wait,
            next_state_predict_time: 0,
            begin_time: self.current_time,
            complete_time: 0,
            update,
        };
        let id = self.subs.insert(sub);
        match self.params.allocation_scheme {
            AllocationScheme::Static => {
                let (channel, ..) = self.static_target(lpn);
                self.chan_subs_w[channel as usize].push_back(id);
            }
            AllocationScheme::Dynamic if self.params.dynamic_allocation == 1 => {
                let channel = lpn % self.params.channel_number;
                self.chan_subs_w[channel as usize].push_back(id);
            }
            AllocationScheme::Dynamic => self.dyn_subs_w.push_back(id),
        }
        if let Some(req) = self.request_mut(request_id) {
            req.subs.push(id);
        }
        self.stats.write_subreq_count += 1;
        id
    }

    // ----- sub-request engine ---------------------------------------------

    fn process(&mut self) -> Result<(), SimError> {
        for c in 0..self.channels.len() {
            if !self.channels[c].state.available(self.current_time) {
                continue;
            }
            if self.service_reads(c) {
                continue;
            }
            self.service_writes(c)?;
        }
        Ok(())
    }

    /// Advance one read sub-request on channel `c`. Data transfers out of the
    /// page register take priority over new commands because they are the
    /// ones holding a chip. Returns whether the channel was claimed.
    fn service_reads(&mut self, c: usize) -> bool {
        let now = self.current_time;
        let t = self.params.time;

        // Data ready in a page register -> move it over the bus.
        for idx in 0..self.chan_subs_r[c].len() {
            let id = self.chan_subs_r[c][idx];
            let sub = self.subs.get(id);
            if sub.current_state == SubState::FlashBusy
                && sub.next_state == SubState::DataTransfer
                && sub.next_state_predict_time <= now
            {
                let loc = sub.location.expect("read sub without location");
                let size = sub.size;
                let end = now + size as i64 * SECTOR_BYTES * t.t_rc;
                self.channels[c]
                    .state
                    .occupy(now, ChannelState::DataTransfer, ChannelState::Idle, end);
                self.channels[c].chips[loc.chip as usize].state.occupy(
                    now,
                    ChipState::DataTransfer,
                    ChipState::Idle,
                    end,
                );
                let sub = self.subs.get_mut(id);
                sub.current_state = SubState::DataTransfer;
                sub.next_state = SubState::Complete;
                sub.next_state_predict_time = end;
                sub.complete_time = end;
                self.chan_subs_r[c].remove(idx);
                return true;
            }
        }

        // Issue a read command to an idle chip.
        for idx in 0..self.chan_subs_r[c].len() {
            let id = self.chan_subs_r[c][idx];
            let sub = self.subs.get(id);
            if sub.current_state != SubState::Wait {
                continue;
            }
            let loc = sub.location.expect("read sub without location");
            let request_id = sub.request_id;
            let size = sub.size;
            let chip_state = &self.channels[c].chips[loc.chip as usize].state;
            if !chip_state.available(now) {
                if chip_state.current_state.is_gc_busy() {
                    let remaining = chip_state.next_state_predict_time - now;
                    self.note_meet_gc(request_id, remaining);
                }
                continue;
            }
            let cmd_end = now + 7 * t.t_wc;
            let data_ready = cmd_end + t.t_r;
            self.channels[c].state.occupy(
                now,
                ChannelState::CmdAddrTransfer,
                ChannelState::Idle,
                cmd_end,
            );
            self.channels[c].chips[loc.chip as usize].state.occupy(
                now,
                ChipState::ReadBusy,
                ChipState::DataTransfer,
                data_ready,
            );
            let sub = self.subs.get_mut(id);
            sub.current_state = SubState::FlashBusy;
            sub.next_state = SubState::DataTransfer;
            sub.next_state_predict_time = data_ready;
            self.stats.read_count += 1;
            self.stats.in_read_size += size as u64;
            self.channels[c].read_count += 1;
            self.channels[c].chips[loc.chip as usize].read_count += 1;
            return true;
        }
        false
    }

    /// Dispatch one write sub-request on channel `c`. Returns whether the
    /// channel was claimed.
    fn service_writes(&mut self, c: usize) -> Result<bool, SimError> {
        // Channel-pinned queues (static or semi-dynamic allocation).
        for idx in 0..self.chan_subs_w[c].len() {
            let id = self.chan_subs_w[c][idx];
            if !self.write_sub_ready(id) {
                continue;
            }
            let (chip, die, plane) = match self.params.allocation_scheme {
                AllocationScheme::Static => {
                    let lpn = self.subs.get(id).lpn;
                    let (_, chip, die, plane) = self.static_target(lpn);
                    (chip, die, plane)
                }
                AllocationScheme::Dynamic => self.peek_dynamic_target(c as u32),
            };
            if !self.write_chip_available(c, chip, id) {
                continue;
            }
            if self.params.allocation_scheme == AllocationScheme::Dynamic {
                self.advance_dynamic_tokens(c as u32);
            }
            self.dispatch_write(c, chip, die, plane, id)?;
            self.chan_subs_w[c].remove(idx);
            return Ok(true);
        }

        // Fully dynamic queue: strict channel round-robin via the token.
        if self.params.allocation_scheme == AllocationScheme::Dynamic
            && self.params.dynamic_allocation == 0
            && self.channel_token == c as u32
        {
            if let Some(&id) = self.dyn_subs_w.front() {
                if self.write_sub_ready(id) {
                    let (chip, die, plane) = self.peek_dynamic_target(c as u32);
                    if self.write_chip_available(c, chip, id) {
                        self.channel_token = (self.channel_token + 1) % self.params.channel_number;
                        self.advance_dynamic_tokens(c as u32);
                        self.dispatch_write(c, chip, die, plane, id)?;
                        self.dyn_subs_w.pop_front();
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    /// A write may program once its update read (if any) has completed.
    fn write_sub_ready(&self, id: SubId) -> bool {
        let sub = self.subs.get(id);
        if sub.current_state != SubState::Wait {
            return false;
        }
        match sub.update {
            Some(uid) => self.subs.get(uid).is_complete(self.current_time),
            None => true,
        }
    }

    fn write_chip_available(&mut self, c: usize, chip: u32, id: SubId) -> bool {
        let chip_state = &self.channels[c].chips[chip as usize].state;
        if chip_state.available(self.current_time) {
            return true;
        }
        if chip_state.current_state.is_gc_busy() {
            let remaining = chip_state.next_state_predict_time - self.current_time;
            let request_id = self.subs.get(id).request_id;
            self.note_meet_gc(request_id, remaining);
        }
        false
    }

    fn dispatch_write(
        &mut self,
        c: usize,
        chip: u32,
        die: u32,
        plane: u32,
        id: SubId,
    ) -> Result<(), SimError> {
        let now = self.current_time;
        let t = self.params.time;

        // Fold the update read's live bits into the program.
        if let Some(uid) = self.subs.get(id).update {
            let upd_state = self.subs.get(uid).state;
            let sub = self.subs.get_mut(id);
            sub.state |= upd_state;
            sub.size = popcount(sub.state);
        }

        self.get_ppn(id, c as u32, chip, die, plane)?;

        let sub = self.subs.get(id);
        let bus_end = now + 7 * t.t_wc + sub.size as i64 * SECTOR_BYTES * t.t_wc;
        let prog_end = bus_end + t.t_prog;
        self.channels[c].state.occupy(
            now,
            ChannelState::CmdAddrTransfer,
            ChannelState::Idle,
            bus_end,
        );
        self.channels[c].chips[chip as usize].state.occupy(
            now,
            ChipState::WriteBusy,
            ChipState::Idle,
            prog_end,
        );
        let sub = self.subs.get_mut(id);
        sub.current_state = SubState::FlashBusy;
        sub.next_state = SubState::Complete;
        sub.next_state_predict_time = prog_end;
        sub.complete_time = prog_end;
        Ok(())
    }

    // ----- completion ------------------------------------------------------

    /// Emit every request whose response is known, free its sub-requests,
    /// and drop it from the queue.
    fn emit_completed(&mut self) {
        let now = self.current_time;
        let mut i = 0;
        while i < self.requests.len() {
            let req = &self.requests[i];
            let resolved = if req.response_time != 0 {
                Some((req.begin_time, req.response_time))
            } else if req.subs.is_empty() {
                None
            } else {
                let mut start = i64::MAX;
                let mut end = 0;
                let mut all_done = true;
                for &sid in &req.subs {
                    let sub = self.subs.get(sid);
                    start = start.min(sub.begin_time);
                    end = end.max(sub.complete_time);
                    if !sub.is_complete(now) {
                        all_done = false;
                        break;
                    }
                }
                all_done.then_some((start, end))
            };

            match resolved {
                None => i += 1,
                Some((begin, end)) => {
                    let req = self.requests.remove(i).expect("index in bounds");
                    let latency = end - req.time;
                    if req.operation == Op::Read {
                        self.stats.read_request_count += 1;
                        self.stats.read_avg += latency;
                    } else {
                        self.stats.write_request_count += 1;
                        self.stats.write_avg += latency;
                    }
                    if let Some(out) = &mut self.out {
                        out.io_line(
                            req.time,
                            req.lsn,
                            req.size,
                            req.operation as u32,
                            begin,
                            end,
                            req.meet_gc_flag,
                            req.meet_gc_remaining_time,
                        );
                    }
                    for sid in req.subs {
                        self.subs.remove(sid);
                    }
                }
            }
        }
    }

    // ----- device-wide free-space scans (GC reporting) ---------------------

    pub fn free_block_pct(&self) -> f64 {
        let mut total = 0u64;
        let mut free = 0u64;
        self.for_each_block(|block| {
            total += 1;
            if block.free_page_num == self.geo.page_block {
                free += 1;
            }
        });
        free as f64 / total.max(1) as f64 * 100.0
    }

    pub fn free_page_pct(&self) -> f64 {
        let mut free = 0u64;
        for channel in &self.channels {
            for chip in &channel.chips {
                for die in &chip.dies {
                    for plane in &die.planes {
                        free += plane.free_page as u64;
                    }
                }
            }
        }
        free as f64 / self.geo.total_pages().max(1) as f64 * 100.0
    }

    pub fn nonempty_free_page_pct(&self) -> f64 {
        let mut free = 0u64;
        self.for_each_block(|block| {
            if block.free_page_num < self.geo.page_block {
                free += block.free_page_num as u64;
            }
        });
        free as f64 / self.geo.total_pages().max(1) as f64 * 100.0
    }

    pub fn nonempty_free_block_pct(&self) -> f64 {
        let mut total = 0u64;
        let mut nonempty = 0u64;
        self.for_each_block(|block| {
            total += 1;
            if block.free_page_num < self.geo.page_block {
                nonempty += 1;
            }
        });
        nonempty as f64 / total.max(1) as f64 * 100.0
    }

    fn for_each_block(&self, mut f: impl FnMut(&crate::flash::Block)) {
        for channel in &self.channels {
            for chip in &channel.chips {
                for die in &chip.dies {
                    for plane in &die.planes {
                        for block in &plane.blocks {
                            f(block);
                        }
                    }
                }
            }
        }
    }

    // ----- statistics ------------------------------------------------------

    /// Final statistics block, mirrored to `ex.out` and `statistic10.dat`,
    /// with the run summary in `statistic2.dat` and the log.
    pub fn statistic_output(&mut self) {
        use std::fmt::Write as _;
        use std::io::Write as _;

        let mut erase_lines = String::new();
        let mut total_erase = 0u64;
        for (c, channel) in self.channels.iter().enumerate() {
            for (h, chip) in channel.chips.iter().enumerate() {
                for (d, die) in chip.dies.iter().enumerate() {
                    for (p, plane) in die.planes.iter().enumerate() {
                        let plane_erase: u64 =
                            plane.blocks.iter().map(|b| b.erase_count as u64).sum();
                        total_erase += plane_erase;
                        let _ = writeln!(
                            erase_lines,
                            "the {c} channel, {h} chip, {d} die, {p} plane has : {plane_erase:13} erase operations"
                        );
                    }
                }
            }
        }

        let duration = self.simulation_end_time - self.simulation_start_time.max(0);
        let stats = &self.stats;
        let mut block = String::new();
        let _ = writeln!(block, "{erase_lines}");
        let _ = writeln!(block, "---------------------------statistic data---------------------------");
        let _ = writeln!(block, "min lsn: {:13}", stats.min_lsn);
        let _ = writeln!(block, "max lsn: {:13}", stats.max_lsn);
        let _ = writeln!(block, "read count: {:13}", stats.read_count);
        let _ = writeln!(block, "program count: {:13}", stats.program_count);
        let _ = writeln!(
            block,
            "the read operation leaded by un-covered update count: {:13}",
            stats.update_read_count
        );
        let _ = writeln!(block, "erase count: {:13}", stats.erase_count);
        let _ = writeln!(block, "direct erase count: {:13}", stats.direct_erase_count);
        let _ = writeln!(block, "copy back count: {:13}", stats.copy_back_count);
        let _ = writeln!(block, "gc copy back count: {:13}", stats.gc_copy_back);
        let _ = writeln!(block, "gc count: {:13}", stats.num_gc);
        let _ = writeln!(block, "write flash count: {:13}", stats.write_flash_count);
        let _ = writeln!(block, "waste page count: {:13}", stats.waste_page_count);
        let _ = writeln!(
            block,
            "interleave erase count: {:13}",
            stats.interleave_erase_count
        );
        let _ = writeln!(
            block,
            "multiple plane erase count: {:13}",
            stats.mplane_erase_count
        );
        let _ = writeln!(
            block,
            "interleave multiple plane erase count: {:13}",
            stats.interleave_mplane_erase_count
        );
        let _ = writeln!(block, "read request count: {:13}", stats.read_request_count);
        let _ = writeln!(block, "write request count: {:13}", stats.write_request_count);
        let _ = writeln!(block, "read request average size: {:13}", stats.ave_read_size);
        let _ = writeln!(block, "write request average size: {:13}", stats.ave_write_size);
        if stats.read_request_count != 0 {
            let _ = writeln!(
                block,
                "read request average response time: {}",
                stats.read_avg / stats.read_request_count as i64
            );
        }
        if stats.write_request_count != 0 {
            let _ = writeln!(
                block,
                "write request average response time: {}",
                stats.write_avg / stats.write_request_count as i64
            );
        }
        let _ = writeln!(block, "buffer read hits: {:13}", self.buffer.read_hit);
        let _ = writeln!(block, "buffer read miss: {:13}", self.buffer.read_miss_hit);
        let _ = writeln!(block, "buffer write hits: {:13}", self.buffer.write_hit);
        let _ = writeln!(block, "buffer write miss: {:13}", self.buffer.write_miss_hit);
        let _ = writeln!(block, "erase: {total_erase:13}");
        let _ = writeln!(block, "write sub request count: {:13}", stats.write_subreq_count);
        let _ = writeln!(block, "read sub request count: {:13}", stats.read_subreq_count);
        let _ = writeln!(
            block,
            "write amplification (size): {:.2}",
            stats.write_amplification()
        );
        let _ = writeln!(
            block,
            "read amplification (size): {:.2}",
            stats.read_amplification()
        );
        if stats.num_gc > 0 {
            let avg_move = stats.gc_move_page as f64 / stats.num_gc as f64;
            let _ = writeln!(
                block,
                "avg. gc page move: {:.2} ({:.2}%)",
                avg_move,
                100.0 * avg_move / self.geo.page_block as f64
            );
        }
        let _ = writeln!(block, "gc time window: {}", self.opts.gc_time_window);

        let iops = stats.iops(duration);
        let read_bw = Stats::bandwidth_mb_s(stats.read_request_size, duration);
        let write_bw = Stats::bandwidth_mb_s(stats.write_request_size, duration);
        let summary = format!(
            "\n\n simulation duration: {duration} ns\n IOPS: {iops:.3}\n read BW: {read_bw:.3} MB/s\n write BW: {write_bw:.3} MB/s\n"
        );

        if let Some(out) = &mut self.out {
            let _ = writeln!(out.ex_out(), "\n{block}");
            let _ = write!(out.statistic(), "{block}{summary}");
            let _ = write!(out.statistic2(), "{summary}");
        }
        log::info!("simulation duration: {duration} ns");
        log::info!("IOPS: {iops:.3}");
        log::info!("read BW: {read_bw:.3} MB/s, write BW: {write_bw:.3} MB/s");
    }
}
