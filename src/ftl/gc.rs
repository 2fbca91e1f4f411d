//! Garbage collection: victim selection, page relocation, erase dispatch,
//! and the per-channel GC queues.
//!
//! Two variants exist. Uninterruptible GC reclaims a whole block in one
//! virtual-time slice and holds the channel and chip for the predicted
//! duration. Interruptible GC moves at most one page per invocation, keeping
//! its progress cursor in the queue node, and yields whenever foreground I/O
//! could use the channel.

use crate::flash::{popcount, ChannelState, ChipState, Location};
use crate::params::{AdvancedCommands, RAID_SSD_LATENCY_NS, SECTOR_BYTES};
use crate::sim::subrequest::SubState;
use crate::sim::{SimError, Ssd};
use crate::sync::gcsync_window_open;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcState {
    Wait,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPriority {
    Interruptible,
    Uninterruptible,
}

/// One pending GC operation, queued on its channel.
#[derive(Debug, Clone)]
pub struct GcNode {
    pub chip: u32,
    pub die: u32,
    pub plane: u32,
    /// Victim block; `None` until selection happens.
    pub block: Option<u32>,
    /// Progress cursor for interruptible GC.
    pub page: u32,
    pub state: GcState,
    pub priority: GcPriority,
    pub init_time: i64,
    pub start_time: i64,
    pub end_time: i64,
    pub moved_pages: u32,
    pub free_percentage: f64,
}

/// Erase command variants, cheapest bus usage first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EraseCommand {
    Normal,
    TwoPlane,
    Interleave,
    InterleaveTwoPlane,
}

impl Ssd {
    /// Queue a GC node for `(chip, die, plane)` on `channel` unless one is
    /// already pending there.
    pub fn enqueue_gc_node(
        &mut self,
        channel: u32,
        chip: u32,
        die: u32,
        plane: u32,
        priority: GcPriority,
    ) {
        let queue = &self.gc_queues[channel as usize];
        if queue
            .iter()
            .any(|n| n.chip == chip && n.die == die && n.plane == plane)
        {
            return;
        }
        let free = self.plane(channel, chip, die, plane).free_page;
        let pages_per_plane = (self.geo.page_block * self.geo.block_plane) as f64;
        let node = GcNode {
            chip,
            die,
            plane,
            block: None,
            page: 0,
            state: GcState::Wait,
            priority,
            init_time: self.channels[channel as usize].state.current_time,
            start_time: 0,
            end_time: 0,
            moved_pages: 0,
            free_percentage: free as f64 / pages_per_plane * 100.0,
        };
        self.gc_queues[channel as usize].push(node);
        self.stats.gc_request += 1;
    }

    /// Periodic scan: when device-wide free space is low, make sure every
    /// plane below its threshold has a GC node queued.
    pub fn init_gc(&mut self) {
        let usable =
            self.geo.total_pages() as f64 * (1.0 - self.params.overprovide);
        let device_threshold = if self.params.active_write {
            usable * self.params.gc_soft_threshold
        } else {
            usable * self.params.gc_hard_threshold
        };
        let mut free_total = 0u64;
        for channel in &self.channels {
            for chip in &channel.chips {
                for die in &chip.dies {
                    for plane in &die.planes {
                        free_total += plane.free_page as u64;
                    }
                }
            }
        }
        if free_total as f64 > device_threshold {
            return;
        }

        let pages_per_plane = (self.geo.page_block * self.geo.block_plane) as f64;
        let hard = pages_per_plane * self.params.gc_hard_threshold;
        let soft = pages_per_plane * self.params.gc_soft_threshold;
        for c in 0..self.params.channel_number {
            for chip in 0..self.params.chip_channel[c as usize] {
                for die in 0..self.params.die_chip {
                    for plane in 0..self.params.plane_die {
                        let free = self.plane(c, chip, die, plane).free_page as f64;
                        if free < hard {
                            self.enqueue_gc_node(c, chip, die, plane, GcPriority::Uninterruptible);
                        } else if self.params.active_write && free < soft {
                            self.enqueue_gc_node(c, chip, die, plane, GcPriority::Interruptible);
                        }
                    }
                }
            }
        }
    }

    /// Give every channel with queued GC work a chance to advance it.
    pub fn gc_step(&mut self) -> Result<(), SimError> {
        for c in 0..self.channels.len() {
            if self.gc_queues[c].is_empty() {
                continue;
            }
            if !self.channels[c].state.available(self.current_time) {
                continue;
            }
            self.gc_for_channel(c)?;
        }
        Ok(())
    }

    /// Pick and advance one GC node on `channel`. Returns whether any GC
    /// work happened (coordination policies may decline the whole cycle).
    pub fn gc_for_channel(&mut self, channel: usize) -> Result<bool, SimError> {
        let now = self.current_time;

        // Uninterruptible nodes with an available chip take priority; then
        // any node with an available chip.
        let pick = |uninterrupt_only: bool| -> Option<usize> {
            self.gc_queues[channel].iter().position(|node| {
                let chip = &self.channels[channel].chips[node.chip as usize];
                chip.state.available(now)
                    && (!uninterrupt_only || node.priority == GcPriority::Uninterruptible)
            })
        };
        let Some(idx) = pick(true).or_else(|| pick(false)) else {
            return Ok(false);
        };

        if self.opts.is_gcsync && self.opts.gc_time_window != 0 && self.opts.ndisk != 0 {
            let channel_now = self.channels[channel].state.current_time;
            if !gcsync_window_open(
                channel_now,
                self.opts.gc_time_window,
                self.opts.ndisk,
                self.opts.diskid,
            ) {
                return Ok(false);
            }
        }

        if self.opts.is_gclock {
            let lock = self.opts.gclock.clone().expect("gclock enabled without a token");
            let mut token = lock.lock().expect("gclock poisoned");
            if token.held_by(self.opts.diskid) {
                // Mid-round resumption of an interruptible GC: the token is
                // already ours.
            } else if token.try_acquire(now, self.opts.diskid) {
                // Acquisition costs two round-trips before GC may touch flash.
                drop(token);
                self.current_time += 4 * RAID_SSD_LATENCY_NS;
            } else {
                return Ok(false);
            }
        }

        let (chip, die, plane, priority) = {
            let node = &mut self.gc_queues[channel][idx];
            if node.state == GcState::Wait {
                node.state = GcState::Running;
                node.start_time = self.current_time;
                node.end_time = self.current_time;
                node.moved_pages = 0;
            }
            (node.chip, node.die, node.plane, node.priority)
        };

        match priority {
            GcPriority::Uninterruptible => {
                if self.gc_direct_erase(channel as u32, chip, die, plane) {
                    self.gc_queues[channel][idx].end_time =
                        self.channels[channel].state.next_state_predict_time;
                    self.delete_gc_node(channel, idx);
                } else if self.uninterrupt_gc(channel as u32, chip, die, plane, idx)? {
                    self.delete_gc_node(channel, idx);
                }
                Ok(true)
            }
            GcPriority::Interruptible => {
                if !self.decide_gc_invoke(channel) {
                    // Foreground I/O wants the channel; yield this cycle.
                    if self.opts.is_gclock {
                        let lock = self.opts.gclock.clone().expect("gclock enabled");
                        let mut token = lock.lock().expect("gclock poisoned");
                        if token.held_by(self.opts.diskid) {
                            token.release(self.current_time);
                        }
                    }
                    return Ok(false);
                }
                if self.gc_direct_erase(channel as u32, chip, die, plane) {
                    self.gc_queues[channel][idx].end_time = self.channels[channel].chips
                        [chip as usize]
                        .state
                        .next_state_predict_time;
                    self.delete_gc_node(channel, idx);
                } else if self.interrupt_gc(channel as u32, chip, die, plane, idx)? {
                    self.delete_gc_node(channel, idx);
                }
                Ok(true)
            }
        }
    }

    /// An interruptible GC must not starve foreground traffic: any queued
    /// write, or a read whose chip is (or is about to be) reachable, aborts
    /// this GC cycle.
    fn decide_gc_invoke(&self, channel: usize) -> bool {
        let now = self.current_time;
        if !self.chan_subs_w[channel].is_empty() {
            return false;
        }
        for &id in &self.chan_subs_r[channel] {
            let sub = self.subs.get(id);
            let loc = self.geo.location_of(sub.ppn);
            let chip = &self.channels[channel].chips[loc.chip as usize];
            match sub.current_state {
                SubState::Wait => {
                    if chip.state.available(now) {
                        return false;
                    }
                }
                _ => {
                    if sub.next_state == SubState::DataTransfer
                        && chip.state.next_state_predict_time <= now
                    {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Drop a finished GC node, report it, and release the GCLock token if
    /// this disk holds it.
    fn delete_gc_node(&mut self, channel: usize, idx: usize) {
        let node = self.gc_queues[channel].remove(idx);
        self.stats.gc_request -= 1;

        if node.moved_pages != 0 {
            assert!(
                node.end_time > node.start_time,
                "GC end time {} not after its start time {}",
                node.end_time,
                node.start_time
            );
            self.stats.num_gc += 1;
            self.stats.gc_move_page += node.moved_pages as u64;
            log::debug!(
                "gc-disk-{}: {} {} {} {} {:6.2}% moved {:4} [{} .. {}] ({} ns)",
                self.opts.diskid,
                channel,
                node.chip,
                node.die,
                node.plane,
                node.free_percentage,
                node.moved_pages,
                node.start_time,
                node.end_time,
                node.end_time - node.start_time,
            );
            let free_block = self.free_block_pct();
            let free_page = self.free_page_pct();
            let nonempty_free_page = self.nonempty_free_page_pct();
            let nonempty_free_block = self.nonempty_free_block_pct();
            let now = self.current_time;
            let direct_erase = self.stats.direct_erase_count;
            if let Some(out) = &mut self.out {
                out.gc_line(
                    channel as u32,
                    node.chip,
                    node.die,
                    node.plane,
                    node.free_percentage,
                    node.moved_pages,
                    node.start_time,
                    node.end_time,
                    now,
                    free_block,
                    free_page,
                    nonempty_free_page,
                    nonempty_free_block,
                    direct_erase,
                );
            }
        }

        if self.opts.is_gclock {
            if let Some(lock) = self.opts.gclock.clone() {
                let mut token = lock.lock().expect("gclock poisoned");
                if token.held_by(self.opts.diskid) {
                    token.release(node.end_time.max(self.current_time));
                }
            }
        }
    }

    // ----- direct erase ----------------------------------------------------

    /// Try to consume the plane's direct-erase list, fusing sibling planes
    /// and dies into multi-plane / interleave erases when the device supports
    /// them. Returns whether an erase was dispatched.
    pub(crate) fn gc_direct_erase(&mut self, channel: u32, chip: u32, die: u32, plane: u32) -> bool {
        let Some(&head_block) = self
            .plane(channel, chip, die, plane)
            .erase_queue
            .front()
        else {
            return false;
        };

        let ad = self.params.advanced_commands;
        let mut two_plane = false;
        if ad.contains(AdvancedCommands::TWO_PLANE) {
            // A sibling plane in the same die whose head victim has the same
            // block index can ride the same two-plane erase.
            for other in 0..self.params.plane_die {
                if other == plane {
                    continue;
                }
                if self.plane(channel, chip, die, other).erase_queue.front() == Some(&head_block) {
                    two_plane = true;
                    break;
                }
            }
        }

        let mut interleave = false;
        if ad.contains(AdvancedCommands::INTERLEAVE) {
            'dies: for other_die in 0..self.params.die_chip {
                if other_die == die {
                    continue;
                }
                for other_plane in 0..self.params.plane_die {
                    if !self
                        .plane(channel, chip, other_die, other_plane)
                        .erase_queue
                        .is_empty()
                    {
                        interleave = true;
                        break 'dies;
                    }
                }
            }
        }

        let command = match (two_plane, interleave) {
            (true, true) => EraseCommand::InterleaveTwoPlane,
            (false, true) => EraseCommand::Interleave,
            (true, false) => EraseCommand::TwoPlane,
            (false, false) => EraseCommand::Normal,
        };
        self.erase_planes(channel, chip, die, plane, command)
    }

    /// Dispatch one erase command and account its bus/flash time.
    fn erase_planes(
        &mut self,
        channel: u32,
        chip: u32,
        die1: u32,
        plane1: u32,
        command: EraseCommand,
    ) -> bool {
        let Some(&block1) = self.plane(channel, chip, die1, plane1).erase_queue.front() else {
            return false;
        };
        let now = self.current_time;
        let t = self.params.time;
        let c = channel as usize;

        self.channels[c]
            .state
            .occupy(now, ChannelState::Transfer, ChannelState::Idle, now);
        self.channels[c].chips[chip as usize].state.occupy(
            now,
            ChipState::EraseBusy,
            ChipState::Idle,
            now,
        );

        match command {
            EraseCommand::InterleaveTwoPlane => {
                // Every die contributes its planes whose head victim shares
                // one block index (pinned by die1's victim where applicable).
                for die in 0..self.params.die_chip {
                    let mut fused_block = (die == die1).then_some(block1);
                    for plane in 0..self.params.plane_die {
                        let head = self
                            .plane(channel, chip, die, plane)
                            .erase_queue
                            .front()
                            .copied();
                        let Some(block) = head else { continue };
                        match fused_block {
                            None => fused_block = Some(block),
                            Some(b) if b != block => continue,
                            Some(_) => {}
                        }
                        self.plane_mut(channel, chip, die, plane)
                            .erase_queue
                            .pop_front();
                        self.erase_operation(channel, chip, die, plane, block);
                        self.stats.direct_erase_count += 1;
                    }
                }
                self.stats.interleave_mplane_erase_count += 1;
                let chan_end = now + 18 * t.t_wc + t.t_wb;
                let chip_end = chan_end - 9 * t.t_wc + t.t_bers;
                self.channels[c].state.next_state_predict_time = chan_end;
                self.channels[c].chips[chip as usize]
                    .state
                    .next_state_predict_time = chip_end;
            }
            EraseCommand::Interleave => {
                // One plane per die, starting from the requesting plane on
                // its own die.
                for die in 0..self.params.die_chip {
                    let planes: Vec<u32> = if die == die1 {
                        vec![plane1]
                    } else {
                        (0..self.params.plane_die).collect()
                    };
                    for plane in planes {
                        if let Some(&block) =
                            self.plane(channel, chip, die, plane).erase_queue.front()
                        {
                            self.plane_mut(channel, chip, die, plane)
                                .erase_queue
                                .pop_front();
                            self.erase_operation(channel, chip, die, plane, block);
                            self.stats.direct_erase_count += 1;
                            break;
                        }
                    }
                }
                self.stats.interleave_erase_count += 1;
                let chan_end = now + 14 * t.t_wc;
                self.channels[c].state.next_state_predict_time = chan_end;
                self.channels[c].chips[chip as usize]
                    .state
                    .next_state_predict_time = chan_end + t.t_bers;
            }
            EraseCommand::TwoPlane => {
                for plane in 0..self.params.plane_die {
                    if self.plane(channel, chip, die1, plane).erase_queue.front() == Some(&block1) {
                        self.plane_mut(channel, chip, die1, plane)
                            .erase_queue
                            .pop_front();
                        self.erase_operation(channel, chip, die1, plane, block1);
                        self.stats.direct_erase_count += 1;
                    }
                }
                self.stats.mplane_erase_count += 1;
                let chan_end = now + 14 * t.t_wc;
                self.channels[c].state.next_state_predict_time = chan_end;
                self.channels[c].chips[chip as usize]
                    .state
                    .next_state_predict_time = chan_end + t.t_bers;
            }
            EraseCommand::Normal => {
                self.plane_mut(channel, chip, die1, plane1)
                    .erase_queue
                    .pop_front();
                self.erase_operation(channel, chip, die1, plane1, block1);
                self.stats.direct_erase_count += 1;
                let chan_end = now + 5 * t.t_wc;
                self.channels[c].state.next_state_predict_time = chan_end;
                self.channels[c].chips[chip as usize]
                    .state
                    .next_state_predict_time = chan_end + t.t_wb + t.t_bers;
            }
        }

        // The dispatch succeeded iff the requesting plane's head victim went
        // away.
        self.plane(channel, chip, die1, plane1).erase_queue.front() != Some(&block1)
    }

    /// Reset a block and every page in it, restoring the plane's free-page
    /// aggregate.
    pub fn erase_operation(&mut self, channel: u32, chip: u32, die: u32, plane: u32, block: u32) {
        let page_block = self.geo.page_block;
        let full_page = self.full_page();
        let plane_ref = self.plane_mut(channel, chip, die, plane);
        let blk = &mut plane_ref.blocks[block as usize];
        let reclaimed = page_block - blk.free_page_num;
        blk.free_page_num = page_block;
        blk.invalid_page_num = 0;
        blk.last_write_page = -1;
        blk.erase_count += 1;
        blk.cached_pages_num = 0;
        for page in &mut blk.pages {
            page.free_state = full_page;
            page.valid_state = 0;
            page.cached_state = 0;
            page.lpn = 0;
        }
        plane_ref.free_page += reclaimed;

        self.stats.erase_count += 1;
        self.channels[channel as usize].erase_count += 1;
        self.channels[channel as usize].chips[chip as usize].erase_count += 1;
    }

    // ----- page relocation -------------------------------------------------

    /// Move one valid page to a fresh ppn in the same plane.
    ///
    /// With greedy copyback the destination must share the source's ppn
    /// parity; pages are wasted until it does. Without copyback (or when the
    /// parity check fails non-greedily) the valid sub-pages travel through
    /// DRAM and accumulate into `transfer_sectors`.
    pub(crate) fn move_page(
        &mut self,
        src: Location,
        transfer_sectors: &mut u32,
    ) -> Result<(), SimError> {
        let (lpn, valid_state, free_state, cached_state) = {
            let page = self.page(src);
            (
                page.lpn,
                page.valid_state,
                page.free_state,
                page.cached_state,
            )
        };
        let old_ppn = self.geo.ppn_of(src);
        let mut ppn = self.get_ppn_for_gc(src.channel, src.chip, src.die, src.plane)?;

        let ad = self.params.advanced_commands;
        if ad.contains(AdvancedCommands::COPYBACK) {
            if self.params.greed_cb_ad {
                self.stats.copy_back_count += 1;
                self.stats.gc_copy_back += 1;
                while old_ppn % 2 != ppn % 2 {
                    // Wrong parity: the claimed page is unusable for
                    // copyback. Mark it dead and take the next one.
                    let waste = self.geo.location_of(ppn);
                    {
                        let block = self.block_mut(waste);
                        let page = &mut block.pages[waste.page as usize];
                        page.free_state = 0;
                        page.valid_state = 0;
                        page.cached_state = 0;
                        page.lpn = 0;
                        block.invalid_page_num += 1;
                    }
                    self.stats.waste_page_count += 1;
                    self.stats.program_count -= 1;
                    self.stats.in_program_size -= self.geo.subpage_page as u64;
                    self.stats.write_flash_count -= 1;
                    ppn = self.get_ppn_for_gc(src.channel, src.chip, src.die, src.plane)?;
                }
            } else if old_ppn % 2 != ppn % 2 {
                *transfer_sectors += popcount(valid_state);
            } else {
                self.stats.copy_back_count += 1;
                self.stats.gc_copy_back += 1;
            }
        } else {
            *transfer_sectors += popcount(valid_state);
        }

        let dst = self.geo.location_of(ppn);
        {
            let block = self.block_mut(dst);
            let page = &mut block.pages[dst.page as usize];
            page.free_state = free_state;
            page.lpn = lpn;
            page.valid_state = valid_state;
            if page.cached_state == 0 && cached_state != 0 {
                block.cached_pages_num += 1;
            }
            page.cached_state = cached_state;
        }
        {
            let block = self.block_mut(src);
            let page = &mut block.pages[src.page as usize];
            page.free_state = 0;
            page.lpn = 0;
            page.valid_state = 0;
            if page.cached_state != 0 {
                page.cached_state = 0;
                block.cached_pages_num -= 1;
            }
            block.invalid_page_num += 1;
        }

        // Redirect the mapping unless a foreground write already did.
        if self.map[lpn as usize].pn == old_ppn {
            self.map[lpn as usize].pn = ppn;
        }
        Ok(())
    }

    /// Pick a victim block in the plane under the configured policy,
    /// excluding the active block. `None` when no block scores above zero.
    fn select_victim(
        &self,
        channel: u32,
        chip: u32,
        die: u32,
        plane: u32,
        active_block: u32,
    ) -> Option<u32> {
        let mut best: Option<(u32, u32)> = None;
        for block in 0..self.geo.block_plane {
            if block == active_block {
                continue;
            }
            let metric = self.victim_metric(Location {
                channel,
                chip,
                die,
                plane,
                block,
                page: 0,
            });
            if metric > 0 && best.map_or(true, |(_, m)| metric > m) {
                best = Some((block, metric));
            }
        }
        best.map(|(block, _)| block)
    }

    /// Whole-victim GC: move every valid page, erase, and charge the full
    /// round to the channel and chip in one shot.
    fn uninterrupt_gc(
        &mut self,
        channel: u32,
        chip: u32,
        die: u32,
        plane: u32,
        node_idx: usize,
    ) -> Result<bool, SimError> {
        let active = self.find_active_block(channel, chip, die, plane)?;
        let Some(victim) = self.select_victim(channel, chip, die, plane, active) else {
            // Nothing worth collecting; consume the node.
            return Ok(true);
        };

        let mut transfer_sectors = 0u32;
        let mut moved = 0u32;
        for page in 0..self.geo.page_block {
            let loc = Location {
                channel,
                chip,
                die,
                plane,
                block: victim,
                page,
            };
            if self.page(loc).valid_state > 0 {
                self.move_page(loc, &mut transfer_sectors)?;
                moved += 1;
            }
        }
        self.erase_operation(channel, chip, die, plane, victim);

        let now = self.current_time;
        let t = self.params.time;
        let per_move = 14 * t.t_wc + t.t_r + t.t_prog;
        let mut chan_end = now + moved as i64 * per_move;
        let greedy_copyback =
            self.params.advanced_commands.contains(AdvancedCommands::COPYBACK)
                && self.params.greed_cb_ad;
        if !greedy_copyback {
            chan_end += transfer_sectors as i64 * SECTOR_BYTES * (t.t_wc + t.t_rc);
        }
        let c = channel as usize;
        self.channels[c]
            .state
            .occupy(now, ChannelState::Gc, ChannelState::Idle, chan_end);
        self.channels[c].chips[chip as usize].state.occupy(
            now,
            ChipState::EraseBusy,
            ChipState::Idle,
            chan_end + t.t_bers,
        );

        let node = &mut self.gc_queues[c][node_idx];
        node.block = Some(victim);
        node.moved_pages = moved;
        node.end_time = chan_end;
        Ok(true)
    }

    /// Incremental GC: one page move per invocation, erase once the victim
    /// holds no more valid pages. Returns whether the node is finished.
    fn interrupt_gc(
        &mut self,
        channel: u32,
        chip: u32,
        die: u32,
        plane: u32,
        node_idx: usize,
    ) -> Result<bool, SimError> {
        let c = channel as usize;
        if self.gc_queues[c][node_idx].block.is_none() {
            let active = self.plane(channel, chip, die, plane).active_block;
            match self.select_victim(channel, chip, die, plane, active) {
                Some(victim) => self.gc_queues[c][node_idx].block = Some(victim),
                None => return Ok(true),
            }
        }
        let victim = self.gc_queues[c][node_idx].block.expect("victim chosen above");
        let now = self.current_time;
        let t = self.params.time;

        let block_loc = |page| Location {
            channel,
            chip,
            die,
            plane,
            block: victim,
            page,
        };

        if self.block(block_loc(0)).invalid_page_num != self.geo.page_block {
            let cursor = self.gc_queues[c][node_idx].page;
            for page in cursor..self.geo.page_block {
                let loc = block_loc(page);
                if self.page(loc).valid_state == 0 {
                    continue;
                }
                let mut transfer_sectors = 0u32;
                self.move_page(loc, &mut transfer_sectors)?;

                let copyback = self
                    .params
                    .advanced_commands
                    .contains(AdvancedCommands::COPYBACK);
                let chan_end = if copyback {
                    now + 14 * t.t_wc + t.t_r
                } else {
                    now + (14 + 2 * transfer_sectors as i64 * SECTOR_BYTES) * t.t_wc + t.t_r
                };
                self.channels[c].state.occupy(
                    now,
                    ChannelState::CmdAddrTransfer,
                    ChannelState::Idle,
                    chan_end,
                );
                self.channels[c].chips[chip as usize].state.occupy(
                    now,
                    ChipState::CopybackBusy,
                    ChipState::Idle,
                    chan_end + t.t_prog,
                );

                let node = &mut self.gc_queues[c][node_idx];
                node.page = page + 1;
                node.moved_pages += 1;
                return Ok(false);
            }
        }

        // No valid pages remain: final erase consumes the node.
        self.erase_operation(channel, chip, die, plane, victim);
        let chan_end = now + 5 * t.t_wc;
        self.channels[c].state.occupy(
            now,
            ChannelState::CmdAddrTransfer,
            ChannelState::Idle,
            chan_end,
        );
        self.channels[c].chips[chip as usize].state.occupy(
            now,
            ChipState::EraseBusy,
            ChipState::Idle,
            chan_end + t.t_bers,
        );
        self.gc_queues[c][node_idx].end_time = chan_end;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{AllocationScheme, Params};
    use crate::sim::SimOptions;
    use crate::trace::TraceReader;

    fn params() -> Params {
        Params {
            channel_number: 1,
            chip_channel: vec![1],
            die_chip: 2,
            plane_die: 2,
            block_plane: 4,
            page_block: 4,
            subpage_page: 4,
            overprovide: 0.0,
            allocation_scheme: AllocationScheme::Static,
            static_allocation: 1,
            gc_hard_threshold: 0.5,
            ..Params::default()
        }
    }

    fn ssd(params: Params) -> Ssd {
        Ssd::new(
            params,
            TraceReader::from_records(Vec::new()),
            None,
            SimOptions::default(),
        )
    }

    /// Program `count` pages of (die, plane) 0/0 with lpns 0.., then
    /// invalidate them all so block 0 becomes a direct-erase victim.
    fn fill_and_kill_block(ssd: &mut Ssd) {
        for page in 0..4 {
            let active = ssd.find_active_block(0, 0, 0, 0).unwrap();
            assert_eq!(active, 0);
            let ppn = ssd.write_page(0, 0, 0, 0, active);
            let loc = ssd.geo.location_of(ppn);
            let p = ssd.page_mut(loc);
            p.lpn = page;
            p.valid_state = 0b1111;
            p.free_state = 0;
        }
        for page in 0..4 {
            ssd.invalidate_page(Location {
                channel: 0,
                chip: 0,
                die: 0,
                plane: 0,
                block: 0,
                page,
            });
        }
    }

    #[test]
    fn full_invalidation_queues_direct_erase() {
        let mut ssd = ssd(params());
        fill_and_kill_block(&mut ssd);
        assert_eq!(ssd.plane(0, 0, 0, 0).erase_queue.front(), Some(&0));
    }

    #[test]
    fn normal_direct_erase_resets_block_and_charges_bus() {
        let mut ssd = ssd(params());
        fill_and_kill_block(&mut ssd);
        assert!(ssd.gc_direct_erase(0, 0, 0, 0));

        let block = &ssd.plane(0, 0, 0, 0).blocks[0];
        assert_eq!(block.free_page_num, 4);
        assert_eq!(block.invalid_page_num, 0);
        assert_eq!(block.last_write_page, -1);
        assert_eq!(block.erase_count, 1);
        assert_eq!(ssd.stats.direct_erase_count, 1);

        let t = ssd.params.time;
        assert_eq!(
            ssd.channels[0].state.next_state_predict_time,
            5 * t.t_wc
        );
        assert_eq!(
            ssd.channels[0].chips[0].state.next_state_predict_time,
            5 * t.t_wc + t.t_wb + t.t_bers
        );
    }

    #[test]
    fn interleave_erase_fuses_two_dies() {
        let mut p = params();
        p.advanced_commands = AdvancedCommands::INTERLEAVE;
        let mut ssd = ssd(p);
        // Fully-invalid victims on die 0 and die 1.
        ssd.plane_mut(0, 0, 0, 0).erase_queue.push_back(2);
        ssd.plane_mut(0, 0, 1, 1).erase_queue.push_back(3);
        for (die, plane, block) in [(0, 0, 2u32), (1, 1, 3u32)] {
            let plane_ref = ssd.plane_mut(0, 0, die, plane);
            let blk = &mut plane_ref.blocks[block as usize];
            blk.invalid_page_num = 4;
            blk.free_page_num = 0;
            plane_ref.free_page -= 4;
        }

        assert!(ssd.gc_direct_erase(0, 0, 0, 0));
        assert_eq!(ssd.stats.interleave_erase_count, 1);
        assert_eq!(ssd.stats.direct_erase_count, 2);
        assert!(ssd.plane(0, 0, 0, 0).erase_queue.is_empty());
        assert!(ssd.plane(0, 0, 1, 1).erase_queue.is_empty());

        let t = ssd.params.time;
        assert_eq!(ssd.channels[0].state.next_state_predict_time, 14 * t.t_wc);
        assert_eq!(
            ssd.channels[0].chips[0].state.next_state_predict_time,
            14 * t.t_wc + t.t_bers
        );
    }

    #[test]
    fn erase_restores_the_free_page_conservation() {
        let mut ssd = ssd(params());
        fill_and_kill_block(&mut ssd);
        let before = ssd.plane(0, 0, 0, 0).free_page;
        ssd.erase_operation(0, 0, 0, 0, 0);
        assert_eq!(ssd.plane(0, 0, 0, 0).free_page, before + 4);

        // Conservation: plane aggregate equals the block sum.
        let plane = ssd.plane(0, 0, 0, 0);
        let total: u32 = plane.blocks.iter().map(|b| b.free_page_num).sum();
        assert_eq!(plane.free_page, total);
    }

    #[test]
    fn greedy_copyback_wastes_pages_until_parity_matches() {
        let mut p = params();
        p.advanced_commands = AdvancedCommands::COPYBACK;
        p.greed_cb_ad = true;
        let mut ssd = ssd(p);

        // One valid page at block 0 page 1 (odd ppn); the active block is
        // block 1, whose next free page is page 0 (even ppn) -> parity
        // mismatch forces one wasted page.
        let src = Location {
            channel: 0,
            chip: 0,
            die: 0,
            plane: 0,
            block: 0,
            page: 1,
        };
        {
            // Pages 0 and 1 of block 0 programmed; page 1 holds lpn 7.
            let active = ssd.find_active_block(0, 0, 0, 0).unwrap();
            ssd.write_page(0, 0, 0, 0, active);
            ssd.write_page(0, 0, 0, 0, active);
            let full = ssd.full_page();
            let page = ssd.page_mut(src);
            page.lpn = 7;
            page.valid_state = full;
            page.free_state = 0;
            ssd.map[7].pn = ssd.geo.ppn_of(src);
            ssd.map[7].state = full;
            // Force rotation to block 1.
            ssd.plane_mut(0, 0, 0, 0).blocks[0].free_page_num = 0;
        }

        let mut transfer = 0;
        ssd.move_page(src, &mut transfer).unwrap();
        assert_eq!(ssd.stats.waste_page_count, 1);
        assert_eq!(transfer, 0);
        // lpn 7 now maps to block 1 page 1 (parity restored).
        let new_loc = ssd.geo.location_of(ssd.map[7].pn);
        assert_eq!(new_loc.block, 1);
        assert_eq!(new_loc.page, 1);
        assert_eq!(ssd.page(new_loc).valid_state, ssd.full_page());
        assert_eq!(ssd.page(src).valid_state, 0);
    }
}
