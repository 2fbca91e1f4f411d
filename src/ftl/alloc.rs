//! Write allocation: active-block rotation, page programming, and the
//! channel/chip/die/plane placement policies.

use crate::flash::{invert, Location};
use crate::params::{AllocationScheme, GcVictimPolicy};
use crate::sim::subrequest::SubId;
use crate::sim::{SimError, Ssd};

impl Ssd {
    /// Fixed lpn interleaving for static allocation, one of six layouts.
    /// Returns `(channel, chip, die, plane)`.
    pub fn static_target(&self, lpn: u32) -> (u32, u32, u32, u32) {
        let c = self.params.channel_number;
        let h = self.params.chip_channel[0];
        let d = self.params.die_chip;
        let p = self.params.plane_die;
        match self.params.static_allocation {
            0 => (
                (lpn / (p * d * h)) % c,
                lpn % h,
                (lpn / h) % d,
                (lpn / (d * h)) % p,
            ),
            1 => (
                lpn % c,
                (lpn / c) % h,
                (lpn / (h * c)) % d,
                (lpn / (d * h * c)) % p,
            ),
            2 => (
                lpn % c,
                (lpn / (p * c)) % h,
                (lpn / (p * h * c)) % d,
                (lpn / c) % p,
            ),
            3 => (
                lpn % c,
                (lpn / (d * c)) % h,
                (lpn / c) % d,
                (lpn / (d * h * c)) % p,
            ),
            4 => (
                lpn % c,
                (lpn / (p * d * c)) % h,
                (lpn / (p * c)) % d,
                (lpn / c) % p,
            ),
            5 => (
                lpn % c,
                (lpn / (p * d * c)) % h,
                (lpn / c) % d,
                (lpn / (d * c)) % p,
            ),
            other => panic!("static_allocation case {other} out of range"),
        }
    }

    /// Current token targets on `channel` without consuming them; the tokens
    /// only advance once a dispatch commits.
    pub(crate) fn peek_dynamic_target(&self, channel: u32) -> (u32, u32, u32) {
        let ch = &self.channels[channel as usize];
        let chip = ch.token;
        let die = ch.chips[chip as usize].token;
        let plane = ch.chips[chip as usize].dies[die as usize].token;
        (chip, die, plane)
    }

    pub(crate) fn advance_dynamic_tokens(&mut self, channel: u32) {
        let chip_num = self.params.chip_channel[channel as usize];
        let die_num = self.params.die_chip;
        let plane_num = self.params.plane_die;
        let ch = &mut self.channels[channel as usize];
        let chip = ch.token;
        ch.token = (chip + 1) % chip_num;
        let chip_ref = &mut ch.chips[chip as usize];
        let die = chip_ref.token;
        chip_ref.token = (die + 1) % die_num;
        let die_ref = &mut chip_ref.dies[die as usize];
        die_ref.token = (die_ref.token + 1) % plane_num;
    }

    /// Ensure the plane has a usable active block, rotating to a freshly
    /// erased one when the current active block is full.
    pub fn find_active_block(
        &mut self,
        channel: u32,
        chip: u32,
        die: u32,
        plane: u32,
    ) -> Result<u32, SimError> {
        let page_block = self.geo.page_block;
        let plane_ref = self.plane_mut(channel, chip, die, plane);
        let active = plane_ref.active_block as usize;
        if plane_ref.blocks[active].free_page_num > 0 {
            return Ok(active as u32);
        }
        match plane_ref
            .blocks
            .iter()
            .position(|b| b.free_page_num == page_block)
        {
            Some(fresh) => {
                plane_ref.active_block = fresh as u32;
                Ok(fresh as u32)
            }
            None => Err(SimError::CapacityExhausted {
                channel,
                chip,
                die,
                plane,
            }),
        }
    }

    /// Claim the next page of the active block. Decrements the plane and
    /// block free counters and returns the new ppn.
    pub fn write_page(
        &mut self,
        channel: u32,
        chip: u32,
        die: u32,
        plane: u32,
        active_block: u32,
    ) -> u32 {
        let page_block = self.geo.page_block as i32;
        let plane_ref = self.plane_mut(channel, chip, die, plane);
        let block = &mut plane_ref.blocks[active_block as usize];
        block.last_write_page += 1;
        assert!(
            block.last_write_page < page_block,
            "active block overran: last_write_page reached {page_block} \
             at channel {channel} chip {chip} die {die} plane {plane} block {active_block}"
        );
        block.free_page_num -= 1;
        let page = block.last_write_page as u32;
        plane_ref.free_page -= 1;
        self.geo.ppn_of(Location {
            channel,
            chip,
            die,
            plane,
            block: active_block,
            page,
        })
    }

    /// Program a foreground write sub-request at the given plane: invalidate
    /// the old copy, claim a page, update the mapping, and arm the GC hard
    /// threshold.
    pub fn get_ppn(
        &mut self,
        sub_id: SubId,
        channel: u32,
        chip: u32,
        die: u32,
        plane: u32,
    ) -> Result<(), SimError> {
        let (lpn, state) = {
            let sub = self.subs.get(sub_id);
            (sub.lpn, sub.state)
        };
        let full_page = self.full_page();

        let active = self.find_active_block(channel, chip, die, plane)?;
        let ppn = self.write_page(channel, chip, die, plane, active);
        let loc = self.geo.location_of(ppn);

        let entry = self.map[lpn as usize];
        if entry.state == 0 {
            assert!(
                entry.pn == 0,
                "mapping entry for lpn {lpn} has a stale pn {} with no live state",
                entry.pn
            );
            self.map[lpn as usize].pn = ppn;
            self.map[lpn as usize].state = state;
        } else {
            // Updated logical page: the old physical copy dies here.
            let old_loc = self.geo.location_of(entry.pn);
            assert!(
                self.page(old_loc).lpn == lpn,
                "page at ppn {} stores lpn {} but the mapping says {lpn}",
                entry.pn,
                self.page(old_loc).lpn
            );
            self.invalidate_page(old_loc);
            self.map[lpn as usize].pn = ppn;
            self.map[lpn as usize].state = entry.state | state;
        }

        {
            let block = self.block_mut(loc);
            let page = &mut block.pages[loc.page as usize];
            page.lpn = lpn;
            page.valid_state = state;
            page.free_state = invert(state, full_page);
            page.written_count += 1;
            if page.cached_state == 0 && state != 0 {
                block.cached_pages_num += 1;
            }
            page.cached_state = state;
        }

        self.stats.program_count += 1;
        self.stats.in_program_size += self.geo.subpage_page as u64;
        self.stats.write_flash_count += 1;
        self.channels[channel as usize].program_count += 1;
        self.channels[channel as usize].chips[chip as usize].program_count += 1;

        {
            let sub = self.subs.get_mut(sub_id);
            sub.ppn = ppn;
            sub.location = Some(loc);
        }

        // Hard threshold: mandatory, uninterruptible GC. With active_write
        // the soft threshold drives GC from the periodic scan instead.
        if !self.params.active_write {
            let limit = (self.geo.page_block * self.geo.block_plane) as f64
                * self.params.gc_hard_threshold;
            if (self.plane(channel, chip, die, plane).free_page as f64) < limit {
                self.enqueue_gc_node(
                    channel,
                    chip,
                    die,
                    plane,
                    crate::ftl::gc::GcPriority::Uninterruptible,
                );
            }
        }
        Ok(())
    }

    /// Claim a relocation target for GC in the same plane. No mapping or GC
    /// bookkeeping; the caller reconciles the mapping after the move.
    pub fn get_ppn_for_gc(
        &mut self,
        channel: u32,
        chip: u32,
        die: u32,
        plane: u32,
    ) -> Result<u32, SimError> {
        let active = self.find_active_block(channel, chip, die, plane)?;
        let ppn = self.write_page(channel, chip, die, plane, active);
        let loc = self.geo.location_of(ppn);
        self.page_mut(loc).written_count += 1;
        self.stats.program_count += 1;
        self.stats.in_program_size += self.geo.subpage_page as u64;
        self.stats.write_flash_count += 1;
        self.channels[channel as usize].program_count += 1;
        self.channels[channel as usize].chips[chip as usize].program_count += 1;
        Ok(ppn)
    }

    /// Allocator used by the trace pre-process pass: same placement policies
    /// as foreground writes, no device-level program accounting.
    pub fn get_ppn_for_pre_process(&mut self, lsn: u32) -> Result<u32, SimError> {
        let lpn = lsn / self.geo.subpage_page;
        let (channel, chip, die, plane) = match self.params.allocation_scheme {
            AllocationScheme::Dynamic => {
                let channel = if self.params.dynamic_allocation == 0 {
                    let c = self.channel_token;
                    self.channel_token = (c + 1) % self.params.channel_number;
                    c
                } else {
                    lpn % self.params.channel_number
                };
                let (chip, die, plane) = self.peek_dynamic_target(channel);
                self.advance_dynamic_tokens(channel);
                (channel, chip, die, plane)
            }
            AllocationScheme::Static => self.static_target(lpn),
        };
        let active = self.find_active_block(channel, chip, die, plane)?;
        Ok(self.write_page(channel, chip, die, plane, active))
    }

    /// Victim metric for one block under the configured policy.
    pub(crate) fn victim_metric(&self, loc: Location) -> u32 {
        let block = self.block(loc);
        match self.params.gc_victim_policy {
            GcVictimPolicy::CachedPages => block.cached_pages_num,
            GcVictimPolicy::InvalidPages => block.invalid_page_num,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Params;
    use crate::sim::SimOptions;
    use crate::trace::TraceReader;

    fn small_params() -> Params {
        Params {
            channel_number: 2,
            chip_channel: vec![1, 1],
            die_chip: 1,
            plane_die: 1,
            block_plane: 4,
            page_block: 4,
            subpage_page: 4,
            overprovide: 0.0,
            allocation_scheme: AllocationScheme::Static,
            static_allocation: 1,
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

    #[test]
    fn static_case_1_spreads_lpns_over_channels_first() {
        let ssd = ssd(small_params());
        assert_eq!(ssd.static_target(0), (0, 0, 0, 0));
        assert_eq!(ssd.static_target(1), (1, 0, 0, 0));
        assert_eq!(ssd.static_target(2), (0, 0, 0, 0));
    }

    #[test]
    fn static_case_0_spreads_lpns_over_chips_first() {
        let mut params = small_params();
        params.static_allocation = 0;
        params.chip_channel = vec![2, 2];
        let ssd = ssd(params);
        assert_eq!(ssd.static_target(0), (0, 0, 0, 0));
        assert_eq!(ssd.static_target(1), (0, 1, 0, 0));
        assert_eq!(ssd.static_target(2), (1, 0, 0, 0));
    }

    #[test]
    fn write_page_fills_the_block_sequentially() {
        let mut ssd = ssd(small_params());
        for expected_page in 0..4 {
            let active = ssd.find_active_block(0, 0, 0, 0).unwrap();
            let ppn = ssd.write_page(0, 0, 0, 0, active);
            let loc = ssd.geo.location_of(ppn);
            assert_eq!(loc.page, expected_page);
            assert_eq!(loc.block, 0);
        }
        // Block 0 is full; the next allocation rotates to a fresh block.
        let active = ssd.find_active_block(0, 0, 0, 0).unwrap();
        assert_eq!(active, 1);
        let free: u32 = ssd.plane(0, 0, 0, 0).free_page;
        assert_eq!(free, 16 - 4);
    }

    #[test]
    fn allocator_exhaustion_is_reported() {
        let mut ssd = ssd(small_params());
        for _ in 0..16 {
            let active = ssd.find_active_block(0, 0, 0, 0).unwrap();
            ssd.write_page(0, 0, 0, 0, active);
        }
        assert!(matches!(
            ssd.find_active_block(0, 0, 0, 0),
            Err(SimError::CapacityExhausted { .. })
        ));
    }

    #[test]
    fn dynamic_tokens_round_robin() {
        let mut params = small_params();
        params.allocation_scheme = AllocationScheme::Dynamic;
        params.dynamic_allocation = 0;
        params.die_chip = 2;
        let mut ssd = ssd(params);
        // Two dies on one chip: the die token alternates.
        assert_eq!(ssd.peek_dynamic_target(0), (0, 0, 0));
        ssd.advance_dynamic_tokens(0);
        assert_eq!(ssd.peek_dynamic_target(0), (0, 1, 0));
    }
}
