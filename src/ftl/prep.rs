//! Device pre-conditioning: trace pre-processing so reads find valid data,
//! plus the aging and warm-up fills that emulate a used drive.

use crate::flash::invert;
use crate::sim::{SimError, Ssd};
use crate::trace::Op;

/// Sub-page mask of a run of `size` sectors starting at `lsn`, within its
/// page.
pub fn set_entry_state(lsn: u32, size: u32, subpage_page: u32) -> u32 {
    let mask = !(u32::MAX << size);
    mask << (lsn % subpage_page)
}

impl Ssd {
    /// Walk the trace once and materially write every page a read record
    /// will later touch. Iteration mirrors the foreground write path but
    /// allocates through `get_ppn_for_pre_process`, which skips device-level
    /// program accounting.
    pub fn pre_process_page(&mut self) -> Result<(), SimError> {
        let sp = self.geo.subpage_page;
        let full_page = self.full_page();
        let max_lsn = self.geo.max_lsn(self.params.overprovide).max(1);
        log::debug!("pre-processing reads, largest lsn {max_lsn}");

        while let Some(rec) = self.trace.next()? {
            if rec.operation != Op::Read {
                continue;
            }
            let mut lsn = rec.lsn;
            let mut done = 0;
            while done < rec.size {
                lsn %= max_lsn;
                let mut sub_size = sp - lsn % sp;
                if done + sub_size >= rec.size {
                    sub_size = rec.size - done;
                }
                let lpn = lsn / sp;
                let chunk = set_entry_state(lsn, sub_size, sp);

                if self.map[lpn as usize].state == 0 {
                    let ppn = self.get_ppn_for_pre_process(lsn)?;
                    let loc = self.geo.location_of(ppn);
                    self.channels[loc.channel as usize].program_count += 1;
                    self.channels[loc.channel as usize].chips[loc.chip as usize].program_count += 1;
                    self.map[lpn as usize].pn = ppn;
                    self.map[lpn as usize].state = chunk;
                    let page = self.page_mut(loc);
                    page.lpn = lpn;
                    page.valid_state = chunk;
                    page.free_state = invert(chunk, full_page);
                    self.add_cached_bits(lpn, chunk);
                } else {
                    // Already written by an earlier record: merge the masks
                    // in place.
                    let merged = self.map[lpn as usize].state | chunk;
                    let loc = self.geo.location_of(self.map[lpn as usize].pn);
                    self.channels[loc.channel as usize].program_count += 1;
                    self.channels[loc.channel as usize].chips[loc.chip as usize].program_count += 1;
                    self.map[lpn as usize].state = merged;
                    let page = self.page_mut(loc);
                    page.valid_state = merged;
                    page.free_state = invert(merged, full_page);
                    self.add_cached_bits(lpn, chunk);
                }

                lsn += sub_size;
                done += sub_size;
            }
        }
        self.trace.rewind()?;
        log::debug!("pre-process complete");
        Ok(())
    }

    /// Emulate a used device by invalidating `aged_ratio` of the pages in the
    /// leading blocks of every plane.
    pub fn make_aged(&mut self) {
        let page_block = self.geo.page_block;
        let per_block = (page_block as f64 * self.params.aged_ratio).ceil() as u32;
        let per_plane = ((self.geo.block_plane * page_block) as f64 * self.params.aged_ratio) as u32;

        for c in 0..self.params.channel_number {
            for chip in 0..self.params.chip_channel[c as usize] {
                for die in 0..self.params.die_chip {
                    for plane in 0..self.params.plane_die {
                        let mut aged = 0;
                        let plane_ref = self.plane_mut(c, chip, die, plane);
                        'blocks: for block in plane_ref.blocks.iter_mut() {
                            for page in 0..per_block.min(page_block) {
                                if aged >= per_plane {
                                    break 'blocks;
                                }
                                let p = &mut block.pages[page as usize];
                                p.valid_state = 0;
                                p.free_state = 0;
                                p.lpn = 0;
                                block.free_page_num -= 1;
                                block.invalid_page_num += 1;
                                block.last_write_page += 1;
                                aged += 1;
                            }
                        }
                        plane_ref.free_page -= aged;
                    }
                }
            }
        }
        log::info!(
            "aged device: {per_block} pages invalidated per leading block (ratio {})",
            self.params.aged_ratio
        );
    }

    /// Fill the device up to `(1 - overprovide)` of its pages, assigning
    /// monotonically increasing lpns; within each block the leading
    /// `aged_ratio` pages stay valid and the rest are invalidated.
    pub fn warmup(&mut self) {
        let full_page = self.full_page();
        let threshold = self.params.aged_ratio;
        let limit =
            (self.geo.total_pages() as f64 * (1.0 - self.params.overprovide)) as u64;
        let valid_per_block = (self.geo.page_block as f64 * threshold) as u32;
        let mut filled = 0u64;
        let mut next_lpn = 0u32;

        'outer: for c in 0..self.params.channel_number {
            for chip in 0..self.params.chip_channel[c as usize] {
                for die in 0..self.params.die_chip {
                    for plane in 0..self.params.plane_die {
                        for block in 0..self.geo.block_plane {
                            for page in 0..self.geo.page_block {
                                if filled >= limit {
                                    break 'outer;
                                }
                                filled += 1;

                                let loc = crate::flash::Location {
                                    channel: c,
                                    chip,
                                    die,
                                    plane,
                                    block,
                                    page,
                                };
                                let (lpn, valid) = if page < valid_per_block {
                                    let lpn = next_lpn;
                                    next_lpn += 1;
                                    self.map[lpn as usize].pn = self.geo.ppn_of(loc);
                                    self.map[lpn as usize].state = full_page;
                                    (lpn, full_page)
                                } else {
                                    (0, 0)
                                };

                                let plane_ref = self.plane_mut(c, chip, die, plane);
                                let blk = &mut plane_ref.blocks[block as usize];
                                if valid == 0 {
                                    blk.invalid_page_num += 1;
                                }
                                let p = &mut blk.pages[page as usize];
                                p.valid_state = valid;
                                p.free_state = 0;
                                p.lpn = lpn;
                                blk.free_page_num -= 1;
                                blk.last_write_page += 1;
                                plane_ref.free_page -= 1;
                            }
                        }
                    }
                }
            }
        }
        log::info!("warmup filled {filled} pages ({next_lpn} live lpns)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{AllocationScheme, Params};
    use crate::sim::SimOptions;
    use crate::trace::{TraceReader, TraceRecord};

    fn params() -> Params {
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

    #[test]
    fn entry_state_shifts_by_sector_offset() {
        assert_eq!(set_entry_state(0, 4, 4), 0b1111);
        assert_eq!(set_entry_state(2, 2, 4), 0b1100);
        assert_eq!(set_entry_state(5, 1, 4), 0b0010);
    }

    #[test]
    fn pre_process_materializes_read_targets() {
        let records = vec![TraceRecord {
            time: 0,
            device: 0,
            lsn: 0,
            size: 6,
            operation: crate::trace::Op::Read,
        }];
        let mut ssd = Ssd::new(
            params(),
            TraceReader::from_records(records),
            None,
            SimOptions::default(),
        );
        ssd.pre_process_page().unwrap();

        // lsn 0..6 covers lpn 0 fully and lpn 1 half.
        assert_eq!(ssd.map[0].state, 0b1111);
        assert_eq!(ssd.map[1].state, 0b0011);
        let loc0 = ssd.geo.location_of(ssd.map[0].pn);
        assert_eq!(ssd.page(loc0).lpn, 0);
        assert_eq!(ssd.page(loc0).valid_state, 0b1111);
        let loc1 = ssd.geo.location_of(ssd.map[1].pn);
        assert_eq!(ssd.page(loc1).free_state, 0b1100);
        // Static case 1: consecutive lpns land on different channels.
        assert_ne!(loc0.channel, loc1.channel);
    }

    #[test]
    fn make_aged_invalidates_the_requested_share() {
        let mut p = params();
        p.aged = true;
        p.aged_ratio = 0.25;
        let mut ssd = Ssd::new(
            p,
            TraceReader::from_records(Vec::new()),
            None,
            SimOptions::default(),
        );
        ssd.make_aged();
        // 25% of 16 pages per plane = 4 aged pages.
        let plane = ssd.plane(0, 0, 0, 0);
        assert_eq!(plane.free_page, 12);
        let invalid: u32 = plane.blocks.iter().map(|b| b.invalid_page_num).sum();
        assert_eq!(invalid, 4);
    }

    #[test]
    fn warmup_assigns_monotonic_lpns() {
        let mut p = params();
        p.aged_ratio = 0.5;
        p.overprovide = 0.5;
        let mut ssd = Ssd::new(
            p,
            TraceReader::from_records(Vec::new()),
            None,
            SimOptions::default(),
        );
        ssd.warmup();
        // Half the 32 pages filled; within each block half stay valid.
        assert_eq!(ssd.map[0].state, ssd.full_page());
        let loc = ssd.geo.location_of(ssd.map[1].pn);
        assert_eq!(ssd.page(loc).lpn, 1);
        let plane0 = ssd.plane(0, 0, 0, 0);
        assert!(plane0.free_page < 16);
    }
}
