//! Shared fixtures for the integration tests: the reference topology from
//! the end-to-end scenarios and a structural invariant checker.
#![allow(dead_code)]

use nandsim::flash::{popcount, Location};
use nandsim::params::{AllocationScheme, Params};
use nandsim::sim::{SimOptions, Ssd};
use nandsim::trace::{TraceReader, TraceRecord};

/// 2 channels x 1 chip x 1 die x 1 plane, 4 blocks of 4 pages of 4
/// sub-pages, no over-provisioning, static allocation case 1.
pub fn spec_params() -> Params {
    Params {
        channel_number: 2,
        chip_channel: vec![1, 1],
        die_chip: 1,
        plane_die: 1,
        block_plane: 4,
        page_block: 4,
        subpage_page: 4,
        overprovide: 0.0,
        dram_capacity: 0,
        allocation_scheme: AllocationScheme::Static,
        static_allocation: 1,
        ..Params::default()
    }
}

pub fn ssd_with_records(params: Params, records: Vec<TraceRecord>) -> Ssd {
    Ssd::new(
        params,
        TraceReader::from_records(records),
        None,
        SimOptions::default(),
    )
}

#[allow(dead_code)]
pub fn ssd_with_options(params: Params, records: Vec<TraceRecord>, opts: SimOptions) -> Ssd {
    Ssd::new(params, TraceReader::from_records(records), None, opts)
}

pub fn write_rec(time: i64, lsn: u32, size: u32) -> TraceRecord {
    TraceRecord {
        time,
        device: 0,
        lsn,
        size,
        operation: nandsim::trace::Op::Write,
    }
}

#[allow(dead_code)]
pub fn read_rec(time: i64, lsn: u32, size: u32) -> TraceRecord {
    TraceRecord {
        time,
        device: 0,
        lsn,
        size,
        operation: nandsim::trace::Op::Read,
    }
}

/// Program and fully invalidate block 0 of (channel, 0, 0, 0) so it becomes
/// a direct-erase victim.
#[allow(dead_code)]
pub fn make_direct_erase_victim(ssd: &mut Ssd, channel: u32) {
    let full = ssd.full_page();
    for page in 0..ssd.geo.page_block {
        let active = ssd.find_active_block(channel, 0, 0, 0).unwrap();
        assert_eq!(active, 0);
        let ppn = ssd.write_page(channel, 0, 0, 0, active);
        let loc = ssd.geo.location_of(ppn);
        let p = ssd.page_mut(loc);
        p.lpn = page;
        p.valid_state = full;
        p.free_state = 0;
    }
    for page in 0..ssd.geo.page_block {
        ssd.invalidate_page(Location {
            channel,
            chip: 0,
            die: 0,
            plane: 0,
            block: 0,
            page,
        });
    }
    assert_eq!(
        ssd.plane(channel, 0, 0, 0).erase_queue.front(),
        Some(&0u32)
    );
}

/// The universal invariants: disjoint page masks, block accounting,
/// plane/block free-page conservation, and mapping/page agreement.
pub fn check_invariants(ssd: &Ssd) {
    let sp = ssd.geo.subpage_page;
    let page_block = ssd.geo.page_block;

    for channel in &ssd.channels {
        for chip in &channel.chips {
            for die in &chip.dies {
                for plane in &die.planes {
                    let mut plane_free = 0;
                    for block in &plane.blocks {
                        let mut valid_pages = 0;
                        for page in &block.pages {
                            assert_eq!(
                                page.valid_state & page.free_state,
                                0,
                                "a sub-page is both valid and free"
                            );
                            assert!(
                                popcount(page.valid_state) + popcount(page.free_state) <= sp
                            );
                            if page.valid_state > 0 {
                                valid_pages += 1;
                            }
                        }
                        assert_eq!(
                            block.free_page_num + block.invalid_page_num + valid_pages,
                            page_block,
                            "block page accounting out of balance"
                        );
                        plane_free += block.free_page_num;
                    }
                    assert_eq!(
                        plane.free_page, plane_free,
                        "plane free-page aggregate out of sync with its blocks"
                    );
                }
            }
        }
    }

    for (lpn, entry) in ssd.map.iter().enumerate() {
        if entry.state != 0 {
            let loc = ssd.geo.location_of(entry.pn);
            let page = ssd.page(loc);
            assert_eq!(page.lpn as usize, lpn, "mapping points at a foreign page");
            assert_eq!(
                page.valid_state, entry.state,
                "mapping mask diverged from the page"
            );
        }
    }
}
