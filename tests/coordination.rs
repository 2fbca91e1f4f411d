//! Cross-device GC coordination scenarios: GCSync windows and the GCLock
//! token.

mod common;

use std::sync::{Arc, Mutex};

use common::*;
use nandsim::ftl::gc::GcPriority;
use nandsim::params::RAID_SSD_LATENCY_NS;
use nandsim::sim::SimOptions;
use nandsim::sync::GcLock;

const WINDOW: i64 = 1_000_000;

fn gcsync_opts(diskid: u32) -> SimOptions {
    SimOptions {
        diskid,
        ndisk: 2,
        is_gcsync: true,
        gc_time_window: WINDOW,
        ..SimOptions::default()
    }
}

/// Outside its window a disk's GC is declined and the queue is untouched.
#[test]
fn gcsync_declines_gc_outside_the_disk_window() {
    let mut ssd = ssd_with_options(spec_params(), Vec::new(), gcsync_opts(1));
    make_direct_erase_victim(&mut ssd, 0);
    ssd.enqueue_gc_node(0, 0, 0, 0, GcPriority::Uninterruptible);

    // Slot 0 belongs to disk 0, not disk 1.
    assert!(!ssd.gc_for_channel(0).unwrap());
    assert_eq!(ssd.gc_queues[0].len(), 1);
    assert_eq!(ssd.stats.direct_erase_count, 0);
}

/// Inside its window the same GC runs (direct erase fast path here).
#[test]
fn gcsync_allows_gc_inside_the_disk_window() {
    let mut ssd = ssd_with_options(spec_params(), Vec::new(), gcsync_opts(0));
    make_direct_erase_victim(&mut ssd, 0);
    ssd.enqueue_gc_node(0, 0, 0, 0, GcPriority::Uninterruptible);

    assert!(ssd.gc_for_channel(0).unwrap());
    assert!(ssd.gc_queues[0].is_empty());
    assert_eq!(ssd.stats.direct_erase_count, 1);
    check_invariants(&ssd);
}

/// Even in its slot, GC must start within the window proper, not in the
/// buffer tail.
#[test]
fn gcsync_declines_gc_in_the_buffer_tail() {
    let mut ssd = ssd_with_options(spec_params(), Vec::new(), gcsync_opts(0));
    make_direct_erase_victim(&mut ssd, 0);
    ssd.enqueue_gc_node(0, 0, 0, 0, GcPriority::Uninterruptible);

    // Park the channel clock just past the window end.
    ssd.channels[0].state.current_time = WINDOW + 1;
    assert!(!ssd.gc_for_channel(0).unwrap());
    assert_eq!(ssd.gc_queues[0].len(), 1);
}

/// Two disks sharing a GCLock token never run GC concurrently: the second
/// disk is declined until the first round's end plus the hand-off delay.
#[test]
fn gclock_serializes_gc_across_disks() {
    let token = Arc::new(Mutex::new(GcLock::new()));
    let opts = |diskid| SimOptions {
        diskid,
        ndisk: 2,
        is_gclock: true,
        gclock: Some(token.clone()),
        ..SimOptions::default()
    };
    let mut disk0 = ssd_with_options(spec_params(), Vec::new(), opts(0));
    let mut disk1 = ssd_with_options(spec_params(), Vec::new(), opts(1));
    for disk in [&mut disk0, &mut disk1] {
        make_direct_erase_victim(disk, 0);
        disk.enqueue_gc_node(0, 0, 0, 0, GcPriority::Uninterruptible);
    }

    // Disk 0 takes the token, runs its round, and releases.
    assert!(disk0.gc_for_channel(0).unwrap());
    assert!(disk0.gc_queues[0].is_empty());
    // Acquisition charged two round-trips to disk 0's clock.
    assert_eq!(disk0.current_time, 4 * RAID_SSD_LATENCY_NS);

    let cooled = {
        let t = token.lock().unwrap();
        assert!(t.is_available, "token not released after the round");
        t.end_time
    };
    assert!(cooled > disk0.current_time);

    // Disk 1 is declined while the token cools down.
    assert!(!disk1.gc_for_channel(0).unwrap());
    assert_eq!(disk1.gc_queues[0].len(), 1);

    // Once past the cool-down it may proceed: the rounds cannot overlap.
    disk1.current_time = cooled;
    assert!(disk1.gc_for_channel(0).unwrap());
    assert!(disk1.gc_queues[0].is_empty());
    assert!(disk1.current_time >= cooled);
    check_invariants(&disk0);
    check_invariants(&disk1);
}
