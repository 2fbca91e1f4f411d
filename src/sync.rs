//! Cross-device GC coordination: GCSync time windows and the GCLock token.
//!
//! GCDefer has no device-side state; the flag is plumbed through to the RAID
//! layer, which reorders deferred requests itself.

use crate::params::{GCSYNC_BUFFER_TIME, RAID_SSD_LATENCY_NS};

/// GCSync: disks take turns in rotating time windows.
///
/// With window `w` and buffer `b`, slot `t / (w + b)` belongs to disk
/// `slot % ndisk`, and GC must also start within the first `w` nanoseconds of
/// the slot so it can drain inside the buffer.
pub fn gcsync_window_open(now: i64, window: i64, ndisk: u32, diskid: u32) -> bool {
    let slot = now / (window + GCSYNC_BUFFER_TIME);
    let upper = slot * (window + GCSYNC_BUFFER_TIME) + window;
    slot % ndisk as i64 == diskid as i64 && now <= upper
}

/// Process-wide GC token shared by every disk of a RAID set.
///
/// At most one disk runs GC at a time; release schedules the token to become
/// reusable only after two controller hops.
#[derive(Debug)]
pub struct GcLock {
    pub is_available: bool,
    pub end_time: i64,
    pub holder_id: i32,
    pub begin_time: i64,
}

impl Default for GcLock {
    fn default() -> Self {
        Self::new()
    }
}

impl GcLock {
    pub fn new() -> Self {
        Self {
            is_available: true,
            end_time: 0,
            holder_id: -1,
            begin_time: 0,
        }
    }

    /// Try to take the token at `now`. On success the caller must account for
    /// the acquisition round-trip (`4 * RAID_SSD_LATENCY_NS`) itself, since it
    /// advances that disk's virtual clock.
    pub fn try_acquire(&mut self, now: i64, diskid: u32) -> bool {
        if self.is_available && self.end_time <= now {
            self.is_available = false;
            self.begin_time = now + 4 * RAID_SSD_LATENCY_NS;
            self.holder_id = diskid as i32;
            true
        } else {
            false
        }
    }

    pub fn held_by(&self, diskid: u32) -> bool {
        !self.is_available && self.holder_id == diskid as i32
    }

    /// Release after a GC round that finished at `gc_end_time`.
    pub fn release(&mut self, gc_end_time: i64) {
        self.end_time = gc_end_time + 2 * RAID_SSD_LATENCY_NS;
        self.holder_id = -1;
        self.is_available = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gcsync_rotates_between_disks() {
        let w = 1_000_000;
        let slot = w + GCSYNC_BUFFER_TIME;
        // Slot 0 belongs to disk 0, slot 1 to disk 1.
        assert!(gcsync_window_open(0, w, 2, 0));
        assert!(!gcsync_window_open(0, w, 2, 1));
        assert!(gcsync_window_open(slot + 1, w, 2, 1));
        assert!(!gcsync_window_open(slot + 1, w, 2, 0));
    }

    #[test]
    fn gcsync_rejects_the_buffer_tail() {
        let w = 1_000_000;
        // Inside the window proper.
        assert!(gcsync_window_open(w, w, 2, 0));
        // Past the window, inside the buffer: no new GC.
        assert!(!gcsync_window_open(w + 1, w, 2, 0));
    }

    #[test]
    fn gclock_excludes_and_cools_down() {
        let mut lock = GcLock::new();
        assert!(lock.try_acquire(0, 0));
        assert!(!lock.try_acquire(0, 1));
        assert!(lock.held_by(0));

        lock.release(10_000);
        // The token exists again but only becomes takeable after the
        // two-hop cool-down.
        assert!(!lock.try_acquire(10_000, 1));
        assert!(lock.try_acquire(10_000 + 2 * RAID_SSD_LATENCY_NS, 1));
    }
}
