//! RAID-0 / RAID-5 striping over several simulated disks.
//!
//! The wrapper is a thin producer for the per-disk cores: it slices the
//! workload into per-disk traces, then steps the member disks in virtual-time
//! order so cross-device coordination (GCSync windows, the GCLock token)
//! observes a single consistent clock.

use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::output::OutputSet;
use crate::params::Params;
use crate::sim::{SimError, SimOptions, Ssd};
use crate::sync::GcLock;
use crate::trace::{Op, TraceReader, TraceRecord};

/// Stripe unit in sectors.
pub const RAID_CHUNK_SECTORS: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaidLevel {
    Raid0,
    Raid5,
}

#[derive(Debug, Clone)]
pub struct RaidConfig {
    pub level: RaidLevel,
    pub ndisk: u32,
    pub is_gcsync: bool,
    pub is_gclock: bool,
    pub is_gcdefer: bool,
    pub gc_time_window: i64,
}

/// Split one request into per-disk sub-records at stripe-chunk granularity.
fn stripe(rec: &TraceRecord, cfg: &RaidConfig) -> Vec<(u32, TraceRecord)> {
    let n = cfg.ndisk;
    let chunk = RAID_CHUNK_SECTORS;
    let mut out = Vec::new();
    let mut lsn = rec.lsn;
    let mut remaining = rec.size;

    while remaining > 0 {
        let take = (chunk - lsn % chunk).min(remaining);
        let ci = lsn / chunk;
        match cfg.level {
            RaidLevel::Raid0 => {
                let disk = ci % n;
                let local = (ci / n) * chunk + lsn % chunk;
                out.push((disk, TraceRecord { lsn: local, size: take, ..*rec }));
            }
            RaidLevel::Raid5 => {
                // n-1 data chunks per row, parity rotating across disks.
                let row = ci / (n - 1);
                let pos = ci % (n - 1);
                let parity_disk = row % n;
                let disk = if pos < parity_disk { pos } else { pos + 1 };
                let local = row * chunk + lsn % chunk;
                out.push((disk, TraceRecord { lsn: local, size: take, ..*rec }));
                if rec.operation == Op::Write {
                    // Every data-chunk write updates the row's parity chunk.
                    out.push((
                        parity_disk,
                        TraceRecord {
                            lsn: local,
                            size: take,
                            ..*rec
                        },
                    ));
                }
            }
        }
        lsn += take;
        remaining -= take;
    }
    out
}

/// Run an `ndisk`-member array over the trace at `trace_path`, with one
/// result directory per disk under `out_base`.
pub fn simulate_raid(
    params: &Params,
    trace_path: &Path,
    out_base: &Path,
    cfg: &RaidConfig,
) -> Result<(), SimError> {
    let n = cfg.ndisk as usize;
    let mut per_disk: Vec<Vec<TraceRecord>> = vec![Vec::new(); n];
    let mut reader = TraceReader::open(trace_path)?;
    while let Some(rec) = reader.next()? {
        for (disk, sub) in stripe(&rec, cfg) {
            per_disk[disk as usize].push(sub);
        }
    }

    let gclock = cfg
        .is_gclock
        .then(|| Arc::new(Mutex::new(GcLock::new())));

    let mut disks = Vec::with_capacity(n);
    for (i, records) in per_disk.into_iter().enumerate() {
        let opts = SimOptions {
            diskid: i as u32,
            ndisk: cfg.ndisk,
            is_gcsync: cfg.is_gcsync,
            is_gclock: cfg.is_gclock,
            is_gcdefer: cfg.is_gcdefer,
            gc_time_window: cfg.gc_time_window,
            gclock: gclock.clone(),
        };
        let out = OutputSet::create(&out_base.join(format!("disk{i}")))?;
        disks.push(Ssd::new(
            params.clone(),
            TraceReader::from_records(records),
            Some(out),
            opts,
        ));
    }

    for disk in &mut disks {
        disk.prepare()?;
    }

    // Lockstep on virtual time: always advance the disk furthest behind, so
    // the shared GC token and sync windows see a coherent ordering.
    let mut done = vec![false; n];
    while done.iter().any(|d| !d) {
        let next = (0..n)
            .filter(|&i| !done[i])
            .min_by_key(|&i| disks[i].current_time)
            .expect("some disk unfinished");
        done[next] = disks[next].step()?;
    }

    for disk in &mut disks {
        disk.statistic_output();
        if let Some(out) = &mut disk.out {
            out.flush();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(level: RaidLevel, ndisk: u32) -> RaidConfig {
        RaidConfig {
            level,
            ndisk,
            is_gcsync: false,
            is_gclock: false,
            is_gcdefer: false,
            gc_time_window: 0,
        }
    }

    fn rec(lsn: u32, size: u32, operation: Op) -> TraceRecord {
        TraceRecord {
            time: 0,
            device: 0,
            lsn,
            size,
            operation,
        }
    }

    #[test]
    fn raid0_round_robins_chunks() {
        // Two chunks starting at chunk boundary: they land on disks 0 and 1
        // at the same local offset row.
        let parts = stripe(&rec(0, 128, Op::Write), &cfg(RaidLevel::Raid0, 2));
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], (0, rec(0, 64, Op::Write)));
        assert_eq!(parts[1], (1, rec(0, 64, Op::Write)));
    }

    #[test]
    fn raid0_splits_unaligned_requests() {
        let parts = stripe(&rec(60, 8, Op::Read), &cfg(RaidLevel::Raid0, 2));
        assert_eq!(parts.len(), 2);
        // 4 sectors finish chunk 0 (disk 0), 4 sectors open chunk 1 (disk 1).
        assert_eq!(parts[0], (0, rec(60, 4, Op::Read)));
        assert_eq!(parts[1], (1, rec(0, 4, Op::Read)));
    }

    #[test]
    fn raid5_writes_touch_data_and_parity() {
        let parts = stripe(&rec(0, 64, Op::Write), &cfg(RaidLevel::Raid5, 3));
        assert_eq!(parts.len(), 2);
        // Row 0 parity lives on disk 0, so data chunk 0 shifts to disk 1.
        assert_eq!(parts[0].0, 1);
        assert_eq!(parts[1].0, 0);
        assert_eq!(parts[0].1.lsn, 0);
    }

    #[test]
    fn raid5_reads_skip_parity() {
        let parts = stripe(&rec(0, 64, Op::Read), &cfg(RaidLevel::Raid5, 3));
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].0, 1);
    }
}
