//! Result files, written under `raw/<timestamp>/`.
//!
//! Per-request latency lines go to `ex.out` plus the `io*.dat` family; GC
//! rounds go to `gc.dat`; aggregate statistics land in `statistic10.dat` and
//! `statistic2.dat` at the end of the run.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// The open result files of one simulated disk.
#[derive(Debug)]
pub struct OutputSet {
    pub dir: PathBuf,
    ex_out: BufWriter<File>,
    statistic: BufWriter<File>,
    statistic2: BufWriter<File>,
    io: BufWriter<File>,
    io_write: BufWriter<File>,
    io_read: BufWriter<File>,
    gc: BufWriter<File>,
}

impl OutputSet {
    /// Create `dir` (and parents) and open every result file in it.
    pub fn create(dir: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let open = |name: &str| -> io::Result<BufWriter<File>> {
            Ok(BufWriter::new(File::create(dir.join(name))?))
        };
        let mut set = Self {
            dir: dir.to_path_buf(),
            ex_out: open("ex.out")?,
            statistic: open("statistic10.dat")?,
            statistic2: open("statistic2.dat")?,
            io: open("io.dat")?,
            io_write: open("io_write.dat")?,
            io_read: open("io_read.dat")?,
            gc: open("gc.dat")?,
        };
        writeln!(
            set.ex_out,
            "      arrive           lsn     size ope     begin time    response time    process time"
        )?;
        Ok(set)
    }

    /// One completed request:
    /// `arrive lsn size ope begin end latency meet_gc_flag meet_gc_remaining_time`.
    #[allow(clippy::too_many_arguments)]
    pub fn io_line(
        &mut self,
        arrive: i64,
        lsn: u32,
        size: u32,
        ope: u32,
        begin: i64,
        end: i64,
        meet_gc: bool,
        meet_gc_remaining: i64,
    ) {
        let latency = end - arrive;
        let line = format!(
            "{arrive:>16} {lsn:>10} {size:>6} {ope:>2} {begin:>16} {end:>16} {latency:>10} {:>2} {meet_gc_remaining:>10}",
            meet_gc as u32
        );
        let _ = writeln!(self.ex_out, "{line}");
        let _ = writeln!(self.io, "{line}");
        let per_op = if ope == 1 {
            &mut self.io_read
        } else {
            &mut self.io_write
        };
        let _ = writeln!(per_op, "{line}");
    }

    /// One finished GC round plus a snapshot of device-wide free space.
    #[allow(clippy::too_many_arguments)]
    pub fn gc_line(
        &mut self,
        channel: u32,
        chip: u32,
        die: u32,
        plane: u32,
        free_percentage: f64,
        moved_pages: u32,
        start: i64,
        end: i64,
        now: i64,
        free_block_pct: f64,
        free_page_pct: f64,
        nonempty_free_page_pct: f64,
        nonempty_free_block_pct: f64,
        direct_erase_count: u64,
    ) {
        let _ = writeln!(
            self.gc,
            "{channel} \t {chip} \t {die} \t {plane} \t{free_percentage:6.2} {moved_pages:8} \
             {start:>16} {end:>16} {:>16} | {now} {free_block_pct:.3} {free_page_pct:.3} \
             {nonempty_free_page_pct:.3} {nonempty_free_block_pct:.3} | {direct_erase_count}",
            end - start
        );
    }

    /// Writer for the human-readable statistics block (`ex.out`).
    pub fn ex_out(&mut self) -> &mut dyn Write {
        &mut self.ex_out
    }

    /// Writer for the machine-oriented statistics (`statistic10.dat`).
    pub fn statistic(&mut self) -> &mut dyn Write {
        &mut self.statistic
    }

    /// Writer for the short run summary (`statistic2.dat`).
    pub fn statistic2(&mut self) -> &mut dyn Write {
        &mut self.statistic2
    }

    pub fn flush(&mut self) {
        for w in [
            &mut self.ex_out,
            &mut self.statistic,
            &mut self.statistic2,
            &mut self.io,
            &mut self.io_write,
            &mut self.io_read,
            &mut self.gc,
        ] {
            let _ = w.flush();
        }
    }
}

fn is_leap_year(year: u64) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

fn days_in_month(month: u64, year: u64) -> u64 {
    match month {
        4 | 6 | 9 | 11 => 30,
        2 => {
            if is_leap_year(year) {
                29
            } else {
                28
            }
        }
        _ => 31,
    }
}

/// `YYYYMMDD_HHMMSS` for the log directory name.
pub fn format_timestamp(unix_secs: u64) -> String {
    let secs_of_day = unix_secs % 86_400;
    let mut days = unix_secs / 86_400;

    let mut year = 1970;
    loop {
        let len = if is_leap_year(year) { 366 } else { 365 };
        if days < len {
            break;
        }
        days -= len;
        year += 1;
    }
    let mut month = 1;
    while days >= days_in_month(month, year) {
        days -= days_in_month(month, year);
        month += 1;
    }
    format!(
        "{year:04}{month:02}{:02}_{:02}{:02}{:02}",
        days + 1,
        secs_of_day / 3600,
        (secs_of_day % 3600) / 60,
        secs_of_day % 60
    )
}

/// Timestamp for right now, used when the CLI does not pin one.
pub fn current_timestamp() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format_timestamp(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_formatting_handles_leap_years() {
        // 2000-02-29 12:34:56 UTC
        assert_eq!(format_timestamp(951_827_696), "20000229_123456");
        // Epoch.
        assert_eq!(format_timestamp(0), "19700101_000000");
    }

    #[test]
    fn creates_all_result_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run");
        let mut out = OutputSet::create(&path).unwrap();
        out.io_line(0, 0, 4, 0, 0, 1000, false, 0);
        out.flush();
        for name in [
            "ex.out",
            "statistic10.dat",
            "statistic2.dat",
            "io.dat",
            "io_write.dat",
            "io_read.dat",
            "gc.dat",
        ] {
            assert!(path.join(name).exists(), "{name} missing");
        }
        let io = std::fs::read_to_string(path.join("io.dat")).unwrap();
        assert!(io.contains("1000"));
    }
}
