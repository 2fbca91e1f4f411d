//! Command-line surface.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "nandsim")]
#[command(about = "NAND-flash SSD internal simulation tool")]
pub struct Cli {
    /// Workload trace file: `arrival_ns device lsn size opcode` per line.
    pub trace_file: PathBuf,

    /// Run a RAID-0 simulation over --ndisk members.
    #[arg(long)]
    pub raid0: bool,

    /// Run a RAID-5 simulation over --ndisk members.
    #[arg(long)]
    pub raid5: bool,

    /// Rotate GC between disks in fixed time windows.
    #[arg(long)]
    pub gcsync: bool,

    /// Serialize GC across disks through a shared token.
    #[arg(long)]
    pub gclock: bool,

    /// Defer GC scheduling to the RAID layer.
    #[arg(long)]
    pub gcdefer: bool,

    /// Number of disks (RAID and GC coordination).
    #[arg(long)]
    pub ndisk: Option<u32>,

    /// This disk's id, for GC coordination of a single member.
    #[arg(long)]
    pub diskid: Option<u32>,

    /// GCSync window length in nanoseconds.
    #[arg(long = "gc_time_window")]
    pub gc_time_window: Option<i64>,

    /// Timestamp for the result directory name (YYYYMMDD_HHMMSS); defaults
    /// to the current time.
    #[arg(long)]
    pub timestamp: Option<String>,

    /// Parameter file.
    #[arg(long, default_value = "page.parameters")]
    pub parameter: PathBuf,
}

impl Cli {
    /// Cross-flag constraints the derive layer cannot express.
    pub fn validate(&self) -> Result<(), String> {
        if self.raid0 && self.raid5 {
            return Err("only one type of RAID may be requested".into());
        }
        let coordination = [self.gcsync, self.gclock, self.gcdefer]
            .iter()
            .filter(|&&f| f)
            .count();
        if coordination > 1 {
            return Err("multiple gc scheduling algorithms activated".into());
        }
        let ndisk = self.ndisk.unwrap_or(0);
        if self.is_raid() && ndisk < 2 {
            return Err("RAID simulation needs at least 2 disks (--ndisk)".into());
        }
        if self.raid5 && ndisk < 3 {
            return Err("RAID 5 simulation needs at least 3 disks".into());
        }
        if self.gcsync && (ndisk == 0 || self.gc_time_window.unwrap_or(0) <= 0) {
            return Err("GCSync mode needs --ndisk, --diskid and --gc_time_window".into());
        }
        if let Some(w) = self.gc_time_window {
            if w < 0 {
                return Err(format!("gc_time_window must be > 0, got {w}"));
            }
        }
        Ok(())
    }

    pub fn is_raid(&self) -> bool {
        self.raid0 || self.raid5
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("nandsim").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn plain_invocation_is_valid() {
        let cli = parse(&["trace.txt"]);
        assert!(cli.validate().is_ok());
        assert_eq!(cli.parameter, PathBuf::from("page.parameters"));
    }

    #[test]
    fn raid_levels_are_mutually_exclusive() {
        let cli = parse(&["trace.txt", "--raid0", "--raid5", "--ndisk", "4"]);
        assert!(cli.validate().is_err());
    }

    #[test]
    fn raid5_needs_three_disks() {
        let cli = parse(&["trace.txt", "--raid5", "--ndisk", "2"]);
        assert!(cli.validate().is_err());
        let cli = parse(&["trace.txt", "--raid5", "--ndisk", "3"]);
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn gcsync_needs_window_and_disks() {
        let cli = parse(&["trace.txt", "--gcsync", "--ndisk", "2"]);
        assert!(cli.validate().is_err());
        let cli = parse(&[
            "trace.txt",
            "--gcsync",
            "--ndisk",
            "2",
            "--diskid",
            "0",
            "--gc_time_window",
            "1000000",
        ]);
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn coordination_schemes_are_exclusive() {
        let cli = parse(&["trace.txt", "--gcsync", "--gclock"]);
        assert!(cli.validate().is_err());
    }
}
