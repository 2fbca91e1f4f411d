//! Device parameters, loaded from a `key value` parameter file.
//!
//! The file format is one `key value` pair per line; `#` starts a comment.
//! `chip_channel` accepts either a single count applied to every channel or a
//! comma-separated per-channel list.

use std::fmt;
use std::path::Path;

use bitflags::bitflags;
use thiserror::Error;

/// Sub-page (sector) size in bytes. Bus-transfer times scale with this.
pub const SECTOR_BYTES: i64 = 512;

/// One-way controller latency between RAID members, used by the GCLock
/// token hand-off.
pub const RAID_SSD_LATENCY_NS: i64 = 100_000;

/// Guard interval appended to every GCSync time window so a GC that starts
/// at the window edge can drain before the next disk's turn.
pub const GCSYNC_BUFFER_TIME: i64 = 1_000_000;

bitflags! {
    /// Advanced NAND command support, as a parameter-file bitfield.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AdvancedCommands: u32 {
        const COPYBACK = 0x1;
        const TWO_PLANE = 0x2;
        const INTERLEAVE = 0x4;
    }
}

/// How foreground writes pick a (channel, chip, die, plane) tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationScheme {
    /// Round-robin token allocation; `dynamic_allocation` selects whether the
    /// channel is tokened too (0) or pinned to `lpn % channel_number` (1).
    Dynamic,
    /// One of the six fixed lpn interleavings, selected by
    /// `static_allocation`.
    Static,
}

/// Victim selection metric for garbage collection.
///
/// Both metrics exist in the field; which one is authoritative is a
/// configuration decision, so it is a knob rather than a constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcVictimPolicy {
    /// Prefer the block with the most pages observed in the write buffer.
    CachedPages,
    /// Prefer the block with the most invalidated pages.
    InvalidPages,
}

/// NAND timing characteristics, all in nanoseconds (except `tWC`/`tRC`,
/// which are per-byte bus cycles).
#[derive(Debug, Clone, Copy)]
pub struct TimeCharacteristics {
    pub t_wc: i64,
    pub t_r: i64,
    pub t_prog: i64,
    pub t_bers: i64,
    pub t_wb: i64,
    pub t_rc: i64,
}

impl Default for TimeCharacteristics {
    fn default() -> Self {
        // Typical SLC large-block part.
        Self {
            t_wc: 25,
            t_r: 20_000,
            t_prog: 200_000,
            t_bers: 1_500_000,
            t_wb: 100,
            t_rc: 25,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot open parameter file {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },
    #[error("parameter line {line}: {reason}")]
    Parse { line: usize, reason: String },
    #[error("bad parameter value for {key}: {value}")]
    Value { key: String, value: String },
}

/// Full device + policy configuration.
#[derive(Debug, Clone)]
pub struct Params {
    pub channel_number: u32,
    /// Chips per channel.
    pub chip_channel: Vec<u32>,
    pub die_chip: u32,
    pub plane_die: u32,
    pub block_plane: u32,
    pub page_block: u32,
    /// Sub-pages per page; at most 8.
    pub subpage_page: u32,
    /// Fraction of raw capacity reserved for over-provisioning.
    pub overprovide: f64,
    /// Write-buffer capacity in bytes; 0 disables the buffer.
    pub dram_capacity: u64,
    /// Request-queue admission limit.
    pub queue_length: u32,
    pub allocation_scheme: AllocationScheme,
    /// 0 = fully tokened, 1 = channel pinned by lpn (dynamic scheme only).
    pub dynamic_allocation: u32,
    /// Static interleaving case, 0..=5.
    pub static_allocation: u32,
    /// Enables soft-threshold (interruptible) garbage collection.
    pub active_write: bool,
    pub gc_hard_threshold: f64,
    pub gc_soft_threshold: f64,
    pub aged: bool,
    pub aged_ratio: f64,
    /// Pre-fill the device with `warmup` instead of `make_aged`.
    pub warmup: bool,
    pub advanced_commands: AdvancedCommands,
    /// Greedy copyback: insist on the plane-parity fast path, wasting
    /// destination pages until the parity matches.
    pub greed_cb_ad: bool,
    pub gc_victim_policy: GcVictimPolicy,
    pub time: TimeCharacteristics,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            channel_number: 8,
            chip_channel: vec![1; 8],
            die_chip: 2,
            plane_die: 2,
            block_plane: 256,
            page_block: 64,
            subpage_page: 4,
            overprovide: 0.1,
            dram_capacity: 0,
            queue_length: 64,
            allocation_scheme: AllocationScheme::Static,
            dynamic_allocation: 0,
            static_allocation: 1,
            active_write: false,
            gc_hard_threshold: 0.1,
            gc_soft_threshold: 0.2,
            aged: false,
            aged_ratio: 0.0,
            warmup: false,
            advanced_commands: AdvancedCommands::empty(),
            greed_cb_ad: false,
            gc_victim_policy: GcVictimPolicy::CachedPages,
            time: TimeCharacteristics::default(),
        }
    }
}

impl Params {
    /// Total number of chips over every channel.
    pub fn chip_num(&self) -> u32 {
        self.chip_channel.iter().sum()
    }

    /// Load parameters from a file, starting from the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Open {
            path: path.display().to_string(),
            source,
        })?;
        let mut params = Params::default();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let key = fields.next().unwrap_or("");
            let value = fields.next().ok_or_else(|| ConfigError::Parse {
                line: idx + 1,
                reason: format!("missing value for {key}"),
            })?;
            params.set(key, value).map_err(|mut e| {
                if let ConfigError::Parse { line, .. } = &mut e {
                    *line = idx + 1;
                }
                e
            })?;
        }
        params.validate()?;
        Ok(params)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        fn num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
            value.parse().map_err(|_| ConfigError::Value {
                key: key.to_string(),
                value: value.to_string(),
            })
        }

        match key {
            "channel_number" => {
                self.channel_number = num(key, value)?;
                // A plain count keeps whatever chip_channel says later; keep
                // the vector sized to the channel count either way.
                let per = self.chip_channel.first().copied().unwrap_or(1);
                self.chip_channel = vec![per; self.channel_number as usize];
            }
            "chip_channel" => {
                if value.contains(',') {
                    self.chip_channel = value
                        .split(',')
                        .map(|v| num("chip_channel", v))
                        .collect::<Result<_, _>>()?;
                } else {
                    let per: u32 = num(key, value)?;
                    self.chip_channel = vec![per; self.channel_number as usize];
                }
            }
            "die_chip" => self.die_chip = num(key, value)?,
            "plane_die" => self.plane_die = num(key, value)?,
            "block_plane" => self.block_plane = num(key, value)?,
            "page_block" => self.page_block = num(key, value)?,
            "subpage_page" => self.subpage_page = num(key, value)?,
            "overprovide" => self.overprovide = num(key, value)?,
            "dram_capacity" => self.dram_capacity = num(key, value)?,
            "queue_length" => self.queue_length = num(key, value)?,
            "allocation_scheme" => {
                self.allocation_scheme = match value {
                    "0" => AllocationScheme::Dynamic,
                    "1" => AllocationScheme::Static,
                    _ => {
                        return Err(ConfigError::Value {
                            key: key.to_string(),
                            value: value.to_string(),
                        })
                    }
                }
            }
            "dynamic_allocation" => self.dynamic_allocation = num(key, value)?,
            "static_allocation" => self.static_allocation = num(key, value)?,
            "active_write" => self.active_write = num::<u32>(key, value)? != 0,
            "gc_hard_threshold" => self.gc_hard_threshold = num(key, value)?,
            "gc_soft_threshold" => self.gc_soft_threshold = num(key, value)?,
            "aged" => self.aged = num::<u32>(key, value)? != 0,
            "aged_ratio" => self.aged_ratio = num(key, value)?,
            "warmup" => self.warmup = num::<u32>(key, value)? != 0,
            "advanced_commands" => {
                let bits: u32 = num(key, value)?;
                self.advanced_commands =
                    AdvancedCommands::from_bits(bits).ok_or_else(|| ConfigError::Value {
                        key: key.to_string(),
                        value: value.to_string(),
                    })?;
            }
            "greed_CB_ad" | "greed_cb_ad" => self.greed_cb_ad = num::<u32>(key, value)? != 0,
            "gc_victim_policy" => {
                self.gc_victim_policy = match value {
                    "cached_pages" => GcVictimPolicy::CachedPages,
                    "invalid_pages" => GcVictimPolicy::InvalidPages,
                    _ => {
                        return Err(ConfigError::Value {
                            key: key.to_string(),
                            value: value.to_string(),
                        })
                    }
                }
            }
            "tWC" => self.time.t_wc = num(key, value)?,
            "tR" => self.time.t_r = num(key, value)?,
            "tPROG" => self.time.t_prog = num(key, value)?,
            "tBERS" => self.time.t_bers = num(key, value)?,
            "tWB" => self.time.t_wb = num(key, value)?,
            "tRC" => self.time.t_rc = num(key, value)?,
            _ => {
                return Err(ConfigError::Parse {
                    line: 0,
                    reason: format!("unknown parameter {key}"),
                })
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.subpage_page == 0 || self.subpage_page > 8 {
            return Err(ConfigError::Value {
                key: "subpage_page".into(),
                value: self.subpage_page.to_string(),
            });
        }
        if self.static_allocation > 5 {
            return Err(ConfigError::Value {
                key: "static_allocation".into(),
                value: self.static_allocation.to_string(),
            });
        }
        if self.chip_channel.len() != self.channel_number as usize {
            return Err(ConfigError::Value {
                key: "chip_channel".into(),
                value: format!("{} entries", self.chip_channel.len()),
            });
        }
        Ok(())
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}ch x {}chip x {}die x {}plane, {} blocks/plane, {} pages/block, {} subpages/page",
            self.channel_number,
            self.chip_channel.first().copied().unwrap_or(0),
            self.die_chip,
            self.plane_die,
            self.block_plane,
            self.page_block,
            self.subpage_page
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_key_value_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "channel_number 2\nchip_channel 1\ndie_chip 1\nplane_die 1\n\
             block_plane 4\npage_block 4\nsubpage_page 4\noverprovide 0 # none\n\
             allocation_scheme 1\nstatic_allocation 1\ngc_hard_threshold 0.5\n\
             advanced_commands 3\ngreed_CB_ad 1\ntWC 25\ntR 20000"
        )
        .unwrap();
        let p = Params::load(file.path()).unwrap();
        assert_eq!(p.channel_number, 2);
        assert_eq!(p.chip_channel, vec![1, 1]);
        assert_eq!(p.block_plane, 4);
        assert_eq!(p.allocation_scheme, AllocationScheme::Static);
        assert!(p
            .advanced_commands
            .contains(AdvancedCommands::COPYBACK | AdvancedCommands::TWO_PLANE));
        assert!(p.greed_cb_ad);
        assert_eq!(p.time.t_r, 20_000);
    }

    #[test]
    fn rejects_out_of_range_subpage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "subpage_page 9").unwrap();
        assert!(Params::load(file.path()).is_err());
    }

    #[test]
    fn unknown_key_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "no_such_key 1").unwrap();
        assert!(Params::load(file.path()).is_err());
    }
}
