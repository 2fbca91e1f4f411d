//! Physical-page addressing.
//!
//! A physical page number (ppn) is a flat index over the device hierarchy:
//! channels are laid out first (each sized by its own chip count), then chips,
//! dies, planes, blocks, pages. The per-level page counts are computed once
//! and reused for both directions of the conversion.

use crate::params::Params;

/// Coordinates of one physical page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub channel: u32,
    pub chip: u32,
    pub die: u32,
    pub plane: u32,
    pub block: u32,
    pub page: u32,
}

/// Precomputed per-level page counts.
#[derive(Debug, Clone)]
pub struct Geometry {
    pub channel_number: u32,
    pub chip_channel: Vec<u32>,
    pub die_chip: u32,
    pub plane_die: u32,
    pub block_plane: u32,
    pub page_block: u32,
    pub subpage_page: u32,
    page_plane: u32,
    page_die: u32,
    page_chip: u32,
    /// Running ppn base of each channel.
    channel_base: Vec<u32>,
}

impl Geometry {
    pub fn new(params: &Params) -> Self {
        let page_plane = params.page_block * params.block_plane;
        let page_die = page_plane * params.plane_die;
        let page_chip = page_die * params.die_chip;
        let mut channel_base = Vec::with_capacity(params.channel_number as usize);
        let mut base = 0;
        for &chips in &params.chip_channel {
            channel_base.push(base);
            base += chips * page_chip;
        }
        Self {
            channel_number: params.channel_number,
            chip_channel: params.chip_channel.clone(),
            die_chip: params.die_chip,
            plane_die: params.plane_die,
            block_plane: params.block_plane,
            page_block: params.page_block,
            subpage_page: params.subpage_page,
            page_plane,
            page_die,
            page_chip,
            channel_base,
        }
    }

    pub fn pages_per_plane(&self) -> u32 {
        self.page_plane
    }

    /// Total pages in the device.
    pub fn total_pages(&self) -> u64 {
        self.chip_channel
            .iter()
            .map(|&chips| chips as u64 * self.page_chip as u64)
            .sum()
    }

    pub fn total_subpages(&self) -> u64 {
        self.total_pages() * self.subpage_page as u64
    }

    /// Largest addressable logical sector; incoming lsns wrap at this bound.
    pub fn max_lsn(&self, overprovide: f64) -> u32 {
        ((self.total_subpages() as f64) * (1.0 - overprovide)) as u32
    }

    /// Number of mapping entries (logical pages) the FTL needs.
    pub fn lpn_count(&self) -> usize {
        self.total_pages() as usize
    }

    /// All-ones mask over the sub-pages of one page.
    pub fn full_page_mask(&self) -> u32 {
        !(u32::MAX << self.subpage_page)
    }

    pub fn ppn_of(&self, loc: Location) -> u32 {
        self.channel_base[loc.channel as usize]
            + loc.chip * self.page_chip
            + loc.die * self.page_die
            + loc.plane * self.page_plane
            + loc.block * self.page_block
            + loc.page
    }

    pub fn location_of(&self, ppn: u32) -> Location {
        // Channel sizes may differ, so find the channel by its base offset.
        let mut channel = self.channel_base.len() - 1;
        while self.channel_base[channel] > ppn {
            channel -= 1;
        }
        let mut rest = ppn - self.channel_base[channel];
        let chip = rest / self.page_chip;
        rest %= self.page_chip;
        let die = rest / self.page_die;
        rest %= self.page_die;
        let plane = rest / self.page_plane;
        rest %= self.page_plane;
        let block = rest / self.page_block;
        let page = rest % self.page_block;
        Location {
            channel: channel as u32,
            chip,
            die,
            plane,
            block,
            page,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> Geometry {
        let params = Params {
            channel_number: 2,
            chip_channel: vec![2, 1],
            die_chip: 2,
            plane_die: 2,
            block_plane: 4,
            page_block: 8,
            subpage_page: 4,
            ..Params::default()
        };
        Geometry::new(&params)
    }

    #[test]
    fn round_trips_every_coordinate() {
        let geo = geometry();
        for channel in 0..2u32 {
            for chip in 0..geo.chip_channel[channel as usize] {
                for die in 0..2 {
                    for plane in 0..2 {
                        for block in 0..4 {
                            for page in 0..8 {
                                let loc = Location {
                                    channel,
                                    chip,
                                    die,
                                    plane,
                                    block,
                                    page,
                                };
                                assert_eq!(geo.location_of(geo.ppn_of(loc)), loc);
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn ppn_is_dense() {
        let geo = geometry();
        // Uneven chip counts: channel 1 starts right after channel 0's pages.
        let last_of_ch0 = Location {
            channel: 0,
            chip: 1,
            die: 1,
            plane: 1,
            block: 3,
            page: 7,
        };
        let first_of_ch1 = Location {
            channel: 1,
            chip: 0,
            die: 0,
            plane: 0,
            block: 0,
            page: 0,
        };
        assert_eq!(geo.ppn_of(last_of_ch0) + 1, geo.ppn_of(first_of_ch1));
        assert_eq!(geo.total_pages(), (2 + 1) * 2 * 2 * 4 * 8);
    }

    #[test]
    fn full_page_mask_matches_subpage_count() {
        let geo = geometry();
        assert_eq!(geo.full_page_mask(), 0b1111);
    }
}
