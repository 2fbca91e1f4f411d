//! Device topology and per-resource timing state.
//!
//! Ownership is strictly hierarchical: the device owns channels, channels own
//! chips, and so on down to pages. Anything that needs to refer across the
//! hierarchy (mapping table, GC queues, sub-request queues) carries
//! [`addr::Location`] coordinates instead of references.

pub mod addr;

use crate::params::Params;

pub use addr::{Geometry, Location};

/// Set bits in a sub-page mask.
#[inline]
pub fn popcount(mask: u32) -> u32 {
    mask.count_ones()
}

/// Complement of `mask` within one page's sub-page bits.
#[inline]
pub fn invert(mask: u32, full_page: u32) -> u32 {
    !mask & full_page
}

/// One flash page and its sub-page bookkeeping.
///
/// `valid_state` and `free_state` are disjoint bitmasks: a sub-page is valid,
/// free, or (in neither mask) invalidated. `cached_state` records sub-pages
/// that were observed in the write buffer and only feeds GC victim selection.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub lpn: u32,
    pub valid_state: u32,
    pub free_state: u32,
    pub cached_state: u32,
    pub written_count: u32,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub pages: Vec<Page>,
    pub free_page_num: u32,
    pub invalid_page_num: u32,
    /// Highest programmed page index; -1 when erased.
    pub last_write_page: i32,
    pub erase_count: u32,
    /// Pages in this block with any `cached_state` bit set.
    pub cached_pages_num: u32,
}

impl Block {
    fn new(page_block: u32, full_page: u32) -> Self {
        Self {
            pages: vec![
                Page {
                    free_state: full_page,
                    ..Page::default()
                };
                page_block as usize
            ],
            free_page_num: page_block,
            invalid_page_num: 0,
            last_write_page: -1,
            erase_count: 0,
            cached_pages_num: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Plane {
    pub blocks: Vec<Block>,
    pub active_block: u32,
    /// Free pages aggregated over the plane's blocks.
    pub free_page: u32,
    /// Blocks known fully invalid, eligible for direct erase (FIFO).
    pub erase_queue: std::collections::VecDeque<u32>,
    pub token: u32,
}

#[derive(Debug, Clone)]
pub struct Die {
    pub planes: Vec<Plane>,
    pub token: u32,
}

/// Timing state shared by channels and chips.
///
/// A resource is available when it is idle now, or will be idle at a predicted
/// time that has already passed.
#[derive(Debug, Clone)]
pub struct Resource<S: ResourceState> {
    pub current_state: S,
    pub current_time: i64,
    pub next_state: S,
    pub next_state_predict_time: i64,
}

pub trait ResourceState: Copy + PartialEq {
    fn idle() -> Self;
    fn is_idle(self) -> bool {
        self == Self::idle()
    }
}

impl<S: ResourceState> Resource<S> {
    fn new() -> Self {
        Self {
            current_state: S::idle(),
            current_time: 0,
            next_state: S::idle(),
            next_state_predict_time: 0,
        }
    }

    pub fn available(&self, now: i64) -> bool {
        self.current_state.is_idle()
            || (self.next_state.is_idle() && self.next_state_predict_time <= now)
    }

    /// Occupy the resource from `now` until `until`, after which it returns to
    /// `next`.
    pub fn occupy(&mut self, now: i64, state: S, next: S, until: i64) {
        debug_assert!(until >= now);
        self.current_state = state;
        self.current_time = now;
        self.next_state = next;
        self.next_state_predict_time = until;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    /// Command/address cycles on the bus.
    CmdAddrTransfer,
    /// Data cycles on the bus.
    DataTransfer,
    /// Generic transfer (erase command dispatch).
    Transfer,
    /// Bus held by an uninterruptible GC round.
    Gc,
}

impl ResourceState for ChannelState {
    fn idle() -> Self {
        ChannelState::Idle
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipState {
    Idle,
    WriteBusy,
    ReadBusy,
    CopybackBusy,
    EraseBusy,
    /// Read data sits in the page register, ready for the bus.
    DataTransfer,
}

impl ResourceState for ChipState {
    fn idle() -> Self {
        ChipState::Idle
    }
}

impl ChipState {
    /// Chip states owned by the GC engine; a sub-request that finds its chip
    /// here has "met GC".
    pub fn is_gc_busy(self) -> bool {
        matches!(self, ChipState::CopybackBusy | ChipState::EraseBusy)
    }
}

#[derive(Debug, Clone)]
pub struct Chip {
    pub dies: Vec<Die>,
    pub state: Resource<ChipState>,
    pub token: u32,
    pub program_count: u64,
    pub read_count: u64,
    pub erase_count: u64,
}

#[derive(Debug)]
pub struct Channel {
    pub chips: Vec<Chip>,
    pub state: Resource<ChannelState>,
    pub token: u32,
    pub program_count: u64,
    pub read_count: u64,
    pub erase_count: u64,
}

/// Build the channel arena described by the parameters.
pub fn build_channels(params: &Params) -> Vec<Channel> {
    let full_page = !(u32::MAX << params.subpage_page);
    let plane = Plane {
        blocks: vec![Block::new(params.page_block, full_page); params.block_plane as usize],
        active_block: 0,
        free_page: params.page_block * params.block_plane,
        erase_queue: std::collections::VecDeque::new(),
        token: 0,
    };
    let die = Die {
        planes: vec![plane; params.plane_die as usize],
        token: 0,
    };
    let chip = Chip {
        dies: vec![die; params.die_chip as usize],
        state: Resource::new(),
        token: 0,
        program_count: 0,
        read_count: 0,
        erase_count: 0,
    };
    params
        .chip_channel
        .iter()
        .map(|&chips| Channel {
            chips: vec![chip.clone(); chips as usize],
            state: Resource::new(),
            token: 0,
            program_count: 0,
            read_count: 0,
            erase_count: 0,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_blocks_are_fully_free() {
        let params = Params {
            channel_number: 1,
            chip_channel: vec![1],
            die_chip: 1,
            plane_die: 1,
            block_plane: 2,
            page_block: 4,
            subpage_page: 4,
            ..Params::default()
        };
        let channels = build_channels(&params);
        let block = &channels[0].chips[0].dies[0].planes[0].blocks[0];
        assert_eq!(block.free_page_num, 4);
        assert_eq!(block.last_write_page, -1);
        for page in &block.pages {
            assert_eq!(page.free_state, 0b1111);
            assert_eq!(page.valid_state & page.free_state, 0);
        }
    }

    #[test]
    fn resource_availability_tracks_predicted_idle() {
        let mut res: Resource<ChipState> = Resource::new();
        assert!(res.available(0));
        res.occupy(0, ChipState::WriteBusy, ChipState::Idle, 200);
        assert!(!res.available(100));
        assert!(res.available(200));
    }
}
