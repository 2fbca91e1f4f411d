//! Flash translation layer: logical-to-physical mapping, write allocation,
//! garbage collection, and device pre-conditioning.

pub mod alloc;
pub mod gc;
pub mod prep;

/// One mapping-table entry, indexed by logical page number.
///
/// `state` is the sub-page mask currently live for this lpn. Whenever
/// `state != 0`, the page at `pn` stores this lpn and its `valid_state`
/// equals `state`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MapEntry {
    pub pn: u32,
    pub state: u32,
}
