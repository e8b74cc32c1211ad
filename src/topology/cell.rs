//! `CellId`: a strong, zero-cost handle for grid cells.
//!
//! Every cell of the grid, at any refinement level, is identified by a
//! unique positive integer. `CellId` wraps a `NonZeroU64` so that 0 stays
//! reserved as the "no cell" sentinel at the type level: wherever the wire
//! or the neighbor lists carry a possibly-absent cell, the in-memory form
//! is `Option<CellId>`, which has the same layout as a plain `u64`.

use crate::grid_error::GridError;
use std::{convert::TryFrom, fmt, num::NonZeroU64};

/// Identifier of one cell at some refinement level.
///
/// # Memory layout
/// `repr(transparent)` over `NonZeroU64`: a `CellId` (and an
/// `Option<CellId>`) can be reinterpreted as a `u64` for wire buffers.
#[derive(
    Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct CellId(NonZeroU64);

impl CellId {
    /// Creates a new `CellId` from a raw `u64` value.
    ///
    /// Returns an error if `raw == 0`; 0 is reserved as the sentinel for a
    /// non-existing cell.
    #[inline]
    pub fn new(raw: u64) -> Result<Self, GridError> {
        NonZeroU64::new(raw)
            .map(CellId)
            .ok_or(GridError::InvalidCellId)
    }

    /// Returns the underlying `u64` value.
    #[inline]
    pub fn get(&self) -> u64 {
        self.0.get()
    }

    /// # Safety
    /// Caller must ensure `raw != 0`.
    #[inline]
    pub unsafe fn new_unchecked(raw: u64) -> Self {
        // SAFETY: caller guarantees raw != 0
        CellId(unsafe { NonZeroU64::new_unchecked(raw) })
    }

    /// Decodes the 0-as-sentinel wire form.
    #[inline]
    pub fn from_wire(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(CellId)
    }

    /// Encodes `Option<CellId>` into the 0-as-sentinel wire form.
    #[inline]
    pub fn to_wire(cell: Option<Self>) -> u64 {
        cell.map_or(0, |c| c.get())
    }
}

impl TryFrom<u64> for CellId {
    type Error = GridError;
    #[inline]
    fn try_from(raw: u64) -> Result<Self, GridError> {
        CellId::new(raw)
    }
}

impl From<CellId> for u64 {
    #[inline]
    fn from(c: CellId) -> Self {
        c.get()
    }
}

impl From<NonZeroU64> for CellId {
    #[inline]
    fn from(nz: NonZeroU64) -> Self {
        CellId(nz)
    }
}

impl fmt::Debug for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CellId").field(&self.get()).finish()
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get())
    }
}
