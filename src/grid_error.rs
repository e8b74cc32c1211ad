//! GridError: unified error type for amr-grid public APIs.
//!
//! Argument errors are reported (or silently ignored, per operation);
//! distributed-consistency failures are fatal and abort the process after
//! logging, since a misbehaving rank must not hand out a partially valid
//! grid.

use thiserror::Error;

/// Unified error type for grid operations.
#[derive(Debug, Error)]
pub enum GridError {
    /// Attempted to construct a CellId with a zero value (reserved sentinel).
    #[error("CellId must be non-zero (0 is reserved as invalid/sentinel)")]
    InvalidCellId,
    /// A grid length of zero was given.
    #[error("grid lengths must be > 0, got ({0}, {1}, {2})")]
    ZeroGridLength(u64, u64, u64),
    /// The requested lengths and refinement level overflow the 64-bit id space.
    #[error("grid would have too many cells for a u64 id (lengths {lengths:?}, max level {max_level})")]
    GridTooLarge { lengths: [u64; 3], max_level: u8 },
    /// Maximum refinement level too large for the chosen lengths.
    #[error("maximum refinement level {requested} exceeds the largest possible level {possible}")]
    RefinementLevelTooLarge { requested: u8, possible: u8 },
    /// sfc_caching_batches must be at least one.
    #[error("sfc_caching_batches must be > 0")]
    ZeroSfcBatches,
    /// Bulk transfers need a payload with a fixed wire length.
    #[error("bulk transfer mode requires a fixed-size cell payload")]
    VariablePayloadInBulkMode,
    /// A per-cell exchange plan needed more message tags than fit in u16.
    #[error("per-cell transfer to peer {peer} would need {cells} tags, more than fit in u16")]
    TagOverflow { peer: usize, cells: usize },
    /// A payload failed to decode from its wire bytes.
    #[error("cell payload decode failed: expected {expected} bytes, got {got}")]
    PayloadSizeMismatch { expected: usize, got: usize },
    /// A transfer with a peer failed.
    #[error("communication with rank {neighbor} failed: {source}")]
    CommError {
        neighbor: usize,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// Hierarchical partitioning level out of range.
    #[error("no partitioning hierarchy level {0}")]
    NoSuchPartitioningLevel(usize),
    /// Per-level option lookup was attempted against the top-level table.
    #[error("option {0:?} is a top-level partitioning option; per-level lookup only consults that level's table")]
    CrossTablePartitioningOption(String),
    /// I/O failure while writing output.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Logs the formatted message at error level and aborts via panic.
///
/// Used for distributed-consistency failures: a neighbor lookup that finds
/// no cell where one must exist, a directory that diverged between ranks, or
/// a transport failure mid-collective. Recovery is impossible at that point.
#[macro_export]
macro_rules! invariant_violation {
    ($($arg:tt)*) => {{
        tracing::error!($($arg)*);
        panic!("invariant violation: {}", format_args!($($arg)*));
    }};
}
