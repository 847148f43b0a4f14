//! Error types for the input cache and the tensor stores behind it.

use thiserror::Error;

use crate::input::Input;

/// Failures reported by a [`KvStore`](crate::kv_store::KvStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store cannot remove a range from the middle of a sequence.
    #[error("kv store cannot shift: removal of [{begin}, {end}) from sequence {seq} unsupported")]
    ShiftUnsupported { seq: usize, begin: usize, end: usize },

    #[error("kv store capacity exhausted: need {requested} cells, capacity {capacity}")]
    CapacityExhausted { requested: usize, capacity: usize },

    #[error("position {pos} for sequence {seq} is not the next append position ({expected})")]
    PositionOutOfOrder {
        seq: usize,
        pos: usize,
        expected: usize,
    },

    #[error("batch mismatch: {0}")]
    BatchMismatch(String),

    #[error("kv store used before init")]
    NotInitialized,
}

/// Errors surfaced by the input cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Every slot is held by a request. Back off or reject.
    #[error("no available cache slots")]
    NoCandidateSlot,

    /// A context shift could not be applied. The slot has been cleared and
    /// `inputs` must be recomputed from the beginning.
    #[error(
        "kv cache shift failed on slot {slot_id}, inputs need reprocessing (input count: {})",
        inputs.len()
    )]
    ReprocessRequired { slot_id: usize, inputs: Vec<Input> },

    /// A non-shift store call failed. Fatal for the in-flight request only.
    #[error("kv store operation failed: {0}")]
    StoreOperationFailed(#[from] StoreError),

    #[error("unable to shift context - keep exceeds context (keep: {keep} context: {num_ctx})")]
    KeepExceedsContext { keep: usize, num_ctx: usize },

    #[error("invalid cache config: {0}")]
    InvalidConfig(String),
}

/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;
