//! Tensor store interface consumed by the input cache.

use std::fmt;

use crate::error::StoreError;

/// Element type of the cached key/value state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DType {
    F32,
    #[default]
    F16,
    BF16,
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::BF16 => "bf16",
        };
        f.write_str(name)
    }
}

/// Per-layer key/value storage addressed by sequence id.
///
/// The input cache uses one sequence id per slot (the slot id) and only
/// calls `remove` and `copy_prefix` directly; the remaining methods are
/// driven by the forward pass.
pub trait KvStore: Send {
    /// Whatever the store needs at init to size its buffers.
    type Backend;
    /// Scratch context for one forward pass.
    type Context;
    type Tensor;

    /// One-time setup. `capacity` is the total number of cached positions
    /// across all sequences.
    fn init(&mut self, backend: &Self::Backend, dtype: DType, capacity: usize);

    fn close(&mut self);

    fn set_layer(&mut self, layer: usize);

    /// Declare the positions and sequences the next batch will write.
    fn start_forward(
        &mut self,
        ctx: &mut Self::Context,
        positions: &[usize],
        seqs: &[usize],
    ) -> Result<(), StoreError>;

    /// Cached keys, values and attention mask for the current batch and layer.
    fn get(&mut self, ctx: &mut Self::Context) -> (Self::Tensor, Self::Tensor, Self::Tensor);

    /// Store freshly computed state for the current batch and layer.
    fn put(&mut self, ctx: &mut Self::Context, key: Self::Tensor, value: Self::Tensor);

    /// Delete positions `[begin, end)` of `seq`; `None` means through the end.
    fn remove(&mut self, seq: usize, begin: usize, end: Option<usize>) -> Result<(), StoreError>;

    /// Replace the contents of `dst` with the first `len` positions of `src`.
    fn copy_prefix(&mut self, src: usize, dst: usize, len: usize) -> Result<(), StoreError>;
}
