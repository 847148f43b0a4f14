//! Host-memory KV store.
//!
//! Keeps one key row and one value row per (sequence, layer, position).
//! Values are rounded through the configured [`DType`] on write so that a
//! host run sees the same precision loss a device cache would.

use std::collections::BTreeMap;

use half::{bf16, f16};
use log::debug;

use crate::error::StoreError;
use crate::kv_store::{DType, KvStore};

/// Shape of the model whose state is cached.
#[derive(Clone, Copy, Debug)]
pub struct HostBackend {
    pub num_layers: usize,
    /// num_kv_heads * head_dim
    pub kv_dim: usize,
}

/// 2D host tensor, row-major.
#[derive(Clone, Debug, PartialEq)]
pub struct HostTensor {
    pub data: Vec<f32>,
    pub rows: usize,
    pub cols: usize,
}

impl HostTensor {
    pub fn new(data: Vec<f32>, rows: usize, cols: usize) -> Self {
        assert_eq!(data.len(), rows * cols, "tensor data does not match {rows}x{cols}");
        Self { data, rows, cols }
    }

    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self::new(vec![0.0; rows * cols], rows, cols)
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }
}

/// Per-forward scratch state.
#[derive(Debug, Default)]
pub struct HostContext {
    /// Elements materialized by `get` during this context's lifetime.
    pub elements_fetched: usize,
}

#[derive(Clone)]
struct Cell {
    key: Vec<f32>,
    value: Vec<f32>,
}

pub struct HostKvStore {
    dtype: DType,
    capacity: usize,
    num_layers: usize,
    kv_dim: usize,
    shift_supported: bool,
    initialized: bool,
    layer: usize,
    // seq -> [layer] -> cells in position order
    sequences: BTreeMap<usize, Vec<Vec<Cell>>>,
    batch_positions: Vec<usize>,
    batch_seqs: Vec<usize>,
}

impl Default for HostKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl HostKvStore {
    pub fn new() -> Self {
        Self {
            dtype: DType::default(),
            capacity: 0,
            num_layers: 0,
            kv_dim: 0,
            shift_supported: true,
            initialized: false,
            layer: 0,
            sequences: BTreeMap::new(),
            batch_positions: Vec::new(),
            batch_seqs: Vec::new(),
        }
    }

    /// A store that can only drop whole tails of a sequence, like models
    /// whose cached state cannot be re-positioned after a middle removal.
    pub fn without_shift() -> Self {
        Self {
            shift_supported: false,
            ..Self::new()
        }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Resident positions of `seq`.
    pub fn seq_len(&self, seq: usize) -> usize {
        self.sequences
            .get(&seq)
            .and_then(|layers| layers.first())
            .map_or(0, Vec::len)
    }

    /// Resident positions across all sequences.
    pub fn used_cells(&self) -> usize {
        self.sequences.keys().map(|&seq| self.seq_len(seq)).sum()
    }

    /// Cached key row of `seq` at `pos` for `layer`.
    pub fn key_at(&self, seq: usize, layer: usize, pos: usize) -> Option<&[f32]> {
        self.sequences
            .get(&seq)?
            .get(layer)?
            .get(pos)
            .map(|cell| cell.key.as_slice())
    }

    fn round(&self, x: f32) -> f32 {
        match self.dtype {
            DType::F32 => x,
            DType::F16 => f16::from_f32(x).to_f32(),
            DType::BF16 => bf16::from_f32(x).to_f32(),
        }
    }

    fn round_row(&self, row: &[f32]) -> Vec<f32> {
        row.iter().map(|&x| self.round(x)).collect()
    }
}

impl KvStore for HostKvStore {
    type Backend = HostBackend;
    type Context = HostContext;
    type Tensor = HostTensor;

    fn init(&mut self, backend: &HostBackend, dtype: DType, capacity: usize) {
        self.dtype = dtype;
        self.capacity = capacity;
        self.num_layers = backend.num_layers;
        self.kv_dim = backend.kv_dim;
        self.sequences.clear();
        self.initialized = true;
        debug!(
            "host kv store initialized: layers={}, kv_dim={}, dtype={}, capacity={}",
            self.num_layers, self.kv_dim, dtype, capacity
        );
    }

    fn close(&mut self) {
        self.sequences.clear();
        self.batch_positions.clear();
        self.batch_seqs.clear();
        self.initialized = false;
    }

    fn set_layer(&mut self, layer: usize) {
        debug_assert!(layer < self.num_layers, "layer {layer} out of range");
        self.layer = layer;
    }

    fn start_forward(
        &mut self,
        _ctx: &mut HostContext,
        positions: &[usize],
        seqs: &[usize],
    ) -> Result<(), StoreError> {
        if !self.initialized {
            return Err(StoreError::NotInitialized);
        }
        if positions.len() != seqs.len() {
            return Err(StoreError::BatchMismatch(format!(
                "{} positions for {} sequence ids",
                positions.len(),
                seqs.len()
            )));
        }

        let requested = self.used_cells() + positions.len();
        if requested > self.capacity {
            return Err(StoreError::CapacityExhausted {
                requested,
                capacity: self.capacity,
            });
        }

        let mut next: BTreeMap<usize, usize> = BTreeMap::new();
        for (&pos, &seq) in positions.iter().zip(seqs) {
            let expected = next.entry(seq).or_insert_with(|| self.seq_len(seq));
            if pos != *expected {
                return Err(StoreError::PositionOutOfOrder {
                    seq,
                    pos,
                    expected: *expected,
                });
            }
            *expected += 1;
        }

        self.batch_positions = positions.to_vec();
        self.batch_seqs = seqs.to_vec();
        Ok(())
    }

    fn get(&mut self, ctx: &mut HostContext) -> (HostTensor, HostTensor, HostTensor) {
        let mut batch_order: Vec<usize> = Vec::new();
        for &seq in &self.batch_seqs {
            if !batch_order.contains(&seq) {
                batch_order.push(seq);
            }
        }

        // (seq, pos) of every visible cell, in key/value row order
        let mut cells: Vec<(usize, usize)> = Vec::new();
        let mut keys = Vec::new();
        let mut values = Vec::new();
        for seq in batch_order {
            let Some(layer_cells) = self.sequences.get(&seq).and_then(|l| l.get(self.layer)) else {
                continue;
            };
            for (pos, cell) in layer_cells.iter().enumerate() {
                cells.push((seq, pos));
                keys.extend_from_slice(&cell.key);
                values.extend_from_slice(&cell.value);
            }
        }

        let mut mask = Vec::with_capacity(self.batch_seqs.len() * cells.len());
        for (&seq, &pos) in self.batch_seqs.iter().zip(&self.batch_positions) {
            for &(cell_seq, cell_pos) in &cells {
                let visible = cell_seq == seq && cell_pos <= pos;
                mask.push(if visible { 0.0 } else { f32::NEG_INFINITY });
            }
        }

        let n = cells.len();
        let keys = HostTensor::new(keys, n, self.kv_dim);
        let values = HostTensor::new(values, n, self.kv_dim);
        let mask = HostTensor::new(mask, self.batch_seqs.len(), n);
        ctx.elements_fetched += keys.data.len() + values.data.len();
        (keys, values, mask)
    }

    fn put(&mut self, _ctx: &mut HostContext, key: HostTensor, value: HostTensor) {
        assert_eq!(key.rows, self.batch_seqs.len(), "key rows must match batch size");
        assert_eq!(value.rows, self.batch_seqs.len(), "value rows must match batch size");

        for i in 0..self.batch_seqs.len() {
            let seq = self.batch_seqs[i];
            let pos = self.batch_positions[i];
            let cell = Cell {
                key: self.round_row(key.row(i)),
                value: self.round_row(value.row(i)),
            };
            let num_layers = self.num_layers;
            let layers = self
                .sequences
                .entry(seq)
                .or_insert_with(|| (0..num_layers).map(|_| Vec::new()).collect());
            let cells = &mut layers[self.layer];
            if pos < cells.len() {
                cells[pos] = cell;
            } else {
                cells.push(cell);
            }
        }
    }

    fn remove(&mut self, seq: usize, begin: usize, end: Option<usize>) -> Result<(), StoreError> {
        if !self.initialized {
            return Err(StoreError::NotInitialized);
        }
        let len = self.seq_len(seq);
        let end = end.map_or(len, |e| e.min(len));
        if begin >= end {
            return Ok(());
        }
        if end < len && !self.shift_supported {
            return Err(StoreError::ShiftUnsupported { seq, begin, end });
        }

        if let Some(layers) = self.sequences.get_mut(&seq) {
            for cells in layers.iter_mut() {
                let stop = end.min(cells.len());
                if begin < stop {
                    cells.drain(begin..stop);
                }
            }
        }
        if self.seq_len(seq) == 0 {
            self.sequences.remove(&seq);
        }
        debug!("removed [{begin}, {end}) from sequence {seq}");
        Ok(())
    }

    fn copy_prefix(&mut self, src: usize, dst: usize, len: usize) -> Result<(), StoreError> {
        if !self.initialized {
            return Err(StoreError::NotInitialized);
        }
        if src == dst {
            return self.remove(dst, len, None);
        }

        let copied: Vec<Vec<Cell>> = match self.sequences.get(&src) {
            Some(layers) => layers
                .iter()
                .map(|cells| cells[..len.min(cells.len())].to_vec())
                .collect(),
            None => Vec::new(),
        };
        let copied_len = copied.first().map_or(0, Vec::len);

        let requested = self.used_cells() - self.seq_len(dst) + copied_len;
        if requested > self.capacity {
            return Err(StoreError::CapacityExhausted {
                requested,
                capacity: self.capacity,
            });
        }

        if copied_len == 0 {
            self.sequences.remove(&dst);
        } else {
            self.sequences.insert(dst, copied);
        }
        debug!("copied {copied_len} positions from sequence {src} to {dst}");
        Ok(())
    }
}
