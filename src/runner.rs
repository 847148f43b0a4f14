//! Serving loop glue: drives one request through the input cache and the
//! KV store.
//!
//! Per request: acquire a slot, skip the resident prefix, process the rest
//! in batches that fit the window (shifting when it is full), sample, and
//! feed each sampled token back in until `max_tokens`.

use std::sync::Arc;

use fastrace::local::LocalSpan;
use log::debug;

use crate::error::{CacheError, Result};
use crate::host_store::{HostBackend, HostKvStore, HostTensor};
use crate::input::Input;
use crate::kv_store::KvStore;
use crate::shared::{SharedInputCache, SlotLease};

type StoreContext<M> = <<M as Model>::Store as KvStore>::Context;
type StoreTensor<M> = <<M as Model>::Store as KvStore>::Tensor;

/// Compute side of a forward pass.
pub trait Model: Send + Sync + Sized {
    type Store: KvStore;

    fn num_layers(&self) -> usize;

    /// Keys and values for `inputs` at `layer`, one row per input.
    fn forward(
        &self,
        ctx: &mut StoreContext<Self>,
        layer: usize,
        inputs: &[Input],
    ) -> (StoreTensor<Self>, StoreTensor<Self>);

    /// Next token from the last layer's cached window.
    fn sample(&self, keys: &StoreTensor<Self>, values: &StoreTensor<Self>, mask: &StoreTensor<Self>) -> i32;
}

#[derive(Clone, Debug)]
pub struct GenerateRequest {
    pub prompt: Vec<Input>,
    pub max_tokens: usize,
    pub cache_prompt: bool,
}

#[derive(Clone, Debug, Default)]
pub struct Generation {
    pub slot_id: usize,
    pub tokens: Vec<i32>,
    /// Prompt positions served from the cache.
    pub num_past: usize,
    /// Inputs run through the model, reprocessing included.
    pub processed: usize,
    pub shifts: usize,
    /// Inputs recomputed after a failed shift.
    pub reprocessed: usize,
}

pub struct Runner<M: Model> {
    cache: SharedInputCache<M::Store>,
    model: Arc<M>,
    batch_size: usize,
    num_keep: usize,
}

impl<M: Model> Clone for Runner<M> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            model: Arc::clone(&self.model),
            batch_size: self.batch_size,
            num_keep: self.num_keep,
        }
    }
}

impl<M> Runner<M>
where
    M: Model,
    StoreContext<M>: Default,
{
    pub fn new(cache: SharedInputCache<M::Store>, model: M, batch_size: usize, num_keep: usize) -> Self {
        Self {
            cache,
            model: Arc::new(model),
            batch_size: batch_size.max(1),
            num_keep,
        }
    }

    pub fn cache(&self) -> &SharedInputCache<M::Store> {
        &self.cache
    }

    pub fn generate(&self, req: &GenerateRequest) -> Result<Generation> {
        let _span = LocalSpan::enter_with_local_parent("generate").with_properties(|| {
            [
                ("prompt_len", req.prompt.len().to_string()),
                ("max_tokens", req.max_tokens.to_string()),
            ]
        });

        let (lease, mut pending) = self.cache.acquire(&req.prompt, req.cache_prompt)?;
        let num_ctx = self.cache.lock().num_ctx();
        let mut out = Generation {
            slot_id: lease.slot_id(),
            num_past: lease.num_past(),
            ..Default::default()
        };

        while out.tokens.len() < req.max_tokens && !pending.is_empty() {
            let mut sampled = None;
            while !pending.is_empty() {
                let resident = lease.resident_len();
                if resident >= num_ctx {
                    match lease.shift(self.num_keep) {
                        Ok(()) => out.shifts += 1,
                        Err(CacheError::ReprocessRequired { slot_id, mut inputs }) => {
                            debug!("reprocessing {} inputs on slot {}", inputs.len(), slot_id);
                            out.reprocessed += inputs.len();
                            inputs.append(&mut pending);
                            pending = inputs;
                        }
                        Err(e) => return Err(e),
                    }
                    continue;
                }

                let n = pending.len().min(self.batch_size).min(num_ctx - resident);
                let batch: Vec<Input> = pending.drain(..n).collect();
                sampled = Some(self.forward_batch(&lease, &batch)?);
                out.processed += n;
            }

            if let Some(token) = sampled {
                out.tokens.push(token);
                pending.push(Input::Token(token));
            }
        }

        debug!(
            "generation done: slot={}, cached={}, processed={}, generated={}, shifts={}",
            out.slot_id,
            out.num_past,
            out.processed,
            out.tokens.len(),
            out.shifts
        );
        lease.release();
        Ok(out)
    }

    /// Write `batch` into the lease's slot and sample from the result.
    fn forward_batch(&self, lease: &SlotLease<M::Store>, batch: &[Input]) -> Result<i32> {
        let _span = LocalSpan::enter_with_local_parent("forward_batch")
            .with_property(|| ("batch", batch.len().to_string()));

        lease.with_cache(|cache, slot_id| -> Result<i32> {
            let start = cache.slot(slot_id).map_or(0, |slot| slot.inputs.len());
            let positions: Vec<usize> = (start..start + batch.len()).collect();
            let seqs = vec![slot_id; batch.len()];

            let mut ctx = StoreContext::<M>::default();
            let store = cache.store_mut();
            store.start_forward(&mut ctx, &positions, &seqs)?;

            let mut token = 0;
            let last = self.model.num_layers().saturating_sub(1);
            for layer in 0..self.model.num_layers() {
                store.set_layer(layer);
                let (key, value) = self.model.forward(&mut ctx, layer, batch);
                store.put(&mut ctx, key, value);
                if layer == last {
                    let (keys, values, mask) = store.get(&mut ctx);
                    token = self.model.sample(&keys, &values, &mask);
                }
            }

            cache.commit_inputs(slot_id, batch);
            Ok(token)
        })
    }
}

/// Deterministic stand-in for a transformer over [`HostKvStore`].
///
/// Projections depend only on the input and the layer, never on the
/// position, so a sequence rebuilt from the cache, a fork, a shift or a
/// full recompute holds exactly the same rows and samples the same tokens.
pub struct SyntheticModel {
    num_layers: usize,
    kv_dim: usize,
    vocab_size: usize,
}

impl SyntheticModel {
    pub fn new(num_layers: usize, kv_dim: usize, vocab_size: usize) -> Self {
        Self {
            num_layers: num_layers.max(1),
            kv_dim,
            vocab_size: vocab_size.max(1),
        }
    }

    pub fn backend(&self) -> HostBackend {
        HostBackend {
            num_layers: self.num_layers,
            kv_dim: self.kv_dim,
        }
    }

    fn project(&self, input: &Input, layer: usize, j: usize) -> f32 {
        match input {
            Input::Token(t) => {
                let h = (*t as i64) * 31 + (layer as i64) * 17 + (j as i64) * 7;
                h.rem_euclid(101) as f32 / 101.0
            }
            Input::Image(embedding) => {
                let values = embedding.values();
                let base = if values.is_empty() {
                    0.0
                } else {
                    values[j % values.len()]
                };
                base + layer as f32 * 0.01
            }
        }
    }
}

impl Model for SyntheticModel {
    type Store = HostKvStore;

    fn num_layers(&self) -> usize {
        self.num_layers
    }

    fn forward(
        &self,
        _ctx: &mut StoreContext<Self>,
        layer: usize,
        inputs: &[Input],
    ) -> (HostTensor, HostTensor) {
        let mut keys = Vec::with_capacity(inputs.len() * self.kv_dim);
        let mut values = Vec::with_capacity(inputs.len() * self.kv_dim);
        for input in inputs {
            for j in 0..self.kv_dim {
                keys.push(self.project(input, layer, j));
                values.push(self.project(input, layer, j + 1));
            }
        }
        (
            HostTensor::new(keys, inputs.len(), self.kv_dim),
            HostTensor::new(values, inputs.len(), self.kv_dim),
        )
    }

    fn sample(&self, keys: &HostTensor, values: &HostTensor, mask: &HostTensor) -> i32 {
        if mask.rows == 0 {
            return 0;
        }
        let visible = mask.row(mask.rows - 1);
        let mut acc = 0.0f32;
        for (c, &m) in visible.iter().enumerate() {
            if m == 0.0 {
                let dot: f32 = keys.row(c).iter().zip(values.row(c)).map(|(k, v)| k * v).sum();
                acc += dot;
            }
        }
        ((acc * 64.0).round() as i64).rem_euclid(self.vocab_size as i64) as i32
    }
}
