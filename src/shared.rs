//! Process-wide handle over an [`InputCache`] with per-request slot leases.
//!
//! Acquisition runs slot selection and marks the slot in use under one
//! lock, so two requests can never be handed the same slot. The lock is
//! taken per call, never for the lifetime of a request; the slot's
//! `in_use` flag keeps other requests away in between.

use std::sync::Arc;

use log::debug;
use parking_lot::{Mutex, MutexGuard};

use crate::error::Result;
use crate::input::Input;
use crate::input_cache::InputCache;
use crate::kv_store::KvStore;

pub struct SharedInputCache<S> {
    inner: Arc<Mutex<InputCache<S>>>,
}

impl<S> Clone for SharedInputCache<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: KvStore> SharedInputCache<S> {
    pub fn new(cache: InputCache<S>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(cache)),
        }
    }

    /// Load a slot for `prompt`. Returns the lease and the inputs that
    /// still have to be processed.
    pub fn acquire(&self, prompt: &[Input], cache_prompt: bool) -> Result<(SlotLease<S>, Vec<Input>)> {
        let loaded = self.inner.lock().load_cache_slot(prompt, cache_prompt)?;
        let lease = SlotLease {
            cache: Arc::clone(&self.inner),
            slot_id: loaded.slot_id,
            num_past: loaded.num_past,
            released: false,
        };
        Ok((lease, loaded.remaining))
    }

    pub fn lock(&self) -> MutexGuard<'_, InputCache<S>> {
        self.inner.lock()
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut InputCache<S>) -> R) -> R {
        f(&mut self.inner.lock())
    }
}

/// Exclusive hold on one slot. Dropping it releases the slot.
pub struct SlotLease<S: KvStore> {
    cache: Arc<Mutex<InputCache<S>>>,
    slot_id: usize,
    num_past: usize,
    released: bool,
}

impl<S: KvStore> SlotLease<S> {
    pub fn slot_id(&self) -> usize {
        self.slot_id
    }

    /// Prompt positions that were already resident when the slot was loaded.
    pub fn num_past(&self) -> usize {
        self.num_past
    }

    pub fn resident_len(&self) -> usize {
        self.cache
            .lock()
            .slot(self.slot_id)
            .map_or(0, |slot| slot.inputs.len())
    }

    pub fn shift(&self, num_keep: usize) -> Result<()> {
        self.cache.lock().shift_cache_slot(self.slot_id, num_keep)
    }

    pub fn commit(&self, inputs: &[Input]) {
        self.cache.lock().commit_inputs(self.slot_id, inputs);
    }

    /// Run `f` with the cache locked and this lease's slot id.
    pub fn with_cache<R>(&self, f: impl FnOnce(&mut InputCache<S>, usize) -> R) -> R {
        f(&mut self.cache.lock(), self.slot_id)
    }

    pub fn release(mut self) {
        self.release_slot();
    }

    fn release_slot(&mut self) {
        if !self.released {
            self.released = true;
            self.cache.lock().release_cache_slot(self.slot_id);
            debug!("released cache slot {}", self.slot_id);
        }
    }
}

impl<S: KvStore> Drop for SlotLease<S> {
    fn drop(&mut self) {
        self.release_slot();
    }
}
