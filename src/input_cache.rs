//! Input cache: maps generation sequences onto a fixed pool of KV cache slots.
//!
//! Each slot owns one sequence id in the [`KvStore`] (the slot id) and a
//! record of the inputs whose state currently lives there. A new request
//! reuses the longest resident prefix it can find, forking it into a free
//! slot when reusing in place would destroy another sequence's tail.

use std::time::Instant;

use log::{debug, info, warn};

use crate::config::Config;
use crate::error::{CacheError, Result};
use crate::input::{Input, count_common_prefix};
use crate::kv_store::KvStore;

#[derive(Clone, Debug)]
pub struct InputCacheSlot {
    /// Index in the pool and sequence id in the store.
    pub id: usize,
    /// Inputs whose state is resident in the store, in position order.
    pub inputs: Vec<Input>,
    pub in_use: bool,
    /// `None` until first use, which makes fresh slots the oldest.
    pub last_used: Option<Instant>,
}

impl InputCacheSlot {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            inputs: Vec::new(),
            in_use: false,
            last_used: None,
        }
    }
}

/// Outcome of slot selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotChoice {
    pub slot: usize,
    /// Leading prompt positions that can be reused.
    pub len: usize,
    /// Slot whose first `len` positions must be copied into `slot` first.
    pub fork_from: Option<usize>,
}

/// A slot marked in use for a request.
#[derive(Debug)]
pub struct LoadedSlot {
    pub slot_id: usize,
    /// Prompt positions already resident and skipped.
    pub num_past: usize,
    /// Prompt positions still to be processed.
    pub remaining: Vec<Input>,
}

/// Number of positions to discard after the first `num_keep` so that a
/// sequence of `input_len` fits a window of `num_ctx`.
///
/// Once the window is full, half of the discardable region goes at once
/// (at least one position), plus any overflow beyond the window.
pub fn shift_discard(num_ctx: usize, num_keep: usize, input_len: usize) -> usize {
    if input_len < num_ctx {
        return 0;
    }
    let overflow = input_len - num_ctx;
    let half = (num_ctx.saturating_sub(num_keep) / 2).max(1);
    overflow + half
}

pub struct InputCache<S> {
    /// Context window per slot.
    num_ctx: usize,
    multi_user_cache: bool,
    slots: Vec<InputCacheSlot>,
    store: S,
}

impl<S: KvStore> InputCache<S> {
    pub fn new(config: &Config, mut store: S, backend: &S::Backend) -> Result<Self> {
        config.validate()?;
        let dtype = config.dtype()?;
        store.init(backend, dtype, config.kv_size);

        let slots = (0..config.parallel).map(InputCacheSlot::new).collect();
        info!(
            "Input cache ready: slots={}, num_ctx={}, kv_size={}, dtype={}, multi_user={}",
            config.parallel,
            config.num_ctx(),
            config.kv_size,
            dtype,
            config.multi_user_cache
        );

        Ok(Self {
            num_ctx: config.num_ctx(),
            multi_user_cache: config.multi_user_cache,
            slots,
            store,
        })
    }

    /// Build a cache over pre-populated slots, bypassing store init.
    ///
    /// Fails with [`CacheError::InvalidConfig`] unless every slot id equals
    /// its index.
    pub fn from_slots(num_ctx: usize, slots: Vec<InputCacheSlot>, store: S) -> Result<Self> {
        if let Some((i, slot)) = slots.iter().enumerate().find(|(i, slot)| slot.id != *i) {
            return Err(CacheError::InvalidConfig(format!(
                "slot at index {i} has id {}",
                slot.id
            )));
        }
        Ok(Self {
            num_ctx,
            multi_user_cache: false,
            slots,
            store,
        })
    }

    pub fn with_multi_user_cache(mut self, enabled: bool) -> Self {
        self.multi_user_cache = enabled;
        self
    }

    pub fn num_ctx(&self) -> usize {
        self.num_ctx
    }

    pub fn slots(&self) -> &[InputCacheSlot] {
        &self.slots
    }

    pub fn slot(&self, id: usize) -> Option<&InputCacheSlot> {
        self.slots.get(id)
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn close(&mut self) {
        self.store.close();
    }

    /// Idle slot sharing the longest prefix with `prompt`, and that length.
    ///
    /// Reusing it may truncate whatever the slot holds past the match.
    pub fn find_longest_cache_slot(&self, prompt: &[Input]) -> Result<(usize, usize)> {
        let mut longest: Option<(usize, usize)> = None;
        for slot in self.slots.iter().filter(|s| !s.in_use) {
            let count = count_common_prefix(&slot.inputs, prompt);
            if longest.is_none_or(|(_, best)| count > best) {
                longest = Some((slot.id, count));
            }
        }
        longest.ok_or(CacheError::NoCandidateSlot)
    }

    /// Slot assignment that avoids destroying state another sequence may
    /// still want.
    ///
    /// Slots in use can be fork sources but are never returned as the slot.
    pub fn find_best_cache_slot(&self, prompt: &[Input]) -> Result<SlotChoice> {
        let mut longest: Option<(usize, usize)> = None;
        for slot in &self.slots {
            let count = count_common_prefix(&slot.inputs, prompt);
            if longest.is_none_or(|(_, best)| count > best) {
                longest = Some((slot.id, count));
            }
        }
        let Some((source, len)) = longest else {
            return Err(CacheError::NoCandidateSlot);
        };

        // The prompt extends everything the source holds: nothing to lose.
        let src = &self.slots[source];
        if !src.in_use && len == src.inputs.len() {
            return Ok(SlotChoice {
                slot: source,
                len,
                fork_from: None,
            });
        }

        let empty = self
            .slots
            .iter()
            .find(|s| !s.in_use && s.inputs.is_empty())
            .map(|s| s.id);
        let target = match empty {
            Some(id) => id,
            None => self
                .least_recently_used()
                .ok_or(CacheError::NoCandidateSlot)?,
        };

        if len == 0 {
            return Ok(SlotChoice {
                slot: target,
                len: 0,
                fork_from: None,
            });
        }

        if empty.is_none() && !src.in_use {
            return Ok(SlotChoice {
                slot: source,
                len,
                fork_from: None,
            });
        }

        Ok(SlotChoice {
            slot: target,
            len,
            fork_from: Some(source),
        })
    }

    fn least_recently_used(&self) -> Option<usize> {
        let mut oldest: Option<&InputCacheSlot> = None;
        for slot in self.slots.iter().filter(|s| !s.in_use) {
            if oldest.is_none_or(|o| slot.last_used < o.last_used) {
                oldest = Some(slot);
            }
        }
        oldest.map(|s| s.id)
    }

    /// Pick a slot for `prompt`, mark it in use and trim it to the reusable
    /// prefix.
    ///
    /// With `cache_prompt` false nothing is reused. When the whole prompt is
    /// resident the last input is still handed back so the caller has
    /// something to compute logits from.
    #[fastrace::trace]
    pub fn load_cache_slot(&mut self, prompt: &[Input], cache_prompt: bool) -> Result<LoadedSlot> {
        let choice = if self.multi_user_cache {
            self.find_best_cache_slot(prompt)?
        } else {
            let (slot, len) = self.find_longest_cache_slot(prompt)?;
            SlotChoice {
                slot,
                len,
                fork_from: None,
            }
        };

        let slot_id = choice.slot;
        let mut num_past = if cache_prompt { choice.len } else { 0 };

        let slot = &mut self.slots[slot_id];
        slot.in_use = true;
        slot.last_used = Some(Instant::now());
        let evicted = slot.inputs.len();

        match choice.fork_from {
            Some(src) if num_past > 0 => {
                debug!(
                    "forking cache slot: src={}, dst={}, inputs={}, total={}",
                    src,
                    slot_id,
                    num_past,
                    self.slots[src].inputs.len()
                );
                match self.store.copy_prefix(src, slot_id, num_past) {
                    Ok(()) => {
                        let prefix = self.slots[src].inputs[..num_past].to_vec();
                        self.slots[slot_id].inputs = prefix;
                    }
                    Err(e) => {
                        warn!("Fork into slot {slot_id} failed, processing prompt in full: {e}");
                        if let Err(e) = self.store.remove(slot_id, 0, None) {
                            warn!("Failed to clear slot {slot_id} after fork failure: {e}");
                        }
                        self.slots[slot_id].inputs.clear();
                        num_past = 0;
                    }
                }
            }
            _ if evicted > num_past => {
                debug!(
                    "evicting cache slot: id={}, inputs={}, keep={}",
                    slot_id, evicted, num_past
                );
            }
            _ => {}
        }

        if num_past > 0 && num_past == prompt.len() {
            num_past -= 1;
        }

        if let Err(e) = self.store.remove(slot_id, num_past, None) {
            // Some stores cannot erase partially; start the slot over.
            debug!("partial removal failed on slot {slot_id}, clearing it: {e}");
            if let Err(e) = self.store.remove(slot_id, 0, None) {
                self.slots[slot_id].inputs.clear();
                self.release_cache_slot(slot_id);
                return Err(e.into());
            }
            num_past = 0;
        }

        let slot = &mut self.slots[slot_id];
        slot.inputs.truncate(num_past);

        debug!(
            "loading cache slot: id={}, prompt={}, used={}, remaining={}",
            slot_id,
            prompt.len(),
            num_past,
            prompt.len() - num_past
        );

        Ok(LoadedSlot {
            slot_id,
            num_past,
            remaining: prompt[num_past..].to_vec(),
        })
    }

    /// Record inputs whose state has just been written to the store.
    ///
    /// Unknown slot ids are ignored.
    pub fn commit_inputs(&mut self, slot_id: usize, inputs: &[Input]) {
        let Some(slot) = self.slots.get_mut(slot_id) else {
            debug_assert!(false, "commit to unknown slot {slot_id}");
            return;
        };
        debug_assert!(slot.in_use, "commit to idle slot {slot_id}");
        slot.inputs.extend_from_slice(inputs);
    }

    /// Unknown slot ids are ignored.
    pub fn release_cache_slot(&mut self, slot_id: usize) {
        let Some(slot) = self.slots.get_mut(slot_id) else {
            debug_assert!(false, "release of unknown slot {slot_id}");
            return;
        };
        slot.in_use = false;
        slot.last_used = Some(Instant::now());
    }

    pub fn shift_discard(&self, input_len: usize, num_keep: usize) -> usize {
        shift_discard(self.num_ctx, num_keep, input_len)
    }

    /// Drop the oldest half of the history after `num_keep` so the slot fits
    /// its window again.
    ///
    /// If the store cannot remove the range, the slot is cleared and
    /// [`CacheError::ReprocessRequired`] carries the inputs to recompute.
    #[fastrace::trace]
    pub fn shift_cache_slot(&mut self, slot_id: usize, num_keep: usize) -> Result<()> {
        if num_keep >= self.num_ctx {
            return Err(CacheError::KeepExceedsContext {
                keep: num_keep,
                num_ctx: self.num_ctx,
            });
        }

        let slot = &mut self.slots[slot_id];
        let input_len = slot.inputs.len();
        let discard = shift_discard(self.num_ctx, num_keep, input_len);
        if discard == 0 {
            return Ok(());
        }

        debug!(
            "context limit hit - shifting: id={}, limit={}, input={}, keep={}, discard={}",
            slot_id, self.num_ctx, input_len, num_keep, discard
        );

        if let Err(e) = self.store.remove(slot_id, num_keep, Some(num_keep + discard)) {
            warn!("KV cache shift failed on slot {slot_id}, inputs need reprocessing: {e}");
            let mut inputs = Vec::with_capacity(input_len - discard);
            inputs.extend_from_slice(&slot.inputs[..num_keep]);
            inputs.extend_from_slice(&slot.inputs[num_keep + discard..]);

            slot.inputs.clear();
            // The store must be empty before anything is recomputed into it.
            if let Err(e) = self.store.remove(slot_id, 0, None) {
                warn!("Unable to reset kv cache for slot {slot_id} after shift failure: {e}");
                return Err(e.into());
            }
            return Err(CacheError::ReprocessRequired { slot_id, inputs });
        }

        slot.inputs.drain(num_keep..num_keep + discard);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::StoreError;
    use crate::input::tokens;
    use crate::kv_store::DType;

    /// Store that only records remove/copy calls and can be told to fail.
    #[derive(Default)]
    struct MockStore {
        fail_remove: bool,
        fail_partial_remove: bool,
        fail_copy: bool,
        removals: Vec<(usize, usize, Option<usize>)>,
        copies: Vec<(usize, usize, usize)>,
        closed: bool,
        init_capacity: usize,
    }

    impl KvStore for MockStore {
        type Backend = ();
        type Context = ();
        type Tensor = ();

        fn init(&mut self, _backend: &(), _dtype: DType, capacity: usize) {
            self.init_capacity = capacity;
        }
        fn close(&mut self) {
            self.closed = true;
        }
        fn set_layer(&mut self, _layer: usize) {}
        fn start_forward(&mut self, _ctx: &mut (), _positions: &[usize], _seqs: &[usize]) -> std::result::Result<(), StoreError> {
            Ok(())
        }
        fn get(&mut self, _ctx: &mut ()) -> ((), (), ()) {
            ((), (), ())
        }
        fn put(&mut self, _ctx: &mut (), _key: (), _value: ()) {}

        fn remove(&mut self, seq: usize, begin: usize, end: Option<usize>) -> std::result::Result<(), StoreError> {
            self.removals.push((seq, begin, end));
            if self.fail_remove || (self.fail_partial_remove && begin > 0) {
                return Err(StoreError::ShiftUnsupported {
                    seq,
                    begin,
                    end: end.unwrap_or(usize::MAX),
                });
            }
            Ok(())
        }

        fn copy_prefix(&mut self, src: usize, dst: usize, len: usize) -> std::result::Result<(), StoreError> {
            self.copies.push((src, dst, len));
            if self.fail_copy {
                return Err(StoreError::CapacityExhausted {
                    requested: len,
                    capacity: 0,
                });
            }
            Ok(())
        }
    }

    fn ago(secs: u64) -> Option<Instant> {
        Instant::now().checked_sub(Duration::from_secs(secs))
    }

    fn slot(id: usize, ids: &[i32], in_use: bool, last_used: Option<Instant>) -> InputCacheSlot {
        InputCacheSlot {
            id,
            inputs: tokens(ids),
            in_use,
            last_used,
        }
    }

    fn cache(slots: Vec<InputCacheSlot>) -> InputCache<MockStore> {
        InputCache::from_slots(2048, slots, MockStore::default()).unwrap()
    }

    #[test]
    fn test_find_cache_slot() {
        struct Case {
            name: &'static str,
            slots: Vec<InputCacheSlot>,
            prompt: Vec<Input>,
            longest: (usize, usize),
            best: (usize, usize),
        }

        let cases = vec![
            Case {
                name: "empty",
                slots: vec![slot(0, &[], false, None), slot(1, &[], false, None)],
                prompt: tokens(&[1]),
                longest: (0, 0),
                best: (0, 0),
            },
            Case {
                name: "extend",
                slots: vec![slot(0, &[1], false, ago(1)), slot(1, &[1, 2], false, ago(2))],
                prompt: tokens(&[1, 2]),
                longest: (1, 2),
                best: (1, 2),
            },
            Case {
                name: "new",
                slots: vec![slot(0, &[1, 2], false, ago(1)), slot(1, &[], false, None)],
                prompt: tokens(&[2]),
                longest: (0, 0),
                best: (1, 0),
            },
            Case {
                name: "fork",
                slots: vec![slot(0, &[1, 2], false, ago(1)), slot(1, &[], false, None)],
                prompt: tokens(&[1]),
                longest: (0, 1),
                best: (1, 1),
            },
            Case {
                name: "evict",
                slots: vec![slot(0, &[1], false, ago(1)), slot(1, &[1, 2], false, ago(2))],
                prompt: tokens(&[2, 3]),
                longest: (0, 0),
                best: (1, 0),
            },
            Case {
                name: "in use",
                slots: vec![slot(0, &[1, 2], true, ago(1)), slot(1, &[1], false, ago(2))],
                prompt: tokens(&[1, 2]),
                longest: (1, 1),
                best: (1, 2),
            },
        ];

        for case in cases {
            let c = cache(case.slots);

            let longest = c.find_longest_cache_slot(&case.prompt).unwrap();
            assert_eq!(longest, case.longest, "longest: {}", case.name);

            let best = c.find_best_cache_slot(&case.prompt).unwrap();
            assert_eq!((best.slot, best.len), case.best, "best: {}", case.name);
        }
    }

    #[test]
    fn test_best_fork_reports_source() {
        let c = cache(vec![slot(0, &[1, 2], false, ago(1)), slot(1, &[], false, None)]);
        let choice = c.find_best_cache_slot(&tokens(&[1])).unwrap();
        assert_eq!(choice.fork_from, Some(0));

        // In-use slots are valid sources, never targets.
        let c = cache(vec![slot(0, &[1, 2], true, ago(1)), slot(1, &[1], false, ago(2))]);
        let choice = c.find_best_cache_slot(&tokens(&[1, 2])).unwrap();
        assert_eq!(choice, SlotChoice { slot: 1, len: 2, fork_from: Some(0) });
    }

    #[test]
    fn test_best_reuses_match_when_no_slot_is_empty() {
        // Slot 1 is older, but evicting it would throw away state for nothing.
        let c = cache(vec![slot(0, &[1, 2, 3], false, ago(1)), slot(1, &[7, 8], false, ago(5))]);
        let choice = c.find_best_cache_slot(&tokens(&[1, 2, 9])).unwrap();
        assert_eq!(choice, SlotChoice { slot: 0, len: 2, fork_from: None });
    }

    #[test]
    fn test_best_prefers_empty_slot_over_lru() {
        // Slot 2 was cleared recently; it is still a cheaper victim than slot 1.
        let c = cache(vec![
            slot(0, &[1, 2, 3], false, ago(1)),
            slot(1, &[7, 8], false, ago(9)),
            slot(2, &[], false, ago(0)),
        ]);
        let choice = c.find_best_cache_slot(&tokens(&[1, 2, 9])).unwrap();
        assert_eq!(choice, SlotChoice { slot: 2, len: 2, fork_from: Some(0) });
    }

    #[test]
    fn test_lru_tie_breaks_on_lowest_index() {
        let t = ago(3);
        let c = cache(vec![slot(0, &[5], false, t), slot(1, &[6], false, t)]);
        let choice = c.find_best_cache_slot(&tokens(&[9])).unwrap();
        assert_eq!(choice.slot, 0);
    }

    #[test]
    fn test_no_candidate_when_all_in_use() {
        let c = cache(vec![slot(0, &[1], true, ago(1)), slot(1, &[], true, None)]);
        assert!(matches!(
            c.find_longest_cache_slot(&tokens(&[1])),
            Err(CacheError::NoCandidateSlot)
        ));
        assert!(matches!(
            c.find_best_cache_slot(&tokens(&[1])),
            Err(CacheError::NoCandidateSlot)
        ));

        let c = cache(vec![]);
        assert!(matches!(
            c.find_longest_cache_slot(&tokens(&[1])),
            Err(CacheError::NoCandidateSlot)
        ));
        assert!(matches!(
            c.find_best_cache_slot(&tokens(&[1])),
            Err(CacheError::NoCandidateSlot)
        ));
    }

    #[test]
    fn test_selection_is_idempotent() {
        let c = cache(vec![
            slot(0, &[1, 2, 3], false, ago(2)),
            slot(1, &[1, 2], true, ago(1)),
            slot(2, &[], false, None),
        ]);
        let prompt = tokens(&[1, 2, 4]);
        assert_eq!(c.find_best_cache_slot(&prompt).unwrap(), c.find_best_cache_slot(&prompt).unwrap());
        assert_eq!(
            c.find_longest_cache_slot(&prompt).unwrap(),
            c.find_longest_cache_slot(&prompt).unwrap()
        );
    }

    #[test]
    fn test_shift_discard() {
        let cases = [
            ("shift", 2048, 5, 2048, 1021),
            ("max keep", 2048, 2047, 2048, 1),
            ("no keep", 2048, 0, 2048, 1024),
            ("truncate", 2048, 5, 5000, 3973),
            ("truncate keep", 2048, 2047, 5000, 2953),
            ("no op", 2048, 5, 512, 0),
            ("just below", 2048, 5, 2047, 0),
        ];

        for (name, num_ctx, num_keep, input_len, expected) in cases {
            let c = InputCache::from_slots(num_ctx, vec![], MockStore::default()).unwrap();
            assert_eq!(c.shift_discard(input_len, num_keep), expected, "case {name}");
        }
    }

    #[test]
    fn test_shift_cache_slot() {
        let inputs = tokens(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        let slots = |inputs: &[Input]| {
            let mut slots: Vec<InputCacheSlot> = (0..4).map(InputCacheSlot::new).collect();
            slots[3].inputs = inputs.to_vec();
            slots[3].in_use = true;
            slots
        };

        let mut c = InputCache::from_slots(10, slots(&inputs), MockStore::default()).unwrap();
        c.shift_cache_slot(3, 2).unwrap();
        assert_eq!(c.slot(3).unwrap().inputs, tokens(&[1, 2, 7, 8, 9, 10]));
        assert_eq!(c.store().removals, vec![(3, 2, Some(6))]);

        // Range removal fails, resetting the whole sequence works.
        let store = MockStore {
            fail_partial_remove: true,
            ..Default::default()
        };
        let mut c = InputCache::from_slots(10, slots(&inputs), store).unwrap();
        match c.shift_cache_slot(3, 2) {
            Err(CacheError::ReprocessRequired { slot_id, inputs }) => {
                assert_eq!(slot_id, 3);
                assert_eq!(inputs, tokens(&[1, 2, 7, 8, 9, 10]));
            }
            other => panic!("expected ReprocessRequired, got {other:?}"),
        }
        assert!(c.slot(3).unwrap().inputs.is_empty());
        assert_eq!(c.store().removals, vec![(3, 2, Some(6)), (3, 0, None)]);
    }

    #[test]
    fn test_shift_reset_failure_is_fatal() {
        let mut slots: Vec<InputCacheSlot> = (0..4).map(InputCacheSlot::new).collect();
        slots[3].inputs = tokens(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        slots[3].in_use = true;
        let store = MockStore {
            fail_remove: true,
            ..Default::default()
        };
        let mut c = InputCache::from_slots(10, slots, store).unwrap();

        assert!(matches!(
            c.shift_cache_slot(3, 2),
            Err(CacheError::StoreOperationFailed(StoreError::ShiftUnsupported { seq: 3, begin: 0, .. }))
        ));
        assert!(c.slot(3).unwrap().inputs.is_empty());
        assert_eq!(c.store().removals, vec![(3, 2, Some(6)), (3, 0, None)]);
    }

    #[test]
    fn test_from_slots_rejects_misnumbered_slots() {
        let slots = vec![InputCacheSlot::new(0), InputCacheSlot::new(2)];
        let err = InputCache::from_slots(10, slots, MockStore::default()).err();
        assert!(matches!(err, Some(CacheError::InvalidConfig(_))));
    }

    #[test]
    fn test_shift_below_window_is_noop() {
        let mut slots = vec![InputCacheSlot::new(0)];
        slots[0].inputs = tokens(&[1, 2, 3]);
        let mut c = InputCache::from_slots(10, slots, MockStore::default()).unwrap();
        c.shift_cache_slot(0, 1).unwrap();
        assert_eq!(c.slot(0).unwrap().inputs.len(), 3);
        assert!(c.store().removals.is_empty());
    }

    #[test]
    fn test_shift_keep_exceeds_context() {
        let mut c = InputCache::from_slots(10, vec![InputCacheSlot::new(0)], MockStore::default()).unwrap();
        assert!(matches!(
            c.shift_cache_slot(0, 10),
            Err(CacheError::KeepExceedsContext { keep: 10, num_ctx: 10 })
        ));
    }

    #[test]
    fn test_load_leaves_one_input_to_sample() {
        let mut c = cache(vec![slot(0, &[1, 2, 3], false, ago(1))]);
        let loaded = c.load_cache_slot(&tokens(&[1, 2, 3]), true).unwrap();

        assert_eq!(loaded.slot_id, 0);
        assert_eq!(loaded.num_past, 2);
        assert_eq!(loaded.remaining, tokens(&[3]));
        let s = c.slot(0).unwrap();
        assert!(s.in_use);
        assert_eq!(s.inputs, tokens(&[1, 2]));
        assert_eq!(c.store().removals, vec![(0, 2, None)]);
    }

    #[test]
    fn test_load_without_prompt_cache() {
        let mut c = cache(vec![slot(0, &[1, 2, 3], false, ago(1))]);
        let loaded = c.load_cache_slot(&tokens(&[1, 2, 4]), false).unwrap();

        assert_eq!(loaded.num_past, 0);
        assert_eq!(loaded.remaining, tokens(&[1, 2, 4]));
        assert!(c.slot(0).unwrap().inputs.is_empty());
        assert_eq!(c.store().removals, vec![(0, 0, None)]);
    }

    #[test]
    fn test_load_applies_fork() {
        let mut c = cache(vec![slot(0, &[1, 2, 3], false, ago(1)), slot(1, &[], false, None)])
            .with_multi_user_cache(true);
        let loaded = c.load_cache_slot(&tokens(&[1, 2, 5]), true).unwrap();

        assert_eq!(loaded.slot_id, 1);
        assert_eq!(loaded.num_past, 2);
        assert_eq!(loaded.remaining, tokens(&[5]));
        assert_eq!(c.store().copies, vec![(0, 1, 2)]);
        assert_eq!(c.slot(1).unwrap().inputs, tokens(&[1, 2]));
        // The source keeps its tail.
        assert_eq!(c.slot(0).unwrap().inputs, tokens(&[1, 2, 3]));
        assert!(!c.slot(0).unwrap().in_use);
    }

    #[test]
    fn test_load_fork_failure_falls_back_to_full_prompt() {
        let store = MockStore {
            fail_copy: true,
            ..Default::default()
        };
        let slots = vec![slot(0, &[1, 2, 3], false, ago(1)), slot(1, &[], false, None)];
        let mut c = InputCache::from_slots(2048, slots, store).unwrap().with_multi_user_cache(true);
        let loaded = c.load_cache_slot(&tokens(&[1, 2, 5]), true).unwrap();

        assert_eq!(loaded.slot_id, 1);
        assert_eq!(loaded.num_past, 0);
        assert_eq!(loaded.remaining.len(), 3);
        assert!(c.slot(1).unwrap().inputs.is_empty());
    }

    #[test]
    fn test_load_partial_removal_fallback() {
        let store = MockStore {
            fail_partial_remove: true,
            ..Default::default()
        };
        let mut c = InputCache::from_slots(2048, vec![slot(0, &[1, 2, 3], false, ago(1))], store).unwrap();
        let loaded = c.load_cache_slot(&tokens(&[1, 2, 9]), true).unwrap();

        assert_eq!(loaded.num_past, 0);
        assert_eq!(loaded.remaining, tokens(&[1, 2, 9]));
        assert!(c.slot(0).unwrap().inputs.is_empty());
        assert_eq!(c.store().removals, vec![(0, 2, None), (0, 0, None)]);
    }

    #[test]
    fn test_load_store_failure_releases_slot() {
        let store = MockStore {
            fail_remove: true,
            ..Default::default()
        };
        let mut c = InputCache::from_slots(2048, vec![slot(0, &[1, 2, 3], false, ago(1))], store).unwrap();
        let err = c.load_cache_slot(&tokens(&[1, 2, 9]), true).unwrap_err();

        assert!(matches!(err, CacheError::StoreOperationFailed(_)));
        let s = c.slot(0).unwrap();
        assert!(!s.in_use);
        assert!(s.inputs.is_empty());
    }

    #[test]
    fn test_commit_and_release() {
        let mut c = cache(vec![slot(0, &[], false, None), slot(1, &[], false, None)]);
        let loaded = c.load_cache_slot(&tokens(&[4, 5]), true).unwrap();
        assert_eq!(loaded.slot_id, 0);
        c.commit_inputs(0, &loaded.remaining);

        // Slot 0 is held, so a second request lands elsewhere.
        let other = c.load_cache_slot(&tokens(&[4, 5, 6]), true).unwrap();
        assert_eq!(other.slot_id, 1);
        assert_eq!(other.num_past, 0);

        c.release_cache_slot(0);
        let s = c.slot(0).unwrap();
        assert!(!s.in_use);
        assert!(s.last_used.is_some());
        assert_eq!(c.find_longest_cache_slot(&tokens(&[4, 5, 6])).unwrap(), (0, 2));
    }

    #[test]
    fn test_new_initializes_store() {
        let mut config = Config::new(4096, 4);
        config.multi_user_cache = true;
        let mut c = InputCache::new(&config, MockStore::default(), &()).unwrap();

        assert_eq!(c.num_ctx(), 1024);
        assert_eq!(c.slots().len(), 4);
        assert!(c.slots().iter().enumerate().all(|(i, s)| s.id == i && s.inputs.is_empty()));
        assert_eq!(c.store().init_capacity, 4096);

        c.close();
        assert!(c.store().closed);

        let err = InputCache::new(&Config::new(2, 4), MockStore::default(), &()).err();
        assert!(matches!(err, Some(CacheError::InvalidConfig(_))));
    }
}
