//! Replay negative cache: a per-entity table of the most recently
//! discovered hard negative, with a one-way WARMUP → READY transition.
//!
//! During warm-up the joint loss uses in-batch negatives while the
//! cache fills. Each update recounts the entries still at the unknown
//! sentinel; when that count stops changing between two consecutive
//! updates the cache becomes ready and starts sourcing negatives for
//! the joint loss. Readiness is monotonic: further updates keep
//! refreshing the stored negatives but never revert the flag.

use std::collections::HashSet;

use crate::error::{AlignError, AlignResult};
use crate::types::{ReplayState, TrainBatch};

/// Sentinel for "no negative known yet".
pub const NO_NEGATIVE: i64 = -1;

/// One cache row: the entity's own id and its currently-known hardest
/// negative.
#[derive(Debug, Clone, Copy)]
struct ReplaySlot {
    entity: u32,
    negative: i64,
}

/// Fixed-size hard-negative table, sized once at construction to the
/// model's total entity count and never resized. All mutation goes
/// through [`ReplayCache::update`].
#[derive(Debug)]
pub struct ReplayCache {
    slots: Vec<ReplaySlot>,
    last_pending: Option<usize>,
    ready: bool,
}

impl ReplayCache {
    pub fn new(num_entities: usize) -> Self {
        let slots = (0..num_entities)
            .map(|i| ReplaySlot {
                entity: i as u32,
                negative: NO_NEGATIVE,
            })
            .collect();
        Self {
            slots,
            last_pending: None,
            ready: false,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    fn pending_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.negative == NO_NEGATIVE)
            .count()
    }

    pub fn state(&self) -> ReplayState {
        ReplayState {
            pending_count: self.pending_count(),
            ready: self.ready,
        }
    }

    /// The stored negative for one entity, if any is known.
    pub fn negative_of(&self, entity: u32) -> AlignResult<Option<u32>> {
        let slot = self
            .slots
            .get(entity as usize)
            .ok_or(AlignError::IndexOutOfRange {
                entity,
                capacity: self.slots.len(),
            })?;
        debug_assert_eq!(slot.entity, entity);
        if slot.negative == NO_NEGATIVE {
            Ok(None)
        } else {
            Ok(Some(slot.negative as u32))
        }
    }

    /// Collect the stored negatives for a set of anchors, dropping the
    /// sentinel, anything appearing in the exclusion set (the current
    /// batch's own entities) and duplicates.
    pub fn negatives_for(
        &self,
        anchors: &[u32],
        exclude: &HashSet<u32>,
    ) -> AlignResult<Vec<u32>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for &anchor in anchors {
            if let Some(neg) = self.negative_of(anchor)? {
                if !exclude.contains(&neg) && seen.insert(neg) {
                    out.push(neg);
                }
            }
        }
        Ok(out)
    }

    /// Overwrite the negative column for every anchor in the batch
    /// (left side first, then right, matching `TrainBatch::all_ids`)
    /// and advance the readiness state machine.
    ///
    /// An empty batch is skipped outright: with no anchors there is no
    /// new information, and a no-op must not fake the "pending count
    /// unchanged" readiness condition.
    pub fn update(
        &mut self,
        batch: &TrainBatch,
        hard_left: &[i64],
        hard_right: &[i64],
    ) -> AlignResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        if hard_left.len() != batch.len() || hard_right.len() != batch.len() {
            return Err(AlignError::ShapeMismatch {
                context: "replay cache update".to_string(),
                expected: batch.len(),
                actual: hard_left.len().min(hard_right.len()),
            });
        }

        let anchors = batch.all_ids();
        let values = hard_left.iter().chain(hard_right.iter());
        for (&anchor, &value) in anchors.iter().zip(values) {
            let capacity = self.slots.len();
            let slot = self
                .slots
                .get_mut(anchor as usize)
                .ok_or(AlignError::IndexOutOfRange {
                    entity: anchor,
                    capacity,
                })?;
            slot.negative = value;
        }

        if !self.ready {
            let pending = self.pending_count();
            if self.last_pending == Some(pending) {
                self.ready = true;
                tracing::info!(pending, "replay cache ready, switching to replayed negatives");
            } else {
                self.last_pending = Some(pending);
            }
        }
        Ok(())
    }
}
