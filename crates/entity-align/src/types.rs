//! Core data types: modalities, alignment pairs, batches, loss terms
//! and the per-step diagnostics record.

use std::collections::BTreeMap;
use std::fmt;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::{map_candle, AlignResult};

/// One information channel describing an entity.
///
/// The variant order is the canonical positional order used by the
/// multi-loss balancer's weight vector; do not reorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    /// Graph structure (neighborhood aggregation output).
    Structure,
    /// Relation features.
    Relation,
    /// Attribute features.
    Attribute,
    /// Visual features; may be missing per entity.
    Image,
    /// Surface-name features.
    Name,
    /// Character-sequence features.
    Char,
}

impl Modality {
    /// All modalities in canonical positional order.
    pub const ALL: [Modality; 6] = [
        Modality::Structure,
        Modality::Relation,
        Modality::Attribute,
        Modality::Image,
        Modality::Name,
        Modality::Char,
    ];

    /// Number of modality slots.
    pub const COUNT: usize = 6;

    /// Positional index into the balancer weight vector.
    pub fn index(self) -> usize {
        match self {
            Modality::Structure => 0,
            Modality::Relation => 1,
            Modality::Attribute => 2,
            Modality::Image => 3,
            Modality::Name => 4,
            Modality::Char => 5,
        }
    }

    /// Stable lowercase name used in diagnostics keys.
    pub fn name(self) -> &'static str {
        match self {
            Modality::Structure => "structure",
            Modality::Relation => "relation",
            Modality::Attribute => "attribute",
            Modality::Image => "image",
            Modality::Name => "name",
            Modality::Char => "char",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An ordered pair asserting cross-graph equivalence between the
/// left-graph entity and the right-graph entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlignmentPair {
    /// Entity id in the left knowledge graph.
    pub left: u32,
    /// Entity id in the right knowledge graph.
    pub right: u32,
}

impl AlignmentPair {
    pub fn new(left: u32, right: u32) -> Self {
        Self { left, right }
    }
}

/// An ordered sequence of positive alignment pairs for one training
/// step. Duplicates are allowed; order is irrelevant for the loss but
/// relevant for index alignment within the batch.
#[derive(Debug, Clone, Default)]
pub struct TrainBatch {
    pairs: Vec<AlignmentPair>,
}

impl TrainBatch {
    pub fn new(pairs: Vec<AlignmentPair>) -> Self {
        Self { pairs }
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn pairs(&self) -> &[AlignmentPair] {
        &self.pairs
    }

    /// Left-graph entity ids, in batch order.
    pub fn left_ids(&self) -> Vec<u32> {
        self.pairs.iter().map(|p| p.left).collect()
    }

    /// Right-graph entity ids, in batch order.
    pub fn right_ids(&self) -> Vec<u32> {
        self.pairs.iter().map(|p| p.right).collect()
    }

    /// All entity ids referenced by the batch: left side first, then
    /// right side (the anchor order used for replay-cache updates).
    pub fn all_ids(&self) -> Vec<u32> {
        let mut ids = self.left_ids();
        ids.extend(self.right_ids());
        ids
    }

    /// Largest entity id referenced by the batch, if any.
    pub fn max_id(&self) -> Option<u32> {
        self.pairs
            .iter()
            .map(|p| p.left.max(p.right))
            .max()
    }
}

impl From<Vec<(u32, u32)>> for TrainBatch {
    fn from(pairs: Vec<(u32, u32)>) -> Self {
        Self::new(
            pairs
                .into_iter()
                .map(|(l, r)| AlignmentPair::new(l, r))
                .collect(),
        )
    }
}

/// A loss contribution that is either a scalar tensor or explicitly
/// absent. Downstream code must handle both cases exhaustively; there
/// is no nullable field anywhere in the loss plumbing.
#[derive(Debug, Clone)]
pub enum LossTerm {
    /// The term was computed; holds a 0-dim scalar tensor.
    Present(Tensor),
    /// The term does not apply (modality unavailable, gate disabled).
    Absent,
}

impl LossTerm {
    pub fn is_present(&self) -> bool {
        matches!(self, LossTerm::Present(_))
    }

    pub fn tensor(&self) -> Option<&Tensor> {
        match self {
            LossTerm::Present(t) => Some(t),
            LossTerm::Absent => None,
        }
    }

    /// Scalar value for diagnostics; `None` encodes absence.
    pub fn scalar(&self) -> AlignResult<Option<f32>> {
        match self {
            LossTerm::Present(t) => Ok(Some(t.to_scalar::<f32>().map_err(map_candle)?)),
            LossTerm::Absent => Ok(None),
        }
    }
}

/// Per-modality contrastive losses for one embedding view, in the
/// fixed canonical slot order.
#[derive(Debug, Clone)]
pub struct ModalityLossSet {
    terms: [LossTerm; Modality::COUNT],
}

impl ModalityLossSet {
    /// All slots absent.
    pub fn new() -> Self {
        Self {
            terms: std::array::from_fn(|_| LossTerm::Absent),
        }
    }

    pub fn set(&mut self, modality: Modality, loss: Tensor) {
        self.terms[modality.index()] = LossTerm::Present(loss);
    }

    pub fn get(&self, modality: Modality) -> &LossTerm {
        &self.terms[modality.index()]
    }

    /// Iterate the modalities whose loss was computed.
    pub fn active(&self) -> impl Iterator<Item = (Modality, &Tensor)> {
        Modality::ALL.iter().filter_map(move |&m| {
            self.terms[m.index()].tensor().map(|t| (m, t))
        })
    }

    pub fn active_count(&self) -> usize {
        self.active().count()
    }

    /// The six balancer inputs in slot order, with absent slots
    /// replaced by the supplied zero constant.
    pub fn balancer_inputs(&self, zero: &Tensor) -> Vec<Tensor> {
        Modality::ALL
            .iter()
            .map(|&m| match self.terms[m.index()] {
                LossTerm::Present(ref t) => t.clone(),
                LossTerm::Absent => zero.clone(),
            })
            .collect()
    }

    /// Scalar snapshot for diagnostics; `None` encodes absence.
    pub fn scalars(&self) -> AlignResult<BTreeMap<String, Option<f32>>> {
        let mut out = BTreeMap::new();
        for &m in Modality::ALL.iter() {
            out.insert(m.name().to_string(), self.terms[m.index()].scalar()?);
        }
        Ok(out)
    }
}

impl Default for ModalityLossSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of the replay cache state, exposed in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayState {
    /// Number of cache entries still at the unknown sentinel.
    pub pending_count: usize,
    /// Whether the cache sources negatives for the joint loss.
    /// Monotonic: once true, never reverts.
    pub ready: bool,
}

/// Per-step diagnostics record. Every component value is present,
/// with `None` encoding "absent" (as opposed to an explicit zero), so
/// a logging collaborator can render partial results even when some
/// gates are disabled.
#[derive(Debug, Clone, Serialize)]
pub struct StepDiagnostics {
    /// Joint contrastive loss over the concatenated embedding.
    pub joint: f32,
    /// Balanced multi-modality loss for the raw per-modality view.
    pub modal_balanced: f32,
    /// Balanced multi-modality loss for the aggregated hidden view.
    pub hidden_balanced: f32,
    /// Per-modality raw-view losses (`None` = modality absent).
    pub modal_losses: BTreeMap<String, Option<f32>>,
    /// Per-modality hidden-view losses (`None` = modality absent).
    pub hidden_losses: BTreeMap<String, Option<f32>>,
    /// Domain alignment gate (`None` = gate absent).
    pub domain_align: Option<f32>,
    /// Missing-aware image gate (`None` = gate absent; `Some(0.0)`
    /// when active but vacuously satisfied).
    pub missing_align: Option<f32>,
    /// Combined source-selection contribution across both views.
    pub source_select: f32,
    /// Softmax weights per active modality, raw view.
    pub modal_source_weights: BTreeMap<String, f32>,
    /// Softmax weights per active modality, hidden view.
    pub hidden_source_weights: BTreeMap<String, f32>,
    /// Current balancer log-variance weights, slot order.
    pub balancer_weights: Vec<f32>,
    /// Replay cache state, if replay is enabled.
    pub replay: Option<ReplayState>,
    /// Total loss returned to the training loop.
    pub total: f32,
}
