//! Seam to the external multimodal encoder.
//!
//! The encoder itself (GNN aggregation, projection heads, fusion) is
//! an external collaborator; this crate only consumes its output: one
//! raw per-modality view, one aggregated hidden-state view, and the
//! concatenated joint embedding.

use candle_core::Tensor;

use crate::error::AlignResult;
use crate::types::Modality;

/// Per-modality embedding tables for one view. Each present table has
/// shape `[num_entities, dim]` with dense entity ids `0..num_entities`
/// as row indices; an absent modality has no table at all.
#[derive(Debug, Clone, Default)]
pub struct ModalityEmbeddings {
    tables: [Option<Tensor>; Modality::COUNT],
}

impl ModalityEmbeddings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter.
    pub fn with(mut self, modality: Modality, table: Tensor) -> Self {
        self.tables[modality.index()] = Some(table);
        self
    }

    pub fn set(&mut self, modality: Modality, table: Tensor) {
        self.tables[modality.index()] = Some(table);
    }

    pub fn get(&self, modality: Modality) -> Option<&Tensor> {
        self.tables[modality.index()].as_ref()
    }
}

/// The two embedding views plus the joint embedding produced by one
/// encoder call. Embeddings are fresh per call; nothing here is
/// persisted by the core.
#[derive(Debug, Clone)]
pub struct EncodedViews {
    /// Raw per-modality view (pre-aggregation).
    pub modal: ModalityEmbeddings,
    /// Aggregated hidden-state view (post-aggregation).
    pub hidden: ModalityEmbeddings,
    /// Concatenated joint embedding, `[num_entities, joint_dim]`.
    pub joint: Tensor,
}

/// External encoder collaborator. One call covers the full entity
/// table; the orchestrator does the batch indexing.
pub trait MultiModalEncoder {
    /// Produce both views and the joint embedding for all entities.
    fn encode(&self) -> AlignResult<EncodedViews>;

    /// Total number of entities across both graphs.
    fn num_entities(&self) -> usize;
}
