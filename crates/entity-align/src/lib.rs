//! Training-time orchestration core for multi-modal knowledge-graph
//! entity alignment.
//!
//! Maps entities from two knowledge graphs into a shared embedding
//! space so equivalent entities land close together. This crate owns
//! the training-step logic around an external encoder:
//!
//! - **Modality losses + balancer**: per-modality contrastive losses
//!   combined through learned log-variance uncertainty weights
//!   ([`loss::MultiLossBalancer`]).
//! - **Replay negative cache**: per-entity hard-negative table with a
//!   one-way warm-up → ready transition ([`replay::ReplayCache`]).
//! - **Alignment gates**: optional domain-alignment and
//!   missing-modality-aware image losses ([`loss::AlignmentGates`]).
//! - **Source selection**: softmax-over-negative-loss reweighting of
//!   the active modalities ([`loss::SourceSelector`]).
//! - **Forward orchestrator**: one training step, total loss plus a
//!   full diagnostics record ([`model::AlignModel`]).
//! - **Link augmenter**: semi-supervised mutual-nearest-neighbor
//!   discovery of new training pairs with a hysteresis filter
//!   ([`semi::LinkAugmenter`]).
//!
//! The multimodal encoder and the autodiff engine are external
//! collaborators: the encoder through [`encoder::MultiModalEncoder`],
//! gradients through Candle's `Var`/`backward`, with the learned
//! weights exposed via [`model::AlignModel::trainable_params`].
//!
//! # Example
//!
//! ```rust,ignore
//! use entity_align::{AlignConfig, AlignModel, TrainBatch};
//!
//! let config = AlignConfig::from_file("align.toml")?;
//! let mut model = AlignModel::new(config, encoder, image_flags, &device)?;
//! let (loss, diagnostics) = model.forward(&batch)?;
//! loss.backward()?; // external optimizer steps trainable_params()
//! ```

pub mod config;
pub mod encoder;
pub mod error;
pub mod loss;
pub mod model;
pub mod replay;
pub mod semi;
pub mod types;

pub use config::AlignConfig;
pub use encoder::{EncodedViews, ModalityEmbeddings, MultiModalEncoder};
pub use error::{AlignError, AlignResult};
pub use loss::{
    evaluate_modalities, AlignmentGates, ContrastiveCriterion, InfoNceLoss, JointLossOutput,
    MultiLossBalancer, SourceSelection, SourceSelector,
};
pub use model::AlignModel;
pub use replay::ReplayCache;
pub use semi::{LinkAugmenter, MergeReport};
pub use types::{
    AlignmentPair, LossTerm, Modality, ModalityLossSet, ReplayState, StepDiagnostics, TrainBatch,
};
