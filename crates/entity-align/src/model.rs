//! Forward orchestrator: composes the modality evaluator, the
//! balancer, the replay cache, the alignment gates and the source
//! selector into one training step.
//!
//! Ordering guarantee: within one forward call the replay cache update
//! happens strictly after the joint loss has consumed the cache's
//! pre-update state. The model assumes it is never invoked
//! concurrently by two training steps.

use std::collections::HashSet;

use candle_core::{Device, Tensor, Var};

use crate::config::AlignConfig;
use crate::encoder::{EncodedViews, MultiModalEncoder};
use crate::error::{map_candle, AlignError, AlignResult};
use crate::loss::{
    evaluate_modalities, scalar_zero, AlignmentGates, ContrastiveCriterion, InfoNceLoss,
    MultiLossBalancer, SourceSelector,
};
use crate::replay::ReplayCache;
use crate::types::{LossTerm, Modality, ModalityLossSet, ReplayState, StepDiagnostics, TrainBatch};

/// The alignment model's training-time core. Owns the replay cache
/// and the learned loss weights for the lifetime of the run; the
/// encoder and the contrastive primitive are external collaborators
/// plugged in at construction.
pub struct AlignModel {
    config: AlignConfig,
    encoder: Box<dyn MultiModalEncoder>,
    criterion: Box<dyn ContrastiveCriterion>,
    joint_criterion: Box<dyn ContrastiveCriterion>,
    balancer: MultiLossBalancer,
    gates: AlignmentGates,
    source_selector: SourceSelector,
    replay: Option<ReplayCache>,
    image_present: Option<Vec<bool>>,
    num_entities: usize,
    device: Device,
}

impl AlignModel {
    /// Build the model with the default InfoNCE criteria derived from
    /// the config (`tau`, `ab_weight`, `neg_cross_kg`).
    ///
    /// Fails fast on invalid configuration, including enabling the
    /// missing-aware gate without per-entity image presence flags.
    pub fn new(
        config: AlignConfig,
        encoder: Box<dyn MultiModalEncoder>,
        image_present: Option<Vec<bool>>,
        device: &Device,
    ) -> AlignResult<Self> {
        let criterion = InfoNceLoss::new(config.tau, config.ab_weight)?;
        let joint_criterion = criterion.clone().with_cross_kg_negatives(config.neg_cross_kg);
        Self::with_criteria(
            config,
            encoder,
            Box::new(criterion),
            Box::new(joint_criterion),
            image_present,
            device,
        )
    }

    /// Build the model with externally supplied contrastive criteria
    /// (per-modality and joint).
    pub fn with_criteria(
        config: AlignConfig,
        encoder: Box<dyn MultiModalEncoder>,
        criterion: Box<dyn ContrastiveCriterion>,
        joint_criterion: Box<dyn ContrastiveCriterion>,
        image_present: Option<Vec<bool>>,
        device: &Device,
    ) -> AlignResult<Self> {
        config.validate()?;
        let num_entities = encoder.num_entities();

        if config.use_missing_gate && image_present.is_none() {
            return Err(AlignError::ConfigError {
                message: "missing-aware gate enabled but no image presence flags supplied"
                    .into(),
            });
        }
        if let Some(flags) = &image_present {
            if flags.len() != num_entities {
                return Err(AlignError::ShapeMismatch {
                    context: "image presence flags".to_string(),
                    expected: num_entities,
                    actual: flags.len(),
                });
            }
        }

        let replay = config.replay.then(|| ReplayCache::new(num_entities));
        let gates = AlignmentGates::from_config(&config);
        let source_selector = SourceSelector::new(config.source_select_temp);
        let balancer = MultiLossBalancer::new(device)?;

        Ok(Self {
            config,
            encoder,
            criterion,
            joint_criterion,
            balancer,
            gates,
            source_selector,
            replay,
            image_present,
            num_entities,
            device: device.clone(),
        })
    }

    /// Parameters to register with the external optimizer. The core
    /// never steps them itself.
    pub fn trainable_params(&self) -> Vec<Var> {
        vec![self.balancer.weights().clone()]
    }

    /// Replay cache state snapshot, if replay is enabled.
    pub fn replay_state(&self) -> Option<ReplayState> {
        self.replay.as_ref().map(|c| c.state())
    }

    pub fn num_entities(&self) -> usize {
        self.num_entities
    }

    pub fn config(&self) -> &AlignConfig {
        &self.config
    }

    /// Joint embedding for all entities, as used by the link
    /// augmenter between epochs.
    pub fn joint_embedding(&self) -> AlignResult<Tensor> {
        Ok(self.encoder.encode()?.joint)
    }

    /// One training step over a batch of positive pairs. Returns the
    /// total loss and a diagnostics record covering every component.
    /// An empty batch produces a zero contribution for every
    /// batch-dependent term and never errors.
    pub fn forward(&mut self, batch: &TrainBatch) -> AlignResult<(Tensor, StepDiagnostics)> {
        let views = self.encoder.encode()?;
        self.check_joint_shape(&views)?;

        // Joint loss first: it must see the cache's pre-update state.
        let joint_loss = self.joint_loss(&views.joint, batch)?;

        let modal_losses =
            evaluate_modalities(&views.modal, batch, self.criterion.as_ref())?;
        let hidden_losses =
            evaluate_modalities(&views.hidden, batch, self.criterion.as_ref())?;

        let modal_balanced = self.balancer.combine(&modal_losses, &self.device)?;
        let hidden_balanced = self.balancer.combine(&hidden_losses, &self.device)?;

        let mut total = joint_loss
            .add(&modal_balanced)
            .map_err(map_candle)?
            .add(&hidden_balanced)
            .map_err(map_candle)?;

        let domain = self.gates.domain_alignment(&views.joint, batch)?;
        if let LossTerm::Present(term) = &domain {
            if self.config.domain_align_weight > 0.0 {
                total = total
                    .add(&term.affine(self.config.domain_align_weight, 0.0).map_err(map_candle)?)
                    .map_err(map_candle)?;
            }
        }

        let missing = self.gates.missing_aware_image(
            views.modal.get(Modality::Image),
            self.image_present.as_deref().unwrap_or(&[]),
            batch,
        )?;
        if let LossTerm::Present(term) = &missing {
            if self.config.missing_align_weight > 0.0 {
                total = total
                    .add(&term.affine(self.config.missing_align_weight, 0.0).map_err(map_candle)?)
                    .map_err(map_candle)?;
            }
        }

        let (source_total, modal_weights, hidden_weights) =
            self.source_selection(&modal_losses, &hidden_losses)?;
        if let Some(term) = &source_total {
            if self.config.source_select_weight > 0.0 {
                total = total
                    .add(&term.affine(self.config.source_select_weight, 0.0).map_err(map_candle)?)
                    .map_err(map_candle)?;
            }
        }

        let diagnostics = StepDiagnostics {
            joint: joint_loss.to_scalar::<f32>().map_err(map_candle)?,
            modal_balanced: modal_balanced.to_scalar::<f32>().map_err(map_candle)?,
            hidden_balanced: hidden_balanced.to_scalar::<f32>().map_err(map_candle)?,
            modal_losses: modal_losses.scalars()?,
            hidden_losses: hidden_losses.scalars()?,
            domain_align: domain.scalar()?,
            missing_align: missing.scalar()?,
            source_select: match &source_total {
                Some(t) => t.to_scalar::<f32>().map_err(map_candle)?,
                None => 0.0,
            },
            modal_source_weights: modal_weights,
            hidden_source_weights: hidden_weights,
            balancer_weights: self.balancer.weight_values()?,
            replay: self.replay_state(),
            total: total.to_scalar::<f32>().map_err(map_candle)?,
        };
        tracing::debug!(total = diagnostics.total, joint = diagnostics.joint, "forward step");

        Ok((total, diagnostics))
    }

    fn check_joint_shape(&self, views: &EncodedViews) -> AlignResult<()> {
        let rows = views.joint.dim(0).map_err(map_candle)?;
        if rows != self.num_entities {
            return Err(AlignError::ShapeMismatch {
                context: "joint embedding".to_string(),
                expected: self.num_entities,
                actual: rows,
            });
        }
        Ok(())
    }

    /// Joint contrastive loss over the concatenated embedding; sources
    /// negatives from the replay cache once it is ready and refreshes
    /// the cache with the batch's discovered negatives afterwards.
    fn joint_loss(&mut self, joint: &Tensor, batch: &TrainBatch) -> AlignResult<Tensor> {
        if batch.is_empty() {
            return scalar_zero(&self.device);
        }
        if let Some(max_id) = batch.max_id() {
            if max_id as usize >= self.num_entities {
                return Err(AlignError::IndexOutOfRange {
                    entity: max_id,
                    capacity: self.num_entities,
                });
            }
        }

        let Some(cache) = self.replay.as_mut() else {
            return self.joint_criterion.loss(joint, batch);
        };

        let (neg_for_left, neg_for_right) = if cache.is_ready() {
            let exclude: HashSet<u32> = batch.all_ids().into_iter().collect();
            (
                cache.negatives_for(&batch.left_ids(), &exclude)?,
                cache.negatives_for(&batch.right_ids(), &exclude)?,
            )
        } else {
            (Vec::new(), Vec::new())
        };

        let out = self.joint_criterion.loss_tracking_negatives(
            joint,
            batch,
            &neg_for_left,
            &neg_for_right,
        )?;
        cache.update(batch, &out.hard_left, &out.hard_right)?;
        Ok(out.loss)
    }

    fn source_selection(
        &self,
        modal: &ModalityLossSet,
        hidden: &ModalityLossSet,
    ) -> AlignResult<(
        Option<Tensor>,
        std::collections::BTreeMap<String, f32>,
        std::collections::BTreeMap<String, f32>,
    )> {
        if !self.config.use_source_select {
            return Ok((None, Default::default(), Default::default()));
        }
        let modal_sel = self.source_selector.select(modal)?;
        let hidden_sel = self.source_selector.select(hidden)?;

        let total = match (modal_sel.loss.tensor(), hidden_sel.loss.tensor()) {
            (Some(a), Some(b)) => Some(a.add(b).map_err(map_candle)?),
            (Some(a), None) => Some(a.clone()),
            (None, Some(b)) => Some(b.clone()),
            (None, None) => None,
        };
        Ok((total, modal_sel.weights, hidden_sel.weights))
    }
}
