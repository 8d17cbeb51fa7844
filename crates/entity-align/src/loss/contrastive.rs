//! Contrastive alignment criterion.
//!
//! The trait is the seam to the (conceptually external) pairwise loss
//! primitive. `InfoNceLoss` is the provided implementation: a
//! bidirectional InfoNCE over in-batch negatives with optional extra
//! negatives, plus per-anchor hardest-negative discovery for the
//! replay cache.

use candle_core::Tensor;

use crate::error::{map_candle, AlignError, AlignResult};
use crate::loss::scalar_zero;
use crate::types::TrainBatch;

/// Joint loss output when hard negatives are being tracked.
#[derive(Debug)]
pub struct JointLossOutput {
    /// The contrastive loss scalar.
    pub loss: Tensor,
    /// Per left-anchor hardest negative entity id (−1 = none found).
    pub hard_left: Vec<i64>,
    /// Per right-anchor hardest negative entity id (−1 = none found).
    pub hard_right: Vec<i64>,
}

/// Pairwise contrastive alignment loss over a batch of positive
/// cross-graph pairs.
pub trait ContrastiveCriterion {
    /// Loss against in-batch negatives only.
    fn loss(&self, embeddings: &Tensor, batch: &TrainBatch) -> AlignResult<Tensor>;

    /// Loss with additional negative entities mixed in (`neg_for_left`
    /// contrasts the left anchors, `neg_for_right` the right anchors),
    /// also reporting the hardest in-batch negative discovered for
    /// every anchor.
    fn loss_tracking_negatives(
        &self,
        embeddings: &Tensor,
        batch: &TrainBatch,
        neg_for_left: &[u32],
        neg_for_right: &[u32],
    ) -> AlignResult<JointLossOutput>;
}

/// Bidirectional InfoNCE: `ab_weight * CE(left→right) +
/// (1 - ab_weight) * CE(right→left)` with similarity logits scaled by
/// `1/tau` and diagonal labels.
#[derive(Debug, Clone)]
pub struct InfoNceLoss {
    tau: f64,
    ab_weight: f64,
    neg_cross_kg: bool,
}

impl InfoNceLoss {
    pub fn new(tau: f64, ab_weight: f64) -> AlignResult<Self> {
        if !(tau > 0.0) {
            return Err(AlignError::ConfigError {
                message: format!("contrastive tau must be positive, got {tau}"),
            });
        }
        if !(0.0..=1.0).contains(&ab_weight) {
            return Err(AlignError::ConfigError {
                message: format!("ab_weight must be in [0, 1], got {ab_weight}"),
            });
        }
        Ok(Self {
            tau,
            ab_weight,
            neg_cross_kg: false,
        })
    }

    /// Restrict hard-negative candidates to the opposite graph.
    pub fn with_cross_kg_negatives(mut self, neg_cross_kg: bool) -> Self {
        self.neg_cross_kg = neg_cross_kg;
        self
    }

    fn gather(&self, embeddings: &Tensor, ids: &[u32]) -> AlignResult<Tensor> {
        let idx = Tensor::from_slice(ids, (ids.len(),), embeddings.device())
            .map_err(map_candle)?;
        embeddings.index_select(&idx, 0).map_err(map_candle)
    }

    /// One direction of the loss: anchors against their positives plus
    /// optional extra negative rows.
    fn directional_ce(
        &self,
        anchors: &Tensor,
        positives: &Tensor,
        embeddings: &Tensor,
        extra_negatives: &[u32],
    ) -> AlignResult<Tensor> {
        let n = anchors.dim(0).map_err(map_candle)?;
        let mut logits = anchors
            .matmul(&positives.t().map_err(map_candle)?)
            .map_err(map_candle)?
            .affine(1.0 / self.tau, 0.0)
            .map_err(map_candle)?;

        if !extra_negatives.is_empty() {
            let neg = self.gather(embeddings, extra_negatives)?;
            let extra = anchors
                .matmul(&neg.t().map_err(map_candle)?)
                .map_err(map_candle)?
                .affine(1.0 / self.tau, 0.0)
                .map_err(map_candle)?;
            logits = Tensor::cat(&[&logits, &extra], 1).map_err(map_candle)?;
        }

        let labels = Tensor::arange(0u32, n as u32, anchors.device()).map_err(map_candle)?;
        candle_nn::loss::cross_entropy(&logits, &labels).map_err(map_candle)
    }

    fn bidirectional(
        &self,
        embeddings: &Tensor,
        batch: &TrainBatch,
        neg_for_left: &[u32],
        neg_for_right: &[u32],
    ) -> AlignResult<(Tensor, Tensor, Tensor)> {
        let left = self.gather(embeddings, &batch.left_ids())?;
        let right = self.gather(embeddings, &batch.right_ids())?;

        let ce_lr = self.directional_ce(&left, &right, embeddings, neg_for_left)?;
        let ce_rl = self.directional_ce(&right, &left, embeddings, neg_for_right)?;
        let loss = ce_lr
            .affine(self.ab_weight, 0.0)
            .map_err(map_candle)?
            .add(&ce_rl.affine(1.0 - self.ab_weight, 0.0).map_err(map_candle)?)
            .map_err(map_candle)?;
        Ok((loss, left, right))
    }

    /// Hardest in-batch negative per anchor, read off the detached
    /// similarity matrices on the CPU. For each anchor the candidate
    /// pool is the opposite side of the batch (minus its own positive
    /// partner), widened to the same side when `neg_cross_kg` is off.
    fn hard_negatives(
        &self,
        left: &Tensor,
        right: &Tensor,
        batch: &TrainBatch,
    ) -> AlignResult<(Vec<i64>, Vec<i64>)> {
        let n = batch.len();
        let left_ids = batch.left_ids();
        let right_ids = batch.right_ids();

        let sim_lr = left
            .matmul(&right.t().map_err(map_candle)?)
            .map_err(map_candle)?
            .detach()
            .to_vec2::<f32>()
            .map_err(map_candle)?;
        let (sim_ll, sim_rr) = if self.neg_cross_kg {
            (None, None)
        } else {
            let ll = left
                .matmul(&left.t().map_err(map_candle)?)
                .map_err(map_candle)?
                .detach()
                .to_vec2::<f32>()
                .map_err(map_candle)?;
            let rr = right
                .matmul(&right.t().map_err(map_candle)?)
                .map_err(map_candle)?
                .detach()
                .to_vec2::<f32>()
                .map_err(map_candle)?;
            (Some(ll), Some(rr))
        };

        let mut hard_left = Vec::with_capacity(n);
        let mut hard_right = Vec::with_capacity(n);
        for i in 0..n {
            let mut best_l: Option<(f32, u32)> = None;
            let mut best_r: Option<(f32, u32)> = None;
            for j in 0..n {
                if j == i {
                    continue;
                }
                consider(&mut best_l, sim_lr[i][j], right_ids[j]);
                consider(&mut best_r, sim_lr[j][i], left_ids[j]);
                if let Some(ll) = &sim_ll {
                    consider(&mut best_l, ll[i][j], left_ids[j]);
                }
                if let Some(rr) = &sim_rr {
                    consider(&mut best_r, rr[i][j], right_ids[j]);
                }
            }
            hard_left.push(best_l.map_or(-1, |(_, id)| i64::from(id)));
            hard_right.push(best_r.map_or(-1, |(_, id)| i64::from(id)));
        }
        Ok((hard_left, hard_right))
    }
}

fn consider(best: &mut Option<(f32, u32)>, score: f32, id: u32) {
    match best {
        Some((s, _)) if *s >= score => {}
        _ => *best = Some((score, id)),
    }
}

impl ContrastiveCriterion for InfoNceLoss {
    fn loss(&self, embeddings: &Tensor, batch: &TrainBatch) -> AlignResult<Tensor> {
        if batch.is_empty() {
            return scalar_zero(embeddings.device());
        }
        let (loss, _, _) = self.bidirectional(embeddings, batch, &[], &[])?;
        Ok(loss)
    }

    fn loss_tracking_negatives(
        &self,
        embeddings: &Tensor,
        batch: &TrainBatch,
        neg_for_left: &[u32],
        neg_for_right: &[u32],
    ) -> AlignResult<JointLossOutput> {
        if batch.is_empty() {
            return Ok(JointLossOutput {
                loss: scalar_zero(embeddings.device())?,
                hard_left: Vec::new(),
                hard_right: Vec::new(),
            });
        }
        let (loss, left, right) =
            self.bidirectional(embeddings, batch, neg_for_left, neg_for_right)?;
        let (hard_left, hard_right) = self.hard_negatives(&left, &right, batch)?;
        Ok(JointLossOutput {
            loss,
            hard_left,
            hard_right,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn embeddings(rows: &[[f32; 2]], device: &Device) -> Tensor {
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        Tensor::from_slice(&flat, (rows.len(), 2), device).unwrap()
    }

    #[test]
    fn loss_is_positive_and_finite() {
        let device = Device::Cpu;
        let emb = embeddings(
            &[[1.0, 0.0], [0.0, 1.0], [0.9, 0.1], [0.1, 0.9]],
            &device,
        );
        let batch = TrainBatch::from(vec![(0, 2), (1, 3)]);
        let criterion = InfoNceLoss::new(0.1, 0.5).unwrap();

        let loss = criterion.loss(&emb, &batch).unwrap();
        let value = loss.to_scalar::<f32>().unwrap();
        assert!(value.is_finite());
        assert!(value > 0.0);
    }

    #[test]
    fn empty_batch_is_zero() {
        let device = Device::Cpu;
        let emb = embeddings(&[[1.0, 0.0]], &device);
        let criterion = InfoNceLoss::new(0.1, 0.5).unwrap();
        let loss = criterion.loss(&emb, &TrainBatch::default()).unwrap();
        assert_eq!(loss.to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn cross_kg_hard_negatives_come_from_opposite_graph() {
        let device = Device::Cpu;
        // Entities 0,1 on the left; 2,3 on the right. For left anchor
        // 0 the only cross-graph candidate besides its positive is 3.
        let emb = embeddings(
            &[[1.0, 0.0], [0.0, 1.0], [0.9, 0.1], [0.1, 0.9]],
            &device,
        );
        let batch = TrainBatch::from(vec![(0, 2), (1, 3)]);
        let criterion = InfoNceLoss::new(0.1, 0.5)
            .unwrap()
            .with_cross_kg_negatives(true);

        let out = criterion
            .loss_tracking_negatives(&emb, &batch, &[], &[])
            .unwrap();
        assert_eq!(out.hard_left, vec![3, 2]);
        assert_eq!(out.hard_right, vec![1, 0]);
    }

    #[test]
    fn same_graph_candidates_widen_the_pool() {
        let device = Device::Cpu;
        // Left anchor 0 is nearly identical to left entity 1, which
        // beats every cross-graph candidate once the pool is widened.
        let emb = embeddings(
            &[[1.0, 0.0], [0.99, 0.01], [0.2, 0.8], [0.1, 0.9]],
            &device,
        );
        let batch = TrainBatch::from(vec![(0, 2), (1, 3)]);
        let criterion = InfoNceLoss::new(0.1, 0.5).unwrap();

        let out = criterion
            .loss_tracking_negatives(&emb, &batch, &[], &[])
            .unwrap();
        assert_eq!(out.hard_left[0], 1);
    }

    #[test]
    fn singleton_batch_has_no_negatives() {
        let device = Device::Cpu;
        let emb = embeddings(&[[1.0, 0.0], [0.9, 0.1]], &device);
        let batch = TrainBatch::from(vec![(0, 1)]);
        let criterion = InfoNceLoss::new(0.1, 0.5).unwrap();

        let out = criterion
            .loss_tracking_negatives(&emb, &batch, &[], &[])
            .unwrap();
        assert_eq!(out.hard_left, vec![-1]);
        assert_eq!(out.hard_right, vec![-1]);
    }

    #[test]
    fn extra_negatives_increase_the_loss() {
        let device = Device::Cpu;
        let emb = embeddings(
            &[[1.0, 0.0], [0.0, 1.0], [0.9, 0.1], [0.1, 0.9], [0.95, 0.05]],
            &device,
        );
        let batch = TrainBatch::from(vec![(0, 2), (1, 3)]);
        let criterion = InfoNceLoss::new(0.1, 0.5).unwrap();

        let plain = criterion
            .loss_tracking_negatives(&emb, &batch, &[], &[])
            .unwrap()
            .loss
            .to_scalar::<f32>()
            .unwrap();
        // Entity 4 is close to left anchor 0, a hard extra negative.
        let with_extra = criterion
            .loss_tracking_negatives(&emb, &batch, &[4], &[])
            .unwrap()
            .loss
            .to_scalar::<f32>()
            .unwrap();
        assert!(with_extra > plain);
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(InfoNceLoss::new(0.0, 0.5).is_err());
        assert!(InfoNceLoss::new(0.1, 1.5).is_err());
    }
}
