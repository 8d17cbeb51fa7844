//! Cross-modal alignment gates: two optional auxiliary losses added
//! on top of the contrastive terms.
//!
//! Domain alignment draws the paired joint embeddings together
//! directly (mean squared distance). The missing-aware image gate does
//! the same for image embeddings but only over pairs where *both*
//! sides have a present image; when it is active but no such pair
//! exists it returns an explicit zero, not `Absent`.

use candle_core::Tensor;

use crate::config::AlignConfig;
use crate::error::{map_candle, AlignError, AlignResult};
use crate::loss::{check_batch_range, scalar_zero};
use crate::types::{LossTerm, TrainBatch};

/// Configuration slice for the two gates.
#[derive(Debug, Clone, Copy)]
pub struct AlignmentGates {
    use_domain: bool,
    use_missing: bool,
}

fn mse_rows(embeddings: &Tensor, left: &[u32], right: &[u32]) -> AlignResult<Tensor> {
    let device = embeddings.device();
    let l_idx = Tensor::from_slice(left, (left.len(),), device).map_err(map_candle)?;
    let r_idx = Tensor::from_slice(right, (right.len(),), device).map_err(map_candle)?;
    let l = embeddings.index_select(&l_idx, 0).map_err(map_candle)?;
    let r = embeddings.index_select(&r_idx, 0).map_err(map_candle)?;
    l.sub(&r)
        .map_err(map_candle)?
        .sqr()
        .map_err(map_candle)?
        .mean_all()
        .map_err(map_candle)
}

impl AlignmentGates {
    pub fn from_config(config: &AlignConfig) -> Self {
        Self {
            use_domain: config.use_domain_align,
            use_missing: config.use_missing_gate,
        }
    }

    /// Mean squared distance between the paired joint embeddings.
    /// `Absent` if the gate is disabled or the batch is empty.
    pub fn domain_alignment(
        &self,
        joint: &Tensor,
        batch: &TrainBatch,
    ) -> AlignResult<LossTerm> {
        if !self.use_domain || batch.is_empty() {
            return Ok(LossTerm::Absent);
        }
        let rows = joint.dim(0).map_err(map_candle)?;
        check_batch_range(batch, rows, "domain alignment")?;
        Ok(LossTerm::Present(mse_rows(
            joint,
            &batch.left_ids(),
            &batch.right_ids(),
        )?))
    }

    /// MSE between image embeddings of pairs whose two sides both have
    /// a present image. Explicit zero when the gate is active but no
    /// pair qualifies; `Absent` when disabled or the image embedding
    /// table is unavailable.
    pub fn missing_aware_image(
        &self,
        image: Option<&Tensor>,
        presence: &[bool],
        batch: &TrainBatch,
    ) -> AlignResult<LossTerm> {
        if !self.use_missing {
            return Ok(LossTerm::Absent);
        }
        let Some(image) = image else {
            return Ok(LossTerm::Absent);
        };
        let rows = image.dim(0).map_err(map_candle)?;
        check_batch_range(batch, rows, "missing-aware image alignment")?;

        let mut left = Vec::new();
        let mut right = Vec::new();
        for pair in batch.pairs() {
            let l = pair.left as usize;
            let r = pair.right as usize;
            if l >= presence.len() || r >= presence.len() {
                return Err(AlignError::ShapeMismatch {
                    context: "image presence flags".to_string(),
                    expected: l.max(r) + 1,
                    actual: presence.len(),
                });
            }
            if presence[l] && presence[r] {
                left.push(pair.left);
                right.push(pair.right);
            }
        }

        if left.is_empty() {
            // Active but vacuously satisfied.
            return Ok(LossTerm::Present(scalar_zero(image.device())?));
        }
        Ok(LossTerm::Present(mse_rows(image, &left, &right)?))
    }
}
