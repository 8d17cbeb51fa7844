//! Loss machinery: the contrastive criterion seam, the learned
//! multi-loss balancer, the cross-modal alignment gates and the
//! source-selection reweighter.

pub mod balancer;
pub mod contrastive;
pub mod gates;
pub mod source_select;

pub use balancer::MultiLossBalancer;
pub use contrastive::{ContrastiveCriterion, InfoNceLoss, JointLossOutput};
pub use gates::AlignmentGates;
pub use source_select::{SourceSelection, SourceSelector};

use candle_core::{DType, Device, Tensor};

use crate::encoder::ModalityEmbeddings;
use crate::error::{map_candle, AlignError, AlignResult};
use crate::types::{Modality, ModalityLossSet, TrainBatch};

/// 0-dim zero scalar, the neutral value for batch-dependent terms.
pub(crate) fn scalar_zero(device: &Device) -> AlignResult<Tensor> {
    Tensor::zeros((), DType::F32, device).map_err(map_candle)
}

/// Check that an embedding table covers every entity id the batch
/// references.
pub(crate) fn check_batch_range(
    batch: &TrainBatch,
    rows: usize,
    context: &str,
) -> AlignResult<()> {
    if let Some(max_id) = batch.max_id() {
        let needed = max_id as usize + 1;
        if rows < needed {
            return Err(AlignError::ShapeMismatch {
                context: context.to_string(),
                expected: needed,
                actual: rows,
            });
        }
    }
    Ok(())
}

/// Modality loss evaluator: one contrastive alignment loss per
/// available modality, `Absent` for the rest. Pure function of its
/// inputs. An empty batch yields an explicit zero for every available
/// modality rather than an error.
pub fn evaluate_modalities(
    embeddings: &ModalityEmbeddings,
    batch: &TrainBatch,
    criterion: &dyn ContrastiveCriterion,
) -> AlignResult<ModalityLossSet> {
    let mut set = ModalityLossSet::new();
    for &modality in Modality::ALL.iter() {
        let Some(table) = embeddings.get(modality) else {
            continue;
        };
        let rows = table.dim(0).map_err(map_candle)?;
        check_batch_range(batch, rows, modality.name())?;
        let loss = if batch.is_empty() {
            scalar_zero(table.device())?
        } else {
            criterion.loss(table, batch)?
        };
        set.set(modality, loss);
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn table(rows: usize, dim: usize, device: &Device) -> Tensor {
        let data: Vec<f32> = (0..rows * dim).map(|i| (i as f32 * 0.37).sin()).collect();
        Tensor::from_slice(&data, (rows, dim), device).unwrap()
    }

    #[test]
    fn absent_modalities_stay_absent() {
        let device = Device::Cpu;
        let embs = ModalityEmbeddings::new()
            .with(Modality::Structure, table(4, 8, &device))
            .with(Modality::Image, table(4, 8, &device));
        let batch = TrainBatch::from(vec![(0, 2), (1, 3)]);
        let criterion = InfoNceLoss::new(0.1, 0.5).unwrap();

        let set = evaluate_modalities(&embs, &batch, &criterion).unwrap();
        assert!(set.get(Modality::Structure).is_present());
        assert!(set.get(Modality::Image).is_present());
        assert!(!set.get(Modality::Relation).is_present());
        assert_eq!(set.active_count(), 2);
    }

    #[test]
    fn shape_mismatch_is_fatal() {
        let device = Device::Cpu;
        let embs = ModalityEmbeddings::new().with(Modality::Structure, table(3, 8, &device));
        let batch = TrainBatch::from(vec![(0, 7)]);
        let criterion = InfoNceLoss::new(0.1, 0.5).unwrap();

        let err = evaluate_modalities(&embs, &batch, &criterion).unwrap_err();
        assert!(matches!(err, AlignError::ShapeMismatch { expected: 8, actual: 3, .. }));
    }

    #[test]
    fn empty_batch_yields_explicit_zeros() {
        let device = Device::Cpu;
        let embs = ModalityEmbeddings::new().with(Modality::Name, table(4, 8, &device));
        let criterion = InfoNceLoss::new(0.1, 0.5).unwrap();

        let set = evaluate_modalities(&embs, &TrainBatch::default(), &criterion).unwrap();
        assert_eq!(set.get(Modality::Name).scalar().unwrap(), Some(0.0));
    }
}
