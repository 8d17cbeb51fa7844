//! Source-selection reweighting: a softmax-over-negative-loss
//! combination of the active modality losses.
//!
//! Lower-loss modalities receive higher weight, rewarding the sources
//! that agree with the current alignment. The softmax runs over the
//! *detached* loss values so the term regularizes without opening a
//! circular gradient path; only the resulting weights multiply the
//! live loss values.

use std::collections::BTreeMap;

use candle_core::Tensor;

use crate::error::{map_candle, AlignResult};
use crate::types::{LossTerm, ModalityLossSet};

/// Minimum softmax temperature; avoids division by zero.
const TEMP_EPSILON: f64 = 1e-6;

/// Result of one reweighting pass.
#[derive(Debug)]
pub struct SourceSelection {
    /// Weighted sum of the active losses, or `Absent` when fewer than
    /// one modality is active.
    pub loss: LossTerm,
    /// Diagnostic softmax weight per active modality name.
    pub weights: BTreeMap<String, f32>,
}

/// Softmax reweighter with a configurable temperature.
#[derive(Debug, Clone, Copy)]
pub struct SourceSelector {
    temperature: f64,
}

impl SourceSelector {
    /// Temperature is floor-clamped to a small positive epsilon.
    pub fn new(temperature: f64) -> Self {
        Self {
            temperature: temperature.max(TEMP_EPSILON),
        }
    }

    /// Compute `softmax(-detached_losses / temperature)` over the
    /// active modalities and return the reweighted sum.
    pub fn select(&self, losses: &ModalityLossSet) -> AlignResult<SourceSelection> {
        let active: Vec<_> = losses.active().collect();
        if active.is_empty() {
            return Ok(SourceSelection {
                loss: LossTerm::Absent,
                weights: BTreeMap::new(),
            });
        }

        let values: Vec<Tensor> = active.iter().map(|(_, t)| (*t).clone()).collect();
        let stacked = Tensor::stack(&values, 0).map_err(map_candle)?;
        let scores = stacked
            .detach()
            .affine(-1.0 / self.temperature, 0.0)
            .map_err(map_candle)?;
        let weights = candle_nn::ops::softmax(&scores, 0).map_err(map_candle)?;

        let selected = weights
            .mul(&stacked)
            .map_err(map_candle)?
            .sum_all()
            .map_err(map_candle)?;

        let weight_values = weights.to_vec1::<f32>().map_err(map_candle)?;
        let report = active
            .iter()
            .zip(weight_values)
            .map(|((m, _), w)| (m.name().to_string(), w))
            .collect();

        Ok(SourceSelection {
            loss: LossTerm::Present(selected),
            weights: report,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Modality;
    use candle_core::Device;

    fn loss_set(entries: &[(Modality, f32)], device: &Device) -> ModalityLossSet {
        let mut set = ModalityLossSet::new();
        for &(m, v) in entries {
            set.set(m, Tensor::new(v, device).unwrap());
        }
        set
    }

    #[test]
    fn weights_sum_to_one_over_the_active_set() {
        let device = Device::Cpu;
        let set = loss_set(
            &[
                (Modality::Structure, 0.5),
                (Modality::Image, 1.5),
                (Modality::Name, 3.0),
            ],
            &device,
        );

        let selection = SourceSelector::new(1.0).select(&set).unwrap();
        assert_eq!(selection.weights.len(), 3);
        let total: f32 = selection.weights.values().sum();
        assert!((total - 1.0).abs() < 1e-6);
        assert!(selection.weights.values().all(|&w| w >= 0.0));
        // Lower loss, higher weight.
        assert!(selection.weights["structure"] > selection.weights["image"]);
        assert!(selection.weights["image"] > selection.weights["name"]);
    }

    #[test]
    fn no_active_modalities_is_absent_with_empty_report() {
        let selection = SourceSelector::new(1.0)
            .select(&ModalityLossSet::new())
            .unwrap();
        assert!(!selection.loss.is_present());
        assert!(selection.weights.is_empty());
    }

    #[test]
    fn low_temperature_approaches_hard_min_selection() {
        let device = Device::Cpu;
        let set = loss_set(
            &[(Modality::Structure, 0.2), (Modality::Image, 2.0)],
            &device,
        );

        let selection = SourceSelector::new(1e-3).select(&set).unwrap();
        assert!(selection.weights["structure"] > 0.999);
        assert!(selection.weights["image"] < 1e-3);
        // The selected loss collapses onto the lowest-loss modality.
        let value = selection.loss.scalar().unwrap().unwrap();
        assert!((value - 0.2).abs() < 1e-2);
    }

    #[test]
    fn zero_temperature_is_clamped_not_divided() {
        let device = Device::Cpu;
        let set = loss_set(&[(Modality::Structure, 1.0)], &device);
        let selection = SourceSelector::new(0.0).select(&set).unwrap();
        let value = selection.loss.scalar().unwrap().unwrap();
        assert!(value.is_finite());
        assert!((selection.weights["structure"] - 1.0).abs() < 1e-6);
    }
}
