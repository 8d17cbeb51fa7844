//! Multi-loss balancer with learned per-modality uncertainty weights.
//!
//! Combines the six modality losses into one scalar:
//!
//! `combined = Σ_i exp(-w_i) * loss_i + w_i`
//!
//! where `w` is a log-variance weight vector held as a trainable
//! `Var`, updated only by the external optimizer. Increasing any loss
//! while the others are fixed strictly increases the output
//! (`exp(-w_i) > 0`), and minimizing over `w_i` recovers the raw loss
//! up to a constant.
//!
//! Absent modalities are substituted upstream with a zero constant,
//! so their slots still contribute the `+ w_i` term and keep receiving
//! a weight-update signal. That mirrors the original implementation;
//! see DESIGN.md for why it is preserved rather than fixed.

use candle_core::{DType, Device, Tensor, Var};

use crate::error::{map_candle, AlignResult};
use crate::loss::scalar_zero;
use crate::types::{Modality, ModalityLossSet};

/// Learned-uncertainty weighted sum over the six modality slots.
pub struct MultiLossBalancer {
    log_vars: Var,
}

impl MultiLossBalancer {
    /// Weights start at zero, making the all-absent fixed point 0.0.
    pub fn new(device: &Device) -> AlignResult<Self> {
        let log_vars =
            Var::zeros(Modality::COUNT, DType::F32, device).map_err(map_candle)?;
        Ok(Self { log_vars })
    }

    /// Combine a loss set into one scalar.
    pub fn combine(&self, losses: &ModalityLossSet, device: &Device) -> AlignResult<Tensor> {
        let zero = scalar_zero(device)?;
        let inputs = losses.balancer_inputs(&zero);
        let stacked = Tensor::stack(&inputs, 0).map_err(map_candle)?;

        let weights = self.log_vars.as_tensor();
        let scale = weights.neg().map_err(map_candle)?.exp().map_err(map_candle)?;
        let weighted = stacked
            .mul(&scale)
            .map_err(map_candle)?
            .sum_all()
            .map_err(map_candle)?;
        weighted
            .add(&weights.sum_all().map_err(map_candle)?)
            .map_err(map_candle)
    }

    /// The trainable weight vector, for registration with the external
    /// optimizer. The core never mutates it directly.
    pub fn weights(&self) -> &Var {
        &self.log_vars
    }

    /// Current weight values in slot order, for diagnostics.
    pub fn weight_values(&self) -> AlignResult<Vec<f32>> {
        self.log_vars
            .as_tensor()
            .to_vec1::<f32>()
            .map_err(map_candle)
    }
}
