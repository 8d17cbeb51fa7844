//! Configuration for the alignment training core.
//!
//! `AlignConfig` is loadable from a TOML file and validated as a
//! whole. Invalid configuration returns an error immediately; nothing
//! is silently defaulted away at use sites.
//!
//! ```toml
//! replay = true
//! neg_cross_kg = true
//! tau = 0.1
//! ab_weight = 0.5
//!
//! use_source_select = true
//! source_select_weight = 0.1
//! source_select_temp = 1.0
//!
//! semi_learn_step = 5
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AlignError, AlignResult};

fn default_tau() -> f64 {
    0.1
}

fn default_ab_weight() -> f64 {
    0.5
}

fn default_gate_weight() -> f64 {
    1.0
}

fn default_source_select_weight() -> f64 {
    0.1
}

fn default_source_select_temp() -> f64 {
    1.0
}

fn default_semi_learn_step() -> usize {
    5
}

fn default_semi_full_accept_cycle() -> usize {
    5
}

fn default_batch_size() -> usize {
    512
}

/// Configuration surface of the training core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignConfig {
    /// Source hard negatives for the joint loss from the replay cache
    /// once it reaches the ready state.
    #[serde(default)]
    pub replay: bool,

    /// When replay is enabled, restrict negative candidates to the
    /// opposite knowledge graph.
    #[serde(default)]
    pub neg_cross_kg: bool,

    /// Enable the domain-alignment gate (draws paired joint
    /// embeddings together directly).
    #[serde(default)]
    pub use_domain_align: bool,

    /// Scale for the domain-alignment contribution. A zero weight
    /// disables the contribution without disabling the computation.
    #[serde(default = "default_gate_weight")]
    pub domain_align_weight: f64,

    /// Enable the missing-aware image gate (compares only pairs where
    /// both sides have a present image).
    #[serde(default)]
    pub use_missing_gate: bool,

    /// Scale for the missing-aware image contribution.
    #[serde(default = "default_gate_weight")]
    pub missing_align_weight: f64,

    /// Enable source-selection reweighting of active modality losses.
    #[serde(default)]
    pub use_source_select: bool,

    /// Scale for the source-selection contribution.
    #[serde(default = "default_source_select_weight")]
    pub source_select_weight: f64,

    /// Softmax temperature for source selection; floor-clamped to a
    /// small positive epsilon at use time.
    #[serde(default = "default_source_select_temp")]
    pub source_select_temp: f64,

    /// Contrastive loss temperature, passed through to the criterion.
    #[serde(default = "default_tau")]
    pub tau: f64,

    /// Cross-view balance of the bidirectional contrastive loss, in
    /// `[0, 1]`.
    #[serde(default = "default_ab_weight")]
    pub ab_weight: f64,

    /// Interval (in epochs) controlling the link augmenter's
    /// trigger-epoch policy.
    #[serde(default = "default_semi_learn_step")]
    pub semi_learn_step: usize,

    /// Number of augmentation intervals between full-accept epochs;
    /// 1 makes every interval a full-accept epoch. The original
    /// implementation hardcoded this multiplier at 5.
    #[serde(default = "default_semi_full_accept_cycle")]
    pub semi_full_accept_cycle: usize,

    /// Expected batch sizing for index bookkeeping.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for AlignConfig {
    fn default() -> Self {
        Self {
            replay: false,
            neg_cross_kg: false,
            use_domain_align: false,
            domain_align_weight: default_gate_weight(),
            use_missing_gate: false,
            missing_align_weight: default_gate_weight(),
            use_source_select: false,
            source_select_weight: default_source_select_weight(),
            source_select_temp: default_source_select_temp(),
            tau: default_tau(),
            ab_weight: default_ab_weight(),
            semi_learn_step: default_semi_learn_step(),
            semi_full_accept_cycle: default_semi_full_accept_cycle(),
            batch_size: default_batch_size(),
        }
    }
}

impl AlignConfig {
    /// Load and validate a config from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> AlignResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the whole configuration. Fatal on the first problem.
    pub fn validate(&self) -> AlignResult<()> {
        if !(self.tau > 0.0) {
            return Err(AlignError::ConfigError {
                message: format!("tau must be positive, got {}", self.tau),
            });
        }
        if !(0.0..=1.0).contains(&self.ab_weight) {
            return Err(AlignError::ConfigError {
                message: format!("ab_weight must be in [0, 1], got {}", self.ab_weight),
            });
        }
        for (name, value) in [
            ("domain_align_weight", self.domain_align_weight),
            ("missing_align_weight", self.missing_align_weight),
            ("source_select_weight", self.source_select_weight),
        ] {
            if value < 0.0 {
                return Err(AlignError::ConfigError {
                    message: format!("{name} must be non-negative, got {value}"),
                });
            }
        }
        if self.source_select_temp <= 0.0 {
            return Err(AlignError::ConfigError {
                message: format!(
                    "source_select_temp must be positive, got {}",
                    self.source_select_temp
                ),
            });
        }
        if self.semi_learn_step == 0 {
            return Err(AlignError::ConfigError {
                message: "semi_learn_step must be at least 1".into(),
            });
        }
        if self.semi_full_accept_cycle == 0 {
            return Err(AlignError::ConfigError {
                message: "semi_full_accept_cycle must be at least 1".into(),
            });
        }
        if self.batch_size == 0 {
            return Err(AlignError::ConfigError {
                message: "batch_size must be at least 1".into(),
            });
        }
        Ok(())
    }
}
