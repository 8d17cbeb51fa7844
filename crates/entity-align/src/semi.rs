//! Semi-supervised link augmentation: mutual-nearest-neighbor
//! discovery of new alignment pairs among the not-yet-aligned entity
//! pools, with a two-round hysteresis filter, plus the merge routine
//! that folds accepted links into the training set.
//!
//! Invoked by the training loop once per configured epoch interval.
//! The pools and candidate buffer are owned by the training loop and
//! mutated in place by `merge`.

use std::collections::HashSet;

use candle_core::Tensor;

use crate::config::AlignConfig;
use crate::error::{map_candle, AlignError, AlignResult};
use crate::types::AlignmentPair;

/// Outcome of a merge, for logging. The true-link ratio is a held-out
/// diagnostic only; it never gates acceptance.
#[derive(Debug, Clone, Copy)]
pub struct MergeReport {
    /// Number of links appended to the training set.
    pub accepted: usize,
    /// How many accepted links matched the held-out ground truth.
    pub true_links: usize,
    /// Left-pool size after the merge.
    pub remaining_left: usize,
    /// Right-pool size after the merge.
    pub remaining_right: usize,
}

impl MergeReport {
    /// Fraction of accepted links confirmed by the ground truth, if
    /// anything was accepted.
    pub fn true_ratio(&self) -> Option<f64> {
        (self.accepted > 0).then(|| self.true_links as f64 / self.accepted as f64)
    }
}

/// Mutual-nearest-neighbor link discovery with an epoch-dependent
/// acceptance policy.
#[derive(Debug, Clone, Copy)]
pub struct LinkAugmenter {
    step: usize,
    full_accept_cycle: usize,
    chunk_size: usize,
}

impl LinkAugmenter {
    /// Default chunk size for the pairwise-distance pass; bounds the
    /// transient distance matrix to `chunk_size * right_pool` entries.
    pub const DEFAULT_CHUNK_SIZE: usize = 1000;

    pub fn from_config(config: &AlignConfig) -> Self {
        Self {
            step: config.semi_learn_step.max(1),
            full_accept_cycle: config.semi_full_accept_cycle.max(1),
            chunk_size: Self::DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// A trigger epoch accepts every mutual match of the round; any
    /// other epoch additionally requires the match to have survived
    /// the previous round (hysteresis). A cycle of 1 makes every
    /// augmentation interval a trigger epoch.
    pub fn is_trigger_epoch(&self, epoch: usize) -> bool {
        if self.full_accept_cycle == 1 {
            return (epoch + 1) % self.step == 0;
        }
        (epoch + 1) % (self.full_accept_cycle * self.step) == self.step
    }

    /// Propose the next candidate set from the current joint
    /// embeddings. Returns the existing candidates unchanged when
    /// either pool is empty.
    pub fn propose_links(
        &self,
        joint: &Tensor,
        left_pool: &[u32],
        right_pool: &[u32],
        candidates: &[AlignmentPair],
        epoch: usize,
    ) -> AlignResult<Vec<AlignmentPair>> {
        if left_pool.is_empty() || right_pool.is_empty() {
            return Ok(candidates.to_vec());
        }
        let rows = joint.dim(0).map_err(map_candle)?;
        for &id in left_pool.iter().chain(right_pool.iter()) {
            if id as usize >= rows {
                return Err(AlignError::ShapeMismatch {
                    context: "link augmentation pools".to_string(),
                    expected: id as usize + 1,
                    actual: rows,
                });
            }
        }

        let (nearest_right, nearest_left) =
            self.mutual_argmins(joint, left_pool, right_pool)?;

        let mutual: Vec<AlignmentPair> = nearest_right
            .iter()
            .enumerate()
            .filter(|&(i, &p)| nearest_left[p] == i)
            .map(|(i, &p)| AlignmentPair::new(left_pool[i], right_pool[p]))
            .collect();

        let accepted = if self.is_trigger_epoch(epoch) {
            mutual
        } else {
            let previous: HashSet<AlignmentPair> = candidates.iter().copied().collect();
            mutual
                .into_iter()
                .filter(|pair| previous.contains(pair))
                .collect()
        };
        tracing::debug!(
            epoch,
            candidates = accepted.len(),
            trigger = self.is_trigger_epoch(epoch),
            "link augmentation round"
        );
        Ok(accepted)
    }

    /// Row argmin per left entity and column argmin per right entity
    /// of the squared-Euclidean distance matrix, computed in
    /// fixed-size chunks of left rows.
    fn mutual_argmins(
        &self,
        joint: &Tensor,
        left_pool: &[u32],
        right_pool: &[u32],
    ) -> AlignResult<(Vec<usize>, Vec<usize>)> {
        let device = joint.device();
        let l_idx =
            Tensor::from_slice(left_pool, (left_pool.len(),), device).map_err(map_candle)?;
        let r_idx =
            Tensor::from_slice(right_pool, (right_pool.len(),), device).map_err(map_candle)?;
        let left = joint.index_select(&l_idx, 0).map_err(map_candle)?;
        let right = joint.index_select(&r_idx, 0).map_err(map_candle)?;

        let right_sq = right
            .sqr()
            .map_err(map_candle)?
            .sum(1)
            .map_err(map_candle)?
            .unsqueeze(0)
            .map_err(map_candle)?;

        let n = left_pool.len();
        let m = right_pool.len();
        let mut nearest_right = Vec::with_capacity(n);
        let mut col_best: Vec<(f32, usize)> = vec![(f32::INFINITY, 0); m];

        let mut start = 0;
        while start < n {
            let len = self.chunk_size.min(n - start);
            let chunk = left.narrow(0, start, len).map_err(map_candle)?;
            let chunk_sq = chunk
                .sqr()
                .map_err(map_candle)?
                .sum(1)
                .map_err(map_candle)?
                .unsqueeze(1)
                .map_err(map_candle)?;
            let cross = chunk
                .matmul(&right.t().map_err(map_candle)?)
                .map_err(map_candle)?;
            let distances = chunk_sq
                .broadcast_add(&right_sq)
                .map_err(map_candle)?
                .sub(&cross.affine(2.0, 0.0).map_err(map_candle)?)
                .map_err(map_candle)?
                .to_vec2::<f32>()
                .map_err(map_candle)?;

            for (offset, row) in distances.iter().enumerate() {
                let mut best = (f32::INFINITY, 0usize);
                for (j, &d) in row.iter().enumerate() {
                    if d < best.0 {
                        best = (d, j);
                    }
                    if d < col_best[j].0 {
                        col_best[j] = (d, start + offset);
                    }
                }
                nearest_right.push(best.1);
            }
            start += len;
        }

        let nearest_left = col_best.into_iter().map(|(_, i)| i).collect();
        Ok((nearest_right, nearest_left))
    }

    /// Fold accepted candidate links into the training set, removing
    /// their endpoints from both pools and clearing the candidate
    /// buffer. Empty candidates (or an exhausted pool) is a reported
    /// no-op, not an error.
    pub fn merge(
        &self,
        train_set: &mut Vec<AlignmentPair>,
        candidates: &mut Vec<AlignmentPair>,
        left_pool: &mut Vec<u32>,
        right_pool: &mut Vec<u32>,
        ground_truth: &HashSet<AlignmentPair>,
    ) -> MergeReport {
        if candidates.is_empty() || left_pool.is_empty() || right_pool.is_empty() {
            tracing::info!("no candidate links to merge");
            return MergeReport {
                accepted: 0,
                true_links: 0,
                remaining_left: left_pool.len(),
                remaining_right: right_pool.len(),
            };
        }

        let accepted = candidates.len();
        let true_links = candidates
            .iter()
            .filter(|pair| ground_truth.contains(pair))
            .count();

        let left_drop: HashSet<u32> = candidates.iter().map(|p| p.left).collect();
        let right_drop: HashSet<u32> = candidates.iter().map(|p| p.right).collect();
        left_pool.retain(|id| !left_drop.contains(id));
        right_pool.retain(|id| !right_drop.contains(id));

        train_set.extend(candidates.iter().copied());
        candidates.clear();

        let report = MergeReport {
            accepted,
            true_links,
            remaining_left: left_pool.len(),
            remaining_right: right_pool.len(),
        };
        tracing::info!(
            accepted = report.accepted,
            true_links = report.true_links,
            true_ratio = report.true_ratio().unwrap_or(0.0),
            train_set = train_set.len(),
            remaining_left = report.remaining_left,
            remaining_right = report.remaining_right,
            "merged new alignment links"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn embedding_table(points: &[(u32, [f32; 2])], rows: usize) -> Tensor {
        let mut data = vec![0.0f32; rows * 2];
        for &(id, point) in points {
            data[id as usize * 2] = point[0];
            data[id as usize * 2 + 1] = point[1];
        }
        Tensor::from_slice(&data, (rows, 2), &Device::Cpu).unwrap()
    }

    fn augmenter() -> LinkAugmenter {
        LinkAugmenter::from_config(&AlignConfig::default())
    }

    /// step=5, cycle=5: epoch 4 satisfies (4+1) % 25 == 5.
    const TRIGGER_EPOCH: usize = 4;
    const PLAIN_EPOCH: usize = 0;

    #[test]
    fn trigger_epoch_schedule() {
        let aug = augmenter();
        assert!(aug.is_trigger_epoch(4));
        assert!(aug.is_trigger_epoch(29));
        assert!(!aug.is_trigger_epoch(0));
        assert!(!aug.is_trigger_epoch(9));
    }

    #[test]
    fn cycle_of_one_full_accepts_every_interval() {
        let config = AlignConfig {
            semi_learn_step: 1,
            semi_full_accept_cycle: 1,
            ..Default::default()
        };
        config.validate().unwrap();
        let aug = LinkAugmenter::from_config(&config);
        assert!((0..100).all(|epoch| aug.is_trigger_epoch(epoch)));

        // With a longer interval, trigger epochs are exactly the
        // interval boundaries.
        let config = AlignConfig {
            semi_learn_step: 3,
            semi_full_accept_cycle: 1,
            ..Default::default()
        };
        let aug = LinkAugmenter::from_config(&config);
        assert!(aug.is_trigger_epoch(2));
        assert!(aug.is_trigger_epoch(5));
        assert!(!aug.is_trigger_epoch(3));
    }

    #[test]
    fn one_sided_attraction_is_not_a_mutual_match() {
        // Entity 1's nearest right is 10 and 10's nearest left is 1,
        // while 2's nearest is 11 but 11's nearest left is 1 (not 2):
        // only (1, 10) is mutual.
        let joint = embedding_table(
            &[
                (1, [0.0, 0.0]),
                (2, [5.0, 5.0]),
                (10, [0.1, 0.0]),
                (11, [1.0, 1.0]),
            ],
            12,
        );
        let links = augmenter()
            .propose_links(&joint, &[1, 2], &[10, 11], &[], TRIGGER_EPOCH)
            .unwrap();
        assert_eq!(links, vec![AlignmentPair::new(1, 10)]);
    }

    fn two_mutual_table() -> Tensor {
        embedding_table(
            &[
                (1, [0.0, 0.0]),
                (2, [5.0, 5.0]),
                (10, [0.1, 0.0]),
                (11, [5.1, 5.0]),
            ],
            12,
        )
    }

    #[test]
    fn hysteresis_requires_two_consecutive_rounds() {
        let joint = two_mutual_table();
        let previous = vec![AlignmentPair::new(1, 10)];

        // Non-trigger epoch: (2, 11) is mutual this round but was not
        // in the previous candidates, so it is suppressed.
        let links = augmenter()
            .propose_links(&joint, &[1, 2], &[10, 11], &previous, PLAIN_EPOCH)
            .unwrap();
        assert_eq!(links, vec![AlignmentPair::new(1, 10)]);
    }

    #[test]
    fn trigger_epoch_accepts_all_mutual_matches() {
        let joint = two_mutual_table();
        let links = augmenter()
            .propose_links(&joint, &[1, 2], &[10, 11], &[], TRIGGER_EPOCH)
            .unwrap();
        assert_eq!(
            links,
            vec![AlignmentPair::new(1, 10), AlignmentPair::new(2, 11)]
        );
    }

    #[test]
    fn empty_pool_returns_candidates_unchanged() {
        let joint = two_mutual_table();
        let previous = vec![AlignmentPair::new(1, 10)];
        let links = augmenter()
            .propose_links(&joint, &[], &[10, 11], &previous, TRIGGER_EPOCH)
            .unwrap();
        assert_eq!(links, previous);
    }

    #[test]
    fn chunked_and_unchunked_agree() {
        let joint = embedding_table(
            &[
                (0, [0.0, 1.0]),
                (1, [1.0, 0.0]),
                (2, [2.0, 2.0]),
                (3, [0.0, 1.1]),
                (4, [1.1, 0.0]),
                (5, [2.1, 2.0]),
            ],
            6,
        );
        let left = [0, 1, 2];
        let right = [3, 4, 5];

        let whole = augmenter()
            .propose_links(&joint, &left, &right, &[], TRIGGER_EPOCH)
            .unwrap();
        let chunked = augmenter()
            .with_chunk_size(1)
            .propose_links(&joint, &left, &right, &[], TRIGGER_EPOCH)
            .unwrap();
        assert_eq!(whole, chunked);
        assert_eq!(whole.len(), 3);
    }

    #[test]
    fn pool_id_outside_embedding_is_fatal() {
        let joint = two_mutual_table();
        let err = augmenter()
            .propose_links(&joint, &[1, 99], &[10], &[], TRIGGER_EPOCH)
            .unwrap_err();
        assert!(matches!(err, AlignError::ShapeMismatch { .. }));
    }

    #[test]
    fn merge_moves_links_and_shrinks_pools_by_exactly_k() {
        let aug = augmenter();
        let mut train = vec![AlignmentPair::new(0, 9)];
        let mut candidates = vec![AlignmentPair::new(1, 10), AlignmentPair::new(2, 11)];
        let mut left_pool = vec![1, 2, 3];
        let mut right_pool = vec![10, 11, 12];
        let truth: HashSet<AlignmentPair> = [AlignmentPair::new(1, 10)].into_iter().collect();

        let report = aug.merge(&mut train, &mut candidates, &mut left_pool, &mut right_pool, &truth);

        assert_eq!(report.accepted, 2);
        assert_eq!(report.true_links, 1);
        assert_eq!(report.true_ratio(), Some(0.5));
        assert_eq!(train.len(), 3);
        assert_eq!(left_pool, vec![3]);
        assert_eq!(right_pool, vec![12]);
        assert!(candidates.is_empty());
        // No entity id remains in both a pool and the training set.
        for pair in &train {
            assert!(!left_pool.contains(&pair.left));
            assert!(!right_pool.contains(&pair.right));
        }
    }

    #[test]
    fn merge_with_no_candidates_is_a_reported_noop() {
        let aug = augmenter();
        let mut train = vec![AlignmentPair::new(0, 9)];
        let mut candidates = Vec::new();
        let mut left_pool = vec![1, 2];
        let mut right_pool = vec![10, 11];

        let report = aug.merge(
            &mut train,
            &mut candidates,
            &mut left_pool,
            &mut right_pool,
            &HashSet::new(),
        );

        assert_eq!(report.accepted, 0);
        assert_eq!(report.true_ratio(), None);
        assert_eq!(train.len(), 1);
        assert_eq!(left_pool, vec![1, 2]);
        assert_eq!(right_pool, vec![10, 11]);
    }
}
