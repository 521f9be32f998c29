//! Weighted partitioning of a sorted contact list.
//!
//! For weights `w_1..w_k` (sum at most 100) over `T` contacts:
//!
//! ```text
//! size_i   = floor(w_i * T / 100)
//! offset_i = size_1 + .. + size_{i-1}
//! final    = T - sum(size_i), starting where the last variant ends
//! ```
//!
//! Every variant rounds down, so no variant ever exceeds its configured share and the
//! final sample absorbs all rounding remainder.

use std::ops::Range;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PartitionError {
    #[error("an AB test needs at least one variant")]
    NoVariants,

    #[error("variant weights sum to {sum}, above 100")]
    WeightsExceed { sum: u32 },
}

/// Contiguous range of positions in the sorted contact list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slice {
    pub offset: usize,
    pub len: usize,
}

impl Slice {
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.len
    }

    pub fn end(&self) -> usize {
        self.offset + self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPlan<K> {
    pub total: usize,
    pub variants: Vec<(K, Slice)>,
    pub final_sample: Slice,
}

impl<K> PartitionPlan<K> {
    /// Contacts assigned to explicit variants.
    pub fn assigned(&self) -> usize {
        self.variants.iter().map(|(_, s)| s.len).sum()
    }
}

pub(crate) fn validate_weights(weights: &[u32]) -> Result<(), PartitionError> {
    let sum = weights.iter().fold(0u32, |acc, w| acc.saturating_add(*w));
    if sum > 100 {
        return Err(PartitionError::WeightsExceed { sum });
    }
    Ok(())
}

/// Split `total` sorted contacts between weighted variants and the final sample.
pub fn plan_partitions<K: Clone>(
    weights: &[(K, u32)],
    total: usize,
) -> Result<PartitionPlan<K>, PartitionError> {
    if weights.is_empty() {
        return Err(PartitionError::NoVariants);
    }
    let raw: Vec<u32> = weights.iter().map(|(_, w)| *w).collect();
    validate_weights(&raw)?;

    let mut offset = 0usize;
    let mut variants = Vec::with_capacity(weights.len());
    for (key, weight) in weights {
        // Integer form of floor(w / 100 * T); exact for any T.
        let len = ((u128::from(*weight) * total as u128) / 100) as usize;
        variants.push((key.clone(), Slice { offset, len }));
        offset += len;
    }

    Ok(PartitionPlan {
        total,
        variants,
        final_sample: Slice {
            offset,
            len: total - offset,
        },
    })
}

/// Split a slice into consecutive ranges of at most `batch_size` positions.
pub fn batches(slice: Slice, batch_size: usize) -> impl Iterator<Item = Range<usize>> {
    let step = batch_size.max(1);
    let end = slice.end();
    (slice.offset..end)
        .step_by(step)
        .map(move |start| start..(start + step).min(end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn twenty_thirty_split_of_one_thousand() {
        let plan = plan_partitions(&[("a", 20), ("b", 30)], 1000).unwrap();

        assert_eq!(plan.variants[0].1.range(), 0..200);
        assert_eq!(plan.variants[1].1.range(), 200..500);
        assert_eq!(plan.final_sample.range(), 500..1000);
        assert_eq!(plan.final_sample.len, 500);
    }

    #[test]
    fn single_full_weight_variant_sends_to_everyone() {
        let plan = plan_partitions(&[((), 100)], 37).unwrap();
        assert_eq!(plan.variants[0].1.range(), 0..37);
        assert!(plan.final_sample.is_empty());
        assert_eq!(plan.final_sample.offset, 37);
    }

    #[test]
    fn empty_audience_yields_empty_slices() {
        let plan = plan_partitions(&[("a", 10), ("b", 10)], 0).unwrap();
        assert!(plan.variants.iter().all(|(_, s)| s.is_empty()));
        assert!(plan.final_sample.is_empty());
    }

    #[test]
    fn rounding_remainder_goes_to_final_sample() {
        // 33% of 10 = 3.3 -> 3 each; final sample takes 10 - 9 = 1.
        let plan = plan_partitions(&[(1, 33), (2, 33), (3, 33)], 10).unwrap();
        let sizes: Vec<_> = plan.variants.iter().map(|(_, s)| s.len).collect();
        assert_eq!(sizes, vec![3, 3, 3]);
        assert_eq!(plan.final_sample, Slice { offset: 9, len: 1 });
    }

    #[test]
    fn rejects_invalid_weights() {
        assert_eq!(plan_partitions::<u8>(&[], 10), Err(PartitionError::NoVariants));
        assert_eq!(
            plan_partitions(&[(1, 70), (2, 31)], 10),
            Err(PartitionError::WeightsExceed { sum: 101 })
        );
    }

    #[test]
    fn zero_weight_variant_gets_an_empty_slice() {
        let plan = plan_partitions(&[("a", 40), ("b", 0), ("c", 10)], 100).unwrap();
        assert_eq!(plan.variants[0].1.range(), 0..40);
        assert!(plan.variants[1].1.is_empty());
        assert_eq!(plan.variants[1].1.offset, 40);
        assert_eq!(plan.variants[2].1.range(), 40..50);
        assert_eq!(plan.final_sample.range(), 50..100);
        assert_eq!(batches(plan.variants[1].1, 75).count(), 0);
    }

    #[test]
    fn batches_cover_slice_without_overlap() {
        let ranges: Vec<_> = batches(Slice { offset: 200, len: 300 }, 75).collect();
        assert_eq!(ranges, vec![200..275, 275..350, 350..425, 425..500]);

        let ranges: Vec<_> = batches(Slice { offset: 0, len: 5 }, 2).collect();
        assert_eq!(ranges, vec![0..2, 2..4, 4..5]);

        assert_eq!(batches(Slice { offset: 10, len: 0 }, 75).count(), 0);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        fn weight_sets() -> impl Strategy<Value = Vec<u32>> {
            // Every arm sums to at most 100 by construction.
            prop_oneof![
                (0u32..=100).prop_map(|w| vec![w]),
                prop::collection::vec(1u32..=50, 2),
                prop::collection::vec(0u32..=20, 1..6),
            ]
        }

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 1000,
                ..ProptestConfig::default()
            })]

            /// Property: variant sizes plus the final sample add up to T exactly.
            #[test]
            fn partition_conserves_total(weights in weight_sets(), total in 0usize..100_000) {
                let keyed: Vec<_> = weights.iter().copied().enumerate().collect();
                let plan = plan_partitions(&keyed, total).unwrap();

                prop_assert_eq!(plan.assigned() + plan.final_sample.len, total);
            }

            /// Property: slices are contiguous, ordered and never exceed their share.
            #[test]
            fn slices_are_contiguous_and_within_share(weights in weight_sets(), total in 0usize..100_000) {
                let keyed: Vec<_> = weights.iter().copied().enumerate().collect();
                let plan = plan_partitions(&keyed, total).unwrap();

                let mut expected_offset = 0;
                for ((_, slice), weight) in plan.variants.iter().zip(&weights) {
                    prop_assert_eq!(slice.offset, expected_offset);
                    prop_assert!(slice.len as u128 * 100 <= u128::from(*weight) * total as u128);
                    expected_offset = slice.end();
                }
                prop_assert_eq!(plan.final_sample.offset, expected_offset);
                prop_assert_eq!(plan.final_sample.end(), total);
            }

            /// Property: batching visits every position of a slice exactly once.
            #[test]
            fn batches_partition_slice(offset in 0usize..10_000, len in 0usize..5_000, size in 1usize..1_200) {
                let slice = Slice { offset, len };
                let mut next = offset;
                for range in batches(slice, size) {
                    prop_assert_eq!(range.start, next);
                    prop_assert!(range.len() <= size && !range.is_empty());
                    next = range.end;
                }
                prop_assert_eq!(next, slice.end());
            }
        }
    }
}
