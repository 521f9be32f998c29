//! AB-test variants.

use serde::{Deserialize, Serialize};

use mailpulse_core::{BroadcastId, VariantId};

use crate::broadcast::EmailContent;
use crate::partition::PartitionError;

/// One weighted alternative of an AB-test broadcast.
///
/// `weight` is in percentage points of the filtered audience. Whatever the variants
/// do not claim (100 - sum of weights) is the final sample that later receives the
/// winner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbTestVariant {
    pub id: VariantId,
    pub broadcast_id: BroadcastId,
    pub weight: u32,
    pub content: EmailContent,
    /// Display order; also the last tie-break when picking a winner.
    pub position: u32,
}

impl AbTestVariant {
    pub fn new(broadcast_id: BroadcastId, weight: u32, position: u32, content: EmailContent) -> Self {
        Self {
            id: VariantId::new(),
            broadcast_id,
            weight,
            content,
            position,
        }
    }
}

/// Check the variant set of an AB test: at least one variant and weights summing to
/// at most 100. A zero weight is allowed; that variant is sent to nobody.
pub fn validate_variants(variants: &[AbTestVariant]) -> Result<(), PartitionError> {
    if variants.is_empty() {
        return Err(PartitionError::NoVariants);
    }
    let weights: Vec<u32> = variants.iter().map(|v| v.weight).collect();
    crate::partition::validate_weights(&weights)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variant(weight: u32, position: u32) -> AbTestVariant {
        AbTestVariant::new(
            BroadcastId::new(),
            weight,
            position,
            EmailContent::new("a@b.c", "s", "h"),
        )
    }

    #[test]
    fn accepts_weights_up_to_one_hundred() {
        assert!(validate_variants(&[variant(20, 0), variant(30, 1)]).is_ok());
        assert!(validate_variants(&[variant(50, 0), variant(50, 1)]).is_ok());
    }

    #[test]
    fn rejects_empty_and_oversubscribed_sets() {
        assert_eq!(validate_variants(&[]), Err(PartitionError::NoVariants));
        assert!(validate_variants(&[variant(0, 0), variant(100, 1)]).is_ok());
        assert_eq!(
            validate_variants(&[variant(60, 0), variant(41, 1)]),
            Err(PartitionError::WeightsExceed { sum: 101 })
        );
    }
}
