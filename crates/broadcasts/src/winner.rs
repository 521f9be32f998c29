//! Winner selection for AB tests.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use mailpulse_core::VariantId;

/// Engagement counters for one variant, as reported by the analytics side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantEngagement {
    pub variant_id: VariantId,
    pub position: u32,
    pub delivered: u64,
    pub opened: u64,
    pub clicked: u64,
}

/// Compare `a/b` against `c/d` without floating point; an empty denominator counts
/// as a zero rate.
fn cmp_rate(a: u64, b: u64, c: u64, d: u64) -> Ordering {
    match (b, d) {
        (0, 0) => Ordering::Equal,
        (0, _) => 0u128.cmp(&u128::from(c)),
        (_, 0) => u128::from(a).cmp(&0),
        _ => (u128::from(a) * u128::from(d)).cmp(&(u128::from(c) * u128::from(b))),
    }
}

/// Highest open rate wins, then highest click rate, then the earliest position.
pub fn pick_winner(engagement: &[VariantEngagement]) -> Option<VariantId> {
    engagement
        .iter()
        .max_by(|x, y| {
            cmp_rate(x.opened, x.delivered, y.opened, y.delivered)
                .then_with(|| cmp_rate(x.clicked, x.delivered, y.clicked, y.delivered))
                .then_with(|| y.position.cmp(&x.position))
        })
        .map(|e| e.variant_id)
}
