//! Target selection and flow splitting shared by forwarding nodes.

use super::{Emission, FlowClass, Neighbor};

/// Downstream neighbors currently up.
pub fn up_targets(neighbors: &[Neighbor]) -> Vec<Neighbor> {
    neighbors.iter().copied().filter(Neighbor::is_up).collect()
}

/// Write targets: up non-replica neighbors, or every up neighbor if none qualify.
pub fn write_targets(up: &[Neighbor]) -> Vec<Neighbor> {
    let primaries: Vec<Neighbor> = up.iter().copied().filter(|n| !n.is_replica).collect();
    if primaries.is_empty() {
        up.to_vec()
    } else {
        primaries
    }
}

/// Average latency of the given neighbors, 0 when there are none.
pub fn average_latency(neighbors: &[Neighbor]) -> f64 {
    if neighbors.is_empty() {
        return 0.0;
    }
    neighbors.iter().map(|n| n.latency).sum::<f64>() / neighbors.len() as f64
}

/// Splits `amount` evenly across `targets`.
pub fn split_even(amount: f64, targets: &[Neighbor], class: FlowClass, out: &mut Vec<Emission>) {
    if amount <= 0.0 || targets.is_empty() {
        return;
    }
    let share = amount / targets.len() as f64;
    out.extend(targets.iter().map(|t| Emission {
        target: t.index,
        class,
        amount: share,
    }));
}

/// Splits `amount` in proportion to each target's capacity.
///
/// Uncapped targets (capacity 0) get a floor weight of 1. When every weight
/// is equal the split is done in whole requests via [`discrete_shares`].
pub fn split_weighted(
    amount: f64,
    targets: &[Neighbor],
    class: FlowClass,
    out: &mut Vec<Emission>,
) {
    if amount <= 0.0 || targets.is_empty() {
        return;
    }

    let weights: Vec<f64> = targets.iter().map(|t| weight(t.max_rps)).collect();
    let uniform = weights.windows(2).all(|w| w[0] == w[1]);

    if uniform {
        let shares = discrete_shares(amount, targets.len());
        out.extend(
            targets
                .iter()
                .zip(shares)
                .filter(|(_, share)| *share > 0.0)
                .map(|(t, share)| Emission {
                    target: t.index,
                    class,
                    amount: share,
                }),
        );
        return;
    }

    let total_weight: f64 = weights.iter().sum();
    out.extend(targets.iter().zip(&weights).map(|(t, w)| Emission {
        target: t.index,
        class,
        amount: amount * w / total_weight,
    }));
}

/// Rounds `amount` to whole requests and deals them out evenly.
///
/// Each slot gets `total / slots`; the remainder goes one each to the first
/// slots so the shares sum exactly to the rounded total.
pub fn discrete_shares(amount: f64, slots: usize) -> Vec<f64> {
    if slots == 0 {
        return Vec::new();
    }
    let total = amount.max(0.0).round() as u64;
    let slots_u64 = slots as u64;
    let base = total / slots_u64;
    let remainder = (total % slots_u64) as usize;
    (0..slots)
        .map(|i| (base + u64::from(i < remainder)) as f64)
        .collect()
}

fn weight(capacity: f64) -> f64 {
    if capacity.is_finite() && capacity > 0.0 {
        capacity
    } else {
        1.0
    }
}
