//! Destination volume computation.

use copy_core::types::{BrokerLimits, RuleSet, SizingMode};
use rust_decimal::Decimal;

/// Throttle applied to proportional sizing once the daily loss crosses
/// the rule's soft threshold.
const LOSS_THROTTLE: Decimal = Decimal::from_parts(7, 0, 0, false, 1); // 0.7

/// Compute the destination volume for a source volume under the active
/// rule set. Returns zero when the result is untradeable after broker
/// clamping; callers treat that as an `invalid-size` rejection.
pub fn compute_volume(
    source_volume: Decimal,
    rule: &RuleSet,
    daily_loss: Decimal,
    limits: &BrokerLimits,
) -> Decimal {
    let raw = match &rule.sizing {
        SizingMode::Proportional { multiplier } => {
            let mut multiplier = *multiplier;
            if daily_loss > rule.soft_loss_threshold() {
                multiplier *= LOSS_THROTTLE;
            }
            (source_volume * multiplier).round_dp(2)
        }
        SizingMode::Fixed { lots } => *lots,
        SizingMode::Dynamic { tiers } => {
            let mut sorted: Vec<_> = tiers.iter().collect();
            sorted.sort_by(|a, b| a.base_lots.cmp(&b.base_lots));
            let tier = sorted
                .iter()
                .find(|t| source_volume <= t.base_lots)
                .or_else(|| sorted.last())
                .copied();
            match tier {
                Some(tier) => (source_volume * tier.multiplier)
                    .round_dp(2)
                    .min(tier.max_lots),
                None => Decimal::ZERO,
            }
        }
    };

    clamp_to_limits(raw, limits)
}

/// Clamp to `[min_lot, max_lot]` and snap down onto the lot step.
/// Anything below the minimum is untradeable and becomes zero.
pub fn clamp_to_limits(volume: Decimal, limits: &BrokerLimits) -> Decimal {
    if volume < limits.min_lot {
        return Decimal::ZERO;
    }
    let capped = volume.min(limits.max_lot);
    let snapped = snap_to_step(capped, limits.lot_step);
    if snapped < limits.min_lot {
        Decimal::ZERO
    } else {
        snapped
    }
}

/// Largest multiple of `step` not exceeding `volume`.
pub fn snap_to_step(volume: Decimal, step: Decimal) -> Decimal {
    if step.is_zero() {
        return volume;
    }
    (volume / step).floor() * step
}
