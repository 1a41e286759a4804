//! Action sizing

use crate::ledger::fixed_point::FixedAmount;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanDecision {
    Execute { amount: FixedAmount, clamped: bool },
    /// Nothing to submit this interval
    BelowMinimum { amount: FixedAmount },
}

/// `balance * rate_percent / 100`, clamped to `max_per_interval`, checked against `min_trigger`
pub fn plan_amount(
    rate_percent: f64,
    balance: FixedAmount,
    max_per_interval: Option<FixedAmount>,
    min_trigger: FixedAmount,
) -> PlanDecision {
    let raw = balance.mul_percent(rate_percent);
    let (amount, clamped) = match max_per_interval {
        Some(max) if raw > max => (max, true),
        _ => (raw, false),
    };
    if !amount.is_positive() || amount < min_trigger {
        return PlanDecision::BelowMinimum { amount };
    }
    PlanDecision::Execute { amount, clamped }
}

/// Balance left after keeping `reserve` for fees
pub fn spendable(balance: FixedAmount, reserve: FixedAmount) -> FixedAmount {
    balance.saturating_sub(reserve).max(FixedAmount::ZERO)
}
