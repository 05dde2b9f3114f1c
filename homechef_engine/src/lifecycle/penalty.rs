use chrono::{DateTime, Utc};
use hc_common::Money;
use serde::{Deserialize, Serialize};

use crate::db_types::{CancellationPolicy, CancellationType, Order};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationOutcome {
    #[serde(rename = "type")]
    pub kind: CancellationType,
    pub penalty: Money,
    pub refund: Money,
    /// Seconds between placement and cancellation, for analytics.
    #[serde(skip)]
    pub seconds_to_cancel: i64,
}

/// Whether a customer cancel at `now` would be free.
///
/// The stored flag is authoritative: once the countdown has fired the window is closed, even if `now` is still before
/// the expiry timestamp. Conversely, a countdown that has not fired yet cannot extend the window past its expiry.
pub fn is_free_cancellation(order: &Order, now: DateTime<Utc>) -> bool {
    order.can_cancel_free && now <= order.countdown_expiry
}

/// The penalty the policy would charge on `charged`, ignoring the free window.
///
/// `clamp(charged * rate, min, max)`, rounded to the nearest minor unit and never more than the amount charged.
pub fn penalty_for(charged: Money, policy: &CancellationPolicy) -> Money {
    let raw = charged.scale(policy.penalty_rate);
    raw.clamp_between(policy.min_penalty, policy.max_penalty).min(charged).max(Money::default())
}

/// Computes the outcome of a customer cancel arriving at `now`. `refund + penalty` always equals the amount charged.
pub fn assess_cancellation(order: &Order, policy: &CancellationPolicy, now: DateTime<Utc>) -> CancellationOutcome {
    let charged = order.charged_amount();
    let seconds_to_cancel = (now - order.created_at).num_seconds().max(0);
    if is_free_cancellation(order, now) {
        CancellationOutcome { kind: CancellationType::Free, penalty: Money::default(), refund: charged, seconds_to_cancel }
    } else {
        let penalty = penalty_for(charged, policy);
        CancellationOutcome { kind: CancellationType::Penalty, penalty, refund: charged - penalty, seconds_to_cancel }
    }
}

#[cfg(test)]
mod test {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::lifecycle::test_fixtures::{order_in, policy};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn cancel_inside_window_is_free() {
        let order = order_in(crate::db_types::OrderStatusType::SentToChef, t0(), 450);
        let outcome = assess_cancellation(&order, &policy(30, 0.4), t0() + Duration::seconds(10));
        assert_eq!(outcome.kind, CancellationType::Free);
        assert_eq!(outcome.penalty, Money::default());
        assert_eq!(outcome.refund, Money::from_major(450));
        assert_eq!(outcome.seconds_to_cancel, 10);
    }

    #[test]
    fn cancel_on_the_expiry_instant_is_free() {
        let order = order_in(crate::db_types::OrderStatusType::SentToChef, t0(), 450);
        let outcome = assess_cancellation(&order, &policy(30, 0.4), t0() + Duration::seconds(30));
        assert_eq!(outcome.kind, CancellationType::Free);
    }

    #[test]
    fn cancel_after_window_pays_penalty() {
        let order = order_in(crate::db_types::OrderStatusType::SentToChef, t0(), 450);
        let outcome = assess_cancellation(&order, &policy(30, 0.4), t0() + Duration::seconds(45));
        assert_eq!(outcome.kind, CancellationType::Penalty);
        assert_eq!(outcome.penalty, Money::from_major(180));
        assert_eq!(outcome.refund, Money::from_major(270));
    }

    #[test]
    fn closed_flag_wins_over_timestamp() {
        let mut order = order_in(crate::db_types::OrderStatusType::SentToChef, t0(), 450);
        order.can_cancel_free = false;
        let outcome = assess_cancellation(&order, &policy(30, 0.4), t0() + Duration::seconds(5));
        assert_eq!(outcome.kind, CancellationType::Penalty);
    }

    #[test]
    fn penalty_is_clamped() {
        let p = policy(30, 0.4);
        assert_eq!(penalty_for(Money::from_major(50), &p), Money::from_major(20));
        assert_eq!(penalty_for(Money::from_major(5_000), &p), Money::from_major(500));
        // Never more than was charged
        assert_eq!(penalty_for(Money::from_major(10), &p), Money::from_major(10));
    }

    #[test]
    fn refund_and_penalty_sum_to_charged() {
        let p = policy(0, 0.37);
        for total in [1, 7, 99, 450, 1234, 99_999] {
            let mut order = order_in(crate::db_types::OrderStatusType::ChefAccepted, t0(), 0);
            order.total_amount = Money::from(total * 37 + 3);
            order.can_cancel_free = false;
            let outcome = assess_cancellation(&order, &p, t0() + Duration::seconds(1));
            assert_eq!(outcome.penalty + outcome.refund, order.total_amount);
        }
    }
}
