use chrono::{DateTime, Utc};
use hc_common::Money;
use serde::Serialize;

use crate::{
    db_types::{CancellationPolicy, Order},
    lifecycle::penalty::{is_free_cancellation, penalty_for},
};

/// A customer-facing view of the free-cancellation countdown.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CountdownStatus {
    pub is_active: bool,
    /// Whole seconds left in the free window, rounded up. Zero once the window has closed.
    pub time_remaining: i64,
    /// How far through the window we are, 0 - 100.
    pub progress_pct: f64,
    pub can_cancel_free: bool,
    /// What a cancel would cost once the window has closed.
    pub penalty_after_expiry: Money,
    pub countdown_expiry: DateTime<Utc>,
}

impl CountdownStatus {
    pub fn new(order: &Order, policy: &CancellationPolicy, now: DateTime<Utc>) -> Self {
        let eligible = order.status.is_cancellable();
        let can_cancel_free = eligible && is_free_cancellation(order, now);
        let remaining_ms = if can_cancel_free { (order.countdown_expiry - now).num_milliseconds().max(0) } else { 0 };
        let window_ms = (order.countdown_expiry - order.created_at).num_milliseconds();
        let progress_pct = if window_ms <= 0 || !can_cancel_free {
            100.0
        } else {
            let elapsed = (window_ms - remaining_ms) as f64;
            ((elapsed / window_ms as f64) * 10_000.0).round() / 100.0
        };
        Self {
            is_active: can_cancel_free,
            time_remaining: (remaining_ms + 999) / 1000,
            progress_pct,
            can_cancel_free,
            penalty_after_expiry: penalty_for(order.charged_amount(), policy),
            countdown_expiry: order.countdown_expiry,
        }
    }
}
