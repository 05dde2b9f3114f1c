use chrono::{DateTime, Utc};

use crate::{
    db_types::{NewTip, Order, OrderId, SettlementStatus, Tip},
    traits::OrderFlowError,
};

#[allow(async_fn_in_trait)]
pub trait TipManagement {
    /// Adds a tip for `(order, recipient_kind)`, or replaces the existing one if it is still pending.
    ///
    /// Fails with [`OrderFlowError::AlreadySettled`] if a tip for the same recipient kind has been settled. The order's
    /// `tip_amount` is recomputed from its non-failed tips in the same transaction.
    async fn upsert_tip(
        &self,
        order: &Order,
        payer_id: &str,
        recipient_id: &str,
        tip: &NewTip,
        now: DateTime<Utc>,
    ) -> Result<Tip, OrderFlowError>;

    async fn fetch_tip(&self, id: i64) -> Result<Option<Tip>, OrderFlowError>;

    async fn fetch_tips_for_order(&self, order_id: OrderId) -> Result<Vec<Tip>, OrderFlowError>;

    /// Moves a pending tip to `status`. Recomputes the order's tip total and bumps its `event_seq`.
    ///
    /// Returns `Ok(None)` if the tip was not pending.
    async fn settle_tip(
        &self,
        id: i64,
        status: SettlementStatus,
        payment_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<(Tip, Order)>, OrderFlowError>;
}
