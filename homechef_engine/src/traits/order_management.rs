use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{
    db_types::{
        CancellationPolicy,
        NewOrder,
        Order,
        OrderId,
        OrderItem,
        OrderStatusType,
        PaymentStatus,
        StatusHistoryEntry,
    },
    lifecycle::Transition,
    validation::ValidationErrors,
};

/// Persistence for orders, their items and their status history.
///
/// Implementations must make every method atomic. In particular, [`OrderManagement::apply_transition`] must commit
/// the order update, its status-history row and any analytics or tip side effects together, or not at all.
#[allow(async_fn_in_trait)]
pub trait OrderManagement {
    /// Stores a freshly placed order in the `payment_confirmed` state, along with its items and the first
    /// status-history entry, and counts it in the day's cancellation analytics bucket.
    ///
    /// The countdown expiry is computed from `policy`, which is recorded on the order.
    async fn insert_order(
        &self,
        customer_id: &str,
        order: NewOrder,
        policy: &CancellationPolicy,
        now: DateTime<Utc>,
    ) -> Result<Order, OrderFlowError>;

    async fn fetch_order(&self, id: OrderId) -> Result<Option<Order>, OrderFlowError>;

    async fn fetch_order_items(&self, id: OrderId) -> Result<Vec<OrderItem>, OrderFlowError>;

    /// Returns the status history for the order, oldest first.
    async fn fetch_status_history(&self, id: OrderId) -> Result<Vec<StatusHistoryEntry>, OrderFlowError>;

    /// Applies a planned transition with compare-and-swap semantics.
    ///
    /// The update only happens if the stored order still has the `status` and `event_seq` of `expected`. On success
    /// `event_seq` is incremented and the updated order is returned. `Ok(None)` means another writer got there first.
    async fn apply_transition(
        &self,
        expected: &Order,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<Option<Order>, OrderFlowError>;

    /// All orders whose free-cancellation flag is still set, ordered by countdown expiry.
    async fn fetch_orders_with_open_countdown(&self) -> Result<Vec<Order>, OrderFlowError>;

    /// Records the payment collaborator's verdict on an order. Only applies if the order's payment status is still
    /// `expected`. Bumps `event_seq` when it applies.
    async fn update_payment_status(
        &self,
        id: OrderId,
        expected: PaymentStatus,
        new_status: PaymentStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Order>, OrderFlowError>;
}

#[derive(Debug, Clone, Error)]
pub enum OrderFlowError {
    #[error("{0}")]
    ValidationError(#[from] ValidationErrors),
    #[error("The requested order {0} does not exist")]
    OrderNotFound(OrderId),
    #[error("The requested tip (id {0}) does not exist")]
    TipNotFound(i64),
    #[error("There is no active cancellation policy")]
    NoActivePolicy,
    #[error("Cancellation policy {0} does not exist")]
    PolicyNotFound(i64),
    #[error("Not allowed. {0}")]
    Forbidden(String),
    #[error("Cannot {command} while the order is {observed}. {reason}")]
    InvalidTransition { command: String, observed: OrderStatusType, reason: String },
    #[error("Tip {0} has already been settled")]
    AlreadySettled(i64),
    #[error("The order was modified concurrently. {0}")]
    Conflict(String),
    #[error("The store is temporarily unavailable. {0}")]
    StoreUnavailable(String),
    #[error("We have an internal database engine (configuration/uptime etc.) : {0}")]
    DatabaseError(String),
}

impl OrderFlowError {
    pub fn invalid_transition<C: Into<String>, R: Into<String>>(
        command: C,
        observed: OrderStatusType,
        reason: R,
    ) -> Self {
        Self::InvalidTransition { command: command.into(), observed, reason: reason.into() }
    }
}

impl From<sqlx::Error> for OrderFlowError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                OrderFlowError::StoreUnavailable(e.to_string())
            },
            e => OrderFlowError::DatabaseError(e.to_string()),
        }
    }
}
