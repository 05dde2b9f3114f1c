use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};

use chrono::{DateTime, NaiveDate, Utc};
pub use hc_common::Money;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
#[error("Invalid value: {0}")]
pub struct ConversionError(String);

//--------------------------------------        OrderId        ---------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Type, Serialize, Deserialize)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct OrderId(pub i64);

impl OrderId {
    pub fn value(&self) -> i64 {
        self.0
    }
}

impl From<i64> for OrderId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl Display for OrderId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

//--------------------------------------   OrderStatusType     ---------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Type, Serialize, Deserialize)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OrderStatusType {
    /// Payment was authorised and the order has been recorded. Initial state.
    PaymentConfirmed,
    /// The chef has been notified and the free-cancellation countdown is running.
    SentToChef,
    ChefAccepted,
    /// Terminal. The customer is refunded in full.
    ChefDeclined,
    Preparing,
    ReadyForPickup,
    AssignedToDelivery,
    PickedUp,
    OutForDelivery,
    /// Terminal.
    Delivered,
    /// Terminal. Penalty and refund are recorded on the order.
    Cancelled,
}

impl OrderStatusType {
    pub const ALL: [OrderStatusType; 11] = [
        Self::PaymentConfirmed,
        Self::SentToChef,
        Self::ChefAccepted,
        Self::ChefDeclined,
        Self::Preparing,
        Self::ReadyForPickup,
        Self::AssignedToDelivery,
        Self::PickedUp,
        Self::OutForDelivery,
        Self::Delivered,
        Self::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PaymentConfirmed => "payment_confirmed",
            Self::SentToChef => "sent_to_chef",
            Self::ChefAccepted => "chef_accepted",
            Self::ChefDeclined => "chef_declined",
            Self::Preparing => "preparing",
            Self::ReadyForPickup => "ready_for_pickup",
            Self::AssignedToDelivery => "assigned_to_delivery",
            Self::PickedUp => "picked_up",
            Self::OutForDelivery => "out_for_delivery",
            Self::Delivered => "delivered",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ChefDeclined | Self::Delivered | Self::Cancelled)
    }

    /// The states from which a customer may cancel. These are also the only states in which the free-cancellation
    /// flag can be set.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, Self::PaymentConfirmed | Self::SentToChef | Self::ChefAccepted)
    }

    /// True for `chef_accepted` and every non-terminal state that follows it.
    pub fn is_chef_committed(&self) -> bool {
        matches!(
            self,
            Self::ChefAccepted
                | Self::Preparing
                | Self::ReadyForPickup
                | Self::AssignedToDelivery
                | Self::PickedUp
                | Self::OutForDelivery
        )
    }
}

impl Display for OrderStatusType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatusType {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| ConversionError(format!("Invalid order status: {s}")))
    }
}

//--------------------------------------    PaymentStatus     ---------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Type, Serialize, Deserialize)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Authorized,
    Captured,
    Failed,
    Refunded,
    PartiallyRefunded,
}

impl Display for PaymentStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Authorized => "authorized",
            Self::Captured => "captured",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
            Self::PartiallyRefunded => "partially_refunded",
        };
        f.write_str(s)
    }
}

//--------------------------------------   CancellationType    ---------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Type, Serialize, Deserialize)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CancellationType {
    Free,
    Penalty,
}

impl Display for CancellationType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Free => f.write_str("free"),
            Self::Penalty => f.write_str("penalty"),
        }
    }
}

//--------------------------------------        Role          ---------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Type, Serialize, Deserialize)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Customer,
    Chef,
    Delivery,
    Admin,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Customer, Role::Chef, Role::Delivery, Role::Admin];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Chef => "chef",
            Self::Delivery => "delivery",
            Self::Admin => "admin",
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|r| r.as_str() == s.trim().to_ascii_lowercase())
            .copied()
            .ok_or_else(|| ConversionError(format!("Invalid role: {s}")))
    }
}

//--------------------------------------   Principal / Actor   ---------------------------------------------------------
/// An authenticated caller, as asserted by the external auth service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: String,
    pub role: Role,
}

impl Principal {
    pub fn new<S: Into<String>>(user_id: S, role: Role) -> Self {
        Self { user_id: user_id.into(), role }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

impl Display for Principal {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.role, self.user_id)
    }
}

/// Whoever is driving a state transition. Scheduled transitions are driven by the system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    System,
    User(Principal),
}

impl Actor {
    pub fn principal(&self) -> Option<&Principal> {
        match self {
            Actor::System => None,
            Actor::User(p) => Some(p),
        }
    }
}

impl From<Principal> for Actor {
    fn from(p: Principal) -> Self {
        Self::User(p)
    }
}

impl Display for Actor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Actor::System => f.write_str("system"),
            Actor::User(p) => write!(f, "{p}"),
        }
    }
}

//--------------------------------------        Order         ---------------------------------------------------------
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub customer_id: String,
    pub chef_id: String,
    pub delivery_partner_id: Option<String>,
    pub subtotal: Money,
    pub delivery_fee: Money,
    pub tax_amount: Money,
    pub tip_amount: Money,
    /// The amount charged to the customer for the order (subtotal + delivery fee + tax). Tips are settled separately.
    pub total_amount: Money,
    pub penalty_amount: Money,
    pub refund_amount: Money,
    pub payment_id: String,
    pub payment_status: PaymentStatus,
    pub status: OrderStatusType,
    /// The cancellation policy in force when the order was placed.
    pub policy_id: i64,
    pub countdown_expiry: DateTime<Utc>,
    pub can_cancel_free: bool,
    pub cancellation_type: Option<CancellationType>,
    pub cancellation_reason: Option<String>,
    pub decline_reason: Option<String>,
    pub estimated_prep_minutes: Option<i64>,
    pub delivery_proof: Option<String>,
    pub special_instructions: Option<String>,
    pub sent_to_chef_at: Option<DateTime<Utc>>,
    pub chef_accepted_at: Option<DateTime<Utc>>,
    pub pickup_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Incremented by every committed change that emits an event. Clients use it to order frames.
    pub event_seq: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn is_participant(&self, user_id: &str) -> bool {
        self.customer_id == user_id || self.chef_id == user_id || self.delivery_partner_id.as_deref() == Some(user_id)
    }

    /// Participants may see the order; admins may see everything.
    pub fn is_visible_to(&self, principal: &Principal) -> bool {
        principal.is_admin() || self.is_participant(&principal.user_id)
    }

    pub fn charged_amount(&self) -> Money {
        self.total_amount
    }
}

#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: i64,
    pub order_id: OrderId,
    pub dish_id: String,
    pub quantity: i64,
    pub unit_price: Money,
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOrderItem {
    pub dish_id: String,
    pub quantity: i64,
    pub unit_price: Money,
    #[serde(default)]
    pub instructions: Option<String>,
}

impl NewOrderItem {
    /// `None` if the line overflows.
    pub fn line_total(&self) -> Option<Money> {
        self.unit_price.checked_mul(self.quantity)
    }
}

/// A request to place an order. The customer is taken from the authenticated principal, not the body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOrder {
    pub chef_id: String,
    pub items: Vec<NewOrderItem>,
    #[serde(default)]
    pub delivery_fee: Money,
    #[serde(default)]
    pub tax_amount: Money,
    /// Reference to the payment authorised by the payment collaborator.
    pub payment_id: String,
    #[serde(default)]
    pub special_instructions: Option<String>,
}

impl NewOrder {
    /// The sum of the line totals, or `None` if it overflows.
    pub fn subtotal(&self) -> Option<Money> {
        self.items.iter().try_fold(Money::default(), |acc, item| acc.checked_add(item.line_total()?))
    }

    pub fn total(&self) -> Option<Money> {
        self.subtotal()?.checked_add(self.delivery_fee)?.checked_add(self.tax_amount)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderWithItems {
    #[serde(flatten)]
    pub order: Order,
    pub items: Vec<OrderItem>,
}

//--------------------------------------    StatusHistory     ---------------------------------------------------------
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    pub id: i64,
    pub order_id: OrderId,
    pub status: OrderStatusType,
    pub message: String,
    pub actor: String,
    pub created_at: DateTime<Utc>,
}

//--------------------------------------         Tips         ---------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Type, Serialize, Deserialize)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TipRecipient {
    Chef,
    Delivery,
}

impl Display for TipRecipient {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Chef => f.write_str("chef"),
            Self::Delivery => f.write_str("delivery"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Type, Serialize, Deserialize)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SettlementStatus {
    Pending,
    Completed,
    Failed,
}

impl Display for SettlementStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Completed => f.write_str("completed"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Tip {
    pub id: i64,
    pub order_id: OrderId,
    pub payer_id: String,
    pub recipient_id: String,
    pub recipient_kind: TipRecipient,
    pub amount: Money,
    pub message: Option<String>,
    pub status: SettlementStatus,
    pub payment_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTip {
    pub recipient_kind: TipRecipient,
    pub amount: Money,
    #[serde(default)]
    pub message: Option<String>,
}

//--------------------------------------  CancellationPolicy  ---------------------------------------------------------
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct CancellationPolicy {
    pub id: i64,
    pub free_window_seconds: i64,
    pub penalty_rate: f64,
    pub min_penalty: Money,
    pub max_penalty: Money,
    pub description: String,
    pub is_active: bool,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCancellationPolicy {
    pub free_window_seconds: i64,
    pub penalty_rate: f64,
    pub min_penalty: Money,
    pub max_penalty: Money,
    #[serde(default)]
    pub description: String,
}

impl Default for NewCancellationPolicy {
    fn default() -> Self {
        Self {
            free_window_seconds: 30,
            penalty_rate: 0.40,
            min_penalty: Money::from_major(20),
            max_penalty: Money::from_major(500),
            description: "Free cancellation for 30 seconds after ordering; 40% penalty afterwards".to_string(),
        }
    }
}

//-------------------------------------- CancellationAnalytics ---------------------------------------------------------
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct CancellationAnalytics {
    pub day: NaiveDate,
    pub total_orders: i64,
    pub total_cancellations: i64,
    pub free_cancellations: i64,
    pub penalty_cancellations: i64,
    pub total_penalties: Money,
    pub total_seconds_to_cancel: i64,
    pub avg_seconds_to_cancel: f64,
    pub updated_at: DateTime<Utc>,
}

//--------------------------------------      EventKind       ---------------------------------------------------------
/// The event catalogue. Names are stable over the wire and are what webhook subscriptions refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Type, Serialize, Deserialize)]
pub enum EventKind {
    #[sqlx(rename = "order.created")]
    #[serde(rename = "order.created")]
    OrderCreated,
    #[sqlx(rename = "order.sent_to_chef")]
    #[serde(rename = "order.sent_to_chef")]
    OrderSentToChef,
    #[sqlx(rename = "order.chef_accepted")]
    #[serde(rename = "order.chef_accepted")]
    OrderChefAccepted,
    #[sqlx(rename = "order.chef_declined")]
    #[serde(rename = "order.chef_declined")]
    OrderChefDeclined,
    #[sqlx(rename = "order.status_changed")]
    #[serde(rename = "order.status_changed")]
    OrderStatusChanged,
    #[sqlx(rename = "order.cancelled")]
    #[serde(rename = "order.cancelled")]
    OrderCancelled,
    #[sqlx(rename = "order.delivered")]
    #[serde(rename = "order.delivered")]
    OrderDelivered,
    #[sqlx(rename = "payment.success")]
    #[serde(rename = "payment.success")]
    PaymentSuccess,
    #[sqlx(rename = "payment.failed")]
    #[serde(rename = "payment.failed")]
    PaymentFailed,
    #[sqlx(rename = "tip.received")]
    #[serde(rename = "tip.received")]
    TipReceived,
    #[sqlx(rename = "delivery.assigned")]
    #[serde(rename = "delivery.assigned")]
    DeliveryAssigned,
    #[sqlx(rename = "countdown.expired")]
    #[serde(rename = "countdown.expired")]
    CountdownExpired,
    /// Sent only by the test-fire operation. Endpoints cannot subscribe to it.
    #[sqlx(rename = "webhook.test")]
    #[serde(rename = "webhook.test")]
    WebhookTest,
}

impl EventKind {
    /// Every event kind a webhook endpoint may subscribe to.
    pub const CATALOGUE: [EventKind; 12] = [
        Self::OrderCreated,
        Self::OrderSentToChef,
        Self::OrderChefAccepted,
        Self::OrderChefDeclined,
        Self::OrderStatusChanged,
        Self::OrderCancelled,
        Self::OrderDelivered,
        Self::PaymentSuccess,
        Self::PaymentFailed,
        Self::TipReceived,
        Self::DeliveryAssigned,
        Self::CountdownExpired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OrderCreated => "order.created",
            Self::OrderSentToChef => "order.sent_to_chef",
            Self::OrderChefAccepted => "order.chef_accepted",
            Self::OrderChefDeclined => "order.chef_declined",
            Self::OrderStatusChanged => "order.status_changed",
            Self::OrderCancelled => "order.cancelled",
            Self::OrderDelivered => "order.delivered",
            Self::PaymentSuccess => "payment.success",
            Self::PaymentFailed => "payment.failed",
            Self::TipReceived => "tip.received",
            Self::DeliveryAssigned => "delivery.assigned",
            Self::CountdownExpired => "countdown.expired",
            Self::WebhookTest => "webhook.test",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::OrderCreated => "An order was placed",
            Self::OrderSentToChef => "An order was sent to the chef and the cancellation countdown started",
            Self::OrderChefAccepted => "The chef accepted an order",
            Self::OrderChefDeclined => "The chef declined an order; the customer is refunded in full",
            Self::OrderStatusChanged => "An accepted order moved to a new status",
            Self::OrderCancelled => "The customer cancelled an order",
            Self::OrderDelivered => "An order was delivered",
            Self::PaymentSuccess => "The payment for an order was captured",
            Self::PaymentFailed => "The payment for an order failed",
            Self::TipReceived => "A tip was settled",
            Self::DeliveryAssigned => "A delivery partner was assigned to an order",
            Self::CountdownExpired => "The free-cancellation window for an order ended",
            Self::WebhookTest => "Test event sent on request",
        }
    }

    pub fn is_subscribable(&self) -> bool {
        *self != Self::WebhookTest
    }
}

impl Display for EventKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::CATALOGUE
            .iter()
            .chain(std::iter::once(&Self::WebhookTest))
            .find(|k| k.as_str() == s)
            .copied()
            .ok_or_else(|| ConversionError(format!("Unknown event kind: {s}")))
    }
}

//--------------------------------------   WebhookEndpoint    ---------------------------------------------------------
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct WebhookEndpoint {
    pub id: i64,
    pub owner_id: String,
    pub url: String,
    #[sqlx(json)]
    pub events: Vec<EventKind>,
    /// Encrypted shared secret. Never serialised.
    #[serde(skip)]
    pub secret_ciphertext: String,
    pub description: String,
    pub is_active: bool,
    pub max_attempts: i64,
    pub base_delay_seconds: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl WebhookEndpoint {
    pub fn is_subscribed_to(&self, kind: EventKind) -> bool {
        self.is_active && self.deleted_at.is_none() && self.events.contains(&kind)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewWebhookEndpoint {
    pub url: String,
    pub events: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub max_attempts: Option<i64>,
    #[serde(default)]
    pub base_delay_seconds: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateWebhookEndpoint {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub events: Option<Vec<String>>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub max_attempts: Option<i64>,
    #[serde(default)]
    pub base_delay_seconds: Option<i64>,
}

impl UpdateWebhookEndpoint {
    pub fn is_empty(&self) -> bool {
        self.url.is_none()
            && self.events.is_none()
            && self.description.is_none()
            && self.is_active.is_none()
            && self.max_attempts.is_none()
            && self.base_delay_seconds.is_none()
    }
}

//--------------------------------------   WebhookDelivery    ---------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Type, Serialize, Deserialize)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Success,
    Failed,
}

impl Display for DeliveryStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Success => f.write_str("success"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

impl FromStr for DeliveryStatus {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            s => Err(ConversionError(format!("Invalid delivery status: {s}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: i64,
    pub endpoint_id: i64,
    pub event_kind: EventKind,
    pub order_id: Option<OrderId>,
    pub event_seq: Option<i64>,
    #[sqlx(json)]
    pub payload: serde_json::Value,
    pub event_timestamp: DateTime<Utc>,
    pub status: DeliveryStatus,
    pub last_http_status: Option<i64>,
    pub last_response_body: Option<String>,
    pub attempt_count: i64,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    #[serde(skip)]
    pub claimed_by: Option<String>,
    #[serde(skip)]
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
