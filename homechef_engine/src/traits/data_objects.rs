use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db_types::{DeliveryStatus, EventKind, OrderId};

/// A validated webhook endpoint, ready to be stored. The secret has already been encrypted.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointDraft {
    pub owner_id: String,
    pub url: String,
    pub events: Vec<EventKind>,
    pub secret_ciphertext: String,
    pub description: String,
    pub max_attempts: i64,
    pub base_delay_seconds: i64,
}

/// Validated changes to a webhook endpoint. `None` leaves the column untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EndpointChanges {
    pub url: Option<String>,
    pub events: Option<Vec<EventKind>>,
    pub description: Option<String>,
    pub is_active: Option<bool>,
    pub max_attempts: Option<i64>,
    pub base_delay_seconds: Option<i64>,
}

impl EndpointChanges {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// The event-specific part of a webhook delivery. The envelope (`webhook_id`, `delivery_id`) is added at dispatch time
/// from the delivery record, so every attempt signs an identical body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDelivery {
    pub event_kind: EventKind,
    pub order_id: Option<OrderId>,
    pub event_seq: Option<i64>,
    pub data: serde_json::Value,
    pub event_timestamp: DateTime<Utc>,
}

/// The result of one delivery attempt, as it will be written to the delivery record.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryUpdate {
    pub status: DeliveryStatus,
    pub attempt_count: i64,
    pub last_http_status: Option<i64>,
    pub last_response_body: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}
