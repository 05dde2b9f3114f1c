use serde::{Deserialize, Serialize};

use crate::db_types::{DeliveryStatus, EventKind, WebhookEndpoint};

/// Returned once, when an endpoint is created. The secret cannot be retrieved again.
#[derive(Debug, Clone, Serialize)]
pub struct CreatedEndpoint {
    #[serde(flatten)]
    pub endpoint: WebhookEndpoint,
    pub secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCatalogueEntry {
    pub name: EventKind,
    pub description: String,
}

impl From<EventKind> for EventCatalogueEntry {
    fn from(kind: EventKind) -> Self {
        Self { name: kind, description: kind.description().to_string() }
    }
}

/// Defaults for the retry policy of new endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WebhookDefaults {
    pub max_attempts: i64,
    pub base_delay_seconds: i64,
}

impl Default for WebhookDefaults {
    fn default() -> Self {
        Self { max_attempts: 5, base_delay_seconds: 30 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryQuery {
    #[serde(default)]
    pub status: Option<DeliveryStatus>,
    #[serde(default)]
    pub limit: Option<i64>,
}

impl DeliveryQuery {
    pub const DEFAULT_LIMIT: i64 = 50;
    pub const MAX_LIMIT: i64 = 200;

    pub fn effective_limit(&self) -> i64 {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT).clamp(1, Self::MAX_LIMIT)
    }
}
