use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::{
    db_types::{DeliveryStatus, EventKind, WebhookDelivery, WebhookEndpoint},
    traits::data_objects::{DeliveryUpdate, EndpointChanges, EndpointDraft, NewDelivery},
    validation::ValidationErrors,
};

/// Storage for webhook endpoints and the durable delivery queue.
#[allow(async_fn_in_trait)]
pub trait WebhookManagement {
    async fn insert_endpoint(&self, draft: EndpointDraft, now: DateTime<Utc>) -> Result<WebhookEndpoint, WebhookError>;

    /// Fetches an endpoint, including soft-deleted ones.
    async fn fetch_endpoint(&self, id: i64) -> Result<Option<WebhookEndpoint>, WebhookError>;

    /// Endpoints owned by `owner_id` that have not been deleted.
    async fn fetch_endpoints_for_owner(&self, owner_id: &str) -> Result<Vec<WebhookEndpoint>, WebhookError>;

    async fn update_endpoint(
        &self,
        id: i64,
        changes: EndpointChanges,
        now: DateTime<Utc>,
    ) -> Result<Option<WebhookEndpoint>, WebhookError>;

    /// Marks the endpoint deleted and inactive, and abandons its pending deliveries (status -> failed).
    /// Returns the number of abandoned deliveries.
    async fn soft_delete_endpoint(&self, id: i64, now: DateTime<Utc>) -> Result<u64, WebhookError>;

    /// Active, undeleted endpoints subscribed to `kind`.
    async fn fetch_subscribed_endpoints(&self, kind: EventKind) -> Result<Vec<WebhookEndpoint>, WebhookError>;

    /// Inserts one pending delivery per endpoint, due immediately, in a single transaction. Returns the new delivery
    /// ids in the same order as `endpoint_ids`.
    async fn enqueue_deliveries(
        &self,
        endpoint_ids: &[i64],
        delivery: &NewDelivery,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>, WebhookError>;

    async fn fetch_delivery(&self, id: i64) -> Result<Option<WebhookDelivery>, WebhookError>;

    /// Most recent first.
    async fn fetch_deliveries_for_endpoint(
        &self,
        endpoint_id: i64,
        status: Option<DeliveryStatus>,
        limit: i64,
    ) -> Result<Vec<WebhookDelivery>, WebhookError>;

    /// Atomically claims a due, pending delivery for `worker_id`. A claim older than `claim_ttl` is treated as
    /// abandoned and can be taken over. Returns `None` if the delivery is not claimable.
    async fn claim_delivery(
        &self,
        id: i64,
        worker_id: &str,
        now: DateTime<Utc>,
        claim_ttl: Duration,
    ) -> Result<Option<WebhookDelivery>, WebhookError>;

    /// Writes the outcome of an attempt and releases the claim. Only applies while `worker_id` still holds the claim.
    async fn record_attempt(
        &self,
        id: i64,
        worker_id: &str,
        update: DeliveryUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<WebhookDelivery>, WebhookError>;

    /// Ids of pending deliveries that are due and unclaimed (or whose claim has expired), oldest first.
    async fn fetch_due_deliveries(
        &self,
        now: DateTime<Utc>,
        claim_ttl: Duration,
        limit: i64,
    ) -> Result<Vec<i64>, WebhookError>;

    /// Operator retry: moves a failed delivery back to pending with a zeroed attempt count, due immediately.
    /// Returns `None` if the delivery is not currently failed.
    async fn reset_delivery(&self, id: i64, now: DateTime<Utc>) -> Result<Option<WebhookDelivery>, WebhookError>;
}

#[derive(Debug, Clone, Error)]
pub enum WebhookError {
    #[error("{0}")]
    ValidationError(#[from] ValidationErrors),
    #[error("Webhook endpoint {0} does not exist")]
    EndpointNotFound(i64),
    #[error("Webhook delivery {0} does not exist")]
    DeliveryNotFound(i64),
    #[error("Not allowed. {0}")]
    Forbidden(String),
    #[error("Delivery {id} cannot be retried while it is {status}")]
    DeliveryNotRetryable { id: i64, status: DeliveryStatus },
    #[error("Could not process the webhook secret. {0}")]
    SecretError(String),
    #[error("Could not send the webhook. {0}")]
    TransportError(String),
    #[error("The store is temporarily unavailable. {0}")]
    StoreUnavailable(String),
    #[error("We have an internal database engine (configuration/uptime etc.) : {0}")]
    DatabaseError(String),
}

impl From<sqlx::Error> for WebhookError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                WebhookError::StoreUnavailable(e.to_string())
            },
            e => WebhookError::DatabaseError(e.to_string()),
        }
    }
}
