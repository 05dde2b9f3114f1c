use chrono::{DateTime, Duration, TimeZone, Utc};
use homechef_engine::{
    db_types::{DeliveryStatus, EventKind, WebhookDelivery, WebhookEndpoint},
    traits::{DeliveryUpdate, EndpointChanges, EndpointDraft, NewDelivery, WebhookError, WebhookManagement},
};
use mockall::mock;

mock! {
    pub WebhookStore {}
    impl WebhookManagement for WebhookStore {
        async fn insert_endpoint(&self, draft: EndpointDraft, now: DateTime<Utc>) -> Result<WebhookEndpoint, WebhookError>;
        async fn fetch_endpoint(&self, id: i64) -> Result<Option<WebhookEndpoint>, WebhookError>;
        async fn fetch_endpoints_for_owner(&self, owner_id: &str) -> Result<Vec<WebhookEndpoint>, WebhookError>;
        async fn update_endpoint(&self, id: i64, changes: EndpointChanges, now: DateTime<Utc>) -> Result<Option<WebhookEndpoint>, WebhookError>;
        async fn soft_delete_endpoint(&self, id: i64, now: DateTime<Utc>) -> Result<u64, WebhookError>;
        async fn fetch_subscribed_endpoints(&self, kind: EventKind) -> Result<Vec<WebhookEndpoint>, WebhookError>;
        async fn enqueue_deliveries(&self, endpoint_ids: &[i64], delivery: &NewDelivery, now: DateTime<Utc>) -> Result<Vec<i64>, WebhookError>;
        async fn fetch_delivery(&self, id: i64) -> Result<Option<WebhookDelivery>, WebhookError>;
        async fn fetch_deliveries_for_endpoint(&self, endpoint_id: i64, status: Option<DeliveryStatus>, limit: i64) -> Result<Vec<WebhookDelivery>, WebhookError>;
        async fn claim_delivery(&self, id: i64, worker_id: &str, now: DateTime<Utc>, claim_ttl: Duration) -> Result<Option<WebhookDelivery>, WebhookError>;
        async fn record_attempt(&self, id: i64, worker_id: &str, update: DeliveryUpdate, now: DateTime<Utc>) -> Result<Option<WebhookDelivery>, WebhookError>;
        async fn fetch_due_deliveries(&self, now: DateTime<Utc>, claim_ttl: Duration, limit: i64) -> Result<Vec<i64>, WebhookError>;
        async fn reset_delivery(&self, id: i64, now: DateTime<Utc>) -> Result<Option<WebhookDelivery>, WebhookError>;
    }
}

pub fn endpoint(id: i64, owner_id: &str) -> WebhookEndpoint {
    let created = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();
    WebhookEndpoint {
        id,
        owner_id: owner_id.to_string(),
        url: format!("https://hooks.example.com/homechef/{id}"),
        events: vec![EventKind::OrderCreated, EventKind::OrderCancelled],
        secret_ciphertext: "not-a-real-ciphertext".into(),
        description: "Kitchen display".into(),
        is_active: true,
        max_attempts: 5,
        base_delay_seconds: 30,
        created_at: created,
        updated_at: created,
        deleted_at: None,
    }
}
