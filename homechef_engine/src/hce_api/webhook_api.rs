use std::fmt::Debug;

use log::*;
use serde_json::json;

use crate::{
    clock::SharedClock,
    db_types::{EventKind, NewWebhookEndpoint, Principal, UpdateWebhookEndpoint, WebhookDelivery, WebhookEndpoint},
    events::EventBus,
    hce_api::webhook_objects::{CreatedEndpoint, DeliveryQuery, EventCatalogueEntry, WebhookDefaults},
    traits::{EndpointChanges, EndpointDraft, NewDelivery, WebhookError, WebhookManagement},
    validation::{validate_endpoint_update, validate_new_endpoint, ValidationErrors},
    webhooks::{generate_webhook_secret, DispatchOutcome, WebhookDispatcher},
};

/// Management of webhook endpoints and their delivery log, on behalf of endpoint owners.
///
/// Owners only ever see their own endpoints; admins can see everything.
pub struct WebhookApi<B> {
    db: B,
    bus: EventBus<B>,
    dispatcher: WebhookDispatcher<B>,
    clock: SharedClock,
    defaults: WebhookDefaults,
}

impl<B: Clone> Clone for WebhookApi<B> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            bus: self.bus.clone(),
            dispatcher: self.dispatcher.clone(),
            clock: self.clock.clone(),
            defaults: self.defaults,
        }
    }
}

impl<B> Debug for WebhookApi<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WebhookApi ({:?})", self.defaults)
    }
}

impl<B> WebhookApi<B> {
    pub fn new(
        db: B,
        bus: EventBus<B>,
        dispatcher: WebhookDispatcher<B>,
        clock: SharedClock,
        defaults: WebhookDefaults,
    ) -> Self {
        Self { db, bus, dispatcher, clock, defaults }
    }

    pub fn event_catalogue() -> Vec<EventCatalogueEntry> {
        EventKind::CATALOGUE.into_iter().map(EventCatalogueEntry::from).collect()
    }
}

fn check_access(endpoint: WebhookEndpoint, principal: &Principal) -> Result<WebhookEndpoint, WebhookError> {
    if endpoint.deleted_at.is_some() {
        return Err(WebhookError::EndpointNotFound(endpoint.id));
    }
    if endpoint.owner_id != principal.user_id && !principal.is_admin() {
        return Err(WebhookError::Forbidden(format!("Webhook endpoint {} belongs to someone else.", endpoint.id)));
    }
    Ok(endpoint)
}

impl<B> WebhookApi<B>
where B: WebhookManagement
{
    /// Registers a new endpoint for `owner`. The generated secret is returned here and never again.
    pub async fn create_endpoint(
        &self,
        owner: &Principal,
        endpoint: NewWebhookEndpoint,
    ) -> Result<CreatedEndpoint, WebhookError> {
        let events = validate_new_endpoint(&endpoint)?;
        let secret = generate_webhook_secret();
        let draft = EndpointDraft {
            owner_id: owner.user_id.clone(),
            url: endpoint.url,
            events,
            secret_ciphertext: self.dispatcher.vault().encrypt(&secret)?,
            description: endpoint.description,
            max_attempts: endpoint.max_attempts.unwrap_or(self.defaults.max_attempts),
            base_delay_seconds: endpoint.base_delay_seconds.unwrap_or(self.defaults.base_delay_seconds),
        };
        let saved = self.db.insert_endpoint(draft, self.clock.now()).await?;
        info!("🪝️ Webhook endpoint #{} registered by {owner} for {:?}", saved.id, saved.events);
        Ok(CreatedEndpoint { endpoint: saved, secret: secret.reveal().clone() })
    }

    pub async fn list_endpoints(&self, owner: &Principal) -> Result<Vec<WebhookEndpoint>, WebhookError> {
        self.db.fetch_endpoints_for_owner(&owner.user_id).await
    }

    pub async fn get_endpoint(&self, principal: &Principal, id: i64) -> Result<WebhookEndpoint, WebhookError> {
        let endpoint = self.db.fetch_endpoint(id).await?.ok_or(WebhookError::EndpointNotFound(id))?;
        check_access(endpoint, principal)
    }

    pub async fn update_endpoint(
        &self,
        principal: &Principal,
        id: i64,
        update: UpdateWebhookEndpoint,
    ) -> Result<WebhookEndpoint, WebhookError> {
        let events = validate_endpoint_update(&update)?;
        self.get_endpoint(principal, id).await?;
        let changes = EndpointChanges {
            url: update.url,
            events,
            description: update.description,
            is_active: update.is_active,
            max_attempts: update.max_attempts,
            base_delay_seconds: update.base_delay_seconds,
        };
        let updated =
            self.db.update_endpoint(id, changes, self.clock.now()).await?.ok_or(WebhookError::EndpointNotFound(id))?;
        debug!("🪝️ Webhook endpoint #{id} updated by {principal}");
        Ok(updated)
    }

    /// Soft-deletes the endpoint and abandons its pending deliveries. Returns the number abandoned.
    pub async fn delete_endpoint(&self, principal: &Principal, id: i64) -> Result<u64, WebhookError> {
        self.get_endpoint(principal, id).await?;
        self.db.soft_delete_endpoint(id, self.clock.now()).await
    }

    /// Sends a `webhook.test` event to the endpoint right away and returns the resulting delivery record.
    pub async fn test_endpoint(&self, principal: &Principal, id: i64) -> Result<WebhookDelivery, WebhookError> {
        let endpoint = self.get_endpoint(principal, id).await?;
        if !endpoint.is_active {
            return Err(ValidationErrors::single("is_active", "the endpoint is disabled").into());
        }
        let now = self.clock.now();
        let delivery = NewDelivery {
            event_kind: EventKind::WebhookTest,
            order_id: None,
            event_seq: None,
            data: json!({ "message": "This is a test event", "webhook_id": id }),
            event_timestamp: now,
        };
        let ids = self.db.enqueue_deliveries(&[id], &delivery, now).await?;
        let delivery_id = *ids.first().ok_or_else(|| WebhookError::DatabaseError("No delivery was created".into()))?;
        let outcome = self.dispatcher.dispatch(delivery_id).await?;
        if outcome == DispatchOutcome::Skipped {
            // Claimed by a pool worker in the meantime
            debug!("🪝️ Test delivery #{delivery_id} was picked up by another worker");
        }
        self.db.fetch_delivery(delivery_id).await?.ok_or(WebhookError::DeliveryNotFound(delivery_id))
    }

    pub async fn list_deliveries(
        &self,
        principal: &Principal,
        endpoint_id: i64,
        query: DeliveryQuery,
    ) -> Result<Vec<WebhookDelivery>, WebhookError> {
        self.get_endpoint(principal, endpoint_id).await?;
        self.db.fetch_deliveries_for_endpoint(endpoint_id, query.status, query.effective_limit()).await
    }

    /// Operator retry: a failed delivery starts over with a zeroed attempt count and is queued for dispatch.
    pub async fn retry_delivery(&self, principal: &Principal, delivery_id: i64) -> Result<WebhookDelivery, WebhookError> {
        let delivery = self.db.fetch_delivery(delivery_id).await?.ok_or(WebhookError::DeliveryNotFound(delivery_id))?;
        self.get_endpoint(principal, delivery.endpoint_id).await?;
        let reset = self
            .db
            .reset_delivery(delivery_id, self.clock.now())
            .await?
            .ok_or(WebhookError::DeliveryNotRetryable { id: delivery_id, status: delivery.status })?;
        info!("🪝️ Delivery #{delivery_id} reset for retry by {principal}");
        self.bus.enqueue_for_dispatch(delivery_id);
        Ok(reset)
    }
}
