use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use hc_common::helpers::truncate_chars;
use log::*;
use rand::RngCore;
use reqwest::{header::CONTENT_TYPE, Client};
use serde_json::json;

use crate::{
    clock::SharedClock,
    db_types::{DeliveryStatus, WebhookDelivery, WebhookEndpoint},
    traits::{DeliveryUpdate, WebhookError, WebhookManagement},
    webhooks::{
        secrets::SecretVault,
        signer::{sign, DELIVERY_HEADER, EVENT_HEADER, SIGNATURE_HEADER},
    },
};

pub const DEFAULT_DISPATCH_TIMEOUT: StdDuration = StdDuration::from_secs(10);
pub const MAX_BACKOFF_SECONDS: i64 = 3600;
const RESPONSE_BODY_LIMIT: usize = 1024;
const USER_AGENT: &str = concat!("HomeChef-Webhooks/", env!("CARGO_PKG_VERSION"));

/// The delay before retry number `attempt + 1`, given that `attempt` attempts have been made.
///
/// `base * 2^(attempt - 1)`, capped at one hour.
pub fn backoff_delay(base_delay_seconds: i64, attempt: i64) -> Duration {
    let exponent = (attempt - 1).clamp(0, 30) as u32;
    let seconds = base_delay_seconds.max(0).saturating_mul(1i64 << exponent).min(MAX_BACKOFF_SECONDS);
    Duration::seconds(seconds)
}

/// The JSON body sent to the subscriber. It is derived only from the stored delivery, so every attempt for a
/// delivery sends (and signs) identical bytes.
pub fn envelope(delivery: &WebhookDelivery) -> serde_json::Value {
    json!({
        "event": delivery.event_kind,
        "data": delivery.payload,
        "timestamp": delivery.event_timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        "webhook_id": delivery.endpoint_id,
        "delivery_id": delivery.id,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered,
    /// The attempt failed and another one is scheduled.
    Retrying { next_retry_at: DateTime<Utc> },
    /// The attempt failed and the delivery has given up, or the endpoint is gone.
    Failed,
    /// The delivery was not due, not pending, or another worker holds it.
    Skipped,
}

/// Sends webhook deliveries and records the outcome of each attempt.
///
/// Any number of dispatchers can work the same queue; a delivery is claimed before it is sent and the claim expires
/// after twice the request timeout, so a crashed worker cannot strand it.
#[derive(Clone)]
pub struct WebhookDispatcher<B> {
    db: B,
    vault: SecretVault,
    client: Client,
    clock: SharedClock,
    worker_id: String,
    timeout: StdDuration,
}

impl<B> WebhookDispatcher<B> {
    pub fn new(db: B, vault: SecretVault, clock: SharedClock, timeout: StdDuration) -> Result<Self, WebhookError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| WebhookError::TransportError(format!("Could not build the HTTP client. {e}")))?;
        let mut tag = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut tag);
        let worker_id = format!("dispatcher-{}", hex::encode(tag));
        Ok(Self { db, vault, client, clock, worker_id, timeout })
    }

    /// A copy of this dispatcher that claims deliveries under a different worker id.
    pub fn for_worker(&self, n: usize) -> Self
    where B: Clone {
        let mut worker = self.clone();
        worker.worker_id = format!("{}-{n}", self.worker_id);
        worker
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn vault(&self) -> &SecretVault {
        &self.vault
    }

    pub fn claim_ttl(&self) -> Duration {
        Duration::milliseconds(2 * self.timeout.as_millis() as i64)
    }
}

impl<B> WebhookDispatcher<B>
where B: WebhookManagement
{
    /// Makes one delivery attempt, if the delivery is due and can be claimed.
    pub async fn dispatch(&self, delivery_id: i64) -> Result<DispatchOutcome, WebhookError> {
        let now = self.clock.now();
        let Some(delivery) = self.db.claim_delivery(delivery_id, &self.worker_id, now, self.claim_ttl()).await? else {
            trace!("🪝️ Delivery #{delivery_id} is not claimable by {}", self.worker_id);
            return Ok(DispatchOutcome::Skipped);
        };
        let endpoint = match self.db.fetch_endpoint(delivery.endpoint_id).await? {
            Some(e) if e.is_active && e.deleted_at.is_none() => e,
            _ => {
                info!("🪝️ Endpoint #{} is gone or disabled. Abandoning delivery #{delivery_id}", delivery.endpoint_id);
                return self.give_up(&delivery, "The endpoint was deleted or disabled").await;
            },
        };
        if delivery.attempt_count >= endpoint.max_attempts {
            return self.give_up(&delivery, "Maximum number of attempts reached").await;
        }
        let secret = match self.vault.decrypt(&endpoint.secret_ciphertext) {
            Ok(s) => s,
            Err(e) => return self.give_up(&delivery, &e.to_string()).await,
        };
        let body = serde_json::to_vec(&envelope(&delivery))
            .map_err(|e| WebhookError::TransportError(format!("Could not serialize the payload. {e}")))?;
        let signature = sign(secret.reveal().as_bytes(), &body)
            .map_err(|e| WebhookError::SecretError(e.to_string()))?;

        debug!(
            "🪝️ Sending {} (delivery #{delivery_id}, attempt {}) to {}",
            delivery.event_kind,
            delivery.attempt_count + 1,
            endpoint.url
        );
        let result = self
            .client
            .post(&endpoint.url)
            .header(CONTENT_TYPE, "application/json")
            .header(EVENT_HEADER, delivery.event_kind.as_str())
            .header(DELIVERY_HEADER, delivery.id.to_string())
            .header(SIGNATURE_HEADER, signature)
            .body(body)
            .send()
            .await;
        let finished = self.clock.now();
        let attempt = AttemptResult::from_response(result).await;
        let update = attempt.into_update(&delivery, &endpoint, finished);
        let outcome = match update.status {
            DeliveryStatus::Success => DispatchOutcome::Delivered,
            DeliveryStatus::Pending => DispatchOutcome::Retrying { next_retry_at: update.next_retry_at.unwrap_or(finished) },
            DeliveryStatus::Failed => DispatchOutcome::Failed,
        };
        match &outcome {
            DispatchOutcome::Delivered => info!("🪝️ Delivery #{delivery_id} succeeded on attempt {}", update.attempt_count),
            DispatchOutcome::Retrying { next_retry_at } => warn!(
                "🪝️ Delivery #{delivery_id} attempt {} failed ({}). Retrying at {next_retry_at}",
                update.attempt_count,
                update.error_message.as_deref().unwrap_or_default()
            ),
            _ => warn!(
                "🪝️ Delivery #{delivery_id} failed permanently after {} attempts ({})",
                update.attempt_count,
                update.error_message.as_deref().unwrap_or_default()
            ),
        }
        if self.db.record_attempt(delivery_id, &self.worker_id, update, finished).await?.is_none() {
            warn!("🪝️ {} lost its claim on delivery #{delivery_id} before recording the attempt", self.worker_id);
        }
        Ok(outcome)
    }

    async fn give_up(&self, delivery: &WebhookDelivery, reason: &str) -> Result<DispatchOutcome, WebhookError> {
        let now = self.clock.now();
        let update = DeliveryUpdate {
            status: DeliveryStatus::Failed,
            attempt_count: delivery.attempt_count,
            last_http_status: delivery.last_http_status,
            last_response_body: delivery.last_response_body.clone(),
            next_retry_at: None,
            delivered_at: None,
            failed_at: Some(now),
            error_message: Some(reason.to_string()),
        };
        self.db.record_attempt(delivery.id, &self.worker_id, update, now).await?;
        Ok(DispatchOutcome::Failed)
    }

    /// Dispatches every due delivery, one at a time. Per-delivery failures are logged and skipped.
    /// Returns the number of deliveries that were attempted.
    pub async fn sweep(&self, limit: i64) -> Result<usize, WebhookError> {
        let due = self.db.fetch_due_deliveries(self.clock.now(), self.claim_ttl(), limit).await?;
        if !due.is_empty() {
            debug!("🪝️ Retry sweep found {} due deliveries", due.len());
        }
        let mut attempted = 0;
        for id in due {
            match self.dispatch(id).await {
                Ok(DispatchOutcome::Skipped) => {},
                Ok(_) => attempted += 1,
                Err(e) => error!("🪝️ Could not dispatch delivery #{id}. {e}"),
            }
        }
        Ok(attempted)
    }
}

struct AttemptResult {
    http_status: Option<u16>,
    body: Option<String>,
    error: Option<String>,
}

impl AttemptResult {
    async fn from_response(result: Result<reqwest::Response, reqwest::Error>) -> Self {
        match result {
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.ok().map(|b| truncate_chars(&b, RESPONSE_BODY_LIMIT));
                let error = (!status.is_success()).then(|| format!("Subscriber responded with HTTP {status}"));
                Self { http_status: Some(status.as_u16()), body, error }
            },
            Err(e) => {
                let error = if e.is_timeout() { format!("Request timed out. {e}") } else { format!("Request failed. {e}") };
                Self { http_status: None, body: None, error: Some(error) }
            },
        }
    }

    fn into_update(self, delivery: &WebhookDelivery, endpoint: &WebhookEndpoint, now: DateTime<Utc>) -> DeliveryUpdate {
        let attempt_count = delivery.attempt_count + 1;
        let mut update = DeliveryUpdate {
            status: DeliveryStatus::Success,
            attempt_count,
            last_http_status: self.http_status.map(i64::from),
            last_response_body: self.body,
            next_retry_at: None,
            delivered_at: None,
            failed_at: None,
            error_message: self.error.clone(),
        };
        match self.error {
            None => update.delivered_at = Some(now),
            Some(_) if attempt_count < endpoint.max_attempts => {
                update.status = DeliveryStatus::Pending;
                update.next_retry_at = Some(now + backoff_delay(endpoint.base_delay_seconds, attempt_count));
            },
            Some(_) => {
                update.status = DeliveryStatus::Failed;
                update.failed_at = Some(now);
            },
        }
        update
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(2, 1), Duration::seconds(2));
        assert_eq!(backoff_delay(2, 2), Duration::seconds(4));
        assert_eq!(backoff_delay(30, 4), Duration::seconds(240));
        assert_eq!(backoff_delay(30, 10), Duration::seconds(3600));
        assert_eq!(backoff_delay(30, 500), Duration::seconds(3600));
    }
}
