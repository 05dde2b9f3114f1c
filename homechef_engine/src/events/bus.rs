use log::*;
use tokio::sync::mpsc;

use crate::{
    events::{EventProducers, OrderEvent},
    traits::{NewDelivery, WebhookError, WebhookManagement},
};

/// Fans committed order events out to webhook subscribers and to in-process hooks.
///
/// For webhooks, one pending delivery per subscribed endpoint is written to the durable queue and its id is handed to
/// the dispatch pool. If the dispatch queue is full (or there is no dispatch pool) the retry sweeper picks the
/// delivery up on its next pass, since it is stored as due immediately.
pub struct EventBus<B> {
    db: B,
    dispatch_queue: Option<mpsc::Sender<i64>>,
    producers: EventProducers,
}

impl<B: Clone> Clone for EventBus<B> {
    fn clone(&self) -> Self {
        Self { db: self.db.clone(), dispatch_queue: self.dispatch_queue.clone(), producers: self.producers.clone() }
    }
}

impl<B> EventBus<B> {
    pub fn new(db: B, producers: EventProducers) -> Self {
        Self { db, dispatch_queue: None, producers }
    }

    pub fn with_dispatch_queue(mut self, queue: mpsc::Sender<i64>) -> Self {
        self.dispatch_queue = Some(queue);
        self
    }

    /// Hands a stored delivery to the dispatch pool without waiting.
    pub fn enqueue_for_dispatch(&self, delivery_id: i64) {
        match &self.dispatch_queue {
            Some(q) => {
                if let Err(e) = q.try_send(delivery_id) {
                    debug!("📬️ Delivery #{delivery_id} left for the retry sweeper. {e}");
                }
            },
            None => trace!("📬️ No dispatch pool. Delivery #{delivery_id} left for the retry sweeper"),
        }
    }
}

impl<B> EventBus<B>
where B: WebhookManagement
{
    /// Publishes a committed event. Returns the ids of the webhook deliveries that were created for it.
    ///
    /// Callers must publish the events of a single order sequentially (and only after the change has committed) so
    /// that the per-order ordering carries through to the delivery queue and the hooks.
    pub async fn publish(&self, event: OrderEvent) -> Vec<i64> {
        let ids = match self.fan_out_to_webhooks(&event).await {
            Ok(ids) => ids,
            Err(e) => {
                error!("📬️ Could not queue webhook deliveries for {} on order {}. {e}", event.kind, event.order_id);
                Vec::new()
            },
        };
        for id in &ids {
            self.enqueue_for_dispatch(*id);
        }
        for producer in &self.producers.order_event_producers {
            producer.publish_event(event.clone()).await;
        }
        ids
    }

    async fn fan_out_to_webhooks(&self, event: &OrderEvent) -> Result<Vec<i64>, WebhookError> {
        let endpoints = self.db.fetch_subscribed_endpoints(event.kind).await?;
        if endpoints.is_empty() {
            trace!("📬️ No webhook subscribers for {}", event.kind);
            return Ok(Vec::new());
        }
        let endpoint_ids = endpoints.iter().map(|e| e.id).collect::<Vec<_>>();
        let delivery = NewDelivery {
            event_kind: event.kind,
            order_id: Some(event.order_id),
            event_seq: Some(event.seq),
            data: event.data.clone(),
            event_timestamp: event.timestamp,
        };
        let ids = self.db.enqueue_deliveries(&endpoint_ids, &delivery, event.timestamp).await?;
        debug!("📬️ {} queued for {} webhook endpoint(s) on order {}", event.kind, ids.len(), event.order_id);
        Ok(ids)
    }
}
