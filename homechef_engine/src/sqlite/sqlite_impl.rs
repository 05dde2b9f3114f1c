//! `SqliteDatabase` is the SQLite implementation of the HomeChef store.
//!
//! It implements every trait in the [`traits`](crate::traits) module. Each method runs under the database deadline;
//! when the deadline elapses, the in-flight transaction is dropped (and therefore rolled back) and the caller gets a
//! `StoreUnavailable` error.
//!
//! Write transactions always begin with a write statement. SQLite then takes the write lock up front, which gives the
//! same guarantees as a row lock on the order being modified.
use std::{fmt::Debug, future::Future, time::Duration};

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use log::*;
use sqlx::SqlitePool;

use super::db::{analytics, deliveries, endpoints, new_pool, orders, policies, tips};
use crate::{
    db_types::{
        CancellationAnalytics,
        CancellationPolicy,
        DeliveryStatus,
        EventKind,
        NewCancellationPolicy,
        NewOrder,
        NewTip,
        Order,
        OrderId,
        OrderItem,
        PaymentStatus,
        SettlementStatus,
        StatusHistoryEntry,
        Tip,
        WebhookDelivery,
        WebhookEndpoint,
    },
    lifecycle::Transition,
    traits::{
        CancellationPolicyManagement,
        DeliveryUpdate,
        EndpointChanges,
        EndpointDraft,
        NewDelivery,
        OrderFlowError,
        OrderManagement,
        TipManagement,
        WebhookError,
        WebhookManagement,
    },
    validation::ValidationErrors,
};

pub const DEFAULT_DB_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct SqliteDatabase {
    url: String,
    pool: SqlitePool,
    deadline: Duration,
}

impl Debug for SqliteDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "SqliteDatabase ({}, deadline {:?})", self.url, self.deadline)
    }
}

impl SqliteDatabase {
    pub async fn new_with_url(url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        Self::new_with_deadline(url, max_connections, DEFAULT_DB_DEADLINE).await
    }

    /// Creates a pool whose busy timeout matches `deadline`, and runs every store method under that deadline.
    pub async fn new_with_deadline(url: &str, max_connections: u32, deadline: Duration) -> Result<Self, sqlx::Error> {
        trace!("Creating new database connection pool with url {url}");
        let pool = new_pool(url, max_connections, deadline).await?;
        Ok(Self { url: url.to_string(), pool, deadline })
    }

    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Brings the schema up to date.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./src/sqlite/migrations").run(&self.pool).await?;
        info!("🗃️ Database migrations complete");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
        debug!("🗃️ Connection pool for {} closed", self.url);
    }

    async fn order_op<T, F>(&self, op: F) -> Result<T, OrderFlowError>
    where F: Future<Output = Result<T, OrderFlowError>> {
        tokio::time::timeout(self.deadline, op).await.map_err(|_| {
            warn!("🗃️ Order store operation exceeded the {:?} deadline", self.deadline);
            OrderFlowError::StoreUnavailable(format!("The database did not respond within {:?}", self.deadline))
        })?
    }

    async fn webhook_op<T, F>(&self, op: F) -> Result<T, WebhookError>
    where F: Future<Output = Result<T, WebhookError>> {
        tokio::time::timeout(self.deadline, op).await.map_err(|_| {
            warn!("🗃️ Webhook store operation exceeded the {:?} deadline", self.deadline);
            WebhookError::StoreUnavailable(format!("The database did not respond within {:?}", self.deadline))
        })?
    }
}

fn stale_threshold(now: DateTime<Utc>, claim_ttl: ChronoDuration) -> DateTime<Utc> {
    now - claim_ttl
}

impl OrderManagement for SqliteDatabase {
    async fn insert_order(
        &self,
        customer_id: &str,
        order: NewOrder,
        policy: &CancellationPolicy,
        now: DateTime<Utc>,
    ) -> Result<Order, OrderFlowError> {
        self.order_op(async {
            let (subtotal, total) = order
                .subtotal()
                .zip(order.total())
                .ok_or_else(|| ValidationErrors::single("total_amount", "is too large"))?;
            let mut tx = self.pool.begin().await?;
            let saved = orders::insert_order(customer_id, &order, subtotal, total, policy, now, &mut tx).await?;
            orders::insert_items(saved.id, &order.items, &mut tx).await?;
            orders::append_history(saved.id, saved.status, "Order placed", customer_id, now, &mut tx).await?;
            analytics::record_order(now.date_naive(), now, &mut tx).await?;
            tx.commit().await?;
            debug!("🗃️ Order {} saved for customer {customer_id} with {} items", saved.id, order.items.len());
            Ok::<_, OrderFlowError>(saved)
        })
        .await
    }

    async fn fetch_order(&self, id: OrderId) -> Result<Option<Order>, OrderFlowError> {
        self.order_op(async {
            let mut conn = self.pool.acquire().await?;
            let order = orders::fetch_order(id, &mut conn).await?;
            Ok::<_, OrderFlowError>(order)
        })
        .await
    }

    async fn fetch_order_items(&self, id: OrderId) -> Result<Vec<OrderItem>, OrderFlowError> {
        self.order_op(async {
            let mut conn = self.pool.acquire().await?;
            let items = orders::fetch_items(id, &mut conn).await?;
            Ok::<_, OrderFlowError>(items)
        })
        .await
    }

    async fn fetch_status_history(&self, id: OrderId) -> Result<Vec<StatusHistoryEntry>, OrderFlowError> {
        self.order_op(async {
            let mut conn = self.pool.acquire().await?;
            let history = orders::fetch_history(id, &mut conn).await?;
            Ok::<_, OrderFlowError>(history)
        })
        .await
    }

    async fn apply_transition(
        &self,
        expected: &Order,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<Option<Order>, OrderFlowError> {
        self.order_op(async {
            let mut tx = self.pool.begin().await?;
            let Some(mut updated) =
                orders::apply_changes(expected, transition.to, &transition.changes, now, &mut tx).await?
            else {
                debug!(
                    "🗃️ Order {} moved on before {} -> {} could be applied",
                    expected.id, transition.from, transition.to
                );
                return Ok(None);
            };
            if let Some(message) = &transition.history {
                orders::append_history(updated.id, transition.to, message, &transition.actor, now, &mut tx).await?;
            }
            if let Some(outcome) = &transition.cancellation {
                analytics::record_cancellation(now.date_naive(), outcome, now, &mut tx).await?;
            }
            if transition.void_pending_tips {
                let voided = tips::void_pending(updated.id, now, &mut tx).await?;
                if voided > 0 {
                    debug!("🗃️ {voided} pending tips on order {} voided", updated.id);
                    if let Some(order) = orders::refresh_tip_total(updated.id, false, now, &mut tx).await? {
                        updated = order;
                    }
                }
            }
            tx.commit().await?;
            trace!("🗃️ Order {} is now {} (seq {})", updated.id, updated.status, updated.event_seq);
            Ok::<_, OrderFlowError>(Some(updated))
        })
        .await
    }

    async fn fetch_orders_with_open_countdown(&self) -> Result<Vec<Order>, OrderFlowError> {
        self.order_op(async {
            let mut conn = self.pool.acquire().await?;
            let orders = orders::fetch_open_countdowns(&mut conn).await?;
            Ok::<_, OrderFlowError>(orders)
        })
        .await
    }

    async fn update_payment_status(
        &self,
        id: OrderId,
        expected: PaymentStatus,
        new_status: PaymentStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Order>, OrderFlowError> {
        self.order_op(async {
            let mut conn = self.pool.acquire().await?;
            let order = orders::update_payment_status(id, expected, new_status, now, &mut conn).await?;
            Ok::<_, OrderFlowError>(order)
        })
        .await
    }
}

impl CancellationPolicyManagement for SqliteDatabase {
    async fn fetch_active_policy(&self) -> Result<Option<CancellationPolicy>, OrderFlowError> {
        self.order_op(async {
            let mut conn = self.pool.acquire().await?;
            let policy = policies::fetch_active(&mut conn).await?;
            Ok::<_, OrderFlowError>(policy)
        })
        .await
    }

    async fn fetch_policy(&self, id: i64) -> Result<Option<CancellationPolicy>, OrderFlowError> {
        self.order_op(async {
            let mut conn = self.pool.acquire().await?;
            let policy = policies::fetch_policy(id, &mut conn).await?;
            Ok::<_, OrderFlowError>(policy)
        })
        .await
    }

    async fn insert_policy(
        &self,
        policy: NewCancellationPolicy,
        updated_by: &str,
        now: DateTime<Utc>,
    ) -> Result<CancellationPolicy, OrderFlowError> {
        self.order_op(async {
            let mut tx = self.pool.begin().await?;
            let policy = policies::replace_active(&policy, updated_by, now, &mut tx).await?;
            tx.commit().await?;
            info!("🗃️ Cancellation policy #{} activated by {updated_by}", policy.id);
            Ok::<_, OrderFlowError>(policy)
        })
        .await
    }

    async fn fetch_cancellation_analytics(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<CancellationAnalytics>, OrderFlowError> {
        self.order_op(async {
            let mut conn = self.pool.acquire().await?;
            let rows = analytics::fetch_range(from, to, &mut conn).await?;
            Ok::<_, OrderFlowError>(rows)
        })
        .await
    }
}

impl TipManagement for SqliteDatabase {
    async fn upsert_tip(
        &self,
        order: &Order,
        payer_id: &str,
        recipient_id: &str,
        tip: &NewTip,
        now: DateTime<Utc>,
    ) -> Result<Tip, OrderFlowError> {
        self.order_op(async {
            let mut tx = self.pool.begin().await?;
            if !orders::touch_if_status(order.id, order.status, now, &mut tx).await? {
                return Err(OrderFlowError::Conflict(format!("Order {} changed while the tip was being added", order.id)));
            }
            let existing = tips::fetch_for_recipient_kind(order.id, tip.recipient_kind, &mut tx).await?;
            let saved = match existing {
                Some(t) if t.status != SettlementStatus::Pending => return Err(OrderFlowError::AlreadySettled(t.id)),
                Some(t) => tips::replace_pending(t.id, payer_id, recipient_id, tip, now, &mut tx)
                    .await?
                    .ok_or(OrderFlowError::AlreadySettled(t.id))?,
                None => tips::insert_tip(order.id, payer_id, recipient_id, tip, now, &mut tx).await?,
            };
            orders::refresh_tip_total(order.id, false, now, &mut tx).await?;
            tx.commit().await?;
            debug!("🗃️ {} tip #{} of {} recorded on order {}", saved.recipient_kind, saved.id, saved.amount, order.id);
            Ok::<_, OrderFlowError>(saved)
        })
        .await
    }

    async fn fetch_tip(&self, id: i64) -> Result<Option<Tip>, OrderFlowError> {
        self.order_op(async {
            let mut conn = self.pool.acquire().await?;
            let tip = tips::fetch_tip(id, &mut conn).await?;
            Ok::<_, OrderFlowError>(tip)
        })
        .await
    }

    async fn fetch_tips_for_order(&self, order_id: OrderId) -> Result<Vec<Tip>, OrderFlowError> {
        self.order_op(async {
            let mut conn = self.pool.acquire().await?;
            let tips = tips::fetch_for_order(order_id, &mut conn).await?;
            Ok::<_, OrderFlowError>(tips)
        })
        .await
    }

    async fn settle_tip(
        &self,
        id: i64,
        status: SettlementStatus,
        payment_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<(Tip, Order)>, OrderFlowError> {
        self.order_op(async {
            let mut tx = self.pool.begin().await?;
            let Some(tip) = tips::settle(id, status, payment_id.as_deref(), now, &mut tx).await? else {
                return Ok(None);
            };
            let order = orders::refresh_tip_total(tip.order_id, true, now, &mut tx)
                .await?
                .ok_or(OrderFlowError::OrderNotFound(tip.order_id))?;
            tx.commit().await?;
            debug!("🗃️ Tip #{id} settled as {status}");
            Ok::<_, OrderFlowError>(Some((tip, order)))
        })
        .await
    }
}

impl WebhookManagement for SqliteDatabase {
    async fn insert_endpoint(&self, draft: EndpointDraft, now: DateTime<Utc>) -> Result<WebhookEndpoint, WebhookError> {
        self.webhook_op(async {
            let mut conn = self.pool.acquire().await?;
            let endpoint = endpoints::insert_endpoint(&draft, now, &mut conn).await?;
            Ok::<_, WebhookError>(endpoint)
        })
        .await
    }

    async fn fetch_endpoint(&self, id: i64) -> Result<Option<WebhookEndpoint>, WebhookError> {
        self.webhook_op(async {
            let mut conn = self.pool.acquire().await?;
            let endpoint = endpoints::fetch_endpoint(id, &mut conn).await?;
            Ok::<_, WebhookError>(endpoint)
        })
        .await
    }

    async fn fetch_endpoints_for_owner(&self, owner_id: &str) -> Result<Vec<WebhookEndpoint>, WebhookError> {
        self.webhook_op(async {
            let mut conn = self.pool.acquire().await?;
            let endpoints = endpoints::fetch_for_owner(owner_id, &mut conn).await?;
            Ok::<_, WebhookError>(endpoints)
        })
        .await
    }

    async fn update_endpoint(
        &self,
        id: i64,
        changes: EndpointChanges,
        now: DateTime<Utc>,
    ) -> Result<Option<WebhookEndpoint>, WebhookError> {
        self.webhook_op(async {
            let mut conn = self.pool.acquire().await?;
            let endpoint = endpoints::update_endpoint(id, &changes, now, &mut conn).await?;
            Ok::<_, WebhookError>(endpoint)
        })
        .await
    }

    async fn soft_delete_endpoint(&self, id: i64, now: DateTime<Utc>) -> Result<u64, WebhookError> {
        self.webhook_op(async {
            let mut tx = self.pool.begin().await?;
            if !endpoints::mark_deleted(id, now, &mut tx).await? {
                return Err(WebhookError::EndpointNotFound(id));
            }
            let abandoned = deliveries::abandon_pending_for_endpoint(id, "Endpoint deleted", now, &mut tx).await?;
            tx.commit().await?;
            info!("🗃️ Webhook endpoint #{id} deleted. {abandoned} pending deliveries abandoned");
            Ok::<_, WebhookError>(abandoned)
        })
        .await
    }

    async fn fetch_subscribed_endpoints(&self, kind: EventKind) -> Result<Vec<WebhookEndpoint>, WebhookError> {
        self.webhook_op(async {
            let mut conn = self.pool.acquire().await?;
            let endpoints = endpoints::fetch_subscribed(kind, &mut conn).await?;
            Ok::<_, WebhookError>(endpoints)
        })
        .await
    }

    async fn enqueue_deliveries(
        &self,
        endpoint_ids: &[i64],
        delivery: &NewDelivery,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>, WebhookError> {
        if endpoint_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.webhook_op(async {
            let mut tx = self.pool.begin().await?;
            let mut ids = Vec::with_capacity(endpoint_ids.len());
            for endpoint_id in endpoint_ids {
                ids.push(deliveries::insert_delivery(*endpoint_id, delivery, now, &mut tx).await?);
            }
            tx.commit().await?;
            trace!("🗃️ {} deliveries of {} queued", ids.len(), delivery.event_kind);
            Ok::<_, WebhookError>(ids)
        })
        .await
    }

    async fn fetch_delivery(&self, id: i64) -> Result<Option<WebhookDelivery>, WebhookError> {
        self.webhook_op(async {
            let mut conn = self.pool.acquire().await?;
            let delivery = deliveries::fetch_delivery(id, &mut conn).await?;
            Ok::<_, WebhookError>(delivery)
        })
        .await
    }

    async fn fetch_deliveries_for_endpoint(
        &self,
        endpoint_id: i64,
        status: Option<DeliveryStatus>,
        limit: i64,
    ) -> Result<Vec<WebhookDelivery>, WebhookError> {
        self.webhook_op(async {
            let mut conn = self.pool.acquire().await?;
            let deliveries = deliveries::fetch_for_endpoint(endpoint_id, status, limit, &mut conn).await?;
            Ok::<_, WebhookError>(deliveries)
        })
        .await
    }

    async fn claim_delivery(
        &self,
        id: i64,
        worker_id: &str,
        now: DateTime<Utc>,
        claim_ttl: ChronoDuration,
    ) -> Result<Option<WebhookDelivery>, WebhookError> {
        self.webhook_op(async {
            let mut conn = self.pool.acquire().await?;
            let stale_before = stale_threshold(now, claim_ttl);
            let delivery = deliveries::claim(id, worker_id, now, stale_before, &mut conn).await?;
            Ok::<_, WebhookError>(delivery)
        })
        .await
    }

    async fn record_attempt(
        &self,
        id: i64,
        worker_id: &str,
        update: DeliveryUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<WebhookDelivery>, WebhookError> {
        self.webhook_op(async {
            let mut conn = self.pool.acquire().await?;
            let delivery = deliveries::record_attempt(id, worker_id, &update, now, &mut conn).await?;
            Ok::<_, WebhookError>(delivery)
        })
        .await
    }

    async fn fetch_due_deliveries(
        &self,
        now: DateTime<Utc>,
        claim_ttl: ChronoDuration,
        limit: i64,
    ) -> Result<Vec<i64>, WebhookError> {
        self.webhook_op(async {
            let mut conn = self.pool.acquire().await?;
            let ids = deliveries::fetch_due(now, stale_threshold(now, claim_ttl), limit, &mut conn).await?;
            Ok::<_, WebhookError>(ids)
        })
        .await
    }

    async fn reset_delivery(&self, id: i64, now: DateTime<Utc>) -> Result<Option<WebhookDelivery>, WebhookError> {
        self.webhook_op(async {
            let mut conn = self.pool.acquire().await?;
            let delivery = deliveries::reset_failed(id, now, &mut conn).await?;
            Ok::<_, WebhookError>(delivery)
        })
        .await
    }
}
