//! The durable webhook delivery queue.
//!
//! A delivery is due when it is `pending` and `next_retry_at <= now`. Workers claim a delivery by stamping
//! `claimed_by`/`claimed_at` before sending it and release the claim when they record the attempt. A claim older than
//! the caller's stale threshold is treated as abandoned.
use chrono::{DateTime, Utc};
use sqlx::{types::Json, SqliteConnection};

use crate::{
    db_types::{DeliveryStatus, WebhookDelivery},
    traits::{DeliveryUpdate, NewDelivery},
};

pub async fn insert_delivery(
    endpoint_id: i64,
    delivery: &NewDelivery,
    now: DateTime<Utc>,
    conn: &mut SqliteConnection,
) -> Result<i64, sqlx::Error> {
    let id: (i64,) = sqlx::query_as(
        r#"
            INSERT INTO webhook_deliveries (
                endpoint_id,
                event_kind,
                order_id,
                event_seq,
                payload,
                event_timestamp,
                status,
                attempt_count,
                next_retry_at,
                created_at,
                updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, 'pending', 0, $7, $7, $7)
            RETURNING id;
        "#,
    )
    .bind(endpoint_id)
    .bind(delivery.event_kind)
    .bind(delivery.order_id)
    .bind(delivery.event_seq)
    .bind(Json(&delivery.data))
    .bind(delivery.event_timestamp)
    .bind(now)
    .fetch_one(conn)
    .await?;
    Ok(id.0)
}

pub async fn fetch_delivery(id: i64, conn: &mut SqliteConnection) -> Result<Option<WebhookDelivery>, sqlx::Error> {
    let delivery =
        sqlx::query_as("SELECT * FROM webhook_deliveries WHERE id = $1").bind(id).fetch_optional(conn).await?;
    Ok(delivery)
}

pub async fn fetch_for_endpoint(
    endpoint_id: i64,
    status: Option<DeliveryStatus>,
    limit: i64,
    conn: &mut SqliteConnection,
) -> Result<Vec<WebhookDelivery>, sqlx::Error> {
    let deliveries = sqlx::query_as(
        r#"
            SELECT * FROM webhook_deliveries
            WHERE endpoint_id = $1 AND ($2 IS NULL OR status = $2)
            ORDER BY id DESC
            LIMIT $3;
        "#,
    )
    .bind(endpoint_id)
    .bind(status)
    .bind(limit)
    .fetch_all(conn)
    .await?;
    Ok(deliveries)
}

pub async fn claim(
    id: i64,
    worker_id: &str,
    now: DateTime<Utc>,
    stale_before: DateTime<Utc>,
    conn: &mut SqliteConnection,
) -> Result<Option<WebhookDelivery>, sqlx::Error> {
    let delivery = sqlx::query_as(
        r#"
            UPDATE webhook_deliveries SET claimed_by = $1, claimed_at = $2, updated_at = $2
            WHERE id = $3
              AND status = 'pending'
              AND next_retry_at <= $2
              AND (claimed_by IS NULL OR claimed_at <= $4)
            RETURNING *;
        "#,
    )
    .bind(worker_id)
    .bind(now)
    .bind(id)
    .bind(stale_before)
    .fetch_optional(conn)
    .await?;
    Ok(delivery)
}

/// Writes the outcome of an attempt and releases the claim, as long as `worker_id` still holds it.
pub async fn record_attempt(
    id: i64,
    worker_id: &str,
    update: &DeliveryUpdate,
    now: DateTime<Utc>,
    conn: &mut SqliteConnection,
) -> Result<Option<WebhookDelivery>, sqlx::Error> {
    let delivery = sqlx::query_as(
        r#"
            UPDATE webhook_deliveries SET
                status = $1,
                attempt_count = $2,
                last_http_status = $3,
                last_response_body = $4,
                next_retry_at = $5,
                delivered_at = $6,
                failed_at = $7,
                error_message = $8,
                claimed_by = NULL,
                claimed_at = NULL,
                updated_at = $9
            WHERE id = $10 AND claimed_by = $11
            RETURNING *;
        "#,
    )
    .bind(update.status)
    .bind(update.attempt_count)
    .bind(update.last_http_status)
    .bind(&update.last_response_body)
    .bind(update.next_retry_at)
    .bind(update.delivered_at)
    .bind(update.failed_at)
    .bind(&update.error_message)
    .bind(now)
    .bind(id)
    .bind(worker_id)
    .fetch_optional(conn)
    .await?;
    Ok(delivery)
}

pub async fn fetch_due(
    now: DateTime<Utc>,
    stale_before: DateTime<Utc>,
    limit: i64,
    conn: &mut SqliteConnection,
) -> Result<Vec<i64>, sqlx::Error> {
    let ids: Vec<(i64,)> = sqlx::query_as(
        r#"
            SELECT id FROM webhook_deliveries
            WHERE status = 'pending'
              AND next_retry_at <= $1
              AND (claimed_by IS NULL OR claimed_at <= $2)
            ORDER BY next_retry_at, id
            LIMIT $3;
        "#,
    )
    .bind(now)
    .bind(stale_before)
    .bind(limit)
    .fetch_all(conn)
    .await?;
    Ok(ids.into_iter().map(|(id,)| id).collect())
}

/// Abandons every pending delivery for the endpoint. Returns the number of deliveries affected.
pub async fn abandon_pending_for_endpoint(
    endpoint_id: i64,
    reason: &str,
    now: DateTime<Utc>,
    conn: &mut SqliteConnection,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
            UPDATE webhook_deliveries SET
                status = 'failed',
                next_retry_at = NULL,
                failed_at = $1,
                error_message = $2,
                claimed_by = NULL,
                claimed_at = NULL,
                updated_at = $1
            WHERE endpoint_id = $3 AND status = 'pending';
        "#,
    )
    .bind(now)
    .bind(reason)
    .bind(endpoint_id)
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

/// Operator retry: a failed delivery goes back to pending with a clean slate, due at `now`.
pub async fn reset_failed(
    id: i64,
    now: DateTime<Utc>,
    conn: &mut SqliteConnection,
) -> Result<Option<WebhookDelivery>, sqlx::Error> {
    let delivery = sqlx::query_as(
        r#"
            UPDATE webhook_deliveries SET
                status = 'pending',
                attempt_count = 0,
                next_retry_at = $1,
                delivered_at = NULL,
                failed_at = NULL,
                error_message = NULL,
                claimed_by = NULL,
                claimed_at = NULL,
                updated_at = $1
            WHERE id = $2 AND status = 'failed'
            RETURNING *;
        "#,
    )
    .bind(now)
    .bind(id)
    .fetch_optional(conn)
    .await?;
    Ok(delivery)
}
