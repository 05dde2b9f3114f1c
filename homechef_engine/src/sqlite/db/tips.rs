use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use crate::db_types::{NewTip, OrderId, SettlementStatus, Tip, TipRecipient};

pub async fn fetch_tip(id: i64, conn: &mut SqliteConnection) -> Result<Option<Tip>, sqlx::Error> {
    let tip = sqlx::query_as("SELECT * FROM tips WHERE id = $1").bind(id).fetch_optional(conn).await?;
    Ok(tip)
}

pub async fn fetch_for_order(order_id: OrderId, conn: &mut SqliteConnection) -> Result<Vec<Tip>, sqlx::Error> {
    let tips =
        sqlx::query_as("SELECT * FROM tips WHERE order_id = $1 ORDER BY id").bind(order_id).fetch_all(conn).await?;
    Ok(tips)
}

pub async fn fetch_for_recipient_kind(
    order_id: OrderId,
    kind: TipRecipient,
    conn: &mut SqliteConnection,
) -> Result<Option<Tip>, sqlx::Error> {
    let tip = sqlx::query_as("SELECT * FROM tips WHERE order_id = $1 AND recipient_kind = $2")
        .bind(order_id)
        .bind(kind)
        .fetch_optional(conn)
        .await?;
    Ok(tip)
}

pub async fn insert_tip(
    order_id: OrderId,
    payer_id: &str,
    recipient_id: &str,
    tip: &NewTip,
    now: DateTime<Utc>,
    conn: &mut SqliteConnection,
) -> Result<Tip, sqlx::Error> {
    let tip = sqlx::query_as(
        r#"
            INSERT INTO tips (order_id, payer_id, recipient_id, recipient_kind, amount, message, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            RETURNING *;
        "#,
    )
    .bind(order_id)
    .bind(payer_id)
    .bind(recipient_id)
    .bind(tip.recipient_kind)
    .bind(tip.amount)
    .bind(&tip.message)
    .bind(now)
    .fetch_one(conn)
    .await?;
    Ok(tip)
}

/// Overwrites a tip that is still pending. Returns `None` if it has been settled in the meantime.
pub async fn replace_pending(
    id: i64,
    payer_id: &str,
    recipient_id: &str,
    tip: &NewTip,
    now: DateTime<Utc>,
    conn: &mut SqliteConnection,
) -> Result<Option<Tip>, sqlx::Error> {
    let tip = sqlx::query_as(
        r#"
            UPDATE tips SET payer_id = $1, recipient_id = $2, amount = $3, message = $4, updated_at = $5
            WHERE id = $6 AND status = 'pending'
            RETURNING *;
        "#,
    )
    .bind(payer_id)
    .bind(recipient_id)
    .bind(tip.amount)
    .bind(&tip.message)
    .bind(now)
    .bind(id)
    .fetch_optional(conn)
    .await?;
    Ok(tip)
}

pub async fn settle(
    id: i64,
    status: SettlementStatus,
    payment_id: Option<&str>,
    now: DateTime<Utc>,
    conn: &mut SqliteConnection,
) -> Result<Option<Tip>, sqlx::Error> {
    let tip = sqlx::query_as(
        r#"
            UPDATE tips SET status = $1, payment_id = COALESCE($2, payment_id), settled_at = $3, updated_at = $3
            WHERE id = $4 AND status = 'pending'
            RETURNING *;
        "#,
    )
    .bind(status)
    .bind(payment_id)
    .bind(now)
    .bind(id)
    .fetch_optional(conn)
    .await?;
    Ok(tip)
}

/// Marks every pending tip on the order as failed. Returns the number of tips voided.
pub async fn void_pending(order_id: OrderId, now: DateTime<Utc>, conn: &mut SqliteConnection) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE tips SET status = 'failed', settled_at = $1, updated_at = $1 WHERE order_id = $2 AND status = 'pending'",
    )
    .bind(now)
    .bind(order_id)
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}
