use chrono::{DateTime, Utc};
use log::*;
use sqlx::SqliteConnection;

use crate::db_types::{CancellationPolicy, NewCancellationPolicy};

pub async fn fetch_active(conn: &mut SqliteConnection) -> Result<Option<CancellationPolicy>, sqlx::Error> {
    let policy = sqlx::query_as("SELECT * FROM cancellation_policies WHERE is_active = 1 LIMIT 1")
        .fetch_optional(conn)
        .await?;
    Ok(policy)
}

pub async fn fetch_policy(id: i64, conn: &mut SqliteConnection) -> Result<Option<CancellationPolicy>, sqlx::Error> {
    let policy =
        sqlx::query_as("SELECT * FROM cancellation_policies WHERE id = $1").bind(id).fetch_optional(conn).await?;
    Ok(policy)
}

/// Deactivates the current policy and inserts `policy` as the new active version. Call inside a transaction.
pub async fn replace_active(
    policy: &NewCancellationPolicy,
    updated_by: &str,
    now: DateTime<Utc>,
    conn: &mut SqliteConnection,
) -> Result<CancellationPolicy, sqlx::Error> {
    let retired = sqlx::query("UPDATE cancellation_policies SET is_active = 0 WHERE is_active = 1")
        .execute(&mut *conn)
        .await?
        .rows_affected();
    let policy: CancellationPolicy = sqlx::query_as(
        r#"
            INSERT INTO cancellation_policies (
                free_window_seconds,
                penalty_rate,
                min_penalty,
                max_penalty,
                description,
                is_active,
                updated_by,
                updated_at
            ) VALUES ($1, $2, $3, $4, $5, 1, $6, $7)
            RETURNING *;
        "#,
    )
    .bind(policy.free_window_seconds)
    .bind(policy.penalty_rate)
    .bind(policy.min_penalty)
    .bind(policy.max_penalty)
    .bind(&policy.description)
    .bind(updated_by)
    .bind(now)
    .fetch_one(conn)
    .await?;
    debug!("🗃️ Cancellation policy #{} is now active ({retired} retired)", policy.id);
    Ok(policy)
}
