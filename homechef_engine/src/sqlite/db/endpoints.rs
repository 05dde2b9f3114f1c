use chrono::{DateTime, Utc};
use log::*;
use sqlx::{types::Json, QueryBuilder, Sqlite, SqliteConnection};

use crate::{
    db_types::{EventKind, WebhookEndpoint},
    traits::{EndpointChanges, EndpointDraft},
};

pub async fn insert_endpoint(
    draft: &EndpointDraft,
    now: DateTime<Utc>,
    conn: &mut SqliteConnection,
) -> Result<WebhookEndpoint, sqlx::Error> {
    let endpoint: WebhookEndpoint = sqlx::query_as(
        r#"
            INSERT INTO webhook_endpoints (
                owner_id,
                url,
                events,
                secret_ciphertext,
                description,
                max_attempts,
                base_delay_seconds,
                created_at,
                updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            RETURNING *;
        "#,
    )
    .bind(&draft.owner_id)
    .bind(&draft.url)
    .bind(Json(&draft.events))
    .bind(&draft.secret_ciphertext)
    .bind(&draft.description)
    .bind(draft.max_attempts)
    .bind(draft.base_delay_seconds)
    .bind(now)
    .fetch_one(conn)
    .await?;
    debug!("🗃️ Webhook endpoint #{} created for {}", endpoint.id, endpoint.owner_id);
    Ok(endpoint)
}

pub async fn fetch_endpoint(id: i64, conn: &mut SqliteConnection) -> Result<Option<WebhookEndpoint>, sqlx::Error> {
    let endpoint =
        sqlx::query_as("SELECT * FROM webhook_endpoints WHERE id = $1").bind(id).fetch_optional(conn).await?;
    Ok(endpoint)
}

pub async fn fetch_for_owner(owner_id: &str, conn: &mut SqliteConnection) -> Result<Vec<WebhookEndpoint>, sqlx::Error> {
    let endpoints =
        sqlx::query_as("SELECT * FROM webhook_endpoints WHERE owner_id = $1 AND deleted_at IS NULL ORDER BY id")
            .bind(owner_id)
            .fetch_all(conn)
            .await?;
    Ok(endpoints)
}

/// Active, undeleted endpoints whose subscription list contains `kind`.
pub async fn fetch_subscribed(kind: EventKind, conn: &mut SqliteConnection) -> Result<Vec<WebhookEndpoint>, sqlx::Error> {
    let candidates: Vec<WebhookEndpoint> =
        sqlx::query_as("SELECT * FROM webhook_endpoints WHERE is_active = 1 AND deleted_at IS NULL ORDER BY id")
            .fetch_all(conn)
            .await?;
    Ok(candidates.into_iter().filter(|e| e.is_subscribed_to(kind)).collect())
}

/// Applies `changes` to an endpoint that has not been deleted. Returns `None` if there is no such endpoint.
pub async fn update_endpoint(
    id: i64,
    changes: &EndpointChanges,
    now: DateTime<Utc>,
    conn: &mut SqliteConnection,
) -> Result<Option<WebhookEndpoint>, sqlx::Error> {
    let mut builder = QueryBuilder::<Sqlite>::new("UPDATE webhook_endpoints SET updated_at = ");
    builder.push_bind(now);
    if let Some(url) = &changes.url {
        builder.push(", url = ").push_bind(url.clone());
    }
    if let Some(events) = &changes.events {
        builder.push(", events = ").push_bind(Json(events.clone()));
    }
    if let Some(description) = &changes.description {
        builder.push(", description = ").push_bind(description.clone());
    }
    if let Some(active) = changes.is_active {
        builder.push(", is_active = ").push_bind(active);
    }
    if let Some(n) = changes.max_attempts {
        builder.push(", max_attempts = ").push_bind(n);
    }
    if let Some(n) = changes.base_delay_seconds {
        builder.push(", base_delay_seconds = ").push_bind(n);
    }
    builder.push(" WHERE id = ").push_bind(id).push(" AND deleted_at IS NULL RETURNING *");
    let endpoint = builder.build_query_as::<WebhookEndpoint>().fetch_optional(conn).await?;
    Ok(endpoint)
}

/// Soft-deletes the endpoint. Returns false if it was already deleted or does not exist.
pub async fn mark_deleted(id: i64, now: DateTime<Utc>, conn: &mut SqliteConnection) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE webhook_endpoints SET is_active = 0, deleted_at = $1, updated_at = $1 WHERE id = $2 AND deleted_at IS \
         NULL",
    )
    .bind(now)
    .bind(id)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() == 1)
}
