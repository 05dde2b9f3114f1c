//! Daily cancellation analytics. Buckets are created on first use and updated incrementally; the mean is always
//! recomputed from the stored sum and count rather than from the previous mean.
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::SqliteConnection;

use crate::{
    db_types::{CancellationAnalytics, CancellationType},
    lifecycle::CancellationOutcome,
};

pub async fn record_order(day: NaiveDate, now: DateTime<Utc>, conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
            INSERT INTO cancellation_analytics (day, total_orders, updated_at) VALUES ($1, 1, $2)
            ON CONFLICT (day) DO UPDATE SET
                total_orders = total_orders + 1,
                updated_at = excluded.updated_at;
        "#,
    )
    .bind(day)
    .bind(now)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn record_cancellation(
    day: NaiveDate,
    outcome: &CancellationOutcome,
    now: DateTime<Utc>,
    conn: &mut SqliteConnection,
) -> Result<(), sqlx::Error> {
    let (free, penalty) = match outcome.kind {
        CancellationType::Free => (1i64, 0i64),
        CancellationType::Penalty => (0, 1),
    };
    sqlx::query(
        r#"
            INSERT INTO cancellation_analytics (
                day,
                total_cancellations,
                free_cancellations,
                penalty_cancellations,
                total_penalties,
                total_seconds_to_cancel,
                avg_seconds_to_cancel,
                updated_at
            ) VALUES ($1, 1, $2, $3, $4, $5, CAST($5 AS REAL), $6)
            ON CONFLICT (day) DO UPDATE SET
                total_cancellations = total_cancellations + 1,
                free_cancellations = free_cancellations + excluded.free_cancellations,
                penalty_cancellations = penalty_cancellations + excluded.penalty_cancellations,
                total_penalties = total_penalties + excluded.total_penalties,
                total_seconds_to_cancel = total_seconds_to_cancel + excluded.total_seconds_to_cancel,
                avg_seconds_to_cancel =
                    CAST(total_seconds_to_cancel + excluded.total_seconds_to_cancel AS REAL) / (total_cancellations + 1),
                updated_at = excluded.updated_at;
        "#,
    )
    .bind(day)
    .bind(free)
    .bind(penalty)
    .bind(outcome.penalty)
    .bind(outcome.seconds_to_cancel)
    .bind(now)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn fetch_range(
    from: NaiveDate,
    to: NaiveDate,
    conn: &mut SqliteConnection,
) -> Result<Vec<CancellationAnalytics>, sqlx::Error> {
    let rows = sqlx::query_as("SELECT * FROM cancellation_analytics WHERE day >= $1 AND day <= $2 ORDER BY day")
        .bind(from)
        .bind(to)
        .fetch_all(conn)
        .await?;
    Ok(rows)
}
