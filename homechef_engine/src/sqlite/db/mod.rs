//! # SQLite Database methods
//!
//! This module contains "low-level" SQLite database interactions.
//!
//! All these interaction are maintained by simple functions (rather than stateful structs) that accept a
//! `&mut SqliteConnection` argument. Callers can obtain a connection from a pool, or open a transaction and pass
//! `&mut tx` through to the functions without any other changes.
//!
//! Timestamps are always bound by the caller (never `CURRENT_TIMESTAMP`), so that the engine's clock is the only
//! source of time.
use std::{str::FromStr, time::Duration};

use log::*;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    Error as SqlxError,
    SqlitePool,
};

pub mod analytics;
pub mod deliveries;
pub mod endpoints;
pub mod orders;
pub mod policies;
pub mod tips;

pub const DEFAULT_SQLITE_DB_URL: &str = "sqlite://data/homechef.db";

/// Opens a pool on `url`, creating the database file if needed. Connections use WAL journaling and wait up to
/// `busy_timeout` for a competing writer.
pub async fn new_pool(url: &str, max_connections: u32, busy_timeout: Duration) -> Result<SqlitePool, SqlxError> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(busy_timeout)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(busy_timeout)
        .connect_with(options)
        .await?;
    debug!("🗃️ Connection pool for {url} ready ({max_connections} connections)");
    Ok(pool)
}
