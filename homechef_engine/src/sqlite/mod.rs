//! SQLite backend for the HomeChef store.
mod sqlite_impl;

pub mod db;
pub use sqlite_impl::{SqliteDatabase, DEFAULT_DB_DEADLINE};
