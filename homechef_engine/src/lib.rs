//! HomeChef Engine
//!
//! The order lifecycle engine and outbound event fabric of the HomeChef marketplace. This library owns the domain
//! logic; the HTTP surface, configuration and background workers live in the server crate.
//!
//! The library is divided into a few main sections:
//! 1. Data types ([`mod@db_types`]) and the store contracts ([`mod@traits`]). The SQLite backend
//!    ([`SqliteDatabase`]) implements every store trait.
//! 2. The order state machine ([`mod@lifecycle`]): pure planning of commands, penalty maths and countdown status.
//! 3. The public API ([`mod@hce_api`]), which commits planned transitions and publishes their events.
//! 4. The event fabric: the [`mod@events`] bus and in-process hooks, and the [`mod@webhooks`] dispatcher.
//!
//! Every time-dependent rule reads the time through a [`clock::Clock`], so that tests can control it.
pub mod clock;
pub mod countdown;
pub mod db_types;
pub mod events;
pub mod hce_api;
pub mod lifecycle;
pub mod traits;
pub mod validation;
pub mod webhooks;

#[cfg(feature = "sqlite")]
mod sqlite;

#[cfg(any(feature = "test_utils", test))]
pub mod test_utils;

pub use hce_api::{OrderFlowApi, PolicyApi, WebhookApi};
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteDatabase, DEFAULT_DB_DEADLINE};
