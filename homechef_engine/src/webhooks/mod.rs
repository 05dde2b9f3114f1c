//! Outbound webhooks: shared secrets, payload signing and the at-least-once dispatcher.
mod dispatcher;
mod secrets;
pub mod signer;

pub use dispatcher::{backoff_delay, envelope, DispatchOutcome, WebhookDispatcher, DEFAULT_DISPATCH_TIMEOUT, MAX_BACKOFF_SECONDS};
pub use secrets::{generate_webhook_secret, SecretVault};
