//! # HomeChef server
//! The HTTP and WebSocket front end of the HomeChef order core. It is responsible for:
//! * Authenticating callers (bearer JWTs) and gating routes by role.
//! * Exposing the order lifecycle, cancellation policy and webhook management operations of the engine over REST.
//! * Accepting signed payment callbacks from the payment collaborator.
//! * Pushing order events to connected WebSocket clients through the connection hub.
//! * Running the background workers: the countdown ticker, the webhook dispatch pool and the retry sweeper.
//!
//! ## Configuration
//! The server is configured via environment variables. See [config](config/index.html) for more information.
//!
//! ## Routes
//! * `/health`: liveness probe. No authentication.
//! * `/ws?user_id=&role=`: WebSocket upgrade. No bearer token; see [ws].
//! * `/payments/callback`: payment collaborator callback, HMAC signed.
//! * `/orders/...`, `/cancellation-policy`, `/analytics/cancellations`, `/webhooks/...`, `/ws/stats`: bearer token
//!   required. See [routes].
pub mod auth;
pub mod cli;
pub mod config;
pub mod data_objects;
pub mod errors;
pub mod hub;
pub mod middleware;
pub mod routes;
pub mod server;
pub mod workers;
pub mod ws;

#[cfg(test)]
mod endpoint_tests;
