//! The engine's public API. Each API object wraps a store backend and exposes the operations of one area:
//!
//! * [`OrderFlowApi`] places orders, applies lifecycle commands, handles tips, payment callbacks and the
//!   free-cancellation countdowns.
//! * [`PolicyApi`] manages cancellation policies and reads the cancellation analytics.
//! * [`WebhookApi`] manages webhook endpoints and their delivery log.
mod order_flow_api;
mod policy_api;
mod webhook_api;

pub mod order_objects;
pub mod webhook_objects;

pub use order_flow_api::OrderFlowApi;
pub use policy_api::{PolicyApi, MAX_ANALYTICS_RANGE_DAYS};
pub use webhook_api::WebhookApi;
