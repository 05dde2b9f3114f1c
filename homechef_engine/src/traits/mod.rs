//! # Store contracts
//!
//! The traits in this module define what a storage backend must provide for the engine to run on it. The
//! [`SqliteDatabase`](crate::SqliteDatabase) backend implements all of them.
//!
//! * [`OrderManagement`] persists orders, their items and the status history, and applies state transitions with
//!   compare-and-swap semantics.
//! * [`CancellationPolicyManagement`] stores versioned cancellation policies and the daily cancellation analytics.
//! * [`TipManagement`] stores tips and their settlement.
//! * [`WebhookManagement`] stores webhook endpoints and the durable delivery queue.
//!
//! [`HomeChefDatabase`] bundles them for components that need the whole store.
mod data_objects;
mod order_management;
mod policy_management;
mod tip_management;
mod webhook_management;

pub use data_objects::{DeliveryUpdate, EndpointChanges, EndpointDraft, NewDelivery};
pub use order_management::{OrderFlowError, OrderManagement};
pub use policy_management::CancellationPolicyManagement;
pub use tip_management::TipManagement;
pub use webhook_management::{WebhookError, WebhookManagement};

/// Everything a backend must provide to run the complete order core.
pub trait HomeChefDatabase:
    Clone + OrderManagement + CancellationPolicyManagement + TipManagement + WebhookManagement
{
}

impl<T> HomeChefDatabase for T where T: Clone + OrderManagement + CancellationPolicyManagement + TipManagement + WebhookManagement
{}
