//! The order state machine.
//!
//! Planning is pure: [`plan`] looks at a snapshot of an order and a command and returns a [`Transition`] describing
//! the new state, the columns that change, the status-history row and the event to publish. Committing the
//! transition is the store's job (see [`crate::traits::OrderManagement::apply_transition`]) and publishing the event
//! is the [`crate::events::EventBus`]'s job, so neither I/O nor locking leaks into the rules themselves.
mod countdown_status;
mod penalty;
mod transition;

pub use countdown_status::CountdownStatus;
pub use penalty::{assess_cancellation, is_free_cancellation, penalty_for, CancellationOutcome};
pub use transition::{plan, FlowSettings, OrderChanges, OrderCommand, Transition};
