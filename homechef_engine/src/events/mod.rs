mod bus;
mod channel;
mod event_types;
mod hooks;

pub use bus::EventBus;
pub use channel::{EventHandler, EventProducer, Handler};
pub use event_types::{Audience, OrderEvent};
pub use hooks::{EventHandlers, EventHooks, EventProducers};
