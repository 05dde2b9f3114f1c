use std::{future::Future, pin::Pin, sync::Arc};

use crate::events::{EventHandler, EventProducer, Handler, OrderEvent};

#[derive(Default, Clone)]
pub struct EventProducers {
    pub order_event_producers: Vec<EventProducer<OrderEvent>>,
}

pub struct EventHandlers {
    pub on_order_event: Vec<EventHandler<OrderEvent>>,
}

impl EventHandlers {
    pub fn new(buffer_size: usize, hooks: EventHooks) -> Self {
        let on_order_event = hooks
            .on_order_event
            .into_iter()
            .map(|(name, f)| EventHandler::new(name, buffer_size, f))
            .collect();
        Self { on_order_event }
    }

    pub fn producers(&self) -> EventProducers {
        let order_event_producers = self.on_order_event.iter().map(EventHandler::subscribe).collect();
        EventProducers { order_event_producers }
    }

    pub async fn start_handlers(self) {
        for handler in self.on_order_event {
            tokio::spawn(async move {
                handler.start_handler().await;
            });
        }
    }
}

/// Subscribers to engine events. Each named hook runs on its own task and sees every order event in publish order.
#[derive(Default, Clone)]
pub struct EventHooks {
    pub on_order_event: Vec<(&'static str, Handler<OrderEvent>)>,
}

impl EventHooks {
    pub fn on_order_event<F>(&mut self, name: &'static str, f: F) -> &mut Self
    where F: (Fn(OrderEvent) -> Pin<Box<dyn Future<Output = ()> + Send>>) + Send + Sync + 'static {
        self.on_order_event.push((name, Arc::new(f)));
        self
    }
}
