//! In-process pub-sub for order events.
//!
//! Components subscribe to engine events by registering a [`Handler`]. Each handler gets its own task and its own
//! bounded queue. Events are handled one at a time, in the order they were published, so a subscriber sees the
//! events for a given order in commit order. Handlers are stateless and only receive the event itself.
use std::{future::Future, pin::Pin, sync::Arc};

use log::*;
use tokio::sync::mpsc;

pub type Handler<E> = Arc<dyn Fn(E) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

pub struct EventHandler<E: Send + Sync + 'static> {
    name: &'static str,
    listener: mpsc::Receiver<E>,
    sender: mpsc::Sender<E>,
    handler: Handler<E>,
}

impl<E: Send + Sync + 'static> EventHandler<E> {
    pub fn new(name: &'static str, buffer_size: usize, handler: Handler<E>) -> Self {
        let (sender, receiver) = mpsc::channel(buffer_size);
        Self { name, listener: receiver, sender, handler }
    }

    pub fn subscribe(&self) -> EventProducer<E> {
        EventProducer::new(self.sender.clone())
    }

    /// Runs until every producer has been dropped and the queue is drained.
    pub async fn start_handler(mut self) {
        debug!("📬️ Starting {} event handler", self.name);
        // Only producers keep the channel open, so dropping the last one shuts the handler down
        drop(self.sender);
        let mut handled = 0u64;
        while let Some(ev) = self.listener.recv().await {
            (self.handler)(ev).await;
            handled += 1;
            trace!("📬️ {} handled event #{handled}", self.name);
        }
        debug!("📬️ {} event handler has shut down after {handled} events", self.name);
    }
}

#[derive(Clone)]
pub struct EventProducer<E: Send + Sync> {
    sender: mpsc::Sender<E>,
}

impl<E: Send + Sync> EventProducer<E> {
    pub fn new(sender: mpsc::Sender<E>) -> Self {
        Self { sender }
    }

    /// Waits for queue space. Only fails if the handler has shut down, which is logged.
    pub async fn publish_event(&self, event: E) {
        if let Err(e) = self.sender.send(event).await {
            error!("📬️ Failed to send event: {e}");
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use super::*;

    #[tokio::test]
    async fn events_are_handled_in_publish_order() {
        let _ = env_logger::try_init();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: Handler<u64> = Arc::new(move |v: u64| {
            let sink = sink.clone();
            Box::pin(async move {
                // Later events finish faster, so concurrent handling would reorder them
                tokio::time::sleep(tokio::time::Duration::from_millis(20 - v * 2)).await;
                sink.lock().unwrap().push(v);
            }) as Pin<Box<dyn Future<Output = ()> + Send>>
        });
        let event_handler = EventHandler::new("test", 2, handler);
        let producer = event_handler.subscribe();
        tokio::spawn(async move {
            for v in 0..8 {
                producer.publish_event(v).await;
            }
        });
        event_handler.start_handler().await;
        assert_eq!(*seen.lock().unwrap(), (0..8).collect::<Vec<_>>());
    }
}
