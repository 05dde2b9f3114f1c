//! Background workers.
//!
//! * The countdown ticker closes free-cancellation windows as their deadlines pass.
//! * The dispatch pool sends webhook deliveries as soon as the event bus queues them.
//! * The retry sweeper picks up deliveries that are due for a retry, or that never made it into the dispatch queue.
//!
//! The workers run on the local task set of the thread that starts them, and stop when the shutdown token is
//! cancelled. Do not await the returned handles before cancelling it, as they would run indefinitely.
use std::{sync::Arc, time::Duration};

use homechef_engine::{
    traits::{HomeChefDatabase, WebhookManagement},
    webhooks::{DispatchOutcome, WebhookDispatcher},
    OrderFlowApi,
};
use log::*;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

const SWEEP_BATCH: i64 = 100;
const MIN_TICK: Duration = Duration::from_millis(10);

pub struct BackgroundWorkers {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundWorkers {
    pub fn new() -> Self {
        Self { handles: Vec::new() }
    }

    pub fn add(&mut self, handle: JoinHandle<()>) {
        self.handles.push(handle);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Waits for every worker to stop. Call after cancelling the shutdown token.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("🕰️ A background worker did not stop cleanly. {e}");
            }
        }
    }
}

impl Default for BackgroundWorkers {
    fn default() -> Self {
        Self::new()
    }
}

/// Starts the countdown ticker. It sleeps until the next countdown deadline, or until a new countdown is scheduled,
/// but never longer than `max_idle`.
pub fn start_countdown_ticker<B>(api: OrderFlowApi<B>, max_idle: Duration, shutdown: CancellationToken) -> JoinHandle<()>
where B: HomeChefDatabase + 'static {
    actix_web::rt::spawn(async move {
        info!("⏳️ Countdown ticker started with {} pending countdowns", api.countdowns().len());
        loop {
            let wait = match api.countdowns().next_deadline() {
                Some(deadline) => (deadline - api.clock().now()).to_std().unwrap_or(Duration::ZERO),
                None => max_idle,
            }
            .clamp(MIN_TICK, max_idle.max(MIN_TICK));
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = api.countdowns().changed() => {},
                _ = tokio::time::sleep(wait) => {},
            }
            let expired = api.expire_due_countdowns().await;
            if expired > 0 {
                debug!("⏳️ {expired} free-cancellation windows closed");
            }
        }
        info!("⏳️ Countdown ticker stopped");
    })
}

/// Starts `workers` dispatchers that share the receiving end of the dispatch queue. On shutdown, whatever is still in
/// the queue is sent before the workers stop.
pub fn start_dispatch_pool<B>(
    dispatcher: WebhookDispatcher<B>,
    queue: mpsc::Receiver<i64>,
    workers: usize,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>>
where
    B: WebhookManagement + Clone + 'static,
{
    let queue = Arc::new(Mutex::new(queue));
    (1..=workers.max(1))
        .map(|n| {
            let dispatcher = dispatcher.for_worker(n);
            let queue = Arc::clone(&queue);
            let shutdown = shutdown.clone();
            actix_web::rt::spawn(async move {
                debug!("🪝️ Dispatch worker {} started", dispatcher.worker_id());
                loop {
                    let next = tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => None,
                        id = async { queue.lock().await.recv().await } => id,
                    };
                    match next {
                        Some(id) => dispatch_one(&dispatcher, id).await,
                        None => break,
                    }
                }
                loop {
                    let next = queue.lock().await.try_recv();
                    match next {
                        Ok(id) => dispatch_one(&dispatcher, id).await,
                        Err(_) => break,
                    }
                }
                debug!("🪝️ Dispatch worker {} stopped", dispatcher.worker_id());
            })
        })
        .collect()
}

async fn dispatch_one<B: WebhookManagement>(dispatcher: &WebhookDispatcher<B>, delivery_id: i64) {
    match dispatcher.dispatch(delivery_id).await {
        Ok(DispatchOutcome::Skipped) => trace!("🪝️ Delivery #{delivery_id} was not due or already claimed"),
        Ok(_) => {},
        // The delivery stays pending, so the sweeper will find it again
        Err(e) => error!("🪝️ Could not dispatch delivery #{delivery_id}. {e}"),
    }
}

/// Starts the retry sweeper, which re-dispatches due deliveries every `interval`.
pub fn start_retry_sweeper<B>(
    dispatcher: WebhookDispatcher<B>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()>
where
    B: WebhookManagement + Clone + 'static,
{
    let dispatcher = dispatcher.for_worker(0);
    actix_web::rt::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("🪝️ Retry sweeper started. Sweeping every {}s", interval.as_secs());
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = timer.tick() => {},
            }
            match dispatcher.sweep(SWEEP_BATCH).await {
                Ok(0) => trace!("🪝️ Nothing to retry"),
                Ok(n) => info!("🪝️ Retry sweep attempted {n} deliveries"),
                Err(e) => error!("🪝️ Retry sweep failed. {e}"),
            }
        }
        info!("🪝️ Retry sweeper stopped");
    })
}
