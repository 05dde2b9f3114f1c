//! Deadline queue for free-cancellation countdowns.
//!
//! The scheduler only remembers *when* to look at an order. Whether the countdown actually expires is decided by the
//! order flow against the stored row, so stale or duplicate entries are harmless.
use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use log::*;
use tokio::sync::Notify;

use crate::db_types::OrderId;

#[derive(Debug, Clone, Default)]
pub struct CountdownScheduler {
    queue: Arc<Mutex<BinaryHeap<Reverse<(DateTime<Utc>, OrderId)>>>>,
    changed: Arc<Notify>,
}

impl CountdownScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&self, order_id: OrderId, expiry: DateTime<Utc>) {
        match self.queue.lock() {
            Ok(mut q) => q.push(Reverse((expiry, order_id))),
            Err(e) => {
                error!("⏳️ Countdown queue lock is poisoned. Recovering. {e}");
                e.into_inner().push(Reverse((expiry, order_id)));
            },
        }
        trace!("⏳️ Countdown for order {order_id} scheduled for {expiry}");
        self.changed.notify_one();
    }

    /// Removes and returns every entry due at or before `now`, earliest first.
    pub fn pop_due(&self, now: DateTime<Utc>) -> Vec<OrderId> {
        let mut q = match self.queue.lock() {
            Ok(q) => q,
            Err(e) => e.into_inner(),
        };
        let mut due = Vec::new();
        while let Some(Reverse((expiry, _))) = q.peek() {
            if *expiry > now {
                break;
            }
            if let Some(Reverse((_, id))) = q.pop() {
                due.push(id);
            }
        }
        due
    }

    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        let q = match self.queue.lock() {
            Ok(q) => q,
            Err(e) => e.into_inner(),
        };
        q.peek().map(|Reverse((expiry, _))| *expiry)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves when a new deadline has been scheduled. Tickers use this to wake up early.
    pub async fn changed(&self) {
        self.changed.notified().await
    }
}

#[cfg(test)]
mod test {
    use chrono::{Duration, TimeZone};

    use super::*;

    #[test]
    fn pops_in_expiry_order() {
        let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let s = CountdownScheduler::new();
        s.schedule(OrderId(3), t0 + Duration::seconds(30));
        s.schedule(OrderId(1), t0 + Duration::seconds(10));
        s.schedule(OrderId(2), t0 + Duration::seconds(20));
        assert_eq!(s.next_deadline(), Some(t0 + Duration::seconds(10)));
        assert!(s.pop_due(t0).is_empty());
        assert_eq!(s.pop_due(t0 + Duration::seconds(20)), vec![OrderId(1), OrderId(2)]);
        assert_eq!(s.len(), 1);
        assert_eq!(s.pop_due(t0 + Duration::seconds(60)), vec![OrderId(3)]);
        assert!(s.is_empty());
        assert_eq!(s.next_deadline(), None);
    }
}
