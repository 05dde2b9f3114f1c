#![allow(dead_code)]
use std::{sync::Arc, time::Duration as StdDuration};

use chrono::{DateTime, TimeZone, Utc};
use homechef_engine::{
    clock::{ManualClock, SharedClock},
    db_types::{EventKind, Money, NewCancellationPolicy, NewOrder, NewOrderItem, Principal, Role},
    events::{EventBus, EventHandlers, EventHooks, OrderEvent},
    lifecycle::FlowSettings,
    test_utils::prepare_env::{fresh_database, tear_down},
    OrderFlowApi,
    PolicyApi,
    SqliteDatabase,
};
use tokio::sync::mpsc;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

pub fn customer() -> Principal {
    Principal::new("cust-1", Role::Customer)
}

pub fn chef() -> Principal {
    Principal::new("chef-1", Role::Chef)
}

pub fn rider() -> Principal {
    Principal::new("rider-1", Role::Delivery)
}

pub fn admin() -> Principal {
    Principal::new("ops-1", Role::Admin)
}

pub fn standard_policy() -> NewCancellationPolicy {
    NewCancellationPolicy {
        free_window_seconds: 30,
        penalty_rate: 0.4,
        min_penalty: Money::from_major(20),
        max_penalty: Money::from_major(500),
        description: "30s free window, 40% penalty".to_string(),
    }
}

/// A single-item order from chef-1 costing `total_major`, with no fees.
pub fn order_for(total_major: i64) -> NewOrder {
    NewOrder {
        chef_id: "chef-1".to_string(),
        items: vec![NewOrderItem {
            dish_id: "hyderabadi-biryani".to_string(),
            quantity: 1,
            unit_price: Money::from_major(total_major),
            instructions: None,
        }],
        delivery_fee: Money::default(),
        tax_amount: Money::default(),
        payment_id: "pay_1".to_string(),
        special_instructions: None,
    }
}

pub struct Harness {
    pub db: SqliteDatabase,
    pub clock: ManualClock,
    pub api: OrderFlowApi<SqliteDatabase>,
    pub policies: PolicyApi<SqliteDatabase>,
    events: mpsc::UnboundedReceiver<OrderEvent>,
}

impl Harness {
    pub async fn new(policy: NewCancellationPolicy) -> Self {
        let db = fresh_database().await;
        let clock = ManualClock::new(t0());
        let shared: SharedClock = Arc::new(clock.clone());
        let policies = PolicyApi::new(db.clone(), shared.clone());
        policies.ensure_active_policy(policy).await.expect("Error seeding policy");

        let (tx, rx) = mpsc::unbounded_channel();
        let mut hooks = EventHooks::default();
        hooks.on_order_event("recorder", move |ev| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(ev);
            })
        });
        let handlers = EventHandlers::new(64, hooks);
        let bus = EventBus::new(db.clone(), handlers.producers());
        handlers.start_handlers().await;
        let api = OrderFlowApi::new(db.clone(), bus, shared, FlowSettings::default());
        Self { db, clock, api, policies, events: rx }
    }

    pub async fn standard() -> Self {
        Self::new(standard_policy()).await
    }

    pub fn advance_secs(&self, secs: i64) {
        self.clock.advance(chrono::Duration::seconds(secs));
    }

    /// Waits for the next `n` events seen by the recorder hook.
    pub async fn next_events(&mut self, n: usize) -> Vec<OrderEvent> {
        let mut result = Vec::with_capacity(n);
        while result.len() < n {
            match tokio::time::timeout(StdDuration::from_secs(2), self.events.recv()).await {
                Ok(Some(ev)) => result.push(ev),
                _ => break,
            }
        }
        result
    }

    pub async fn next_event_kinds(&mut self, n: usize) -> Vec<EventKind> {
        self.next_events(n).await.into_iter().map(|e| e.kind).collect()
    }

    /// True if no further event arrives within a short grace period.
    pub async fn no_more_events(&mut self) -> bool {
        tokio::time::timeout(StdDuration::from_millis(200), self.events.recv()).await.is_err()
    }

    pub async fn finish(self) {
        tear_down(self.db).await;
    }
}
