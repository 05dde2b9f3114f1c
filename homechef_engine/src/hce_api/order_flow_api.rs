use std::{fmt::Debug, sync::Arc};

use chrono::{DateTime, Utc};
use log::*;
use serde_json::json;
use tokio::sync::{Mutex, MutexGuard};

use crate::{
    clock::SharedClock,
    countdown::CountdownScheduler,
    db_types::{
        Actor,
        CancellationPolicy,
        EventKind,
        NewOrder,
        NewTip,
        Order,
        OrderId,
        OrderStatusType,
        OrderWithItems,
        PaymentStatus,
        Principal,
        Role,
        SettlementStatus,
        StatusHistoryEntry,
        Tip,
        TipRecipient,
    },
    events::{EventBus, OrderEvent},
    hce_api::order_objects::{CancellationReceipt, PaymentCallback, PaymentOutcome},
    lifecycle::{plan, CountdownStatus, FlowSettings, OrderCommand, Transition},
    traits::{CancellationPolicyManagement, OrderFlowError, OrderManagement, TipManagement, WebhookManagement},
    validation::{validate_new_order, validate_new_tip, ValidationErrors},
};

const LOCK_STRIPES: usize = 64;

/// `OrderFlowApi` drives orders through their lifecycle in response to customer, chef and delivery-partner commands,
/// the countdown scheduler and the payment collaborator.
///
/// Every command on an order runs under a per-order lock that is held until the resulting event has been handed to
/// the event bus, so events for one order are published in commit order. The store's compare-and-swap update is what
/// keeps concurrent writers in other processes honest.
pub struct OrderFlowApi<B> {
    db: B,
    bus: EventBus<B>,
    clock: SharedClock,
    settings: FlowSettings,
    countdowns: CountdownScheduler,
    locks: Arc<Vec<Mutex<()>>>,
}

impl<B: Clone> Clone for OrderFlowApi<B> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            bus: self.bus.clone(),
            clock: self.clock.clone(),
            settings: self.settings,
            countdowns: self.countdowns.clone(),
            locks: Arc::clone(&self.locks),
        }
    }
}

impl<B> Debug for OrderFlowApi<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OrderFlowApi ({} countdowns pending)", self.countdowns.len())
    }
}

impl<B> OrderFlowApi<B> {
    pub fn new(db: B, bus: EventBus<B>, clock: SharedClock, settings: FlowSettings) -> Self {
        let locks = (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect::<Vec<_>>();
        Self { db, bus, clock, settings, countdowns: CountdownScheduler::new(), locks: Arc::new(locks) }
    }

    pub fn db(&self) -> &B {
        &self.db
    }

    pub fn countdowns(&self) -> &CountdownScheduler {
        &self.countdowns
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    async fn lock_order(&self, id: OrderId) -> MutexGuard<'_, ()> {
        let stripe = id.value().rem_euclid(LOCK_STRIPES as i64) as usize;
        self.locks[stripe].lock().await
    }
}

impl<B> OrderFlowApi<B>
where B: OrderManagement + CancellationPolicyManagement + TipManagement + WebhookManagement
{
    /// Places a new order for `customer`, then sends it to the chef, which starts the free-cancellation countdown.
    ///
    /// The countdown length comes from the policy that is active right now, and is fixed for the life of the order.
    pub async fn place_order(&self, customer: &Principal, order: NewOrder) -> Result<Order, OrderFlowError> {
        if customer.role != Role::Customer {
            return Err(OrderFlowError::Forbidden("Only customers can place orders.".to_string()));
        }
        validate_new_order(&order)?;
        let policy = self.db.fetch_active_policy().await?.ok_or(OrderFlowError::NoActivePolicy)?;
        let now = self.clock.now();
        let placed = self.db.insert_order(&customer.user_id, order, &policy, now).await?;
        info!("🔄️📦️ Order {} placed by {} for {}", placed.id, customer.user_id, placed.total_amount);
        let _guard = self.lock_order(placed.id).await;
        let data = json!({
            "order_id": placed.id,
            "customer_id": placed.customer_id,
            "chef_id": placed.chef_id,
            "total_amount": placed.total_amount,
            "countdown_expiry": placed.countdown_expiry,
        });
        self.bus.publish(OrderEvent::new(&placed, EventKind::OrderCreated, data, now)).await;
        let (sent, _) = self.execute_locked(placed, &OrderCommand::SendToChef, &Actor::System, &policy).await?;
        if sent.can_cancel_free {
            self.countdowns.schedule(sent.id, sent.countdown_expiry);
        }
        Ok(sent)
    }

    pub async fn get_order(&self, principal: &Principal, id: OrderId) -> Result<OrderWithItems, OrderFlowError> {
        let order = self.visible_order(principal, id).await?;
        let items = self.db.fetch_order_items(id).await?;
        Ok(OrderWithItems { order, items })
    }

    pub async fn order_timeline(
        &self,
        principal: &Principal,
        id: OrderId,
    ) -> Result<Vec<StatusHistoryEntry>, OrderFlowError> {
        self.visible_order(principal, id).await?;
        self.db.fetch_status_history(id).await
    }

    pub async fn countdown_status(&self, principal: &Principal, id: OrderId) -> Result<CountdownStatus, OrderFlowError> {
        let order = self.visible_order(principal, id).await?;
        let policy = self.policy_for(&order).await?;
        Ok(CountdownStatus::new(&order, &policy, self.clock.now()))
    }

    pub async fn cancel_order(
        &self,
        customer: &Principal,
        id: OrderId,
        reason: Option<String>,
    ) -> Result<CancellationReceipt, OrderFlowError> {
        let (order, transition) = self.execute(id, OrderCommand::CustomerCancel { reason }, customer.clone().into()).await?;
        let receipt = match &transition.cancellation {
            Some(outcome) => CancellationReceipt::new(order.id, outcome),
            None => CancellationReceipt::from_order(&order),
        };
        info!("🔄️❌️ Order {id} cancelled ({}). Penalty {}, refund {}", receipt.kind, receipt.penalty, receipt.refund);
        Ok(receipt)
    }

    pub async fn chef_accept(
        &self,
        chef: &Principal,
        id: OrderId,
        estimated_prep_minutes: Option<i64>,
    ) -> Result<Order, OrderFlowError> {
        let command = OrderCommand::ChefAccept { estimated_prep_minutes };
        let (order, _) = self.execute(id, command, chef.clone().into()).await?;
        Ok(order)
    }

    pub async fn chef_decline(&self, chef: &Principal, id: OrderId, reason: String) -> Result<Order, OrderFlowError> {
        let (order, _) = self.execute(id, OrderCommand::ChefDecline { reason }, chef.clone().into()).await?;
        info!("🔄️❌️ Order {id} declined by the chef. {} refunded", order.refund_amount);
        Ok(order)
    }

    /// Moves an order along the preparation and delivery path. The target status determines the command.
    pub async fn update_status(
        &self,
        principal: &Principal,
        id: OrderId,
        target: OrderStatusType,
        proof: Option<String>,
    ) -> Result<Order, OrderFlowError> {
        let command = OrderCommand::for_status_update(target, proof)?;
        let (order, _) = self.execute(id, command, principal.clone().into()).await?;
        Ok(order)
    }

    /// A delivery partner assigns themselves to an order; an admin may assign anyone.
    pub async fn assign_delivery(
        &self,
        principal: &Principal,
        id: OrderId,
        partner_id: Option<String>,
    ) -> Result<Order, OrderFlowError> {
        let partner_id = match (partner_id, principal.role) {
            (Some(p), _) => p,
            (None, Role::Delivery) => principal.user_id.clone(),
            (None, _) => return Err(ValidationErrors::single("delivery_partner_id", "is required").into()),
        };
        let (order, _) = self.execute(id, OrderCommand::AssignDelivery { partner_id }, principal.clone().into()).await?;
        Ok(order)
    }

    /// Adds a tip for the chef or the delivery partner, or replaces a pending one.
    ///
    /// Tips are accepted once the chef has committed to the order, and for the configured tip window after delivery.
    pub async fn add_tip(&self, customer: &Principal, id: OrderId, tip: NewTip) -> Result<Tip, OrderFlowError> {
        validate_new_tip(&tip)?;
        let _guard = self.lock_order(id).await;
        let order = self.db.fetch_order(id).await?.ok_or(OrderFlowError::OrderNotFound(id))?;
        if customer.role != Role::Customer || order.customer_id != customer.user_id {
            return Err(OrderFlowError::Forbidden(format!("Only the customer who placed order {id} can tip on it.")));
        }
        let now = self.clock.now();
        self.check_tip_window(&order, now)?;
        let recipient_id = match tip.recipient_kind {
            TipRecipient::Chef => order.chef_id.clone(),
            TipRecipient::Delivery => order.delivery_partner_id.clone().ok_or_else(|| {
                OrderFlowError::invalid_transition("tip the delivery partner", order.status, "No delivery partner has been assigned.")
            })?,
        };
        let saved = self.db.upsert_tip(&order, &customer.user_id, &recipient_id, &tip, now).await?;
        info!("🔄️💸️ {} tip of {} on order {id} is pending settlement", saved.recipient_kind, saved.amount);
        Ok(saved)
    }

    pub async fn tips_for_order(&self, principal: &Principal, id: OrderId) -> Result<Vec<Tip>, OrderFlowError> {
        self.visible_order(principal, id).await?;
        self.db.fetch_tips_for_order(id).await
    }

    fn check_tip_window(&self, order: &Order, now: DateTime<Utc>) -> Result<(), OrderFlowError> {
        let command = "add a tip";
        match order.status {
            OrderStatusType::Delivered => {
                let delivered_at = order.delivered_at.unwrap_or(order.updated_at);
                if now > delivered_at + self.settings.tip_window {
                    Err(OrderFlowError::invalid_transition(command, order.status, "The tip window has closed."))
                } else {
                    Ok(())
                }
            },
            s if s.is_chef_committed() => Ok(()),
            s if s.is_terminal() => Err(OrderFlowError::invalid_transition(command, s, "The order is closed.")),
            s => Err(OrderFlowError::invalid_transition(command, s, "The chef has not accepted the order yet.")),
        }
    }

    /// Applies the payment collaborator's verdict. Returns the order if anything changed; repeated callbacks are
    /// no-ops.
    pub async fn handle_payment_callback(&self, callback: PaymentCallback) -> Result<Option<Order>, OrderFlowError> {
        let id = callback.order_id;
        let _guard = self.lock_order(id).await;
        let order = self.db.fetch_order(id).await?.ok_or(OrderFlowError::OrderNotFound(id))?;
        match callback.tip_id {
            Some(tip_id) => self.settle_tip_locked(&order, tip_id, &callback).await,
            None => self.record_payment_locked(&order, &callback).await,
        }
    }

    async fn record_payment_locked(
        &self,
        order: &Order,
        callback: &PaymentCallback,
    ) -> Result<Option<Order>, OrderFlowError> {
        if order.payment_id != callback.payment_id {
            return Err(ValidationErrors::single("payment_id", "does not match the order's payment").into());
        }
        let now = self.clock.now();
        let (status, kind, data) = match callback.status {
            PaymentOutcome::Success => (
                PaymentStatus::Captured,
                EventKind::PaymentSuccess,
                json!({ "payment_id": callback.payment_id, "order_id": order.id, "amount": callback.amount }),
            ),
            PaymentOutcome::Failed => (
                PaymentStatus::Failed,
                EventKind::PaymentFailed,
                json!({
                    "payment_id": callback.payment_id,
                    "order_id": order.id,
                    "error_message": callback.error_message.clone().unwrap_or_default(),
                }),
            ),
        };
        let updated = self.db.update_payment_status(order.id, PaymentStatus::Authorized, status, now).await?;
        match updated {
            Some(updated) => {
                info!("🔄️💰️ Payment {} for order {} is {status}", callback.payment_id, order.id);
                self.bus.publish(OrderEvent::new(&updated, kind, data, now)).await;
                Ok(Some(updated))
            },
            None => {
                debug!("🔄️💰️ Payment for order {} is already {}. Ignoring callback", order.id, order.payment_status);
                Ok(None)
            },
        }
    }

    async fn settle_tip_locked(
        &self,
        order: &Order,
        tip_id: i64,
        callback: &PaymentCallback,
    ) -> Result<Option<Order>, OrderFlowError> {
        let tip = self.db.fetch_tip(tip_id).await?.ok_or(OrderFlowError::TipNotFound(tip_id))?;
        if tip.order_id != order.id {
            return Err(ValidationErrors::single("tip_id", format!("does not belong to order {}", order.id)).into());
        }
        let status = match callback.status {
            PaymentOutcome::Success => SettlementStatus::Completed,
            PaymentOutcome::Failed => SettlementStatus::Failed,
        };
        let now = self.clock.now();
        let settled = self.db.settle_tip(tip_id, status, Some(callback.payment_id.clone()), now).await?;
        let Some((tip, updated)) = settled else {
            debug!("🔄️💸️ Tip #{tip_id} was already settled. Ignoring callback");
            return Ok(None);
        };
        info!("🔄️💸️ Tip #{tip_id} on order {} settled as {status}", order.id);
        if status == SettlementStatus::Completed {
            let data = json!({
                "tip_id": tip.id,
                "order_id": tip.order_id,
                "recipient_id": tip.recipient_id,
                "amount": tip.amount,
            });
            self.bus.publish(OrderEvent::new(&updated, EventKind::TipReceived, data, now)).await;
        }
        Ok(Some(updated))
    }

    /// Closes the free-cancellation window of an order whose countdown has run out.
    ///
    /// Returns `Ok(None)` when there is nothing to do: the window is already closed, the order has moved on, or the
    /// countdown has not run out yet (in which case it is rescheduled).
    pub async fn expire_countdown(&self, id: OrderId) -> Result<Option<Order>, OrderFlowError> {
        let _guard = self.lock_order(id).await;
        let Some(order) = self.db.fetch_order(id).await? else {
            warn!("⏳️ Countdown fired for order {id}, which does not exist");
            return Ok(None);
        };
        if !order.can_cancel_free {
            trace!("⏳️ Countdown for order {id} is already closed");
            return Ok(None);
        }
        if self.clock.now() < order.countdown_expiry {
            self.countdowns.schedule(id, order.countdown_expiry);
            return Ok(None);
        }
        let policy = self.policy_for(&order).await?;
        match self.execute_locked(order, &OrderCommand::ExpireCountdown, &Actor::System, &policy).await {
            Ok((order, _)) => {
                debug!("⏳️ Free-cancellation window for order {id} closed");
                Ok(Some(order))
            },
            Err(OrderFlowError::InvalidTransition { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Expires every countdown in the scheduler that is due. Per-order failures are logged and skipped.
    pub async fn expire_due_countdowns(&self) -> usize {
        let due = self.countdowns.pop_due(self.clock.now());
        let mut expired = 0;
        for id in due {
            match self.expire_countdown(id).await {
                Ok(Some(_)) => expired += 1,
                Ok(None) => {},
                Err(e) => {
                    error!("⏳️ Could not expire the countdown for order {id}. {e}");
                    if matches!(e, OrderFlowError::StoreUnavailable(_)) {
                        self.countdowns.schedule(id, self.clock.now());
                    }
                },
            }
        }
        expired
    }

    /// Rebuilds the countdown schedule after a restart. Countdowns that ran out while the process was down are
    /// expired immediately, earliest first. Returns the number expired.
    pub async fn recover_countdowns(&self) -> Result<usize, OrderFlowError> {
        let open = self.db.fetch_orders_with_open_countdown().await?;
        let now = self.clock.now();
        let mut expired = 0;
        let mut scheduled = 0;
        for order in open {
            if order.countdown_expiry <= now {
                match self.expire_countdown(order.id).await {
                    Ok(Some(_)) => expired += 1,
                    Ok(None) => {},
                    Err(e) => error!("⏳️ Could not expire the missed countdown for order {}. {e}", order.id),
                }
            } else {
                self.countdowns.schedule(order.id, order.countdown_expiry);
                scheduled += 1;
            }
        }
        info!("⏳️ Countdown recovery: {expired} missed countdowns expired, {scheduled} rescheduled");
        Ok(expired)
    }

    async fn visible_order(&self, principal: &Principal, id: OrderId) -> Result<Order, OrderFlowError> {
        let order = self.db.fetch_order(id).await?.ok_or(OrderFlowError::OrderNotFound(id))?;
        if !order.is_visible_to(principal) {
            return Err(OrderFlowError::Forbidden(format!("{principal} is not a participant of order {id}.")));
        }
        Ok(order)
    }

    async fn policy_for(&self, order: &Order) -> Result<CancellationPolicy, OrderFlowError> {
        self.db.fetch_policy(order.policy_id).await?.ok_or(OrderFlowError::PolicyNotFound(order.policy_id))
    }

    async fn execute(
        &self,
        id: OrderId,
        command: OrderCommand,
        actor: Actor,
    ) -> Result<(Order, Transition), OrderFlowError> {
        let _guard = self.lock_order(id).await;
        let order = self.db.fetch_order(id).await?.ok_or(OrderFlowError::OrderNotFound(id))?;
        let policy = self.policy_for(&order).await?;
        self.execute_locked(order, &command, &actor, &policy).await
    }

    /// Plans and commits `command`, then publishes its event. The caller must hold the order's lock.
    ///
    /// If the compare-and-swap loses to a writer outside this process, the command is re-planned once against the
    /// fresh row, so a command that no longer applies fails with the state that was actually observed.
    async fn execute_locked(
        &self,
        order: Order,
        command: &OrderCommand,
        actor: &Actor,
        policy: &CancellationPolicy,
    ) -> Result<(Order, Transition), OrderFlowError> {
        let mut current = order;
        for attempt in 0..2 {
            let now = self.clock.now();
            let transition = plan(&current, command, actor, policy, &self.settings, now)?;
            if let Some(updated) = self.db.apply_transition(&current, &transition, now).await? {
                debug!("🔄️ Order {}: {} -> {} by {}", updated.id, transition.from, transition.to, transition.actor);
                let event = OrderEvent::new(&updated, transition.event_kind, transition.event_data.clone(), now);
                self.bus.publish(event).await;
                return Ok((updated, transition));
            }
            debug!("🔄️ Order {} changed underneath {} (attempt {attempt}). Re-reading", current.id, command.name());
            current = self.db.fetch_order(current.id).await?.ok_or(OrderFlowError::OrderNotFound(current.id))?;
        }
        Err(OrderFlowError::Conflict(format!("Could not {} on order {} after retrying.", command.name(), current.id)))
    }
}
