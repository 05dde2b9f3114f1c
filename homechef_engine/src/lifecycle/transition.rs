use chrono::{DateTime, Duration, Utc};
use hc_common::Money;
use serde_json::{json, Value};

use crate::{
    db_types::{
        Actor,
        CancellationPolicy,
        CancellationType,
        EventKind,
        Order,
        OrderStatusType,
        PaymentStatus,
        Role,
    },
    lifecycle::penalty::{assess_cancellation, CancellationOutcome},
    traits::OrderFlowError,
    validation::{limits, ValidationErrors, Validator},
};

/// A command against an existing order. Placement is handled separately since there is no prior state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderCommand {
    SendToChef,
    ChefAccept { estimated_prep_minutes: Option<i64> },
    ChefDecline { reason: String },
    CustomerCancel { reason: Option<String> },
    StartPrep,
    MarkReady,
    AssignDelivery { partner_id: String },
    MarkPickup,
    StartDelivery,
    MarkDelivered { proof: String },
    /// Closes the free-cancellation window. The order's status does not change.
    ExpireCountdown,
}

impl OrderCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SendToChef => "send the order to the chef",
            Self::ChefAccept { .. } => "accept the order",
            Self::ChefDecline { .. } => "decline the order",
            Self::CustomerCancel { .. } => "cancel the order",
            Self::StartPrep => "start preparing the order",
            Self::MarkReady => "mark the order ready for pickup",
            Self::AssignDelivery { .. } => "assign a delivery partner",
            Self::MarkPickup => "mark the order as picked up",
            Self::StartDelivery => "start delivering the order",
            Self::MarkDelivered { .. } => "mark the order as delivered",
            Self::ExpireCountdown => "expire the cancellation countdown",
        }
    }

    /// The states this command may be applied from.
    pub fn allowed_from(&self) -> &'static [OrderStatusType] {
        use OrderStatusType::*;
        match self {
            Self::SendToChef => &[PaymentConfirmed],
            Self::ChefAccept { .. } | Self::ChefDecline { .. } => &[SentToChef],
            Self::CustomerCancel { .. } | Self::ExpireCountdown => &[PaymentConfirmed, SentToChef, ChefAccepted],
            Self::StartPrep => &[ChefAccepted],
            Self::MarkReady => &[Preparing],
            Self::AssignDelivery { .. } => &[ReadyForPickup],
            Self::MarkPickup => &[AssignedToDelivery],
            Self::StartDelivery => &[PickedUp],
            Self::MarkDelivered { .. } => &[OutForDelivery],
        }
    }

    /// The state the order lands in, given the state it is in now.
    pub fn target(&self, current: OrderStatusType) -> OrderStatusType {
        use OrderStatusType::*;
        match self {
            Self::SendToChef => SentToChef,
            Self::ChefAccept { .. } => ChefAccepted,
            Self::ChefDecline { .. } => ChefDeclined,
            Self::CustomerCancel { .. } => Cancelled,
            Self::StartPrep => Preparing,
            Self::MarkReady => ReadyForPickup,
            Self::AssignDelivery { .. } => AssignedToDelivery,
            Self::MarkPickup => PickedUp,
            Self::StartDelivery => OutForDelivery,
            Self::MarkDelivered { .. } => Delivered,
            Self::ExpireCountdown => current,
        }
    }

    /// Maps a requested target status from the status-update surface to the command that reaches it.
    pub fn for_status_update(target: OrderStatusType, proof: Option<String>) -> Result<Self, ValidationErrors> {
        use OrderStatusType::*;
        match target {
            Preparing => Ok(Self::StartPrep),
            ReadyForPickup => Ok(Self::MarkReady),
            PickedUp => Ok(Self::MarkPickup),
            OutForDelivery => Ok(Self::StartDelivery),
            Delivered => Ok(Self::MarkDelivered { proof: proof.unwrap_or_default() }),
            other => Err(ValidationErrors::single(
                "status",
                format!("'{other}' cannot be set through a status update"),
            )),
        }
    }
}

/// Timing knobs for the planner that do not live on the cancellation policy.
#[derive(Debug, Clone, Copy)]
pub struct FlowSettings {
    /// How long the chef has to accept an order after it was sent to them.
    pub chef_response_window: Duration,
    /// How long after delivery a customer may still leave a tip.
    pub tip_window: Duration,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self { chef_response_window: Duration::seconds(300), tip_window: Duration::hours(72) }
    }
}

/// Column updates for an order. `None` leaves the column unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderChanges {
    pub can_cancel_free: Option<bool>,
    pub penalty_amount: Option<Money>,
    pub refund_amount: Option<Money>,
    pub payment_status: Option<PaymentStatus>,
    pub cancellation_type: Option<CancellationType>,
    pub cancellation_reason: Option<String>,
    pub decline_reason: Option<String>,
    pub estimated_prep_minutes: Option<i64>,
    pub delivery_partner_id: Option<String>,
    pub delivery_proof: Option<String>,
    pub sent_to_chef_at: Option<DateTime<Utc>>,
    pub chef_accepted_at: Option<DateTime<Utc>>,
    pub pickup_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

/// The outcome of planning a command: everything the store needs to commit and the event to publish afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: OrderStatusType,
    pub to: OrderStatusType,
    pub changes: OrderChanges,
    /// The status-history message. `None` when the status does not change.
    pub history: Option<String>,
    pub actor: String,
    pub event_kind: EventKind,
    pub event_data: Value,
    /// Set for customer cancellations, which feed the daily analytics bucket.
    pub cancellation: Option<CancellationOutcome>,
    /// Pending tips on the order are marked failed in the same transaction.
    pub void_pending_tips: bool,
}

impl Transition {
    fn new(order: &Order, to: OrderStatusType, actor: &Actor, event_kind: EventKind, event_data: Value) -> Self {
        let mut changes = OrderChanges::default();
        if !to.is_cancellable() && order.can_cancel_free {
            changes.can_cancel_free = Some(false);
        }
        Self {
            from: order.status,
            to,
            changes,
            history: None,
            actor: actor.to_string(),
            event_kind,
            event_data,
            cancellation: None,
            void_pending_tips: false,
        }
    }

    fn with_history<S: Into<String>>(mut self, message: S) -> Self {
        self.history = Some(message.into());
        self
    }
}

/// Decides whether `command` may be applied to `order` by `actor` at `now`, and if so, what changes.
///
/// This is a pure function of its inputs. Callers commit the result with compare-and-swap semantics and re-plan
/// against the fresh row if another writer got there first.
pub fn plan(
    order: &Order,
    command: &OrderCommand,
    actor: &Actor,
    policy: &CancellationPolicy,
    settings: &FlowSettings,
    now: DateTime<Utc>,
) -> Result<Transition, OrderFlowError> {
    authorize(order, command, actor)?;
    if order.status.is_terminal() {
        return Err(OrderFlowError::invalid_transition(command.name(), order.status, "The order is closed."));
    }
    let allowed = command.allowed_from();
    if !allowed.contains(&order.status) {
        let expected = allowed.iter().map(OrderStatusType::as_str).collect::<Vec<_>>().join(" or ");
        return Err(OrderFlowError::invalid_transition(
            command.name(),
            order.status,
            format!("The order must be {expected}."),
        ));
    }
    let to = command.target(order.status);
    let id = order.id.value();
    use OrderStatusType as S;
    let transition = match command {
        OrderCommand::SendToChef => {
            let mut t = Transition::new(
                order,
                to,
                actor,
                EventKind::OrderSentToChef,
                json!({ "order_id": id, "chef_id": order.chef_id }),
            )
            .with_history("Order sent to the chef");
            t.changes.sent_to_chef_at = Some(now);
            t
        },
        OrderCommand::ChefAccept { estimated_prep_minutes } => {
            let sent_at = order.sent_to_chef_at.unwrap_or(order.created_at);
            if now > sent_at + settings.chef_response_window {
                return Err(OrderFlowError::invalid_transition(
                    command.name(),
                    order.status,
                    "The chef response window has closed.",
                ));
            }
            if let Some(minutes) = estimated_prep_minutes {
                if !(1..=600).contains(minutes) {
                    return Err(ValidationErrors::single("estimated_prep_time", "must be between 1 and 600 minutes")
                        .into());
                }
            }
            let mut t = Transition::new(
                order,
                to,
                actor,
                EventKind::OrderChefAccepted,
                json!({ "order_id": id, "estimated_prep_time": estimated_prep_minutes }),
            )
            .with_history("Chef accepted the order");
            t.changes.chef_accepted_at = Some(now);
            t.changes.estimated_prep_minutes = *estimated_prep_minutes;
            t
        },
        OrderCommand::ChefDecline { reason } => {
            let reason = reason.trim();
            Validator::new()
                .required("reason", reason)
                .max_chars("reason", Some(reason), limits::MAX_REASON_CHARS)
                .finish()?;
            let mut t = Transition::new(
                order,
                to,
                actor,
                EventKind::OrderChefDeclined,
                json!({ "order_id": id, "reason": reason }),
            )
            .with_history(format!("Chef declined the order: {reason}"));
            t.changes.decline_reason = Some(reason.to_string());
            t.changes.penalty_amount = Some(Money::default());
            t.changes.refund_amount = Some(order.charged_amount());
            t.changes.payment_status = Some(PaymentStatus::Refunded);
            t.changes.cancelled_at = Some(now);
            t.void_pending_tips = true;
            t
        },
        OrderCommand::CustomerCancel { reason } => {
            Validator::new().max_chars("reason", reason.as_deref(), limits::MAX_REASON_CHARS).finish()?;
            let outcome = assess_cancellation(order, policy, now);
            let mut t = Transition::new(
                order,
                to,
                actor,
                EventKind::OrderCancelled,
                json!({
                    "order_id": id,
                    "cancellation_type": outcome.kind,
                    "penalty": outcome.penalty,
                    "refund": outcome.refund,
                }),
            )
            .with_history(match outcome.kind {
                CancellationType::Free => "Cancelled by the customer within the free window".to_string(),
                CancellationType::Penalty => format!("Cancelled by the customer with a penalty of {}", outcome.penalty),
            });
            t.changes.can_cancel_free = Some(false);
            t.changes.penalty_amount = Some(outcome.penalty);
            t.changes.refund_amount = Some(outcome.refund);
            t.changes.cancellation_type = Some(outcome.kind);
            t.changes.cancellation_reason = reason.as_ref().map(|r| r.trim().to_string()).filter(|r| !r.is_empty());
            t.changes.payment_status = Some(if outcome.penalty.is_zero() {
                PaymentStatus::Refunded
            } else if outcome.refund.is_zero() {
                order.payment_status
            } else {
                PaymentStatus::PartiallyRefunded
            });
            t.changes.cancelled_at = Some(now);
            t.cancellation = Some(outcome);
            t.void_pending_tips = true;
            t
        },
        OrderCommand::AssignDelivery { partner_id } => {
            let partner_id = partner_id.trim();
            if partner_id.is_empty() {
                return Err(ValidationErrors::single("delivery_partner_id", "is required").into());
            }
            let mut t = Transition::new(
                order,
                to,
                actor,
                EventKind::DeliveryAssigned,
                json!({ "order_id": id, "delivery_id": partner_id }),
            )
            .with_history(format!("Assigned to delivery partner {partner_id}"));
            t.changes.delivery_partner_id = Some(partner_id.to_string());
            t
        },
        OrderCommand::MarkDelivered { proof } => {
            let proof = proof.trim();
            Validator::new()
                .check(!proof.is_empty(), "proof", "proof of delivery is required")
                .max_chars("proof", Some(proof), limits::MAX_PROOF_CHARS)
                .finish()?;
            let mut t = Transition::new(
                order,
                to,
                actor,
                EventKind::OrderDelivered,
                json!({ "order_id": id, "delivered_at": now }),
            )
            .with_history("Order delivered");
            t.changes.delivery_proof = Some(proof.to_string());
            t.changes.delivered_at = Some(now);
            t
        },
        OrderCommand::StartPrep | OrderCommand::MarkReady | OrderCommand::MarkPickup | OrderCommand::StartDelivery => {
            let mut t = Transition::new(
                order,
                to,
                actor,
                EventKind::OrderStatusChanged,
                json!({ "order_id": id, "from": order.status, "to": to, "at": now }),
            )
            .with_history(match to {
                S::Preparing => "Chef started preparing the order",
                S::ReadyForPickup => "Order is ready for pickup",
                S::PickedUp => "Delivery partner picked up the order",
                _ => "Order is out for delivery",
            });
            if to == S::PickedUp {
                t.changes.pickup_at = Some(now);
            }
            t
        },
        OrderCommand::ExpireCountdown => {
            if !order.can_cancel_free {
                return Err(OrderFlowError::invalid_transition(
                    command.name(),
                    order.status,
                    "The free-cancellation window is already closed.",
                ));
            }
            if now < order.countdown_expiry {
                return Err(OrderFlowError::invalid_transition(
                    command.name(),
                    order.status,
                    "The free-cancellation window is still open.",
                ));
            }
            let mut t =
                Transition::new(order, to, actor, EventKind::CountdownExpired, json!({ "order_id": id }));
            t.changes.can_cancel_free = Some(false);
            t
        },
    };
    Ok(transition)
}

fn authorize(order: &Order, command: &OrderCommand, actor: &Actor) -> Result<(), OrderFlowError> {
    let principal = match (actor, command) {
        (Actor::System, _) => return Ok(()),
        (Actor::User(_), OrderCommand::SendToChef | OrderCommand::ExpireCountdown) => {
            return Err(OrderFlowError::Forbidden(format!("Only the system can {}.", command.name())));
        },
        (Actor::User(p), _) => p,
    };
    let permitted = match command {
        OrderCommand::ChefAccept { .. }
        | OrderCommand::ChefDecline { .. }
        | OrderCommand::StartPrep
        | OrderCommand::MarkReady => principal.role == Role::Chef && order.chef_id == principal.user_id,
        OrderCommand::CustomerCancel { .. } => {
            principal.role == Role::Customer && order.customer_id == principal.user_id
        },
        OrderCommand::AssignDelivery { partner_id } => {
            principal.is_admin() || (principal.role == Role::Delivery && *partner_id == principal.user_id)
        },
        OrderCommand::MarkPickup | OrderCommand::StartDelivery | OrderCommand::MarkDelivered { .. } => {
            principal.role == Role::Delivery && order.delivery_partner_id.as_deref() == Some(principal.user_id.as_str())
        },
        OrderCommand::SendToChef | OrderCommand::ExpireCountdown => false,
    };
    if permitted {
        Ok(())
    } else {
        Err(OrderFlowError::Forbidden(format!("{principal} may not {} {}.", command.name(), order.id)))
    }
}

#[cfg(test)]
mod test {
    use chrono::TimeZone;

    use super::*;
    use crate::{
        db_types::Principal,
        lifecycle::test_fixtures::{order_in, policy},
    };

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn chef() -> Actor {
        Principal::new("chef-1", Role::Chef).into()
    }

    fn customer() -> Actor {
        Principal::new("cust-1", Role::Customer).into()
    }

    fn rider() -> Actor {
        Principal::new("rider-1", Role::Delivery).into()
    }

    fn plan_at(order: &Order, cmd: OrderCommand, actor: &Actor, secs: i64) -> Result<Transition, OrderFlowError> {
        plan(order, &cmd, actor, &policy(30, 0.4), &FlowSettings::default(), t0() + Duration::seconds(secs))
    }

    #[test]
    fn happy_path_walks_every_state() {
        use OrderStatusType::*;
        let mut order = order_in(PaymentConfirmed, t0(), 450);
        let steps = [
            (OrderCommand::SendToChef, Actor::System, SentToChef, EventKind::OrderSentToChef),
            (OrderCommand::ChefAccept { estimated_prep_minutes: Some(25) }, chef(), ChefAccepted, EventKind::OrderChefAccepted),
            (OrderCommand::StartPrep, chef(), Preparing, EventKind::OrderStatusChanged),
            (OrderCommand::MarkReady, chef(), ReadyForPickup, EventKind::OrderStatusChanged),
            (
                OrderCommand::AssignDelivery { partner_id: "rider-1".into() },
                rider(),
                AssignedToDelivery,
                EventKind::DeliveryAssigned,
            ),
            (OrderCommand::MarkPickup, rider(), PickedUp, EventKind::OrderStatusChanged),
            (OrderCommand::StartDelivery, rider(), OutForDelivery, EventKind::OrderStatusChanged),
            (OrderCommand::MarkDelivered { proof: "photo-123".into() }, rider(), Delivered, EventKind::OrderDelivered),
        ];
        for (i, (cmd, actor, expected, kind)) in steps.into_iter().enumerate() {
            let t = plan_at(&order, cmd, &actor, i as i64 * 10).unwrap();
            assert_eq!(t.from, order.status);
            assert_eq!(t.to, expected);
            assert_eq!(t.event_kind, kind);
            assert!(t.history.is_some());
            order.status = t.to;
            if let Some(p) = t.changes.delivery_partner_id {
                order.delivery_partner_id = Some(p);
            }
            if let Some(flag) = t.changes.can_cancel_free {
                order.can_cancel_free = flag;
            }
        }
        assert!(!order.can_cancel_free);
    }

    #[test]
    fn terminal_orders_reject_everything() {
        let order = order_in(OrderStatusType::Cancelled, t0(), 450);
        let err = plan_at(&order, OrderCommand::ChefDecline { reason: "busy".into() }, &chef(), 5).unwrap_err();
        assert!(matches!(err, OrderFlowError::InvalidTransition { observed: OrderStatusType::Cancelled, .. }));
    }

    #[test]
    fn wrong_pre_state_reports_observed_state() {
        let order = order_in(OrderStatusType::Preparing, t0(), 450);
        let err = plan_at(&order, OrderCommand::CustomerCancel { reason: None }, &customer(), 5).unwrap_err();
        match err {
            OrderFlowError::InvalidTransition { observed, .. } => assert_eq!(observed, OrderStatusType::Preparing),
            e => panic!("Unexpected error {e}"),
        }
    }

    #[test]
    fn only_participants_may_act() {
        let order = order_in(OrderStatusType::SentToChef, t0(), 450);
        let other_chef: Actor = Principal::new("chef-2", Role::Chef).into();
        let err = plan_at(&order, OrderCommand::ChefAccept { estimated_prep_minutes: None }, &other_chef, 5);
        assert!(matches!(err, Err(OrderFlowError::Forbidden(_))));
        let err = plan_at(&order, OrderCommand::CustomerCancel { reason: None }, &chef(), 5);
        assert!(matches!(err, Err(OrderFlowError::Forbidden(_))));
        let err = plan_at(&order, OrderCommand::ExpireCountdown, &customer(), 50);
        assert!(matches!(err, Err(OrderFlowError::Forbidden(_))));
    }

    #[test]
    fn chef_decline_is_always_free() {
        let order = order_in(OrderStatusType::SentToChef, t0(), 450);
        let t = plan_at(&order, OrderCommand::ChefDecline { reason: "Out of paneer".into() }, &chef(), 60).unwrap();
        assert_eq!(t.to, OrderStatusType::ChefDeclined);
        assert_eq!(t.changes.penalty_amount, Some(Money::default()));
        assert_eq!(t.changes.refund_amount, Some(Money::from_major(450)));
        assert_eq!(t.changes.payment_status, Some(PaymentStatus::Refunded));
        assert_eq!(t.event_kind, EventKind::OrderChefDeclined);
        assert!(t.cancellation.is_none());
    }

    #[test]
    fn late_cancel_carries_penalty() {
        let order = order_in(OrderStatusType::ChefAccepted, t0(), 450);
        let t = plan_at(&order, OrderCommand::CustomerCancel { reason: Some("Changed my mind".into()) }, &customer(), 45)
            .unwrap();
        let outcome = t.cancellation.unwrap();
        assert_eq!(outcome.kind, CancellationType::Penalty);
        assert_eq!(outcome.penalty, Money::from_major(180));
        assert_eq!(t.changes.payment_status, Some(PaymentStatus::PartiallyRefunded));
        assert_eq!(t.event_data["penalty"], json!(180.0));
        assert_eq!(t.event_data["cancellation_type"], json!("penalty"));
        assert!(t.void_pending_tips);
    }

    #[test]
    fn chef_must_respond_in_time() {
        let mut order = order_in(OrderStatusType::SentToChef, t0(), 450);
        order.sent_to_chef_at = Some(t0());
        let err = plan_at(&order, OrderCommand::ChefAccept { estimated_prep_minutes: None }, &chef(), 301);
        assert!(matches!(err, Err(OrderFlowError::InvalidTransition { .. })));
        assert!(plan_at(&order, OrderCommand::ChefAccept { estimated_prep_minutes: None }, &chef(), 300).is_ok());
    }

    #[test]
    fn delivery_needs_proof() {
        let mut order = order_in(OrderStatusType::OutForDelivery, t0(), 450);
        order.delivery_partner_id = Some("rider-1".into());
        let err = plan_at(&order, OrderCommand::MarkDelivered { proof: "  ".into() }, &rider(), 5).unwrap_err();
        assert!(matches!(err, OrderFlowError::ValidationError(_)));
    }

    #[test]
    fn delivery_commands_need_the_assigned_partner() {
        let mut order = order_in(OrderStatusType::AssignedToDelivery, t0(), 450);
        order.delivery_partner_id = Some("rider-2".into());
        let err = plan_at(&order, OrderCommand::MarkPickup, &rider(), 5);
        assert!(matches!(err, Err(OrderFlowError::Forbidden(_))));
    }

    #[test]
    fn countdown_expiry_only_closes_the_window() {
        let order = order_in(OrderStatusType::SentToChef, t0(), 450);
        assert!(plan_at(&order, OrderCommand::ExpireCountdown, &Actor::System, 29).is_err());
        let t = plan_at(&order, OrderCommand::ExpireCountdown, &Actor::System, 30).unwrap();
        assert_eq!(t.from, t.to);
        assert!(t.history.is_none());
        assert_eq!(t.changes.can_cancel_free, Some(false));
        assert_eq!(t.event_kind, EventKind::CountdownExpired);
        let mut closed = order.clone();
        closed.can_cancel_free = false;
        assert!(plan_at(&closed, OrderCommand::ExpireCountdown, &Actor::System, 31).is_err());
    }

    #[test]
    fn status_update_targets() {
        assert_eq!(OrderCommand::for_status_update(OrderStatusType::Preparing, None).unwrap(), OrderCommand::StartPrep);
        assert_eq!(
            OrderCommand::for_status_update(OrderStatusType::Delivered, Some("sig".into())).unwrap(),
            OrderCommand::MarkDelivered { proof: "sig".into() }
        );
        assert!(OrderCommand::for_status_update(OrderStatusType::Cancelled, None).is_err());
    }
}
