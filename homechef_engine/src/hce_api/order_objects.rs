use serde::{Deserialize, Serialize};

use crate::{
    db_types::{CancellationType, Money, Order, OrderId, OrderStatusType},
    lifecycle::CancellationOutcome,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CancelOrderRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// What a customer gets back from a cancellation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancellationReceipt {
    pub order_id: OrderId,
    #[serde(rename = "type")]
    pub kind: CancellationType,
    pub penalty: Money,
    pub refund: Money,
    pub refund_timeline: String,
}

impl CancellationReceipt {
    pub fn new(order_id: OrderId, outcome: &CancellationOutcome) -> Self {
        Self {
            order_id,
            kind: outcome.kind,
            penalty: outcome.penalty,
            refund: outcome.refund,
            refund_timeline: refund_timeline(outcome.refund).to_string(),
        }
    }

    /// Rebuilds the receipt from a cancelled order.
    pub fn from_order(order: &Order) -> Self {
        Self {
            order_id: order.id,
            kind: order.cancellation_type.unwrap_or(CancellationType::Penalty),
            penalty: order.penalty_amount,
            refund: order.refund_amount,
            refund_timeline: refund_timeline(order.refund_amount).to_string(),
        }
    }
}

pub fn refund_timeline(refund: Money) -> &'static str {
    if refund.is_zero() {
        "No refund is due"
    } else {
        "Refunds are returned to the original payment method within 3-5 business days"
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChefAcceptRequest {
    /// Minutes.
    #[serde(default)]
    pub estimated_prep_time: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChefDeclineRequest {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdateRequest {
    pub status: OrderStatusType,
    #[serde(default)]
    pub proof: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssignDeliveryRequest {
    /// Defaults to the caller when a delivery partner assigns themselves.
    #[serde(default)]
    pub delivery_partner_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentOutcome {
    Success,
    Failed,
}

/// The payment collaborator's verdict on an order payment or, when `tip_id` is set, on a tip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentCallback {
    pub payment_id: String,
    pub order_id: OrderId,
    pub amount: Money,
    pub status: PaymentOutcome,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub tip_id: Option<i64>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn receipt_wire_format() {
        let outcome = CancellationOutcome {
            kind: CancellationType::Penalty,
            penalty: Money::from_major(180),
            refund: Money::from_major(270),
            seconds_to_cancel: 45,
        };
        let receipt = CancellationReceipt::new(OrderId(7), &outcome);
        let json = serde_json::to_value(&receipt).unwrap();
        assert_eq!(json["type"], "penalty");
        assert_eq!(json["penalty"], serde_json::json!(180.0));
        assert_eq!(json["refund"], serde_json::json!(270.0));
        assert!(json["refund_timeline"].as_str().unwrap().contains("business days"));
    }

    #[test]
    fn callback_deserializes_without_optional_fields() {
        let cb: PaymentCallback = serde_json::from_str(
            r#"{"payment_id":"pay_1","order_id":3,"amount":450,"status":"success"}"#,
        )
        .unwrap();
        assert_eq!(cb.order_id, OrderId(3));
        assert_eq!(cb.amount, Money::from_major(450));
        assert_eq!(cb.status, PaymentOutcome::Success);
        assert!(cb.tip_id.is_none());
    }
}
