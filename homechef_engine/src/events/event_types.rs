use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db_types::{EventKind, Order, OrderId, Role};

/// The users an order event concerns. Push channels target these users, plus every admin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Audience {
    pub customer_id: String,
    pub chef_id: String,
    pub delivery_partner_id: Option<String>,
}

impl Audience {
    pub fn for_order(order: &Order) -> Self {
        Self {
            customer_id: order.customer_id.clone(),
            chef_id: order.chef_id.clone(),
            delivery_partner_id: order.delivery_partner_id.clone(),
        }
    }

    /// `(user_id, role)` for each participant, without duplicates.
    pub fn recipients(&self) -> Vec<(&str, Role)> {
        let mut result = vec![(self.customer_id.as_str(), Role::Customer), (self.chef_id.as_str(), Role::Chef)];
        if let Some(d) = self.delivery_partner_id.as_deref() {
            result.push((d, Role::Delivery));
        }
        result.dedup_by(|a, b| a.0 == b.0);
        result
    }
}

/// A committed change to an order, published on the event bus after the store transaction has committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderEvent {
    pub kind: EventKind,
    pub order_id: OrderId,
    /// The order's `event_seq` after the commit. Strictly increasing per order.
    pub seq: i64,
    pub data: Value,
    pub audience: Audience,
    pub timestamp: DateTime<Utc>,
}

impl OrderEvent {
    /// Builds the event from the order as it was *after* the change was committed.
    pub fn new(order: &Order, kind: EventKind, data: Value, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind,
            order_id: order.id,
            seq: order.event_seq,
            data,
            audience: Audience::for_order(order),
            timestamp,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn recipients_skip_missing_partner() {
        let a = Audience { customer_id: "c".into(), chef_id: "h".into(), delivery_partner_id: None };
        assert_eq!(a.recipients(), vec![("c", Role::Customer), ("h", Role::Chef)]);
        let a = Audience { delivery_partner_id: Some("d".into()), ..a };
        assert_eq!(a.recipients().len(), 3);
    }
}
