//! Input validation for data that crosses the HTTP boundary.
//!
//! Each request type has a small declarative schema built with [`Validator`]. Validation never stops at the first
//! failure; every failing field is reported in the returned [`ValidationErrors`] map (`field -> reason`).
use std::{collections::BTreeMap, fmt::Display};

use hc_common::Money;
use reqwest::Url;
use serde::Serialize;
use thiserror::Error;

use crate::db_types::{EventKind, NewCancellationPolicy, NewOrder, NewTip, NewWebhookEndpoint, UpdateWebhookEndpoint};

pub mod limits {
    use hc_common::Money;

    pub const MIN_TIP: Money = Money::from_minor(1_000);
    pub const MAX_TIP: Money = Money::from_minor(50_000);
    pub const MAX_TIP_MESSAGE_CHARS: usize = 200;
    pub const MAX_INSTRUCTIONS_CHARS: usize = 500;
    pub const MAX_ITEMS_PER_ORDER: usize = 100;
    pub const MAX_QUANTITY: i64 = 99;
    pub const MAX_UNIT_PRICE: Money = Money::from_minor(10_000_000);
    pub const MAX_ORDER_TOTAL: Money = Money::from_minor(100_000_000);
    pub const MAX_FREE_WINDOW_SECONDS: i64 = 300;
    pub const MAX_WEBHOOK_ATTEMPTS: i64 = 20;
    pub const MAX_WEBHOOK_BASE_DELAY_SECONDS: i64 = 3600;
    pub const MAX_URL_LENGTH: usize = 2048;
    pub const MAX_DESCRIPTION_CHARS: usize = 500;
    pub const MAX_REASON_CHARS: usize = 500;
    pub const MAX_PROOF_CHARS: usize = 2048;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Error)]
#[serde(transparent)]
pub struct ValidationErrors(BTreeMap<String, String>);

impl Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let fields = self.0.iter().map(|(k, v)| format!("{k}: {v}")).collect::<Vec<_>>().join("; ");
        write!(f, "Validation failed. {fields}")
    }
}

impl ValidationErrors {
    pub fn single<F: Into<String>, R: Into<String>>(field: F, reason: R) -> Self {
        let mut map = BTreeMap::new();
        map.insert(field.into(), reason.into());
        Self(map)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }
}

/// Collects field failures. Only the first failure for a given field is kept.
#[derive(Debug, Default)]
pub struct Validator {
    errors: BTreeMap<String, String>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail<F: Display, R: Into<String>>(&mut self, field: F, reason: R) -> &mut Self {
        self.errors.entry(field.to_string()).or_insert_with(|| reason.into());
        self
    }

    pub fn check<F: Display, R: Into<String>>(&mut self, ok: bool, field: F, reason: R) -> &mut Self {
        if !ok {
            self.fail(field, reason);
        }
        self
    }

    pub fn required<F: Display>(&mut self, field: F, value: &str) -> &mut Self {
        self.check(!value.trim().is_empty(), field, "is required")
    }

    pub fn max_chars<F: Display>(&mut self, field: F, value: Option<&str>, max: usize) -> &mut Self {
        let too_long = value.map(|v| v.chars().count() > max).unwrap_or(false);
        self.check(!too_long, field, format!("must be at most {max} characters"))
    }

    pub fn money_between<F: Display>(&mut self, field: F, value: Money, min: Money, max: Money) -> &mut Self {
        self.check(
            value >= min && value <= max,
            field,
            format!("must be between {:.2} and {:.2}", min.to_major(), max.to_major()),
        )
    }

    pub fn int_between<F: Display>(&mut self, field: F, value: i64, min: i64, max: i64) -> &mut Self {
        self.check((min..=max).contains(&value), field, format!("must be between {min} and {max}"))
    }

    pub fn finish(&mut self) -> Result<(), ValidationErrors> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationErrors(std::mem::take(&mut self.errors)))
        }
    }
}

pub fn validate_new_order(order: &NewOrder) -> Result<(), ValidationErrors> {
    let mut v = Validator::new();
    v.required("chef_id", &order.chef_id)
        .required("payment_id", &order.payment_id)
        .check(!order.items.is_empty(), "items", "must contain at least one item")
        .check(
            order.items.len() <= limits::MAX_ITEMS_PER_ORDER,
            "items",
            format!("must contain at most {} items", limits::MAX_ITEMS_PER_ORDER),
        )
        .money_between("delivery_fee", order.delivery_fee, Money::default(), limits::MAX_ORDER_TOTAL)
        .money_between("tax_amount", order.tax_amount, Money::default(), limits::MAX_ORDER_TOTAL)
        .max_chars("special_instructions", order.special_instructions.as_deref(), limits::MAX_INSTRUCTIONS_CHARS);
    for (i, item) in order.items.iter().enumerate() {
        v.required(format!("items[{i}].dish_id"), &item.dish_id)
            .int_between(format!("items[{i}].quantity"), item.quantity, 1, limits::MAX_QUANTITY)
            .money_between(format!("items[{i}].unit_price"), item.unit_price, Money::default(), limits::MAX_UNIT_PRICE)
            .max_chars(format!("items[{i}].instructions"), item.instructions.as_deref(), limits::MAX_INSTRUCTIONS_CHARS);
    }
    let total_ok = order.total().map(|t| t <= limits::MAX_ORDER_TOTAL).unwrap_or(false);
    v.check(
        total_ok,
        "total_amount",
        format!("must be at most {:.2}", limits::MAX_ORDER_TOTAL.to_major()),
    );
    v.finish()
}

pub fn validate_new_tip(tip: &NewTip) -> Result<(), ValidationErrors> {
    Validator::new()
        .money_between("amount", tip.amount, limits::MIN_TIP, limits::MAX_TIP)
        .max_chars("message", tip.message.as_deref(), limits::MAX_TIP_MESSAGE_CHARS)
        .finish()
}

pub fn validate_policy(policy: &NewCancellationPolicy) -> Result<(), ValidationErrors> {
    let rate_ok = policy.penalty_rate.is_finite() && (0.0..=1.0).contains(&policy.penalty_rate);
    Validator::new()
        .int_between("free_window_seconds", policy.free_window_seconds, 0, limits::MAX_FREE_WINDOW_SECONDS)
        .check(rate_ok, "penalty_rate", "must be between 0.0 and 1.0")
        .check(policy.min_penalty >= Money::default(), "min_penalty", "must not be negative")
        .check(policy.max_penalty >= policy.min_penalty, "max_penalty", "must not be less than min_penalty")
        .max_chars("description", Some(&policy.description), limits::MAX_DESCRIPTION_CHARS)
        .finish()
}

/// Checks that `url` is an absolute http(s) URL with a host.
pub fn check_webhook_url(v: &mut Validator, url: &str) {
    if url.len() > limits::MAX_URL_LENGTH {
        v.fail("url", format!("must be at most {} characters", limits::MAX_URL_LENGTH));
        return;
    }
    match Url::parse(url) {
        Ok(u) if !matches!(u.scheme(), "http" | "https") => {
            v.fail("url", "must use the http or https scheme");
        },
        Ok(u) if u.host_str().map(str::is_empty).unwrap_or(true) => {
            v.fail("url", "must include a host");
        },
        Ok(_) => {},
        Err(e) => {
            v.fail("url", format!("is not a valid absolute URL ({e})"));
        },
    }
}

/// Parses the subscribed event names against the catalogue. Duplicates are collapsed, order is preserved.
pub fn check_event_kinds(v: &mut Validator, events: &[String]) -> Vec<EventKind> {
    if events.is_empty() {
        v.fail("events", "must contain at least one event");
        return Vec::new();
    }
    let mut kinds = Vec::with_capacity(events.len());
    for name in events {
        match name.parse::<EventKind>() {
            Ok(kind) if kind.is_subscribable() => {
                if !kinds.contains(&kind) {
                    kinds.push(kind);
                }
            },
            _ => {
                v.fail("events", format!("unknown event '{name}'"));
            },
        }
    }
    kinds
}

fn check_retry_policy(v: &mut Validator, max_attempts: Option<i64>, base_delay: Option<i64>) {
    if let Some(n) = max_attempts {
        v.int_between("max_attempts", n, 1, limits::MAX_WEBHOOK_ATTEMPTS);
    }
    if let Some(d) = base_delay {
        v.int_between("base_delay_seconds", d, 1, limits::MAX_WEBHOOK_BASE_DELAY_SECONDS);
    }
}

pub fn validate_new_endpoint(endpoint: &NewWebhookEndpoint) -> Result<Vec<EventKind>, ValidationErrors> {
    let mut v = Validator::new();
    check_webhook_url(&mut v, &endpoint.url);
    let kinds = check_event_kinds(&mut v, &endpoint.events);
    check_retry_policy(&mut v, endpoint.max_attempts, endpoint.base_delay_seconds);
    v.max_chars("description", Some(&endpoint.description), limits::MAX_DESCRIPTION_CHARS);
    v.finish().map(|_| kinds)
}

pub fn validate_endpoint_update(update: &UpdateWebhookEndpoint) -> Result<Option<Vec<EventKind>>, ValidationErrors> {
    let mut v = Validator::new();
    v.check(!update.is_empty(), "body", "at least one field must be supplied");
    if let Some(url) = &update.url {
        check_webhook_url(&mut v, url);
    }
    let kinds = update.events.as_ref().map(|events| check_event_kinds(&mut v, events));
    check_retry_policy(&mut v, update.max_attempts, update.base_delay_seconds);
    v.max_chars("description", update.description.as_deref(), limits::MAX_DESCRIPTION_CHARS);
    v.finish().map(|_| kinds)
}
