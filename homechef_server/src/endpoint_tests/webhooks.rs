use std::sync::Arc;

use actix_web::{http::StatusCode, test::TestRequest, web, web::ServiceConfig};
use chrono::Utc;
use homechef_engine::{
    clock::{SharedClock, SystemClock},
    db_types::{DeliveryStatus, EventKind, Role, WebhookDelivery},
    events::{EventBus, EventProducers},
    hce_api::webhook_objects::WebhookDefaults,
    webhooks::{SecretVault, WebhookDispatcher},
    WebhookApi,
};
use mockall::predicate::eq;
use serde_json::json;

use super::{
    helpers::{call, issue_token},
    mocks::{endpoint, MockWebhookStore},
};
use crate::routes::{
    CreateWebhookRoute,
    EventCatalogueRoute,
    MyWebhooksRoute,
    RetryDeliveryRoute,
    WebhookByIdRoute,
    WebhookDeliveriesRoute,
};

/// The API, the event bus and the dispatcher each get their own store. Only the API's store sees calls in these tests.
fn configure(store: MockWebhookStore) -> impl FnOnce(&mut ServiceConfig) {
    move |cfg| {
        let clock: SharedClock = Arc::new(SystemClock);
        let bus = EventBus::new(MockWebhookStore::new(), EventProducers::default());
        let dispatcher = WebhookDispatcher::new(
            MockWebhookStore::new(),
            SecretVault::random(),
            clock.clone(),
            std::time::Duration::from_secs(1),
        )
        .unwrap();
        let api = WebhookApi::new(store, bus, dispatcher, clock, WebhookDefaults::default());
        cfg.service(EventCatalogueRoute::<MockWebhookStore>::new())
            .service(CreateWebhookRoute::<MockWebhookStore>::new())
            .service(MyWebhooksRoute::<MockWebhookStore>::new())
            .service(WebhookByIdRoute::<MockWebhookStore>::new())
            .service(WebhookDeliveriesRoute::<MockWebhookStore>::new())
            .service(RetryDeliveryRoute::<MockWebhookStore>::new())
            .app_data(web::Data::new(api));
    }
}

fn delivery(id: i64, endpoint_id: i64, status: DeliveryStatus) -> WebhookDelivery {
    let now = Utc::now();
    WebhookDelivery {
        id,
        endpoint_id,
        event_kind: EventKind::OrderCreated,
        order_id: None,
        event_seq: Some(1),
        payload: json!({"event": "order.created"}),
        event_timestamp: now,
        status,
        last_http_status: Some(200),
        last_response_body: None,
        attempt_count: 1,
        next_retry_at: None,
        delivered_at: Some(now),
        failed_at: None,
        error_message: None,
        claimed_by: None,
        claimed_at: None,
        created_at: now,
        updated_at: now,
    }
}

#[actix_web::test]
async fn list_my_endpoints() {
    let _ = env_logger::try_init();
    let mut store = MockWebhookStore::new();
    store
        .expect_fetch_endpoints_for_owner()
        .with(eq("partner-1"))
        .times(1)
        .returning(|owner| Ok(vec![endpoint(3, owner), endpoint(4, owner)]));
    let token = issue_token("partner-1", Role::Customer);
    let (status, body) = call(Some(&token), TestRequest::get().uri("/webhooks"), configure(store)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    let endpoints = body["data"].as_array().unwrap();
    assert_eq!(endpoints.len(), 2);
    assert_eq!(endpoints[0]["events"], json!(["order.created", "order.cancelled"]));
    assert!(endpoints[0].get("secret_ciphertext").is_none(), "secrets must never be serialized");
}

#[actix_web::test]
async fn someone_elses_endpoint_is_forbidden() {
    let mut store = MockWebhookStore::new();
    store.expect_fetch_endpoint().with(eq(7)).returning(|id| Ok(Some(endpoint(id, "partner-2"))));
    let token = issue_token("partner-1", Role::Customer);
    let (status, body) = call(Some(&token), TestRequest::get().uri("/webhooks/7"), configure(store)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "forbidden");
}

#[actix_web::test]
async fn admins_can_read_any_endpoint() {
    let mut store = MockWebhookStore::new();
    store.expect_fetch_endpoint().with(eq(7)).returning(|id| Ok(Some(endpoint(id, "partner-2"))));
    let token = issue_token("ops-1", Role::Admin);
    let (status, body) = call(Some(&token), TestRequest::get().uri("/webhooks/7"), configure(store)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["owner_id"], "partner-2");
}

#[actix_web::test]
async fn deleted_and_unknown_endpoints_are_not_found() {
    let token = issue_token("partner-1", Role::Customer);
    let mut store = MockWebhookStore::new();
    store.expect_fetch_endpoint().with(eq(8)).returning(|_| Ok(None));
    let (status, body) = call(Some(&token), TestRequest::get().uri("/webhooks/8"), configure(store)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");

    let mut store = MockWebhookStore::new();
    store.expect_fetch_endpoint().with(eq(9)).returning(|id| {
        let mut e = endpoint(id, "partner-1");
        e.deleted_at = Some(Utc::now());
        Ok(Some(e))
    });
    let (status, _) = call(Some(&token), TestRequest::get().uri("/webhooks/9"), configure(store)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[actix_web::test]
async fn invalid_endpoints_report_every_field() {
    // Validation fails before the store is touched
    let store = MockWebhookStore::new();
    let token = issue_token("partner-1", Role::Customer);
    let req = TestRequest::post().uri("/webhooks").set_json(json!({
        "url": "ftp://hooks.example.com",
        "events": ["order.created", "order.teleported"],
        "description": "Broken"
    }));
    let (status, body) = call(Some(&token), req, configure(store)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_request");
    assert!(body["details"]["url"].is_string(), "was {body}");
    assert!(body["details"]["events"].is_string(), "was {body}");
}

#[actix_web::test]
async fn created_endpoint_returns_its_secret_once() {
    let mut store = MockWebhookStore::new();
    store.expect_insert_endpoint().times(1).returning(|draft, _| {
        let mut e = endpoint(11, &draft.owner_id);
        e.url = draft.url;
        e.events = draft.events;
        e.secret_ciphertext = draft.secret_ciphertext;
        Ok(e)
    });
    let token = issue_token("partner-1", Role::Chef);
    let req = TestRequest::post().uri("/webhooks").set_json(json!({
        "url": "https://hooks.example.com/kitchen",
        "events": ["order.created"],
        "description": "Kitchen printer"
    }));
    let (status, body) = call(Some(&token), req, configure(store)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["id"], 11);
    assert_eq!(body["data"]["owner_id"], "partner-1");
    let secret = body["data"]["secret"].as_str().unwrap();
    assert!(secret.starts_with("whsec_"));
    assert_eq!(secret.len(), "whsec_".len() + 64);
}

#[actix_web::test]
async fn only_failed_deliveries_can_be_retried() {
    let mut store = MockWebhookStore::new();
    store.expect_fetch_delivery().with(eq(40)).returning(|id| Ok(Some(delivery(id, 3, DeliveryStatus::Success))));
    store.expect_fetch_endpoint().with(eq(3)).returning(|id| Ok(Some(endpoint(id, "partner-1"))));
    store.expect_reset_delivery().returning(|_, _| Ok(None));
    let token = issue_token("partner-1", Role::Customer);
    let (status, body) =
        call(Some(&token), TestRequest::post().uri("/webhooks/deliveries/40/retry"), configure(store)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "conflict");
}

#[actix_web::test]
async fn delivery_log_passes_the_filter_through() {
    let mut store = MockWebhookStore::new();
    store.expect_fetch_endpoint().with(eq(3)).returning(|id| Ok(Some(endpoint(id, "partner-1"))));
    store
        .expect_fetch_deliveries_for_endpoint()
        .with(eq(3), eq(Some(DeliveryStatus::Failed)), eq(10))
        .times(1)
        .returning(|endpoint_id, _, _| Ok(vec![delivery(41, endpoint_id, DeliveryStatus::Failed)]));
    let token = issue_token("partner-1", Role::Customer);
    let req = TestRequest::get().uri("/webhooks/3/deliveries?status=failed&limit=10");
    let (status, body) = call(Some(&token), req, configure(store)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"][0]["id"], 41);
}

#[actix_web::test]
async fn catalogue_lists_subscribable_events() {
    let token = issue_token("partner-1", Role::Customer);
    let (status, body) =
        call(Some(&token), TestRequest::get().uri("/webhooks/events"), configure(MockWebhookStore::new())).await;
    assert_eq!(status, StatusCode::OK);
    let names = body["data"].as_array().unwrap().iter().map(|e| e["name"].as_str().unwrap()).collect::<Vec<_>>();
    assert!(names.contains(&"order.created"));
    assert!(names.contains(&"countdown.expired"));
    assert!(!names.contains(&"webhook.test"));
}
