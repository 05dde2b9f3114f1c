use std::{sync::Arc, time::Duration as StdDuration};

use homechef_engine::{
    clock::{ManualClock, SharedClock},
    db_types::{DeliveryStatus, EventKind, NewWebhookEndpoint, Principal, Role, UpdateWebhookEndpoint, WebhookDelivery},
    events::{EventBus, EventHandlers, EventHooks},
    hce_api::webhook_objects::{CreatedEndpoint, DeliveryQuery, WebhookDefaults},
    lifecycle::FlowSettings,
    test_utils::prepare_env::{fresh_database, tear_down},
    traits::{WebhookError, WebhookManagement},
    webhooks::{
        signer::{verify, DELIVERY_HEADER, EVENT_HEADER, SIGNATURE_HEADER},
        DispatchOutcome,
        SecretVault,
        WebhookDispatcher,
    },
    OrderFlowApi,
    PolicyApi,
    SqliteDatabase,
    WebhookApi,
};
use wiremock::{
    matchers::{method, path},
    Mock,
    MockServer,
    ResponseTemplate,
};

mod support;
use support::{customer, order_for, standard_policy, t0};

fn integrator() -> Principal {
    Principal::new("partner-1", Role::Customer)
}

struct WebhookHarness {
    db: SqliteDatabase,
    clock: ManualClock,
    orders: OrderFlowApi<SqliteDatabase>,
    webhooks: WebhookApi<SqliteDatabase>,
    dispatcher: WebhookDispatcher<SqliteDatabase>,
    server: MockServer,
}

impl WebhookHarness {
    async fn new() -> Self {
        let db = fresh_database().await;
        let clock = ManualClock::new(t0());
        let shared: SharedClock = Arc::new(clock.clone());
        PolicyApi::new(db.clone(), shared.clone()).ensure_active_policy(standard_policy()).await.unwrap();
        let handlers = EventHandlers::new(16, EventHooks::default());
        let bus = EventBus::new(db.clone(), handlers.producers());
        let dispatcher =
            WebhookDispatcher::new(db.clone(), SecretVault::random(), shared.clone(), StdDuration::from_secs(2)).unwrap();
        let orders = OrderFlowApi::new(db.clone(), bus.clone(), shared.clone(), FlowSettings::default());
        let webhooks = WebhookApi::new(db.clone(), bus, dispatcher.clone(), shared, WebhookDefaults::default());
        let server = MockServer::start().await;
        Self { db, clock, orders, webhooks, dispatcher, server }
    }

    async fn register(&self, events: &[&str], max_attempts: i64, base_delay_seconds: i64) -> CreatedEndpoint {
        let endpoint = NewWebhookEndpoint {
            url: format!("{}/hooks/homechef", self.server.uri()),
            events: events.iter().map(|s| s.to_string()).collect(),
            description: "Partner integration".into(),
            max_attempts: Some(max_attempts),
            base_delay_seconds: Some(base_delay_seconds),
        };
        self.webhooks.create_endpoint(&integrator(), endpoint).await.unwrap()
    }

    async fn deliveries(&self, endpoint_id: i64) -> Vec<WebhookDelivery> {
        self.webhooks.list_deliveries(&integrator(), endpoint_id, DeliveryQuery::default()).await.unwrap()
    }

    fn advance_secs(&self, secs: i64) {
        self.clock.advance(chrono::Duration::seconds(secs));
    }

    async fn finish(self) {
        tear_down(self.db).await;
    }
}

#[tokio::test]
async fn failed_deliveries_back_off_and_eventually_succeed() {
    let h = WebhookHarness::new().await;
    Mock::given(method("POST"))
        .and(path("/hooks/homechef"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
        .up_to_n_times(2)
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/hooks/homechef"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&h.server)
        .await;
    let created = h.register(&["order.created"], 3, 2).await;
    assert!(created.secret.starts_with("whsec_"));
    let order = h.orders.place_order(&customer(), order_for(450)).await.unwrap();

    let queued = h.deliveries(created.endpoint.id).await;
    assert_eq!(queued.len(), 1, "only the subscribed event is queued");
    let id = queued[0].id;
    assert_eq!(queued[0].order_id, Some(order.id));

    let outcome = h.dispatcher.dispatch(id).await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Retrying { next_retry_at: t0() + chrono::Duration::seconds(2) });
    // Not due yet
    assert_eq!(h.dispatcher.sweep(10).await.unwrap(), 0);

    h.advance_secs(2);
    assert_eq!(h.dispatcher.sweep(10).await.unwrap(), 1);
    let second = h.db.fetch_delivery(id).await.unwrap().unwrap();
    assert_eq!(second.status, DeliveryStatus::Pending);
    assert_eq!(second.attempt_count, 2);
    assert_eq!(second.last_http_status, Some(500));
    assert_eq!(second.last_response_body.as_deref(), Some("upstream exploded"));
    assert_eq!(second.next_retry_at, Some(t0() + chrono::Duration::seconds(6)));

    h.advance_secs(4);
    assert_eq!(h.dispatcher.sweep(10).await.unwrap(), 1);
    let done = h.db.fetch_delivery(id).await.unwrap().unwrap();
    assert_eq!(done.status, DeliveryStatus::Success);
    assert_eq!(done.attempt_count, 3);
    assert_eq!(done.last_http_status, Some(200));
    assert_eq!(done.delivered_at, Some(t0() + chrono::Duration::seconds(6)));
    assert!(done.claimed_by.is_none());

    let requests = h.server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 3);
    assert!(requests.windows(2).all(|w| w[0].body == w[1].body), "every attempt sends the same bytes");
    h.finish().await;
}

#[tokio::test]
async fn deliveries_are_signed_with_the_endpoint_secret() {
    let h = WebhookHarness::new().await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(204)).mount(&h.server).await;
    let created = h.register(&["order.created", "order.sent_to_chef"], 5, 30).await;
    let order = h.orders.place_order(&customer(), order_for(450)).await.unwrap();
    assert_eq!(h.dispatcher.sweep(10).await.unwrap(), 2);

    let requests = h.server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    for request in &requests {
        let signature = request.headers.get(SIGNATURE_HEADER).unwrap().to_str().unwrap();
        assert!(verify(created.secret.as_bytes(), &request.body, signature).unwrap());
        assert!(!verify(b"someone-elses-secret", &request.body, signature).unwrap());
        assert!(request.headers.get(DELIVERY_HEADER).is_some());
    }
    let first: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(requests[0].headers.get(EVENT_HEADER).unwrap(), "order.created");
    assert_eq!(first["event"], "order.created");
    assert_eq!(first["webhook_id"], created.endpoint.id);
    assert_eq!(first["data"]["order_id"], order.id.0);
    assert_eq!(first["timestamp"], "2024-06-01T12:00:00.000Z");
    let second: serde_json::Value = serde_json::from_slice(&requests[1].body).unwrap();
    assert_eq!(second["event"], "order.sent_to_chef");
    h.finish().await;
}

#[tokio::test]
async fn exhausted_deliveries_can_be_retried_by_the_owner() {
    let h = WebhookHarness::new().await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(503)).up_to_n_times(1).mount(&h.server).await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(&h.server).await;
    let created = h.register(&["order.created"], 1, 30).await;
    h.orders.place_order(&customer(), order_for(450)).await.unwrap();
    let id = h.deliveries(created.endpoint.id).await[0].id;

    assert_eq!(h.dispatcher.dispatch(id).await.unwrap(), DispatchOutcome::Failed);
    let failed = h.db.fetch_delivery(id).await.unwrap().unwrap();
    assert_eq!(failed.status, DeliveryStatus::Failed);
    assert!(failed.failed_at.is_some());

    let failed_only = DeliveryQuery { status: Some(DeliveryStatus::Failed), limit: None };
    let listed = h.webhooks.list_deliveries(&integrator(), created.endpoint.id, failed_only).await.unwrap();
    assert_eq!(listed.len(), 1);

    let stranger = Principal::new("partner-2", Role::Customer);
    let err = h.webhooks.retry_delivery(&stranger, id).await.unwrap_err();
    assert!(matches!(err, WebhookError::Forbidden(_)));

    let reset = h.webhooks.retry_delivery(&integrator(), id).await.unwrap();
    assert_eq!(reset.status, DeliveryStatus::Pending);
    assert_eq!(reset.attempt_count, 0);
    assert!(reset.error_message.is_none());

    assert_eq!(h.dispatcher.dispatch(id).await.unwrap(), DispatchOutcome::Delivered);
    let err = h.webhooks.retry_delivery(&integrator(), id).await.unwrap_err();
    assert!(matches!(err, WebhookError::DeliveryNotRetryable { status: DeliveryStatus::Success, .. }));
    h.finish().await;
}

#[tokio::test]
async fn deleting_an_endpoint_abandons_pending_deliveries() {
    let h = WebhookHarness::new().await;
    let created = h.register(&["order.created"], 5, 30).await;
    let id = created.endpoint.id;
    h.orders.place_order(&customer(), order_for(450)).await.unwrap();
    h.orders.place_order(&customer(), order_for(120)).await.unwrap();

    assert_eq!(h.webhooks.delete_endpoint(&integrator(), id).await.unwrap(), 2);
    let err = h.webhooks.get_endpoint(&integrator(), id).await.unwrap_err();
    assert!(matches!(err, WebhookError::EndpointNotFound(_)));
    assert!(h.webhooks.list_endpoints(&integrator()).await.unwrap().is_empty());

    let deliveries = h.db.fetch_deliveries_for_endpoint(id, None, 10).await.unwrap();
    assert_eq!(deliveries.len(), 2);
    assert!(deliveries.iter().all(|d| d.status == DeliveryStatus::Failed));
    assert_eq!(h.dispatcher.sweep(10).await.unwrap(), 0);

    // Later events are not queued for the deleted endpoint
    h.orders.place_order(&customer(), order_for(80)).await.unwrap();
    assert_eq!(h.db.fetch_deliveries_for_endpoint(id, None, 10).await.unwrap().len(), 2);
    assert!(h.server.received_requests().await.unwrap().is_empty());
    h.finish().await;
}

#[tokio::test]
async fn test_fire_sends_immediately() {
    let h = WebhookHarness::new().await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(&h.server).await;
    let created = h.register(&["order.delivered"], 5, 30).await;
    let delivery = h.webhooks.test_endpoint(&integrator(), created.endpoint.id).await.unwrap();
    assert_eq!(delivery.event_kind, EventKind::WebhookTest);
    assert_eq!(delivery.status, DeliveryStatus::Success);
    assert_eq!(delivery.attempt_count, 1);
    assert_eq!(delivery.order_id, None);

    let requests = h.server.received_requests().await.unwrap();
    assert_eq!(requests[0].headers.get(EVENT_HEADER).unwrap(), "webhook.test");

    let disable = UpdateWebhookEndpoint { is_active: Some(false), ..Default::default() };
    let updated = h.webhooks.update_endpoint(&integrator(), created.endpoint.id, disable).await.unwrap();
    assert!(!updated.is_active);
    let err = h.webhooks.test_endpoint(&integrator(), created.endpoint.id).await.unwrap_err();
    assert!(matches!(err, WebhookError::ValidationError(_)));
    h.finish().await;
}

#[tokio::test]
async fn only_one_worker_sends_a_delivery() {
    let h = WebhookHarness::new().await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(&h.server).await;
    let created = h.register(&["order.created"], 5, 30).await;
    h.orders.place_order(&customer(), order_for(450)).await.unwrap();
    let id = h.deliveries(created.endpoint.id).await[0].id;

    let (a, b) = (h.dispatcher.for_worker(1), h.dispatcher.for_worker(2));
    let (ra, rb) = tokio::join!(a.dispatch(id), b.dispatch(id));
    let outcomes = [ra.unwrap(), rb.unwrap()];
    assert_eq!(outcomes.iter().filter(|o| **o == DispatchOutcome::Skipped).count(), 1);
    assert_eq!(h.server.received_requests().await.unwrap().len(), 1);
    h.finish().await;
}

#[tokio::test]
async fn unknown_event_names_are_rejected() {
    let h = WebhookHarness::new().await;
    let endpoint = NewWebhookEndpoint {
        url: format!("{}/hooks", h.server.uri()),
        events: vec!["order.created".into(), "order.teleported".into()],
        description: String::new(),
        max_attempts: None,
        base_delay_seconds: None,
    };
    let err = h.webhooks.create_endpoint(&integrator(), endpoint).await.unwrap_err();
    assert!(matches!(err, WebhookError::ValidationError(_)));
    let catalogue = WebhookApi::<SqliteDatabase>::event_catalogue();
    assert_eq!(catalogue.len(), 12);
    assert!(catalogue.iter().all(|e| e.name != EventKind::WebhookTest));
    h.finish().await;
}
