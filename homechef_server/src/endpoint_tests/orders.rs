use std::sync::Arc;

use actix_web::{http::StatusCode, test::TestRequest, web, web::ServiceConfig};
use hc_common::Money;
use homechef_engine::{
    clock::{SharedClock, SystemClock},
    db_types::{NewCancellationPolicy, Role},
    events::{EventBus, EventProducers},
    lifecycle::FlowSettings,
    test_utils::prepare_env::{fresh_database, tear_down},
    OrderFlowApi,
    PolicyApi,
    SqliteDatabase,
};
use serde_json::{json, Value};

use super::helpers::{call, issue_token};
use crate::routes::{
    ActivePolicyRoute,
    CancelOrderRoute,
    ChefAcceptRoute,
    CountdownStatusRoute,
    OrderByIdRoute,
    OrderTimelineRoute,
    PlaceOrderRoute,
    ReplacePolicyRoute,
};

struct TestApp {
    db: SqliteDatabase,
    orders: web::Data<OrderFlowApi<SqliteDatabase>>,
    policies: web::Data<PolicyApi<SqliteDatabase>>,
}

impl TestApp {
    async fn new() -> Self {
        let db = fresh_database().await;
        let clock: SharedClock = Arc::new(SystemClock);
        let policies = PolicyApi::new(db.clone(), clock.clone());
        policies
            .ensure_active_policy(NewCancellationPolicy {
                free_window_seconds: 30,
                penalty_rate: 0.4,
                min_penalty: Money::from_major(20),
                max_penalty: Money::from_major(500),
                description: "Standard".into(),
            })
            .await
            .unwrap();
        let bus = EventBus::new(db.clone(), EventProducers::default());
        let orders = OrderFlowApi::new(db.clone(), bus, clock, FlowSettings::default());
        Self { db, orders: web::Data::new(orders), policies: web::Data::new(policies) }
    }

    fn configure(&self) -> impl FnOnce(&mut ServiceConfig) {
        let orders = self.orders.clone();
        let policies = self.policies.clone();
        move |cfg| {
            cfg.service(PlaceOrderRoute::<SqliteDatabase>::new())
                .service(OrderByIdRoute::<SqliteDatabase>::new())
                .service(OrderTimelineRoute::<SqliteDatabase>::new())
                .service(CountdownStatusRoute::<SqliteDatabase>::new())
                .service(CancelOrderRoute::<SqliteDatabase>::new())
                .service(ChefAcceptRoute::<SqliteDatabase>::new())
                .service(ActivePolicyRoute::<SqliteDatabase>::new())
                .service(ReplacePolicyRoute::<SqliteDatabase>::new())
                .app_data(orders)
                .app_data(policies);
        }
    }

    async fn send(&self, token: &str, req: TestRequest) -> (StatusCode, Value) {
        call(Some(token), req, self.configure()).await
    }

    async fn place_order(&self, customer: &str) -> i64 {
        let token = issue_token(customer, Role::Customer);
        let req = TestRequest::post().uri("/orders").set_json(json!({
            "chef_id": "chef-1",
            "items": [{"dish_id": "paneer-tikka", "quantity": 2, "unit_price": 225}],
            "delivery_fee": 40,
            "tax_amount": 10,
            "payment_id": "pay_1001"
        }));
        let (status, body) = self.send(&token, req).await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        body["data"]["id"].as_i64().unwrap()
    }
}

#[actix_web::test]
async fn customer_places_an_order() {
    let _ = env_logger::try_init();
    let app = TestApp::new().await;
    let id = app.place_order("cust-1").await;

    let token = issue_token("cust-1", Role::Customer);
    let (status, body) = app.send(&token, TestRequest::get().uri(&format!("/orders/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    let order = &body["data"];
    assert_eq!(order["status"], "sent_to_chef");
    assert_eq!(order["can_cancel_free"], true);
    assert!(order["countdown_expiry"].is_string());
    assert_eq!(order["total_amount"], json!(500.0));
    assert_eq!(order["items"].as_array().unwrap().len(), 1);

    let (status, body) = app.send(&token, TestRequest::get().uri(&format!("/orders/{id}/timeline"))).await;
    assert_eq!(status, StatusCode::OK);
    let statuses = body["data"].as_array().unwrap().iter().map(|e| e["status"].clone()).collect::<Vec<_>>();
    assert_eq!(statuses, vec![json!("payment_confirmed"), json!("sent_to_chef")]);

    let (status, body) = app.send(&token, TestRequest::get().uri(&format!("/orders/{id}/countdown-status"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["is_active"], true);
    tear_down(app.db).await;
}

#[actix_web::test]
async fn chefs_cannot_place_orders() {
    let app = TestApp::new().await;
    let token = issue_token("chef-1", Role::Chef);
    let req = TestRequest::post().uri("/orders").set_json(json!({"chef_id": "chef-1", "items": [], "payment_id": "p"}));
    let (status, body) = app.send(&token, req).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "forbidden");
    tear_down(app.db).await;
}

#[actix_web::test]
async fn malformed_orders_are_rejected_with_details() {
    let app = TestApp::new().await;
    let token = issue_token("cust-1", Role::Customer);
    let req = TestRequest::post().uri("/orders").set_json(json!({
        "chef_id": "chef-1",
        "items": [],
        "payment_id": "pay_1"
    }));
    let (status, body) = app.send(&token, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_request");
    assert!(body["details"]["items"].is_string(), "{body}");
    tear_down(app.db).await;
}

#[actix_web::test]
async fn absurd_prices_are_rejected_not_overflowed() {
    let app = TestApp::new().await;
    let token = issue_token("cust-1", Role::Customer);
    let req = TestRequest::post().uri("/orders").set_json(json!({
        "chef_id": "chef-1",
        "items": [{"dish_id": "gold-leaf-biryani", "quantity": 99, "unit_price": 4.0e16}],
        "payment_id": "pay_2"
    }));
    let (status, body) = app.send(&token, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["details"]["items[0].unit_price"].is_string(), "{body}");
    assert!(body["details"]["total_amount"].is_string(), "{body}");
    tear_down(app.db).await;
}

#[actix_web::test]
async fn free_cancellation_inside_the_window() {
    let app = TestApp::new().await;
    let id = app.place_order("cust-1").await;
    let token = issue_token("cust-1", Role::Customer);
    let req = TestRequest::post().uri(&format!("/orders/{id}/cancel")).set_json(json!({"reason": "Changed my mind"}));
    let (status, body) = app.send(&token, req).await;
    assert_eq!(status, StatusCode::OK);
    let receipt = &body["data"];
    assert_eq!(receipt["type"], "free");
    assert_eq!(receipt["penalty"], json!(0.0));
    assert_eq!(receipt["refund"], json!(500.0));
    assert!(receipt["refund_timeline"].as_str().unwrap().contains("business days"));
    tear_down(app.db).await;
}

#[actix_web::test]
async fn strangers_cannot_cancel_or_read() {
    let app = TestApp::new().await;
    let id = app.place_order("cust-1").await;
    let token = issue_token("cust-2", Role::Customer);
    let (status, _) = app.send(&token, TestRequest::post().uri(&format!("/orders/{id}/cancel"))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = app.send(&token, TestRequest::get().uri(&format!("/orders/{id}"))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    tear_down(app.db).await;
}

#[actix_web::test]
async fn accepting_a_cancelled_order_reports_the_observed_state() {
    let app = TestApp::new().await;
    let id = app.place_order("cust-1").await;
    let customer = issue_token("cust-1", Role::Customer);
    let (status, _) = app.send(&customer, TestRequest::post().uri(&format!("/orders/{id}/cancel"))).await;
    assert_eq!(status, StatusCode::OK);

    let chef = issue_token("chef-1", Role::Chef);
    let req = TestRequest::post().uri(&format!("/orders/{id}/chef/accept")).set_json(json!({"estimated_prep_time": 25}));
    let (status, body) = app.send(&chef, req).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "invalid_transition");
    assert_eq!(body["observed_state"], "cancelled");
    tear_down(app.db).await;
}

#[actix_web::test]
async fn unknown_orders_are_not_found() {
    let app = TestApp::new().await;
    let token = issue_token("cust-1", Role::Customer);
    let (status, body) = app.send(&token, TestRequest::get().uri("/orders/9999")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
    tear_down(app.db).await;
}

#[actix_web::test]
async fn only_admins_replace_the_policy() {
    let app = TestApp::new().await;
    let policy = json!({
        "free_window_seconds": 60,
        "penalty_rate": 0.25,
        "min_penalty": 10,
        "max_penalty": 300,
        "description": "Longer window"
    });
    let chef = issue_token("chef-1", Role::Chef);
    let req = TestRequest::put().uri("/cancellation-policy").set_json(policy.clone());
    let (status, _) = app.send(&chef, req).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let admin = issue_token("ops-1", Role::Admin);
    let req = TestRequest::put().uri("/cancellation-policy").set_json(policy);
    let (status, body) = app.send(&admin, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["free_window_seconds"], 60);

    let (status, body) = app.send(&chef, TestRequest::get().uri("/cancellation-policy")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["description"], "Longer window");
    assert_eq!(body["data"]["updated_by"], "ops-1");
    tear_down(app.db).await;
}
