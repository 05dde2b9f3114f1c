use std::sync::Arc;

use actix_web::{http::StatusCode, test::TestRequest, web, web::ServiceConfig};
use hc_common::Secret;
use homechef_engine::{
    clock::{SharedClock, SystemClock},
    events::{EventBus, EventProducers},
    lifecycle::FlowSettings,
    test_utils::prepare_env::{fresh_database, tear_down},
    webhooks::signer::{sign, SIGNATURE_HEADER},
    OrderFlowApi,
    SqliteDatabase,
};
use serde_json::json;

use super::helpers::call_public;
use crate::{
    middleware::HmacMiddlewareFactory,
    routes::{health, PaymentCallbackRoute},
};

const CALLBACK_SECRET: &str = "payments-collaborator-test-secret";

#[actix_web::test]
async fn health_endpoint() {
    let (status, body) = call_public(TestRequest::get().uri("/health"), |cfg| {
        cfg.service(health);
    })
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["status"], "ok");
}

fn configure_payments(db: SqliteDatabase) -> impl FnOnce(&mut ServiceConfig) {
    move |cfg| {
        let clock: SharedClock = Arc::new(SystemClock);
        let bus = EventBus::new(db.clone(), EventProducers::default());
        let api = OrderFlowApi::new(db, bus, clock, FlowSettings::default());
        cfg.service(
            web::scope("/payments")
                .wrap(HmacMiddlewareFactory::new(SIGNATURE_HEADER, Some(Secret::new(CALLBACK_SECRET.into()))))
                .service(PaymentCallbackRoute::<SqliteDatabase>::new()),
        )
        .app_data(web::Data::new(api));
    }
}

fn callback_body() -> String {
    json!({"payment_id": "pay_404", "order_id": 404, "amount": 120, "status": "success"}).to_string()
}

#[actix_web::test]
async fn payment_callbacks_must_be_signed() {
    let _ = env_logger::try_init();
    let db = fresh_database().await;
    let req = TestRequest::post()
        .uri("/payments/callback")
        .insert_header(("Content-Type", "application/json"))
        .set_payload(callback_body());
    let (status, _) = call_public(req, configure_payments(db.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let forged = sign(b"somebody-elses-secret", callback_body().as_bytes()).unwrap();
    let req = TestRequest::post()
        .uri("/payments/callback")
        .insert_header(("Content-Type", "application/json"))
        .insert_header((SIGNATURE_HEADER, forged))
        .set_payload(callback_body());
    let (status, _) = call_public(req, configure_payments(db.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    tear_down(db).await;
}

#[actix_web::test]
async fn signed_callbacks_reach_the_order_flow() {
    let db = fresh_database().await;
    let signature = sign(CALLBACK_SECRET.as_bytes(), callback_body().as_bytes()).unwrap();
    let req = TestRequest::post()
        .uri("/payments/callback")
        .insert_header(("Content-Type", "application/json"))
        .insert_header((SIGNATURE_HEADER, signature))
        .set_payload(callback_body());
    // The signature is good, so the request gets as far as looking up the (unknown) order
    let (status, body) = call_public(req, configure_payments(db.clone())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
    tear_down(db).await;
}
