use actix_web::{http::StatusCode, test::TestRequest, web, web::ServiceConfig};
use homechef_engine::db_types::Role;

use super::helpers::{call, expired_token, issue_token};
use crate::{hub::ConnectionHub, routes::HubStatsRoute};

fn configure(cfg: &mut ServiceConfig) {
    cfg.service(HubStatsRoute::new()).app_data(web::Data::new(ConnectionHub::start()));
}

#[actix_web::test]
async fn missing_token() {
    let _ = env_logger::try_init();
    let (status, body) = call(None, TestRequest::get().uri("/ws/stats"), configure).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "unauthenticated");
}

#[actix_web::test]
async fn garbage_and_expired_tokens() {
    let (status, body) = call(Some("not.a.jwt"), TestRequest::get().uri("/ws/stats"), configure).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthenticated");

    let token = expired_token("ops-1", Role::Admin);
    let (status, _) = call(Some(&token), TestRequest::get().uri("/ws/stats"), configure).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[actix_web::test]
async fn wrong_role_is_forbidden() {
    let token = issue_token("chef-1", Role::Chef);
    let (status, body) = call(Some(&token), TestRequest::get().uri("/ws/stats"), configure).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "forbidden");
}

#[actix_web::test]
async fn admin_sees_hub_stats() {
    let token = issue_token("ops-1", Role::Admin);
    let (status, body) = call(Some(&token), TestRequest::get().uri("/ws/stats"), configure).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["total_connections"], 0);
    assert_eq!(body["data"]["unique_users"], 0);
}
