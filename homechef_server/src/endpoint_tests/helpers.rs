use actix_web::{
    body::to_bytes,
    http::StatusCode,
    test,
    test::TestRequest,
    web::ServiceConfig,
    App,
    ResponseError,
};
use hc_common::Secret;
use homechef_engine::db_types::{Principal, Role};
use log::debug;
use serde_json::Value;

use crate::{
    auth::{TokenIssuer, TokenVerifier},
    config::AuthConfig,
    middleware::JwtMiddlewareFactory,
};

// DO NOT re-use this secret anywhere.
pub fn get_auth_config() -> AuthConfig {
    AuthConfig { jwt_secret: Secret::new("endpoint-tests-only-8f1c2a97d4e3".into()) }
}

pub fn issue_token(user_id: &str, role: Role) -> String {
    TokenIssuer::new(&get_auth_config()).issue_token(&Principal::new(user_id, role), None).unwrap()
}

pub fn expired_token(user_id: &str, role: Role) -> String {
    TokenIssuer::new(&get_auth_config())
        .issue_token(&Principal::new(user_id, role), Some(chrono::Duration::hours(-2)))
        .unwrap()
}

/// Sends `req` through an app that has the JWT middleware wrapped around the services added by `configure`.
/// Returns the status and the JSON body (or `Value::Null` for an empty body).
pub async fn call<F>(token: Option<&str>, req: TestRequest, configure: F) -> (StatusCode, Value)
where F: FnOnce(&mut ServiceConfig) {
    let verifier = TokenVerifier::new(&get_auth_config());
    let app = App::new().wrap(JwtMiddlewareFactory::new(verifier)).configure(configure);
    call_app(token, req, app).await
}

/// Like [`call`], but without the JWT middleware. For public routes.
pub async fn call_public<F>(req: TestRequest, configure: F) -> (StatusCode, Value)
where F: FnOnce(&mut ServiceConfig) {
    call_app(None, req, App::new().configure(configure)).await
}

async fn call_app<T, B>(token: Option<&str>, req: TestRequest, app: App<T>) -> (StatusCode, Value)
where
    T: actix_web::dev::ServiceFactory<
            actix_web::dev::ServiceRequest,
            Config = (),
            Response = actix_web::dev::ServiceResponse<B>,
            Error = actix_web::Error,
            InitError = (),
        > + 'static,
    B: actix_web::body::MessageBody + 'static,
{
    let req = match token {
        Some(t) => req.insert_header(("Authorization", format!("Bearer {t}"))),
        None => req,
    };
    let service = test::init_service(app).await;
    let res = match test::try_call_service(&service, req.to_request()).await {
        Ok(res) => res.map_into_boxed_body().into_parts().1,
        Err(e) => e.as_response_error().error_response(),
    };
    let status = res.status();
    let bytes = to_bytes(res.into_body()).await.unwrap();
    debug!("Response {status}: {}", String::from_utf8_lossy(&bytes));
    let body = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
    (status, body)
}
