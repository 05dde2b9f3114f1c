//! Bearer-token authentication.
//!
//! Tokens are issued by the external auth service and signed with the shared `AUTH_JWT_SECRET` (HS256). A verified
//! token yields the caller's user id and role, which the handlers turn into an engine [`Principal`].
use std::future::{ready, Ready};

use actix_web::{dev::Payload, FromRequest, HttpMessage, HttpRequest};
use chrono::{Duration, Utc};
use homechef_engine::db_types::{Principal, Role};
use jsonwebtoken::{decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use log::*;
use serde::{Deserialize, Serialize};

use crate::{
    config::AuthConfig,
    errors::{AuthError, ServerError},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwtClaims {
    /// The user id.
    pub sub: String,
    pub role: Role,
    pub exp: i64,
}

impl JwtClaims {
    pub fn principal(&self) -> Principal {
        Principal::new(self.sub.clone(), self.role)
    }
}

/// Handlers take `JwtClaims` as an argument to get at the caller. The claims are put in the request extensions by the
/// JWT middleware, so a handler outside that middleware will always reject the request.
impl FromRequest for JwtClaims {
    type Error = ServerError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let claims = req.extensions().get::<JwtClaims>().cloned().ok_or_else(|| AuthError::MissingToken.into());
        ready(claims)
    }
}

#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(config: &AuthConfig) -> Self {
        let key = DecodingKey::from_secret(config.jwt_secret.reveal().as_bytes());
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self { key, validation }
    }

    pub fn verify(&self, token: &str) -> Result<JwtClaims, AuthError> {
        let data = decode::<JwtClaims>(token, &self.key, &self.validation).map_err(|e| {
            debug!("🔐️ Rejected access token. {e}");
            match e.kind() {
                ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) => {
                    AuthError::PoorlyFormattedToken(e.to_string())
                },
                _ => AuthError::ValidationError(e.to_string()),
            }
        })?;
        Ok(data.claims)
    }

    /// Extracts and verifies the token from an `Authorization: Bearer <token>` header value.
    pub fn verify_header(&self, header: Option<&str>) -> Result<JwtClaims, AuthError> {
        let value = header.ok_or(AuthError::MissingToken)?;
        let token = value
            .strip_prefix("Bearer ")
            .or_else(|| value.strip_prefix("bearer "))
            .ok_or_else(|| AuthError::PoorlyFormattedToken("Expected a Bearer token".to_string()))?;
        self.verify(token.trim())
    }
}

/// Signs access tokens with the shared secret. The server itself never hands tokens out; this is for tooling and
/// tests that need to act as the auth service.
pub struct TokenIssuer {
    key: EncodingKey,
}

impl TokenIssuer {
    pub fn new(config: &AuthConfig) -> Self {
        Self { key: EncodingKey::from_secret(config.jwt_secret.reveal().as_bytes()) }
    }

    pub fn issue_token(&self, principal: &Principal, valid_for: Option<Duration>) -> Result<String, AuthError> {
        let valid_for = valid_for.unwrap_or_else(|| Duration::hours(24));
        let claims =
            JwtClaims { sub: principal.user_id.clone(), role: principal.role, exp: (Utc::now() + valid_for).timestamp() };
        encode(&Header::new(Algorithm::HS256), &claims, &self.key)
            .map_err(|e| AuthError::CouldNotIssueToken(e.to_string()))
    }
}

#[cfg(test)]
mod test {
    use hc_common::Secret;

    use super::*;

    fn config(secret: &str) -> AuthConfig {
        AuthConfig { jwt_secret: Secret::new(secret.to_string()) }
    }

    #[test]
    fn issued_tokens_verify() {
        let cfg = config("a-test-secret-of-reasonable-length");
        let token = TokenIssuer::new(&cfg).issue_token(&Principal::new("chef-1", Role::Chef), None).unwrap();
        let claims = TokenVerifier::new(&cfg).verify_header(Some(&format!("Bearer {token}"))).unwrap();
        assert_eq!(claims.principal(), Principal::new("chef-1", Role::Chef));
    }

    #[test]
    fn foreign_and_expired_tokens_are_rejected() {
        let ours = config("a-test-secret-of-reasonable-length");
        let theirs = config("somebody-elses-secret-entirely");
        let p = Principal::new("cust-1", Role::Customer);
        let token = TokenIssuer::new(&theirs).issue_token(&p, None).unwrap();
        assert!(matches!(TokenVerifier::new(&ours).verify(&token), Err(AuthError::ValidationError(_))));
        let expired = TokenIssuer::new(&ours).issue_token(&p, Some(Duration::hours(-1))).unwrap();
        assert!(TokenVerifier::new(&ours).verify(&expired).is_err());
    }

    #[test]
    fn header_must_be_a_bearer_token() {
        let v = TokenVerifier::new(&config("a-test-secret-of-reasonable-length"));
        assert!(matches!(v.verify_header(None), Err(AuthError::MissingToken)));
        assert!(matches!(v.verify_header(Some("Basic Zm9vOmJhcg==")), Err(AuthError::PoorlyFormattedToken(_))));
        assert!(matches!(v.verify_header(Some("Bearer not.a.jwt")), Err(AuthError::PoorlyFormattedToken(_))));
    }
}
