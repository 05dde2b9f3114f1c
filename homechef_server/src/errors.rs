use std::collections::BTreeMap;

use actix_web::{
    error::ResponseError,
    http::{header::ContentType, StatusCode},
    HttpResponse,
};
use homechef_engine::{
    db_types::OrderStatusType,
    traits::{OrderFlowError, WebhookError},
    validation::ValidationErrors,
};
use log::*;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("{message}")]
    InvalidRequest { message: String, details: Option<BTreeMap<String, String>> },
    #[error("Authentication failed. {0}")]
    Unauthenticated(String),
    #[error("Not allowed. {0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{message}")]
    InvalidTransition { message: String, observed: OrderStatusType },
    #[error("{0}")]
    Conflict(String),
    #[error("Too many requests. {0}")]
    RateLimited(String),
    #[error("The service is temporarily unavailable. {0}")]
    StoreUnavailable(String),
    #[error("An internal error occurred. Quote reference {correlation_id} when reporting this problem.")]
    Internal { correlation_id: Uuid },
    #[error("Could not initialize server. {0}")]
    InitializeError(String),
    #[error("Could not connect to the store. {0}")]
    StoreConnectError(String),
    #[error("Invalid server configuration. {0}")]
    ConfigurationError(String),
    #[error("An I/O error happened in the server. {0}")]
    IOError(#[from] std::io::Error),
}

impl ServerError {
    /// Logs `cause` under a fresh correlation id. Only the id is returned to the client.
    pub fn internal<S: std::fmt::Display>(cause: S) -> Self {
        let correlation_id = Uuid::new_v4();
        error!("💻️ Internal error [{correlation_id}]: {cause}");
        Self::Internal { correlation_id }
    }

    pub fn invalid_request<S: Into<String>>(message: S) -> Self {
        Self::InvalidRequest { message: message.into(), details: None }
    }

    /// The stable error kind sent in the `error` field of the response body.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Unauthenticated(_) => "unauthenticated",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Conflict(_) => "conflict",
            Self::RateLimited(_) => "rate_limited",
            Self::StoreUnavailable(_) => "store_unavailable",
            _ => "internal",
        }
    }
}

impl ResponseError for ServerError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidTransition { .. } => StatusCode::CONFLICT,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::InitializeError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::StoreConnectError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ConfigurationError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::IOError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut body = json!({
            "success": false,
            "error": self.kind(),
            "message": self.to_string(),
        });
        match self {
            Self::InvalidRequest { details: Some(details), .. } => body["details"] = json!(details),
            Self::InvalidTransition { observed, .. } => body["observed_state"] = json!(observed),
            Self::Internal { correlation_id } => body["correlation_id"] = json!(correlation_id),
            _ => {},
        }
        HttpResponse::build(self.status_code()).insert_header(ContentType::json()).body(body.to_string())
    }
}

impl From<ValidationErrors> for ServerError {
    fn from(e: ValidationErrors) -> Self {
        Self::InvalidRequest { message: e.to_string(), details: Some(e.fields().clone()) }
    }
}

impl From<OrderFlowError> for ServerError {
    fn from(e: OrderFlowError) -> Self {
        match e {
            OrderFlowError::ValidationError(v) => v.into(),
            OrderFlowError::OrderNotFound(_) | OrderFlowError::TipNotFound(_) | OrderFlowError::PolicyNotFound(_) => {
                Self::NotFound(e.to_string())
            },
            OrderFlowError::Forbidden(s) => Self::Forbidden(s),
            OrderFlowError::InvalidTransition { observed, .. } => {
                Self::InvalidTransition { message: e.to_string(), observed }
            },
            OrderFlowError::AlreadySettled(_) | OrderFlowError::Conflict(_) => Self::Conflict(e.to_string()),
            OrderFlowError::StoreUnavailable(s) => Self::StoreUnavailable(s),
            OrderFlowError::NoActivePolicy | OrderFlowError::DatabaseError(_) => Self::internal(e),
        }
    }
}

impl From<WebhookError> for ServerError {
    fn from(e: WebhookError) -> Self {
        match e {
            WebhookError::ValidationError(v) => v.into(),
            WebhookError::EndpointNotFound(_) | WebhookError::DeliveryNotFound(_) => Self::NotFound(e.to_string()),
            WebhookError::Forbidden(s) => Self::Forbidden(s),
            WebhookError::DeliveryNotRetryable { .. } => Self::Conflict(e.to_string()),
            WebhookError::StoreUnavailable(s) => Self::StoreUnavailable(s),
            WebhookError::SecretError(_) | WebhookError::TransportError(_) | WebhookError::DatabaseError(_) => {
                Self::internal(e)
            },
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("No bearer token was supplied.")]
    MissingToken,
    #[error("The access token is not valid. {0}")]
    ValidationError(String),
    #[error("The access token is not in the correct format. {0}")]
    PoorlyFormattedToken(String),
    #[error("Insufficient permissions. {0}")]
    InsufficientPermissions(String),
    #[error("Could not issue an access token. {0}")]
    CouldNotIssueToken(String),
}

impl From<AuthError> for ServerError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::InsufficientPermissions(s) => Self::Forbidden(s),
            AuthError::CouldNotIssueToken(_) => Self::internal(e),
            _ => Self::Unauthenticated(e.to_string()),
        }
    }
}
