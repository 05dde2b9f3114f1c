use std::fmt::Display;

use chrono::NaiveDate;
use homechef_engine::db_types::Role;
use serde::{Deserialize, Serialize};

/// The envelope every successful REST response is wrapped in. Errors use the shape produced by
/// [`ServerError`](crate::errors::ServerError) instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonResponse<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> JsonResponse<T> {
    pub fn data(data: T) -> Self {
        Self { success: true, message: None, data: Some(data) }
    }

    pub fn with_message<S: Display>(data: T, message: S) -> Self {
        Self { success: true, message: Some(message.to_string()), data: Some(data) }
    }
}

impl JsonResponse<()> {
    pub fn success<S: Display>(message: S) -> Self {
        Self { success: true, message: Some(message.to_string()), data: None }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AnalyticsQuery {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

/// Query string of the WebSocket upgrade: `/ws?user_id=&role=`, optionally with `&token=`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}
