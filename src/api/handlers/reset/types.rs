//! Request/response types for the reset endpoints.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct RequestResetRequest {
    pub email: String,
}

/// The one body every `/v1/reset/request` caller sees, regardless of what
/// happened internally.
#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct RequestResetResponse {
    pub message: String,
}

#[derive(ToSchema, Deserialize, Debug)]
pub struct ConfirmResetRequest {
    pub token: String,
    /// Redacted in Debug output and never serialized back out.
    #[schema(value_type = String)]
    pub new_password: SecretString,
    pub csrf_token: String,
    pub session_id: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct CsrfTokenResponse {
    pub csrf_token: String,
    pub expires_in_seconds: u64,
}
