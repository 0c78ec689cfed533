//! Reset confirmation and CSRF issuance endpoints.

use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use tracing::error;

use super::flow::ConfirmOutcome;
use super::state::SharedResetState;
use super::types::{ConfirmResetRequest, CsrfTokenResponse};
use super::utils::{extract_client_ip, extract_user_agent};

/// CSRF/token/expiry/consumed failures all surface as this one message.
const GENERIC_INVALID: &str = "Invalid or expired token";

/// Session binding for CSRF tokens rides on this optional header.
const SESSION_HEADER: &str = "x-session-id";

/// Issue a CSRF token for the confirm form, bound to the presented session
/// when one is supplied.
#[utoipa::path(
    get,
    path = "/v1/reset/csrf",
    params(
        ("X-Session-Id" = Option<String>, Header, description = "Session to bind the token to")
    ),
    responses(
        (status = 200, description = "Fresh CSRF token", body = CsrfTokenResponse),
        (status = 500, description = "Token issuance failed", body = String)
    ),
    tag = "reset"
)]
pub async fn issue_csrf(
    headers: HeaderMap,
    state: Extension<SharedResetState>,
) -> impl IntoResponse {
    let session_id = headers
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty());

    match state.flow().issue_csrf(session_id).await {
        Ok(csrf_token) => Json(CsrfTokenResponse {
            csrf_token,
            expires_in_seconds: state.config().csrf_ttl().as_secs(),
        })
        .into_response(),
        Err(err) => {
            error!("csrf issuance failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Token issuance failed".to_string(),
            )
                .into_response()
        }
    }
}

/// Finish a password reset with a token from the email link.
#[utoipa::path(
    post,
    path = "/v1/reset/confirm",
    request_body = ConfirmResetRequest,
    responses(
        (status = 204, description = "Password updated"),
        (status = 400, description = "Invalid or expired token", body = String),
        (status = 422, description = "New password rejected by policy", body = String)
    ),
    tag = "reset"
)]
pub async fn confirm_reset(
    headers: HeaderMap,
    state: Extension<SharedResetState>,
    payload: Option<Json<ConfirmResetRequest>>,
) -> impl IntoResponse {
    let request: ConfirmResetRequest = match payload {
        Some(Json(payload)) => payload,
        None => return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response(),
    };

    let ip = extract_client_ip(&headers);
    let user_agent = extract_user_agent(&headers);

    let outcome = state
        .flow()
        .confirm_reset(
            &request.token,
            &request.new_password,
            &request.csrf_token,
            request.session_id.as_deref(),
            ip.as_deref(),
            user_agent.as_deref(),
        )
        .await;

    match outcome {
        Ok(ConfirmOutcome::Completed) => StatusCode::NO_CONTENT.into_response(),
        Ok(ConfirmOutcome::TokenInvalid) => {
            (StatusCode::BAD_REQUEST, GENERIC_INVALID.to_string()).into_response()
        }
        Ok(ConfirmOutcome::PasswordRejected(reason)) => {
            (StatusCode::UNPROCESSABLE_ENTITY, reason).into_response()
        }
        Err(err) => {
            error!("reset confirmation failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Password reset failed".to_string(),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::state::ResetConfig;
    use super::super::tests::harness;
    use super::{confirm_reset, issue_csrf};
    use crate::api::handlers::reset::types::ConfirmResetRequest;
    use axum::Json;
    use axum::extract::Extension;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use secrecy::SecretString;

    #[tokio::test]
    async fn missing_payload_is_rejected() {
        let harness = harness(ResetConfig::new("https://restarigi.dev".to_string()));
        let response = confirm_reset(HeaderMap::new(), Extension(harness.state), None)
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_token_is_a_generic_400() {
        let harness = harness(ResetConfig::new("https://restarigi.dev".to_string()));
        let csrf_token = harness
            .state
            .flow()
            .issue_csrf(None)
            .await
            .expect("csrf issuance");

        let response = confirm_reset(
            HeaderMap::new(),
            Extension(harness.state),
            Some(Json(ConfirmResetRequest {
                token: "not-a-token".to_string(),
                new_password: SecretString::from("correct horse battery"),
                csrf_token,
                session_id: None,
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn issue_csrf_returns_token_and_ttl() {
        let harness = harness(ResetConfig::new("https://restarigi.dev".to_string()));
        let response = issue_csrf(HeaderMap::new(), Extension(harness.state))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
