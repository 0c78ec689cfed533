//! Reset request endpoint.

use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use tracing::error;

use super::state::SharedResetState;
use super::types::{RequestResetRequest, RequestResetResponse};
use super::utils::{extract_client_ip, extract_user_agent};

/// The uniform response body; identical for existing users, unknown emails,
/// and rate-limited callers.
fn accepted_body() -> Json<RequestResetResponse> {
    Json(RequestResetResponse {
        message: "If this address exists, an email has been sent".to_string(),
    })
}

/// Start a password reset. The response never distinguishes whether the
/// address exists or the limiter denied the attempt.
#[utoipa::path(
    post,
    path = "/v1/reset/request",
    request_body = RequestResetRequest,
    responses(
        (status = 202, description = "Accepted; an email is sent if the address exists", body = RequestResetResponse),
        (status = 400, description = "Missing payload", body = String)
    ),
    tag = "reset"
)]
pub async fn request_reset(
    headers: HeaderMap,
    state: Extension<SharedResetState>,
    payload: Option<Json<RequestResetRequest>>,
) -> impl IntoResponse {
    let request: RequestResetRequest = match payload {
        Some(Json(payload)) => payload,
        None => return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response(),
    };

    let ip = extract_client_ip(&headers);
    let user_agent = extract_user_agent(&headers);

    match state
        .flow()
        .request_reset(&request.email, ip.as_deref(), user_agent.as_deref())
        .await
    {
        Ok(_accepted) => (StatusCode::ACCEPTED, accepted_body()).into_response(),
        Err(err) => {
            // Keep the response opaque even when storage misbehaves; the
            // failure is in the logs, not in anything an enumerator can see.
            error!("reset request failed: {err}");
            (StatusCode::ACCEPTED, accepted_body()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::state::ResetConfig;
    use super::super::tests::harness;
    use super::request_reset;
    use crate::api::handlers::reset::types::RequestResetRequest;
    use axum::Json;
    use axum::extract::Extension;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;

    #[tokio::test]
    async fn missing_payload_is_rejected() {
        let harness = harness(ResetConfig::new("https://restarigi.dev".to_string()));
        let response = request_reset(HeaderMap::new(), Extension(harness.state), None)
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn known_and_unknown_emails_get_the_same_response() {
        let harness = harness(ResetConfig::new("https://restarigi.dev".to_string()));
        harness.users.insert_user("alice@example.com");

        let known = request_reset(
            HeaderMap::new(),
            Extension(harness.state.clone()),
            Some(Json(RequestResetRequest {
                email: "alice@example.com".to_string(),
            })),
        )
        .await
        .into_response();

        let unknown = request_reset(
            HeaderMap::new(),
            Extension(harness.state),
            Some(Json(RequestResetRequest {
                email: "nobody@example.com".to_string(),
            })),
        )
        .await
        .into_response();

        assert_eq!(known.status(), StatusCode::ACCEPTED);
        assert_eq!(unknown.status(), StatusCode::ACCEPTED);
        assert_eq!(harness.mailer.sent().len(), 1);
    }
}
