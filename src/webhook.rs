//! Validating admission webhook for native exec requests.
//!
//! The gateway stamps every impersonated upstream call with a shared secret
//! in the `secret-sauce` impersonation extra. This webhook approves exec
//! requests that carry that secret (or come from an allowlisted user) and
//! denies everything else, closing the door on callers that talk to the
//! exec API directly.

use std::collections::HashMap;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::server::AppState;

pub const DENIAL_MESSAGE: &str = "cannot use exec directly, use rexec plugin instead";
pub const SECRET_SAUCE_EXTRA: &str = "secret-sauce";
const POD_EXEC_KIND: &str = "PodExecOptions";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReview {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<AdmissionRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<AdmissionResponse>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub kind: GroupVersionKind,
    #[serde(default)]
    pub user_info: UserInfo,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupVersionKind {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub kind: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub extra: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResponse {
    pub uid: String,
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub message: String,
}

/// `POST /validate-exec`
pub async fn validate_exec(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());
    if content_type != Some("application/json") {
        return (StatusCode::UNSUPPORTED_MEDIA_TYPE, "invalid content type").into_response();
    }

    let mut review: AdmissionReview = match serde_json::from_slice(&body) {
        Ok(review) => review,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                format!("failed to decode admission review: {err}"),
            )
                .into_response();
        }
    };

    let request = review.request.clone().unwrap_or_default();
    let mut response = AdmissionResponse {
        uid: request.uid.clone(),
        allowed: true,
        status: None,
    };

    // only exec operations are gated; everything else passes untouched
    if request.kind.kind == POD_EXEC_KIND && !can_pass(&state, &request.user_info) {
        response.allowed = false;
        response.status = Some(Status {
            message: DENIAL_MESSAGE.to_string(),
        });
    }
    review.response = Some(response);

    match serde_json::to_vec(&review) {
        Ok(encoded) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            encoded,
        )
            .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode admission response: {err}"),
        )
            .into_response(),
    }
}

/// Allowlisted users pass; otherwise the secret-sauce extra must carry the
/// gateway's shared secret, proving the request came through the gateway.
fn can_pass(state: &AppState, user: &UserInfo) -> bool {
    if state
        .config
        .bypass_users
        .iter()
        .any(|allowed| allowed == &user.username)
    {
        return true;
    }
    user.extra
        .get(SECRET_SAUCE_EXTRA)
        .map_or(false, |values| {
            values.iter().any(|value| value == &state.config.shared_secret)
        })
}
