//! OAuth 2.0 token endpoint handler.
//!
//! ```text
//! POST /token
//! Content-Type: application/x-www-form-urlencoded
//! DPoP: eyJ0eXAiOiJkcG9wK2p3dCIs...
//!
//! grant_type=authorization_code
//! &code=3_Qk8...
//! &redirect_uri=https://app.example.com/callback
//! &code_verifier=dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk
//! &client_id=my-app
//! ```
//!
//! Every response carries `Cache-Control: no-store` and `Pragma: no-cache`.

use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};

use crate::error::AuthError;
use crate::grant::{GrantOrchestrator, TokenEndpointRequest};
use crate::oauth::{TokenError, TokenRequest, TokenResponse};

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// State required by the token endpoint.
#[derive(Clone)]
pub struct TokenState {
    orchestrator: Arc<GrantOrchestrator>,
}

impl TokenState {
    /// Creates the state around an orchestrator.
    pub fn new(orchestrator: Arc<GrantOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

/// `POST /token`.
pub async fn token_handler(
    State(state): State<TokenState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let basic_auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.len() > 6 && v[..6].eq_ignore_ascii_case("basic "));

    match process(&state, &headers, &body).await {
        Ok(response) => token_success_response(response),
        Err(e) => {
            if e.is_server_error() {
                tracing::error!(error = %e, "Token request failed");
            } else {
                tracing::debug!(error = %e, code = e.oauth_error_code(), "Token request rejected");
            }
            token_error_response(&e, basic_auth)
        }
    }
}

async fn process(
    state: &TokenState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<TokenResponse, AuthError> {
    // ContentTypeCheck
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let media_type = content_type.split(';').next().unwrap_or_default().trim();
    if !media_type.eq_ignore_ascii_case(FORM_CONTENT_TYPE) {
        return Err(AuthError::invalid_request(format!(
            "Content-Type must be {FORM_CONTENT_TYPE}"
        )));
    }

    let mut proofs = headers.get_all("dpop").iter();
    let dpop = match (proofs.next(), proofs.next()) {
        (None, _) => None,
        (Some(value), None) => Some(
            value
                .to_str()
                .map_err(|_| AuthError::invalid_dpop_proof("DPoP header is not ASCII"))?
                .to_string(),
        ),
        (Some(_), Some(_)) => {
            return Err(AuthError::invalid_dpop_proof("More than one DPoP header"));
        }
    };

    let authorization = headers
        .get(header::AUTHORIZATION)
        .map(|v| {
            v.to_str()
                .map(str::to_string)
                .map_err(|_| AuthError::invalid_request("Authorization header is not ASCII"))
        })
        .transpose()?;

    let request = TokenEndpointRequest {
        body: TokenRequest::from_form(body)?,
        authorization,
        dpop,
        method: "POST".to_string(),
    };
    state.orchestrator.handle(request).await
}

fn no_store_headers() -> [(header::HeaderName, HeaderValue); 2] {
    [
        (header::CACHE_CONTROL, HeaderValue::from_static("no-store")),
        (header::PRAGMA, HeaderValue::from_static("no-cache")),
    ]
}

fn token_success_response(response: TokenResponse) -> Response {
    (StatusCode::OK, no_store_headers(), Json(response)).into_response()
}

/// Builds an RFC 6749 §5.2 error response.
///
/// `invalid_client` becomes 401 with a `Basic` challenge when the client
/// tried the `Authorization` header.
fn token_error_response(error: &AuthError, basic_auth: bool) -> Response {
    let body = TokenError::from(error);
    let status = StatusCode::from_u16(body.error.http_status())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    if matches!(error, AuthError::InvalidClient { .. }) && basic_auth {
        return (
            StatusCode::UNAUTHORIZED,
            no_store_headers(),
            [(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Basic realm=\"token\""),
            )],
            Json(body),
        )
            .into_response();
    }
    (status, no_store_headers(), Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_errors_hide_detail() {
        let response = token_error_response(&AuthError::storage("shard 3 timed out"), false);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");
    }

    #[test]
    fn test_invalid_client_with_basic_is_401() {
        let err = AuthError::invalid_client("bad secret");
        let response = token_error_response(&err, true);
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));
        assert_eq!(response.headers()[header::PRAGMA], "no-cache");

        let response = token_error_response(&err, false);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_grant_errors_are_400() {
        let response = token_error_response(&AuthError::key_revoked("k1"), false);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
