//! Optional bearer-token authentication.

use crate::{error::HttpError, AppState};
use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use scriptsync_core::AppError;

fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Compare without short-circuiting on the first differing byte.
fn tokens_match(expected: &str, provided: &str) -> bool {
    let (expected, provided) = (expected.as_bytes(), provided.as_bytes());
    if expected.len() != provided.len() {
        return false;
    }
    expected
        .iter()
        .zip(provided)
        .fold(0u8, |diff, (a, b)| diff | (a ^ b))
        == 0
}

/// Middleware rejecting requests without the configured `API_TOKEN`.
///
/// A server started without a token accepts every request.
pub async fn require_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, HttpError> {
    if let Some(expected) = state.config.api_token.as_deref() {
        let authorized = bearer_token(&request)
            .map(|provided| tokens_match(expected, provided))
            .unwrap_or(false);
        if !authorized {
            tracing::debug!("rejecting {} {}: bad or missing token", request.method(), request.uri());
            return Err(AppError::Unauthorized.into());
        }
    }
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::tokens_match;

    #[test]
    fn tokens_must_match_exactly() {
        assert!(tokens_match("s3cret", "s3cret"));
        assert!(!tokens_match("s3cret", "s3cre"));
        assert!(!tokens_match("s3cret", "S3cret"));
        assert!(!tokens_match("s3cret", ""));
    }
}
