// Stable client-facing error envelope: {"error", "type", "message"}.
// Raw upstream error bodies never pass through; the message is always
// something this process composed.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    Unauthorized,
    NotFound,
    NoUsableCredential,
    UpstreamTransport,
    UpstreamParse,
    ParseTimeout,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad-request",
            Self::Unauthorized => "unauthorized",
            Self::NotFound => "not-found",
            Self::NoUsableCredential => "no-usable-credential",
            Self::UpstreamTransport => "upstream-transport",
            Self::UpstreamParse => "upstream-parse",
            Self::ParseTimeout => "parse-timeout",
            Self::Internal => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::NoUsableCredential => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamTransport => StatusCode::BAD_GATEWAY,
            Self::UpstreamParse => StatusCode::BAD_GATEWAY,
            Self::ParseTimeout => StatusCode::REQUEST_TIMEOUT,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn headline(&self) -> &'static str {
        match self {
            Self::BadRequest => "invalid request",
            Self::Unauthorized => "authentication required",
            Self::NotFound => "not found",
            Self::NoUsableCredential => "no usable upstream credential",
            Self::UpstreamTransport => "upstream request failed",
            Self::UpstreamParse => "upstream response could not be parsed",
            Self::ParseTimeout => "upstream response parse timed out",
            Self::Internal => "internal error",
        }
    }
}

/// Build the error response for a handler exit.
pub fn error_response(kind: ErrorKind, message: impl AsRef<str>) -> Response {
    let body = json!({
        "error": kind.headline(),
        "type": kind.as_str(),
        "message": message.as_ref(),
    });
    (kind.status(), Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings_and_statuses() {
        assert_eq!(ErrorKind::NoUsableCredential.as_str(), "no-usable-credential");
        assert_eq!(
            ErrorKind::NoUsableCredential.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ErrorKind::ParseTimeout.status(), StatusCode::REQUEST_TIMEOUT);
        assert_eq!(ErrorKind::UpstreamTransport.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(ErrorKind::Unauthorized.status(), StatusCode::UNAUTHORIZED);
    }

    use proptest::prelude::*;

    proptest! {
        /// Every envelope carries the three stable fields with the kind's tag.
        #[test]
        fn prop_error_envelope_shape(msg in "[a-zA-Z0-9 .,]{0,120}") {
            let resp = error_response(ErrorKind::BadRequest, &msg);
            let (parts, body) = resp.into_parts();
            prop_assert_eq!(parts.status, StatusCode::BAD_REQUEST);

            let bytes = tokio::runtime::Runtime::new()
                .unwrap()
                .block_on(axum::body::to_bytes(body, 1_000_000))
                .unwrap();
            let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            prop_assert_eq!(parsed["type"].as_str().unwrap(), "bad-request");
            prop_assert_eq!(parsed["message"].as_str().unwrap(), msg.as_str());
            prop_assert!(parsed["error"].is_string());
        }
    }
}
