use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Everything that can go wrong between a client request and the upstream reply.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("no X-Vqd-Hash-1 challenge in status response")]
    NoChallenge,

    #[error("challenge is not valid base64: {0}")]
    BadChallenge(String),

    #[error("JS oracle failed: {0}")]
    OracleFailure(String),

    #[error("JS execution returned an empty result")]
    EmptyResult,

    #[error("JS execution reported an error: {message} (stack: {stack})")]
    JsReportedError { message: String, stack: String },

    #[error("upstream rejected the request with {status}")]
    UpstreamNon200 { status: StatusCode, body: String },

    #[error("upstream reported action {0:?}")]
    UpstreamAction(String),

    #[error("translation failed: {0}")]
    Translation(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

/// OpenAI style error body.
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub message: serde_json::Value,
    #[serde(rename = "type")]
    pub kind: String,
    pub param: Option<String>,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorEnvelope {
    pub fn new(
        message: impl Into<String>,
        kind: impl Into<String>,
        code: impl Into<String>,
    ) -> Self {
        Self {
            error: ErrorDetail {
                message: serde_json::Value::String(message.into()),
                kind: kind.into(),
                param: None,
                code: code.into(),
                details: None,
            },
        }
    }

    /// Envelope for a non-200 chat reply. A JSON body contributes its
    /// `detail` field as the message; anything else is wrapped verbatim.
    pub fn from_upstream(status: StatusCode, body: &str) -> Self {
        match serde_json::from_str::<serde_json::Value>(body) {
            Ok(json) => {
                let message = match json.get("detail") {
                    Some(detail) => detail.clone(),
                    None => serde_json::Value::String(json.to_string()),
                };
                Self {
                    error: ErrorDetail {
                        message,
                        kind: status.to_string(),
                        param: None,
                        code: "error".to_string(),
                        details: None,
                    },
                }
            }
            Err(_) => {
                let mut envelope = Self::new("Unknown error", "internal_server_error", "500");
                envelope.error.details = Some(body.to_string());
                envelope
            }
        }
    }
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::UpstreamNon200 { status, .. } => *status,
            ProxyError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        match self {
            ProxyError::UpstreamNon200 { status, body } => {
                ErrorEnvelope::from_upstream(*status, body)
            }
            ProxyError::Unauthorized(msg) => {
                ErrorEnvelope::new(msg.clone(), "invalid_request_error", "invalid_api_key")
            }
            ProxyError::BadRequest(msg) => {
                ErrorEnvelope::new(msg.clone(), "invalid_request_error", "400")
            }
            other => ErrorEnvelope::new(other.to_string(), "internal_server_error", "500"),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        } else {
            tracing::warn!("Request rejected: {}", self);
        }
        (status, Json(self.envelope())).into_response()
    }
}

pub type Result<T, E = ProxyError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_json_detail_becomes_message() {
        let envelope = ErrorEnvelope::from_upstream(
            StatusCode::TOO_MANY_REQUESTS,
            r#"{"detail":"rate limited"}"#,
        );
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["error"]["message"], "rate limited");
        assert_eq!(json["error"]["type"], "429 Too Many Requests");
        assert_eq!(json["error"]["code"], "error");
        assert!(json["error"]["param"].is_null());
    }

    #[test]
    fn upstream_raw_body_is_wrapped() {
        let envelope =
            ErrorEnvelope::from_upstream(StatusCode::BAD_GATEWAY, "<html>bad gateway</html>");
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["error"]["message"], "Unknown error");
        assert_eq!(json["error"]["type"], "internal_server_error");
        assert_eq!(json["error"]["code"], "500");
        assert_eq!(json["error"]["details"], "<html>bad gateway</html>");
    }

    #[test]
    fn status_mirrors_upstream() {
        let err = ProxyError::UpstreamNon200 {
            status: StatusCode::IM_A_TEAPOT,
            body: String::new(),
        };
        assert_eq!(err.status(), StatusCode::IM_A_TEAPOT);
        assert_eq!(ProxyError::NoChallenge.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn js_error_message_carries_detail() {
        let err = ProxyError::JsReportedError {
            message: "boom".to_string(),
            stack: "at x".to_string(),
        };
        let json = serde_json::to_value(err.envelope()).unwrap();
        assert!(json["error"]["message"].as_str().unwrap().contains("boom"));
    }
}
