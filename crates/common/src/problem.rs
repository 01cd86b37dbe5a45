//! RFC 7807 problem-details responses.
//!
//! Every client-visible error from the service is reported in this
//! shape, with `type` fixed at `about:blank` and `instance` set to the
//! request path that produced the error.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Problem-details body.
#[derive(Debug, Clone, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub detail: String,
    pub instance: String,
    pub status: u16,
    /// Value for the `Allow` header on 405 responses. Not part of the
    /// JSON body.
    #[serde(skip)]
    pub allow: Option<String>,
}

impl ProblemDetails {
    pub fn new(title: &str, detail: impl Into<String>, instance: &str, status: StatusCode) -> Self {
        Self {
            type_: "about:blank".to_string(),
            title: title.to_string(),
            detail: detail.into(),
            instance: instance.to_string(),
            status: status.as_u16(),
            allow: None,
        }
    }

    /// 400 with the standard "Invalid Request" title.
    pub fn bad_request(detail: impl Into<String>, instance: &str) -> Self {
        Self::new("Invalid Request", detail, instance, StatusCode::BAD_REQUEST)
    }

    /// 500 with the standard "Internal Server Error" title.
    pub fn internal(detail: impl Into<String>, instance: &str) -> Self {
        Self::new(
            "Internal Server Error",
            detail,
            instance,
            StatusCode::INTERNAL_SERVER_ERROR,
        )
    }

    /// 405 carrying the mandatory `Allow` header.
    pub fn method_not_allowed(allowed: &str, instance: &str) -> Self {
        let mut pd = Self::new(
            "Invalid Request",
            format!("Only {} operations supported", allowed),
            instance,
            StatusCode::METHOD_NOT_ALLOWED,
        );
        pd.allow = Some(allowed.to_string());
        pd
    }
}

impl IntoResponse for ProblemDetails {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let allow = self.allow.clone();
        let body = serde_json::to_string(&self).unwrap_or_else(|_| {
            r#"{"type":"about:blank","title":"Internal Server Error","status":500}"#.to_string()
        });
        let mut rsp = (status, body).into_response();
        rsp.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        if let Some(allow) = allow {
            if let Ok(v) = HeaderValue::from_str(&allow) {
                rsp.headers_mut().insert(header::ALLOW, v);
            }
        }
        rsp
    }
}
