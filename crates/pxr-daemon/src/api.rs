//! Response envelope, request ids, and the error-to-response mapping.
//!
//! Public JSON always travels as
//! `{ok, code, data?|item?|items?, next_cursor?, request_id}` with the
//! request id mirrored in `X-Request-Id`.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use pxr_types::{ApiError, ErrorCode};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Per-request id: taken from the inbound header when present, generated
/// otherwise.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Middleware: attach a [`RequestId`] extension and mirror it on the
/// response.
pub async fn request_id_middleware(
    mut request: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    let rid = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty() && value.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(pxr_types::new_request_id);

    request.extensions_mut().insert(RequestId(rid.clone()));
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&rid) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

fn envelope(rid: &RequestId, key: &str, value: Value) -> Value {
    json!({
        "ok": true,
        "code": "OK",
        key: value,
        "request_id": rid.0,
    })
}

pub fn ok_data(rid: &RequestId, data: Value) -> Response {
    (StatusCode::OK, Json(envelope(rid, "data", data))).into_response()
}

pub fn ok_item(rid: &RequestId, item: Value) -> Response {
    (StatusCode::OK, Json(envelope(rid, "item", item))).into_response()
}

pub fn ok_items(rid: &RequestId, items: Value, next_cursor: Option<String>) -> Response {
    let mut body = envelope(rid, "items", items);
    body["next_cursor"] = json!(next_cursor.unwrap_or_default());
    (StatusCode::OK, Json(body)).into_response()
}

/// Handler-level error carrying the request id for the envelope.
#[derive(Debug)]
pub struct AppError {
    pub inner: ApiError,
    pub request_id: Option<String>,
}

impl AppError {
    pub fn with_rid(inner: ApiError, rid: &RequestId) -> Self {
        Self {
            inner,
            request_id: Some(rid.0.clone()),
        }
    }
}

impl From<ApiError> for AppError {
    fn from(inner: ApiError) -> Self {
        Self {
            inner,
            request_id: None,
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!("internal_error err={err:#}");
        Self {
            inner: ApiError::new(ErrorCode::InternalError, "Internal error", 500),
            request_id: None,
        }
    }
}

impl From<pxr_proxy::ProxySelectError> for AppError {
    fn from(err: pxr_proxy::ProxySelectError) -> Self {
        match err {
            pxr_proxy::ProxySelectError::Api(api) => api.into(),
            pxr_proxy::ProxySelectError::Db(db) => db.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let rid = self
            .request_id
            .unwrap_or_else(pxr_types::new_request_id);
        let status =
            StatusCode::from_u16(self.inner.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut body = json!({
            "ok": false,
            "code": self.inner.code.as_str(),
            "message": self.inner.message,
            "request_id": rid,
        });
        if let Some(details) = self.inner.details {
            body["details"] = details;
        }
        let mut response = (status, Json(body)).into_response();
        if let Ok(value) = HeaderValue::from_str(&rid) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
        response
    }
}

pub type ApiResult<T> = Result<T, AppError>;
