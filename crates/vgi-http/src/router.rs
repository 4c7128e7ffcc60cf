//! Axum wiring: routes, content-type and size policy, the zstd filter,
//! and CORS.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{options, post};
use axum::Router;
use http::{header, HeaderMap, HeaderValue, StatusCode};

use vgi_types::keys;

use crate::service::{HttpService, Reply};

const ZSTD_ENCODING: &str = "zstd";

pub(crate) fn build_router(service: Arc<HttpService>) -> Router {
    let body_limit = service.config.max_request_bytes.saturating_add(1024);
    Router::new()
        .route(
            &format!("/{}", keys::CAPABILITIES_SEGMENT),
            options(capabilities),
        )
        .route("/{method}", post(unary).options(preflight))
        .route("/{method}/init", post(stream_init).options(preflight))
        .route("/{method}/exchange", post(stream_exchange).options(preflight))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(service)
}

/// Decode the request body: enforce the content type and size policy and
/// strip the optional zstd layer. Errors are complete responses.
fn prepare_body(
    service: &HttpService,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<Vec<u8>, Response> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if content_type != keys::ARROW_STREAM_CONTENT_TYPE {
        return Err(plain_response(
            service,
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            format!(
                "unsupported content type {content_type:?}; expected {}",
                keys::ARROW_STREAM_CONTENT_TYPE
            ),
        ));
    }
    if body.len() > service.config.max_request_bytes {
        return Err(plain_response(
            service,
            StatusCode::PAYLOAD_TOO_LARGE,
            format!(
                "request of {} bytes exceeds the {} byte limit",
                body.len(),
                service.config.max_request_bytes
            ),
        ));
    }

    let compressed = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case(ZSTD_ENCODING));
    if !compressed {
        return Ok(body.to_vec());
    }
    match zstd::stream::decode_all(body.as_ref()) {
        Ok(raw) if raw.len() > service.config.max_request_bytes => Err(plain_response(
            service,
            StatusCode::PAYLOAD_TOO_LARGE,
            "decompressed request exceeds the request byte limit".to_owned(),
        )),
        Ok(raw) => Ok(raw),
        Err(e) => Err(plain_response(
            service,
            StatusCode::BAD_REQUEST,
            format!("invalid zstd request body: {e}"),
        )),
    }
}

/// A non-stream response (policy failures before a batch exists).
fn plain_response(service: &HttpService, status: StatusCode, message: String) -> Response {
    let mut response = (status, message).into_response();
    apply_cors(service, response.headers_mut());
    response
}

fn apply_cors(service: &HttpService, headers: &mut HeaderMap) {
    if let Some(origin) = &service.config.cors_origin {
        if let Ok(origin) = HeaderValue::from_str(origin) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        }
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("POST, OPTIONS"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Content-Type, Content-Encoding"),
        );
        headers.insert(
            header::ACCESS_CONTROL_EXPOSE_HEADERS,
            HeaderValue::from_static("Content-Encoding"),
        );
    }
}

/// Finish a protocol reply: compression filter, content type, CORS.
fn finish(service: &HttpService, reply: Reply) -> Response {
    let Reply { status, mut body } = reply;
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(keys::ARROW_STREAM_CONTENT_TYPE),
    );
    if let Some(level) = service.config.compression_level {
        match zstd::stream::encode_all(body.as_slice(), level) {
            Ok(compressed) => {
                body = compressed;
                headers.insert(
                    header::CONTENT_ENCODING,
                    HeaderValue::from_static(ZSTD_ENCODING),
                );
                headers.insert(
                    header::ACCEPT_ENCODING,
                    HeaderValue::from_static(ZSTD_ENCODING),
                );
            }
            Err(e) => {
                tracing::warn!(error = %e, "response compression failed, sending identity");
            }
        }
    }
    apply_cors(service, &mut headers);
    (status, headers, body).into_response()
}

async fn unary(
    State(service): State<Arc<HttpService>>,
    Path(method): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match prepare_body(&service, &headers, &body) {
        Err(response) => response,
        Ok(raw) => {
            let reply = service.handle_unary(&method, &raw).await;
            finish(&service, reply)
        }
    }
}

async fn stream_init(
    State(service): State<Arc<HttpService>>,
    Path(method): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match prepare_body(&service, &headers, &body) {
        Err(response) => response,
        Ok(raw) => {
            let reply = service.handle_init(&method, &raw).await;
            finish(&service, reply)
        }
    }
}

async fn stream_exchange(
    State(service): State<Arc<HttpService>>,
    Path(method): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match prepare_body(&service, &headers, &body) {
        Err(response) => response,
        Ok(raw) => {
            let reply = service.handle_exchange(&method, &raw).await;
            finish(&service, reply)
        }
    }
}

/// CORS preflight for the method routes.
async fn preflight(State(service): State<Arc<HttpService>>) -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    apply_cors(&service, response.headers_mut());
    response
}

/// `OPTIONS /__capabilities__` — advertises the request size limit.
async fn capabilities(State(service): State<Arc<HttpService>>) -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    if let Ok(value) = HeaderValue::from_str(&service.config.max_request_bytes.to_string()) {
        response
            .headers_mut()
            .insert(keys::MAX_REQUEST_BYTES_HEADER, value);
    }
    apply_cors(&service, response.headers_mut());
    response
}
