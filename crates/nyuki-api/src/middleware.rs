//! Request pipeline shared by every capability route.
//!
//! Path parameters are checked against the endpoint template, a non-empty
//! body must be JSON, and handler errors or panics are reported and turned
//! into 500s. `CapabilityError::NotFound` is the one failure that is neither
//! reported nor a 500.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::Json;
use axum::body::to_bytes;
use axum::extract::Request as HttpRequest;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response as HttpResponse};
use futures_util::FutureExt;
use nyuki_protocol::Method;
use serde_json::{Value, json};
use tracing::debug;

use crate::capability::{Handler, Request, Response};
use crate::error::CapabilityError;
use crate::reporting::{Exception, ExceptionReporter};
use crate::template::EndpointTemplate;

pub(crate) const BODY_LIMIT: usize = 2 * 1024 * 1024;

/// One (capability, mount, method) triple.
pub(crate) struct Route {
    pub capability: Arc<str>,
    pub template: EndpointTemplate,
    pub handler: Handler,
    pub reporter: ExceptionReporter,
}

pub(crate) async fn serve_request(route: Arc<Route>, request: HttpRequest) -> HttpResponse {
    let (parts, body) = request.into_parts();
    let Ok(method) = parts.method.as_str().parse::<Method>() else {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    };
    let path = parts.uri.path().to_owned();

    let Some(params) = route.template.capture(&path) else {
        debug!(capability = %route.capability, %path, "path parameters do not match");
        return not_found();
    };

    let bytes = match to_bytes(body, BODY_LIMIT).await {
        Ok(bytes) => bytes,
        Err(error) => return error_response(StatusCode::BAD_REQUEST, format!("{error}")),
    };
    let body = if bytes.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(body) => Some(body),
            Err(error) => {
                return error_response(StatusCode::BAD_REQUEST, format!("invalid JSON body: {error}"));
            }
        }
    };

    let headers = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_owned(), value.to_owned()))
        })
        .collect();

    let request = Request {
        method,
        path: path.clone(),
        params,
        headers,
        body,
    };
    let handler = Arc::clone(&route.handler);
    let outcome = AssertUnwindSafe(async move { handler(request).await })
        .catch_unwind()
        .await;

    let message = match outcome {
        Ok(Ok(Some(response))) => return into_http(response),
        Ok(Ok(None)) => return StatusCode::OK.into_response(),
        Ok(Err(CapabilityError::NotFound)) => return not_found(),
        Ok(Err(CapabilityError::Failed(error))) => format!("{error:#}"),
        Err(panic) => panic_message(panic.as_ref()),
    };

    route.reporter.report(&Exception {
        capability: route.capability.to_string(),
        method,
        path,
        message,
    });
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
}

pub(crate) fn into_http(response: Response) -> HttpResponse {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    match response.body {
        Some(body) => (status, Json(body)).into_response(),
        None => status.into_response(),
    }
}

pub(crate) fn not_found() -> HttpResponse {
    error_response(StatusCode::NOT_FOUND, "not found")
}

fn error_response(status: StatusCode, message: impl Into<String>) -> HttpResponse {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_owned()
    }
}
