//! Ingress adapter: HTTP in, request envelope out.
//!
//! Every inbound request is admitted (auth, size, syntax), translated to
//! an immutable envelope, and published to the routing topic with a
//! deadline equal to the configured request timeout. The adapter then
//! waits on the per-request result channel and translates the response
//! envelope back to HTTP. Backpressure from the fabric surfaces as 503
//! with a retry hint; the request deadline surfaces as 504 and drops any
//! late result.

use crate::admission::{self, AuthMode};
use axum::body::Body;
use axum::extract::State;
use axum::response::Response;
use axum::Router;
use gati_core::config::GatiConfig;
use gati_core::envelope::{
    Headers, Method, Priority, RequestEnvelope, ResponseEnvelope, VersionPreference,
};
use gati_core::error::{AdmissionError, GatiError};
use gati_core::metrics::Metrics;
use gati_fabric::{PublishOptions, QueueFabric, QueuePayload};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Topic the ingress publishes request envelopes to.
pub const ROUTING_TOPIC: &str = "gati.routing";

pub const REQUEST_ID_HEADER: &str = "x-gati-request-id";
pub const TRACE_ID_HEADER: &str = "x-gati-trace-id";
pub const CLIENT_ID_HEADER: &str = "x-gati-client-id";
pub const VERSION_HEADER: &str = "x-gati-version";
pub const PRIORITY_HEADER: &str = "x-gati-priority";

pub struct IngressState {
    pub fabric: Arc<QueueFabric>,
    pub config: GatiConfig,
    pub auth: AuthMode,
    pub metrics: Metrics,
}

/// Build the ingress router. Every method and path funnels through the
/// same admission pipeline; routing happens behind the fabric.
pub fn router(state: Arc<IngressState>) -> Router {
    Router::new()
        .fallback(handle)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::catch_panic::CatchPanicLayer::new())
        .with_state(state)
}

async fn handle(State(state): State<Arc<IngressState>>, request: axum::extract::Request) -> Response {
    state.metrics.incr("ingress.requests");
    let (parts, body) = request.into_parts();

    // Method translation; anything outside the envelope's set is malformed.
    let method = match parts.method.as_str().parse::<Method>() {
        Ok(method) => method,
        Err(_) => {
            return error_response(
                &AdmissionError::Malformed(format!("unsupported method {}", parts.method)).into(),
                "",
            );
        }
    };

    if parts.headers.len() > state.config.ingress_header_max_count {
        return error_response(
            &AdmissionError::TooManyHeaders {
                limit: state.config.ingress_header_max_count,
            }
            .into(),
            "",
        );
    }
    let headers = convert_headers(&parts.headers);

    // Accept a well-formed caller id or mint one.
    let request_id = match headers.get(REQUEST_ID_HEADER) {
        Some(candidate) if admission::acceptable_request_id(candidate) => candidate.to_string(),
        _ => uuid::Uuid::new_v4().to_string(),
    };
    let trace_id = headers
        .get(TRACE_ID_HEADER)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let client_id = headers
        .get(CLIENT_ID_HEADER)
        .unwrap_or("anonymous")
        .to_string();

    // Authentication before any body work.
    let auth = match admission::authenticate(&state.auth, &headers).await {
        Ok(auth) => auth,
        Err(err) => {
            state.metrics.incr("ingress.rejected");
            return error_response(&err.into(), &request_id);
        }
    };

    // Bounded body read; over-limit is 413, bad JSON is 400.
    let limit = state.config.ingress_body_max_bytes;
    let bytes = match axum::body::to_bytes(body, limit).await {
        Ok(bytes) => bytes,
        Err(_) => {
            state.metrics.incr("ingress.rejected");
            return error_response(
                &AdmissionError::BodyTooLarge {
                    limit,
                    actual: limit + 1,
                }
                .into(),
                &request_id,
            );
        }
    };
    let body_value = if bytes.is_empty() {
        None
    } else {
        match serde_json::from_slice::<serde_json::Value>(&bytes) {
            Ok(value) => Some(value),
            Err(err) => {
                state.metrics.incr("ingress.rejected");
                return error_response(
                    &AdmissionError::Malformed(format!("request body is not JSON: {err}")).into(),
                    &request_id,
                );
            }
        }
    };

    // Version preference: `version` query key wins over the header.
    let version = query_value(parts.uri.query(), "version")
        .or_else(|| headers.get(VERSION_HEADER).map(str::to_string))
        .map(|raw| VersionPreference::parse(&raw))
        .unwrap_or(VersionPreference::Latest);
    let priority = headers
        .get(PRIORITY_HEADER)
        .and_then(Priority::parse)
        .unwrap_or_default();

    let envelope = RequestEnvelope::builder(method, parts.uri.path())
        .request_id(&request_id)
        .trace_id(&trace_id)
        .client_id(&client_id)
        .headers(headers)
        .version(version)
        .priority(priority)
        .auth(auth);
    let envelope = match body_value {
        Some(value) => envelope.body(value),
        None => envelope,
    };
    let envelope = Arc::new(envelope.build());

    // Result registration precedes the publish so a fast response cannot
    // slip past.
    let request_timeout = Duration::from_millis(state.config.request_timeout_ms);
    let receiver = state.fabric.register_result_handler(&request_id);
    let publish = state.fabric.publish(
        ROUTING_TOPIC,
        QueuePayload::Request(envelope.clone()),
        PublishOptions::default()
            .priority(priority)
            .deadline(Instant::now() + request_timeout)
            .message_id(&request_id),
    );
    if let Err(err) = publish {
        state.fabric.unregister_result_handler(&request_id);
        state.metrics.incr("ingress.publish_failed");
        return error_response(&err, &request_id);
    }

    match tokio::time::timeout(request_timeout, receiver).await {
        Ok(Ok(result)) => write_response(result, &request_id),
        Ok(Err(_closed)) => error_response(
            &GatiError::Internal("result channel closed".to_string()),
            &request_id,
        ),
        Err(_) => {
            // Past the deadline: drop the registration so a late result is
            // discarded, then answer 504.
            state.fabric.unregister_result_handler(&request_id);
            state.metrics.incr("ingress.timeout");
            error_response(
                &GatiError::RequestTimeout {
                    deadline_ms: state.config.request_timeout_ms,
                },
                &request_id,
            )
        }
    }
}

fn convert_headers(headers: &http::HeaderMap) -> Headers {
    let mut converted = Headers::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            converted.insert(name.as_str(), value);
        }
    }
    converted
}

fn query_value(query: Option<&str>, key: &str) -> Option<String> {
    query?.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then(|| v.to_string())
    })
}

/// Translate a response envelope into HTTP, echoing the correlation id.
fn write_response(envelope: ResponseEnvelope, request_id: &str) -> Response {
    let mut builder = Response::builder().status(envelope.status);
    for (name, value) in envelope.headers.iter() {
        builder = builder.header(name, value);
    }
    builder = builder.header(REQUEST_ID_HEADER, request_id);
    let body = match &envelope.body {
        Some(value) => {
            builder = builder.header(http::header::CONTENT_TYPE, "application/json");
            Body::from(serde_json::to_vec(value).unwrap_or_default())
        }
        None => Body::empty(),
    };
    builder.body(body).unwrap_or_else(|err| {
        tracing::error!(error = %err, "failed to build HTTP response");
        Response::builder()
            .status(500)
            .body(Body::empty())
            .expect("empty 500 response builds")
    })
}

fn error_response(err: &GatiError, request_id: &str) -> Response {
    write_response(err.to_envelope(request_id), request_id)
}
