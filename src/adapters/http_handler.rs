use std::{collections::HashMap, sync::Arc, time::Instant};

use axum::{
    Json, Router,
    body::Body as AxumBody,
    extract::{Request as AxumRequest, State},
    http::{HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response as AxumResponse},
    routing::get,
};
use tower_http::trace::TraceLayer;
use tracing::Instrument;

use crate::{
    core::{
        GatewayService,
        context::Context,
        error::ProxyError,
        proxy::{ProxyResult, Request, Response, split},
    },
    tracing_setup::create_request_span,
};

/// Response header telling whether every backend answered in full
pub const COMPLETED_HEADER: &str = "x-conflux-completed";

/// Context value key holding the inbound request id, if the client sent one
pub const REQUEST_ID_KEY: &str = "request_id";

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Upper bound on buffered inbound bodies
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Non-standard status for requests abandoned before an answer was ready
const CLIENT_CLOSED_REQUEST: u16 = 499;

/// HTTP handler for the Conflux gateway
#[derive(Clone)]
pub struct HttpHandler {
    gateway_service: Arc<GatewayService>,
    /// Parent of every request context; cancelling it aborts in-flight work
    root: Context,
}

impl HttpHandler {
    pub fn new(gateway_service: Arc<GatewayService>) -> Self {
        Self {
            gateway_service,
            root: Context::background(),
        }
    }

    pub fn with_root_context(mut self, root: Context) -> Self {
        self.root = root;
        self
    }

    /// Axum router serving every configured endpoint plus `/__health`.
    pub fn router(self) -> Router {
        Router::new()
            .route("/__health", get(health))
            .fallback(handle)
            .layer(TraceLayer::new_for_http())
            .with_state(self)
    }

    /// Resolve, run and render one inbound request.
    pub async fn handle_request(&self, req: AxumRequest) -> AxumResponse {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let Some(route) = self.gateway_service.find_endpoint(&method, &path) else {
            let status = if self.gateway_service.has_path(&path) {
                StatusCode::METHOD_NOT_ALLOWED
            } else {
                StatusCode::NOT_FOUND
            };
            tracing::debug!("No endpoint for {} {}", method, path);
            return error_response(status, &status.to_string());
        };
        let endpoint = route.endpoint;

        let span = create_request_span(method.as_str(), &path, &endpoint.config.endpoint);
        let started = Instant::now();

        let (parts, body) = req.into_parts();
        let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!("Failed to read request body for {}: {}", path, e);
                return error_response(StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
            }
        };

        let mut ctx = self.root.with_timeout(endpoint.timeout());
        if let Some(id) = parts
            .headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            ctx = ctx.with_value(REQUEST_ID_KEY, id);
        }
        let _cancel = ctx.cancel_on_drop();

        let request = Request {
            method,
            url: None,
            query: parse_query(parts.uri.query()),
            path: path.clone(),
            body,
            params: route.params,
            headers: parts.headers,
        };

        let result = ctx
            .run(endpoint.proxy.call(ctx.clone(), request))
            .instrument(span.clone())
            .await;

        let response = render(result);
        span.record("http.status_code", response.status().as_u16());
        span.record("duration_ms", started.elapsed().as_millis() as u64);
        response
    }
}

async fn handle(State(handler): State<HttpHandler>, req: AxumRequest) -> AxumResponse {
    handler.handle_request(req).await
}

async fn health(State(handler): State<HttpHandler>) -> AxumResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "endpoints": handler.gateway_service.endpoints().len(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
    .into_response()
}

fn parse_query(query: Option<&str>) -> Vec<(String, String)> {
    query
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default()
}

/// Map a pipeline outcome to an HTTP response. Any data is rendered, even
/// when it comes with an error; the error alone decides the status otherwise.
pub fn render(result: ProxyResult) -> AxumResponse {
    match split(result) {
        (Some(response), err) => {
            if let Some(err) = &err {
                tracing::warn!("Serving degraded response: {}", err);
            }
            let completed = response.is_complete && err.is_none();
            render_document(response, completed)
        }
        (None, Some(err)) => {
            tracing::warn!("Endpoint failed: {}", err);
            error_response(status_for(&err), &err.to_string())
        }
        (None, None) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &ProxyError::InvalidResponse.to_string(),
        ),
    }
}

fn render_document(response: Response, completed: bool) -> AxumResponse {
    let completed_header = (
        HeaderName::from_static(COMPLETED_HEADER),
        HeaderValue::from_static(if completed { "true" } else { "false" }),
    );

    match response.io {
        Some(raw) => {
            let content_type = response
                .metadata
                .headers
                .get(header::CONTENT_TYPE)
                .cloned()
                .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));
            (
                StatusCode::OK,
                [completed_header, (header::CONTENT_TYPE, content_type)],
                AxumBody::from(raw),
            )
                .into_response()
        }
        None => (
            StatusCode::OK,
            [completed_header],
            Json(serde_json::Value::Object(response.data)),
        )
            .into_response(),
    }
}

fn status_for(err: &ProxyError) -> StatusCode {
    match err {
        ProxyError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        ProxyError::Cancelled => {
            StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_GATEWAY)
        }
        ProxyError::Partial { error, .. } => status_for(error),
        ProxyError::Merge(merged) => merged
            .context_error()
            .map_or(StatusCode::INTERNAL_SERVER_ERROR, status_for),
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(status: StatusCode, message: &str) -> AxumResponse {
    let body: HashMap<&str, &str> = HashMap::from([("error", message)]);
    (status, Json(body)).into_response()
}
