//! Reverse-proxy fallback handler.
//!
//! Resolves the target service by longest endpoint-prefix match, rewrites
//! the `Host` header to the upstream, injects the `X-DB-Yard-*` headers,
//! and streams both bodies without buffering.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

use db_yard_core::ledger::{self, SpawnedContext};

use crate::AppState;

/// Fallback handler: forward to the longest-prefix-matching service.
pub async fn forward(State(state): State<AppState>, request: Request) -> Response {
    let path = request.uri().path().to_string();

    let resolved = ledger::resolve_session_home(&state.home);
    let target = ledger::scan(resolved.path())
        .into_iter()
        .filter(|s| s.alive)
        .filter_map(|s| s.context)
        .filter(|c| prefix_matches(&path, &c.service.proxy_endpoint_prefix))
        .max_by_key(|c| c.service.proxy_endpoint_prefix.len());

    let Some(target) = target else {
        return (StatusCode::NOT_FOUND, "no service matches this path").into_response();
    };

    match forward_to(&state, request, &target).await {
        Ok(response) => response,
        Err(err) => {
            warn!(service = %target.service.id, error = %err, "proxy forward failed");
            (StatusCode::BAD_GATEWAY, format!("upstream error: {err}")).into_response()
        }
    }
}

fn prefix_matches(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    path == prefix || path.starts_with(&format!("{prefix}/"))
}

async fn forward_to(
    state: &AppState,
    request: Request,
    target: &SpawnedContext,
) -> Result<Response, reqwest::Error> {
    let upstream_host = format!("{}:{}", target.listen.host, target.listen.port);
    let path_and_query = request
        .uri()
        .path_and_query()
        .map_or_else(|| request.uri().path().to_string(), ToString::to_string);
    let url = format!("http://{upstream_host}{path_and_query}");

    debug!(
        service = %target.service.id,
        %url,
        method = %request.method(),
        "forwarding"
    );

    let method = reqwest::Method::from_bytes(request.method().as_str().as_bytes())
        .unwrap_or(reqwest::Method::GET);

    let mut upstream = state.client.request(method, &url);

    // Copy request headers, replacing Host with the upstream's and leaving
    // framing to the client.
    for (name, value) in request.headers() {
        if name == axum::http::header::HOST
            || matches!(name.as_str(), "connection" | "transfer-encoding" | "content-length")
        {
            continue;
        }
        if let Ok(value) = value.to_str() {
            upstream = upstream.header(name.as_str(), value);
        }
    }
    upstream = upstream
        .header("host", &upstream_host)
        .header("x-db-yard-id", &target.service.id)
        .header("x-db-yard-db", target.supplier.location.display().to_string())
        .header("x-db-yard-kind", &target.service.kind)
        .header("x-db-yard-pid", target.spawned.pid.to_string())
        .header("x-db-yard-upstream", &target.service.upstream_url)
        .header(
            "x-db-yard-proxyprefix",
            &target.service.proxy_endpoint_prefix,
        );

    // Stream the request body through untouched.
    let body_stream = request.into_body().into_data_stream();
    let response = upstream
        .body(reqwest::Body::wrap_stream(body_stream))
        .send()
        .await?;

    let status =
        StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);

    let mut builder = Response::builder().status(status);
    for (name, value) in response.headers() {
        // Hop-by-hop headers stay out; the server recomputes framing for
        // the streamed body.
        if matches!(name.as_str(), "connection" | "transfer-encoding" | "keep-alive") {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            builder = builder.header(name, value);
        }
    }

    let body = Body::from_stream(response.bytes_stream());
    Ok(builder
        .body(body)
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response()))
}
