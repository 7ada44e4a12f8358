//! Admin endpoints: session summary, file listing, raw file serving, and
//! the gated ad-hoc SQL endpoint.

use axum::extract::{Path as UrlPath, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use db_yard_core::ledger;
use db_yard_core::pathing;

use crate::AppState;

/// `GET /.admin` - JSON summary of the session's records.
pub async fn summary(State(state): State<AppState>) -> Response {
    let resolved = ledger::resolve_session_home(&state.home);
    let states = ledger::scan(resolved.path());

    let items: Vec<serde_json::Value> = states
        .iter()
        .map(|s| {
            json!({
                "contextPath": s.context_path,
                "serviceId": s.service_id(),
                "pid": s.pid,
                "alive": s.alive,
                "upstreamUrl": s.context.as_ref().map(|c| c.service.upstream_url.clone()),
                "proxyEndpointPrefix": s.context.as_ref().map(|c| c.service.proxy_endpoint_prefix.clone()),
                "error": s.error,
            })
        })
        .collect();

    Json(json!({
        "ok": true,
        "nowMs": chrono::Utc::now().timestamp_millis(),
        "sessionHome": resolved.path(),
        "count": items.len(),
        "items": items,
    }))
    .into_response()
}

/// `GET /.admin/index.html` - a plain listing of session files.
pub async fn index(State(state): State<AppState>) -> Response {
    let resolved = ledger::resolve_session_home(&state.home);
    let mut names: Vec<String> = Vec::new();

    for entry in walk_files(resolved.path()) {
        if let Ok(rel) = entry.strip_prefix(resolved.path()) {
            names.push(rel.to_string_lossy().to_string());
        }
    }
    names.sort();

    let rows: String = names
        .iter()
        .map(|name| format!("<li><a href=\"/.admin/files/{name}\">{name}</a></li>\n"))
        .collect();
    let body = format!(
        "<!doctype html><title>db-yard session</title>\
         <h1>{}</h1><ul>\n{rows}</ul>",
        resolved.path().display()
    );
    Html(body).into_response()
}

fn walk_files(root: &std::path::Path) -> Vec<std::path::PathBuf> {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().to_path_buf())
        .collect()
}

/// `GET /.admin/files/<rel>` - raw file from the session home, with
/// path containment enforced.
pub async fn file(State(state): State<AppState>, UrlPath(rel): UrlPath<String>) -> Response {
    let resolved = ledger::resolve_session_home(&state.home);
    let Some(full) = pathing::contains_path(resolved.path(), &rel) else {
        return (StatusCode::FORBIDDEN, "path escapes session home").into_response();
    };

    match tokio::fs::read(&full).await {
        Ok(bytes) => {
            let content_type = if rel.ends_with(".json") {
                "application/json"
            } else {
                "text/plain; charset=utf-8"
            };
            ([(header::CONTENT_TYPE, content_type)], bytes).into_response()
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            (StatusCode::NOT_FOUND, "no such session file").into_response()
        }
        Err(err) => {
            warn!(path = %full.display(), error = %err, "file read failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "read failed").into_response()
        }
    }
}

/// Body of the SQL endpoint.
#[derive(Debug, Deserialize)]
pub struct SqlBody {
    /// The query to run.
    pub sql: String,
}

/// `POST /SQL/unsafe/<serviceId>.json` - ad-hoc query against the
/// service's database. Intentionally unsafe and gated off by default.
pub async fn sql(
    State(state): State<AppState>,
    UrlPath(service): UrlPath<String>,
    Json(body): Json<SqlBody>,
) -> Response {
    if !state.sql_enabled {
        return (StatusCode::FORBIDDEN, "SQL endpoint is disabled").into_response();
    }

    let service_id = service.strip_suffix(".json").unwrap_or(&service);
    let resolved = ledger::resolve_session_home(&state.home);

    let db_path = ledger::scan(resolved.path())
        .into_iter()
        .filter_map(|s| s.context)
        .find(|c| c.service.id == service_id)
        .map(|c| c.supplier.location);

    let Some(db_path) = db_path else {
        return (StatusCode::NOT_FOUND, "no such service").into_response();
    };

    let outcome = tokio::task::spawn_blocking({
        let sql_runner = state.sql.clone();
        let query = body.sql;
        move || sql_runner.run_query(&db_path, &query)
    })
    .await;

    match outcome {
        Ok(outcome) => {
            let status = if outcome.ok {
                StatusCode::OK
            } else {
                StatusCode::UNPROCESSABLE_ENTITY
            };
            (status, Json(outcome)).into_response()
        }
        Err(err) => {
            warn!(error = %err, "sql task failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "query task failed").into_response()
        }
    }
}
