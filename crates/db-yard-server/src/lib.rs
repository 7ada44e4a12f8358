//! # db-yard-server
//!
//! Admin HTTP surface and reverse proxy layered over the db-yard ledger.
//! The server is a pure consumer of the session directory: it reads
//! context manifests and forwards traffic; it never mutates the ledger.
//!
//! Routes:
//!
//! - `GET /.admin` - JSON summary of the session's records
//! - `GET /.admin/index.html` - file listing of the session home
//! - `GET /.admin/files/<rel>` - raw session file (containment enforced)
//! - `POST /SQL/unsafe/<serviceId>.json` - ad-hoc query, gated off by
//!   default
//! - anything else - reverse proxy to the service whose endpoint prefix is
//!   the longest match of the request path

#![warn(missing_docs)]
#![warn(clippy::all)]

mod admin;
mod proxy;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::info;

use db_yard_core::sqlrunner::{ReadOnlySqlRunner, SqlRunner};

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The listen socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The server loop failed.
    #[error("server failed: {0}")]
    Serve(#[from] std::io::Error),
}

/// Shared state of all handlers.
#[derive(Clone)]
pub struct AppState {
    /// The session home (or ledger root) the server reads.
    pub home: PathBuf,

    /// Whether the ad-hoc SQL endpoint answers at all.
    pub sql_enabled: bool,

    /// Query executor for the SQL endpoint.
    pub sql: Arc<dyn SqlRunner>,

    /// Shared upstream HTTP client.
    pub client: reqwest::Client,
}

impl AppState {
    /// State over a session home with the read-only SQL runner.
    #[must_use]
    pub fn new(home: impl Into<PathBuf>, sql_enabled: bool) -> Self {
        Self {
            home: home.into(),
            sql_enabled,
            sql: Arc::new(ReadOnlySqlRunner),
            client: reqwest::Client::new(),
        }
    }
}

/// Build the router.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/.admin", get(admin::summary))
        .route("/.admin/index.html", get(admin::index))
        .route("/.admin/files/*rel", get(admin::file))
        .route("/SQL/unsafe/:service", post(admin::sql))
        .fallback(proxy::forward)
        .with_state(state)
}

/// Bind and serve until cancellation.
///
/// # Errors
///
/// Returns [`ServerError::Bind`] when the address is unavailable and
/// [`ServerError::Serve`] when the accept loop fails.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    cancel: CancellationToken,
) -> Result<(), ServerError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    info!(%addr, home = %state.home.display(), "admin server listening");

    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}
