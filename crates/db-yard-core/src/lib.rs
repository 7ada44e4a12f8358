//! # db-yard-core
//!
//! Core library for db-yard - a file-driven process supervisor that turns
//! database files on disk into running local network services.
//!
//! A directory tree is the desired state: each qualifying database file maps
//! to exactly one running child process bound to a local TCP port, described
//! by a persisted JSON manifest. Adding a file spawns a service, removing it
//! terminates the service, modifying it refreshes the manifest in place.
//!
//! ## Features
//!
//! - **Discovery**: Walk watch roots and match database files by glob
//! - **Classification**: Probe SQLite files for the table shapes that mark
//!   them as exposable services
//! - **Detached Spawning**: Launch children in their own process group so
//!   they outlive the supervisor
//! - **Ledger**: A filesystem session directory of atomic JSON manifests,
//!   the sole integration contract
//! - **Reconciliation**: Drive observed state (ledger + tagged processes)
//!   toward desired state with per-file backoff
//! - **Scheduling**: One-shot materialization or a debounced watch loop
//!
//! ## Example
//!
//! ```rust,no_run
//! use db_yard_core::config::YardConfig;
//! use db_yard_core::orchestrator::Orchestrator;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = YardConfig::builder()
//!     .root("/srv/databases")
//!     .ledger_root("/var/lib/db-yard")
//!     .build()?;
//!
//! let mut orch = Orchestrator::new(config);
//! let summary = orch.start_session().await?;
//! println!("{summary}");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod classify;
pub mod config;
pub mod discovery;
pub mod driver;
pub mod ledger;
pub mod orchestrator;
pub mod pathing;
pub mod probe;
pub mod procindex;
pub mod proxyconf;
pub mod reconcile;
pub mod scheduler;
pub mod sidecar;
pub mod spawner;
pub mod sqlrunner;

/// Re-export commonly used types at the crate root.
pub use classify::{Classification, ExposableService, ServiceKind};
pub use config::YardConfig;
pub use ledger::{SessionHome, SpawnedContext};
pub use orchestrator::Orchestrator;
pub use reconcile::PassSummary;
