//! Driver registry module.
//!
//! A driver is keyed by [`ServiceKind`] and turns a resolved service plus
//! runtime parameters into a [`SpawnPlan`]. Drivers only describe: they
//! never allocate ports, write files, or execute processes.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::classify::{ExposableService, ServiceKind};
use crate::sidecar::SidecarConfig;

/// A fully-described process launch. Pure data; never contains a PID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnPlan {
    /// Binary to execute.
    pub command: String,

    /// Arguments in order.
    pub args: Vec<String>,

    /// Environment entries, stable key order for reproducible manifests.
    pub env: BTreeMap<String, String>,

    /// Working directory, when the driver pins one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

/// Runtime parameters a driver needs beyond the service itself.
#[derive(Debug, Clone)]
pub struct PlanRequest<'a> {
    /// The service being launched.
    pub service: &'a ExposableService,

    /// Port allocated for this child.
    pub port: u16,

    /// Host the child should bind.
    pub listen_host: &'a str,

    /// Sidecar configuration of the source file.
    pub sidecar: &'a SidecarConfig,
}

/// Driver errors.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// No driver is registered for the kind.
    #[error("no driver registered for kind '{0}'")]
    UnknownKind(ServiceKind),

    /// The service kind cannot be spawned.
    #[error("kind '{0}' is not exposable")]
    NotExposable(ServiceKind),
}

/// Per-kind spawn plan producer.
pub trait Driver: Send + Sync {
    /// The kind this driver serves.
    fn kind(&self) -> ServiceKind;

    /// Produce a spawn plan. Must not perform I/O.
    fn plan(&self, req: &PlanRequest<'_>) -> SpawnPlan;
}

/// Registry of drivers keyed by kind.
pub struct DriverRegistry {
    drivers: HashMap<ServiceKind, Box<dyn Driver>>,
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("kinds", &self.drivers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl DriverRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            drivers: HashMap::new(),
        }
    }

    /// Registry with the two built-in drivers.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(SqlpageDriver::default()));
        registry.register(Box::new(SurveilrDriver::default()));
        registry
    }

    /// Register (or replace) a driver.
    pub fn register(&mut self, driver: Box<dyn Driver>) {
        self.drivers.insert(driver.kind(), driver);
    }

    /// Produce a plan for a service, applying sidecar overrides.
    ///
    /// Sidecar keys `<kind>.bin`, `<kind>.args`, and `<kind>.env` override
    /// the binary, append arguments, and merge environment entries.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::NotExposable`] for kinds that cannot run and
    /// [`DriverError::UnknownKind`] when no driver is registered.
    pub fn plan(&self, req: &PlanRequest<'_>) -> Result<SpawnPlan, DriverError> {
        let kind = req.service.kind;
        if !kind.is_exposable() {
            return Err(DriverError::NotExposable(kind));
        }
        let driver = self
            .drivers
            .get(&kind)
            .ok_or(DriverError::UnknownKind(kind))?;

        let mut plan = driver.plan(req);
        apply_sidecar_overrides(&mut plan, kind, req.sidecar);
        Ok(plan)
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn apply_sidecar_overrides(plan: &mut SpawnPlan, kind: ServiceKind, sidecar: &SidecarConfig) {
    let prefix = kind.as_str();

    if let Some(bin) = sidecar.get_str(&format!("{prefix}.bin")) {
        plan.command = bin.to_string();
    }

    if let Some(value) = sidecar.get(&format!("{prefix}.args")) {
        if let Some(json) = value.as_json() {
            if let Some(items) = json.as_array() {
                plan.args.extend(
                    items
                        .iter()
                        .filter_map(|v| v.as_str().map(ToString::to_string)),
                );
            }
        } else if let Some(raw) = value.as_str() {
            plan.args.extend(raw.split_whitespace().map(ToString::to_string));
        }
    }

    if let Some(json) = sidecar
        .get(&format!("{prefix}.env"))
        .and_then(crate::sidecar::SidecarValue::as_json)
    {
        if let Some(map) = json.as_object() {
            for (key, value) in map {
                if let Some(s) = value.as_str() {
                    plan.env.insert(key.clone(), s.to_string());
                }
            }
        }
    }
}

/// Environment-driven driver for sqlpage-like servers.
#[derive(Debug, Clone)]
pub struct SqlpageDriver {
    /// Binary name or path.
    pub bin: String,

    /// Value passed as `SQLPAGE_ENVIRONMENT`.
    pub environment: String,
}

impl Default for SqlpageDriver {
    fn default() -> Self {
        Self {
            bin: "sqlpage".to_string(),
            environment: "production".to_string(),
        }
    }
}

impl Driver for SqlpageDriver {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Sqlpage
    }

    fn plan(&self, req: &PlanRequest<'_>) -> SpawnPlan {
        let mut env = BTreeMap::new();
        env.insert(
            "DATABASE_URL".to_string(),
            format!("sqlite://{}", req.service.location.display()),
        );
        env.insert(
            "LISTEN_ON".to_string(),
            format!("{}:{}", req.listen_host, req.port),
        );
        env.insert("SQLPAGE_ENVIRONMENT".to_string(), self.environment.clone());

        SpawnPlan {
            command: self.bin.clone(),
            args: Vec::new(),
            env,
            cwd: req.service.location.parent().map(PathBuf::from),
        }
    }
}

/// Argument-driven driver for surveilr-like servers.
#[derive(Debug, Clone)]
pub struct SurveilrDriver {
    /// Binary name or path.
    pub bin: String,
}

impl Default for SurveilrDriver {
    fn default() -> Self {
        Self {
            bin: "surveilr".to_string(),
        }
    }
}

impl Driver for SurveilrDriver {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Surveilr
    }

    fn plan(&self, req: &PlanRequest<'_>) -> SpawnPlan {
        SpawnPlan {
            command: self.bin.clone(),
            args: vec![
                "web-ui".to_string(),
                "-d".to_string(),
                req.service.location.display().to_string(),
                "--port".to_string(),
                req.port.to_string(),
            ],
            env: BTreeMap::new(),
            cwd: req.service.location.parent().map(PathBuf::from),
        }
    }
}
