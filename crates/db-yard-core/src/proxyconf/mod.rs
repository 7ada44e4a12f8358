//! Reverse-proxy configuration generators.
//!
//! Pure functions over ledger manifests: each spawned service becomes an
//! nginx location block or a traefik router+service+middleware triple.
//! Per-entry filenames carry the filename-safe id plus its deterministic
//! 32-bit hash; bundle files concatenate all entries in stable id order.

use crate::ledger::SpawnedContext;
use crate::pathing::{fnv1a32, safe_id};

/// Which proxy flavor to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyFlavor {
    /// nginx `server { location ... }` blocks.
    Nginx,
    /// traefik dynamic-configuration YAML.
    Traefik,
}

/// One generated file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedFile {
    /// Output filename (no directory).
    pub name: String,

    /// File contents.
    pub contents: String,
}

/// Per-entry filename: `db-yard.<safeId>.<fnv1a32(id)>.{conf,yaml}`.
#[must_use]
pub fn entry_file_name(context: &SpawnedContext, flavor: ProxyFlavor) -> String {
    let id = &context.service.id;
    let ext = match flavor {
        ProxyFlavor::Nginx => "conf",
        ProxyFlavor::Traefik => "yaml",
    };
    format!("db-yard.{}.{:08x}.{ext}", safe_id(id), fnv1a32(id))
}

/// Emit one nginx location block for a service.
#[must_use]
pub fn nginx_entry(context: &SpawnedContext) -> String {
    let prefix = &context.service.proxy_endpoint_prefix;
    let upstream = &context.service.upstream_url;
    let id = &context.service.id;

    let host = format!("{}:{}", context.listen.host, context.listen.port);

    format!(
        r"# service: {id}
# source: {location}
server {{
    location {prefix} {{
        proxy_pass {upstream};
        proxy_set_header Host {host};
        proxy_set_header X-DB-Yard-Id {id};
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_http_version 1.1;
    }}
}}
",
        location = context.supplier.location.display(),
    )
}

/// Emit one traefik router+service+middleware triple for a service.
#[must_use]
pub fn traefik_entry(context: &SpawnedContext) -> String {
    let id = &context.service.id;
    let key = format!("db-yard-{}-{:08x}", safe_id(id), fnv1a32(id));
    let prefix = &context.service.proxy_endpoint_prefix;
    let base = &context.listen.base_url;

    format!(
        r#"http:
  routers:
    {key}:
      rule: "PathPrefix(`{prefix}`)"
      service: {key}
      middlewares:
        - {key}-headers
  services:
    {key}:
      loadBalancer:
        servers:
          - url: "{base}"
  middlewares:
    {key}-headers:
      headers:
        customRequestHeaders:
          X-DB-Yard-Id: "{id}"
          X-DB-Yard-ProxyPrefix: "{prefix}"
"#
    )
}

/// Generate per-entry files plus the bundle for every context, in stable
/// id sort.
#[must_use]
pub fn generate(contexts: &[SpawnedContext], flavor: ProxyFlavor) -> Vec<GeneratedFile> {
    let mut sorted: Vec<&SpawnedContext> = contexts.iter().collect();
    sorted.sort_by(|a, b| a.service.id.cmp(&b.service.id));

    let mut files = Vec::with_capacity(sorted.len() + 1);
    let mut bundle = String::new();

    for context in &sorted {
        let contents = match flavor {
            ProxyFlavor::Nginx => nginx_entry(context),
            ProxyFlavor::Traefik => traefik_entry(context),
        };
        bundle.push_str(&contents);
        bundle.push('\n');
        files.push(GeneratedFile {
            name: entry_file_name(context, flavor),
            contents,
        });
    }

    let bundle_name = match flavor {
        ProxyFlavor::Nginx => "db-yard.generated.conf",
        ProxyFlavor::Traefik => "db-yard.generated.yaml",
    };
    files.push(GeneratedFile {
        name: bundle_name.to_string(),
        contents: bundle,
    });

    files
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use crate::driver::SpawnPlan;
    use crate::ledger::{
        ListenStamp, OwnerStamp, PathsStamp, ServiceStamp, SessionStamp, SpawnStamp, SupplierStamp,
    };

    use super::*;

    fn context(id: &str, port: u16) -> SpawnedContext {
        SpawnedContext {
            started_at: chrono::Utc::now(),
            session: SessionStamp {
                session_id: "s".to_string(),
                host: "h".to_string(),
                started_at: chrono::Utc::now(),
            },
            service: ServiceStamp {
                id: id.to_string(),
                kind: "sqlpage".to_string(),
                label: id.to_string(),
                proxy_endpoint_prefix: format!("/{}", id.trim_end_matches(".db")),
                upstream_url: format!("http://127.0.0.1:{port}/{}", id.trim_end_matches(".db")),
            },
            supplier: SupplierStamp {
                location: PathBuf::from(format!("/srv/{id}")),
                size: 1,
                mtime: 1,
                kind: "sqlpage".to_string(),
                nature: "sqlite".to_string(),
            },
            listen: ListenStamp {
                host: "127.0.0.1".to_string(),
                port,
                base_url: format!("http://127.0.0.1:{port}"),
                probe_url: format!("http://127.0.0.1:{port}/"),
            },
            spawned: SpawnStamp {
                pid: 1,
                plan: SpawnPlan {
                    command: "sqlpage".to_string(),
                    args: Vec::new(),
                    env: BTreeMap::new(),
                    cwd: None,
                },
            },
            paths: PathsStamp {
                context: PathBuf::from("/l/ctx.json"),
                stdout: PathBuf::from("/l/o.log"),
                stderr: PathBuf::from("/l/e.log"),
            },
            owner: OwnerStamp {
                owner_token: "t".to_string(),
                supervisor_pid: 1,
                host: "h".to_string(),
                started_at_ms: 0,
            },
            db_yard_config: None,
            spawned_ctx: None,
            last_seen_at_ms: None,
        }
    }

    #[test]
    fn test_entry_file_name_is_deterministic() {
        let ctx = context("sub/app.db", 4010);
        let name = entry_file_name(&ctx, ProxyFlavor::Nginx);
        assert_eq!(
            name,
            format!("db-yard.sub_app.db.{:08x}.conf", fnv1a32("sub/app.db"))
        );
        assert_eq!(name, entry_file_name(&ctx, ProxyFlavor::Nginx));
    }

    #[test]
    fn test_nginx_entry_has_location_and_pass() {
        let block = nginx_entry(&context("app.db", 4010));
        assert!(block.contains("location /app"));
        assert!(block.contains("proxy_pass http://127.0.0.1:4010/app"));
        assert!(block.contains("Host 127.0.0.1:4010"));
    }

    #[test]
    fn test_traefik_entry_has_router_service_middleware() {
        let yaml = traefik_entry(&context("app.db", 4010));
        assert!(yaml.contains("routers:"));
        assert!(yaml.contains("services:"));
        assert!(yaml.contains("middlewares:"));
        assert!(yaml.contains("PathPrefix(`/app`)"));
    }

    #[test]
    fn test_generate_bundles_in_stable_order() {
        let contexts = vec![context("b.db", 4011), context("a.db", 4010)];
        let files = generate(&contexts, ProxyFlavor::Nginx);

        // Two entries plus the bundle.
        assert_eq!(files.len(), 3);
        assert_eq!(files.last().unwrap().name, "db-yard.generated.conf");

        let bundle = &files.last().unwrap().contents;
        let a_pos = bundle.find("service: a.db").unwrap();
        let b_pos = bundle.find("service: b.db").unwrap();
        assert!(a_pos < b_pos);
    }
}
