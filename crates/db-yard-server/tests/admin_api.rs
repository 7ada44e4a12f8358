//! Admin surface and reverse-proxy tests against a synthetic session
//! home and a minimal in-process upstream.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tower::ServiceExt;

use db_yard_core::driver::SpawnPlan;
use db_yard_core::ledger::{
    self, ListenStamp, OwnerStamp, PathsStamp, ServiceStamp, SessionStamp, SpawnStamp,
    SpawnedContext, SupplierStamp,
};
use db_yard_server::{router, AppState};

fn write_manifest(home: &Path, id: &str, prefix: &str, port: u16, db: &Path) -> PathBuf {
    let context_path = home.join(format!("{id}.context.json"));
    let base_url = format!("http://127.0.0.1:{port}");
    let context = SpawnedContext {
        started_at: chrono::Utc::now(),
        session: SessionStamp {
            session_id: "s1".to_string(),
            host: "test".to_string(),
            started_at: chrono::Utc::now(),
        },
        service: ServiceStamp {
            id: id.to_string(),
            kind: "sqlpage".to_string(),
            label: id.to_string(),
            proxy_endpoint_prefix: prefix.to_string(),
            upstream_url: format!("{base_url}{prefix}"),
        },
        supplier: SupplierStamp {
            location: db.to_path_buf(),
            size: 1,
            mtime: 1,
            kind: "sqlpage".to_string(),
            nature: "sqlite".to_string(),
        },
        listen: ListenStamp {
            host: "127.0.0.1".to_string(),
            port,
            base_url: base_url.clone(),
            probe_url: format!("{base_url}/"),
        },
        spawned: SpawnStamp {
            // The test process itself, so liveness checks pass.
            pid: std::process::id(),
            plan: SpawnPlan {
                command: "sqlpage".to_string(),
                args: Vec::new(),
                env: BTreeMap::new(),
                cwd: None,
            },
        },
        paths: PathsStamp {
            context: context_path.clone(),
            stdout: home.join(format!("{id}.stdout.log")),
            stderr: home.join(format!("{id}.stderr.log")),
        },
        owner: OwnerStamp {
            owner_token: "token".to_string(),
            supervisor_pid: std::process::id(),
            host: "test".to_string(),
            started_at_ms: 0,
        },
        db_yard_config: None,
        spawned_ctx: None,
        last_seen_at_ms: None,
    };
    ledger::write_context(&context).unwrap();
    context_path
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn admin_summary_lists_records() {
    let home = TempDir::new().unwrap();
    let db = home.path().join("app.db");
    write_manifest(home.path(), "app.db", "/app", 59_991, &db);

    let app = router(AppState::new(home.path(), false));
    let response = app
        .oneshot(Request::get("/.admin").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["ok"], true);
    assert_eq!(json["count"], 1);
    assert_eq!(json["items"][0]["serviceId"], "app.db");
    assert_eq!(json["items"][0]["alive"], true);
}

#[tokio::test]
async fn admin_file_serving_enforces_containment() {
    let home = TempDir::new().unwrap();
    std::fs::write(home.path().join("note.txt"), b"inside").unwrap();

    let app = router(AppState::new(home.path(), false));

    let ok = app
        .clone()
        .oneshot(
            Request::get("/.admin/files/note.txt")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(ok.status(), StatusCode::OK);

    let escape = app
        .oneshot(
            Request::get("/.admin/files/../../etc/passwd")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_ne!(escape.status(), StatusCode::OK);
}

#[tokio::test]
async fn sql_endpoint_is_gated_off_by_default() {
    let home = TempDir::new().unwrap();
    let db = home.path().join("app.db");
    write_manifest(home.path(), "app.db", "/app", 59_992, &db);

    let app = router(AppState::new(home.path(), false));
    let response = app
        .oneshot(
            Request::post("/SQL/unsafe/app.db.json")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"sql": "SELECT 1 AS one"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn sql_endpoint_runs_queries_when_enabled() {
    let home = TempDir::new().unwrap();
    let db = home.path().join("app.db");
    let conn = rusqlite::Connection::open(&db).unwrap();
    conn.execute_batch("CREATE TABLE t (n INTEGER); INSERT INTO t VALUES (7);")
        .unwrap();
    drop(conn);
    write_manifest(home.path(), "app.db", "/app", 59_993, &db);

    let app = router(AppState::new(home.path(), true));
    let response = app
        .oneshot(
            Request::post("/SQL/unsafe/app.db.json")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"sql": "SELECT n FROM t"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["ok"], true);
    assert_eq!(json["rows"][0]["n"], 7);
}

#[tokio::test]
async fn unmatched_path_is_not_found() {
    let home = TempDir::new().unwrap();
    let app = router(AppState::new(home.path(), false));

    let response = app
        .oneshot(Request::get("/nothing/here").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn proxy_forwards_with_injected_headers() {
    // Minimal upstream: capture the request head, answer 200.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (head_tx, head_rx) = tokio::sync::oneshot::channel::<String>();

    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = vec![0u8; 8192];
            let mut head = String::new();
            loop {
                let n = stream.read(&mut buf).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                head.push_str(&String::from_utf8_lossy(&buf[..n]));
                if head.contains("\r\n\r\n") {
                    break;
                }
            }
            let _ = stream
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 11\r\n\r\nupstream-ok")
                .await;
            let _ = head_tx.send(head);
        }
    });

    let home = TempDir::new().unwrap();
    let db = home.path().join("app.db");
    write_manifest(home.path(), "app.db", "/app", port, &db);

    let app = router(AppState::new(home.path(), false));
    let response = app
        .oneshot(Request::get("/app/page").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"upstream-ok");

    let head = head_rx.await.unwrap();
    assert!(head.starts_with("GET /app/page"));
    assert!(head.to_lowercase().contains("x-db-yard-id: app.db"));
    assert!(head.to_lowercase().contains(&format!("host: 127.0.0.1:{port}")));
    assert!(head.to_lowercase().contains("x-db-yard-proxyprefix: /app"));
}
