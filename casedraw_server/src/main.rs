use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use casedraw_core::{DrawService, TableRegistry};

mod config;
mod db;
mod error;
mod routes;

use config::ServerConfig;
use db::{SqliteLedger, SqliteStore};
use routes::AppState;

fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/tables", get(routes::route_tables))
        .route("/tables/:id", get(routes::route_table))
        .route("/commit", post(routes::route_commit))
        .route("/spin", post(routes::route_spin))
        .route("/reveal", post(routes::route_reveal))
        .route("/verify", post(routes::route_verify))
        .route("/draws/:id", get(routes::route_draw))
        .route("/stats/:account", get(routes::route_stats))
        .route("/admin/tables", post(routes::route_admin_upsert_table))
        .route("/admin/grant", post(routes::route_admin_grant))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

/// Periodically drop commitments nobody drew against.
fn spawn_sweeper(state: Arc<AppState>, every: Duration) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        loop {
            tick.tick().await;
            match state.service.purge_expired().await {
                Ok(0) => {}
                Ok(dropped) => {
                    debug!(dropped, open = state.service.open_draws(), "expired commitments purged");
                }
                Err(e) => warn!(error = %e, "commitment sweep failed"),
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = ServerConfig::from_env()?;
    let db = db::connect(&cfg.database_url).await?;
    db::init_db(&db).await?;

    let tables = TableRegistry::new(cfg.load_tables()?);
    info!(tables = ?tables.ids(), "draw tables loaded");

    // refuses to start if the digest self-test fails
    let service = DrawService::new(
        cfg.engine(),
        tables,
        SqliteLedger::new(db.clone()),
        SqliteStore::new(db.clone()),
    )?;

    let state = Arc::new(AppState {
        service,
        db,
        api_key: cfg.api_key.clone(),
    });
    spawn_sweeper(state.clone(), Duration::from_secs(cfg.sweep_interval_secs));

    let listener = tokio::net::TcpListener::bind(&cfg.bind).await?;
    info!("listening on {}", cfg.bind);
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use casedraw_core::{DrawTable, EngineConfig};
    use serde_json::{json, Value};
    use sqlx::sqlite::SqlitePoolOptions;
    use tower::ServiceExt;

    use super::*;

    const KEY: &str = "test-key";

    async fn test_app() -> Router {
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        db::init_db(&db).await.unwrap();
        let service = DrawService::new(
            EngineConfig::default(),
            TableRegistry::new(DrawTable::defaults().unwrap()),
            SqliteLedger::new(db.clone()),
            SqliteStore::new(db.clone()),
        )
        .unwrap();
        app(Arc::new(AppState {
            service,
            db,
            api_key: KEY.into(),
        }))
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {KEY}"));
        let body = match body {
            Some(v) => {
                req = req.header(header::CONTENT_TYPE, "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let res = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = res.status();
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn commit_spin_reveal_verify_over_http() {
        let app = test_app().await;
        let (status, _) = call(&app, "POST", "/admin/grant", Some(json!({"account_id": "alice", "amount": 50}))).await;
        assert_eq!(status, StatusCode::OK);

        let (status, commit) = call(&app, "POST", "/commit", Some(json!({"table_id": "case_common"}))).await;
        assert_eq!(status, StatusCode::OK);
        let draw_id = commit["draw_id"].as_str().unwrap().to_string();
        let hash = commit["server_seed_hash"].as_str().unwrap().to_string();

        let (status, body) = call(&app, "POST", "/reveal", Some(json!({"draw_id": draw_id}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "DrawNotFinalized");

        let spin = json!({"account_id": "alice", "draw_id": draw_id, "client_seed": "lucky", "price": 50});
        let (status, receipt) = call(&app, "POST", "/spin", Some(spin.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(receipt["sequence"], 1);

        let (status, body) = call(&app, "POST", "/spin", Some(spin)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "AlreadyFinalized");

        let (status, hidden) = call(&app, "GET", &format!("/draws/{draw_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(hidden["server_seed"].is_null());

        let (status, revealed) = call(&app, "POST", "/reveal", Some(json!({"draw_id": draw_id}))).await;
        assert_eq!(status, StatusCode::OK);
        let seed = revealed["server_seed"].as_str().unwrap().to_string();
        assert_eq!(casedraw_core::derive_hash_hex(seed.as_bytes()), hash);

        let (_, shown) = call(&app, "GET", &format!("/draws/{draw_id}"), None).await;
        assert_eq!(shown["server_seed"], seed.as_str());

        let (_, table) = call(&app, "GET", "/tables/case_common", None).await;
        let mut check = json!({
            "server_seed": seed,
            "client_seed": "lucky",
            "sequence": 1,
            "entries": table["entries"],
            "claimed_outcome_id": receipt["outcome_id"],
            "commitment_hash": hash,
            "table_fingerprint": commit["table_fingerprint"],
            "roll": shown["roll"],
        });
        let (status, verdict) = call(&app, "POST", "/verify", Some(check.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(verdict["valid"], true);

        check["client_seed"] = json!("someone-else");
        let (_, verdict) = call(&app, "POST", "/verify", Some(check)).await;
        assert_eq!(verdict["valid"], false);
    }

    #[tokio::test]
    async fn http_errors_carry_their_kind() {
        let app = test_app().await;
        let (status, body) = call(&app, "POST", "/commit", Some(json!({"table_id": "nope"}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "UnknownTable");

        let (_, commit) = call(&app, "POST", "/commit", Some(json!({"table_id": "case_rare"}))).await;
        let draw_id = commit["draw_id"].clone();
        let (status, body) = call(
            &app,
            "POST",
            "/spin",
            Some(json!({"account_id": "bob", "draw_id": draw_id, "client_seed": "x", "price": 150})),
        )
        .await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(body["kind"], "InsufficientBalance");

        let (status, _) = call(
            &app,
            "POST",
            "/spin",
            Some(json!({"account_id": "bob", "draw_id": draw_id, "client_seed": "", "price": 150})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&app, "GET", &format!("/draws/{}", draw_id.as_str().unwrap()), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(
            &app,
            "POST",
            "/verify",
            Some(json!({
                "server_seed": "s",
                "client_seed": "c",
                "sequence": 1,
                "entries": [{"outcome_id": "a", "weight": 0}],
                "claimed_outcome_id": "a",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["kind"], "NonPositiveWeight");
    }
}
