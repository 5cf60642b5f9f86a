pub mod audit;
pub mod gateway;
pub mod service;
pub mod telegram;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use keygate_config::Config;
use keygate_contracts::ChatId;
use keygate_kernel::ResourcePool;
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::{error, info, warn};

pub use audit::{verify_audit_chain, AuditJsonl, AuditRecord};
pub use gateway::{ChatGateway, GatewayError, ReplyTarget};
pub use service::{AllocationService, DecisionOutcome, GateSettings, PoolStatus, RequestOutcome};
pub use telegram::{event_from_update, TelegramGateway};

const POLL_BACKOFF: Duration = Duration::from_secs(3);

pub async fn serve(cfg: Config) -> Result<(), String> {
    let pool = ResourcePool::open(
        &cfg.pool.available_dir,
        &cfg.pool.issued_dir,
        &cfg.pool.extension,
    )
    .map_err(|e| format!("pool open failed: {e}"))?;
    let available = pool
        .list_available()
        .map_err(|e| format!("pool listing failed: {e}"))?;
    if available.is_empty() {
        warn!(dir = %pool.available_dir().display(), "no configs available");
    }

    let telegram = Arc::new(TelegramGateway::new(
        &cfg.telegram.api_base,
        cfg.token(),
        Duration::from_millis(cfg.telegram.request_timeout_ms),
        Duration::from_secs(cfg.telegram.poll_timeout_s),
    )?);

    let mut service = AllocationService::new(pool, telegram.clone(), gate_settings(&cfg));
    if let Some(audit) = &cfg.audit {
        service = service.with_audit(Arc::new(AuditJsonl::new(&audit.jsonl_path).await?));
    }
    let service = Arc::new(service);

    if let Some(server) = &cfg.server {
        let addr: SocketAddr = server
            .listen_addr
            .parse()
            .map_err(|e| format!("invalid listen_addr: {e}"))?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| format!("bind failed: {e}"))?;
        let app = build_app(service.clone());
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "status server exited");
            }
        });
        info!(%addr, "status server listening");
    }

    info!(admin = %service.admin(), "bot starting");
    tokio::select! {
        _ = run_polling(telegram, service) => {}
        _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
    }
    Ok(())
}

pub fn gate_settings(cfg: &Config) -> GateSettings {
    GateSettings {
        admin: ChatId(cfg.admin_id()),
        probe_timeout: Duration::from_millis(cfg.gate.probe_timeout_ms),
        delivery_timeout: Duration::from_millis(cfg.gate.delivery_timeout_ms),
        bot_handle: cfg.telegram.bot_handle.clone(),
    }
}

pub fn build_app(service: Arc<AllocationService>) -> Router {
    Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/pool", get(pool_status))
        .with_state(service)
}

/// Drains `getUpdates` forever; each update is handled on its own task.
pub async fn run_polling(telegram: Arc<TelegramGateway>, service: Arc<AllocationService>) {
    let mut offset = 0i64;
    loop {
        let updates = match telegram.get_updates(offset).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "polling failed");
                sleep(POLL_BACKOFF).await;
                continue;
            }
        };
        for update in updates {
            offset = offset.max(update.update_id + 1);
            if let Some(event) = event_from_update(update, service.bot_handle()) {
                let service = service.clone();
                tokio::spawn(async move { service.handle_event(event).await });
            }
        }
    }
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn pool_status(
    State(service): State<Arc<AllocationService>>,
) -> Result<Json<PoolStatus>, (StatusCode, Json<Value>)> {
    service.status().await.map(Json).map_err(|e| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": {"code": "pool_unavailable", "message": e.to_string()}})),
        )
    })
}
