//! HTTP status API
//!
//! `GET /health`, `GET /api/snapshot` and `GET /metrics`.

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, RwLock};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::poller::Snapshot;

/// Shared state behind the HTTP handlers
#[derive(Clone)]
pub struct AppState {
    latest: Arc<RwLock<Option<Arc<Snapshot>>>>,
    metrics: Option<PrometheusHandle>,
    mqtt_connected: Option<Arc<AtomicBool>>,
    started: Instant,
}

impl AppState {
    pub fn new(metrics: Option<PrometheusHandle>) -> Self {
        Self {
            latest: Arc::new(RwLock::new(None)),
            metrics,
            mqtt_connected: None,
            started: Instant::now(),
        }
    }

    /// Report the broker connection flag on `/health`
    pub fn with_mqtt(mut self, connected: Arc<AtomicBool>) -> Self {
        self.mqtt_connected = Some(connected);
        self
    }

    pub async fn update(&self, snapshot: Arc<Snapshot>) {
        *self.latest.write().await = Some(snapshot);
    }

    pub async fn latest(&self) -> Option<Arc<Snapshot>> {
        self.latest.read().await.clone()
    }
}

/// Keep the latest snapshot from the poll loop
pub async fn track_snapshots(state: AppState, mut update_rx: broadcast::Receiver<Arc<Snapshot>>) {
    loop {
        match update_rx.recv().await {
            Ok(snapshot) => state.update(snapshot).await,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("API snapshot tracker lagged by {}", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/snapshot", get(snapshot))
        .route("/metrics", get(metrics))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// GET /health
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let latest = state.latest().await;
    let mqtt_connected = state
        .mqtt_connected
        .as_ref()
        .map(|flag| flag.load(Ordering::SeqCst));
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started.elapsed().as_secs(),
        "last_poll": latest.as_ref().map(|s| s.timestamp.to_rfc3339()),
        "unavailable_registers": latest.as_ref().map(|s| s.unavailable()),
        "mqtt_connected": mqtt_connected,
    }))
}

/// GET /api/snapshot
async fn snapshot(State(state): State<AppState>) -> Response {
    match state.latest().await {
        Some(snapshot) => Json(snapshot.telemetry()).into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "no poll cycle completed yet" })),
        )
            .into_response(),
    }
}

/// GET /metrics
async fn metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}

/// Serve the API until `shutdown` resolves
pub async fn serve(
    config: &ServerConfig,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind HTTP API to {}", addr))?;
    info!("HTTP API listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .with_context(|| "HTTP API server failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::energy::{EnergyState, PowerSnapshot};
    use crate::registers::DecodedValue;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::{Local, TimeZone};
    use http_body_util::BodyExt;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tower::ServiceExt;

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn snapshot() -> Snapshot {
        let timestamp = Local.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap();
        Snapshot {
            timestamp,
            values: vec![("battery_voltage".to_string(), DecodedValue::Numeric(24.9))],
            flows: PowerSnapshot::default(),
            energy: EnergyState::new(timestamp.date_naive()),
        }
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = get_json(router(AppState::new(None)), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert!(body["last_poll"].is_null());
        assert!(body["mqtt_connected"].is_null());
    }

    #[tokio::test]
    async fn test_health_reports_connections() {
        let connected = Arc::new(AtomicBool::new(false));
        let state = AppState::new(None).with_mqtt(connected.clone());
        let mut stale = snapshot();
        stale
            .values
            .push(("mains_power".to_string(), DecodedValue::Unavailable));
        state.update(Arc::new(stale)).await;

        let (_, body) = get_json(router(state.clone()), "/health").await;
        assert_eq!(body["mqtt_connected"], false);
        assert_eq!(body["unavailable_registers"], 1);
        assert!(body["last_poll"]
            .as_str()
            .unwrap()
            .starts_with("2026-10-19T12:00:00"));

        connected.store(true, Ordering::SeqCst);
        let (_, body) = get_json(router(state), "/health").await;
        assert_eq!(body["mqtt_connected"], true);
    }

    #[tokio::test]
    async fn test_snapshot_before_first_poll() {
        let (status, _) = get_json(router(AppState::new(None)), "/api/snapshot").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_snapshot_tracks_latest() {
        let state = AppState::new(None);
        let (tx, rx) = broadcast::channel(4);
        tx.send(Arc::new(snapshot())).unwrap();
        drop(tx);
        track_snapshots(state.clone(), rx).await;

        let (status, body) = get_json(router(state), "/api/snapshot").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["battery_voltage"], 24.9);
        assert_eq!(body["dailyDate"], "2026-10-19");
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let app = router(AppState::new(None));
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let handle = PrometheusBuilder::new().build_recorder().handle();
        let app = router(AppState::new(Some(handle)));
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
