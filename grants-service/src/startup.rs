//! Application startup and lifecycle management.

use crate::config::{GrantsConfig, StorerKind};
use crate::services::{get_metrics, init_metrics, MemoryStorer, MongoStorer, PostgresStorer, Storer};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde_json::json;
use service_core::error::AppError;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// State for health check endpoints.
#[derive(Clone)]
struct HealthState {
    storer: Arc<dyn Storer>,
    backend: StorerKind,
}

/// Health check endpoint for Docker/K8s liveness probes.
async fn health_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.storer.health_check().await {
        Ok(_) => {
            tracing::debug!("Health check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "service": "grants-service",
                    "backend": state.backend,
                    "version": env!("CARGO_PKG_VERSION")
                })),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - grant store unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "grants-service",
                    "backend": state.backend,
                    "error": e.to_string()
                })),
            )
        }
    }
}

/// Readiness check endpoint for K8s readiness probes.
async fn readiness_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.storer.health_check().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}

/// Operational routes: health, readiness and metrics.
pub fn router(storer: Arc<dyn Storer>, backend: StorerKind) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(HealthState { storer, backend })
}

/// Construct, connect and prepare the configured backend.
pub async fn build_storer(config: &GrantsConfig) -> Result<Arc<dyn Storer>, AppError> {
    let storer: Arc<dyn Storer> = match config.storer {
        StorerKind::Memory => {
            tracing::warn!("Using in-memory grant storer; grants are lost on restart");
            Arc::new(MemoryStorer::new())
        }
        StorerKind::Postgres => {
            let storer = PostgresStorer::connect(config.database()?).await.map_err(|e| {
                tracing::error!(error = %e, "Failed to connect to PostgreSQL");
                e
            })?;
            storer.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
            Arc::new(storer)
        }
        StorerKind::Mongodb => {
            let storer = MongoStorer::connect(config.mongodb()?).await?;
            storer.initialize_indexes().await?;
            Arc::new(storer)
        }
    };
    Ok(storer)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    storer: Arc<dyn Storer>,
    backend: StorerKind,
}

impl Application {
    /// Build the application with the configured backend.
    pub async fn build(config: GrantsConfig) -> Result<Self, AppError> {
        let storer = build_storer(&config).await?;
        Self::build_with_storer(config, storer).await
    }

    /// Build the application around an already prepared storer.
    pub async fn build_with_storer(
        config: GrantsConfig,
        storer: Arc<dyn Storer>,
    ) -> Result<Self, AppError> {
        init_metrics();

        let addr = format!("{}:{}", config.common.host, config.common.port);
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port = port, backend = ?config.storer, "Grants service listener bound");

        Ok(Self {
            port,
            listener,
            storer,
            backend: config.storer,
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get a handle to the grant storer.
    pub fn storer(&self) -> Arc<dyn Storer> {
        self.storer.clone()
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let http_router = router(self.storer, self.backend);

        tracing::info!(
            service = "grants-service",
            version = env!("CARGO_PKG_VERSION"),
            port = self.port,
            "Service ready to accept connections"
        );

        axum::serve(self.listener, http_router).await.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
