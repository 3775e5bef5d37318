//! API server setup and configuration.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::{DefaultBodyLimit, Request};
use axum::response::Response;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{
    DefaultMakeSpan, DefaultOnFailure, DefaultOnRequest, DefaultOnResponse, MakeSpan, OnFailure,
    OnRequest, OnResponse, TraceLayer,
};
use tracing::{Level, Span};

use crate::admission::RateLimiter;
use crate::api::routes;
use crate::error::Result;
use crate::jobs::{ConversionOrchestrator, JobStore};
use crate::logging::LoggingConfig;
use crate::storage::ArtifactStore;
use crate::sweeper::{RetentionConfig, RetentionSweeper};

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Server bind address
    pub bind_address: String,
    /// Server port
    pub port: u16,
    /// Enable CORS
    pub enable_cors: bool,
    /// Request body size limit in bytes
    pub body_limit: usize,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 12556,
            enable_cors: true,
            body_limit: 100 * 1024 * 1024,
        }
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Server start time for uptime calculation
    pub start_time: Instant,
    /// Per-client admission control for conversion requests
    pub rate_limiter: Arc<RateLimiter>,
    pub job_store: Arc<JobStore>,
    pub artifacts: Arc<ArtifactStore>,
    pub sweeper: Arc<RetentionSweeper>,
    pub orchestrator: Arc<ConversionOrchestrator>,
    /// Artifact lifetimes (download cleanup delay, input delay)
    pub retention: RetentionConfig,
    /// Logging configuration for dynamic log level changes
    pub logging_config: Option<Arc<LoggingConfig>>,
}

fn is_health_path(req: &Request) -> bool {
    req.uri().path().starts_with("/health")
}

/// Request span, disabled for health checks so nothing below it logs.
fn request_span(req: &Request) -> Span {
    if is_health_path(req) {
        return Span::none();
    }
    DefaultMakeSpan::new().level(Level::INFO).make_span(req)
}

fn log_request(req: &Request, span: &Span) {
    if !span.is_disabled() {
        DefaultOnRequest::new().level(Level::INFO).on_request(req, span);
    }
}

fn log_response(res: &Response, latency: Duration, span: &Span) {
    if !span.is_disabled() {
        DefaultOnResponse::new()
            .level(Level::INFO)
            .on_response(res, latency, span);
    }
}

fn log_failure(class: ServerErrorsFailureClass, latency: Duration, span: &Span) {
    if !span.is_disabled() {
        DefaultOnFailure::new()
            .level(Level::ERROR)
            .on_failure(class, latency, span);
    }
}

/// API server.
pub struct ApiServer {
    config: ApiServerConfig,
    state: AppState,
    cancel_token: CancellationToken,
}

impl ApiServer {
    /// Create with application state.
    pub fn with_state(config: ApiServerConfig, state: AppState) -> Self {
        Self {
            config,
            state,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Get the cancellation token for graceful shutdown.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Build the router with all middleware and routes.
    pub fn build_router(&self) -> Router {
        let mut router = routes::create_router(self.state.clone())
            .layer(DefaultBodyLimit::max(self.config.body_limit));

        if self.config.enable_cors {
            let cors = CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any);
            router = router.layer(cors);
        }

        // Health checks are polled constantly; keep them out of the logs.
        router.layer(
            TraceLayer::new_for_http()
                .make_span_with(request_span)
                .on_request(log_request)
                .on_response(log_response)
                .on_failure(log_failure),
        )
    }

    /// Start the server. Returns once the cancel token fires and in-flight
    /// requests have finished.
    pub async fn run(&self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind_address, self.config.port)
            .parse()
            .map_err(|e| crate::error::Error::ApiError(format!("Invalid address: {}", e)))?;

        let router = self.build_router();
        let listener = TcpListener::bind(addr).await?;

        tracing::info!("API server listening on http://{}", addr);

        let cancel_token = self.cancel_token.clone();

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            cancel_token.cancelled().await;
            tracing::info!("API server shutting down...");
        })
        .await
        .map_err(|e| crate::error::Error::ApiError(format!("Server error: {}", e)))?;

        Ok(())
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}
