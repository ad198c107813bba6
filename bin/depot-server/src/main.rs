//! Depot server - S3-compatible artifact store with supply-chain
//! security
//!
//! Wires the components in dependency order: metadata store, storage
//! backend (retry-wrapped), object engine, auth, supply chain,
//! observability, then the HTTP dispatcher.

mod audit_middleware;
mod auth_middleware;
mod authz_middleware;
mod error;
mod metrics_middleware;
mod rbac;
mod s3;
mod state;
mod supplychain;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State},
    http::{StatusCode, header},
    middleware,
    response::IntoResponse,
    routing::{delete, get, head, post, put},
};
use clap::Parser;
use depot_auth::{AuditLogger, PolicyEngine, TokenValidator};
use depot_backend::azure::AzureBackend;
use depot_backend::gcs::GcsBackend;
use depot_backend::s3::S3Backend;
use depot_backend::{Backend, FilesystemBackend, RetryingBackend};
use depot_common::Config;
use depot_common::config::BackendKind;
use depot_engine::{ObjectEngine, spawn_sweeper};
use depot_meta::MetaStore;
use depot_observe::HealthState;
use depot_reliability::{BreakerConfig, BreakerRegistry, RetryPolicy};
use depot_supplychain::SupplyChainService;
use state::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "depot-server")]
#[command(about = "Depot artifact store server")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Listen address override (host:port)
    #[arg(short, long)]
    listen: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Prometheus metrics endpoint handler
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match &state.prometheus {
        Some(handle) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "text/plain; version=0.0.4; charset=utf-8",
            )],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let report = state.health.check().await;
    let status = if report.healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

async fn ready_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.health.ready().await {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn live_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let _ = state.health.live();
    (StatusCode::OK, "alive")
}

fn build_backend(config: &Config, breakers: &BreakerRegistry) -> Arc<dyn Backend> {
    let inner: Arc<dyn Backend> = match config.storage.backend {
        BackendKind::Filesystem => Arc::new(FilesystemBackend::new(
            &config.storage.root_directory,
            config.storage.enable_checksum,
        )),
        BackendKind::S3 => Arc::new(S3Backend::new(&config.storage.backend_config)),
        BackendKind::Gcs => Arc::new(GcsBackend::new(&config.storage.backend_config)),
        BackendKind::Azure => Arc::new(AzureBackend::new(&config.storage.backend_config)),
    };
    info!(backend = inner.name(), "storage backend selected");

    Arc::new(RetryingBackend::new(
        inner,
        RetryPolicy::from_config(&config.storage.retry),
        breakers,
        config.storage.retry_buffer_bytes,
    ))
}

fn build_router(state: Arc<AppState>, config: &Config) -> Router {
    let health_paths = &config.observability.health_paths;

    let mut router = Router::new()
        // Observability routes first: never authenticated, never audited
        .route(&health_paths.health, get(health_handler))
        .route(&health_paths.ready, get(ready_handler))
        .route(&health_paths.live, get(live_handler));
    if config.observability.prometheus_enabled {
        router = router.route(&config.observability.prometheus_path, get(metrics_handler));
    }

    router = router
        // S3 surface
        .route("/s3", get(s3::list_buckets))
        .route("/s3/{bucket}", put(s3::create_bucket))
        .route("/s3/{bucket}", delete(s3::delete_bucket))
        .route("/s3/{bucket}", head(s3::head_bucket))
        .route("/s3/{bucket}", get(s3::list_objects))
        // PUT /s3/{bucket}/{key}             - put object / copy
        // PUT ?uploadId=X&partNumber=N       - upload part
        .route("/s3/{bucket}/{*key}", put(s3::put_object))
        .route("/s3/{bucket}/{*key}", get(s3::get_object))
        .route("/s3/{bucket}/{*key}", head(s3::head_object))
        // DELETE /s3/{bucket}/{key}          - delete object
        // DELETE ?uploadId=X                 - abort multipart upload
        .route("/s3/{bucket}/{*key}", delete(s3::delete_object))
        // POST ?uploads                      - initiate multipart
        // POST ?uploadId=X                   - complete multipart
        .route("/s3/{bucket}/{*key}", post(s3::post_object))
        // RBAC surface
        .route("/rbac/policies", post(rbac::create_policy))
        .route("/rbac/policies", get(rbac::list_policies))
        .route("/rbac/policies/{id}", get(rbac::get_policy))
        .route("/rbac/policies/{id}", put(rbac::update_policy))
        .route("/rbac/policies/{id}", delete(rbac::delete_policy))
        .route("/rbac/authorize", post(rbac::authorize))
        .route("/rbac/audit", get(rbac::query_audit))
        // Supply-chain surface
        .route("/supplychain/sign/{bucket}/{*key}", post(supplychain::sign_artifact))
        .route("/supplychain/sign/{bucket}/{*key}", get(supplychain::list_signatures))
        .route("/supplychain/verify/{bucket}/{*key}", post(supplychain::verify_artifact))
        .route("/supplychain/sbom/{bucket}/{*key}", post(supplychain::attach_sbom))
        .route("/supplychain/sbom/{bucket}/{*key}", get(supplychain::get_sbom))
        .route(
            "/supplychain/attestations/{bucket}/{*key}",
            post(supplychain::add_attestation),
        )
        .route(
            "/supplychain/attestations/{bucket}/{*key}",
            get(supplychain::list_attestations),
        );

    // Middleware, innermost first: audit -> authorization -> token
    // validation -> metrics -> timeout -> request id
    router
        .layer(DefaultBodyLimit::max(config.server.max_body_bytes))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            audit_middleware::audit_layer,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            authz_middleware::authz_layer,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware::auth_layer,
        ))
        .layer(middleware::from_fn(metrics_middleware::metrics_layer))
        .layer(TimeoutLayer::new(Duration::from_secs(
            config.server.request_timeout_secs,
        )))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref()).context("loading configuration")?;
    depot_observe::init_tracing(&config.observability, &args.log_level);
    info!("starting depot server");

    let prometheus = if config.observability.prometheus_enabled {
        Some(
            depot_observe::install_prometheus()
                .map_err(|err| anyhow::anyhow!(err))
                .context("installing prometheus recorder")?,
        )
    } else {
        None
    };

    // Dependency order: metadata -> backend -> engine -> auth ->
    // supply chain -> observability -> dispatcher
    let meta = MetaStore::open(&config.metadata.db_path)
        .map_err(|err| anyhow::anyhow!("{err}"))
        .context("opening metadata store")?;
    info!(path = %config.metadata.db_path.display(), "metadata store open");

    let breakers = BreakerRegistry::new(BreakerConfig::default());
    let backend = build_backend(&config, &breakers);

    let engine = Arc::new(ObjectEngine::new(
        meta.clone(),
        backend.clone(),
        Duration::from_secs(config.storage.multipart_idle_secs),
    ));

    let policies = Arc::new(PolicyEngine::new(meta.clone()));
    let token_validator = Arc::new(TokenValidator::new(config.identity.clone(), &breakers));
    let audit = AuditLogger::spawn(meta.clone());
    let supply_chain = Arc::new(SupplyChainService::new(
        engine.clone(),
        config.supplychain.clone(),
    ));
    let health = HealthState::new(meta, backend, breakers);

    if config.identity.enabled {
        info!(issuer = %config.identity.issuer_url, "identity provider enabled");
    } else {
        warn!("identity provider disabled: all requests run as local admin");
    }
    if config.server.tls.is_some() {
        warn!("tls cert paths configured; terminate TLS at the ingress in front of this listener");
    }

    let shutdown = CancellationToken::new();
    let sweeper = spawn_sweeper(
        engine.clone(),
        Duration::from_secs(config.storage.sweep_interval_secs),
        shutdown.clone(),
    );

    let state = Arc::new(AppState {
        engine,
        supply_chain,
        policies,
        token_validator,
        audit,
        health,
        prometheus,
        identity: config.identity.clone(),
    });
    let app = build_router(state, &config);

    let addr: SocketAddr = args
        .listen
        .unwrap_or_else(|| format!("{}:{}", config.server.address, config.server.port))
        .parse()
        .context("invalid listen address")?;
    info!(%addr, "listening");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        tokio::signal::ctrl_c().await.ok();
        info!("shutting down");
    })
    .await?;

    shutdown.cancel();
    sweeper.await.ok();
    info!("server shut down gracefully");

    Ok(())
}
