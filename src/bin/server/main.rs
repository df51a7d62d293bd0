//! Historical Datastore HTTP server
//!
//! Wires the registry, storage, aggregation and broker-connector
//! components together and serves the HTTP API.
//!
//! # Endpoints
//!
//! - `GET|POST /registry`, `GET|PUT|DELETE /registry/{id}`,
//!   `GET /registry/{type}/{path}/{op}/{value}`
//! - `POST /data`, `POST /data/{id}`, `GET /data/{id}`
//! - `GET /aggr`, `GET /aggr/{path}/{op}/{value}`, `GET /aggr/{aggrid}/{uuid}`
//! - `GET /health`, `GET /metrics`, `GET /`
//!
//! # Configuration
//!
//! The configuration file path comes from the first CLI argument, the
//! `HDS_CONFIG` environment variable, or `conf/historical-datastore.toml`.

mod handlers;

use std::sync::Arc;

use axum::http::Method;
use axum::routing::{get, post};
use axum::Router;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
use uuid::Uuid;

use hds::aggregation::InfluxAggr;
use hds::config::{Config, RegistryBackendType};
use hds::data::client::InfluxDsn;
use hds::data::{HttpInfluxClient, Ingester, InfluxStorage, MqttConnector};
use hds::data::mqtt::MqttBrokerClient;
use hds::notify::Notifier;
use hds::registry::{LmdbRegistry, MemoryRegistry, Registry};

use handlers::AppState;

fn config_path() -> String {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("HDS_CONFIG").ok())
        .unwrap_or_else(|| "conf/historical-datastore.toml".to_string())
}

/// Build the application router
fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        // generic
        .route("/", get(handlers::index))
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::prom_metrics))
        // registry api
        .route(
            "/registry",
            get(handlers::registry_index).post(handlers::registry_create),
        )
        .route(
            "/registry/:id",
            get(handlers::registry_get)
                .put(handlers::registry_update)
                .delete(handlers::registry_delete),
        )
        .route(
            "/registry/:type/:path/:op/*value",
            get(handlers::registry_filter),
        )
        // data api
        .route("/data", post(handlers::data_submit_unaddressed))
        .route(
            "/data/:id",
            post(handlers::data_submit).get(handlers::data_query),
        )
        // aggregation api
        .route("/aggr", get(handlers::aggr_index))
        .route("/aggr/:aggrid/:uuid", get(handlers::aggr_get))
        .route("/aggr/:path/:op/*value", get(handlers::aggr_filter))
        .with_state(state)
        .layer(cors)
}

/// Graceful shutdown on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutting down");
}

async fn run() -> hds::Result<()> {
    let config = Config::from_file(config_path())?;

    // registry and its notification bus
    let notifier = Arc::new(Notifier::new());
    let registry: Arc<dyn Registry> = match config.registry.backend.backend_type {
        RegistryBackendType::Memory => Arc::new(MemoryRegistry::new(
            config.registry.retention_periods.clone(),
            notifier.clone(),
        )),
        RegistryBackendType::Lmdb => Arc::new(LmdbRegistry::open(
            &config.registry.backend.dsn,
            config.registry.retention_periods.clone(),
            notifier.clone(),
        )?),
    };

    // data and aggregation backends
    let dsn = InfluxDsn::parse(&config.data.backend.dsn)?;
    let database = dsn.database.clone();
    let client = Arc::new(HttpInfluxClient::new(dsn));
    let storage = InfluxStorage::new(
        client,
        database,
        config.registry.retention_periods.clone(),
    );
    let aggr = InfluxAggr::new(storage.clone(), &config.aggregation);

    // broker connector
    let connector = MqttConnector::new(
        storage.clone(),
        Arc::new(MqttBrokerClient::new()),
        Uuid::new_v4().to_string(),
    );

    // subscribers, in fan-out order
    notifier.subscribe(storage.clone());
    notifier.subscribe(aggr.clone());
    notifier.subscribe(connector.clone());

    connector.clone().start(registry.clone()).await?;

    let ingester = Ingester::new(
        registry.clone(),
        storage.clone(),
        config.data.auto_registration,
    );

    let addr = format!("{}:{}", config.http.bind_addr, config.http.bind_port);
    let state = Arc::new(AppState { registry, ingester, aggr, config });
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| hds::Error::Internal(format!("cannot bind {addr}: {e}")))?;
    info!(%addr, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| hds::Error::Internal(format!("server error: {e}")))?;

    info!("stopped");
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting historical datastore"
    );

    if let Err(e) = run().await {
        error!(error = %e, "fatal");
        std::process::exit(1);
    }
}
