use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cluster_storage::transfer::channel;
use cluster_storage::{open_storages, ClusterConfig, Storage, StorageError, StorageRegistry};

/// Body chunks buffered between a serving task and its response.
const BODY_BUFFER: usize = 16;

#[derive(Clone)]
struct AppState {
    storages: Arc<Vec<Arc<dyn Storage>>>,
}

impl AppState {
    fn primary(&self) -> Result<Arc<dyn Storage>, HttpError> {
        self.storages
            .first()
            .cloned()
            .ok_or(HttpError(StatusCode::SERVICE_UNAVAILABLE, "no storage configured".into()))
    }
}

struct HttpError(StatusCode, String);

impl From<StorageError> for HttpError {
    fn from(e: StorageError) -> Self {
        HttpError(e.status_code(), e.to_string())
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        (self.0, self.1).into_response()
    }
}

async fn download(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    req: Parts,
) -> Result<Response, HttpError> {
    let storage = state.primary()?;
    let size = storage.size(&hash).await?;

    let cancel = CancellationToken::new();
    let (mut sink, pending) = channel(BODY_BUFFER, &cancel);
    tokio::spawn(async move {
        let result = storage
            .serve_download(&cancel, &mut sink, &req, &hash, size)
            .await;
        match &result {
            Ok(served) => tracing::debug!(hash = %hash, served, "download served"),
            Err(e) => tracing::warn!(hash = %hash, storage = %storage, error = %e, "download failed"),
        }
        sink.finish(result.map(|_| ()));
    });
    Ok(pending.into_response().await?)
}

async fn measure(
    State(state): State<AppState>,
    Path(size): Path<u32>,
    req: Parts,
) -> Result<Response, HttpError> {
    let storage = state.primary()?;

    let cancel = CancellationToken::new();
    let (mut sink, pending) = channel(BODY_BUFFER, &cancel);
    tokio::spawn(async move {
        let result = storage.serve_measure(&cancel, &mut sink, &req, size).await;
        if let Err(e) = &result {
            tracing::warn!(size, storage = %storage, error = %e, "measure failed");
        }
        sink.finish(result);
    });
    Ok(pending.into_response().await?)
}

fn fail(context: &str, e: StorageError) -> ! {
    tracing::error!(error = %e, "{}", context);
    std::process::exit(e.exit_code());
}

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cluster_storage=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Get config path from environment or use default
    let config_path = std::env::var("NODE_CONFIG").unwrap_or_else(|_| "config.yaml".to_string());
    let config = match ClusterConfig::load(&config_path).await {
        Ok(config) => config,
        Err(e) => fail("Failed to load configuration", e),
    };
    tracing::info!("Loaded {} storage entries from {}", config.storages.len(), config_path);

    let ctx = config.init_context();
    let shutdown = ctx.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutting down");
        }
        shutdown.cancel();
    });

    let registry = StorageRegistry::with_builtin();
    let storages = match open_storages(&registry, &config, &ctx).await {
        Ok(storages) => storages,
        Err(e) => fail("Failed to initialize storages", e),
    };
    if storages.is_empty() {
        tracing::warn!("No storages configured; every request will fail");
    }
    let state = AppState {
        storages: Arc::new(storages),
    };

    let app = Router::new()
        .route("/download/:hash", get(download))
        .route("/measure/:size", get(measure))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let listen = std::env::var("NODE_LISTEN").unwrap_or_else(|_| "0.0.0.0:4000".to_string());
    let addr: SocketAddr = match listen.parse() {
        Ok(addr) => addr,
        Err(e) => fail(
            "Invalid NODE_LISTEN",
            StorageError::Config(format!("{:?}: {}", listen, e)),
        ),
    };
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => fail("Failed to bind listener", StorageError::Io(e)),
    };
    tracing::info!("Storage node listening on http://{}", addr);

    let cancel = ctx.cancel.clone();
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
    {
        fail("Server error", StorageError::Io(e));
    }
}
