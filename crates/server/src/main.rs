mod api;
mod config;
mod snapshot;
mod state;

use std::sync::Arc;

use axum::Router;
use parking_lot::RwLock;
use tower_http::request_id::{MakeRequestUuid, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use api::api_router;
use config::{config_path_from_env, engine_config, load_or_create_config, resolve_path};
use library::Library;
use state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = config_path_from_env();
    let (config, created) = load_or_create_config(&config_path)?;
    if created {
        info!("Created default config at {:?}", config_path);
    } else {
        info!("Loaded config from {:?}", config_path);
    }

    let library = Library::new(engine_config(&config))?;
    let snapshot_path = resolve_path(&config_path, &config.snapshot_path);
    if let Some(tracks) = snapshot::load_snapshot(&snapshot_path).await {
        library.restore(tracks);
    }

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let state = AppState {
        library,
        config: Arc::new(RwLock::new(config.clone())),
        snapshot_path,
    };
    snapshot::spawn_persistence(&state);

    if config.scan_on_start {
        if config.root_urls.is_empty() {
            info!("No scan roots configured yet; POST /api/v1/scan with roots to index.");
        } else {
            let _ = state.library.scan(config.root_urls.clone());
        }
    }

    let app = Router::new()
        .nest("/api/v1", api_router(state.clone()))
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Listening on {}", bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.library.clone()))
        .await?;
    Ok(())
}

async fn shutdown_signal(library: Library) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                warn!("Failed to install terminate signal handler: {}", err);
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", err);
        }
    }

    library.cancel_scan();
    info!("Shutdown signal received.");
}
