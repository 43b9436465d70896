use std::sync::Arc;
use std::time::Duration;

use eyre::WrapErr;
use salvo::prelude::*;

use moondream_server::config::Config;
use moondream_server::engines::MoondreamEngine;
use moondream_server::inference::{ServiceOptions, VisionService};
use moondream_server::model_config::ModelFiles;
use moondream_server::router;
use moondream_server::state::AppState;

/// Time in-flight responses get to finish after Ctrl-C
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> eyre::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "moondream_server=info".into()),
        )
        .init();

    let config = Config::from_env().wrap_err("Invalid server configuration")?;
    tracing::info!("Models directory: {:?}", config.models_dir);

    let files = ModelFiles::resolve(&config).await?;
    let generation = config.generation.clone();
    let engine = tokio::task::spawn_blocking(move || MoondreamEngine::load(&files, generation))
        .await
        .wrap_err("Model loading task panicked")?
        .wrap_err("Failed to load moondream model")?;

    let service = Arc::new(VisionService::new(
        Arc::new(engine),
        ServiceOptions::from(&config),
    ));
    let state = AppState::new(service.clone(), config.max_body_size);
    let router = router::build_router(state);

    let listen_addr = config.listen_addr();
    let acceptor = TcpListener::new(listen_addr).bind().await;
    let server = Server::new(acceptor);

    let handle = server.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            service.shutdown();
            handle.stop_graceful(SHUTDOWN_GRACE);
        }
    });

    tracing::info!("HTTP server listening on http://{}", listen_addr);
    tracing::info!("Endpoints:");
    tracing::info!("  GET  /health");
    tracing::info!("  POST /query");
    tracing::info!("  POST /query/stream");
    tracing::info!("  POST /caption");
    tracing::info!("  POST /caption/stream");

    server.serve(router).await;
    tracing::info!("Server stopped");

    Ok(())
}
