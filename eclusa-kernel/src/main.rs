/**
 * ECLUSA KERNEL - Point d'entrée du serveur d'ingestion PLC
 *
 * RÔLE : Charger la config, ouvrir le store, câbler le pipeline, puis servir
 * le port TCP des PLC et l'API REST jusqu'à Ctrl-C.
 *
 * ARRÊT : Ctrl-C -> stop du serveur TCP (connexions fermées) -> vidage de la
 * file de persistance -> arrêt de l'API HTTP.
 */

use anyhow::Context;
use eclusa_kernel::config::load_config;
use eclusa_kernel::http::{build_router, AppState};
use eclusa_kernel::Kernel;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    let loaded = load_config().await;
    let config = loaded.config;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
    for warning in &loaded.warnings {
        tracing::warn!("{warning}");
    }

    let store = Kernel::open_store(&config).context("failed to open fault store")?;
    let kernel = Kernel::build(config, store);
    tracing::info!(
        definitions = kernel.definitions.len(),
        source = ?kernel.definitions.source(),
        plc = %kernel.config.tcp.bind_addr(),
        "eclusa kernel ready"
    );

    // TCP PLC : une erreur de bind est fatale
    let mut tcp = tokio::spawn({
        let server = kernel.server.clone();
        async move { server.start().await }
    });

    // HTTP
    let http_stop = CancellationToken::new();
    let http = match kernel.config.http.clone() {
        Some(http_conf) => {
            let addr = http_conf.bind_addr();
            let listener = TcpListener::bind(&addr).await.with_context(|| format!("failed to bind http on {addr}"))?;
            tracing::info!(%addr, "http api listening");
            let app = build_router(AppState::from_env(kernel.clone()));
            let stop = http_stop.clone();
            Some(tokio::spawn(async move {
                axum::serve(listener, app).with_graceful_shutdown(stop.cancelled_owned()).await
            }))
        }
        None => None,
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for ctrl-c")?;
            tracing::info!("shutdown requested");
        }
        joined = &mut tcp => {
            let served = joined.context("tcp server task panicked")?;
            served.context("tcp server failed")?;
        }
    }

    kernel.shutdown().await;
    http_stop.cancel();
    if let Some(handle) = http {
        handle.await.context("http task panicked")?.context("http server failed")?;
    }
    tracing::info!("eclusa kernel stopped");
    Ok(())
}
