/**
 * MESH KERNEL - Point d'entrée du coordinateur
 *
 * RÔLE : Charge la configuration, assemble le cœur de coordination, démarre
 * les boucles de fond et sert l'API HTTP jusqu'à Ctrl-C.
 *
 * ARRÊT : le serveur HTTP s'arrête proprement, puis le superviseur annule
 * les boucles et attend la fin de leur lot en cours.
 */

use anyhow::Context;
use mesh_kernel::config::load_config;
use mesh_kernel::{Collaborators, MeshKernel};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mesh_kernel=info,audit=info")),
        )
        .init();

    let cfg = load_config().await.context("loading kernel configuration")?;
    let listen = cfg.listen.clone();
    tracing::info!(
        "{} scan range(s), {} service port(s), {} actor(s)",
        cfg.scan_ranges.len(),
        cfg.service_ports.len(),
        cfg.actors.len()
    );

    let deps = Collaborators::production(&cfg).context("building HTTP probe client")?;
    let mut kernel = MeshKernel::new(cfg, deps);
    kernel.start();

    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    tracing::info!("listening on http://{}", listen);

    axum::serve(listener, kernel.router())
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("cannot listen for ctrl-c: {}", e);
            }
            tracing::info!("shutdown requested");
        })
        .await
        .context("http server")?;

    kernel.shutdown().await;
    Ok(())
}
