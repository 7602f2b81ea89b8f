/**
 * MESH AGENT - Membre du cluster
 *
 * RÔLE : Identifie la machine (hostname, OS, IP et MAC principales), puis
 * envoie un handshake au coordinateur à intervalle régulier.
 *
 * FONCTIONNEMENT : un échec n'arrête pas la boucle ; il est compté et
 * journalisé avec l'heure du dernier handshake accepté. Ctrl-C termine.
 */

mod client;
mod config;
mod discovery;
mod metrics;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::client::{CoordinatorClient, HandshakePayload, Heartbeat};
use crate::config::AgentConfig;
use crate::discovery::SystemInfo;
use crate::metrics::Collector;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mesh_agent=info")))
        .init();

    let config = AgentConfig::load().await.context("loading agent configuration")?;
    let host = SystemInfo::discover().context("identifying host")?;
    let client = CoordinatorClient::new(&config).context("building coordinator client")?;

    info!(
        "agent {} reporting to {} every {:?}",
        config.node_id_or(&host.hostname),
        config.handshake_url(),
        config.interval()
    );

    let mut collector = Collector::new();
    let mut heartbeat = Heartbeat::default();
    let mut ticker = interval(config.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let payload = HandshakePayload::build(&config, &host, &collector.collect(), Utc::now());
                let outcome = client.send(&payload).await;
                heartbeat.record(&outcome, Utc::now());
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!("cannot listen for ctrl-c: {}", e);
                }
                break;
            }
        }
    }

    info!(
        "agent stopped ({} consecutive failure(s), last success: {})",
        heartbeat.consecutive_failures(),
        heartbeat
            .last_success()
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
    );
    Ok(())
}
