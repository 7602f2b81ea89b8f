/**
 * PROBE - Vérification de vie d'un service (TCP puis HTTP)
 *
 * FONCTIONNEMENT :
 * - Connexion TCP nue avec timeout
 * - Puis GET {health_path} avec un timeout de requête plus court
 * - Succès strictement sur HTTP 200 ; tout le reste = Unreachable
 * - Aucune retentative ici : c'est le rôle du Health Monitor périodique
 */

use futures::future::BoxFuture;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeFailure {
    Connect(String),
    ConnectTimeout,
    Http(String),
    /// Le listener répond, mais pas 200.
    Status(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Reachable { latency: Duration },
    Unreachable(ProbeFailure),
}

impl ProbeOutcome {
    pub fn is_reachable(&self) -> bool {
        matches!(self, ProbeOutcome::Reachable { .. })
    }
}

pub trait Probe: Send + Sync {
    fn probe(&self, address: IpAddr, port: u16) -> BoxFuture<'_, ProbeOutcome>;
}

pub type SharedProbe = Arc<dyn Probe>;

pub struct HttpProbe {
    client: reqwest::Client,
    health_path: String,
    connect_timeout: Duration,
}

impl HttpProbe {
    pub fn new(
        health_path: &str,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            health_path: health_path.to_string(),
            connect_timeout,
        })
    }

    async fn run(&self, address: IpAddr, port: u16) -> ProbeOutcome {
        let target = SocketAddr::new(address, port);

        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(target)).await {
            Err(_) => return ProbeOutcome::Unreachable(ProbeFailure::ConnectTimeout),
            Ok(Err(e)) => return ProbeOutcome::Unreachable(ProbeFailure::Connect(e.to_string())),
            Ok(Ok(stream)) => drop(stream),
        }

        let url = format!("http://{}{}", target, self.health_path);
        let started = Instant::now();
        match self.client.get(&url).send().await {
            Ok(resp) if resp.status() == reqwest::StatusCode::OK => ProbeOutcome::Reachable {
                latency: started.elapsed(),
            },
            Ok(resp) => ProbeOutcome::Unreachable(ProbeFailure::Status(resp.status().as_u16())),
            Err(e) => ProbeOutcome::Unreachable(ProbeFailure::Http(e.to_string())),
        }
    }
}

impl Probe for HttpProbe {
    fn probe(&self, address: IpAddr, port: u16) -> BoxFuture<'_, ProbeOutcome> {
        Box::pin(self.run(address, port))
    }
}

#[cfg(any(test, feature = "test-support"))]
pub use crate::fixtures::StaticProbe;
