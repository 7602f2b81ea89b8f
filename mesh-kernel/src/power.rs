/**
 * POWER CONTROLLER - Arrêt distant (SSH) et réveil (Wake-on-LAN)
 *
 * FONCTIONNEMENT :
 * - L'adresse de gestion, la MAC et l'utilisateur SSH viennent du NodeRecord ;
 *   `power.hosts` ne sert que de repli pour un nœud jamais vu
 * - shutdown : `sudo shutdown -h +N` via SSH, succès seulement si le code retour est 0
 * - wake : magic packet UDP broadcast, sans accusé de réception
 * - status : commande triviale via SSH ; timeout ou échec = Offline
 * - Toute exécution distante porte son propre timeout
 */

use futures::future::BoxFuture;
use serde::Serialize;
use std::ffi::OsString;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::process::Command;

use crate::config::PowerConf;
use crate::nodes::SharedNodeRegistry;

pub fn parse_mac(mac: &str) -> Result<[u8; 6], &'static str> {
    if mac.chars().any(|c| !(c.is_ascii_hexdigit() || c == ':' || c == '-')) {
        return Err("bad mac character");
    }
    let hex: String = mac.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    if hex.len() != 12 {
        return Err("bad mac len");
    }
    let mut out = [0u8; 6];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).map_err(|_| "bad mac hex")?;
    }
    Ok(out)
}

/// 6 × 0xFF puis la MAC répétée 16 fois.
pub fn magic_packet(mac: [u8; 6]) -> [u8; 102] {
    let mut pkt = [0xFFu8; 102];
    for chunk in pkt[6..].chunks_exact_mut(6) {
        chunk.copy_from_slice(&mac);
    }
    pkt
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    Online,
    Offline,
    Unknown,
}

#[derive(Debug, thiserror::Error)]
pub enum PowerError {
    #[error("unknown node '{0}'")]
    UnknownNode(String),
    #[error("no MAC address known for '{0}'")]
    NoMac(String),
    #[error("invalid MAC for '{node}': {reason}")]
    InvalidMac { node: String, reason: &'static str },
    #[error("no management address known for '{0}'")]
    NoManagementAddress(String),
    #[error("remote command failed: {0}")]
    Remote(String),
    #[error("remote command timed out after {0:?}")]
    Timeout(Duration),
    #[error("unsupported action '{0}'")]
    UnsupportedAction(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PowerError {
    pub fn code(&self) -> &'static str {
        match self {
            PowerError::UnknownNode(_) => "unknown_node",
            PowerError::NoMac(_) | PowerError::InvalidMac { .. } => "no_mac",
            PowerError::NoManagementAddress(_) => "no_management_address",
            PowerError::Remote(_) => "remote_failed",
            PowerError::Timeout(_) => "remote_timeout",
            PowerError::UnsupportedAction(_) => "unsupported_action",
            PowerError::Io(_) => "io_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub host: String,
    pub user: String,
}

#[derive(Debug, Clone)]
pub struct RemoteOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Canal d'exécution distante.
pub trait RemoteExecutor: Send + Sync {
    fn run<'a>(
        &'a self,
        target: &'a RemoteTarget,
        command: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<RemoteOutput, PowerError>>;
}

pub type SharedExecutor = Arc<dyn RemoteExecutor>;

pub struct SshExecutor {
    key: Option<PathBuf>,
    connect_timeout: Duration,
}

impl SshExecutor {
    pub fn new(cfg: &PowerConf) -> Self {
        Self {
            key: cfg.ssh_key.as_ref().map(PathBuf::from),
            connect_timeout: Duration::from_secs(cfg.ssh_connect_timeout_secs),
        }
    }

    /// Arguments ssh ; `--` sépare les options de la destination.
    fn ssh_args(&self, target: &RemoteTarget, command: &str) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)).into(),
        ];
        if let Some(key) = &self.key {
            args.push("-i".into());
            args.push(key.clone().into_os_string());
        }
        args.push("--".into());
        args.push(format!("{}@{}", target.user, target.host).into());
        args.push(command.into());
        args
    }

    async fn exec(&self, target: &RemoteTarget, command: &str, timeout: Duration) -> Result<RemoteOutput, PowerError> {
        let mut cmd = Command::new("ssh");
        cmd.args(self.ssh_args(target, command))
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| PowerError::Timeout(timeout))??;

        Ok(RemoteOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

impl RemoteExecutor for SshExecutor {
    fn run<'a>(
        &'a self,
        target: &'a RemoteTarget,
        command: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<RemoteOutput, PowerError>> {
        Box::pin(self.exec(target, command, timeout))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WakeReport {
    pub node_id: String,
    pub mac: String,
    pub broadcast: Ipv4Addr,
    pub port: u16,
}

/// Ce qu'on sait d'un nœud pour agir dessus.
#[derive(Debug, Clone, Default)]
struct Resolved {
    mac: Option<String>,
    address: Option<String>,
    user: Option<String>,
    broadcast: Option<Ipv4Addr>,
}

pub struct PowerController {
    nodes: SharedNodeRegistry,
    cfg: PowerConf,
    executor: SharedExecutor,
}

impl PowerController {
    pub fn new(nodes: SharedNodeRegistry, cfg: PowerConf, executor: SharedExecutor) -> Self {
        Self { nodes, cfg, executor }
    }

    fn resolve(&self, node_id: &str) -> Result<Resolved, PowerError> {
        let record = self.nodes.get(node_id);
        let host = self.cfg.hosts.get(node_id);
        if record.is_none() && host.is_none() {
            return Err(PowerError::UnknownNode(node_id.to_string()));
        }

        let mut resolved = Resolved::default();
        if let Some(rec) = &record {
            resolved.mac = rec.mac.clone();
            resolved.address = rec.management_target();
            resolved.user = rec.ssh_user.clone();
        }
        if let Some(host) = host {
            resolved.mac = resolved.mac.or_else(|| host.mac.clone());
            resolved.address = resolved.address.or_else(|| host.address.clone());
            resolved.broadcast = host.broadcast;
        }
        Ok(resolved)
    }

    fn remote_target(&self, node_id: &str, resolved: Resolved) -> Result<RemoteTarget, PowerError> {
        let host = resolved
            .address
            .ok_or_else(|| PowerError::NoManagementAddress(node_id.to_string()))?;
        Ok(RemoteTarget {
            host,
            user: resolved.user.unwrap_or_else(|| self.cfg.ssh_user.clone()),
        })
    }

    /// Programme un arrêt différé. Irréversible une fois accepté par la machine.
    pub async fn shutdown(&self, node_id: &str, delay_minutes: u32) -> Result<(), PowerError> {
        let target = self.remote_target(node_id, self.resolve(node_id)?)?;
        let command = format!("sudo shutdown -h +{}", delay_minutes);
        let timeout = Duration::from_secs(self.cfg.shutdown_timeout_secs);

        tracing::info!("scheduling shutdown of {} ({}) in {} min", node_id, target.host, delay_minutes);
        let out = self.executor.run(&target, &command, timeout).await?;
        if !out.success {
            let detail = if out.stderr.is_empty() { out.stdout } else { out.stderr };
            return Err(PowerError::Remote(detail));
        }
        Ok(())
    }

    pub async fn wake(&self, node_id: &str) -> Result<WakeReport, PowerError> {
        let resolved = self.resolve(node_id)?;
        let mac_txt = resolved
            .mac
            .ok_or_else(|| PowerError::NoMac(node_id.to_string()))?;
        let mac = parse_mac(&mac_txt).map_err(|reason| PowerError::InvalidMac {
            node: node_id.to_string(),
            reason,
        })?;
        let broadcast = resolved.broadcast.unwrap_or(self.cfg.broadcast);
        let port = self.cfg.wol_port;

        let sock = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        sock.set_broadcast(true)?;
        sock.send_to(&magic_packet(mac), SocketAddrV4::new(broadcast, port)).await?;

        tracing::info!("magic packet sent for {} ({}) to {}:{}", node_id, mac_txt, broadcast, port);
        Ok(WakeReport {
            node_id: node_id.to_string(),
            mac: mac_txt,
            broadcast,
            port,
        })
    }

    pub async fn status(&self, node_id: &str) -> PowerState {
        let target = match self.resolve(node_id).and_then(|r| self.remote_target(node_id, r)) {
            Ok(target) => target,
            Err(e) => {
                tracing::debug!("status of {}: {}", node_id, e);
                return PowerState::Unknown;
            }
        };
        let timeout = Duration::from_secs(self.cfg.status_timeout_secs);
        match self.executor.run(&target, "true", timeout).await {
            Ok(out) if out.success => PowerState::Online,
            Ok(_) => PowerState::Offline,
            Err(e) => {
                tracing::debug!("status of {}: {}", node_id, e);
                PowerState::Offline
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConf;
    use crate::models::HandshakeRequest;
    use crate::nodes::NodeRegistry;
    use crate::state::system_clock;
    use parking_lot::Mutex;
    use serde_json::json;

    /// Exécuteur factice : enregistre les appels, répond selon `mode`.
    struct FakeExecutor {
        calls: Mutex<Vec<(RemoteTarget, String, Duration)>>,
        mode: Mode,
    }

    enum Mode {
        Succeed,
        Refuse,
        Hang,
    }

    impl FakeExecutor {
        fn new(mode: Mode) -> Arc<Self> {
            Arc::new(Self { calls: Mutex::new(Vec::new()), mode })
        }
    }

    impl RemoteExecutor for FakeExecutor {
        fn run<'a>(
            &'a self,
            target: &'a RemoteTarget,
            command: &'a str,
            timeout: Duration,
        ) -> BoxFuture<'a, Result<RemoteOutput, PowerError>> {
            self.calls.lock().push((target.clone(), command.to_string(), timeout));
            Box::pin(async move {
                match self.mode {
                    Mode::Succeed => Ok(RemoteOutput { success: true, stdout: String::new(), stderr: String::new() }),
                    Mode::Refuse => Ok(RemoteOutput {
                        success: false,
                        stdout: String::new(),
                        stderr: "sudo: a password is required".into(),
                    }),
                    Mode::Hang => Err(PowerError::Timeout(timeout)),
                }
            })
        }
    }

    fn nodes_with(node_id: &str, extra: serde_json::Value) -> SharedNodeRegistry {
        let nodes = Arc::new(NodeRegistry::new(time::Duration::seconds(300), system_clock()));
        let mut body = json!({
            "node_id": node_id,
            "timestamp": "2025-03-01T08:00:00Z",
            "status": "active",
            "ip": "192.168.1.40"
        });
        if let (Some(obj), Some(more)) = (body.as_object_mut(), extra.as_object()) {
            obj.extend(more.clone());
        }
        let hs = HandshakeRequest::from_slice(&serde_json::to_vec(&body).unwrap())
            .unwrap()
            .validate()
            .unwrap();
        nodes.heartbeat(hs);
        nodes
    }

    #[test]
    fn test_magic_packet_layout() {
        let mac = parse_mac("30:9c:23:5f:44:a8").unwrap();
        let pkt = magic_packet(mac);
        assert_eq!(pkt.len(), 102);
        assert!(pkt[..6].iter().all(|b| *b == 0xFF));
        for i in 0..16 {
            assert_eq!(&pkt[6 + i * 6..12 + i * 6], &mac);
        }
    }

    #[test]
    fn test_parse_mac_formats() {
        assert_eq!(parse_mac("30-9C-23-5F-44-A8"), Ok([0x30, 0x9c, 0x23, 0x5f, 0x44, 0xa8]));
        assert_eq!(parse_mac("309c235f44a8"), Ok([0x30, 0x9c, 0x23, 0x5f, 0x44, 0xa8]));
        assert!(parse_mac("30:9c:23").is_err());
        assert!(parse_mac("zz:9c:23:5f:44:a8").is_err());
    }

    #[tokio::test]
    async fn test_shutdown_uses_node_metadata() {
        let nodes = nodes_with("rx-node", json!({"management_address": "rx.lan", "ssh_user": "ops"}));
        let exec = FakeExecutor::new(Mode::Succeed);
        let power = PowerController::new(nodes, PowerConf::default(), exec.clone());

        power.shutdown("rx-node", 5).await.unwrap();

        let calls = exec.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, RemoteTarget { host: "rx.lan".into(), user: "ops".into() });
        assert_eq!(calls[0].1, "sudo shutdown -h +5");
        assert_eq!(calls[0].2, Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_shutdown_refused_is_error() {
        let nodes = nodes_with("rx-node", json!({}));
        let power = PowerController::new(nodes, PowerConf::default(), FakeExecutor::new(Mode::Refuse));
        let err = power.shutdown("rx-node", 1).await.unwrap_err();
        assert!(matches!(err, PowerError::Remote(ref m) if m.contains("password")));
    }

    #[tokio::test]
    async fn test_shutdown_unknown_node() {
        let nodes = nodes_with("rx-node", json!({}));
        let power = PowerController::new(nodes, PowerConf::default(), FakeExecutor::new(Mode::Succeed));
        let err = power.shutdown("ghost", 1).await.unwrap_err();
        assert_eq!(err.code(), "unknown_node");
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let nodes = nodes_with("rx-node", json!({}));
        let online = PowerController::new(nodes.clone(), PowerConf::default(), FakeExecutor::new(Mode::Succeed));
        assert_eq!(online.status("rx-node").await, PowerState::Online);
        assert_eq!(online.status("ghost").await, PowerState::Unknown);

        let hanging = PowerController::new(nodes, PowerConf::default(), FakeExecutor::new(Mode::Hang));
        assert_eq!(hanging.status("rx-node").await, PowerState::Offline);
    }

    #[tokio::test]
    async fn test_wake_sends_magic_packet() {
        let receiver = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = receiver.local_addr().unwrap().port();

        let nodes = nodes_with("pi-node", json!({"mac": "b8:27:eb:12:34:56"}));
        let cfg = PowerConf {
            broadcast: Ipv4Addr::LOCALHOST,
            wol_port: port,
            ..PowerConf::default()
        };
        let power = PowerController::new(nodes, cfg, FakeExecutor::new(Mode::Succeed));

        let report = power.wake("pi-node").await.unwrap();
        assert_eq!(report.port, port);

        let mut buf = [0u8; 128];
        let (n, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(n, 102);
        assert_eq!(&buf[6..12], &[0xb8, 0x27, 0xeb, 0x12, 0x34, 0x56]);
    }

    #[tokio::test]
    async fn test_wake_falls_back_to_static_hosts() {
        let nodes = Arc::new(NodeRegistry::new(time::Duration::seconds(300), system_clock()));
        let mut cfg = PowerConf::default();
        cfg.hosts.insert(
            "nas".into(),
            HostConf { mac: None, address: Some("192.168.1.50".into()), broadcast: None },
        );
        let power = PowerController::new(nodes, cfg, FakeExecutor::new(Mode::Succeed));

        let err = power.wake("nas").await.unwrap_err();
        assert!(matches!(err, PowerError::NoMac(_)));
        assert_eq!(power.status("nas").await, PowerState::Online);
    }

    #[test]
    fn test_ssh_destination_follows_option_terminator() {
        let ssh = SshExecutor::new(&PowerConf {
            ssh_key: Some("/etc/mesh/id_ed25519".into()),
            ..PowerConf::default()
        });
        let target = RemoteTarget { host: "192.168.1.20".into(), user: "pi".into() };
        let args: Vec<String> = ssh
            .ssh_args(&target, "true")
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        let sep = args.iter().position(|a| a == "--").unwrap();
        assert_eq!(&args[sep + 1..], &["pi@192.168.1.20".to_string(), "true".to_string()]);
        assert!(args[..sep].contains(&"-i".to_string()));
        assert!(args[..sep].iter().all(|a| !a.contains("pi@")));
    }
}
