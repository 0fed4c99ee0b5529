//! Per-network lifecycle controller.
//!
//! Drives one network from `Uninitialized` to `Ready`: backend config in
//! the KV, a supervised VXLAN daemon child, the env file it writes, the
//! address pool for the host subnet and the bridge with its route and
//! iptables rules. Deletion runs the same steps in reverse, best-effort.

use crate::core::error::{DriverError, Result};
use crate::ipam::pool::AddressPool;
use crate::ipam::subnet::subnet_to_key;
use crate::kv::{Compare, KvClient, TxnOp, TxnRequest};
use crate::network::bridge::BridgeInterface;
use crate::network::endpoint::Endpoint;
use crate::network::envfile;
use crate::network::netlink::Netlink;
use crate::network::NetworkInfo;
use crate::sync::ConcurrentMap;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// The daemon must report within this window or it is killed.
const BOOTSTRAP_TIMEOUT: Duration = Duration::from_millis(1500);

/// Substring of daemon output that signals successful startup.
const BOOTSTRAP_MARKER: &str = "bootstrap done";

/// How long the env file may take to appear after bootstrap.
const ENV_FILE_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle phase of one network on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    EnsuringConfig,
    RunningDaemon,
    Ready,
    Deleting,
    Deleted,
}

/// Host-wide knobs shared by all network controllers.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub daemon_path: PathBuf,
    pub env_dir: PathBuf,
    pub flannel_options: Vec<String>,
    pub host_subnet_size: u8,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            daemon_path: PathBuf::from("/flanneld"),
            env_dir: PathBuf::from(crate::core::config::FLANNEL_ENV_DIR),
            flannel_options: Vec::new(),
            host_subnet_size: 25,
        }
    }
}

/// Backend configuration stored at `networks/<flannel-id>/config`, read by
/// every other host of the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(rename = "Network")]
    pub network: String,
    #[serde(rename = "SubnetLen")]
    pub subnet_len: u8,
    #[serde(rename = "Backend")]
    pub backend: BackendConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(rename = "Type")]
    pub backend_type: String,
}

impl NetworkConfig {
    pub fn vxlan(network: Ipv4Net, subnet_len: u8) -> Self {
        Self {
            network: network.to_string(),
            subnet_len,
            backend: BackendConfig {
                backend_type: "vxlan".to_string(),
            },
        }
    }
}

struct Inner {
    phase: Phase,
    daemon: Option<Child>,
    info: Option<NetworkInfo>,
    pool: Option<Arc<AddressPool>>,
    bridge: Option<Arc<BridgeInterface>>,
    config_mod_revision: i64,
}

/// One overlay network on this host.
pub struct FlannelNetwork {
    flannel_id: String,
    network: Ipv4Net,
    vni: u32,
    options: ControllerOptions,
    /// Scoped to `networks/<flannel-id>`.
    client: KvClient,
    netlink: Netlink,
    endpoints: ConcurrentMap<String, Arc<Endpoint>>,
    inner: Mutex<Inner>,
}

impl FlannelNetwork {
    pub fn new(
        client: KvClient,
        netlink: Netlink,
        flannel_id: impl Into<String>,
        network: Ipv4Net,
        vni: u32,
        options: ControllerOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            flannel_id: flannel_id.into(),
            network,
            vni,
            options,
            client,
            netlink,
            endpoints: ConcurrentMap::new(),
            inner: Mutex::new(Inner {
                phase: Phase::Uninitialized,
                daemon: None,
                info: None,
                pool: None,
                bridge: None,
                config_mod_revision: 0,
            }),
        })
    }

    pub fn flannel_id(&self) -> &str {
        &self.flannel_id
    }

    pub async fn phase(&self) -> Phase {
        self.inner.lock().await.phase
    }

    /// Facts about the ready network, if it is ready.
    pub async fn info(&self) -> Option<NetworkInfo> {
        self.inner.lock().await.info.clone()
    }

    pub async fn pool(&self) -> Option<Arc<AddressPool>> {
        self.inner.lock().await.pool.clone()
    }

    /// Converge this network to `Ready`. Idempotent; safe to call again
    /// after a failure, picking up at the step that failed.
    pub async fn ensure(&self) -> Result<NetworkInfo> {
        let mut inner = self.inner.lock().await;

        let daemon_running = match inner.daemon.as_mut() {
            Some(child) => child.try_wait()?.is_none(),
            None => false,
        };
        if inner.phase == Phase::Ready && daemon_running {
            return Ok(inner.info.clone().expect("ready network has info"));
        }

        inner.phase = Phase::EnsuringConfig;
        self.ensure_config(&mut inner).await?;

        if !daemon_running {
            let child = self.start_daemon().await?;
            inner.daemon = Some(child);
        }
        inner.phase = Phase::RunningDaemon;

        let env = envfile::wait_and_parse(&self.env_file(), ENV_FILE_TIMEOUT).await?;
        if env.network != self.network {
            return Err(DriverError::Conflict(format!(
                "daemon env reports network {} but {} is expected for {}",
                env.network, self.network, self.flannel_id
            )));
        }

        let info = NetworkInfo {
            flannel_id: self.flannel_id.clone(),
            network: self.network,
            host_subnet: env.host_subnet,
            local_gateway: env.gateway,
            mtu: env.mtu,
            vni: self.vni,
        };

        if inner.pool.is_none() {
            let pool_client = self
                .client
                .sub(&["host-subnets", &subnet_to_key(&env.host_subnet)]);
            let pool = AddressPool::new(
                self.flannel_id.clone(),
                env.host_subnet,
                env.gateway,
                pool_client,
            )
            .await?;
            inner.pool = Some(pool);
        }

        let bridge = Arc::new(BridgeInterface::new(self.netlink.clone(), info.clone()));
        bridge.ensure().await?;
        inner.bridge = Some(bridge);

        inner.info = Some(info.clone());
        inner.phase = Phase::Ready;
        info!(flannel_id = %self.flannel_id, subnet = %info.host_subnet, "network ready");
        Ok(info)
    }

    /// Tear the network down. Failures are logged and later steps still
    /// run; the pool lease itself is released by the caller.
    pub async fn delete(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.phase = Phase::Deleting;

        if let Some(mut child) = inner.daemon.take() {
            match child.start_kill() {
                Ok(()) => {
                    let _ = child.wait().await;
                    info!(flannel_id = %self.flannel_id, "daemon stopped");
                }
                Err(err) => warn!(flannel_id = %self.flannel_id, error = %err, "failed to kill daemon"),
            }
        }

        let config_key = self.client.key(&["config"]);
        let outcome = self
            .client
            .txn(
                TxnRequest::new()
                    .when(Compare::ModRevisionEq(
                        config_key.clone(),
                        inner.config_mod_revision,
                    ))
                    .then(TxnOp::Delete(config_key.clone())),
            )
            .await;
        match outcome {
            Ok(outcome) if !outcome.succeeded => {
                match self.client.backend().get(&config_key).await {
                    Ok(None) => {} // deleted concurrently
                    Ok(Some(_)) => {
                        error!(flannel_id = %self.flannel_id, "config changed under us, leaving it")
                    }
                    Err(err) => warn!(flannel_id = %self.flannel_id, error = %err, "config recheck failed"),
                }
            }
            Ok(_) => {}
            Err(err) => warn!(flannel_id = %self.flannel_id, error = %err, "config delete failed"),
        }

        for endpoint in self.endpoints.values() {
            if let Err(err) = endpoint.leave(&self.netlink).await {
                warn!(flannel_id = %self.flannel_id, endpoint = %endpoint.id(), error = %err,
                      "failed to delete endpoint veth");
            }
        }

        if let Some(bridge) = inner.bridge.take() {
            if let Err(err) = bridge.delete().await {
                warn!(flannel_id = %self.flannel_id, error = %err, "failed to delete bridge");
            }
        }

        if let Some(pool) = inner.pool.take() {
            if let Err(err) = pool.release_all_ips().await {
                warn!(flannel_id = %self.flannel_id, error = %err, "failed to release pool addresses");
            }
        }

        inner.info = None;
        inner.phase = Phase::Deleted;
        info!(flannel_id = %self.flannel_id, "network deleted");
        Ok(())
    }

    /// Store the endpoint; its veth appears on join.
    pub fn add_endpoint(&self, id: &str, ip: Ipv4Addr, mac: &str) -> Arc<Endpoint> {
        let endpoint = Endpoint::new(id, ip, mac);
        self.endpoints.insert(id.to_string(), endpoint.clone());
        endpoint
    }

    pub fn get_endpoint(&self, id: &str) -> Option<Arc<Endpoint>> {
        self.endpoints.get(&id.to_string())
    }

    /// Create the veth pair for the endpoint and return it.
    pub async fn join_endpoint(&self, id: &str) -> Result<crate::network::endpoint::VethPair> {
        let endpoint = self
            .get_endpoint(id)
            .ok_or_else(|| DriverError::not_found("endpoint", id))?;
        let (bridge_index, mtu) = {
            let inner = self.inner.lock().await;
            let bridge = inner
                .bridge
                .as_ref()
                .and_then(|bridge| bridge.index())
                .ok_or_else(|| DriverError::external("netlink", "bridge not ready for join"))?;
            let mtu = inner.info.as_ref().map(|info| info.mtu).unwrap_or(1500);
            (bridge, mtu)
        };
        endpoint.join(&self.netlink, bridge_index, mtu).await
    }

    /// Tear down the endpoint's veth but keep the endpoint.
    pub async fn leave_endpoint(&self, id: &str) -> Result<()> {
        let endpoint = self
            .get_endpoint(id)
            .ok_or_else(|| DriverError::not_found("endpoint", id))?;
        endpoint.leave(&self.netlink).await
    }

    /// Remove the endpoint entirely. Unknown endpoints succeed.
    pub async fn delete_endpoint(&self, id: &str) -> Result<()> {
        let Some(endpoint) = self.endpoints.try_remove(&id.to_string()) else {
            return Ok(());
        };
        endpoint.leave(&self.netlink).await
    }

    fn env_file(&self) -> PathBuf {
        self.options.env_dir.join(format!("{}.env", self.flannel_id))
    }

    /// Write the backend config if absent; reuse a matching one; refuse a
    /// conflicting one.
    async fn ensure_config(&self, inner: &mut Inner) -> Result<()> {
        let config_key = self.client.key(&["config"]);
        let desired = NetworkConfig::vxlan(self.network, self.options.host_subnet_size);

        if let Some(existing) = self.read_config(&config_key, inner).await? {
            return self.check_config(&existing, &desired);
        }

        let encoded = serde_json::to_vec(&desired).expect("config serializes");
        let outcome = self
            .client
            .txn(
                TxnRequest::new()
                    .when(Compare::CreateRevisionEq(config_key.clone(), 0))
                    .then(TxnOp::Put(config_key.clone(), encoded)),
            )
            .await?;
        if outcome.succeeded {
            debug!(flannel_id = %self.flannel_id, "wrote backend config");
        } else {
            debug!(flannel_id = %self.flannel_id, "backend config written by another host");
        }

        match self.read_config(&config_key, inner).await? {
            Some(existing) => self.check_config(&existing, &desired),
            None => Err(DriverError::Conflict(format!(
                "backend config for {} disappeared during creation",
                self.flannel_id
            ))),
        }
    }

    async fn read_config(&self, config_key: &str, inner: &mut Inner) -> Result<Option<NetworkConfig>> {
        let Some(record) = self.client.backend().get(config_key).await? else {
            return Ok(None);
        };
        inner.config_mod_revision = record.mod_revision;
        let config =
            serde_json::from_slice(&record.value).map_err(|err| DriverError::CorruptValue {
                key: config_key.to_string(),
                message: err.to_string(),
            })?;
        Ok(Some(config))
    }

    fn check_config(&self, existing: &NetworkConfig, desired: &NetworkConfig) -> Result<()> {
        if existing.network != desired.network {
            return Err(DriverError::Conflict(format!(
                "backend config for {} is for network {} instead of {}",
                self.flannel_id, existing.network, desired.network
            )));
        }
        Ok(())
    }

    /// Spawn the VXLAN daemon and wait for it to report readiness.
    async fn start_daemon(&self) -> Result<Child> {
        let mut args = vec![
            format!("-subnet-file={}", self.env_file().display()),
            format!("-etcd-prefix={}", self.client.prefix()),
            format!("-etcd-endpoints={}", self.client.endpoints().join(",")),
        ];
        args.extend(self.options.flannel_options.iter().cloned());

        let child = launch_daemon(&self.options.daemon_path, &args).await?;
        info!(flannel_id = %self.flannel_id, pid = child.id(), "daemon bootstrapped");
        Ok(child)
    }
}

/// Spawn the daemon binary and scan its output for the bootstrap marker.
/// Premature exit fails; silence beyond the bootstrap window kills the
/// child and fails.
pub(crate) async fn launch_daemon(path: &Path, args: &[String]) -> Result<Child> {
    let mut child = Command::new(path)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| DriverError::external("flanneld", format!("spawn: {err}")))?;

    let (tx, mut bootstrap_rx) = mpsc::channel::<()>(1);
    if let Some(stdout) = child.stdout.take() {
        spawn_output_scanner(stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_output_scanner(stderr, tx);
    }

    enum Launch {
        Exited(std::io::Result<std::process::ExitStatus>),
        Bootstrapped,
        OutputClosed,
        TimedOut,
    }

    let outcome = tokio::select! {
        status = child.wait() => Launch::Exited(status),
        marker = tokio::time::timeout(BOOTSTRAP_TIMEOUT, bootstrap_rx.recv()) => match marker {
            Ok(Some(())) => Launch::Bootstrapped,
            Ok(None) => Launch::OutputClosed,
            Err(_) => Launch::TimedOut,
        }
    };

    match outcome {
        Launch::Bootstrapped => Ok(child),
        Launch::Exited(status) => {
            let status = status.map_err(|err| DriverError::external("flanneld", err.to_string()))?;
            Err(DriverError::external(
                "flanneld",
                format!("exited prematurely with {status}"),
            ))
        }
        Launch::OutputClosed => {
            let _ = child.kill().await;
            Err(DriverError::external("flanneld", "output closed before bootstrap"))
        }
        Launch::TimedOut => {
            let _ = child.kill().await;
            Err(DriverError::external(
                "flanneld",
                format!("no bootstrap within {BOOTSTRAP_TIMEOUT:?}"),
            ))
        }
    }
}

fn spawn_output_scanner(
    pipe: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    tx: mpsc::Sender<()>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "flanneld", "{line}");
            if line.contains(BOOTSTRAP_MARKER) {
                let _ = tx.try_send(());
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_serializes_to_the_wire_shape() {
        let config = NetworkConfig::vxlan("10.1.0.0/20".parse().unwrap(), 25);
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "Network": "10.1.0.0/20",
                "SubnetLen": 25,
                "Backend": {"Type": "vxlan"}
            })
        );
    }

    #[tokio::test]
    async fn daemon_bootstrap_marker_is_detected() {
        let child = launch_daemon(
            Path::new("/bin/sh"),
            &["-c".into(), "echo bootstrap done; sleep 30".into()],
        )
        .await
        .unwrap();
        assert!(child.id().is_some());
    }

    #[tokio::test]
    async fn premature_exit_fails_the_launch() {
        let err = launch_daemon(Path::new("/bin/sh"), &["-c".into(), "exit 1".into()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("prematurely"));
    }

    #[tokio::test]
    async fn silent_daemon_is_killed_after_the_bootstrap_window() {
        let start = std::time::Instant::now();
        let err = launch_daemon(Path::new("/bin/sh"), &["-c".into(), "sleep 30".into()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bootstrap"));
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
