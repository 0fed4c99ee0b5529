//! Flannel env-file parsing.
//!
//! The VXLAN daemon writes `/flannel-env/<flannel-id>.env` once its lease is
//! acquired. The file is a flat `KEY=value` list; blank lines, comments and
//! keys without the `FLANNEL_` prefix are ignored.

use crate::core::error::{DriverError, Result};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Parsed daemon output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlannelEnv {
    /// Cluster-wide network CIDR (`FLANNEL_NETWORK`).
    pub network: Ipv4Net,
    /// This host's subnet (`FLANNEL_SUBNET`, network part).
    pub host_subnet: Ipv4Net,
    /// This host's gateway (`FLANNEL_SUBNET`, address part).
    pub gateway: Ipv4Addr,
    /// `FLANNEL_MTU`.
    pub mtu: u32,
    /// `FLANNEL_IPMASQ`.
    pub ipmasq: bool,
}

/// Poll until the file exists, then parse it.
pub async fn wait_and_parse(path: &Path, timeout: Duration) -> Result<FlannelEnv> {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::fs::metadata(path).await.is_err() {
        if tokio::time::Instant::now() >= deadline {
            return Err(DriverError::external(
                "flanneld",
                format!("env file {} not written in time", path.display()),
            ));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let content = tokio::fs::read_to_string(path).await?;
    parse(&content)
}

pub fn parse(content: &str) -> Result<FlannelEnv> {
    let mut network = None;
    let mut subnet = None;
    let mut mtu = None;
    let mut ipmasq = false;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            debug!(line, "skipping malformed env line");
            continue;
        };
        let Some(key) = key.strip_prefix("FLANNEL_") else {
            debug!(key, "skipping unrecognized env key");
            continue;
        };

        match key {
            "NETWORK" => {
                let parsed: Ipv4Net = value.parse().map_err(|err| {
                    DriverError::external("flanneld", format!("bad FLANNEL_NETWORK {value:?}: {err}"))
                })?;
                network = Some(parsed.trunc());
            }
            "SUBNET" => {
                // The subnet line carries the gateway as its address part,
                // e.g. 10.1.0.1/25.
                let parsed: Ipv4Net = value.parse().map_err(|err| {
                    DriverError::external("flanneld", format!("bad FLANNEL_SUBNET {value:?}: {err}"))
                })?;
                subnet = Some((parsed.trunc(), parsed.addr()));
            }
            "MTU" => {
                mtu = Some(value.parse::<u32>().map_err(|err| {
                    DriverError::external("flanneld", format!("bad FLANNEL_MTU {value:?}: {err}"))
                })?);
            }
            "IPMASQ" => {
                ipmasq = value.eq_ignore_ascii_case("true");
            }
            other => debug!(key = other, "unknown FLANNEL_ env key"),
        }
    }

    let network =
        network.ok_or_else(|| DriverError::external("flanneld", "env file missing FLANNEL_NETWORK"))?;
    let (host_subnet, gateway) =
        subnet.ok_or_else(|| DriverError::external("flanneld", "env file missing FLANNEL_SUBNET"))?;
    let mtu = mtu.ok_or_else(|| DriverError::external("flanneld", "env file missing FLANNEL_MTU"))?;

    Ok(FlannelEnv {
        network,
        host_subnet,
        gateway,
        mtu,
        ipmasq,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_env_file() {
        let env = parse(
            "FLANNEL_NETWORK=10.1.0.0/20\n\
             FLANNEL_SUBNET=10.1.0.1/25\n\
             FLANNEL_MTU=1450\n\
             FLANNEL_IPMASQ=true\n",
        )
        .unwrap();
        assert_eq!(env.network.to_string(), "10.1.0.0/20");
        assert_eq!(env.host_subnet.to_string(), "10.1.0.0/25");
        assert_eq!(env.gateway.to_string(), "10.1.0.1");
        assert_eq!(env.mtu, 1450);
        assert!(env.ipmasq);
    }

    #[test]
    fn ignores_comments_blanks_and_foreign_keys() {
        let env = parse(
            "# written by flanneld\n\
             \n\
             PATH=/usr/bin\n\
             FLANNEL_NETWORK=10.1.0.0/20\n\
             FLANNEL_SUBNET=10.1.3.1/25\n\
             FLANNEL_MTU=1400\n\
             FLANNEL_IPMASQ=false\n",
        )
        .unwrap();
        assert_eq!(env.host_subnet.to_string(), "10.1.3.0/25");
        assert!(!env.ipmasq);
    }

    #[test]
    fn missing_subnet_is_an_error() {
        let err = parse("FLANNEL_NETWORK=10.1.0.0/20\nFLANNEL_MTU=1450\n").unwrap_err();
        assert!(err.to_string().contains("FLANNEL_SUBNET"));
    }

    #[tokio::test]
    async fn wait_and_parse_times_out_on_absent_file() {
        let err = wait_and_parse(
            Path::new("/nonexistent/never.env"),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("not written in time"));
    }

    #[tokio::test]
    async fn wait_and_parse_picks_up_a_file_written_later() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("net1.env");

        let writer_path = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            tokio::fs::write(
                &writer_path,
                "FLANNEL_NETWORK=10.1.0.0/20\nFLANNEL_SUBNET=10.1.0.1/25\nFLANNEL_MTU=1450\nFLANNEL_IPMASQ=true\n",
            )
            .await
            .unwrap();
        });

        let env = wait_and_parse(&path, Duration::from_secs(5)).await.unwrap();
        assert_eq!(env.host_subnet.to_string(), "10.1.0.0/25");
    }
}
