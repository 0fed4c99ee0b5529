//! In-sandbox iptables interception.
//!
//! Installs two custom chains in the sandbox's nat table that DNAT the
//! runtime resolver address to our listeners and SNAT the answers back.
//! The runtime's own `DOCKER_OUTPUT`/`DOCKER_POSTROUTING` chains are
//! awaited (the runtime programs them asynchronously) and then emptied so
//! only our redirection remains.

use crate::core::error::{DriverError, Result};
use crate::dns::{DNS_LISTEN_IP, DOCKER_RESOLVER_IP};
use crate::network::netns;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const OUTPUT_CHAIN: &str = "FLANNEL_DNS_OUTPUT";
pub const POSTROUTING_CHAIN: &str = "FLANNEL_DNS_POSTROUTING";
const DOCKER_CHAINS: [&str; 2] = ["DOCKER_OUTPUT", "DOCKER_POSTROUTING"];
const TABLE: &str = "nat";

/// How long the runtime gets to create its own chains before we give up.
const DOCKER_CHAIN_WAIT: Duration = Duration::from_secs(30);
const DOCKER_CHAIN_POLL: Duration = Duration::from_millis(5);

/// The complete nat-table rule set, as `(chain, spec)` pairs in insertion
/// order.
pub fn redirect_rules(tcp_port: u16, udp_port: u16) -> Vec<(String, Vec<String>)> {
    let resolver = DOCKER_RESOLVER_IP.to_string();
    let listen = DNS_LISTEN_IP.to_string();
    vec![
        (
            "OUTPUT".into(),
            str_args(&["-d", &resolver, "-j", OUTPUT_CHAIN]),
        ),
        (
            "POSTROUTING".into(),
            str_args(&["-d", &resolver, "-j", POSTROUTING_CHAIN]),
        ),
        (
            OUTPUT_CHAIN.into(),
            str_args(&[
                "-j",
                "DNAT",
                "-p",
                "tcp",
                "-d",
                &resolver,
                "--dport",
                "53",
                "--to-destination",
                &format!("{listen}:{tcp_port}"),
            ]),
        ),
        (
            OUTPUT_CHAIN.into(),
            str_args(&[
                "-j",
                "DNAT",
                "-p",
                "udp",
                "-d",
                &resolver,
                "--dport",
                "53",
                "--to-destination",
                &format!("{listen}:{udp_port}"),
            ]),
        ),
        (
            POSTROUTING_CHAIN.into(),
            str_args(&[
                "-j",
                "SNAT",
                "-p",
                "tcp",
                "-s",
                &listen,
                "--sport",
                &tcp_port.to_string(),
                "--to-source",
                &format!("{resolver}:53"),
            ]),
        ),
        (
            POSTROUTING_CHAIN.into(),
            str_args(&[
                "-j",
                "SNAT",
                "-p",
                "udp",
                "-s",
                &listen,
                "--sport",
                &udp_port.to_string(),
                "--to-source",
                &format!("{resolver}:53"),
            ]),
        ),
    ]
}

fn str_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|arg| arg.to_string()).collect()
}

/// Install the interception inside the sandbox namespace. Blocks for up to
/// [`DOCKER_CHAIN_WAIT`] waiting for the runtime's chains.
pub async fn install(sandbox: PathBuf, tcp_port: u16, udp_port: u16) -> Result<()> {
    netns::with_namespace_async(sandbox, move || install_in_current_ns(tcp_port, udp_port)).await
}

fn external(err: Box<dyn std::error::Error>) -> DriverError {
    DriverError::external("iptables", err.to_string())
}

fn install_in_current_ns(tcp_port: u16, udp_port: u16) -> Result<()> {
    let ipt = iptables::new(false).map_err(external)?;

    wait_for_docker_chains(&ipt)?;

    for (chain, spec) in redirect_rules(tcp_port, udp_port) {
        if !ipt.chain_exists(TABLE, &chain).map_err(external)? {
            ipt.new_chain(TABLE, &chain).map_err(external)?;
        }
        let spec = spec.join(" ");
        if !ipt.exists(TABLE, &chain, &spec).map_err(external)? {
            ipt.insert(TABLE, &chain, &spec, 1).map_err(external)?;
        }
    }

    // With our redirection in place, the runtime's own rules would fight
    // over the same packets. Drop them.
    for chain in DOCKER_CHAINS {
        let rules = ipt.list(TABLE, chain).map_err(external)?;
        for raw in rules {
            let fields: Vec<&str> = raw.split_whitespace().collect();
            let spec = match fields.as_slice() {
                ["-A", _, rest @ ..] => rest.join(" "),
                _ => continue,
            };
            match ipt.delete(TABLE, chain, &spec) {
                Ok(()) => debug!(chain, rule = %spec, "removed runtime resolver rule"),
                Err(err) => warn!(chain, error = %err, "failed to remove runtime resolver rule"),
            }
        }
    }

    info!(tcp_port, udp_port, "resolver redirection installed");
    Ok(())
}

/// The runtime installs its chains asynchronously after sandbox creation;
/// wait until both exist and carry at least one rule.
fn wait_for_docker_chains(ipt: &iptables::IPTables) -> Result<()> {
    let deadline = Instant::now() + DOCKER_CHAIN_WAIT;
    loop {
        let mut ready = true;
        for chain in DOCKER_CHAINS {
            if !ipt.chain_exists(TABLE, chain).map_err(external)? {
                ready = false;
                break;
            }
            // The first list entry is the chain header.
            let rules = ipt.list(TABLE, chain).map_err(external)?;
            if rules.len() <= 1 {
                ready = false;
                break;
            }
        }
        if ready {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(DriverError::external(
                "iptables",
                "timeout waiting for the runtime's resolver chains",
            ));
        }
        std::thread::sleep(DOCKER_CHAIN_POLL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rules_redirect_both_protocols_and_restore_the_source() {
        let rules = redirect_rules(4153, 4053);
        assert_eq!(rules.len(), 6);

        let specs: Vec<String> = rules.iter().map(|(_, spec)| spec.join(" ")).collect();
        assert!(specs[0].contains("-j FLANNEL_DNS_OUTPUT"));
        assert!(specs[2].contains("--to-destination 127.0.0.33:4153"));
        assert!(specs[3].contains("--to-destination 127.0.0.33:4053"));
        assert!(specs[4].contains("--to-source 127.0.0.11:53"));
        assert!(specs
            .iter()
            .all(|spec| spec.contains("127.0.0.11") || spec.contains("127.0.0.33")));
    }
}
