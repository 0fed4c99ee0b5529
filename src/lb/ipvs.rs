//! IPVS and in-namespace data-plane programming.
//!
//! Virtual services are keyed by fwmark with round-robin scheduling and
//! masquerated backends. All programming happens inside the per-network
//! load-balancer namespace through `ip netns exec`, which works because the
//! namespaces are created as named namespaces.

use crate::core::error::{DriverError, Result};
use std::net::Ipv4Addr;
use tokio::process::Command;
use tracing::debug;

/// `ipvsadm -A -f <mark> -s rr`
pub fn add_service_args(fwmark: u32) -> Vec<String> {
    vec![
        "-A".into(),
        "-f".into(),
        fwmark.to_string(),
        "-s".into(),
        "rr".into(),
    ]
}

/// `ipvsadm -D -f <mark>`
pub fn delete_service_args(fwmark: u32) -> Vec<String> {
    vec!["-D".into(), "-f".into(), fwmark.to_string()]
}

/// `ipvsadm -a -f <mark> -r <ip>:0 -m`
pub fn add_backend_args(fwmark: u32, backend: Ipv4Addr) -> Vec<String> {
    vec![
        "-a".into(),
        "-f".into(),
        fwmark.to_string(),
        "-r".into(),
        format!("{backend}:0"),
        "-m".into(),
    ]
}

/// `ipvsadm -d -f <mark> -r <ip>:0`
pub fn delete_backend_args(fwmark: u32, backend: Ipv4Addr) -> Vec<String> {
    vec![
        "-d".into(),
        "-f".into(),
        fwmark.to_string(),
        "-r".into(),
        format!("{backend}:0"),
    ]
}

/// The iptables rules steering VIP traffic into the virtual service:
/// mangle marks per protocol, nat masquerades the marked flow.
pub fn vip_iptables_rules(vip: Ipv4Addr, fwmark: u32) -> Vec<(String, Vec<String>)> {
    let vip = vip.to_string();
    let mark = fwmark.to_string();
    vec![
        (
            "mangle".into(),
            str_args(&[
                "-A", "PREROUTING", "-d", &vip, "-p", "tcp", "-j", "MARK", "--set-mark", &mark,
            ]),
        ),
        (
            "mangle".into(),
            str_args(&[
                "-A", "PREROUTING", "-d", &vip, "-p", "udp", "-j", "MARK", "--set-mark", &mark,
            ]),
        ),
        (
            "nat".into(),
            str_args(&[
                "-A",
                "POSTROUTING",
                "-d",
                &vip,
                "-m",
                "mark",
                "--mark",
                &mark,
                "-j",
                "MASQUERADE",
            ]),
        ),
    ]
}

fn str_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|arg| arg.to_string()).collect()
}

/// Run a program inside a named namespace, failing on non-zero exit unless
/// the failure is an already-exists complaint and `tolerate_exists` is set.
pub async fn run_in_namespace(
    namespace: &str,
    program: &str,
    args: &[String],
    tolerate_exists: bool,
) -> Result<()> {
    let output = Command::new("ip")
        .arg("netns")
        .arg("exec")
        .arg(namespace)
        .arg(program)
        .args(args)
        .output()
        .await
        .map_err(|err| DriverError::external("ipvs", format!("spawn {program}: {err}")))?;

    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if tolerate_exists && (stderr.contains("File exists") || stderr.contains("already exists")) {
        debug!(namespace, program, "object already present");
        return Ok(());
    }
    Err(DriverError::external(
        "ipvs",
        format!("{program} {} in {namespace}: {}", args.join(" "), stderr.trim()),
    ))
}

pub async fn ipvsadm(namespace: &str, args: &[String], tolerate_exists: bool) -> Result<()> {
    run_in_namespace(namespace, "ipvsadm", args, tolerate_exists).await
}

pub async fn iptables(namespace: &str, table: &str, args: &[String]) -> Result<()> {
    let mut full = vec!["-t".to_string(), table.to_string()];
    full.extend_from_slice(args);
    run_in_namespace(namespace, "iptables", &full, true).await
}

pub async fn ip(namespace: &str, args: &[String], tolerate_exists: bool) -> Result<()> {
    run_in_namespace(namespace, "ip", args, tolerate_exists).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_and_backend_args_match_the_ipvsadm_grammar() {
        assert_eq!(add_service_args(9), ["-A", "-f", "9", "-s", "rr"]);
        assert_eq!(
            add_backend_args(9, "10.1.0.5".parse().unwrap()),
            ["-a", "-f", "9", "-r", "10.1.0.5:0", "-m"]
        );
        assert_eq!(
            delete_backend_args(9, "10.1.0.5".parse().unwrap()),
            ["-d", "-f", "9", "-r", "10.1.0.5:0"]
        );
        assert_eq!(delete_service_args(9), ["-D", "-f", "9"]);
    }

    #[test]
    fn vip_rules_mark_both_protocols_and_masquerade() {
        let rules = vip_iptables_rules("10.1.0.9".parse().unwrap(), 77);
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0].0, "mangle");
        assert!(rules[0].1.contains(&"tcp".to_string()));
        assert!(rules[1].1.contains(&"udp".to_string()));
        assert_eq!(rules[2].0, "nat");
        assert!(rules[2].1.contains(&"MASQUERADE".to_string()));
    }
}
