//! iptables programming.
//!
//! Rules are declared as data and applied through the `iptables` binary
//! wrapper. The bridge rule set integrates the overlay with the runtime's
//! own chains (DOCKER, isolation stages); the sweep path removes every rule
//! mentioning an interface we are deleting.

use crate::core::error::{DriverError, Result};
use ipnet::Ipv4Net;

/// One rule in one chain of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IptablesRule {
    pub table: &'static str,
    pub chain: String,
    pub spec: Vec<String>,
}

impl IptablesRule {
    pub fn new(table: &'static str, chain: &str, spec: &[&str]) -> Self {
        Self {
            table,
            chain: chain.to_string(),
            spec: spec.iter().map(|part| part.to_string()).collect(),
        }
    }

    pub fn spec_string(&self) -> String {
        self.spec.join(" ")
    }
}

/// The rule set attached to one network bridge.
pub fn bridge_rules(interface: &str, host_subnet: &Ipv4Net) -> Vec<IptablesRule> {
    let subnet = host_subnet.to_string();
    vec![
        IptablesRule::new(
            "nat",
            "POSTROUTING",
            &["-s", &subnet, "!", "-o", interface, "-j", "MASQUERADE"],
        ),
        IptablesRule::new("nat", "DOCKER", &["-i", interface, "-j", "RETURN"]),
        IptablesRule::new(
            "filter",
            "FORWARD",
            &["-i", interface, "-o", interface, "-j", "ACCEPT"],
        ),
        IptablesRule::new(
            "filter",
            "FORWARD",
            &["-i", interface, "!", "-o", interface, "-j", "ACCEPT"],
        ),
        IptablesRule::new("filter", "FORWARD", &["-o", interface, "-j", "DOCKER"]),
        IptablesRule::new(
            "filter",
            "FORWARD",
            &[
                "-o",
                interface,
                "-m",
                "conntrack",
                "--ctstate",
                "RELATED,ESTABLISHED",
                "-j",
                "ACCEPT",
            ],
        ),
        IptablesRule::new(
            "filter",
            "DOCKER-ISOLATION-STAGE-1",
            &[
                "-i",
                interface,
                "!",
                "-o",
                interface,
                "-j",
                "DOCKER-ISOLATION-STAGE-2",
            ],
        ),
        IptablesRule::new(
            "filter",
            "DOCKER-ISOLATION-STAGE-2",
            &["-o", interface, "-j", "DROP"],
        ),
    ]
}

/// Tables and chains the bridge rule set touches; the sweep scans these.
pub const BRIDGE_TABLE_CHAINS: &[(&str, &[&str])] = &[
    ("nat", &["POSTROUTING", "DOCKER"]),
    (
        "filter",
        &["FORWARD", "DOCKER-ISOLATION-STAGE-1", "DOCKER-ISOLATION-STAGE-2"],
    ),
];

fn open() -> Result<iptables::IPTables> {
    iptables::new(false).map_err(|err| DriverError::external("iptables", err.to_string()))
}

fn external(err: Box<dyn std::error::Error>) -> DriverError {
    DriverError::external("iptables", err.to_string())
}

/// Append every rule that is not already present.
pub fn apply_rules(rules: &[IptablesRule]) -> Result<()> {
    let ipt = open()?;
    for rule in rules {
        let spec = rule.spec_string();
        if !ipt.exists(rule.table, &rule.chain, &spec).map_err(external)? {
            ipt.append(rule.table, &rule.chain, &spec).map_err(external)?;
        }
    }
    Ok(())
}

/// Delete the rules, tolerating ones that are already gone.
pub fn remove_rules(rules: &[IptablesRule]) -> Result<()> {
    let ipt = open()?;
    for rule in rules {
        let spec = rule.spec_string();
        let present = ipt.exists(rule.table, &rule.chain, &spec).map_err(external)?;
        if present {
            ipt.delete(rule.table, &rule.chain, &spec).map_err(external)?;
        }
    }
    Ok(())
}

/// Delete every rule mentioning `interface` in the bridge tables/chains.
/// Used by the stale-resource sweep, which has no rule list to go by.
pub fn scrub_interface_rules(interface: &str) -> Result<()> {
    let ipt = open()?;
    for (table, chains) in BRIDGE_TABLE_CHAINS {
        for chain in *chains {
            let rules = ipt.list(table, chain).map_err(external)?;
            for raw in rules {
                if !raw.contains(interface) {
                    continue;
                }
                // `iptables -S` output: `-A <chain> <spec...>`.
                let fields: Vec<&str> = raw.split_whitespace().collect();
                let spec = match fields.as_slice() {
                    ["-A", _, rest @ ..] => rest.join(" "),
                    _ => continue,
                };
                ipt.delete(table, chain, &spec).map_err(external)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridge_rules_cover_nat_and_forwarding() {
        let subnet: Ipv4Net = "10.1.0.0/25".parse().unwrap();
        let rules = bridge_rules("fl-net1", &subnet);
        assert_eq!(rules.len(), 8);

        let masq = &rules[0];
        assert_eq!(masq.table, "nat");
        assert_eq!(
            masq.spec_string(),
            "-s 10.1.0.0/25 ! -o fl-net1 -j MASQUERADE"
        );
        assert!(rules
            .iter()
            .any(|rule| rule.chain == "DOCKER-ISOLATION-STAGE-2"));
    }

    #[test]
    fn every_bridge_rule_chain_is_sweepable() {
        let subnet: Ipv4Net = "10.1.0.0/25".parse().unwrap();
        for rule in bridge_rules("fl-x", &subnet) {
            let covered = BRIDGE_TABLE_CHAINS
                .iter()
                .any(|(table, chains)| *table == rule.table && chains.contains(&rule.chain.as_str()));
            assert!(covered, "chain {} not covered by sweep", rule.chain);
        }
    }
}
