//! Configuration parsing and validation.
//!
//! The driver is configured entirely through the environment, the way the
//! packaged plugin is deployed. `Config::from_env` reads the documented
//! variables, applies defaults and validates the result; validation errors
//! name the offending variable.

use crate::core::error::{DriverError, Result};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Default dial timeout for the KV store, also used as the per-request
/// deadline on request paths.
pub const KV_TIMEOUT: Duration = Duration::from_secs(5);

/// Attempts made against an unreachable KV store before startup aborts.
pub const KV_STARTUP_ATTEMPTS: u32 = 6;

/// Directory the VXLAN daemon writes its env files into.
pub const FLANNEL_ENV_DIR: &str = "/flannel-env";

/// Top-level driver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// etcd endpoints, comma separated in `ETCD_ENDPOINTS`.
    pub etcd_endpoints: Vec<String>,

    /// Root KV prefix (`ETCD_PREFIX`).
    pub etcd_prefix: String,

    /// Extra flags passed to every flanneld child (`DEFAULT_FLANNEL_OPTIONS`).
    #[serde(default)]
    pub default_flannel_options: Vec<String>,

    /// Operator supernets the address space is carved from
    /// (`AVAILABLE_SUBNETS`, comma separated CIDRs).
    pub available_subnets: Vec<Ipv4Net>,

    /// Prefix length of one pool subnet, i.e. of one logical network
    /// (`NETWORK_SUBNET_SIZE`).
    pub network_subnet_size: u8,

    /// Prefix length of a per-host slice of a pool subnet
    /// (`DEFAULT_HOST_SUBNET_SIZE`).
    pub default_host_subnet_size: u8,

    /// First VXLAN network identifier handed out (`VNI_START`).
    #[serde(default = "default_vni_start")]
    pub vni_start: u32,

    /// Answer `tasks.<service>` queries the way the runtime's resolver does
    /// (`DNS_DOCKER_COMPATIBILITY_MODE`).
    #[serde(default)]
    pub dns_docker_compatibility_mode: bool,

    /// Whether the sandbox-hook directories are expected to exist
    /// (`IS_HOOK_AVAILABLE`).
    #[serde(default)]
    pub is_hook_available: bool,
}

fn default_vni_start() -> u32 {
    6514
}

impl Config {
    /// Load the configuration from process environment variables.
    pub fn from_env() -> Result<Self> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_vars(&vars)
    }

    /// Load from an explicit variable map. Split out for tests.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self> {
        let etcd_endpoints = split_list(vars.get("ETCD_ENDPOINTS").map(String::as_str));
        let etcd_prefix = vars
            .get("ETCD_PREFIX")
            .cloned()
            .unwrap_or_else(|| "/flannel".to_string());

        let available_subnets = split_list(vars.get("AVAILABLE_SUBNETS").map(String::as_str))
            .iter()
            .map(|raw| {
                raw.parse::<Ipv4Net>().map_err(|err| {
                    DriverError::InvalidInput(format!(
                        "AVAILABLE_SUBNETS entry {raw:?} is not an IPv4 CIDR: {err}"
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let config = Self {
            etcd_endpoints,
            etcd_prefix,
            default_flannel_options: split_list(
                vars.get("DEFAULT_FLANNEL_OPTIONS").map(String::as_str),
            ),
            available_subnets,
            network_subnet_size: parse_var(vars, "NETWORK_SUBNET_SIZE", 20)?,
            default_host_subnet_size: parse_var(vars, "DEFAULT_HOST_SUBNET_SIZE", 25)?,
            vni_start: parse_var(vars, "VNI_START", default_vni_start())?,
            dns_docker_compatibility_mode: parse_bool(vars, "DNS_DOCKER_COMPATIBILITY_MODE")?,
            is_hook_available: parse_bool(vars, "IS_HOOK_AVAILABLE")?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.etcd_endpoints.is_empty() {
            return Err(DriverError::InvalidInput(
                "ETCD_ENDPOINTS must list at least one endpoint".into(),
            ));
        }
        if self.available_subnets.is_empty() {
            return Err(DriverError::InvalidInput(
                "AVAILABLE_SUBNETS must list at least one supernet".into(),
            ));
        }
        if !(1..=30).contains(&self.network_subnet_size) {
            return Err(DriverError::InvalidInput(format!(
                "NETWORK_SUBNET_SIZE {} is outside 1..=30",
                self.network_subnet_size
            )));
        }
        if self.default_host_subnet_size < self.network_subnet_size
            || self.default_host_subnet_size > 30
        {
            return Err(DriverError::InvalidInput(format!(
                "DEFAULT_HOST_SUBNET_SIZE {} must be within {}..=30",
                self.default_host_subnet_size, self.network_subnet_size
            )));
        }
        for subnet in &self.available_subnets {
            if subnet.prefix_len() > self.network_subnet_size {
                return Err(DriverError::InvalidInput(format!(
                    "AVAILABLE_SUBNETS entry {subnet} is smaller than NETWORK_SUBNET_SIZE /{}",
                    self.network_subnet_size
                )));
            }
        }
        Ok(())
    }

    /// Total number of pool subnets the address space supports.
    pub fn pool_capacity(&self) -> usize {
        self.available_subnets
            .iter()
            .map(|s| 1usize << (self.network_subnet_size - s.prefix_len()))
            .sum()
    }

    /// Number of usable addresses per host subnet, including the gateway.
    pub fn addresses_per_host(&self) -> usize {
        (1usize << (32 - self.default_host_subnet_size)).saturating_sub(2)
    }
}

fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|value| {
        value
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

fn parse_var<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match vars.get(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|err| {
            DriverError::InvalidInput(format!("{name} value {raw:?} is invalid: {err}"))
        }),
    }
}

fn parse_bool(vars: &HashMap<String, String>, name: &str) -> Result<bool> {
    match vars.get(name).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(false),
        Some(v) if ["1", "true", "yes", "on"].contains(&v.as_str()) => Ok(true),
        Some(v) if ["0", "false", "no", "off", ""].contains(&v.as_str()) => Ok(false),
        Some(v) => Err(DriverError::InvalidInput(format!(
            "{name} value {v:?} is not a boolean"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([
            ("ETCD_ENDPOINTS".into(), "http://127.0.0.1:2379".into()),
            ("ETCD_PREFIX".into(), "/flannel".into()),
            (
                "AVAILABLE_SUBNETS".into(),
                "10.1.0.0/16, 10.2.0.0/16".into(),
            ),
            ("NETWORK_SUBNET_SIZE".into(), "20".into()),
            ("DEFAULT_HOST_SUBNET_SIZE".into(), "25".into()),
        ])
    }

    #[test]
    fn parses_documented_variables() {
        let mut vars = base_vars();
        vars.insert("VNI_START".into(), "7000".into());
        vars.insert("DNS_DOCKER_COMPATIBILITY_MODE".into(), "true".into());

        let config = Config::from_vars(&vars).unwrap();
        assert_eq!(config.etcd_endpoints, vec!["http://127.0.0.1:2379"]);
        assert_eq!(config.available_subnets.len(), 2);
        assert_eq!(config.vni_start, 7000);
        assert!(config.dns_docker_compatibility_mode);
        assert!(!config.is_hook_available);
    }

    #[test]
    fn pool_capacity_counts_subnets_across_supernets() {
        let config = Config::from_vars(&base_vars()).unwrap();
        // Two /16 supernets carved into /20 pools.
        assert_eq!(config.pool_capacity(), 32);
        // A /25 host subnet has 126 usable addresses.
        assert_eq!(config.addresses_per_host(), 126);
    }

    #[test]
    fn rejects_host_subnet_larger_than_pool() {
        let mut vars = base_vars();
        vars.insert("DEFAULT_HOST_SUBNET_SIZE".into(), "18".into());
        let err = Config::from_vars(&vars).unwrap_err();
        assert!(err.to_string().contains("DEFAULT_HOST_SUBNET_SIZE"));
    }

    #[test]
    fn rejects_malformed_supernet() {
        let mut vars = base_vars();
        vars.insert("AVAILABLE_SUBNETS".into(), "10.1.0.0/16,bogus".into());
        let err = Config::from_vars(&vars).unwrap_err();
        assert!(err.to_string().contains("AVAILABLE_SUBNETS"));
    }

    #[test]
    fn missing_endpoints_fail_validation() {
        let mut vars = base_vars();
        vars.remove("ETCD_ENDPOINTS");
        let err = Config::from_vars(&vars).unwrap_err();
        assert!(err.to_string().contains("ETCD_ENDPOINTS"));
    }
}
