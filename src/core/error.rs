//! Error types and plugin-protocol mapping.
//!
//! The driver distinguishes a small set of error classes because the plugin
//! protocol and the convergence loops treat them differently: invalid input
//! and exhaustion are surfaced verbatim, not-found is swallowed on deletes,
//! and KV conflicts are retried within the failing call.

use thiserror::Error;

/// Common driver error conditions.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The caller passed a request the protocol forbids (missing flannel-id,
    /// IPv6 pool, endpoint without MAC, ...).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A referenced network, endpoint or service is unknown on this host.
    ///
    /// Operations that require existence surface this as a forbidden error;
    /// delete paths swallow it as success.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// A preconditioned KV transaction lost against a concurrent writer and
    /// the bounded in-call retries did not resolve it.
    #[error("conflict: {0}")]
    Conflict(String),

    /// No free subnets or IP addresses remain after a cache re-sync.
    #[error("resource exhausted: {0}")]
    Exhausted(String),

    /// An external subsystem (VXLAN daemon, iptables, netlink, ipvsadm)
    /// failed while converging the data plane.
    #[error("{subsystem}: {message}")]
    External {
        subsystem: &'static str,
        message: String,
    },

    /// KV transport failure (dial timeout, dropped stream, RPC error).
    #[error("kv: {0}")]
    Kv(String),

    /// Stored bytes did not decode as the expected value type.
    #[error("corrupt kv value at {key}: {message}")]
    CorruptValue { key: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DriverError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn external(subsystem: &'static str, message: impl Into<String>) -> Self {
        Self::External {
            subsystem,
            message: message.into(),
        }
    }

    /// Whether a delete-style operation may report success for this error.
    pub fn ignorable_on_delete(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<etcd_client::Error> for DriverError {
    fn from(err: etcd_client::Error) -> Self {
        Self::Kv(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_ignorable_on_delete() {
        let err = DriverError::not_found("endpoint", "ep-1");
        assert!(err.ignorable_on_delete());
        assert!(!DriverError::Conflict("x".into()).ignorable_on_delete());
    }

    #[test]
    fn display_names_the_subsystem() {
        let err = DriverError::external("flanneld", "exited prematurely");
        assert_eq!(err.to_string(), "flanneld: exited prematurely");
    }
}
