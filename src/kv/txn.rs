//! KV transaction model.
//!
//! A small compare/then/else transaction surface: the subset of etcd v3
//! transactions the allocator and stores rely on. Backends either translate
//! it to wire transactions or evaluate it directly against their own state.

use crate::kv::KeyValue;

/// Comparison predicate evaluated against a single key.
///
/// A missing key compares with `create_revision = 0`, `mod_revision = 0` and
/// an empty value, matching etcd semantics. Putting `CreateRevision == 0` in
/// front of a put is therefore the canonical put-if-absent guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compare {
    CreateRevisionEq(String, i64),
    ModRevisionEq(String, i64),
    ValueEq(String, Vec<u8>),
    ValueNe(String, Vec<u8>),
}

impl Compare {
    /// Key this predicate inspects.
    pub fn key(&self) -> &str {
        match self {
            Self::CreateRevisionEq(key, _)
            | Self::ModRevisionEq(key, _)
            | Self::ValueEq(key, _)
            | Self::ValueNe(key, _) => key,
        }
    }

    /// Evaluate against the current record of the key, `None` when absent.
    pub fn evaluate(&self, current: Option<&KeyValue>) -> bool {
        match self {
            Self::CreateRevisionEq(_, expected) => {
                current.map_or(0, |kv| kv.create_revision) == *expected
            }
            Self::ModRevisionEq(_, expected) => {
                current.map_or(0, |kv| kv.mod_revision) == *expected
            }
            Self::ValueEq(_, expected) => {
                current.map_or(&[][..], |kv| kv.value.as_slice()) == expected.as_slice()
            }
            Self::ValueNe(_, expected) => {
                current.map_or(&[][..], |kv| kv.value.as_slice()) != expected.as_slice()
            }
        }
    }
}

/// Operation executed in a transaction branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    Put(String, Vec<u8>),
    Delete(String),
    Get(String),
}

/// Compare/then/else transaction.
#[derive(Debug, Clone, Default)]
pub struct TxnRequest {
    pub compares: Vec<Compare>,
    pub success: Vec<TxnOp>,
    pub failure: Vec<TxnOp>,
}

impl TxnRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, compare: Compare) -> Self {
        self.compares.push(compare);
        self
    }

    pub fn then(mut self, op: TxnOp) -> Self {
        self.success.push(op);
        self
    }

    pub fn or_else(mut self, op: TxnOp) -> Self {
        self.failure.push(op);
        self
    }
}

/// Transaction result.
///
/// `fetched` carries the results of the `Get` operations of the branch that
/// ran, in order; non-get operations contribute nothing to it.
#[derive(Debug, Clone)]
pub struct TxnOutcome {
    pub succeeded: bool,
    pub fetched: Vec<Option<KeyValue>>,
}

impl TxnOutcome {
    /// First fetched record, for the common single-get else-branch.
    pub fn first_fetched(&self) -> Option<&KeyValue> {
        self.fetched.first().and_then(|kv| kv.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv(key: &str, value: &[u8], create: i64, modr: i64) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            value: value.to_vec(),
            create_revision: create,
            mod_revision: modr,
            version: 1,
        }
    }

    #[test]
    fn absent_key_compares_as_zero_revision() {
        let cmp = Compare::CreateRevisionEq("a".into(), 0);
        assert!(cmp.evaluate(None));
        assert!(!cmp.evaluate(Some(&kv("a", b"x", 3, 3))));
    }

    #[test]
    fn value_compare_treats_absent_as_empty() {
        assert!(Compare::ValueEq("a".into(), vec![]).evaluate(None));
        assert!(Compare::ValueNe("a".into(), b"reserved".to_vec()).evaluate(None));
        assert!(Compare::ValueEq("a".into(), b"x".to_vec()).evaluate(Some(&kv("a", b"x", 1, 1))));
    }

    #[test]
    fn builder_collects_branches() {
        let txn = TxnRequest::new()
            .when(Compare::CreateRevisionEq("k".into(), 0))
            .then(TxnOp::Put("k".into(), b"v".to_vec()))
            .or_else(TxnOp::Get("k".into()));
        assert_eq!(txn.compares.len(), 1);
        assert_eq!(txn.success.len(), 1);
        assert_eq!(txn.failure.len(), 1);
    }
}
