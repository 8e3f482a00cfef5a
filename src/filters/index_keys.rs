//! Index key computation.
//!
//! A rule produces an index key per value when exactly one side of the
//! comparison is dynamic: the dynamic side's path and the literal side form
//! the key, so an event can be matched by looking up `type:path:<event value>`.

use std::collections::BTreeSet;
use std::fmt;

use crate::domain::{concatenated_key, Filter, Operand, Rule, RuleType, META_ANY, META_NONE};
use crate::error::{Error, Result};

/// Partition-local index key `<type>:<a>:<b>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexKey {
    pub rule_type: String,
    pub a: String,
    pub b: String,
}

impl IndexKey {
    pub fn new(rule_type: impl Into<String>, a: impl Into<String>, b: impl Into<String>) -> Self {
        Self {
            rule_type: rule_type.into(),
            a: a.into(),
            b: b.into(),
        }
    }

    /// Parse `<type>:<a>:<b>`; `b` may itself contain separators.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut parts = raw.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(t), Some(a), Some(b)) if !t.is_empty() => Ok(Self::new(t, a, b)),
            _ => Err(Error::MalformedIndexKey(raw.to_string())),
        }
    }

    /// Key prefixed with its tenant context, as stored in the cache.
    pub fn with_tenant(&self, tnt_ctx: &str) -> String {
        concatenated_key(&[tnt_ctx, &self.to_string()])
    }

    pub fn is_catch_all(&self) -> bool {
        *self == catch_all_key()
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.rule_type, self.a, self.b)
    }
}

/// `*none:*any:*any`, under which filterless entities are indexed.
pub fn catch_all_key() -> IndexKey {
    IndexKey::new(META_NONE, META_ANY, META_ANY)
}

/// Tenant-qualified catch-all key.
pub fn catch_all_tenant_key(tenant: &str) -> String {
    catch_all_key().with_tenant(tenant)
}

/// Check a full cache key `<tnt_ctx>:<type>:<a>:<b>` and split it into its
/// tenant context and index key. The tenant context may hold separators
/// itself, so the split happens from the right.
pub fn split_tenant_index_key(cache_key: &str) -> Result<(String, IndexKey)> {
    let parts: Vec<&str> = cache_key.rsplitn(4, ':').collect();
    if parts.len() < 4 || parts[3].is_empty() || parts[2].is_empty() {
        return Err(Error::MalformedIndexKey(cache_key.to_string()));
    }
    Ok((
        parts[3].to_string(),
        IndexKey::new(parts[2], parts[1], parts[0]),
    ))
}

// =============================================================================
// Rule indexers
// =============================================================================

/// Strategy turning a filter rule into index keys.
pub trait RuleIndexer: Send + Sync {
    fn index_keys(&self, rule: &Rule) -> Vec<IndexKey>;
}

/// Indexes `*string`, `*prefix` and `*suffix` rules with one dynamic side.
#[derive(Debug, Clone, Copy, Default)]
pub struct DynamicOperandIndexer;

impl DynamicOperandIndexer {
    const INDEX_CAPABLE: [RuleType; 3] = [RuleType::STRING, RuleType::PREFIX, RuleType::SUFFIX];

    fn is_index_capable(rule: &Rule) -> bool {
        Self::INDEX_CAPABLE.contains(&rule.rule_type)
    }
}

impl RuleIndexer for DynamicOperandIndexer {
    fn index_keys(&self, rule: &Rule) -> Vec<IndexKey> {
        if !Self::is_index_capable(rule) || rule.element.is_unindexable() {
            return Vec::new();
        }
        let rule_type = rule.rule_type.to_string();
        rule.values
            .iter()
            .filter(|value| !value.is_unindexable())
            .filter_map(|value| match (&rule.element, value) {
                (Operand::DynamicRef(path), Operand::Literal(lit)) => {
                    Some(IndexKey::new(&rule_type, path, lit))
                }
                (Operand::Literal(lit), Operand::DynamicRef(path)) => {
                    Some(IndexKey::new(&rule_type, path, lit))
                }
                _ => None,
            })
            .collect()
    }
}

/// Index keys of a filter under the default indexer.
pub fn compute_index_keys(filter: &Filter) -> Vec<IndexKey> {
    compute_index_keys_with(filter, &[&DynamicOperandIndexer])
}

/// Index keys of a filter under a set of indexers, deduplicated and sorted.
pub fn compute_index_keys_with(filter: &Filter, indexers: &[&dyn RuleIndexer]) -> Vec<IndexKey> {
    let keys: BTreeSet<IndexKey> = filter
        .rules
        .iter()
        .flat_map(|rule| indexers.iter().flat_map(move |ix| ix.index_keys(rule)))
        .collect();
    keys.into_iter().collect()
}
