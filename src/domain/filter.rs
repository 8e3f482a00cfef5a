//! Filters and their rules.
//!
//! A rule compares an element against a list of values. Either side may be
//! a literal or a dynamic reference into the event being evaluated; the
//! distinction is made once, when the rule text is parsed.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Marks the start of a dynamic reference (`~*req.Account`).
pub const DYNAMIC_DATA_PREFIX: char = '~';
/// Separates values inside an inline filter.
pub const INLINE_VALUE_SEP: char = '|';
/// Negation prefix on rule types (`*notstring`).
const NOT_PREFIX: &str = "*not";

// =============================================================================
// Operand
// =============================================================================

/// One side of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operand {
    /// Compared as written
    Literal(String),
    /// Path resolved against the event at evaluation time (stored without `~`)
    DynamicRef(String),
}

impl Operand {
    /// Parse raw rule text.
    pub fn parse(raw: &str) -> Self {
        match raw.strip_prefix(DYNAMIC_DATA_PREFIX) {
            Some(path) => Operand::DynamicRef(path.to_string()),
            None => Operand::Literal(raw.to_string()),
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, Operand::DynamicRef(_))
    }

    /// Literal text or dynamic path, without the `~` marker.
    pub fn value(&self) -> &str {
        match self {
            Operand::Literal(v) | Operand::DynamicRef(v) => v,
        }
    }

    /// True when the operand embeds a `<...>` reference that only an event
    /// can resolve; such operands never produce index keys.
    pub fn is_unindexable(&self) -> bool {
        let v = self.value();
        match (v.find('<'), v.rfind('>')) {
            (Some(open), Some(close)) => open < close,
            _ => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.value().is_empty()
    }
}

impl From<String> for Operand {
    fn from(raw: String) -> Self {
        Operand::parse(&raw)
    }
}

impl From<Operand> for String {
    fn from(op: Operand) -> Self {
        op.to_string()
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Literal(v) => f.write_str(v),
            Operand::DynamicRef(path) => write!(f, "{}{}", DYNAMIC_DATA_PREFIX, path),
        }
    }
}

// =============================================================================
// Rule types
// =============================================================================

/// Comparison performed by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    String,
    Prefix,
    Suffix,
    Exists,
    Empty,
    Gt,
    Gte,
    Lt,
    Lte,
    Regex,
    Destinations,
    Rsr,
}

impl RuleKind {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "string" => RuleKind::String,
            "prefix" => RuleKind::Prefix,
            "suffix" => RuleKind::Suffix,
            "exists" => RuleKind::Exists,
            "empty" => RuleKind::Empty,
            "gt" => RuleKind::Gt,
            "gte" => RuleKind::Gte,
            "lt" => RuleKind::Lt,
            "lte" => RuleKind::Lte,
            "regex" => RuleKind::Regex,
            "destinations" => RuleKind::Destinations,
            "rsr" => RuleKind::Rsr,
            _ => return None,
        })
    }

    fn name(self) -> &'static str {
        match self {
            RuleKind::String => "string",
            RuleKind::Prefix => "prefix",
            RuleKind::Suffix => "suffix",
            RuleKind::Exists => "exists",
            RuleKind::Empty => "empty",
            RuleKind::Gt => "gt",
            RuleKind::Gte => "gte",
            RuleKind::Lt => "lt",
            RuleKind::Lte => "lte",
            RuleKind::Regex => "regex",
            RuleKind::Destinations => "destinations",
            RuleKind::Rsr => "rsr",
        }
    }

    /// Rule kinds that carry no values.
    pub fn is_unary(self) -> bool {
        matches!(self, RuleKind::Exists | RuleKind::Empty)
    }
}

/// Rule type as written in a filter, e.g. `*string` or `*notprefix`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RuleType {
    pub kind: RuleKind,
    pub negate: bool,
}

impl RuleType {
    pub const STRING: RuleType = RuleType::positive(RuleKind::String);
    pub const PREFIX: RuleType = RuleType::positive(RuleKind::Prefix);
    pub const SUFFIX: RuleType = RuleType::positive(RuleKind::Suffix);

    pub const fn positive(kind: RuleKind) -> Self {
        Self {
            kind,
            negate: false,
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = || Error::InvalidFilter {
            rule: raw.to_string(),
            reason: "unsupported filter type".to_string(),
        };
        let (negate, name) = match raw.strip_prefix(NOT_PREFIX) {
            Some(rest) => (true, rest),
            None => (false, raw.strip_prefix('*').ok_or_else(invalid)?),
        };
        let kind = RuleKind::from_name(name).ok_or_else(invalid)?;
        Ok(Self { kind, negate })
    }
}

impl TryFrom<String> for RuleType {
    type Error = Error;

    fn try_from(raw: String) -> Result<Self> {
        RuleType::parse(&raw)
    }
}

impl From<RuleType> for String {
    fn from(t: RuleType) -> Self {
        t.to_string()
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negate {
            write!(f, "{}{}", NOT_PREFIX, self.kind.name())
        } else {
            write!(f, "*{}", self.kind.name())
        }
    }
}

// =============================================================================
// Rule and Filter
// =============================================================================

/// A single condition of a filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Rule {
    #[serde(rename = "Type")]
    pub rule_type: RuleType,
    pub element: Operand,
    #[serde(default)]
    pub values: Vec<Operand>,
}

impl Rule {
    /// Parse and validate a rule from its textual parts.
    pub fn new(rule_type: &str, element: &str, values: &[&str]) -> Result<Self> {
        let rule = Self {
            rule_type: RuleType::parse(rule_type)?,
            element: Operand::parse(element),
            values: values.iter().map(|v| Operand::parse(v)).collect(),
        };
        rule.validate()?;
        Ok(rule)
    }

    pub fn validate(&self) -> Result<()> {
        if self.element.is_empty() {
            if self.element.is_dynamic() {
                return Err(Error::InvalidFilter {
                    rule: self.to_string(),
                    reason: "empty path in element".to_string(),
                });
            }
            return Err(Error::mandatory(["Element"]));
        }
        if !self.rule_type.kind.is_unary() && self.values.is_empty() {
            return Err(Error::mandatory(["Values"]));
        }
        if let Some(v) = self.values.iter().find(|v| v.is_dynamic() && v.is_empty()) {
            return Err(Error::InvalidFilter {
                rule: self.to_string(),
                reason: format!("empty path in value <{}>", v),
            });
        }
        Ok(())
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values: Vec<String> = self.values.iter().map(|v| v.to_string()).collect();
        write!(
            f,
            "{}:{}:{}",
            self.rule_type,
            self.element,
            values.join(&INLINE_VALUE_SEP.to_string())
        )
    }
}

/// Named set of rules, all of which must pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Filter {
    pub tenant: String,
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl Filter {
    /// True when the ID is an inline definition rather than a stored filter.
    pub fn is_inline(id: &str) -> bool {
        id.starts_with('*')
    }

    /// Build the one-rule filter described by an inline ID such as
    /// `*string:~*req.Account:1001|1002`.
    pub fn from_inline(tenant: &str, inline_id: &str) -> Result<Self> {
        let mut parts = inline_id.splitn(3, ':');
        let (rule_type, element, values) = match (parts.next(), parts.next(), parts.next()) {
            (Some(t), Some(e), Some(v)) => (t, e, v),
            (Some(t), Some(e), None) => (t, e, ""),
            _ => {
                return Err(Error::InvalidFilter {
                    rule: inline_id.to_string(),
                    reason: "inline filter needs <type>:<element>[:<values>]".to_string(),
                })
            }
        };
        let values: Vec<&str> = if values.is_empty() {
            Vec::new()
        } else {
            values.split(INLINE_VALUE_SEP).collect()
        };
        Ok(Self {
            tenant: tenant.to_string(),
            id: inline_id.to_string(),
            rules: vec![Rule::new(rule_type, element, &values)?],
        })
    }

    pub fn tenant_id(&self) -> String {
        format!("{}:{}", self.tenant, self.id)
    }

    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.tenant.is_empty() {
            missing.push("Tenant");
        }
        if self.id.is_empty() {
            missing.push("ID");
        }
        if self.rules.is_empty() {
            missing.push("Rules");
        }
        if !missing.is_empty() {
            return Err(Error::mandatory(missing));
        }
        self.rules.iter().try_for_each(Rule::validate)
    }
}
