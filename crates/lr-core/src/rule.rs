use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Priorities of the rules the kernel installs by itself (local, main, default).
pub const RESERVED_PRIORITIES: [u32; 3] = [0, 32766, 32767];

/// Selector value meaning "every source".
pub const MATCH_ALL: &str = "all";

/// What a policy rule does with matching traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum RuleAction {
    Lookup(String),
    Unreachable,
    Blackhole,
    Prohibit,
    Goto(u32),
    Nop,
}

impl RuleAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Lookup(_) => "lookup",
            Self::Unreachable => "unreachable",
            Self::Blackhole => "blackhole",
            Self::Prohibit => "prohibit",
            Self::Goto(_) => "goto",
            Self::Nop => "nop",
        }
    }

    pub fn table(&self) -> Option<&str> {
        match self {
            Self::Lookup(table) => Some(table),
            _ => None,
        }
    }
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lookup(table) => write!(f, "lookup {}", table),
            Self::Goto(target) => write!(f, "goto {}", target),
            other => f.write_str(other.name()),
        }
    }
}

/// A policy-routing rule as listed by `ip rule show`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpRule {
    /// Identity key for delete
    pub priority: u32,
    /// Everything after `priority:`, verbatim
    pub selector: String,
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fwmark: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iif: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oif: Option<String>,
    #[serde(default)]
    pub not: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<RuleAction>,
}

impl IpRule {
    pub fn is_reserved(&self) -> bool {
        RESERVED_PRIORITIES.contains(&self.priority)
    }

    pub fn table(&self) -> Option<&str> {
        self.action.as_ref().and_then(RuleAction::table)
    }
}

/// Caller intent for adding a policy rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpRuleInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
    #[serde(default)]
    pub not: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fwmark: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iif: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oif: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<RuleAction>,
}

impl IpRuleInput {
    pub fn lookup(table: impl Into<String>) -> Self {
        Self {
            action: Some(RuleAction::Lookup(table.into())),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        match &self.action {
            None => Err(Error::validation(
                "action",
                "a lookup table or a rule action is required",
            )),
            Some(RuleAction::Lookup(table)) if table.trim().is_empty() => {
                Err(Error::validation("table", "lookup table name is empty"))
            }
            Some(_) => Ok(()),
        }
    }
}

impl From<&IpRule> for IpRuleInput {
    fn from(rule: &IpRule) -> Self {
        Self {
            priority: Some(rule.priority),
            not: rule.not,
            from: Some(rule.from.clone()),
            to: rule.to.clone(),
            fwmark: rule.fwmark.clone(),
            iif: rule.iif.clone(),
            oif: rule.oif.clone(),
            action: rule.action.clone(),
        }
    }
}
