use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Packet-filter table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    #[default]
    Filter,
    Nat,
    Mangle,
    Raw,
}

impl Table {
    pub const ALL: [Table; 4] = [Table::Filter, Table::Nat, Table::Mangle, Table::Raw];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Filter => "filter",
            Self::Nat => "nat",
            Self::Mangle => "mangle",
            Self::Raw => "raw",
        }
    }

    /// Chains the kernel creates for this table. Only these carry a default policy.
    pub fn builtin_chains(&self) -> &'static [&'static str] {
        match self {
            Self::Filter => &["INPUT", "FORWARD", "OUTPUT"],
            Self::Nat => &["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"],
            Self::Mangle => &["PREROUTING", "INPUT", "FORWARD", "OUTPUT", "POSTROUTING"],
            Self::Raw => &["PREROUTING", "OUTPUT"],
        }
    }

    pub fn is_builtin_chain(&self, chain: &str) -> bool {
        self.builtin_chains().contains(&chain)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Table {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "" | "filter" => Ok(Self::Filter),
            "nat" => Ok(Self::Nat),
            "mangle" => Ok(Self::Mangle),
            "raw" => Ok(Self::Raw),
            other => Err(Error::validation(
                "table",
                format!("unknown table '{}' (expected filter, nat, mangle or raw)", other),
            )),
        }
    }
}

/// Default policy as reported by a chain listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Policy {
    Accept,
    Drop,
    Queue,
    Return,
}

impl Policy {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ACCEPT" => Some(Self::Accept),
            "DROP" => Some(Self::Drop),
            "QUEUE" => Some(Self::Queue),
            "RETURN" => Some(Self::Return),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accept => "ACCEPT",
            Self::Drop => "DROP",
            Self::Queue => "QUEUE",
            Self::Return => "RETURN",
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Values accepted when setting a built-in chain's default policy.
///
/// REJECT is only valid as a per-rule target; the kernel refuses it as a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DefaultPolicy {
    Accept,
    Drop,
}

impl DefaultPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accept => "ACCEPT",
            Self::Drop => "DROP",
        }
    }
}

impl fmt::Display for DefaultPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DefaultPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ACCEPT" => Ok(Self::Accept),
            "DROP" => Ok(Self::Drop),
            "REJECT" => Err(Error::validation(
                "policy",
                "REJECT is a rule target and cannot be a chain's default policy",
            )),
            other => Err(Error::validation(
                "policy",
                format!("unsupported default policy '{}' (expected ACCEPT or DROP)", other),
            )),
        }
    }
}

/// One chain from a listing. Superseded by the next listing, never updated in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainInfo {
    pub name: String,
    /// `None` for user-defined chains, which have no default policy
    pub policy: Option<Policy>,
    /// Jump references, only reported for user-defined chains
    pub references: Option<u32>,
    pub packets: u64,
    pub bytes: u64,
    pub rules: Vec<FirewallRule>,
}

impl ChainInfo {
    pub fn is_builtin(&self) -> bool {
        self.policy.is_some()
    }

    pub fn rule_at(&self, position: u32) -> Option<&FirewallRule> {
        self.rules.iter().find(|rule| rule.position == position)
    }
}

/// A rule line from a chain listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    /// 1-based, valid only against the listing that produced it
    pub position: u32,
    pub packets: u64,
    pub bytes: u64,
    /// Empty when the rule has no jump
    pub target: String,
    pub protocol: String,
    pub opt: String,
    pub in_interface: String,
    pub out_interface: String,
    pub source: String,
    pub destination: String,
    /// Trailing match text, kept verbatim
    pub extra: String,
}

/// A rule's full specification in the tool's own `-S` argument form, minus `-A <chain>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub args: Vec<String>,
}

impl fmt::Display for RuleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for arg in &self.args {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, "\"{}\"", arg)?;
            } else {
                f.write_str(arg)?;
            }
        }
        Ok(())
    }
}

/// Caller intent for adding a firewall rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRuleInput {
    #[serde(default)]
    pub table: Table,
    pub chain: String,
    /// Insert position; `None` appends
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_interface: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_interface: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sport: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dport: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_destination: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_source: Option<String>,
}

impl FirewallRuleInput {
    pub fn new(table: Table, chain: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            table,
            chain: chain.into(),
            target: target.into(),
            ..Self::default()
        }
    }

    /// Minimal field checks; cross-field legality is left to the tool.
    pub fn validate(&self) -> Result<()> {
        validate_chain_name(&self.chain)?;
        if self.target.trim().is_empty() {
            return Err(Error::validation("target", "a jump target is required"));
        }
        if self.position == Some(0) {
            return Err(Error::validation("position", "positions are 1-based"));
        }
        Ok(())
    }
}

pub fn validate_chain_name(chain: &str) -> Result<()> {
    if chain.trim().is_empty() {
        return Err(Error::validation("chain", "a chain name is required"));
    }
    if chain.contains(char::is_whitespace) {
        return Err(Error::validation(
            "chain",
            format!("chain name '{}' contains whitespace", chain),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_is_not_a_default_policy() {
        assert_eq!("accept".parse::<DefaultPolicy>().unwrap(), DefaultPolicy::Accept);
        assert_eq!("DROP".parse::<DefaultPolicy>().unwrap(), DefaultPolicy::Drop);
        let err = "REJECT".parse::<DefaultPolicy>().unwrap_err();
        assert!(err.to_string().contains("rule target"));
        assert!("QUEUE".parse::<DefaultPolicy>().is_err());
    }

    #[test]
    fn builtin_chains_depend_on_table() {
        assert!(Table::Filter.is_builtin_chain("FORWARD"));
        assert!(!Table::Raw.is_builtin_chain("FORWARD"));
        assert!(Table::Nat.is_builtin_chain("POSTROUTING"));
        assert!(!Table::Filter.is_builtin_chain("DOCKER"));
    }

    #[test]
    fn input_requires_chain_and_target() {
        assert!(FirewallRuleInput::new(Table::Filter, "INPUT", "ACCEPT").validate().is_ok());
        assert!(FirewallRuleInput::new(Table::Filter, "", "ACCEPT").validate().is_err());
        assert!(FirewallRuleInput::new(Table::Filter, "INPUT", " ").validate().is_err());

        let mut zero = FirewallRuleInput::new(Table::Filter, "INPUT", "DROP");
        zero.position = Some(0);
        assert!(zero.validate().is_err());
    }

    #[test]
    fn rule_spec_display_quotes_comments() {
        let spec = RuleSpec {
            args: vec![
                "-p".into(),
                "tcp".into(),
                "-m".into(),
                "comment".into(),
                "--comment".into(),
                "web traffic".into(),
                "-j".into(),
                "ACCEPT".into(),
            ],
        };
        assert_eq!(
            spec.to_string(),
            "-p tcp -m comment --comment \"web traffic\" -j ACCEPT"
        );
    }
}
