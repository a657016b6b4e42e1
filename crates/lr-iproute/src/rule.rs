use crate::route::ReplayOutcome;
use lr_core::selector::{address, present};
use lr_core::{
    AuditEvent, AuditSink, CommandRunner, Domain, Error, Invocation, IpRule, IpRuleInput, LockKey,
    LockRegistry, MATCH_ALL, Programs, Result, RuleAction, TracingAudit, checked,
};
use regex::Regex;
use std::collections::HashSet;
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};

static RULE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+):\s*(.*)$").expect("valid rule line regex"));

// The policy database is one list; every rule mutation shares this key.
const RULE_LOCK_TABLE: &str = "policy";

#[derive(Debug, PartialEq, Eq)]
enum SelectorToken<'a> {
    From(&'a str),
    To(&'a str),
    Fwmark(&'a str),
    Iif(&'a str),
    Oif(&'a str),
    Lookup(&'a str),
    Goto(&'a str),
    Unreachable,
    Blackhole,
    Prohibit,
    Nop,
    Not,
    Other(&'a str),
}

fn scan_selector(selector: &str) -> Vec<SelectorToken<'_>> {
    let mut tokens = Vec::new();
    let mut iter = selector.split_whitespace().peekable();
    while let Some(word) = iter.next() {
        let token = match word {
            "not" => SelectorToken::Not,
            "unreachable" => SelectorToken::Unreachable,
            "blackhole" => SelectorToken::Blackhole,
            "prohibit" => SelectorToken::Prohibit,
            "nop" => SelectorToken::Nop,
            "from" | "to" | "fwmark" | "iif" | "oif" | "lookup" | "table" | "goto" => {
                let Some(value) = iter.next() else {
                    tokens.push(SelectorToken::Other(word));
                    break;
                };
                match word {
                    "from" => SelectorToken::From(value),
                    "to" => SelectorToken::To(value),
                    "fwmark" => SelectorToken::Fwmark(value),
                    "iif" => SelectorToken::Iif(value),
                    "oif" => SelectorToken::Oif(value),
                    "goto" => SelectorToken::Goto(value),
                    _ => SelectorToken::Lookup(value),
                }
            }
            other => SelectorToken::Other(other),
        };
        tokens.push(token);
    }
    tokens
}

pub fn parse_rule_line(line: &str) -> Option<IpRule> {
    let caps = RULE_LINE.captures(line.trim())?;
    let priority: u32 = caps[1].parse().ok()?;
    let selector = caps[2].trim().to_string();

    let mut rule = IpRule {
        priority,
        selector: selector.clone(),
        from: MATCH_ALL.to_string(),
        to: None,
        fwmark: None,
        iif: None,
        oif: None,
        not: false,
        action: None,
    };

    for token in scan_selector(&selector) {
        match token {
            SelectorToken::From(from) => rule.from = from.to_string(),
            SelectorToken::To(to) => rule.to = Some(to.to_string()),
            SelectorToken::Fwmark(mark) => rule.fwmark = Some(mark.to_string()),
            SelectorToken::Iif(iif) => rule.iif = Some(iif.to_string()),
            SelectorToken::Oif(oif) => rule.oif = Some(oif.to_string()),
            SelectorToken::Lookup(table) => rule.action = Some(RuleAction::Lookup(table.to_string())),
            SelectorToken::Goto(target) => match target.parse() {
                Ok(target) => rule.action = Some(RuleAction::Goto(target)),
                Err(_) => debug!(line, target, "ignoring non-numeric goto"),
            },
            SelectorToken::Unreachable => rule.action = Some(RuleAction::Unreachable),
            SelectorToken::Blackhole => rule.action = Some(RuleAction::Blackhole),
            SelectorToken::Prohibit => rule.action = Some(RuleAction::Prohibit),
            SelectorToken::Nop => rule.action = Some(RuleAction::Nop),
            SelectorToken::Not => rule.not = true,
            SelectorToken::Other(_) => {}
        }
    }

    Some(rule)
}

/// Lines that are not `N: selector` are skipped.
pub fn parse_rules(text: &str) -> Vec<IpRule> {
    text.lines().filter_map(parse_rule_line).collect()
}

/// Stored form: `priority P [not] [from F] [to T] [fwmark M] [iif I] [oif O] action`.
pub fn canonical_line(rule: &IpRule) -> String {
    let mut parts = vec!["priority".to_string(), rule.priority.to_string()];
    if rule.not {
        parts.push("not".to_string());
    }
    let mut selector = |key: &str, value: Option<&str>| {
        if let Some(value) = value {
            parts.push(key.to_string());
            parts.push(value.to_string());
        }
    };
    selector("from", address(Some(&rule.from)));
    selector("to", present(rule.to.as_deref()));
    selector("fwmark", present(rule.fwmark.as_deref()));
    selector("iif", present(rule.iif.as_deref()));
    selector("oif", present(rule.oif.as_deref()));
    if let Some(action) = &rule.action {
        parts.push(action.to_string());
    }
    parts.join(" ")
}

pub fn list_command(program: &str) -> Invocation {
    Invocation::new(program).args(["rule", "show"])
}

pub fn add_command(program: &str, input: &IpRuleInput) -> Invocation {
    let mut inv = Invocation::new(program).args(["rule", "add"]);
    if let Some(priority) = input.priority {
        inv.push("priority");
        inv.push(priority.to_string());
    }
    if input.not {
        inv.push("not");
    }
    inv.push_opt("from", address(input.from.as_deref()));
    inv.push_opt("to", address(input.to.as_deref()));
    inv.push_opt("fwmark", present(input.fwmark.as_deref()));
    inv.push_opt("iif", present(input.iif.as_deref()));
    inv.push_opt("oif", present(input.oif.as_deref()));
    match &input.action {
        Some(RuleAction::Lookup(table)) => {
            inv.push("lookup");
            inv.push(table.trim());
        }
        Some(RuleAction::Goto(target)) => {
            inv.push("goto");
            inv.push(target.to_string());
        }
        Some(other) => inv.push(other.name()),
        None => {}
    }
    inv
}

pub fn delete_command(program: &str, priority: u32) -> Invocation {
    Invocation::new(program)
        .args(["rule", "del", "priority"])
        .arg(priority.to_string())
}

pub fn replay_command(program: &str, line: &str) -> Invocation {
    Invocation::new(program)
        .args(["rule", "add"])
        .args(line.split_whitespace())
}

/// Policy-rule coordinator over `ip rule`.
pub struct RuleManager<R> {
    runner: R,
    programs: Programs,
    locks: Arc<LockRegistry>,
    audit: Arc<dyn AuditSink>,
}

impl<R: CommandRunner> RuleManager<R> {
    pub fn new(runner: R, programs: Programs, locks: Arc<LockRegistry>) -> Self {
        Self {
            runner,
            programs,
            locks,
            audit: Arc::new(TracingAudit),
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub async fn list(&self) -> Result<Vec<IpRule>> {
        let output = checked(&self.runner, &list_command(&self.programs.ip)).await?;
        Ok(parse_rules(&output.stdout))
    }

    pub async fn add(&self, input: &IpRuleInput) -> Result<()> {
        input.validate()?;
        let _guard = self.locks.lock(rule_key()).await;

        let inv = add_command(&self.programs.ip, input);
        checked(&self.runner, &inv).await?;

        info!(priority = ?input.priority, "policy rule added");
        self.notify("add", input.priority.map(|p| p.to_string()), &inv);
        Ok(())
    }

    /// Delete the rule holding `priority`; NotFound when no live rule has it.
    pub async fn delete(&self, priority: u32) -> Result<()> {
        let _guard = self.locks.lock(rule_key()).await;

        if !self.list().await?.iter().any(|r| r.priority == priority) {
            return Err(Error::NotFound(format!("rule with priority {}", priority)));
        }

        let inv = delete_command(&self.programs.ip, priority);
        checked(&self.runner, &inv).await?;

        info!(priority, "policy rule deleted");
        self.notify("delete", Some(priority.to_string()), &inv);
        Ok(())
    }

    /// Re-add stored canonical lines in order.
    ///
    /// The live set is listed once; lines it already holds are not re-added.
    /// Each line gets its own result so one bad line does not stop the rest.
    pub async fn replay_lines(&self, lines: &[String]) -> Result<Vec<(String, Result<ReplayOutcome>)>> {
        let _guard = self.locks.lock(rule_key()).await;

        let live: HashSet<String> = self.list().await?.iter().map(canonical_line).collect();
        let mut results = Vec::with_capacity(lines.len());

        for line in lines {
            if live.contains(line.as_str()) {
                debug!(line = %line, "rule already present");
                results.push((line.clone(), Ok(ReplayOutcome::AlreadyPresent)));
                continue;
            }

            let inv = replay_command(&self.programs.ip, line);
            let outcome = match checked(&self.runner, &inv).await {
                Ok(_) => {
                    self.notify("restore", None, &inv);
                    Ok(ReplayOutcome::Added)
                }
                Err(err) if err.is_already_exists() => Ok(ReplayOutcome::AlreadyPresent),
                Err(err) => {
                    warn!(line = %line, error = %err, "rule replay failed");
                    Err(err)
                }
            };
            results.push((line.clone(), outcome));
        }

        Ok(results)
    }

    fn notify(&self, action: &str, priority: Option<String>, inv: &Invocation) {
        self.audit.record(&AuditEvent::new(
            Domain::Rules,
            action,
            priority.unwrap_or_else(|| "-".to_string()),
            inv.args.join(" "),
        ));
    }
}

fn rule_key() -> LockKey {
    LockKey::table(Domain::Rules, RULE_LOCK_TABLE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lr_core::testing::{ScriptedRunner, always};
    use lr_core::{CommandOutput, ErrorKind, NoopAudit};

    const SHOW: &str = "\
0:\tfrom all lookup local
32000:\tnot from 192.168.7.0/24 fwmark 0x1/0xff iif br0 lookup 100 proto static
32764:\tfrom 10.0.0.0/24 lookup custom1
32765:\tfrom all to 203.0.113.0/24 unreachable
32766:\tfrom all lookup main
32767:\tfrom all lookup default
";

    #[test]
    fn lookup_rule_is_parsed() {
        let rule = parse_rule_line("32764: from 10.0.0.0/24 lookup custom1").unwrap();
        assert_eq!(rule.priority, 32764);
        assert_eq!(rule.from, "10.0.0.0/24");
        assert_eq!(rule.table(), Some("custom1"));
        assert_eq!(rule.action.as_ref().map(RuleAction::name), Some("lookup"));
    }

    #[test]
    fn selector_keywords_in_any_order() {
        let rules = parse_rules(SHOW);
        assert_eq!(rules.len(), 6);

        let marked = &rules[1];
        assert!(marked.not);
        assert_eq!(marked.from, "192.168.7.0/24");
        assert_eq!(marked.fwmark.as_deref(), Some("0x1/0xff"));
        assert_eq!(marked.iif.as_deref(), Some("br0"));
        assert_eq!(marked.table(), Some("100"));
        assert_eq!(marked.selector, "not from 192.168.7.0/24 fwmark 0x1/0xff iif br0 lookup 100 proto static");

        let unreachable = &rules[3];
        assert_eq!(unreachable.from, "all");
        assert_eq!(unreachable.to.as_deref(), Some("203.0.113.0/24"));
        assert_eq!(unreachable.action, Some(RuleAction::Unreachable));

        assert!(rules[0].is_reserved());
        assert!(rules[4].is_reserved());
        assert!(rules[5].is_reserved());
        assert!(!rules[2].is_reserved());
    }

    #[test]
    fn non_rule_lines_are_skipped() {
        assert!(parse_rules("garbage\n\nError: something\n").is_empty());
        let rule = parse_rule_line("100:\tfrom all goto 32000").unwrap();
        assert_eq!(rule.action, Some(RuleAction::Goto(32000)));
    }

    #[test]
    fn canonical_lines_drop_match_all_source() {
        let rules = parse_rules(SHOW);
        assert_eq!(
            canonical_line(&rules[1]),
            "priority 32000 not from 192.168.7.0/24 fwmark 0x1/0xff iif br0 lookup 100"
        );
        assert_eq!(canonical_line(&rules[2]), "priority 32764 from 10.0.0.0/24 lookup custom1");
        assert_eq!(
            canonical_line(&rules[3]),
            "priority 32765 to 203.0.113.0/24 unreachable"
        );
    }

    #[test]
    fn add_command_orders_selectors() {
        let input = IpRuleInput {
            priority: Some(1000),
            from: Some("all".into()),
            to: Some("10.20.0.0/16".into()),
            oif: Some("wg0".into()),
            ..IpRuleInput::lookup("vpn")
        };
        assert_eq!(
            add_command("ip", &input).to_string(),
            "ip rule add priority 1000 to 10.20.0.0/16 oif wg0 lookup vpn"
        );

        let blackhole = IpRuleInput {
            fwmark: Some("0x2".into()),
            action: Some(RuleAction::Blackhole),
            ..IpRuleInput::default()
        };
        assert_eq!(
            add_command("ip", &blackhole).to_string(),
            "ip rule add fwmark 0x2 blackhole"
        );
        assert_eq!(delete_command("ip", 1000).to_string(), "ip rule del priority 1000");
    }

    fn manager<R: CommandRunner>(runner: R) -> RuleManager<R> {
        RuleManager::new(runner, Programs::default(), LockRegistry::shared())
            .with_audit(Arc::new(NoopAudit))
    }

    #[tokio::test]
    async fn delete_unknown_priority_is_not_found() {
        let runner = Arc::new(always(SHOW));
        let rules = manager(runner.clone());

        let err = rules.delete(4242).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(runner.command_lines(), vec!["ip rule show"]);

        rules.delete(32764).await.unwrap();
        assert_eq!(
            runner.command_lines().last().map(String::as_str),
            Some("ip rule del priority 32764")
        );
    }

    #[tokio::test]
    async fn add_without_action_never_runs() {
        let runner = Arc::new(always(""));
        let err = manager(runner.clone()).add(&IpRuleInput::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn replay_skips_rules_already_live() {
        let runner = Arc::new(ScriptedRunner::new(|inv: &Invocation| match inv.args[1].as_str() {
            "show" => CommandOutput::ok(SHOW),
            _ if inv.args.iter().any(|a| a == "bogus") => {
                CommandOutput::failed(255, "Error: argument \"bogus\" is wrong: Failed to parse rule type\n")
            }
            _ => CommandOutput::ok(""),
        }));
        let rules = manager(runner.clone());

        let lines = vec![
            "priority 32764 from 10.0.0.0/24 lookup custom1".to_string(),
            "priority 31000 iif eth2 bogus".to_string(),
            "priority 31001 from 172.16.0.0/12 lookup 200".to_string(),
        ];
        let results = rules.replay_lines(&lines).await.unwrap();

        assert!(matches!(results[0].1, Ok(ReplayOutcome::AlreadyPresent)));
        assert!(results[1].1.is_err());
        assert!(matches!(results[2].1, Ok(ReplayOutcome::Added)));
        assert_eq!(
            runner.command_lines(),
            vec![
                "ip rule show",
                "ip rule add priority 31000 iif eth2 bogus",
                "ip rule add priority 31001 from 172.16.0.0/12 lookup 200",
            ]
        );
    }
}
