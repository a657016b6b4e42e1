use crate::builder;
use crate::parser::{parse_listing, parse_rule_specs};
use lr_core::{
    AuditEvent, AuditSink, ChainInfo, CommandRunner, DefaultPolicy, Domain, Error,
    FirewallRuleInput, LockKey, LockRegistry, Programs, Result, RuleSpec, Table, TracingAudit,
    checked, validate_chain_name,
};
use std::sync::Arc;
use tracing::{debug, info};

/// Firewall coordinator: list, mutate and reorder rules through `iptables`.
///
/// Holds no kernel state between calls. Mutations take the chain's lock (or
/// the table's, for table-wide operations) for their whole duration.
pub struct FirewallManager<R> {
    runner: R,
    programs: Programs,
    locks: Arc<LockRegistry>,
    audit: Arc<dyn AuditSink>,
}

impl<R: CommandRunner> FirewallManager<R> {
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

    pub async fn list_chains(&self, table: Table) -> Result<Vec<ChainInfo>> {
        let inv = builder::list(&self.programs.iptables, table, None);
        let output = checked(&self.runner, &inv).await?;
        parse_listing(&output.stdout)
    }

    pub async fn get_chain(&self, table: Table, chain: &str) -> Result<ChainInfo> {
        validate_chain_name(chain)?;
        let inv = builder::list(&self.programs.iptables, table, Some(chain));
        let output = checked(&self.runner, &inv).await?;
        parse_listing(&output.stdout)?
            .into_iter()
            .find(|c| c.name == chain)
            .ok_or_else(|| Error::NotFound(format!("chain {} in table {}", chain, table)))
    }

    /// Full `-S` specifications of a chain's rules, in position order.
    pub async fn rule_specs(&self, table: Table, chain: &str) -> Result<Vec<RuleSpec>> {
        validate_chain_name(chain)?;
        let inv = builder::list_specs(&self.programs.iptables, table, chain);
        let output = checked(&self.runner, &inv).await?;
        parse_rule_specs(&output.stdout, chain)
    }

    pub async fn add_rule(&self, input: &FirewallRuleInput) -> Result<()> {
        input.validate()?;
        let _guard = self.locks.lock(chain_key(input.table, &input.chain)).await;

        let inv = builder::add_rule(&self.programs.iptables, input);
        checked(&self.runner, &inv).await?;

        let action = if input.position.is_some() { "insert" } else { "append" };
        info!(table = %input.table, chain = %input.chain, action, "firewall rule added");
        self.notify(action, input.table, &input.chain, builder::match_args(input).join(" "));
        Ok(())
    }

    /// Delete by a position taken from a prior listing.
    pub async fn delete_rule(&self, table: Table, chain: &str, position: u32) -> Result<()> {
        validate_chain_name(chain)?;
        if position == 0 {
            return Err(Error::validation("position", "positions are 1-based"));
        }
        let _guard = self.locks.lock(chain_key(table, chain)).await;

        checked(&self.runner, &builder::delete_rule(&self.programs.iptables, table, chain, position)).await?;

        info!(%table, chain, position, "firewall rule deleted");
        self.notify("delete", table, chain, format!("position {}", position));
        Ok(())
    }

    /// Move the rule at `from` so it lands before the rule now at `to`.
    ///
    /// The rule is captured from `-S` output, deleted, and reinserted. A
    /// failure after the delete leaves the rule removed; re-list before retrying.
    pub async fn move_rule(&self, table: Table, chain: &str, from: u32, to: u32) -> Result<()> {
        validate_chain_name(chain)?;
        let _guard = self.locks.lock(chain_key(table, chain)).await;

        let specs = self.rule_specs(table, chain).await?;
        let len = specs.len() as u32;

        if from == 0 || from > len {
            return Err(Error::NotFound(format!(
                "rule {} in chain {} ({} rules)",
                from, chain, len
            )));
        }
        if to == 0 || to > len {
            return Err(Error::validation(
                "position",
                format!("destination {} is outside 1..={}", to, len),
            ));
        }
        if from == to {
            debug!(%table, chain, from, "move to same position, nothing to do");
            return Ok(());
        }

        let spec = &specs[(from - 1) as usize];
        let program = &self.programs.iptables;

        checked(&self.runner, &builder::delete_rule(program, table, chain, from)).await?;

        let destination = if to > from { to - 1 } else { to };
        checked(
            &self.runner,
            &builder::insert_spec(program, table, chain, destination, spec),
        )
        .await?;

        info!(%table, chain, from, to = destination, "firewall rule moved");
        self.notify("move", table, chain, format!("{} -> {}: {}", from, destination, spec));
        Ok(())
    }

    pub async fn create_chain(&self, table: Table, chain: &str) -> Result<()> {
        validate_chain_name(chain)?;
        let _guard = self.locks.lock(chain_key(table, chain)).await;

        checked(&self.runner, &builder::create_chain(&self.programs.iptables, table, chain)).await?;

        info!(%table, chain, "chain created");
        self.notify("create-chain", table, chain, String::new());
        Ok(())
    }

    /// `-X`. The tool refuses chains that still hold rules or are referenced.
    pub async fn delete_chain(&self, table: Table, chain: &str) -> Result<()> {
        validate_chain_name(chain)?;
        let _guard = self.locks.lock(chain_key(table, chain)).await;

        checked(&self.runner, &builder::delete_chain(&self.programs.iptables, table, chain)).await?;

        info!(%table, chain, "chain deleted");
        self.notify("delete-chain", table, chain, String::new());
        Ok(())
    }

    /// Flush one chain, or every chain of the table when `chain` is `None`.
    pub async fn flush(&self, table: Table, chain: Option<&str>) -> Result<()> {
        let key = match chain {
            Some(chain) => {
                validate_chain_name(chain)?;
                chain_key(table, chain)
            }
            None => LockKey::table(Domain::Firewall, table.as_str()),
        };
        let _guard = self.locks.lock(key).await;

        checked(&self.runner, &builder::flush(&self.programs.iptables, table, chain)).await?;

        let target = chain.unwrap_or("*");
        info!(%table, chain = target, "flushed");
        self.notify("flush", table, target, String::new());
        Ok(())
    }

    pub async fn set_policy(&self, table: Table, chain: &str, policy: DefaultPolicy) -> Result<()> {
        if !table.is_builtin_chain(chain) {
            return Err(Error::validation(
                "chain",
                format!("{} is not a built-in chain of the {} table", chain, table),
            ));
        }
        let _guard = self.locks.lock(chain_key(table, chain)).await;

        checked(
            &self.runner,
            &builder::set_policy(&self.programs.iptables, table, chain, policy),
        )
        .await?;

        info!(%table, chain, %policy, "default policy set");
        self.notify("set-policy", table, chain, policy.to_string());
        Ok(())
    }

    /// Raw `iptables-save` text for every table.
    pub async fn save_dump(&self) -> Result<String> {
        let output = checked(&self.runner, &builder::save(&self.programs.iptables_save)).await?;
        Ok(output.stdout)
    }

    /// Replace the whole ruleset with a saved dump.
    pub async fn restore_dump(&self, dump: &[u8]) -> Result<()> {
        let mut guards = Vec::with_capacity(Table::ALL.len());
        for table in Table::ALL {
            guards.push(self.locks.lock(LockKey::table(Domain::Firewall, table.as_str())).await);
        }

        checked(
            &self.runner,
            &builder::restore(&self.programs.iptables_restore, dump),
        )
        .await?;

        info!(bytes = dump.len(), "firewall ruleset restored");
        self.audit.record(&AuditEvent::new(
            Domain::Firewall,
            "restore",
            "*",
            format!("{} bytes", dump.len()),
        ));
        Ok(())
    }

    fn notify(&self, action: &str, table: Table, chain: &str, detail: String) {
        self.audit.record(&AuditEvent::new(
            Domain::Firewall,
            action,
            format!("{}/{}", table, chain),
            detail,
        ));
    }
}

fn chain_key(table: Table, chain: &str) -> LockKey {
    LockKey::scoped(Domain::Firewall, table.as_str(), chain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lr_core::testing::ScriptedRunner;
    use lr_core::{CommandOutput, Invocation};
    use std::sync::Mutex;

    /// Minimal in-memory INPUT chain answering `-S`, `-D` and `-I`.
    fn stateful_chain(rules: &[&str]) -> ScriptedRunner<impl Fn(&Invocation) -> CommandOutput + Send + Sync> {
        let state: Mutex<Vec<Vec<String>>> = Mutex::new(
            rules
                .iter()
                .map(|r| r.split_whitespace().map(String::from).collect())
                .collect(),
        );

        ScriptedRunner::new(move |inv: &Invocation| {
            let mut chain = state.lock().unwrap();
            match inv.args.get(2).map(String::as_str) {
                Some("-S") => {
                    let mut out = String::from("-P INPUT ACCEPT\n");
                    for args in chain.iter() {
                        out.push_str(&format!("-A INPUT {}\n", RuleSpec { args: args.clone() }));
                    }
                    CommandOutput::ok(out)
                }
                Some("-D") => {
                    let pos: usize = inv.args[4].parse().unwrap();
                    chain.remove(pos - 1);
                    CommandOutput::ok("")
                }
                Some("-I") => {
                    let pos: usize = inv.args[4].parse().unwrap();
                    chain.insert(pos - 1, inv.args[5..].to_vec());
                    CommandOutput::ok("")
                }
                _ => CommandOutput::failed(2, "unexpected invocation\n"),
            }
        })
    }

    fn manager<R: CommandRunner>(runner: R) -> FirewallManager<R> {
        FirewallManager::new(runner, Programs::default(), LockRegistry::shared())
            .with_audit(Arc::new(lr_core::NoopAudit))
    }

    const FIVE: [&str; 5] = [
        "-s 10.0.0.1/32 -j ACCEPT",
        "-s 10.0.0.2/32 -j ACCEPT",
        "-s 10.0.0.3/32 -j DROP",
        "-s 10.0.0.4/32 -j ACCEPT",
        "-s 10.0.0.5/32 -j ACCEPT",
    ];

    async fn sources<R: CommandRunner>(fw: &FirewallManager<R>) -> Vec<String> {
        fw.rule_specs(Table::Filter, "INPUT")
            .await
            .unwrap()
            .into_iter()
            .map(|spec| spec.args[1].clone())
            .collect()
    }

    #[tokio::test]
    async fn move_three_to_one_reorders_chain() {
        let runner = Arc::new(stateful_chain(&FIVE));
        let fw = manager(runner.clone());

        fw.move_rule(Table::Filter, "INPUT", 3, 1).await.unwrap();

        assert_eq!(
            sources(&fw).await,
            vec!["10.0.0.3/32", "10.0.0.1/32", "10.0.0.2/32", "10.0.0.4/32", "10.0.0.5/32"]
        );
        let lines = runner.command_lines();
        assert_eq!(lines[1], "iptables -t filter -D INPUT 3");
        assert_eq!(lines[2], "iptables -t filter -I INPUT 1 -s 10.0.0.3/32 -j DROP");
    }

    #[tokio::test]
    async fn move_down_adjusts_for_removed_rule() {
        let runner = Arc::new(stateful_chain(&FIVE));
        let fw = manager(runner.clone());

        fw.move_rule(Table::Filter, "INPUT", 1, 4).await.unwrap();

        assert_eq!(
            sources(&fw).await,
            vec!["10.0.0.2/32", "10.0.0.3/32", "10.0.0.1/32", "10.0.0.4/32", "10.0.0.5/32"]
        );
    }

    #[tokio::test]
    async fn move_validates_positions() {
        let runner = Arc::new(stateful_chain(&FIVE));
        let fw = manager(runner.clone());

        let err = fw.move_rule(Table::Filter, "INPUT", 6, 1).await.unwrap_err();
        assert_eq!(err.kind(), lr_core::ErrorKind::NotFound);

        let err = fw.move_rule(Table::Filter, "INPUT", 2, 9).await.unwrap_err();
        assert_eq!(err.kind(), lr_core::ErrorKind::Validation);

        fw.move_rule(Table::Filter, "INPUT", 2, 2).await.unwrap();
        // Only the three -S reads ran; nothing was deleted or inserted.
        assert!(runner.command_lines().iter().all(|l| l.contains(" -S ")));
    }

    #[tokio::test]
    async fn quoted_comment_survives_a_move() {
        let runner = Arc::new(stateful_chain(&["-j ACCEPT", "-j ACCEPT"]));
        let fw = manager(runner.clone());

        let mut input = FirewallRuleInput::new(Table::Filter, "INPUT", "DROP");
        input.position = Some(3);
        input.comment = Some("two words".into());
        fw.add_rule(&input).await.unwrap();

        fw.move_rule(Table::Filter, "INPUT", 3, 1).await.unwrap();

        let specs = fw.rule_specs(Table::Filter, "INPUT").await.unwrap();
        assert_eq!(specs.len(), 3);
        assert_eq!(specs[0].args, vec!["-m", "comment", "--comment", "two words", "-j", "DROP"]);
    }

    #[tokio::test]
    async fn tool_failure_is_surfaced_verbatim() {
        let runner = ScriptedRunner::new(|_: &Invocation| {
            CommandOutput::failed(1, "iptables: Directory not empty.\n")
        });
        let fw = manager(runner);
        let err = fw.delete_chain(Table::Filter, "WEB").await.unwrap_err();
        assert_eq!(err.to_string(), "iptables: Directory not empty.\n");
    }

    #[tokio::test]
    async fn set_policy_only_on_builtin_chains() {
        let runner = lr_core::testing::always("");
        let fw = manager(runner);

        let err = fw
            .set_policy(Table::Filter, "DOCKER", DefaultPolicy::Drop)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), lr_core::ErrorKind::Validation);

        let err = fw
            .set_policy(Table::Raw, "FORWARD", DefaultPolicy::Accept)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), lr_core::ErrorKind::Validation);

        fw.set_policy(Table::Filter, "FORWARD", DefaultPolicy::Drop)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn get_chain_reports_missing_chain() {
        let runner = lr_core::testing::always("");
        let fw = manager(runner);
        let err = fw.get_chain(Table::Filter, "NOPE").await.unwrap_err();
        assert_eq!(err.kind(), lr_core::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn mutations_are_audited() {
        #[derive(Default)]
        struct Collect(Mutex<Vec<AuditEvent>>);
        impl AuditSink for Collect {
            fn record(&self, event: &AuditEvent) {
                self.0.lock().unwrap().push(event.clone());
            }
        }

        let sink = Arc::new(Collect::default());
        let fw = FirewallManager::new(lr_core::testing::always(""), Programs::default(), LockRegistry::shared())
            .with_audit(sink.clone());

        fw.add_rule(&FirewallRuleInput::new(Table::Filter, "INPUT", "ACCEPT"))
            .await
            .unwrap();
        fw.flush(Table::Nat, None).await.unwrap();

        let events = sink.0.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, "append");
        assert_eq!(events[0].target, "filter/INPUT");
        assert_eq!(events[0].detail, "-j ACCEPT");
        assert_eq!(events[1].target, "nat/*");
    }
}
