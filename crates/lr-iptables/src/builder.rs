// Intent -> iptables invocation. No I/O here.
use lr_core::selector::{address, present, protocol};
use lr_core::{DefaultPolicy, FirewallRuleInput, Invocation, RuleSpec, Table};

fn table_command(program: &str, table: Table) -> Invocation {
    Invocation::new(program).args(["-t", table.as_str()])
}

/// `-t T -L [chain] -n -v --line-numbers`
pub fn list(program: &str, table: Table, chain: Option<&str>) -> Invocation {
    let mut inv = table_command(program, table).arg("-L");
    if let Some(chain) = present(chain) {
        inv.push(chain);
    }
    inv.args(["-n", "-v", "--line-numbers"])
}

pub fn list_specs(program: &str, table: Table, chain: &str) -> Invocation {
    table_command(program, table).args(["-S", chain])
}

/// Append or insert, depending on `input.position`.
pub fn add_rule(program: &str, input: &FirewallRuleInput) -> Invocation {
    let mut inv = table_command(program, input.table);
    match input.position {
        Some(position) => {
            inv = inv.args(["-I", input.chain.as_str()]).arg(position.to_string());
        }
        None => {
            inv = inv.args(["-A", input.chain.as_str()]);
        }
    }
    inv.args(match_args(input))
}

/// Match and jump arguments shared by append and insert.
pub fn match_args(input: &FirewallRuleInput) -> Vec<String> {
    let mut inv = Invocation::new("");
    inv.push_opt("-p", protocol(input.protocol.as_deref()));
    inv.push_opt("-s", address(input.source.as_deref()));
    inv.push_opt("-d", address(input.destination.as_deref()));
    inv.push_opt("-i", present(input.in_interface.as_deref()));
    inv.push_opt("-o", present(input.out_interface.as_deref()));
    inv.push_opt("--sport", present(input.sport.as_deref()));
    inv.push_opt("--dport", present(input.dport.as_deref()));
    if let Some(state) = present(input.state.as_deref()) {
        inv.push("-m");
        inv.push("state");
        inv.push("--state");
        inv.push(state);
    }
    if let Some(comment) = present(input.comment.as_deref()) {
        inv.push("-m");
        inv.push("comment");
        inv.push("--comment");
        inv.push(comment);
    }
    inv.push("-j");
    inv.push(input.target.trim());
    inv.push_opt("--to-destination", present(input.to_destination.as_deref()));
    inv.push_opt("--to-source", present(input.to_source.as_deref()));
    inv.args
}

/// Reinsert a captured rule at `position`.
pub fn insert_spec(program: &str, table: Table, chain: &str, position: u32, spec: &RuleSpec) -> Invocation {
    table_command(program, table)
        .args(["-I", chain])
        .arg(position.to_string())
        .args(spec.args.iter().cloned())
}

pub fn delete_rule(program: &str, table: Table, chain: &str, position: u32) -> Invocation {
    table_command(program, table)
        .args(["-D", chain])
        .arg(position.to_string())
}

pub fn create_chain(program: &str, table: Table, chain: &str) -> Invocation {
    table_command(program, table).args(["-N", chain])
}

pub fn delete_chain(program: &str, table: Table, chain: &str) -> Invocation {
    table_command(program, table).args(["-X", chain])
}

/// `-F [chain]`; without a chain the whole table is flushed.
pub fn flush(program: &str, table: Table, chain: Option<&str>) -> Invocation {
    let mut inv = table_command(program, table).arg("-F");
    if let Some(chain) = present(chain) {
        inv.push(chain);
    }
    inv
}

pub fn set_policy(program: &str, table: Table, chain: &str, policy: DefaultPolicy) -> Invocation {
    table_command(program, table).args(["-P", chain, policy.as_str()])
}

pub fn save(program: &str) -> Invocation {
    Invocation::new(program)
}

/// Bulk replace from a saved dump fed on stdin.
pub fn restore(program: &str, dump: &[u8]) -> Invocation {
    Invocation::new(program).with_stdin(dump.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(inv: &Invocation) -> String {
        inv.to_string()
    }

    #[test]
    fn append_omits_match_all_selectors() {
        let mut input = FirewallRuleInput::new(Table::Filter, "INPUT", "ACCEPT");
        input.protocol = Some("all".into());
        input.source = Some("0.0.0.0/0".into());
        input.destination = Some("".into());
        input.in_interface = Some("eth0".into());

        assert_eq!(
            line(&add_rule("iptables", &input)),
            "iptables -t filter -A INPUT -i eth0 -j ACCEPT"
        );
    }

    #[test]
    fn full_rule_uses_canonical_argument_order() {
        let mut input = FirewallRuleInput::new(Table::Nat, "PREROUTING", "DNAT");
        input.position = Some(2);
        input.protocol = Some("tcp".into());
        input.source = Some("203.0.113.0/24".into());
        input.destination = Some("198.51.100.7".into());
        input.in_interface = Some("wan0".into());
        input.sport = Some("1024:65535".into());
        input.dport = Some("443".into());
        input.state = Some("NEW".into());
        input.comment = Some("https forward".into());
        input.to_destination = Some("10.0.0.5:8443".into());

        assert_eq!(
            add_rule("iptables", &input).args,
            vec![
                "-t", "nat", "-I", "PREROUTING", "2", "-p", "tcp", "-s", "203.0.113.0/24", "-d",
                "198.51.100.7", "-i", "wan0", "--sport", "1024:65535", "--dport", "443", "-m",
                "state", "--state", "NEW", "-m", "comment", "--comment", "https forward", "-j",
                "DNAT", "--to-destination", "10.0.0.5:8443",
            ]
        );
    }

    #[test]
    fn snat_target_option_follows_jump() {
        let mut input = FirewallRuleInput::new(Table::Nat, "POSTROUTING", "SNAT");
        input.out_interface = Some("wan0".into());
        input.to_source = Some("198.51.100.1".into());
        assert_eq!(
            line(&add_rule("iptables", &input)),
            "iptables -t nat -A POSTROUTING -o wan0 -j SNAT --to-source 198.51.100.1"
        );
    }

    #[test]
    fn chain_lifecycle_commands() {
        assert_eq!(
            line(&list("iptables", Table::Mangle, None)),
            "iptables -t mangle -L -n -v --line-numbers"
        );
        assert_eq!(
            line(&list("iptables", Table::Filter, Some("INPUT"))),
            "iptables -t filter -L INPUT -n -v --line-numbers"
        );
        assert_eq!(line(&flush("iptables", Table::Raw, None)), "iptables -t raw -F");
        assert_eq!(
            line(&flush("iptables", Table::Filter, Some("WEB"))),
            "iptables -t filter -F WEB"
        );
        assert_eq!(
            line(&set_policy("iptables", Table::Filter, "FORWARD", DefaultPolicy::Drop)),
            "iptables -t filter -P FORWARD DROP"
        );
        assert_eq!(
            line(&delete_rule("iptables", Table::Filter, "INPUT", 3)),
            "iptables -t filter -D INPUT 3"
        );
    }

    #[test]
    fn captured_spec_is_reinserted_verbatim() {
        let spec = RuleSpec {
            args: vec!["-s".into(), "10.0.0.3/32".into(), "-j".into(), "DROP".into()],
        };
        assert_eq!(
            line(&insert_spec("iptables", Table::Filter, "INPUT", 1, &spec)),
            "iptables -t filter -I INPUT 1 -s 10.0.0.3/32 -j DROP"
        );
    }

    #[test]
    fn restore_carries_dump_on_stdin() {
        let inv = restore("iptables-restore", b"*filter\nCOMMIT\n");
        assert!(inv.args.is_empty());
        assert_eq!(inv.stdin.as_deref(), Some(&b"*filter\nCOMMIT\n"[..]));
    }
}
