// Parsers for `iptables -L -n -v --line-numbers` and `iptables -S` output
use lr_core::{ChainInfo, Error, FirewallRule, Policy, Result, RuleSpec};
use regex::Regex;
use std::sync::LazyLock;
use tracing::debug;

static POLICY_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Chain (\S+) \(policy (\S+) (\d+[KMGT]?) packets, (\d+[KMGT]?) bytes\)")
        .expect("valid policy header regex")
});

static REFERENCE_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Chain (\S+) \((\d+) references?\)").expect("valid reference header regex")
});

/// Decode a listing counter. `K`, `M`, `G` and `T` scale by powers of 1024.
///
/// Returns `None` for anything that is not a counter or does not fit in a `u64`.
pub fn parse_counter(value: &str) -> Option<u64> {
    let (digits, scale) = match value.as_bytes().last()? {
        b'K' => (&value[..value.len() - 1], 1u64 << 10),
        b'M' => (&value[..value.len() - 1], 1u64 << 20),
        b'G' => (&value[..value.len() - 1], 1u64 << 30),
        b'T' => (&value[..value.len() - 1], 1u64 << 40),
        _ => (value, 1),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u64>().ok()?.checked_mul(scale)
}

/// Parse a full chain listing into chains in source order.
pub fn parse_listing(text: &str) -> Result<Vec<ChainInfo>> {
    let mut chains: Vec<ChainInfo> = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(chain) = parse_header(line)? {
            chains.push(chain);
            continue;
        }

        if is_column_header(line) {
            continue;
        }

        let Some(chain) = chains.last_mut() else {
            return Err(Error::parse("iptables listing", line));
        };

        match parse_rule_line(line) {
            Some(rule) => chain.rules.push(rule),
            None => debug!(chain = %chain.name, line, "skipping malformed rule line"),
        }
    }

    Ok(chains)
}

fn parse_header(line: &str) -> Result<Option<ChainInfo>> {
    if let Some(caps) = POLICY_HEADER.captures(line) {
        let policy = Policy::parse(&caps[2]).ok_or_else(|| Error::parse("chain policy", line))?;
        let packets = parse_counter(&caps[3]).ok_or_else(|| Error::parse("chain counters", line))?;
        let bytes = parse_counter(&caps[4]).ok_or_else(|| Error::parse("chain counters", line))?;
        return Ok(Some(ChainInfo {
            name: caps[1].to_string(),
            policy: Some(policy),
            references: None,
            packets,
            bytes,
            rules: Vec::new(),
        }));
    }

    if let Some(caps) = REFERENCE_HEADER.captures(line) {
        let references = caps[2]
            .parse()
            .map_err(|_| Error::parse("chain references", line))?;
        return Ok(Some(ChainInfo {
            name: caps[1].to_string(),
            policy: None,
            references: Some(references),
            packets: 0,
            bytes: 0,
            rules: Vec::new(),
        }));
    }

    if line.starts_with("Chain ") {
        return Err(Error::parse("chain header", line));
    }

    Ok(None)
}

fn is_column_header(line: &str) -> bool {
    line.starts_with("num ") || line.starts_with("pkts ")
}

// The options column is always one of these; seeing it where the protocol
// belongs means the target column was empty.
fn is_opt_field(field: &str) -> bool {
    matches!(field, "--" | "-f" | "!f")
}

fn parse_rule_line(line: &str) -> Option<FirewallRule> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 9 {
        return None;
    }

    let position: u32 = fields[0].parse().ok()?;
    let packets = parse_counter(fields[1])?;
    let bytes = parse_counter(fields[2])?;

    let has_target = !is_opt_field(fields[4]);
    let (target, start) = if has_target { (fields[3], 4) } else { ("", 3) };
    if fields.len() < start + 6 {
        return None;
    }

    Some(FirewallRule {
        position,
        packets,
        bytes,
        target: target.to_string(),
        protocol: fields[start].to_string(),
        opt: fields[start + 1].to_string(),
        in_interface: fields[start + 2].to_string(),
        out_interface: fields[start + 3].to_string(),
        source: fields[start + 4].to_string(),
        destination: fields[start + 5].to_string(),
        extra: fields[start + 6..].join(" "),
    })
}

/// Split one `-S` line into arguments, honoring double quotes and `\"` escapes.
pub fn tokenize(line: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quoted = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                quoted = !quoted;
                in_token = true;
            }
            '\\' if quoted => match chars.next() {
                Some(next) => current.push(next),
                None => return Err(Error::parse("rule spec", line)),
            },
            c if c.is_whitespace() && !quoted => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }

    if quoted {
        return Err(Error::parse("rule spec", line));
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Rules of `chain` from `iptables -S` output, in chain order.
pub fn parse_rule_specs(text: &str, chain: &str) -> Result<Vec<RuleSpec>> {
    let mut specs = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if !line.starts_with("-A ") {
            continue;
        }
        let tokens = tokenize(line)?;
        if tokens.get(1).map(String::as_str) != Some(chain) {
            continue;
        }
        specs.push(RuleSpec {
            args: tokens[2..].to_vec(),
        });
    }
    Ok(specs)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILTER_LISTING: &str = "\
Chain INPUT (policy DROP 253K packets, 49M bytes)
num   pkts bytes target     prot opt in     out     source               destination
1     1234  98K ACCEPT     all  --  lo     *       0.0.0.0/0            0.0.0.0/0
2        0     0 ACCEPT     tcp  --  eth0   *       10.0.0.0/8           0.0.0.0/0            tcp dpt:22 /* ssh from lan */
3       12   720 DOCKER     all  --  *      *       0.0.0.0/0            0.0.0.0/0

Chain FORWARD (policy ACCEPT 0 packets, 0 bytes)
num   pkts bytes target     prot opt in     out     source               destination

Chain OUTPUT (policy ACCEPT 1G packets, 2T bytes)
num   pkts bytes target     prot opt in     out     source               destination

Chain DOCKER (1 references)
num   pkts bytes target     prot opt in     out     source               destination
1        5   300            all  --  *      *       172.17.0.0/16        0.0.0.0/0
";

    #[test]
    fn counters_scale_by_1024() {
        assert_eq!(parse_counter("253K"), Some(259_072));
        assert_eq!(parse_counter("49M"), Some(51_380_224));
        assert_eq!(parse_counter("3G"), Some(3 * 1024 * 1024 * 1024));
        assert_eq!(parse_counter("17"), Some(17));
        assert_eq!(parse_counter("K"), None);
        assert_eq!(parse_counter("12X"), None);
        assert_eq!(parse_counter("99999999999999T"), None);
    }

    #[test]
    fn chains_are_listed_in_source_order() {
        let chains = parse_listing(FILTER_LISTING).unwrap();
        let names: Vec<_> = chains.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["INPUT", "FORWARD", "OUTPUT", "DOCKER"]);

        let input = &chains[0];
        assert_eq!(input.policy, Some(Policy::Drop));
        assert_eq!(input.packets, 259_072);
        assert_eq!(input.bytes, 51_380_224);
        assert_eq!(input.rules.len(), 3);
        assert_eq!(
            input.rules.iter().map(|r| r.position).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        let output = &chains[2];
        assert_eq!(output.packets, 1 << 30);
        assert_eq!(output.bytes, 2 << 40);
    }

    #[test]
    fn rule_fields_are_extracted() {
        let chains = parse_listing(FILTER_LISTING).unwrap();
        let ssh = chains[0].rule_at(2).unwrap();
        assert_eq!(ssh.target, "ACCEPT");
        assert_eq!(ssh.protocol, "tcp");
        assert_eq!(ssh.opt, "--");
        assert_eq!(ssh.in_interface, "eth0");
        assert_eq!(ssh.out_interface, "*");
        assert_eq!(ssh.source, "10.0.0.0/8");
        assert_eq!(ssh.destination, "0.0.0.0/0");
        assert_eq!(ssh.extra, "tcp dpt:22 /* ssh from lan */");

        let lo = chains[0].rule_at(1).unwrap();
        assert_eq!(lo.bytes, 98 * 1024);
        assert_eq!(lo.extra, "");
    }

    #[test]
    fn user_chain_has_references_and_no_policy() {
        let chains = parse_listing(FILTER_LISTING).unwrap();
        let docker = &chains[3];
        assert_eq!(docker.policy, None);
        assert_eq!(docker.references, Some(1));
        assert!(!docker.is_builtin());

        let rule = &docker.rules[0];
        assert_eq!(rule.target, "");
        assert_eq!(rule.protocol, "all");
        assert_eq!(rule.source, "172.17.0.0/16");
    }

    #[test]
    fn malformed_rule_lines_are_skipped() {
        let text = "\
Chain INPUT (policy ACCEPT 0 packets, 0 bytes)
1 garbage
x     1  1 ACCEPT all -- * * 0.0.0.0/0 0.0.0.0/0
2     0  0 ACCEPT all -- * * 0.0.0.0/0 0.0.0.0/0
";
        let chains = parse_listing(text).unwrap();
        assert_eq!(chains[0].rules.len(), 1);
        assert_eq!(chains[0].rules[0].position, 2);
    }

    #[test]
    fn text_without_headers_is_a_parse_error() {
        assert!(parse_listing("").unwrap().is_empty());
        assert!(parse_listing("\n\n").unwrap().is_empty());

        let err = parse_listing("iptables v1.8.9 (nf_tables): something odd\n").unwrap_err();
        assert_eq!(err.kind(), lr_core::ErrorKind::Parse);

        let err = parse_listing("1 0 0 ACCEPT all -- * * 0.0.0.0/0 0.0.0.0/0\nChain INPUT (policy ACCEPT 0 packets, 0 bytes)\n")
            .unwrap_err();
        assert_eq!(err.kind(), lr_core::ErrorKind::Parse);
    }

    #[test]
    fn rule_specs_keep_quoted_arguments() {
        let text = "\
-P INPUT ACCEPT
-N WEB
-A INPUT -i lo -j ACCEPT
-A INPUT -p tcp -m tcp --dport 80 -m comment --comment \"web \\\"front\\\" door\" -j WEB
-A WEB -j RETURN
";
        let specs = parse_rule_specs(text, "INPUT").unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].args, vec!["-i", "lo", "-j", "ACCEPT"]);
        assert_eq!(specs[1].args[9], "web \"front\" door");
        assert_eq!(specs[1].args.last().map(String::as_str), Some("WEB"));

        assert_eq!(parse_rule_specs(text, "WEB").unwrap().len(), 1);
    }

    #[test]
    fn unterminated_quote_is_rejected() {
        assert!(tokenize("-A INPUT -m comment --comment \"oops").is_err());
        assert_eq!(tokenize("a \"\" b").unwrap(), vec!["a", "", "b"]);
    }
}
