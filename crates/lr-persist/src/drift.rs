// Stored-vs-live comparison
use lr_core::Domain;
use regex::Regex;
use similar::{ChangeTag, TextDiff};
use std::collections::BTreeMap;
use std::sync::LazyLock;

static CHAIN_COUNTERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*\[\d+:\d+\]\s*$").expect("valid counter pattern"));

/// Outcome of comparing one domain's snapshot with the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Drift {
    pub domain: Domain,
    /// Line diff from stored to live; `None` when both agree.
    pub diff: Option<String>,
}

impl Drift {
    pub fn compare(domain: Domain, stored: &str, live: &str) -> Self {
        let diff = (stored != live).then(|| render_diff(stored, live));
        Self { domain, diff }
    }

    pub fn in_sync(&self) -> bool {
        self.diff.is_none()
    }

    pub fn display(&self) {
        match &self.diff {
            None => println!("✅ {}: live state matches snapshot", self.domain),
            Some(diff) => {
                println!("⚠️  {}: live state differs from snapshot", self.domain);
                println!("{}", diff);
            }
        }
    }
}

/// `iptables-save` text without `#` comment lines and with chain counters zeroed.
pub fn normalize_dump(dump: &str) -> String {
    let mut out = String::new();
    for line in dump.lines() {
        let line = line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.starts_with(':') {
            out.push_str(&CHAIN_COUNTERS.replace(line, ""));
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }
    out
}

/// Per-table route lines flattened as `<table>: <line>`.
pub fn render_tables(tables: &BTreeMap<String, Vec<String>>) -> String {
    let mut out = String::new();
    for (table, lines) in tables {
        for line in lines {
            out.push_str(table);
            out.push_str(": ");
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

fn render_diff(stored: &str, live: &str) -> String {
    let diff = TextDiff::from_lines(stored, live);
    let mut output = String::new();

    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            ChangeTag::Delete => '-',
            ChangeTag::Insert => '+',
            ChangeTag::Equal => ' ',
        };
        output.push(sign);
        output.push_str(change.value());
        if change.missing_newline() {
            output.push('\n');
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_comments_and_counters_are_ignored() {
        let stored = "# Generated by iptables-save v1.8.7 on Mon\n*filter\n:INPUT ACCEPT [120:9000]\n-A INPUT -p tcp --dport 22 -j ACCEPT\nCOMMIT\n# Completed\n";
        let live = "# Generated by iptables-save v1.8.7 on Tue\n*filter\n:INPUT ACCEPT [0:0]\n-A INPUT -p tcp --dport 22 -j ACCEPT\nCOMMIT\n";

        assert_eq!(normalize_dump(stored), normalize_dump(live));
        assert!(Drift::compare(Domain::Firewall, &normalize_dump(stored), &normalize_dump(live)).in_sync());
    }

    #[test]
    fn changed_line_shows_both_sides() {
        let drift = Drift::compare(
            Domain::Rules,
            "priority 100 from 10.0.0.0/24 lookup 100\n",
            "priority 100 from 10.0.0.0/24 lookup 200\n",
        );
        let diff = drift.diff.unwrap();
        assert!(diff.contains("-priority 100 from 10.0.0.0/24 lookup 100\n"));
        assert!(diff.contains("+priority 100 from 10.0.0.0/24 lookup 200\n"));
    }

    #[test]
    fn tables_render_in_name_order() {
        let mut tables = BTreeMap::new();
        tables.insert("main".to_string(), vec!["default via 10.0.0.1 dev eth0".to_string()]);
        tables.insert("100".to_string(), vec!["10.8.0.0/16 dev wg0".to_string()]);
        assert_eq!(
            render_tables(&tables),
            "100: 10.8.0.0/16 dev wg0\nmain: default via 10.0.0.1 dev eth0\n"
        );
    }
}
