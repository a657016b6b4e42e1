// Routing-table name registry (rt_tables and its .d drop-ins)
use lr_core::{Error, Result, RoutingTable};
use regex::Regex;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::LazyLock;
use tracing::debug;

pub const DEFAULT_REGISTRY: &str = "/etc/iproute2/rt_tables";

static TABLE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d+)\s+(\S+)").expect("valid rt_tables regex"));

/// Tables the kernel always has, used when the registry file is missing.
pub fn builtin_tables() -> Vec<RoutingTable> {
    vec![
        RoutingTable { id: 255, name: "local".to_string() },
        RoutingTable { id: 254, name: "main".to_string() },
        RoutingTable { id: 253, name: "default".to_string() },
    ]
}

pub fn parse_registry(text: &str) -> Vec<RoutingTable> {
    text.lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .filter_map(|line| {
            let caps = TABLE_LINE.captures(line)?;
            let id = caps[1].parse().ok()?;
            Some(RoutingTable {
                id,
                name: caps[2].to_string(),
            })
        })
        .collect()
}

/// Read the registry plus `<dir>/rt_tables.d/*.conf` in file-name order.
pub fn load_registry(path: &Path) -> Result<Vec<RoutingTable>> {
    let mut tables = match std::fs::read_to_string(path) {
        Ok(text) => parse_registry(&text),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "no table registry, using built-in tables");
            builtin_tables()
        }
        Err(e) => return Err(Error::io_at(path, e)),
    };

    let Some(dropins) = path.parent().map(|dir| dir.join("rt_tables.d")) else {
        return Ok(tables);
    };
    let entries = match std::fs::read_dir(&dropins) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(tables),
        Err(e) => return Err(Error::io_at(&dropins, e)),
    };

    let mut files: Vec<_> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("conf"))
        .collect();
    files.sort();

    for file in files {
        let text = std::fs::read_to_string(&file).map_err(|e| Error::io_at(&file, e))?;
        for table in parse_registry(&text) {
            if !tables.iter().any(|t| t.id == table.id && t.name == table.name) {
                tables.push(table);
            }
        }
    }

    Ok(tables)
}

/// Numeric id for a table given by name or number; `None` when unregistered.
pub fn resolve_table_id(tables: &[RoutingTable], table: &str) -> Option<u32> {
    table
        .parse()
        .ok()
        .or_else(|| tables.iter().find(|t| t.name == table).map(|t| t.id))
}
