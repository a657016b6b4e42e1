use lr_core::selector::present;
use lr_core::{
    AuditEvent, AuditSink, CommandRunner, Domain, Error, Invocation, LockKey, LockRegistry,
    MAIN_TABLE, Programs, Result, Route, RouteInput, RoutingTable, TracingAudit, checked,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Route type keywords that may precede the destination.
const ROUTE_TYPES: [&str; 10] = [
    "unicast",
    "local",
    "broadcast",
    "multicast",
    "unreachable",
    "blackhole",
    "prohibit",
    "throw",
    "nat",
    "anycast",
];

/// Listing argument that asks for every table at once.
pub const ALL_TABLES: &str = "all";

/// Result of replaying one stored line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    Added,
    AlreadyPresent,
}

#[derive(Debug, PartialEq, Eq)]
enum RouteToken<'a> {
    Via(&'a str),
    Dev(&'a str),
    Proto(&'a str),
    Scope(&'a str),
    Src(&'a str),
    Metric(&'a str),
    Table(&'a str),
    Other(&'a str),
}

fn keyed_route_token<'a>(word: &str, value: &'a str) -> Option<RouteToken<'a>> {
    match word {
        "via" => Some(RouteToken::Via(value)),
        "dev" => Some(RouteToken::Dev(value)),
        "proto" => Some(RouteToken::Proto(value)),
        "scope" => Some(RouteToken::Scope(value)),
        "src" => Some(RouteToken::Src(value)),
        "metric" => Some(RouteToken::Metric(value)),
        "table" => Some(RouteToken::Table(value)),
        _ => None,
    }
}

fn scan_route_tokens<'a>(parts: &[&'a str]) -> Vec<RouteToken<'a>> {
    let mut tokens = Vec::new();
    let mut iter = parts.iter().copied().peekable();
    while let Some(word) = iter.next() {
        let keyed = iter.peek().copied().and_then(|value| keyed_route_token(word, value));
        match keyed {
            Some(token) => {
                iter.next();
                tokens.push(token);
            }
            None => tokens.push(RouteToken::Other(word)),
        }
    }
    tokens
}

/// Parse one `ip route show` line. `default_table` fills in when the line names none.
pub fn parse_route_line(line: &str, default_table: &str) -> Option<Route> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let (route_type, rest) = match parts.split_first()? {
        (first, rest) if ROUTE_TYPES.contains(first) && !rest.is_empty() => {
            (Some(first.to_string()), rest)
        }
        _ => (None, &parts[..]),
    };
    let (destination, rest) = rest.split_first()?;

    let mut route = Route {
        route_type,
        destination: destination.to_string(),
        table: default_table.to_string(),
        ..Route::default()
    };

    for token in scan_route_tokens(rest) {
        match token {
            RouteToken::Via(gw) => route.gateway = Some(gw.to_string()),
            RouteToken::Dev(dev) => route.interface = Some(dev.to_string()),
            RouteToken::Proto(proto) => route.protocol = Some(proto.to_string()),
            RouteToken::Scope(scope) => route.scope = Some(scope.to_string()),
            RouteToken::Src(src) => route.source = Some(src.to_string()),
            RouteToken::Metric(metric) => match metric.parse() {
                Ok(metric) => route.metric = Some(metric),
                Err(_) => debug!(line, metric, "ignoring non-numeric metric"),
            },
            RouteToken::Table(table) => route.table = table.to_string(),
            RouteToken::Other(_) => {}
        }
    }

    Some(route)
}

pub fn parse_routes(text: &str, default_table: &str) -> Vec<Route> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| parse_route_line(line, default_table))
        .collect()
}

/// Stored form: `[type] dest [via gw] [dev if] [metric m]`.
pub fn canonical_line(route: &Route) -> String {
    let mut line = String::new();
    if let Some(kind) = route.route_type.as_deref().filter(|t| *t != "unicast") {
        line.push_str(kind);
        line.push(' ');
    }
    line.push_str(&route.destination);
    if let Some(gw) = present(route.gateway.as_deref()) {
        line.push_str(" via ");
        line.push_str(gw);
    }
    if let Some(dev) = present(route.interface.as_deref()) {
        line.push_str(" dev ");
        line.push_str(dev);
    }
    if let Some(metric) = route.metric.filter(|m| *m > 0) {
        line.push_str(&format!(" metric {}", metric));
    }
    line
}

fn table_selector(table: &str) -> Option<&str> {
    present(Some(table)).filter(|t| *t != MAIN_TABLE)
}

pub fn list_command(program: &str, table: &str) -> Invocation {
    let mut inv = Invocation::new(program).args(["route", "show"]);
    inv.push_opt("table", table_selector(table));
    inv
}

pub fn add_command(program: &str, input: &RouteInput) -> Invocation {
    let mut inv = Invocation::new(program).args(["route", "add", input.destination.trim()]);
    inv.push_opt("via", present(input.gateway.as_deref()));
    inv.push_opt("dev", present(input.interface.as_deref()));
    if let Some(metric) = input.metric.filter(|m| *m > 0) {
        inv.push("metric");
        inv.push(metric.to_string());
    }
    inv.push_opt("table", table_selector(input.table_name()));
    inv
}

pub fn delete_command(program: &str, input: &RouteInput) -> Invocation {
    let mut inv = Invocation::new(program).args(["route", "del", input.destination.trim()]);
    inv.push_opt("via", present(input.gateway.as_deref()));
    inv.push_opt("dev", present(input.interface.as_deref()));
    inv.push_opt("table", table_selector(input.table_name()));
    inv
}

pub fn flush_command(program: &str, table: &str) -> Invocation {
    Invocation::new(program).args(["route", "flush", "table", table])
}

/// `ip route add` from a stored canonical line.
pub fn replay_command(program: &str, table: &str, line: &str) -> Invocation {
    let mut inv = Invocation::new(program)
        .args(["route", "add"])
        .args(line.split_whitespace());
    inv.push_opt("table", table_selector(table));
    inv
}

/// Route coordinator over `ip route`.
pub struct RouteManager<R> {
    runner: R,
    programs: Programs,
    registry: PathBuf,
    locks: Arc<LockRegistry>,
    audit: Arc<dyn AuditSink>,
}

impl<R: CommandRunner> RouteManager<R> {
    pub fn new(runner: R, programs: Programs, locks: Arc<LockRegistry>) -> Self {
        Self {
            runner,
            programs,
            registry: PathBuf::from(crate::tables::DEFAULT_REGISTRY),
            locks,
            audit: Arc::new(TracingAudit),
        }
    }

    pub fn with_registry(mut self, path: impl Into<PathBuf>) -> Self {
        self.registry = path.into();
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub async fn list(&self, table: &str) -> Result<Vec<Route>> {
        let table = present(Some(table)).unwrap_or(MAIN_TABLE);
        let output = checked(&self.runner, &list_command(&self.programs.ip, table)).await?;
        Ok(parse_routes(&output.stdout, table))
    }

    /// Every table at once; lines without `table` belong to `main`.
    pub async fn list_all(&self) -> Result<Vec<Route>> {
        let output = checked(&self.runner, &list_command(&self.programs.ip, ALL_TABLES)).await?;
        Ok(parse_routes(&output.stdout, MAIN_TABLE))
    }

    pub async fn add(&self, input: &RouteInput) -> Result<()> {
        input.validate_for_add()?;
        let table = input.table_name();
        let _guard = self.locks.lock(self.lock_key(table)).await;

        let inv = add_command(&self.programs.ip, input);
        checked(&self.runner, &inv).await?;

        info!(table, destination = %input.destination, "route added");
        self.notify("add", table, &inv);
        Ok(())
    }

    pub async fn delete(&self, input: &RouteInput) -> Result<()> {
        input.validate_for_delete()?;
        let table = input.table_name();
        let _guard = self.locks.lock(self.lock_key(table)).await;

        let inv = delete_command(&self.programs.ip, input);
        checked(&self.runner, &inv).await?;

        info!(table, destination = %input.destination, "route deleted");
        self.notify("delete", table, &inv);
        Ok(())
    }

    pub async fn flush(&self, table: &str) -> Result<()> {
        let table = present(Some(table))
            .ok_or_else(|| Error::validation("table", "a table is required for flush"))?;
        let _guard = self.locks.lock(self.lock_key(table)).await;

        let inv = flush_command(&self.programs.ip, table);
        checked(&self.runner, &inv).await?;

        info!(table, "route table flushed");
        self.notify("flush", table, &inv);
        Ok(())
    }

    /// Re-add one stored line. An entry the kernel already has is not an error.
    pub async fn replay(&self, table: &str, line: &str) -> Result<ReplayOutcome> {
        let _guard = self.locks.lock(self.lock_key(table)).await;

        let inv = replay_command(&self.programs.ip, table, line);
        match checked(&self.runner, &inv).await {
            Ok(_) => {
                self.notify("restore", table, &inv);
                Ok(ReplayOutcome::Added)
            }
            Err(err) if err.is_already_exists() => {
                debug!(table, line, "route already present");
                Ok(ReplayOutcome::AlreadyPresent)
            }
            Err(err) => Err(err),
        }
    }

    pub fn routing_tables(&self) -> Result<Vec<RoutingTable>> {
        crate::tables::load_registry(&self.registry)
    }

    /// `vpn` and `100` are the same kernel table and must share one lock.
    fn lock_key(&self, table: &str) -> LockKey {
        let id = match crate::tables::load_registry(&self.registry) {
            Ok(tables) => crate::tables::resolve_table_id(&tables, table),
            Err(err) => {
                debug!(error = %err, "table registry unreadable, locking by name");
                None
            }
        };
        match id {
            Some(id) => LockKey::table(Domain::Routes, id.to_string()),
            None => LockKey::table(Domain::Routes, table),
        }
    }

    fn notify(&self, action: &str, table: &str, inv: &Invocation) {
        self.audit.record(&AuditEvent::new(
            Domain::Routes,
            action,
            table,
            inv.args.join(" "),
        ));
    }
}
