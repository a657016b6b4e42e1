// Snapshot and restore of firewall, route and rule state
use crate::archive::{self, ImportSummary};
use crate::drift::{self, Drift};
use crate::report::{DomainOutcome, DomainStats, RestoreReport};
use crate::store::{atomic_write, content_lines, read_optional, render_lines};
use lr_core::{AuditSink, CommandRunner, Domain, Error, LockRegistry, Result, Route, Settings};
use lr_iproute::{ReplayOutcome, RouteManager, RuleManager};
use lr_iptables::FirewallManager;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Persistence engine over the three coordinators.
///
/// Each persisted domain has its own gate, so a save and a restore of the
/// same domain never interleave. Export and import hold all three.
pub struct PersistEngine<R> {
    settings: Settings,
    firewall: FirewallManager<R>,
    routes: RouteManager<R>,
    rules: RuleManager<R>,
    gates: [Mutex<()>; 3],
}

impl<R: CommandRunner + Clone> PersistEngine<R> {
    pub fn new(runner: R, settings: Settings, locks: Arc<LockRegistry>) -> Self {
        let programs = settings.programs.clone();
        Self {
            firewall: FirewallManager::new(runner.clone(), programs.clone(), locks.clone()),
            routes: RouteManager::new(runner.clone(), programs.clone(), locks.clone())
                .with_registry(settings.rt_tables.clone()),
            rules: RuleManager::new(runner, programs, locks),
            settings,
            gates: Default::default(),
        }
    }
}

impl<R: CommandRunner> PersistEngine<R> {
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.firewall = self.firewall.with_audit(audit.clone());
        self.routes = self.routes.with_audit(audit.clone());
        self.rules = self.rules.with_audit(audit);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn firewall(&self) -> &FirewallManager<R> {
        &self.firewall
    }

    pub fn routes(&self) -> &RouteManager<R> {
        &self.routes
    }

    pub fn rules(&self) -> &RuleManager<R> {
        &self.rules
    }

    async fn gate(&self, domain: Domain) -> MutexGuard<'_, ()> {
        let index = match domain {
            Domain::Firewall => 0,
            Domain::Routes => 1,
            Domain::Rules => 2,
        };
        self.gates[index].lock().await
    }

    async fn all_gates(&self) -> Vec<MutexGuard<'_, ()>> {
        let mut guards = Vec::with_capacity(Domain::ALL.len());
        for domain in Domain::ALL {
            guards.push(self.gate(domain).await);
        }
        guards
    }

    // ---- snapshot ----

    /// Store the raw `iptables-save` dump.
    pub async fn snapshot_firewall(&self) -> Result<()> {
        let _gate = self.gate(Domain::Firewall).await;

        let dump = self.firewall.save_dump().await?;
        let path = self.settings.firewall_dump_path();
        atomic_write(&path, dump.as_bytes())?;

        info!(path = %path.display(), bytes = dump.len(), "firewall snapshot written");
        Ok(())
    }

    /// One file per routing table; returns how many tables were written.
    pub async fn snapshot_routes(&self) -> Result<usize> {
        let _gate = self.gate(Domain::Routes).await;

        let tables = persistable_routes(&self.routes.list_all().await?);
        for (table, lines) in &tables {
            let path = self.settings.route_table_path(table)?;
            atomic_write(&path, render_lines(lines).as_bytes())?;
            debug!(table = %table, routes = lines.len(), "route table written");
        }

        for (table, path) in table_files(&self.settings.routes_dir())? {
            if !tables.contains_key(&table) {
                fs::remove_file(&path).map_err(|e| Error::io_at(&path, e))?;
                info!(table = %table, "removed snapshot of emptied route table");
            }
        }

        info!(tables = tables.len(), "route snapshot written");
        Ok(tables.len())
    }

    /// Store every non-reserved policy rule; returns how many were written.
    pub async fn snapshot_rules(&self) -> Result<usize> {
        let _gate = self.gate(Domain::Rules).await;

        let lines = self.persistable_rules().await?;
        atomic_write(&self.settings.rules_path(), render_lines(&lines).as_bytes())?;

        info!(rules = lines.len(), "rule snapshot written");
        Ok(lines.len())
    }

    pub async fn save_all(&self) -> Result<()> {
        self.snapshot_firewall().await?;
        self.snapshot_routes().await?;
        self.snapshot_rules().await?;
        Ok(())
    }

    async fn persistable_rules(&self) -> Result<Vec<String>> {
        Ok(self
            .rules
            .list()
            .await?
            .iter()
            .filter(|rule| !rule.is_reserved())
            .map(lr_iproute::rule::canonical_line)
            .collect())
    }

    // ---- restore ----

    /// Replay every domain in firewall, routes, rules order.
    ///
    /// A failing domain is recorded in the report and the next one still runs.
    pub async fn restore_all(&self) -> RestoreReport {
        let mut report = RestoreReport::new();
        report.add_outcome(Domain::Firewall, self.restore_firewall().await);
        report.add_outcome(Domain::Routes, self.restore_routes().await);
        report.add_outcome(Domain::Rules, self.restore_rules().await);

        if report.has_errors() {
            warn!("restore finished with errors");
        } else {
            info!("restore finished");
        }
        report
    }

    pub async fn restore_firewall(&self) -> DomainOutcome {
        let _gate = self.gate(Domain::Firewall).await;

        let dump = match read_optional(&self.settings.firewall_dump_path()) {
            Ok(Some(dump)) if !dump.trim().is_empty() => dump,
            Ok(_) => return DomainOutcome::NothingToRestore,
            Err(err) => return DomainOutcome::Failed(err),
        };

        match self.firewall.restore_dump(dump.as_bytes()).await {
            Ok(()) => DomainOutcome::Restored(DomainStats {
                applied: 1,
                ..DomainStats::default()
            }),
            Err(err) => {
                warn!(error = %err, "firewall restore failed");
                DomainOutcome::Failed(err)
            }
        }
    }

    pub async fn restore_routes(&self) -> DomainOutcome {
        let _gate = self.gate(Domain::Routes).await;

        let files = match table_files(&self.settings.routes_dir()) {
            Ok(files) if !files.is_empty() => files,
            Ok(_) => return DomainOutcome::NothingToRestore,
            Err(err) => return DomainOutcome::Failed(err),
        };

        let mut stats = DomainStats::default();
        for (table, path) in files {
            let text = match read_optional(&path) {
                Ok(text) => text.unwrap_or_default(),
                Err(err) => {
                    stats.add_failure(path.display().to_string(), err);
                    continue;
                }
            };

            for line in content_lines(&text) {
                match self.routes.replay(&table, &line).await {
                    Ok(ReplayOutcome::Added) => stats.applied += 1,
                    Ok(ReplayOutcome::AlreadyPresent) => stats.already_present += 1,
                    Err(err) => {
                        warn!(table = %table, line = %line, error = %err, "route replay failed");
                        stats.add_failure(format!("{}: {}", table, line), err);
                    }
                }
            }
        }

        info!(
            applied = stats.applied,
            already_present = stats.already_present,
            failed = stats.failed.len(),
            "routes restored"
        );
        DomainOutcome::Restored(stats)
    }

    pub async fn restore_rules(&self) -> DomainOutcome {
        let _gate = self.gate(Domain::Rules).await;

        let lines = match read_optional(&self.settings.rules_path()) {
            Ok(Some(text)) => content_lines(&text),
            Ok(None) => return DomainOutcome::NothingToRestore,
            Err(err) => return DomainOutcome::Failed(err),
        };
        if lines.is_empty() {
            return DomainOutcome::NothingToRestore;
        }

        let results = match self.rules.replay_lines(&lines).await {
            Ok(results) => results,
            Err(err) => return DomainOutcome::Failed(err),
        };

        let mut stats = DomainStats::default();
        for (line, outcome) in results {
            match outcome {
                Ok(ReplayOutcome::Added) => stats.applied += 1,
                Ok(ReplayOutcome::AlreadyPresent) => stats.already_present += 1,
                Err(err) => stats.add_failure(line, err),
            }
        }

        info!(
            applied = stats.applied,
            already_present = stats.already_present,
            failed = stats.failed.len(),
            "rules restored"
        );
        DomainOutcome::Restored(stats)
    }

    // ---- drift ----

    pub async fn drift(&self, domain: Domain) -> Result<Drift> {
        let _gate = self.gate(domain).await;

        let (stored, live) = match domain {
            Domain::Firewall => {
                let stored = read_optional(&self.settings.firewall_dump_path())?.unwrap_or_default();
                let live = self.firewall.save_dump().await?;
                (drift::normalize_dump(&stored), drift::normalize_dump(&live))
            }
            Domain::Routes => {
                let mut stored = BTreeMap::new();
                for (table, path) in table_files(&self.settings.routes_dir())? {
                    let text = read_optional(&path)?.unwrap_or_default();
                    stored.insert(table, content_lines(&text));
                }
                let live = persistable_routes(&self.routes.list_all().await?);
                (drift::render_tables(&stored), drift::render_tables(&live))
            }
            Domain::Rules => {
                let text = read_optional(&self.settings.rules_path())?.unwrap_or_default();
                let live = self.persistable_rules().await?;
                (render_lines(&content_lines(&text)), render_lines(&live))
            }
        };

        Ok(Drift::compare(domain, &stored, &live))
    }

    pub async fn drift_all(&self) -> Result<Vec<Drift>> {
        let mut drifts = Vec::with_capacity(Domain::ALL.len());
        for domain in Domain::ALL {
            drifts.push(self.drift(domain).await?);
        }
        Ok(drifts)
    }

    // ---- archive ----

    pub async fn export_archive(&self) -> Result<Vec<u8>> {
        let _gates = self.all_gates().await;
        self.settings.ensure_store_layout()?;
        archive::export(&self.settings.store_dir)
    }

    pub async fn import_archive(&self, bytes: &[u8]) -> Result<ImportSummary> {
        let _gates = self.all_gates().await;
        archive::import(&self.settings.store_dir, bytes)
    }
}

/// Routes worth persisting, as canonical lines grouped by table.
fn persistable_routes(routes: &[Route]) -> BTreeMap<String, Vec<String>> {
    let mut tables: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for route in routes.iter().filter(|r| !r.is_kernel_generated()) {
        tables
            .entry(route.table.clone())
            .or_default()
            .push(lr_iproute::route::canonical_line(route));
    }
    tables
}

/// `<table>.conf` files in the routes dir, sorted by table name.
fn table_files(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(Error::io_at(dir, e)),
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::io_at(dir, e))?;
        let path = entry.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("conf") {
            continue;
        }
        if let Some(table) = path.file_stem().and_then(|s| s.to_str()) {
            files.push((table.to_string(), path.clone()));
        }
    }

    files.sort();
    Ok(files)
}
