use lr_core::{Domain, Error};

/// Per-line failure during a replay.
#[derive(Debug)]
pub struct LineFailure {
    pub line: String,
    pub error: Error,
}

#[derive(Debug, Default)]
pub struct DomainStats {
    pub applied: usize,
    pub already_present: usize,
    pub failed: Vec<LineFailure>,
}

impl DomainStats {
    pub fn add_failure(&mut self, line: impl Into<String>, error: Error) {
        self.failed.push(LineFailure {
            line: line.into(),
            error,
        });
    }
}

#[derive(Debug)]
pub enum DomainOutcome {
    /// No snapshot on disk for this domain
    NothingToRestore,
    Restored(DomainStats),
    /// The domain could not be attempted at all (unreadable store, listing failed, ...)
    Failed(Error),
}

impl DomainOutcome {
    pub fn has_errors(&self) -> bool {
        match self {
            Self::NothingToRestore => false,
            Self::Restored(stats) => !stats.failed.is_empty(),
            Self::Failed(_) => true,
        }
    }
}

/// What a startup restore did, domain by domain, in restore order.
#[derive(Debug, Default)]
pub struct RestoreReport {
    pub domains: Vec<(Domain, DomainOutcome)>,
}

impl RestoreReport {
    pub fn new() -> Self {
        Self { domains: vec![] }
    }

    pub fn add_outcome(&mut self, domain: Domain, outcome: DomainOutcome) {
        self.domains.push((domain, outcome));
    }

    pub fn outcome(&self, domain: Domain) -> Option<&DomainOutcome> {
        self.domains
            .iter()
            .find(|(d, _)| *d == domain)
            .map(|(_, outcome)| outcome)
    }

    pub fn has_errors(&self) -> bool {
        self.domains.iter().any(|(_, outcome)| outcome.has_errors())
    }

    pub fn display(&self) {
        println!("🔁 Restore summary\n");

        for (domain, outcome) in &self.domains {
            match outcome {
                DomainOutcome::NothingToRestore => {
                    println!("  • {}: nothing to restore", domain);
                }
                DomainOutcome::Restored(stats) => {
                    let icon = if stats.failed.is_empty() { "✅" } else { "⚠️ " };
                    println!(
                        "  {} {}: {} applied, {} already present, {} failed",
                        icon,
                        domain,
                        stats.applied,
                        stats.already_present,
                        stats.failed.len()
                    );
                    for failure in &stats.failed {
                        println!("     ❌ {}", failure.line);
                        println!("        {}", failure.error.to_string().trim_end());
                    }
                }
                DomainOutcome::Failed(error) => {
                    println!("  ❌ {}: {}", domain, error.to_string().trim_end());
                }
            }
        }
    }
}
