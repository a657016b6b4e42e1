use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const ENV_STORE_DIR: &str = "LROUTER_STORE_DIR";
pub const ENV_RT_TABLES: &str = "LROUTER_RT_TABLES";

const FIREWALL_DIR: &str = "iptables";
const FIREWALL_FILE: &str = "rules.v4";
const ROUTES_DIR: &str = "routes";
const RULES_DIR: &str = "rules";
const RULES_FILE: &str = "ip-rules.conf";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,
    #[serde(default = "default_rt_tables")]
    pub rt_tables: PathBuf,
    #[serde(default)]
    pub programs: Programs,
}

/// Tool binaries, resolved through `PATH` unless given absolute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Programs {
    pub iptables: String,
    pub iptables_save: String,
    pub iptables_restore: String,
    pub ip: String,
}

impl Default for Programs {
    fn default() -> Self {
        Self {
            iptables: "iptables".to_string(),
            iptables_save: "iptables-save".to_string(),
            iptables_restore: "iptables-restore".to_string(),
            ip: "ip".to_string(),
        }
    }
}

fn default_store_dir() -> PathBuf {
    PathBuf::from("/etc/lrouter")
}

fn default_rt_tables() -> PathBuf {
    PathBuf::from("/etc/iproute2/rt_tables")
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store_dir: default_store_dir(),
            rt_tables: default_rt_tables(),
            programs: Programs::default(),
        }
    }
}

impl Settings {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| Error::validation("settings", e.to_string()))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::io_at(path, e))?;
        Self::from_yaml(&content)
    }

    /// Settings file if given, defaults otherwise, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        settings.apply_env(|name| std::env::var(name).ok());
        Ok(settings)
    }

    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_STORE_DIR).filter(|v| !v.is_empty()) {
            debug!(store_dir = %dir, "store dir overridden from environment");
            self.store_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup(ENV_RT_TABLES).filter(|v| !v.is_empty()) {
            self.rt_tables = PathBuf::from(path);
        }
    }

    pub fn firewall_dump_path(&self) -> PathBuf {
        self.store_dir.join(FIREWALL_DIR).join(FIREWALL_FILE)
    }

    pub fn routes_dir(&self) -> PathBuf {
        self.store_dir.join(ROUTES_DIR)
    }

    /// `routes/<table>.conf`; table names that would leave the routes dir are refused.
    pub fn route_table_path(&self, table: &str) -> Result<PathBuf> {
        if table.is_empty() || table.contains(['/', '\\']) || table.starts_with('.') {
            return Err(Error::validation(
                "table",
                format!("'{}' cannot be used as a file name", table),
            ));
        }
        Ok(self.routes_dir().join(format!("{}.conf", table)))
    }

    pub fn rules_path(&self) -> PathBuf {
        self.store_dir.join(RULES_DIR).join(RULES_FILE)
    }

    /// Create the per-domain directories under the store root.
    pub fn ensure_store_layout(&self) -> Result<()> {
        for dir in [FIREWALL_DIR, ROUTES_DIR, RULES_DIR] {
            let path = self.store_dir.join(dir);
            std::fs::create_dir_all(&path).map_err(|e| Error::io_at(&path, e))?;
        }
        Ok(())
    }
}
