// Keyed mutual exclusion for list-then-mutate sequences
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Firewall,
    Routes,
    Rules,
}

impl Domain {
    /// Fixed restore order
    pub const ALL: [Domain; 3] = [Domain::Firewall, Domain::Routes, Domain::Rules];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Firewall => "firewall",
            Self::Routes => "routes",
            Self::Rules => "rules",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a mutation is about to touch.
///
/// `scope` is the chain for firewall keys. A key without a scope covers the
/// whole table and excludes every scoped key of that table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub domain: Domain,
    pub table: String,
    pub scope: Option<String>,
}

impl LockKey {
    pub fn table(domain: Domain, table: impl Into<String>) -> Self {
        Self {
            domain,
            table: table.into(),
            scope: None,
        }
    }

    pub fn scoped(domain: Domain, table: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            domain,
            table: table.into(),
            scope: Some(scope.into()),
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.domain, self.table)?;
        if let Some(scope) = &self.scope {
            write!(f, "/{}", scope)?;
        }
        Ok(())
    }
}

enum TableGuard {
    Shared(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
    Exclusive(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
}

/// Held for the full duration of a mutation; released on drop.
pub struct KeyGuard {
    key: LockKey,
    _table: TableGuard,
    _scope: Option<OwnedMutexGuard<()>>,
}

impl KeyGuard {
    pub fn key(&self) -> &LockKey {
        &self.key
    }
}

impl fmt::Debug for KeyGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self._table {
            TableGuard::Shared(_) => "scoped",
            TableGuard::Exclusive(_) => "table",
        };
        f.debug_struct("KeyGuard")
            .field("key", &self.key)
            .field("mode", &mode)
            .finish()
    }
}

/// Registry of per-key async locks, shared by every manager built from it.
///
/// Entries are created on first use and kept for the life of the registry;
/// the key space is bounded by the tables and chains that exist.
#[derive(Default)]
pub struct LockRegistry {
    tables: StdMutex<HashMap<(Domain, String), Arc<RwLock<()>>>>,
    scopes: StdMutex<HashMap<LockKey, Arc<Mutex<()>>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub async fn lock(&self, key: LockKey) -> KeyGuard {
        let table_lock = self.table_lock(key.domain, &key.table);

        match &key.scope {
            None => {
                let guard = table_lock.write_owned().await;
                KeyGuard {
                    key,
                    _table: TableGuard::Exclusive(guard),
                    _scope: None,
                }
            }
            Some(_) => {
                let table_guard = table_lock.read_owned().await;
                let scope_guard = self.scope_lock(&key).lock_owned().await;
                KeyGuard {
                    key,
                    _table: TableGuard::Shared(table_guard),
                    _scope: Some(scope_guard),
                }
            }
        }
    }

    fn table_lock(&self, domain: Domain, table: &str) -> Arc<RwLock<()>> {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables
            .entry((domain, table.to_string()))
            .or_default()
            .clone()
    }

    fn scope_lock(&self, key: &LockKey) -> Arc<Mutex<()>> {
        let mut scopes = self.scopes.lock().unwrap_or_else(|e| e.into_inner());
        scopes.entry(key.clone()).or_default().clone()
    }
}

impl fmt::Debug for LockRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tables = self.tables.lock().map(|t| t.len()).unwrap_or(0);
        let scopes = self.scopes.lock().map(|s| s.len()).unwrap_or(0);
        f.debug_struct("LockRegistry")
            .field("tables", &tables)
            .field("scopes", &scopes)
            .finish()
    }
}
