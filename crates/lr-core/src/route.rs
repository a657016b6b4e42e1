use crate::error::{Error, Result};
use crate::selector::present;
use serde::{Deserialize, Serialize};

/// Name the kernel and iproute2 give the default routing table.
pub const MAIN_TABLE: &str = "main";

/// A kernel route as listed by `ip route show`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Route type keyword (`local`, `broadcast`, `unreachable`, ...) when one was printed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_type: Option<String>,
    pub destination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub table: String,
}

impl Route {
    /// Entries the kernel recreates on its own whenever an address comes up.
    pub fn is_kernel_generated(&self) -> bool {
        let kernel_scoped = self.protocol.as_deref() == Some("kernel")
            && matches!(self.scope.as_deref(), Some("link") | Some("host"));
        let local_type = matches!(self.route_type.as_deref(), Some("local") | Some("broadcast"));
        kernel_scoped || local_type
    }
}

/// Caller intent for adding or deleting a route.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteInput {
    pub destination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
}

impl RouteInput {
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            ..Self::default()
        }
    }

    pub fn via(mut self, gateway: impl Into<String>) -> Self {
        self.gateway = Some(gateway.into());
        self
    }

    pub fn dev(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    pub fn metric(mut self, metric: u32) -> Self {
        self.metric = Some(metric);
        self
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Table the route lives in, `main` when unspecified.
    pub fn table_name(&self) -> &str {
        present(self.table.as_deref()).unwrap_or(MAIN_TABLE)
    }

    pub fn validate_for_add(&self) -> Result<()> {
        self.validate_for_delete()?;
        if present(self.gateway.as_deref()).is_none() && present(self.interface.as_deref()).is_none() {
            return Err(Error::validation(
                "route",
                "a gateway or an interface is required",
            ));
        }
        Ok(())
    }

    pub fn validate_for_delete(&self) -> Result<()> {
        if self.destination.trim().is_empty() {
            return Err(Error::validation("destination", "destination is required"));
        }
        Ok(())
    }
}

/// Entry in the table-name registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTable {
    pub id: u32,
    pub name: String,
}
