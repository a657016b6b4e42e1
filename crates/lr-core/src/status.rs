use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Up,
    /// Administratively up without carrier
    NoCarrier,
    Down,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "UP",
            Self::NoCarrier => "NO-CARRIER",
            Self::Down => "DOWN",
        }
    }
}

/// One network interface, as the kernel reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkInfo {
    pub index: u32,
    pub name: String,
    pub state: LinkState,
    pub mtu: Option<u32>,
    pub mac: Option<String>,
    /// `addr/prefix` strings
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkInventory {
    pub links: Vec<LinkInfo>,
}

impl LinkInventory {
    pub fn new() -> Self {
        Self { links: vec![] }
    }

    pub fn find(&self, name: &str) -> Option<&LinkInfo> {
        self.links.iter().find(|link| link.name == name)
    }

    /// Names usable as a route's `dev` or a rule's `iif`/`oif`.
    pub fn names(&self) -> Vec<&str> {
        self.links.iter().map(|link| link.name.as_str()).collect()
    }

    pub fn display(&self) {
        println!("🔌 Interfaces ({}):", self.links.len());
        if self.links.is_empty() {
            println!("  (none)");
            return;
        }

        for link in &self.links {
            let mtu = link.mtu.map(|m| format!(" mtu {}", m)).unwrap_or_default();
            println!("  • {}: {} [{}]{}", link.index, link.name, link.state.as_str(), mtu);
            if let Some(mac) = &link.mac {
                println!("    MAC: {}", mac);
            }
            if !link.addresses.is_empty() {
                println!("    Addresses: {}", link.addresses.join(", "));
            }
        }
    }
}

/// Interface counters; all zero when the kernel reports none.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
}

impl LinkStats {
    pub fn display(&self, name: &str) {
        println!("📊 {}:", name);
        println!(
            "  RX: {} bytes, {} packets, {} errors, {} dropped",
            self.rx_bytes, self.rx_packets, self.rx_errors, self.rx_dropped
        );
        println!(
            "  TX: {} bytes, {} packets, {} errors, {} dropped",
            self.tx_bytes, self.tx_packets, self.tx_errors, self.tx_dropped
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inventory_lookup_by_name() {
        let inventory = LinkInventory {
            links: vec![
                LinkInfo {
                    index: 1,
                    name: "lo".into(),
                    state: LinkState::Up,
                    mtu: Some(65536),
                    mac: None,
                    addresses: vec!["127.0.0.1/8".into()],
                },
                LinkInfo {
                    index: 2,
                    name: "eth0".into(),
                    state: LinkState::NoCarrier,
                    mtu: Some(1500),
                    mac: Some("52:54:00:12:34:56".into()),
                    addresses: vec![],
                },
            ],
        };
        assert_eq!(inventory.names(), vec!["lo", "eth0"]);
        assert_eq!(inventory.find("eth0").map(|l| l.index), Some(2));
        assert!(inventory.find("wg0").is_none());
    }
}
