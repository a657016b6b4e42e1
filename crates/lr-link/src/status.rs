// Interface inventory over rtnetlink
use futures::stream::TryStreamExt;
use lr_core::{Error, LinkInfo, LinkInventory, LinkState, Result};
use netlink_packet_route::address::AddressAttribute;
use netlink_packet_route::link::{LinkAttribute, LinkFlag, LinkMessage};
use rtnetlink::Handle;
use std::collections::HashMap;
use tracing::debug;

pub struct LinkCollector {
    handle: Handle,
}

impl LinkCollector {
    pub async fn new() -> Result<Self> {
        use rtnetlink::new_connection;
        let (connection, handle, _) =
            new_connection().map_err(|e| Error::io("failed to open netlink socket", e))?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }

    /// Every link with its addresses, ordered by interface index.
    pub async fn collect(&self) -> Result<LinkInventory> {
        let mut addresses = self.addresses_by_link().await?;

        let mut inventory = LinkInventory::new();
        let mut links = self.handle.link().get().execute();
        while let Some(msg) = links.try_next().await.map_err(netlink_error)? {
            if let Some(mut link) = describe_link(&msg) {
                link.addresses = addresses.remove(&link.index).unwrap_or_default();
                inventory.links.push(link);
            }
        }

        inventory.links.sort_by_key(|link| link.index);
        debug!(count = inventory.links.len(), "collected links");
        Ok(inventory)
    }

    async fn addresses_by_link(&self) -> Result<HashMap<u32, Vec<String>>> {
        let mut by_link: HashMap<u32, Vec<String>> = HashMap::new();
        let mut addrs = self.handle.address().get().execute();

        while let Some(addr) = addrs.try_next().await.map_err(netlink_error)? {
            for attr in &addr.attributes {
                if let AddressAttribute::Address(ip) = attr {
                    by_link
                        .entry(addr.header.index)
                        .or_default()
                        .push(format!("{}/{}", ip, addr.header.prefix_len));
                }
            }
        }

        Ok(by_link)
    }
}

pub(crate) fn netlink_error(err: rtnetlink::Error) -> Error {
    Error::Netlink(err.to_string())
}

/// Name, state, MTU and MAC from a link message. Links without a name are skipped.
pub fn describe_link(msg: &LinkMessage) -> Option<LinkInfo> {
    let mut name = None;
    let mut mtu = None;
    let mut mac = None;

    for attr in &msg.attributes {
        match attr {
            LinkAttribute::IfName(n) => name = Some(n.clone()),
            LinkAttribute::Mtu(m) => mtu = Some(*m),
            LinkAttribute::Address(bytes) if !bytes.is_empty() => mac = Some(format_mac(bytes)),
            _ => {}
        }
    }

    let flags = &msg.header.flags;
    let state = if !flags.contains(&LinkFlag::Up) {
        LinkState::Down
    } else if flags.contains(&LinkFlag::LowerUp) || flags.contains(&LinkFlag::Loopback) {
        LinkState::Up
    } else {
        LinkState::NoCarrier
    };

    Some(LinkInfo {
        index: msg.header.index,
        name: name?,
        state,
        mtu,
        mac,
        addresses: vec![],
    })
}

fn format_mac(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}
