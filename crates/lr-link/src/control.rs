// Interface state, MTU, address and counter operations over rtnetlink
use crate::status::netlink_error;
use futures::stream::TryStreamExt;
use ipnet::IpNet;
use lr_core::{Error, LinkStats, Result};
use netlink_packet_route::address::AddressAttribute;
use netlink_packet_route::link::{LinkAttribute, LinkMessage};
use rtnetlink::Handle;
use tracing::{debug, info};

pub struct LinkControl {
    handle: Handle,
}

impl LinkControl {
    pub async fn new() -> Result<Self> {
        use rtnetlink::new_connection;
        let (connection, handle, _) =
            new_connection().map_err(|e| Error::io("failed to open netlink socket", e))?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }

    pub async fn set_up(&self, name: &str) -> Result<()> {
        let index = self.link_index(name).await?;
        self.handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(netlink_error)?;
        info!(link = name, "link up");
        Ok(())
    }

    pub async fn set_down(&self, name: &str) -> Result<()> {
        let index = self.link_index(name).await?;
        self.handle
            .link()
            .set(index)
            .down()
            .execute()
            .await
            .map_err(netlink_error)?;
        info!(link = name, "link down");
        Ok(())
    }

    /// The kernel enforces the per-driver range; only zero is refused here.
    pub async fn set_mtu(&self, name: &str, mtu: u32) -> Result<()> {
        if mtu == 0 {
            return Err(Error::validation("mtu", "mtu must be positive"));
        }
        let index = self.link_index(name).await?;
        self.handle
            .link()
            .set(index)
            .mtu(mtu)
            .execute()
            .await
            .map_err(netlink_error)?;
        info!(link = name, mtu, "link mtu set");
        Ok(())
    }

    pub async fn add_address(&self, name: &str, cidr: &str) -> Result<()> {
        let net = parse_cidr(cidr)?;
        let index = self.link_index(name).await?;
        self.handle
            .address()
            .add(index, net.addr(), net.prefix_len())
            .execute()
            .await
            .map_err(netlink_error)?;
        info!(link = name, address = %net, "address added");
        Ok(())
    }

    /// Returns `false` when the link does not carry the address.
    pub async fn remove_address(&self, name: &str, cidr: &str) -> Result<bool> {
        let net = parse_cidr(cidr)?;
        let index = self.link_index(name).await?;

        let mut addrs = self
            .handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();
        while let Some(msg) = addrs.try_next().await.map_err(netlink_error)? {
            let carries = msg.header.prefix_len == net.prefix_len()
                && msg
                    .attributes
                    .iter()
                    .any(|attr| matches!(attr, AddressAttribute::Address(ip) if *ip == net.addr()));
            if !carries {
                continue;
            }

            self.handle
                .address()
                .del(msg)
                .execute()
                .await
                .map_err(netlink_error)?;
            info!(link = name, address = %net, "address removed");
            return Ok(true);
        }

        debug!(link = name, address = %net, "address not present");
        Ok(false)
    }

    pub async fn stats(&self, name: &str) -> Result<LinkStats> {
        let msg = self.link_message(name).await?;
        Ok(link_stats(&msg))
    }

    async fn link_index(&self, name: &str) -> Result<u32> {
        Ok(self.link_message(name).await?.header.index)
    }

    async fn link_message(&self, name: &str) -> Result<LinkMessage> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(no_such_link(name)),
            Err(err) => {
                debug!(link = name, error = %err, "link lookup failed");
                Err(no_such_link(name))
            }
        }
    }
}

fn no_such_link(name: &str) -> Error {
    Error::validation("interface", format!("interface not found: {}", name))
}

/// `addr/prefix`; a bare address is refused so the prefix is never guessed.
pub fn parse_cidr(cidr: &str) -> Result<IpNet> {
    cidr.trim()
        .parse()
        .map_err(|_| Error::validation("address", format!("invalid address: {}", cidr)))
}

/// 64-bit counters when present, the 32-bit block otherwise, zeros without either.
pub fn link_stats(msg: &LinkMessage) -> LinkStats {
    let mut legacy = None;
    for attr in &msg.attributes {
        match attr {
            LinkAttribute::Stats64(s) => {
                return LinkStats {
                    rx_bytes: s.rx_bytes,
                    tx_bytes: s.tx_bytes,
                    rx_packets: s.rx_packets,
                    tx_packets: s.tx_packets,
                    rx_errors: s.rx_errors,
                    tx_errors: s.tx_errors,
                    rx_dropped: s.rx_dropped,
                    tx_dropped: s.tx_dropped,
                };
            }
            LinkAttribute::Stats(s) => {
                legacy = Some(LinkStats {
                    rx_bytes: s.rx_bytes.into(),
                    tx_bytes: s.tx_bytes.into(),
                    rx_packets: s.rx_packets.into(),
                    tx_packets: s.tx_packets.into(),
                    rx_errors: s.rx_errors.into(),
                    tx_errors: s.tx_errors.into(),
                    rx_dropped: s.rx_dropped.into(),
                    tx_dropped: s.tx_dropped.into(),
                });
            }
            _ => {}
        }
    }
    legacy.unwrap_or_default()
}
