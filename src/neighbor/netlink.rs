//! Raw `RTM_GETNEIGH` / `RTM_GETLINK` / `RTM_GETADDR` dumps over
//! `NETLINK_ROUTE`, parsed with `netlink-packet-route`.

use super::{InterfaceInfo, NeighborState, RawNeighbor};
use ipnetwork::IpNetwork;
use netlink_packet_core::{NetlinkHeader, NetlinkMessage, NetlinkPayload, NLM_F_DUMP, NLM_F_REQUEST};
use netlink_packet_route::address::{AddressAttribute, AddressMessage};
use netlink_packet_route::link::{LinkAttribute, LinkMessage};
use netlink_packet_route::neighbour::{NeighbourAddress, NeighbourAttribute, NeighbourMessage};
use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};
use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};
use std::collections::HashMap;
use std::net::IpAddr;

#[derive(Debug, thiserror::Error)]
pub enum NeighborError {
    #[error("failed to open rtnetlink socket: {0}")]
    Socket(#[source] std::io::Error),
    #[error("rtnetlink request failed: {0}")]
    Request(#[source] std::io::Error),
    #[error("rtnetlink reported an error: {0}")]
    Netlink(String),
    #[error("rtnetlink message could not be parsed: {0}")]
    Decode(String),
    #[error("blocking task join failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

fn open_socket() -> Result<Socket, NeighborError> {
    let mut socket = Socket::new(NETLINK_ROUTE).map_err(NeighborError::Socket)?;
    socket
        .bind(&SocketAddr::new(0, 0))
        .map_err(NeighborError::Socket)?;
    Ok(socket)
}

fn dump_request(payload: RouteNetlinkMessage) -> NetlinkMessage<RouteNetlinkMessage> {
    let mut header = NetlinkHeader::default();
    header.flags = NLM_F_REQUEST | NLM_F_DUMP;
    let mut msg = NetlinkMessage::new(header, NetlinkPayload::InnerMessage(payload));
    msg.finalize();
    msg
}

/// Send a dump request and collect every reply message until `NLMSG_DONE`.
fn run_dump(
    socket: &mut Socket,
    request: NetlinkMessage<RouteNetlinkMessage>,
) -> Result<Vec<RouteNetlinkMessage>, NeighborError> {
    let mut buf = vec![0u8; request.buffer_len()];
    request.serialize(&mut buf);
    socket.send(&buf, 0).map_err(NeighborError::Request)?;

    let mut out = Vec::new();
    let mut recv_buf = vec![0u8; 1 << 16];
    'recv: loop {
        let len = socket.recv(&mut recv_buf, 0).map_err(NeighborError::Request)?;
        let mut offset = 0;
        while offset < len {
            let parsed = NetlinkMessage::<RouteNetlinkMessage>::deserialize(&recv_buf[offset..len])
                .map_err(|e| NeighborError::Decode(e.to_string()))?;
            let msg_len = parsed.header.length as usize;
            if msg_len == 0 {
                break;
            }
            match parsed.payload {
                NetlinkPayload::Done(_) => break 'recv,
                NetlinkPayload::Error(e) => {
                    return Err(NeighborError::Netlink(format!("{e:?}")));
                }
                NetlinkPayload::InnerMessage(inner) => out.push(inner),
                _ => {}
            }
            offset += msg_len;
            offset = (offset + 3) & !3;
        }
    }
    Ok(out)
}

fn family_request(family: u8) -> NeighbourMessage {
    let mut msg = NeighbourMessage::default();
    msg.header.family = AddressFamily::from(family);
    msg
}

fn parse_neighbor_entry(msg: NeighbourMessage) -> Option<RawNeighbor> {
    let state = NeighborState::from_ndm_state(msg.header.state.bits());
    let mut ip = None;
    let mut mac = None;
    for attr in msg.attributes {
        match attr {
            NeighbourAttribute::Destination(addr) => {
                ip = Some(match addr {
                    NeighbourAddress::Inet(v4) => IpAddr::V4(v4),
                    NeighbourAddress::Inet6(v6) => IpAddr::V6(v6),
                    _ => return None,
                });
            }
            NeighbourAttribute::LinkLocalAddress(bytes) if bytes.len() == 6 => {
                let mut arr = [0u8; 6];
                arr.copy_from_slice(&bytes);
                mac = Some(arr);
            }
            _ => {}
        }
    }
    Some(RawNeighbor {
        ip: ip?,
        mac: mac.unwrap_or([0; 6]),
        state,
    })
}

/// Dump the kernel neighbor table for both `AF_INET` and `AF_INET6`.
pub async fn dump_neighbors() -> Result<Vec<RawNeighbor>, NeighborError> {
    tokio::task::spawn_blocking(|| {
        let mut socket = open_socket()?;
        let mut entries = Vec::new();
        for family in [libc::AF_INET as u8, libc::AF_INET6 as u8] {
            let request =
                dump_request(RouteNetlinkMessage::GetNeighbour(family_request(family)));
            let replies = run_dump(&mut socket, request)?;
            for reply in replies {
                if let RouteNetlinkMessage::NewNeighbour(msg) = reply {
                    if let Some(entry) = parse_neighbor_entry(msg) {
                        entries.push(entry);
                    }
                }
            }
        }
        Ok(entries)
    })
    .await?
}

fn parse_link(msg: &LinkMessage) -> (u32, String) {
    let index = msg.header.index;
    let name = msg
        .attributes
        .iter()
        .find_map(|attr| match attr {
            LinkAttribute::IfName(name) => Some(name.clone()),
            _ => None,
        })
        .unwrap_or_default();
    (index, name)
}

fn parse_address(msg: &AddressMessage) -> Option<(u32, IpNetwork)> {
    let prefix_len = msg.header.prefix_len;
    let index = msg.header.index;
    let addr = msg.attributes.iter().find_map(|attr| match attr {
        AddressAttribute::Address(addr) => Some(*addr),
        _ => None,
    })?;
    let network = IpNetwork::new(addr, prefix_len).ok()?;
    Some((index, network))
}

/// Dump `RTM_GETLINK` and `RTM_GETADDR`, returning a cache of interface
/// index -> (name, configured subnets).
pub async fn dump_links_and_addresses() -> Result<HashMap<u32, InterfaceInfo>, NeighborError> {
    tokio::task::spawn_blocking(|| {
        let mut socket = open_socket()?;
        let mut interfaces: HashMap<u32, InterfaceInfo> = HashMap::new();

        let link_request = dump_request(RouteNetlinkMessage::GetLink(LinkMessage::default()));
        for reply in run_dump(&mut socket, link_request)? {
            if let RouteNetlinkMessage::NewLink(msg) = reply {
                let (index, name) = parse_link(&msg);
                interfaces.entry(index).or_default().name = name;
            }
        }

        let addr_request =
            dump_request(RouteNetlinkMessage::GetAddress(AddressMessage::default()));
        for reply in run_dump(&mut socket, addr_request)? {
            if let RouteNetlinkMessage::NewAddress(msg) = reply {
                if let Some((index, network)) = parse_address(&msg) {
                    interfaces.entry(index).or_default().subnets.push(network);
                }
            }
        }

        Ok(interfaces)
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires CAP_NET_ADMIN"]
    async fn dump_neighbors_against_live_kernel() {
        dump_neighbors().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires CAP_NET_ADMIN"]
    async fn dump_links_and_addresses_against_live_kernel() {
        let interfaces = dump_links_and_addresses().await.unwrap();
        assert!(interfaces.values().any(|i| i.name == "lo"));
    }
}
