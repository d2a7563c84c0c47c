//! C1 — Neighbor Resolver.
//!
//! Maintains an IP -> MAC snapshot populated from the kernel neighbor table
//! (`RTM_GETNEIGH`, both address families) and a cached interface-index ->
//! (name, addresses) table from `RTM_GETLINK` / `RTM_GETADDR`, used both for
//! display and for the aggregator's LAN-subnet discovery.

mod netlink;

use ipnetwork::IpNetwork;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

pub use netlink::NeighborError;

const ZERO_MAC: [u8; 6] = [0; 6];

/// States the kernel reports for a neighbor table entry (`ndm_state`).
///
/// Ordering mirrors `include/uapi/linux/neighbour.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborState {
    Incomplete,
    Reachable,
    Stale,
    Delay,
    Probe,
    Failed,
    Noarp,
    Permanent,
    Unknown(u16),
}

impl NeighborState {
    pub fn from_ndm_state(raw: u16) -> Self {
        // include/uapi/linux/neighbour.h
        match raw {
            0x01 => NeighborState::Incomplete,
            0x02 => NeighborState::Reachable,
            0x04 => NeighborState::Stale,
            0x08 => NeighborState::Delay,
            0x10 => NeighborState::Probe,
            0x20 => NeighborState::Failed,
            0x40 => NeighborState::Noarp,
            0x80 => NeighborState::Permanent,
            other => NeighborState::Unknown(other),
        }
    }

    /// Whether an entry in this state should be kept in the resolver's
    /// lookup snapshot.
    fn is_usable(self) -> bool {
        matches!(
            self,
            NeighborState::Reachable
                | NeighborState::Stale
                | NeighborState::Delay
                | NeighborState::Probe
                | NeighborState::Permanent
                | NeighborState::Noarp
        )
    }
}

/// A single raw neighbor-table entry as parsed off the wire, before the
/// usability/zero-MAC filter is applied.
#[derive(Debug, Clone)]
pub struct RawNeighbor {
    pub ip: IpAddr,
    pub mac: [u8; 6],
    pub state: NeighborState,
}

fn format_mac(mac: [u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

/// Apply the filtering rules from the resolver contract to a batch of raw
/// entries, producing the IP -> lower-cased-MAC map that readers see.
fn build_snapshot(raw: Vec<RawNeighbor>) -> HashMap<String, String> {
    let mut map = HashMap::with_capacity(raw.len());
    for entry in raw {
        if !entry.state.is_usable() {
            continue;
        }
        if entry.mac == ZERO_MAC {
            continue;
        }
        map.insert(entry.ip.to_string(), format_mac(entry.mac));
    }
    map
}

/// Interface information cached for LAN-subnet discovery: the index -> name
/// mapping plus every IP network currently configured on that interface.
#[derive(Debug, Clone, Default)]
pub struct InterfaceInfo {
    pub name: String,
    pub subnets: Vec<IpNetwork>,
}

/// C1's public contract: `lookup`, `refresh`, plus the subnet-discovery
/// accessor C3's periodic tick uses to rebuild its LAN subnet list.
pub struct NeighborResolver {
    snapshot: RwLock<HashMap<String, String>>,
    interfaces: RwLock<HashMap<u32, InterfaceInfo>>,
}

impl NeighborResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            snapshot: RwLock::new(HashMap::new()),
            interfaces: RwLock::new(HashMap::new()),
        })
    }

    /// Wait-free (reader-side) point lookup. Returns the lower-cased MAC,
    /// or `None` if the address is not a currently-known neighbor.
    pub async fn lookup(&self, ip: &IpAddr) -> Option<String> {
        self.snapshot.read().await.get(&ip.to_string()).cloned()
    }

    /// Re-read the kernel neighbor and link tables. Errors are logged and
    /// leave the previous snapshot in place; this never propagates to the
    /// ingestion pipeline.
    pub async fn refresh(&self) {
        match netlink::dump_links_and_addresses().await {
            Ok(links) => {
                *self.interfaces.write().await = links;
            }
            Err(e) => {
                warn!(error = %e, "failed to refresh interface/link table");
            }
        }

        match netlink::dump_neighbors().await {
            Ok(raw) => {
                let snapshot = build_snapshot(raw);
                *self.snapshot.write().await = snapshot;
            }
            Err(e) => {
                warn!(error = %e, "failed to refresh neighbor table");
            }
        }
    }

    /// The IP networks configured on the named interface, used by the
    /// aggregator to rebuild its LAN subnet list each tick.
    pub async fn subnets_for_interface(&self, name: &str) -> Vec<IpNetwork> {
        self.interfaces
            .read()
            .await
            .values()
            .find(|info| info.name == name)
            .map(|info| info.subnets.clone())
            .unwrap_or_default()
    }

    /// Number of known neighbor entries, for the Prometheus exporter.
    pub async fn known_count(&self) -> usize {
        self.snapshot.read().await.len()
    }

    /// Test-only seam: populate the lookup snapshot directly, without a
    /// real netlink `refresh()`, so aggregator tests can exercise MAC
    /// attribution without `CAP_NET_ADMIN`.
    #[cfg(test)]
    pub async fn seed(&self, entries: impl IntoIterator<Item = (&'static str, &'static str)>) {
        let mut snapshot = self.snapshot.write().await;
        for (ip, mac) in entries {
            snapshot.insert(ip.to_string(), mac.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn neighbor(ip: &str, mac: [u8; 6], state: NeighborState) -> RawNeighbor {
        RawNeighbor {
            ip: ip.parse().unwrap(),
            mac,
            state,
        }
    }

    #[test]
    fn excludes_incomplete_and_failed() {
        let raw = vec![
            neighbor(
                "192.168.1.2",
                [0xaa, 0, 0, 0, 0, 1],
                NeighborState::Incomplete,
            ),
            neighbor("192.168.1.3", [0xaa, 0, 0, 0, 0, 2], NeighborState::Failed),
        ];
        assert!(build_snapshot(raw).is_empty());
    }

    #[test]
    fn includes_all_usable_states() {
        let states = [
            NeighborState::Reachable,
            NeighborState::Stale,
            NeighborState::Delay,
            NeighborState::Probe,
            NeighborState::Permanent,
            NeighborState::Noarp,
        ];
        let raw: Vec<_> = states
            .iter()
            .enumerate()
            .map(|(i, s)| neighbor(&format!("192.168.1.{}", 10 + i), [0xaa, 0, 0, 0, 0, i as u8], *s))
            .collect();
        assert_eq!(build_snapshot(raw).len(), states.len());
    }

    #[test]
    fn excludes_zero_mac() {
        let raw = vec![neighbor("192.168.1.2", ZERO_MAC, NeighborState::Reachable)];
        assert!(build_snapshot(raw).is_empty());
    }

    #[test]
    fn lower_cases_mac() {
        let raw = vec![neighbor(
            "192.168.1.2",
            [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF],
            NeighborState::Reachable,
        )];
        let snap = build_snapshot(raw);
        assert_eq!(
            snap.get("192.168.1.2").map(String::as_str),
            Some("aa:bb:cc:dd:ee:ff")
        );
    }

    #[tokio::test]
    async fn lookup_misses_before_any_refresh() {
        let resolver = NeighborResolver::new();
        assert_eq!(resolver.lookup(&"10.0.0.1".parse().unwrap()).await, None);
    }
}
