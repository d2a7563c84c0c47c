//! C3 — Aggregator.
//!
//! Consumes delta events from the Conntrack Monitor, maintains per-flow
//! trackers and per-client statistics under a single coarse lock, and
//! recomputes speeds and smoothed active-connection counts on a timer.
//! See §4.3.

mod types;

pub use types::{ClientFlowView, ClientStats, FlowTracker, GlobalStats};
use types::{flow_key, protocol_name, smooth_active_connections};

use crate::conntrack::{DeltaEvent, EventKind};
use crate::neighbor::NeighborResolver;
use chrono::Utc;
use ipnetwork::IpNetwork;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;

/// EMA smoothing factor for active-connection counts (§4.3.2 step 5).
const EMA_ALPHA: f64 = 0.2;
/// Minimum elapsed time before a new speed sample is taken (§4.3.2 step 3).
const SPEED_SAMPLE_GUARD: Duration = Duration::from_millis(500);
/// Safety cap: a single event's delta above this is treated as erroneous.
const SAFETY_CAP_BYTES: u64 = 1 << 30;

fn is_multicast_or_broadcast(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_multicast() || v4.is_broadcast(),
        IpAddr::V6(v6) => v6.is_multicast(),
    }
}

/// Configuration the aggregator consults on each event and each tick;
/// mutable via the `set_*` operations in §4.3.
#[derive(Debug, Clone, Default)]
struct AggregatorConfig {
    interface: Option<String>,
    ignore_lan: bool,
    flow_ttl: Duration,
    device_names: HashMap<String, String>,
}

struct AggregatorState {
    config: AggregatorConfig,
    lan_subnets: Vec<IpNetwork>,
    flows: HashMap<String, FlowTracker>,
    clients: HashMap<String, ClientStats>,
    global: GlobalStats,
}

impl AggregatorState {
    fn new(config: AggregatorConfig) -> Self {
        Self {
            config,
            lan_subnets: Vec::new(),
            flows: HashMap::new(),
            clients: HashMap::new(),
            global: GlobalStats::new(Utc::now()),
        }
    }

    fn in_lan_subnet(&self, ip: IpAddr) -> bool {
        self.lan_subnets.iter().any(|net| net.contains(ip))
    }

    fn client_name(&self, mac: &str) -> String {
        self.config
            .device_names
            .get(mac)
            .cloned()
            .unwrap_or_else(|| mac.to_string())
    }

    fn client_mut(&mut self, mac: &str, now: chrono::DateTime<Utc>) -> &mut ClientStats {
        self.clients
            .entry(mac.to_string())
            .or_insert_with(|| ClientStats::new(mac.to_string(), self.client_name(mac), now))
    }
}

/// Public contract: internally-driven event ingestion, snapshot reads, reset
/// operations, and configuration setters. See §4.3 and §4.4.
pub struct Aggregator {
    state: RwLock<AggregatorState>,
    resolver: Arc<NeighborResolver>,
}

impl Aggregator {
    pub fn new(
        resolver: Arc<NeighborResolver>,
        interface: Option<String>,
        ignore_lan: bool,
        flow_ttl: Duration,
        device_names: HashMap<String, String>,
    ) -> Arc<Self> {
        let config = AggregatorConfig {
            interface,
            ignore_lan,
            flow_ttl,
            device_names,
        };
        Arc::new(Self {
            state: RwLock::new(AggregatorState::new(config)),
            resolver,
        })
    }

    /// Drain loop entry point: feed every event from C2's channel through
    /// the handler. Returns once the channel closes.
    pub async fn run(self: Arc<Self>, mut events: tokio::sync::mpsc::Receiver<DeltaEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
    }

    /// Periodic tick loop entry point: fire `self.tick()` every `interval`.
    pub async fn run_tick(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    // ---- 4.3.1 Event handling -------------------------------------------------

    async fn handle_event(&self, event: DeltaEvent) {
        // Resolve MACs before taking the write lock; lookups are wait-free
        // reads against C1's own lock, never blocking on the aggregator.
        let src_mac = self.resolver.lookup(&event.src_ip).await;
        let dst_mac = self.resolver.lookup(&event.dst_ip).await;

        let mut state = self.state.write().await;

        // 1. Interface subnet filter.
        if state.config.interface.is_some() && !state.lan_subnets.is_empty() {
            let src_in = state.in_lan_subnet(event.src_ip);
            let dst_in = state.in_lan_subnet(event.dst_ip);
            if !src_in && !dst_in {
                return;
            }
        }

        // 2. Multicast/broadcast filter.
        if is_multicast_or_broadcast(event.dst_ip) {
            return;
        }

        let key = flow_key(
            event.src_ip,
            event.src_port,
            event.dst_ip,
            event.dst_port,
            event.protocol,
        );
        let now = event.timestamp;

        let is_new = !state.flows.contains_key(&key);
        if is_new {
            // 4. New-flow LAN filter.
            let both_in_subnets = !state.lan_subnets.is_empty()
                && state.in_lan_subnet(event.src_ip)
                && state.in_lan_subnet(event.dst_ip);
            let both_local_macs = state.lan_subnets.is_empty()
                && src_mac.is_some()
                && dst_mac.is_some()
                && src_mac != dst_mac;
            if state.config.ignore_lan && (both_in_subnets || both_local_macs) {
                return;
            }
        }

        // 5. Safety cap.
        let origin_delta = event.origin_delta.min(SAFETY_CAP_BYTES);
        let reply_delta = event.reply_delta.min(SAFETY_CAP_BYTES);

        let tracker = state.flows.entry(key.clone()).or_insert_with(|| {
            FlowTracker::new(
                event.flow_id,
                event.src_ip,
                event.dst_ip,
                event.src_port,
                event.dst_port,
                event.protocol,
                now,
            )
        });
        tracker.cumulative_origin += origin_delta;
        tracker.cumulative_reply += reply_delta;
        tracker.last_seen = now;

        if matches!(event.kind, EventKind::Destroy) {
            state.flows.remove(&key);
        }

        // 7. Attribute to clients.
        let src_local = src_mac.is_some();
        let dst_local = dst_mac.is_some() && dst_mac != src_mac;

        if let Some(mac) = src_mac.clone() {
            let client = state.client_mut(&mac, now);
            client.cumulative_upload += origin_delta;
            client.cumulative_download += reply_delta;
            client.last_active = now;
        }
        if let Some(mac) = dst_mac.clone().filter(|m| Some(m.clone()) != src_mac) {
            let client = state.client_mut(&mac, now);
            client.cumulative_download += origin_delta;
            client.cumulative_upload += reply_delta;
            client.last_active = now;
        }

        // 8. Attribute to global WAN totals.
        if src_local && !dst_local {
            state.global.wan_upload += origin_delta;
            state.global.wan_download += reply_delta;
        } else if dst_local && !src_local {
            state.global.wan_download += origin_delta;
            state.global.wan_upload += reply_delta;
        }
    }

    // ---- 4.3.2 Periodic tick ---------------------------------------------------

    async fn tick(&self) {
        self.resolver.refresh().await;

        let mut state = self.state.write().await;
        let now = Utc::now();

        // 2. Refresh LAN subnets from the monitored interface.
        if let Some(interface) = state.config.interface.clone() {
            drop(state);
            let subnets = self.resolver.subnets_for_interface(&interface).await;
            state = self.state.write().await;
            state.lan_subnets = subnets;
        }

        // 3. Recompute client speeds.
        for client in state.clients.values_mut() {
            let elapsed = (now - client.last_sample_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if elapsed >= SPEED_SAMPLE_GUARD {
                let secs = elapsed.as_secs_f64();
                client.upload_speed =
                    (client.cumulative_upload.saturating_sub(client.last_sample_upload)) as f64 / secs;
                client.download_speed = (client
                    .cumulative_download
                    .saturating_sub(client.last_sample_download)) as f64
                    / secs;
                client.last_sample_upload = client.cumulative_upload;
                client.last_sample_download = client.cumulative_download;
                client.last_sample_at = now;
            }
        }

        // 4. Sweep flows and compute per-flow rates + raw active-connection counts.
        let flow_ttl = state.config.flow_ttl;
        let stale: Vec<String> = state
            .flows
            .iter()
            .filter(|(_, f)| {
                (now - f.last_seen).to_std().unwrap_or(Duration::ZERO) > flow_ttl
            })
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            state.flows.remove(key);
        }

        for client in state.clients.values_mut() {
            client.raw_active_connections = 0;
        }
        let mut global_raw = 0u64;

        // Resolve each flow's src/dst MAC for the raw-connection tally. This
        // mirrors the attribution performed in event handling; flows don't
        // cache MACs since the neighbor table can change underneath them.
        let flow_endpoints: Vec<(String, IpAddr, IpAddr)> = state
            .flows
            .iter()
            .map(|(k, f)| (k.clone(), f.src_ip, f.dst_ip))
            .collect();
        drop(state);

        let mut endpoint_macs = HashMap::new();
        for (key, src_ip, dst_ip) in flow_endpoints {
            let src_mac = self.resolver.lookup(&src_ip).await;
            let dst_mac = self.resolver.lookup(&dst_ip).await;
            endpoint_macs.insert(key, (src_mac, dst_mac));
        }

        state = self.state.write().await;
        for tracker in state.flows.values_mut() {
            let key = flow_key(
                tracker.src_ip,
                tracker.src_port,
                tracker.dst_ip,
                tracker.dst_port,
                tracker.protocol,
            );
            let elapsed = (now - tracker.last_sample_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if elapsed >= SPEED_SAMPLE_GUARD {
                let secs = elapsed.as_secs_f64();
                tracker.origin_rate = (tracker
                    .cumulative_origin
                    .saturating_sub(tracker.last_sample_origin)) as f64
                    / secs;
                tracker.reply_rate = (tracker
                    .cumulative_reply
                    .saturating_sub(tracker.last_sample_reply)) as f64
                    / secs;
                tracker.last_sample_origin = tracker.cumulative_origin;
                tracker.last_sample_reply = tracker.cumulative_reply;
                tracker.last_sample_at = now;
            }

            if let Some((src_mac, dst_mac)) = endpoint_macs.get(&key) {
                if let Some(mac) = src_mac {
                    if let Some(client) = state.clients.get_mut(mac) {
                        client.raw_active_connections += 1;
                    }
                    global_raw += 1;
                }
                if let Some(mac) = dst_mac {
                    if src_mac.as_ref() != Some(mac) {
                        if let Some(client) = state.clients.get_mut(mac) {
                            client.raw_active_connections += 1;
                        }
                        global_raw += 1;
                    }
                }
            }
        }

        // 5. Smooth active-connection counts.
        for client in state.clients.values_mut() {
            client.smoothed_active_connections = smooth_active_connections(
                client.smoothed_active_connections,
                client.raw_active_connections,
                EMA_ALPHA,
            );
        }
        state.global.raw_active_connections = global_raw;
        state.global.smoothed_active_connections = smooth_active_connections(
            state.global.smoothed_active_connections,
            global_raw,
            EMA_ALPHA,
        );
    }

    // ---- 4.4 Read API -----------------------------------------------------------

    pub async fn global_stats(&self) -> GlobalStats {
        self.state.read().await.global.clone()
    }

    pub async fn clients(&self) -> Vec<ClientStats> {
        self.state.read().await.clients.values().cloned().collect()
    }

    pub async fn client_with_session(&self, mac: &str) -> Option<ClientStats> {
        self.state.read().await.clients.get(mac).cloned()
    }

    pub async fn flow_count(&self) -> usize {
        self.state.read().await.flows.len()
    }

    pub async fn client_count(&self) -> usize {
        self.state.read().await.clients.len()
    }

    /// §4.3.3: per-client aggregated flow view, plus the distinct local IPs
    /// the client has been observed using and the total active-connection
    /// count underlying the view.
    pub async fn flows_by_mac(&self, mac: &str) -> (Vec<ClientFlowView>, u64, Vec<IpAddr>) {
        let state = self.state.read().await;
        let flow_ttl = state.config.flow_ttl;
        let now = Utc::now();

        struct Bucket {
            protocol: String,
            remote_ip: IpAddr,
            remote_port: u16,
            local_ip: IpAddr,
            download: u64,
            upload: u64,
            session_download: u64,
            session_upload: u64,
            download_speed: f64,
            upload_speed: f64,
            active_connections: u64,
            first_seen: chrono::DateTime<Utc>,
            last_seen: chrono::DateTime<Utc>,
        }

        let mut buckets: HashMap<(String, IpAddr, u16), Bucket> = HashMap::new();
        let mut local_ips = std::collections::HashSet::new();

        for tracker in state.flows.values() {
            let src_mac = self.resolver.lookup(&tracker.src_ip).await;
            let dst_mac = self.resolver.lookup(&tracker.dst_ip).await;

            let (is_src_side, local_ip, remote_ip, remote_port, download, upload, session_download, session_upload, download_speed, upload_speed) =
                if src_mac.as_deref() == Some(mac) {
                    (
                        true,
                        tracker.src_ip,
                        tracker.dst_ip,
                        tracker.dst_port,
                        tracker.cumulative_reply,
                        tracker.cumulative_origin,
                        tracker.session_reply(),
                        tracker.session_origin(),
                        tracker.reply_rate,
                        tracker.origin_rate,
                    )
                } else if dst_mac.as_deref() == Some(mac) {
                    (
                        false,
                        tracker.dst_ip,
                        tracker.src_ip,
                        tracker.src_port,
                        tracker.cumulative_origin,
                        tracker.cumulative_reply,
                        tracker.session_origin(),
                        tracker.session_reply(),
                        tracker.origin_rate,
                        tracker.reply_rate,
                    )
                } else {
                    continue;
                };
            let _ = is_src_side;

            local_ips.insert(local_ip);
            let key = (protocol_name(tracker.protocol), remote_ip, remote_port);
            let bucket = buckets.entry(key.clone()).or_insert_with(|| Bucket {
                protocol: key.0.clone(),
                remote_ip,
                remote_port,
                local_ip,
                download: 0,
                upload: 0,
                session_download: 0,
                session_upload: 0,
                download_speed: 0.0,
                upload_speed: 0.0,
                active_connections: 0,
                first_seen: tracker.first_seen,
                last_seen: tracker.last_seen,
            });
            bucket.download += download;
            bucket.upload += upload;
            bucket.session_download += session_download;
            bucket.session_upload += session_upload;
            bucket.download_speed += download_speed;
            bucket.upload_speed += upload_speed;
            bucket.active_connections += 1;
            bucket.first_seen = bucket.first_seen.min(tracker.first_seen);
            bucket.last_seen = bucket.last_seen.max(tracker.last_seen);
        }

        let active_connections: u64 = buckets.values().map(|b| b.active_connections).sum();

        let views = buckets
            .into_values()
            .map(|b| {
                let ttl_remaining = flow_ttl.as_secs() as i64
                    - (now - b.last_seen).num_seconds().max(0);
                ClientFlowView {
                    protocol: b.protocol,
                    remote_ip: b.remote_ip,
                    remote_port: b.remote_port,
                    local_ip: b.local_ip,
                    download: b.download,
                    upload: b.upload,
                    session_download: b.session_download,
                    session_upload: b.session_upload,
                    download_speed: b.download_speed,
                    upload_speed: b.upload_speed,
                    active_connections: b.active_connections,
                    first_seen: b.first_seen,
                    last_seen: b.last_seen,
                    ttl_remaining,
                }
            })
            .collect();

        (views, active_connections, local_ips.into_iter().collect())
    }

    // ---- 4.3.4 Reset operations --------------------------------------------------

    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        let now = Utc::now();
        state.global = GlobalStats::new(now);
        state.clients.clear();
        state.flows.clear();
        info!("aggregator state reset");
    }

    pub async fn reset_client_by_mac(&self, mac: &str) {
        let mut state = self.state.write().await;
        state.clients.remove(mac);
        self.remove_flows_touching_mac(&mut state, mac).await;
        info!(mac = %mac, "client reset");
    }

    pub async fn reset_session_by_mac(&self, mac: &str) {
        let mut state = self.state.write().await;
        if let Some(client) = state.clients.get_mut(mac) {
            client.session_download_start = client.cumulative_download;
            client.session_upload_start = client.cumulative_upload;
        }
        self.remove_flows_touching_mac(&mut state, mac).await;
        info!(mac = %mac, "client session reset");
    }

    async fn remove_flows_touching_mac(&self, state: &mut tokio::sync::RwLockWriteGuard<'_, AggregatorState>, mac: &str) {
        let candidates: Vec<(String, IpAddr, IpAddr)> = state
            .flows
            .iter()
            .map(|(k, f)| (k.clone(), f.src_ip, f.dst_ip))
            .collect();
        let mut to_remove = Vec::new();
        for (key, src_ip, dst_ip) in candidates {
            let src_mac = self.resolver.lookup(&src_ip).await;
            let dst_mac = self.resolver.lookup(&dst_ip).await;
            if src_mac.as_deref() == Some(mac) || dst_mac.as_deref() == Some(mac) {
                to_remove.push(key);
            }
        }
        for key in to_remove {
            state.flows.remove(&key);
        }
    }

    // ---- Configuration setters ----------------------------------------------------

    pub async fn set_interface(&self, interface: Option<String>) {
        self.state.write().await.config.interface = interface;
    }

    pub async fn set_ignore_lan(&self, ignore_lan: bool) {
        self.state.write().await.config.ignore_lan = ignore_lan;
    }

    pub async fn set_flow_ttl(&self, flow_ttl: Duration) {
        self.state.write().await.config.flow_ttl = flow_ttl;
    }

    pub async fn set_device_names(&self, device_names: HashMap<String, String>) {
        self.state.write().await.config.device_names = device_names;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conntrack::EventKind;

    fn event(
        src_ip: &str,
        dst_ip: &str,
        origin_delta: u64,
        reply_delta: u64,
        kind: EventKind,
    ) -> DeltaEvent {
        DeltaEvent {
            src_ip: src_ip.parse().unwrap(),
            dst_ip: dst_ip.parse().unwrap(),
            src_port: 55000,
            dst_port: 443,
            protocol: 6,
            flow_id: 1,
            origin_delta,
            reply_delta,
            timestamp: Utc::now(),
            kind,
        }
    }

    async fn new_aggregator() -> Arc<Aggregator> {
        let resolver = NeighborResolver::new();
        Aggregator::new(
            resolver,
            None,
            true,
            Duration::from_secs(60),
            HashMap::new(),
        )
    }

    #[tokio::test]
    async fn attribution_scenario_from_spec() {
        // Client aa:aa:aa:aa:aa:aa at 192.168.1.10 talking to 8.8.8.8:
        // origin (client -> WAN) is upload, reply (WAN -> client) is
        // download, on both the client's own counters and the global WAN
        // totals.
        let resolver = NeighborResolver::new();
        resolver.seed([("192.168.1.10", "aa:aa:aa:aa:aa:aa")]).await;
        let aggregator = Aggregator::new(resolver, None, true, Duration::from_secs(60), HashMap::new());

        aggregator
            .handle_event(event("192.168.1.10", "8.8.8.8", 1000, 9000, EventKind::Update))
            .await;

        assert_eq!(aggregator.flow_count().await, 1);

        let client = aggregator
            .client_with_session("aa:aa:aa:aa:aa:aa")
            .await
            .expect("client should have been attributed");
        assert_eq!(client.cumulative_upload, 1000);
        assert_eq!(client.cumulative_download, 9000);

        let global = aggregator.global_stats().await;
        assert_eq!(global.wan_upload, 1000);
        assert_eq!(global.wan_download, 9000);
    }

    #[tokio::test]
    async fn multicast_destination_is_dropped() {
        let aggregator = new_aggregator().await;
        aggregator
            .handle_event(event("192.168.1.10", "224.0.0.1", 100, 0, EventKind::Update))
            .await;
        assert_eq!(aggregator.flow_count().await, 0);
    }

    #[tokio::test]
    async fn safety_cap_clamps_oversized_delta() {
        let aggregator = new_aggregator().await;
        aggregator
            .handle_event(event(
                "192.168.1.10",
                "8.8.8.8",
                SAFETY_CAP_BYTES * 4,
                0,
                EventKind::Update,
            ))
            .await;
        let flows = aggregator.state.read().await;
        let tracker = flows.flows.values().next().unwrap();
        assert_eq!(tracker.cumulative_origin, SAFETY_CAP_BYTES);
    }

    #[tokio::test]
    async fn destroy_event_removes_tracker() {
        let aggregator = new_aggregator().await;
        aggregator
            .handle_event(event("192.168.1.10", "8.8.8.8", 100, 0, EventKind::Update))
            .await;
        assert_eq!(aggregator.flow_count().await, 1);
        aggregator
            .handle_event(event("192.168.1.10", "8.8.8.8", 50, 0, EventKind::Destroy))
            .await;
        assert_eq!(aggregator.flow_count().await, 0);
    }

    #[tokio::test]
    async fn reset_clears_everything() {
        let aggregator = new_aggregator().await;
        aggregator
            .handle_event(event("192.168.1.10", "8.8.8.8", 100, 0, EventKind::Update))
            .await;
        aggregator.reset().await;
        assert_eq!(aggregator.flow_count().await, 0);
        assert_eq!(aggregator.client_count().await, 0);
    }

    #[tokio::test]
    async fn lan_to_lan_ignored_when_both_in_subnets() {
        let resolver = NeighborResolver::new();
        let aggregator = Aggregator::new(
            resolver,
            Some("eth0".to_string()),
            true,
            Duration::from_secs(60),
            HashMap::new(),
        );
        {
            let mut state = aggregator.state.write().await;
            state.lan_subnets = vec!["192.168.1.0/24".parse().unwrap()];
        }
        aggregator
            .handle_event(event(
                "192.168.1.10",
                "192.168.1.20",
                100,
                0,
                EventKind::Update,
            ))
            .await;
        assert_eq!(aggregator.flow_count().await, 0);
    }

    #[tokio::test]
    async fn tick_sweeps_flows_past_their_ttl() {
        let aggregator = new_aggregator().await;
        aggregator
            .handle_event(event("192.168.1.10", "8.8.8.8", 100, 0, EventKind::Update))
            .await;
        assert_eq!(aggregator.flow_count().await, 1);

        {
            let mut state = aggregator.state.write().await;
            state.config.flow_ttl = Duration::from_secs(1);
            for tracker in state.flows.values_mut() {
                tracker.last_seen = Utc::now() - chrono::Duration::seconds(5);
            }
        }
        aggregator.tick().await;
        assert_eq!(aggregator.flow_count().await, 0);
    }

    #[tokio::test]
    async fn tick_computes_a_nonzero_rate_once_the_speed_guard_elapses() {
        let aggregator = new_aggregator().await;
        aggregator
            .handle_event(event("192.168.1.10", "8.8.8.8", 10_000, 0, EventKind::Update))
            .await;

        {
            let mut state = aggregator.state.write().await;
            for tracker in state.flows.values_mut() {
                tracker.last_sample_at = Utc::now() - chrono::Duration::seconds(1);
            }
        }
        aggregator.tick().await;

        let state = aggregator.state.read().await;
        let tracker = state.flows.values().next().unwrap();
        assert!(tracker.origin_rate > 0.0);
    }
}
