//! Plain data types held under the aggregator's lock: flow trackers, client
//! statistics, and the global WAN totals. See §3.

use chrono::{DateTime, Utc};
use std::net::IpAddr;

/// Canonical flow-tracker key: `srcIP:srcPort->dstIP:dstPort:proto`.
pub fn flow_key(src_ip: IpAddr, src_port: u16, dst_ip: IpAddr, dst_port: u16, protocol: u8) -> String {
    format!("{src_ip}:{src_port}->{dst_ip}:{dst_port}:{protocol}")
}

/// Protocol number -> display string. See §4.3.5.
///
/// ICMP has no ports; conntrack reports type/code in the port attribute
/// slots, and those values flow through unchanged into `src_port`/`dst_port`
/// on ICMP flows.
pub fn protocol_name(protocol: u8) -> String {
    match protocol {
        6 => "TCP".to_string(),
        17 => "UDP".to_string(),
        1 => "ICMP".to_string(),
        58 => "ICMP".to_string(),
        other => other.to_string(),
    }
}

/// State kept per live conntrack flow.
#[derive(Debug, Clone)]
pub struct FlowTracker {
    pub flow_id: u32,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,

    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,

    pub cumulative_origin: u64,
    pub cumulative_reply: u64,
    pub session_origin_start: u64,
    pub session_reply_start: u64,

    /// Last-sampled totals/time used by the tick's speed recomputation.
    pub last_sample_origin: u64,
    pub last_sample_reply: u64,
    pub last_sample_at: DateTime<Utc>,

    pub origin_rate: f64,
    pub reply_rate: f64,
}

impl FlowTracker {
    pub fn new(
        flow_id: u32,
        src_ip: IpAddr,
        dst_ip: IpAddr,
        src_port: u16,
        dst_port: u16,
        protocol: u8,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            flow_id,
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            protocol,
            first_seen: now,
            last_seen: now,
            cumulative_origin: 0,
            cumulative_reply: 0,
            session_origin_start: 0,
            session_reply_start: 0,
            last_sample_origin: 0,
            last_sample_reply: 0,
            last_sample_at: now,
            origin_rate: 0.0,
            reply_rate: 0.0,
        }
    }

    pub fn session_origin(&self) -> u64 {
        self.cumulative_origin.saturating_sub(self.session_origin_start)
    }

    pub fn session_reply(&self) -> u64 {
        self.cumulative_reply.saturating_sub(self.session_reply_start)
    }
}

/// Per-client state, keyed by lower-cased MAC in the aggregator map.
#[derive(Debug, Clone)]
pub struct ClientStats {
    pub mac: String,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub last_active: DateTime<Utc>,

    pub cumulative_download: u64,
    pub cumulative_upload: u64,
    pub session_download_start: u64,
    pub session_upload_start: u64,

    pub last_sample_download: u64,
    pub last_sample_upload: u64,
    pub last_sample_at: DateTime<Utc>,

    pub download_speed: f64,
    pub upload_speed: f64,

    pub raw_active_connections: u64,
    pub smoothed_active_connections: f64,
}

impl ClientStats {
    pub fn new(mac: String, name: String, now: DateTime<Utc>) -> Self {
        Self {
            mac,
            name,
            start_time: now,
            last_active: now,
            cumulative_download: 0,
            cumulative_upload: 0,
            session_download_start: 0,
            session_upload_start: 0,
            last_sample_download: 0,
            last_sample_upload: 0,
            last_sample_at: now,
            download_speed: 0.0,
            upload_speed: 0.0,
            raw_active_connections: 0,
            smoothed_active_connections: 0.0,
        }
    }

    pub fn session_download(&self) -> u64 {
        self.cumulative_download.saturating_sub(self.session_download_start)
    }

    pub fn session_upload(&self) -> u64 {
        self.cumulative_upload.saturating_sub(self.session_upload_start)
    }

    pub fn active_connections(&self) -> u64 {
        self.smoothed_active_connections.round() as u64
    }
}

/// Global, non-per-client totals.
#[derive(Debug, Clone)]
pub struct GlobalStats {
    pub start_time: DateTime<Utc>,
    pub wan_download: u64,
    pub wan_upload: u64,
    pub raw_active_connections: u64,
    pub smoothed_active_connections: f64,
}

impl GlobalStats {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            start_time: now,
            wan_download: 0,
            wan_upload: 0,
            raw_active_connections: 0,
            smoothed_active_connections: 0.0,
        }
    }

    pub fn active_connections(&self) -> u64 {
        self.smoothed_active_connections.round() as u64
    }
}

/// Apply the EMA smoothing rule (§4.3.2 step 5) to one raw sample.
///
/// The seed rule bypasses the ramp when the signal goes from idle to active
/// in one tick.
pub fn smooth_active_connections(prior_smoothed: f64, raw: u64, alpha: f64) -> f64 {
    if prior_smoothed == 0.0 && raw > 0 {
        raw as f64
    } else {
        alpha * raw as f64 + (1.0 - alpha) * prior_smoothed
    }
}

/// One aggregated remote-endpoint bucket in a `flowsByMAC` view.
#[derive(Debug, Clone)]
pub struct ClientFlowView {
    pub protocol: String,
    pub remote_ip: IpAddr,
    pub remote_port: u16,
    pub local_ip: IpAddr,
    pub download: u64,
    pub upload: u64,
    pub session_download: u64,
    pub session_upload: u64,
    pub download_speed: f64,
    pub upload_speed: f64,
    pub active_connections: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub ttl_remaining: i64,
}
