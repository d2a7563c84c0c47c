//! Prometheus-compatible `/metrics` endpoint.
//!
//! Returns metrics in Prometheus text exposition format (text/plain; version=0.0.4).
//! No external crate dependency — formats the text manually.

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;

use super::AppState;

/// GET /metrics — Prometheus scrape endpoint.
pub async fn handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut out = String::with_capacity(2048);

    let global = state.aggregator.global_stats().await;
    let clients = state.aggregator.clients().await;
    let flow_count = state.aggregator.flow_count().await;

    write_gauge(&mut out, "catchmole_clients_total", "Number of known clients", clients.len() as i64);
    write_gauge(&mut out, "catchmole_flows_total", "Number of live flow trackers", flow_count as i64);
    write_gauge(
        &mut out,
        "catchmole_global_active_connections",
        "Smoothed global active-connection count",
        global.active_connections() as i64,
    );
    write_counter(
        &mut out,
        "catchmole_global_upload_bytes_total",
        "Cumulative WAN upload bytes",
        global.wan_upload,
    );
    write_counter(
        &mut out,
        "catchmole_global_download_bytes_total",
        "Cumulative WAN download bytes",
        global.wan_download,
    );

    out.push_str("# HELP catchmole_client_upload_bytes_total Cumulative upload bytes per client\n");
    out.push_str("# TYPE catchmole_client_upload_bytes_total counter\n");
    for client in &clients {
        out.push_str(&format!(
            "catchmole_client_upload_bytes_total{{mac=\"{}\"}} {}\n",
            client.mac, client.cumulative_upload
        ));
    }

    out.push_str("# HELP catchmole_client_download_bytes_total Cumulative download bytes per client\n");
    out.push_str("# TYPE catchmole_client_download_bytes_total counter\n");
    for client in &clients {
        out.push_str(&format!(
            "catchmole_client_download_bytes_total{{mac=\"{}\"}} {}\n",
            client.mac, client.cumulative_download
        ));
    }

    out.push_str("# HELP catchmole_client_active_connections Smoothed active-connection count per client\n");
    out.push_str("# TYPE catchmole_client_active_connections gauge\n");
    for client in &clients {
        out.push_str(&format!(
            "catchmole_client_active_connections{{mac=\"{}\"}} {}\n",
            client.mac,
            client.active_connections()
        ));
    }

    write_counter(
        &mut out,
        "catchmole_events_dropped_total",
        "Delta events dropped by the backpressure policy",
        state.drops.get(),
    );

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        out,
    )
        .into_response()
}

fn write_gauge(out: &mut String, name: &str, help: &str, value: i64) {
    out.push_str(&format!("# HELP {name} {help}\n"));
    out.push_str(&format!("# TYPE {name} gauge\n"));
    out.push_str(&format!("{name} {value}\n"));
}

fn write_counter(out: &mut String, name: &str, help: &str, value: u64) {
    out.push_str(&format!("# HELP {name} {help}\n"));
    out.push_str(&format!("# TYPE {name} counter\n"));
    out.push_str(&format!("{name} {value}\n"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::Aggregator;
    use crate::api::AppMeta;
    use crate::conntrack::ConntrackMonitor;
    use crate::neighbor::NeighborResolver;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    async fn test_state() -> AppState {
        let resolver = NeighborResolver::new();
        let aggregator = Aggregator::new(resolver.clone(), None, true, Duration::from_secs(60), HashMap::new());
        let (monitor, _rx) = ConntrackMonitor::start_with_transport(
            crate::conntrack::test_support::NoopListenTransport,
            crate::conntrack::test_support::NoopDumpTransport,
            Duration::from_secs(60),
        );
        AppState {
            resolver,
            aggregator,
            drops: monitor.drop_counter(),
            meta: Arc::new(AppMeta::default()),
        }
    }

    #[tokio::test]
    async fn metrics_format_is_valid() {
        let state = test_state().await;
        let response = handler(State(state)).await.into_response();
        let body = axum::body::to_bytes(response.into_body(), 1_000_000)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("# HELP"));
        assert!(text.contains("# TYPE"));
        assert!(text.contains("catchmole_clients_total"));
        assert!(text.contains("catchmole_flows_total"));
        assert!(text.contains("catchmole_global_active_connections"));
        assert!(text.contains("catchmole_events_dropped_total"));
    }
}
