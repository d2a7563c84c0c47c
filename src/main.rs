use anyhow::Result;
use catchmole::aggregator::Aggregator;
use catchmole::api::{self, AppMeta, AppState};
use catchmole::config::AppConfig;
use catchmole::conntrack::ConntrackMonitor;
use catchmole::neighbor::NeighborResolver;
use clap::Parser;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{error, info};

/// CatchMole — LAN traffic-accounting daemon.
#[derive(Parser, Debug)]
#[command(name = "catchmole", version, about)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<String>,

    /// HTTP bind address. Overrides `listen` from the config file.
    #[arg(short, long)]
    listen: Option<String>,

    /// Monitored interface name. Overrides `interface` from the config file.
    #[arg(short, long)]
    interface: Option<String>,

    /// Force LAN<->LAN traffic accounting on (sets ignore_lan = false).
    #[arg(short = 'n', long)]
    lan: bool,

    /// Aggregator tick interval, in seconds. Overrides `interval`.
    #[arg(long)]
    interval: Option<u64>,
}

const BANNER: &str = r#"
  ___      _       _     __  __       _
 / __|__ _| |_ __ | |__ |  \/  |___ | |___
| (__/ _` |  _/ _| | '_ \| |\/| / _ \| / -_)
 \___\__,_|\__\__| |_.__/|_|  |_\___/|_\___|
"#;

fn default_ip_tools() -> HashMap<String, String> {
    let mut tools = HashMap::new();
    tools.insert("whois".to_string(), "https://whois.domaintools.com/{ip}".to_string());
    tools.insert("abuseipdb".to_string(), "https://www.abuseipdb.com/check/{ip}".to_string());
    tools.insert("shodan".to_string(), "https://www.shodan.io/host/{ip}".to_string());
    tools
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "catchmole=info".into()),
        )
        .init();

    let cli = Cli::parse();

    println!("{BANNER}");
    info!(version = env!("CARGO_PKG_VERSION"), "Starting CatchMole");

    let mut app_config = match &cli.config {
        Some(path) => AppConfig::from_file(path)?,
        None => AppConfig::default(),
    };

    if let Some(listen) = cli.listen {
        app_config.listen = listen;
    }
    if let Some(interface) = cli.interface {
        app_config.interface = Some(interface);
    }
    if cli.lan {
        app_config.ignore_lan = false;
    }
    if let Some(interval) = cli.interval {
        app_config.interval = interval;
    }

    info!(
        listen = %app_config.listen,
        interface = ?app_config.interface,
        ignore_lan = app_config.ignore_lan,
        interval = app_config.interval,
        flow_ttl = app_config.flow_ttl,
        devices = app_config.devices.len(),
        "Configuration loaded"
    );

    // C1: Neighbor Resolver.
    let resolver = NeighborResolver::new();

    // C3: Aggregator, depends on C1 for attribution lookups.
    let aggregator = Aggregator::new(
        resolver.clone(),
        app_config.interface.clone(),
        app_config.ignore_lan,
        Duration::from_secs(app_config.flow_ttl),
        app_config.devices.clone(),
    );

    // C2: Conntrack Monitor. Socket/subscription failures here are fatal —
    // the process cannot account for traffic without this source.
    let (monitor, events) = ConntrackMonitor::start(Duration::from_secs(app_config.interval))?;
    info!("Conntrack monitor started");

    let drain_handle = tokio::spawn(aggregator.clone().run(events));
    let tick_handle = tokio::spawn(
        aggregator
            .clone()
            .run_tick(Duration::from_secs(app_config.interval)),
    );

    let state = AppState {
        resolver,
        aggregator,
        drops: monitor.drop_counter(),
        meta: std::sync::Arc::new(AppMeta {
            ip_tools: default_ip_tools(),
        }),
    };

    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&app_config.listen).await?;
    info!(addr = %app_config.listen, "Listening");

    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                error!("HTTP server error: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    tick_handle.abort();
    monitor.stop().await;
    let _ = drain_handle.await;

    info!("CatchMole stopped");
    Ok(())
}
