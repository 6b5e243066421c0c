// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

mod audio_rx;
mod config;
mod gain;
mod logging;
mod net;
mod policy;
mod radiod;
mod ratelimit;
mod sessions;
mod spectrum;
mod status_rx;
mod ws;

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

use sdrx_core::DynResult;

use audio_rx::ReceiverStats;
use config::ServerConfig;
use logging::init_logging;
use policy::{ConfigPolicy, Policy};
use radiod::{RadiodController, UdpControlLink};
use ratelimit::RateLimiter;
use sessions::SessionManager;
use status_rx::StatusStats;

const PKG_DESCRIPTION: &str = concat!(
    env!("CARGO_PKG_NAME"),
    " - multi-user SDR channel streaming daemon"
);

const STATS_LOG_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug, Parser)]
#[command(version = env!("CARGO_PKG_VERSION"), about = PKG_DESCRIPTION)]
struct Cli {
    /// Path to configuration file
    #[arg(long = "config", short = 'C', value_name = "FILE")]
    config: Option<PathBuf>,
    /// Print example configuration and exit
    #[arg(long = "print-config")]
    print_config: bool,
    /// IP address for the WebSocket listener
    #[arg(short = 'l', long = "listen")]
    listen: Option<IpAddr>,
    /// Port for the WebSocket listener
    #[arg(short = 'p', long = "port")]
    port: Option<u16>,
    /// Log level (trace, debug, info, warn, error)
    #[arg(long = "log-level")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> DynResult<()> {
    let cli = Cli::parse();
    if cli.print_config {
        println!("{}", ServerConfig::example_toml());
        return Ok(());
    }

    let mut cfg = ServerConfig::load(cli.config.as_deref())?;
    if let Some(addr) = cli.listen {
        cfg.listen.addr = addr;
    }
    if let Some(port) = cli.port {
        cfg.listen.port = port;
    }
    if let Some(level) = cli.log_level {
        cfg.general.log_level = Some(level);
    }
    init_logging(cfg.general.log_level.as_deref());
    info!("{} {} starting", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    let status_addr = cfg.radiod_status_addr()?;
    let data_addr = cfg.radiod_data_addr()?;
    info!("radiod status group {}, data group {}", status_addr, data_addr);

    let link = UdpControlLink::connect(status_addr)?;
    let controller = Arc::new(RadiodController::new(Box::new(link)));
    let policy: Arc<dyn Policy> = Arc::new(ConfigPolicy::new(cfg.server.clone()));
    let manager = SessionManager::new(
        controller.clone(),
        policy.clone(),
        cfg.limits.clone(),
        cfg.radiod.channel_prefix.clone(),
        cfg.server.enforce_session_ip_match,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let status_socket = net::join_multicast(status_addr)?;
    let data_socket = net::join_multicast(data_addr)?;

    let rx_stats = Arc::new(ReceiverStats::default());
    let status_stats = Arc::new(StatusStats::default());

    tokio::spawn(audio_rx::run_audio_receiver(
        data_socket,
        manager.clone(),
        rx_stats.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(status_rx::run_status_listener(
        status_socket,
        controller.clone(),
        manager.clone(),
        cfg.spectrum.clone(),
        status_stats.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(spectrum::run_spectrum_poller(
        controller.clone(),
        manager.clone(),
        Duration::from_millis(cfg.spectrum.poll_period_ms),
        shutdown_rx.clone(),
    ));
    tokio::spawn(manager.clone().run_idle_gc(shutdown_rx.clone()));
    tokio::spawn(run_stats_log(
        manager.clone(),
        controller.clone(),
        rx_stats,
        status_stats,
        shutdown_rx.clone(),
    ));

    let state = Arc::new(ws::AppState {
        manager: manager.clone(),
        policy,
        config: Arc::new(cfg.clone()),
        command_limiter: RateLimiter::new(cfg.limits.command_burst, cfg.limits.commands_per_sec),
        connection_limiter: RateLimiter::new(
            cfg.limits.connection_burst,
            cfg.limits.connections_per_sec,
        ),
    });
    let app = ws::router(state);

    let listen_addr = SocketAddr::new(cfg.listen.addr, cfg.listen.port);
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    info!("websocket listener on {}", listen_addr);

    {
        let manager = manager.clone();
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_err() {
                warn!("ctrl-c handler unavailable");
                return;
            }
            info!("shutdown requested");
            let _ = shutdown_tx.send(true);
            manager.shutdown_all();
        });
    }

    let mut serve_shutdown = shutdown_rx.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = serve_shutdown.wait_for(|&stop| stop).await;
    })
    .await?;

    manager.shutdown_all();
    info!("bye");
    Ok(())
}

/// Periodic one-line operational summary.
async fn run_stats_log(
    manager: Arc<SessionManager>,
    controller: Arc<RadiodController>,
    rx_stats: Arc<ReceiverStats>,
    status_stats: Arc<StatusStats>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(STATS_LOG_PERIOD);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await; // skip the immediate first tick
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                info!(
                    "{} sessions, {} rtp packets ({} dropped, {} unknown ssrc), {} status packets ({} corrections), {} send errors",
                    manager.session_count(),
                    rx_stats.packets.load(Ordering::Relaxed),
                    rx_stats.dropped.load(Ordering::Relaxed),
                    rx_stats.unknown_ssrc.load(Ordering::Relaxed),
                    status_stats.packets.load(Ordering::Relaxed),
                    status_stats.corrections.load(Ordering::Relaxed),
                    controller.send_error_count(),
                );
            }
            changed = shutdown_rx.changed() => {
                match changed {
                    Ok(()) if *shutdown_rx.borrow() => break,
                    Ok(()) => {}
                    Err(_) => break,
                }
            }
        }
    }
}
