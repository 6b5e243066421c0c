// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! STATUS multicast listener and the reconciliation engine.
//!
//! Every STATUS packet updates the controller cache. Packets belonging
//! to a live session additionally feed reconciliation: the backend may
//! silently clamp or refuse values, and without this loop the client's
//! displayed channel diverges from the DSP's actual channel. Corrective
//! commands are rate-limited per SSRC (one per second), mismatch logs
//! to one per thirty seconds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{info, warn};

use sdrx_core::channel::{ChannelKind, ChannelState};
use sdrx_protocol::tlv;

use crate::config::SpectrumConfig;
use crate::gain::bins_to_db;
use crate::logging::RepeatErrorLogger;
use crate::net::gps_time_ns;
use crate::radiod::{RadiodController, UpdateCommand};
use crate::sessions::{Session, SessionManager, SpectrumFrame};

const RECV_BUF_LEN: usize = 65_536;

/// Frequency/edge comparison tolerance in Hz.
const RECONCILE_TOLERANCE: f64 = 0.01;
/// At most one corrective command per SSRC per second.
const RETRY_COOLDOWN: Duration = Duration::from_secs(1);
/// At most one mismatch log line per SSRC per thirty seconds.
const LOG_COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Default)]
pub struct StatusStats {
    pub packets: AtomicU64,
    pub malformed: AtomicU64,
    pub corrections: AtomicU64,
}

/// Run the STATUS receive loop until shutdown.
pub async fn run_status_listener(
    socket: UdpSocket,
    controller: Arc<RadiodController>,
    manager: Arc<SessionManager>,
    spectrum_cfg: SpectrumConfig,
    stats: Arc<StatusStats>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let recv_errors = RepeatErrorLogger::new("status multicast recv failed");
    let mut buf = vec![0u8; RECV_BUF_LEN];
    info!("status listener listening");

    loop {
        tokio::select! {
            recv = socket.recv_from(&mut buf) => {
                match recv {
                    Ok((len, _peer)) => {
                        handle_status(
                            &controller,
                            &manager,
                            &spectrum_cfg,
                            &stats,
                            &buf[..len],
                            gps_time_ns(),
                        );
                    }
                    Err(e) => {
                        recv_errors.log(&e.to_string());
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
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
    info!("status listener shutting down");
}

/// Process one STATUS datagram: cache update, session state refresh,
/// spectrum delivery, reconciliation.
pub fn handle_status(
    controller: &RadiodController,
    manager: &SessionManager,
    spectrum_cfg: &SpectrumConfig,
    stats: &StatusStats,
    datagram: &[u8],
    gps_time_ns: u64,
) {
    let map = match tlv::decode_status(datagram) {
        Ok(map) => map,
        Err(_) => {
            stats.malformed.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };
    let Some((ssrc, reported)) = controller.apply_status(&map) else {
        return;
    };
    stats.packets.fetch_add(1, Ordering::Relaxed);

    let Some(session) = manager.get_by_ssrc(ssrc) else {
        return;
    };

    session.update_state(|state| {
        if reported.sample_rate != 0 {
            state.sample_rate = reported.sample_rate;
        }
        if reported.channels != 0 {
            state.channels = reported.channels;
        }
        if map.contains(tlv::tags::BASEBAND_POWER) {
            state.baseband_power_db = reported.baseband_power_db;
        }
        if map.contains(tlv::tags::NOISE_DENSITY) {
            state.noise_density_db = reported.noise_density_db;
        }
    });

    match session.kind {
        ChannelKind::Audio => {
            if reconcile_audio(controller, &session, &reported) {
                stats.corrections.fetch_add(1, Ordering::Relaxed);
            }
        }
        ChannelKind::Spectrum => {
            if let Some(bins) = map.bin_data() {
                deliver_spectrum(&session, bins, spectrum_cfg, gps_time_ns);
            }
            let name = manager.channel_name(&session);
            if reconcile_spectrum(controller, &name, &session, &reported) {
                stats.corrections.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Convert and enqueue a spectrum bin array. Non-blocking: a stuck
/// client fills its own queue and drops frames.
fn deliver_spectrum(
    session: &Arc<Session>,
    mut bins: Vec<f32>,
    spectrum_cfg: &SpectrumConfig,
    gps_time_ns: u64,
) {
    bins_to_db(&mut bins, spectrum_cfg.gain_db);
    let state = session.state();
    let frame = SpectrumFrame {
        bins,
        center_frequency_hz: state.desired.frequency_hz as f64,
        bin_bandwidth_hz: state.bin_bandwidth_hz,
        gps_time_ns,
    };
    *session
        .last_spectrum_data
        .lock()
        .expect("last_spectrum_data mutex poisoned") = Instant::now();
    if session.spectrum_tx.try_send(frame).is_err() {
        session.spectrum_dropped.fetch_add(1, Ordering::Relaxed);
    }
}

/// Check the cooldown gate for one SSRC; returns (may_retry, may_log).
fn cooldown_gate(session: &Session) -> (bool, bool) {
    let now = Instant::now();
    let mut cd = session
        .reconcile
        .lock()
        .expect("reconcile cooldown mutex poisoned");
    let may_retry = cd
        .last_retry
        .map_or(true, |t| now.duration_since(t) >= RETRY_COOLDOWN);
    if !may_retry {
        return (false, false);
    }
    cd.last_retry = Some(now);
    let may_log = cd
        .last_log
        .map_or(true, |t| now.duration_since(t) >= LOG_COOLDOWN);
    if may_log {
        cd.last_log = Some(now);
    }
    (true, may_log)
}

/// Re-issue the update command when the backend drifted from the
/// session's desired parameters. Returns true when a correction was
/// sent.
fn reconcile_audio(
    controller: &RadiodController,
    session: &Arc<Session>,
    reported: &ChannelState,
) -> bool {
    let desired = session.desired();
    if desired.mode.is_wide_iq() {
        return false;
    }
    let (Some(want_low), Some(want_high)) = (desired.low_edge_hz, desired.high_edge_hz) else {
        return false;
    };

    let freq_drift =
        (reported.frequency_hz - desired.frequency_hz as f64).abs() > RECONCILE_TOLERANCE;
    let low_drift = (reported.low_edge_hz as f64 - want_low as f64).abs() > RECONCILE_TOLERANCE;
    let high_drift = (reported.high_edge_hz as f64 - want_high as f64).abs() > RECONCILE_TOLERANCE;
    if !freq_drift && !low_drift && !high_drift {
        return false;
    }

    let (may_retry, may_log) = cooldown_gate(session);
    if !may_retry {
        return false;
    }
    if may_log {
        warn!(
            "ssrc {:#010x} drifted (freq {} vs {}, edges {}..{} vs {}..{}), correcting",
            session.ssrc,
            reported.frequency_hz,
            desired.frequency_hz,
            reported.low_edge_hz,
            reported.high_edge_hz,
            want_low,
            want_high
        );
    }

    let cmd = UpdateCommand {
        ssrc: session.ssrc,
        frequency_hz: freq_drift.then_some(desired.frequency_hz as f64),
        mode: None,
        low_edge_hz: (low_drift || high_drift).then_some(want_low),
        high_edge_hz: (low_drift || high_drift).then_some(want_high),
    };
    controller.update_channel(&cmd).is_ok()
}

/// Re-create the FFT channel when bin parameters drifted. The
/// bin-count-changed flag tells the backend to reallocate its FFT.
fn reconcile_spectrum(
    controller: &RadiodController,
    name: &str,
    session: &Arc<Session>,
    reported: &ChannelState,
) -> bool {
    let state = session.state();
    let want_count = state.bin_count as i32;
    let want_bw = state.bin_bandwidth_hz;
    let count_mismatch = reported.bin_count != want_count;
    let bw_mismatch = reported.bin_bandwidth_hz != want_bw;
    if !count_mismatch && !bw_mismatch {
        return false;
    }

    let (may_retry, may_log) = cooldown_gate(session);
    if !may_retry {
        return false;
    }
    if may_log {
        warn!(
            "spectrum ssrc {:#010x} drifted ({} bins x {} Hz vs {} x {}), re-creating",
            session.ssrc, reported.bin_count, reported.bin_bandwidth_hz, want_count, want_bw
        );
    }

    controller
        .create_spectrum_channel(
            name,
            state.desired.frequency_hz,
            state.bin_count,
            want_bw,
            session.ssrc,
            count_mismatch,
        )
        .is_ok()
}
