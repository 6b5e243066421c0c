// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Periodic spectrum poll driver.
//!
//! radiod only emits BIN_DATA on request, so a ticker dispatches one
//! poll command per active spectrum session. Dispatch is spawned per
//! SSRC to keep the tick interval true under many sessions; replies
//! come back asynchronously through the STATUS path. A watchdog
//! re-creates channels that stop producing data.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{info, warn};

use sdrx_core::channel::ChannelKind;
use sdrx_core::error::CoreError;

use crate::radiod::RadiodController;
use crate::sessions::{Session, SessionManager};

/// A spectrum session with no data for this long is considered stalled.
pub const STALL_TIMEOUT: Duration = Duration::from_secs(90);
/// Minimum spacing between stall re-create attempts.
pub const STALL_RETRY_COOLDOWN: Duration = Duration::from_secs(60);

/// Run the poll ticker until shutdown.
pub async fn run_spectrum_poller(
    controller: Arc<RadiodController>,
    manager: Arc<SessionManager>,
    poll_period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(poll_period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    info!("spectrum poller running every {:?}", poll_period);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                poll_once(&controller, &manager);
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
    info!("spectrum poller shutting down");
}

/// One tick: dispatch polls in parallel and run the stall watchdog.
pub fn poll_once(controller: &Arc<RadiodController>, manager: &Arc<SessionManager>) {
    let mut sessions: Vec<Arc<Session>> = Vec::new();
    manager.for_each_session(|s| {
        if s.kind == ChannelKind::Spectrum && s.is_running() {
            sessions.push(s.clone());
        }
    });

    for session in sessions {
        check_stall(controller, manager, &session);
        let controller = controller.clone();
        tokio::spawn(async move {
            // Send errors are counted and rate-limit logged by the
            // controller; the next tick retries.
            let _ = controller.poll_spectrum(session.ssrc);
        });
    }
}

/// Re-issue the create command for a stalled channel, keeping the SSRC.
fn check_stall(
    controller: &Arc<RadiodController>,
    manager: &Arc<SessionManager>,
    session: &Arc<Session>,
) {
    let stalled = session
        .last_spectrum_data
        .lock()
        .expect("last_spectrum_data mutex poisoned")
        .elapsed()
        > STALL_TIMEOUT;
    if !stalled {
        return;
    }

    let mut last_attempt = session
        .last_stall_recreate
        .lock()
        .expect("last_stall_recreate mutex poisoned");
    if let Some(t) = *last_attempt {
        if t.elapsed() < STALL_RETRY_COOLDOWN {
            return;
        }
    }
    *last_attempt = Some(Instant::now());
    drop(last_attempt);

    let state = session.state();
    warn!(
        "{} (no data for >{:?}), re-creating channel",
        CoreError::ChannelStalled(session.ssrc),
        STALL_TIMEOUT
    );
    let name = manager.channel_name(session);
    let _ = controller.create_spectrum_channel(
        &name,
        state.desired.frequency_hz,
        state.bin_count,
        state.bin_bandwidth_hz,
        session.ssrc,
        false,
    );
}
