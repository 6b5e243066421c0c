// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Spectrum egress: drains a session's spectrum queue, applies the
//! per-frequency-range display gain (master gain was already applied on
//! the distribution path), and hands binary frames to the writer.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::ws::Message;
use tokio::sync::mpsc;

use sdrx_protocol::frames::encode_spectrum;

use crate::config::ServerConfig;
use crate::gain::apply_range_gain;
use crate::sessions::{Session, SpectrumFrame};

/// Run until the queue closes or the session's Done signal fires.
pub async fn run_spectrum_egress(
    session: Arc<Session>,
    mut spectrum_rx: mpsc::Receiver<SpectrumFrame>,
    out_tx: mpsc::Sender<Message>,
    config: Arc<ServerConfig>,
) {
    let mut done = session.subscribe_done();
    loop {
        tokio::select! {
            frame = spectrum_rx.recv() => {
                let Some(mut frame) = frame else { break };
                apply_range_gain(
                    &mut frame.bins,
                    &config.spectrum.gain_db_frequency_ranges,
                    frame.center_frequency_hz,
                    frame.bin_bandwidth_hz as f64,
                );
                let encoded = encode_spectrum(
                    frame.gps_time_ns,
                    frame.center_frequency_hz,
                    frame.bin_bandwidth_hz,
                    &frame.bins,
                );
                if out_tx.try_send(Message::Binary(encoded)).is_err() {
                    session.spectrum_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            changed = done.changed() => {
                match changed {
                    Ok(()) if *done.borrow() => break,
                    Ok(()) => {}
                    Err(_) => break,
                }
            }
        }
    }
}
