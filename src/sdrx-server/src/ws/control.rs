// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Per-connection JSON control loop.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitStream;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::debug;

use sdrx_core::error::CoreError;
use sdrx_protocol::types::{ClientMessage, ServerMessage, SessionStatus};

use super::{adjusted_quality, AppState};
use crate::sessions::{Session, TuneArgs};

const MAX_CONTROL_MSG_LEN: usize = 1024;

/// Read client JSON until the socket closes or the session's Done
/// signal fires (kick, idle GC). Tune and squelch commands consume rate
/// limiter tokens; ping does not.
pub async fn run_control_loop(
    mut stream: SplitStream<WebSocket>,
    session: Arc<Session>,
    state: Arc<AppState>,
    out_tx: mpsc::Sender<Message>,
) {
    let mut done = session.subscribe_done();
    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if handle_text(&text, &session, &state, &out_tx).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {} // binary/ping/pong ignored
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

/// Returns Err only when the out-channel is gone (writer died).
async fn handle_text(
    text: &str,
    session: &Arc<Session>,
    state: &Arc<AppState>,
    out_tx: &mpsc::Sender<Message>,
) -> Result<(), ()> {
    if text.len() > MAX_CONTROL_MSG_LEN {
        return Ok(());
    }
    session.touch();

    let msg = match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            debug!("session {}: bad control message: {}", session.id, e);
            return send(
                out_tx,
                &ServerMessage::Error {
                    status: 400,
                    message: format!("invalid message: {e}"),
                },
            )
            .await;
        }
    };

    match msg {
        ClientMessage::Ping => send(out_tx, &ServerMessage::Pong).await,
        ClientMessage::GetStatus => {
            let status = build_status(session, state);
            send(out_tx, &ServerMessage::Status(status)).await
        }
        ClientMessage::Tune {
            frequency,
            mode,
            bandwidth_low,
            bandwidth_high,
        } => {
            if !state
                .command_limiter
                .try_acquire(&session.user_session_id)
            {
                return send_error(out_tx, &CoreError::RateLimited("tune".into())).await;
            }
            let args = TuneArgs {
                frequency,
                mode,
                bandwidth_low,
                bandwidth_high,
            };
            match state.manager.tune(session, &args).await {
                Ok(()) => {
                    let status = build_status(session, state);
                    send(out_tx, &ServerMessage::Status(status)).await
                }
                Err(e) => send_error(out_tx, &e).await,
            }
        }
        ClientMessage::SetSquelch {
            squelch_open,
            squelch_close,
        } => {
            if !state
                .command_limiter
                .try_acquire(&session.user_session_id)
            {
                return send_error(out_tx, &CoreError::RateLimited("set_squelch".into())).await;
            }
            match state
                .manager
                .set_squelch(session, squelch_open, squelch_close)
            {
                Ok(squelch) => {
                    send(
                        out_tx,
                        &ServerMessage::SquelchUpdated {
                            squelch_open: squelch.open_db,
                            squelch_close: squelch.close_db,
                        },
                    )
                    .await
                }
                Err(e) => send_error(out_tx, &e).await,
            }
        }
    }
}

fn build_status(session: &Arc<Session>, state: &Arc<AppState>) -> SessionStatus {
    let s = session.state();
    let quality = adjusted_quality(session, &state.config);
    SessionStatus {
        ssrc: session.ssrc,
        frequency: s.desired.frequency_hz,
        mode: s.desired.mode.as_str().to_string(),
        bandwidth_low: s.desired.low_edge_hz,
        bandwidth_high: s.desired.high_edge_hz,
        sample_rate: s.sample_rate,
        channels: s.channels,
        baseband_power: quality.baseband_power_db,
        noise_density: quality.noise_density_db,
        squelch_open: s.desired.squelch.open_db,
        squelch_close: s.desired.squelch.close_db,
        bytes_sent: session.bytes_sent.load(Ordering::Relaxed),
        uptime_seconds: session.created_at.elapsed().as_secs(),
    }
}

async fn send(out_tx: &mpsc::Sender<Message>, msg: &ServerMessage) -> Result<(), ()> {
    let text = serde_json::to_string(msg).map_err(|_| ())?;
    out_tx.send(Message::Text(text)).await.map_err(|_| ())
}

async fn send_error(out_tx: &mpsc::Sender<Message>, err: &CoreError) -> Result<(), ()> {
    send(
        out_tx,
        &ServerMessage::Error {
            status: err.status(),
            message: err.to_string(),
        },
    )
    .await
}
