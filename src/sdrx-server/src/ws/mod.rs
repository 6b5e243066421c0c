// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! WebSocket egress: the upgrade handler, per-connection task wiring,
//! and the single writer task that owns each socket's write half.
//!
//! Every accepted connection gets one control loop (reads JSON), one
//! egress task (audio or spectrum, feeding prepared binary frames into
//! a bounded out-channel), and one writer task draining that channel
//! into the socket under a write deadline. The distribution paths never
//! touch the socket directly, so a stuck client only fills its own
//! queues.

mod audio;
mod control;
mod spectrum_writer;

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use sdrx_core::channel::ChannelKind;
use sdrx_core::error::CoreError;
use sdrx_core::modes::Mode;
use sdrx_protocol::frames::SignalQuality;
use sdrx_protocol::types::{
    validate_user_session_id, ConnectParams, ServerMessage, StreamFormat,
};

use crate::config::ServerConfig;
use crate::gain::range_gain_db;
use crate::policy::Policy;
use crate::ratelimit::RateLimiter;
use crate::sessions::{
    AudioSessionRequest, Session, SessionManager, SpectrumSessionRequest,
};

/// A write that does not complete within this window closes the
/// connection.
pub const WRITE_DEADLINE: Duration = Duration::from_secs(10);

/// Depth of the per-connection out-channel feeding the writer task.
const OUT_CHANNEL_DEPTH: usize = 16;

pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub policy: Arc<dyn Policy>,
    pub config: Arc<ServerConfig>,
    pub command_limiter: RateLimiter<Uuid>,
    pub connection_limiter: RateLimiter<IpAddr>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(upgrade))
        .with_state(state)
}

/// Everything resolved from the query string before the upgrade.
struct ConnectRequest {
    uuid: Uuid,
    version: u8,
    bypass: bool,
    kind: ChannelKind,
    // audio
    frequency: u64,
    mode: Mode,
    bandwidth_low: Option<f32>,
    bandwidth_high: Option<f32>,
    format: StreamFormat,
    // spectrum
    bin_count: u32,
    bin_bandwidth: f32,
}

fn parse_connect(
    params: &ConnectParams,
    ip: IpAddr,
    policy: &dyn Policy,
) -> Result<ConnectRequest, String> {
    let uuid = validate_user_session_id(&params.user_session_id)
        .ok_or("user_session_id must be a UUID v4")?;
    let version = params.version.unwrap_or(1);
    if !(1..=2).contains(&version) {
        return Err(format!("unsupported protocol version {version}"));
    }
    let bypass = policy.grants_bypass(ip, params.password.as_deref());

    let kind = match params.session_type.as_deref() {
        None | Some("audio") => ChannelKind::Audio,
        Some("spectrum") => ChannelKind::Spectrum,
        Some(other) => return Err(format!("unknown session type {other:?}")),
    };

    let mode = match params.mode.as_deref() {
        Some(s) => Mode::parse(s).ok_or_else(|| format!("unknown mode {s:?}"))?,
        None => Mode::Usb,
    };
    let format = match params.format.as_deref() {
        Some(s) => StreamFormat::parse(s).ok_or_else(|| format!("unknown format {s:?}"))?,
        None => StreamFormat::Opus,
    };
    let frequency = match params.frequency {
        Some(f) => f,
        None => return Err("frequency is required".to_string()),
    };

    Ok(ConnectRequest {
        uuid,
        version,
        bypass,
        kind,
        frequency,
        mode,
        bandwidth_low: params.bandwidth_low,
        bandwidth_high: params.bandwidth_high,
        format,
        bin_count: params.bin_count.unwrap_or(1024),
        bin_bandwidth: params.bin_bandwidth.unwrap_or(100.0),
    })
}

async fn upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
    params: Result<Query<ConnectParams>, axum::extract::rejection::QueryRejection>,
) -> axum::response::Response {
    let ip = addr.ip();
    if state.policy.is_banned(ip) {
        return (StatusCode::UNAUTHORIZED, "banned").into_response();
    }
    if !state.connection_limiter.try_acquire(&ip) {
        return (StatusCode::TOO_MANY_REQUESTS, "connection rate exceeded").into_response();
    }
    let Ok(Query(params)) = params else {
        return (StatusCode::BAD_REQUEST, "invalid query").into_response();
    };
    let request = match parse_connect(&params, ip, &*state.policy) {
        Ok(req) => req,
        Err(msg) => return (StatusCode::BAD_REQUEST, msg).into_response(),
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, ip, request))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, ip: IpAddr, req: ConnectRequest) {
    match req.kind {
        ChannelKind::Audio => handle_audio_socket(socket, state, ip, req).await,
        ChannelKind::Spectrum => handle_spectrum_socket(socket, state, ip, req).await,
    }
}

async fn handle_audio_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    ip: IpAddr,
    req: ConnectRequest,
) {
    let created = state.manager.create_audio_session(AudioSessionRequest {
        user_session_id: req.uuid,
        client_ip: ip,
        frequency: req.frequency,
        mode: req.mode,
        bandwidth_low: req.bandwidth_low,
        bandwidth_high: req.bandwidth_high,
        bypass: req.bypass,
        version: req.version,
        format: req.format,
    });
    let (session, audio_rx) = match created {
        Ok(pair) => pair,
        Err(e) => {
            reject_socket(socket, &e).await;
            return;
        }
    };
    info!("audio ws connected: session {} from {}", session.id, ip);

    let (sink, stream) = socket.split();
    let (out_tx, out_rx) = mpsc::channel::<Message>(OUT_CHANNEL_DEPTH);

    let writer = tokio::spawn(writer_task(sink, out_rx, session.clone()));
    let egress = tokio::spawn(audio::run_audio_egress(
        session.clone(),
        audio_rx,
        out_tx.clone(),
        state.config.clone(),
    ));

    control::run_control_loop(stream, session.clone(), state.clone(), out_tx).await;

    state.manager.destroy_session(session.id);
    state.command_limiter.forget(&session.user_session_id);
    let _ = egress.await;
    let _ = writer.await;
    info!("audio ws disconnected: session {}", session.id);
}

async fn handle_spectrum_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    ip: IpAddr,
    req: ConnectRequest,
) {
    let created = state
        .manager
        .create_spectrum_session(SpectrumSessionRequest {
            user_session_id: req.uuid,
            client_ip: ip,
            center_frequency: req.frequency,
            bin_count: req.bin_count,
            bin_bandwidth_hz: req.bin_bandwidth,
            version: req.version,
        });
    let (session, spectrum_rx) = match created {
        Ok(pair) => pair,
        Err(e) => {
            reject_socket(socket, &e).await;
            return;
        }
    };
    info!("spectrum ws connected: session {} from {}", session.id, ip);

    let (sink, stream) = socket.split();
    let (out_tx, out_rx) = mpsc::channel::<Message>(OUT_CHANNEL_DEPTH);

    let writer = tokio::spawn(writer_task(sink, out_rx, session.clone()));
    let egress = tokio::spawn(spectrum_writer::run_spectrum_egress(
        session.clone(),
        spectrum_rx,
        out_tx.clone(),
        state.config.clone(),
    ));

    control::run_control_loop(stream, session.clone(), state.clone(), out_tx).await;

    state.manager.destroy_session(session.id);
    state.command_limiter.forget(&session.user_session_id);
    let _ = egress.await;
    let _ = writer.await;
    info!("spectrum ws disconnected: session {}", session.id);
}

/// Session creation failed after the upgrade: surface the error as JSON
/// and close.
async fn reject_socket(mut socket: WebSocket, err: &CoreError) {
    let msg = ServerMessage::Error {
        status: err.status(),
        message: err.to_string(),
    };
    if let Ok(text) = serde_json::to_string(&msg) {
        let _ = socket.send(Message::Text(text)).await;
    }
    let _ = socket.close().await;
}

/// The single owner of a socket's write half. Applies the write
/// deadline; a slow or dead client closes the connection here and the
/// control loop observes the closure.
async fn writer_task(
    mut sink: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<Message>,
    session: Arc<Session>,
) {
    while let Some(msg) = out_rx.recv().await {
        let payload_len = match &msg {
            Message::Binary(b) => b.len() as u64,
            Message::Text(t) => t.len() as u64,
            _ => 0,
        };
        match tokio::time::timeout(WRITE_DEADLINE, sink.send(msg)).await {
            Ok(Ok(())) => {
                session.bytes_sent.fetch_add(payload_len, Ordering::Relaxed);
            }
            Ok(Err(_)) | Err(_) => break,
        }
    }
    let _ = sink.close().await;
}

/// Signal quality with master and per-range gain applied, matching the
/// spectrum display. The unknown sentinel passes through unchanged.
pub(crate) fn adjusted_quality(session: &Session, config: &ServerConfig) -> SignalQuality {
    let state = session.state();
    let adjust = |raw: f32| {
        if raw <= -998.0 {
            return raw;
        }
        raw + config.spectrum.gain_db
            + range_gain_db(
                &config.spectrum.gain_db_frequency_ranges,
                state.desired.frequency_hz as f64,
            )
    };
    SignalQuality {
        baseband_power_db: adjust(state.baseband_power_db),
        noise_density_db: adjust(state.noise_density_db),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;
    use crate::policy::ConfigPolicy;

    fn params(uuid: &str) -> ConnectParams {
        ConnectParams {
            user_session_id: uuid.to_string(),
            frequency: Some(14_074_000),
            mode: Some("usb".to_string()),
            bandwidth_low: None,
            bandwidth_high: None,
            password: None,
            version: Some(2),
            format: Some("opus".to_string()),
            session_type: None,
            bin_count: None,
            bin_bandwidth: None,
        }
    }

    fn policy() -> ConfigPolicy {
        ConfigPolicy::new(PolicyConfig::default())
    }

    #[test]
    fn valid_audio_connect_parses() {
        let uuid = Uuid::new_v4().to_string();
        let req =
            parse_connect(&params(&uuid), "192.0.2.1".parse().unwrap(), &policy()).unwrap();
        assert_eq!(req.kind, ChannelKind::Audio);
        assert_eq!(req.mode, Mode::Usb);
        assert_eq!(req.format, StreamFormat::Opus);
        assert_eq!(req.version, 2);
    }

    #[test]
    fn non_v4_uuid_is_rejected() {
        let mut p = params("c232ab00-9414-11ec-b3c8-9f68deced846");
        p.version = Some(1);
        assert!(parse_connect(&p, "192.0.2.1".parse().unwrap(), &policy()).is_err());
    }

    #[test]
    fn unknown_mode_and_format_are_rejected() {
        let uuid = Uuid::new_v4().to_string();
        let mut p = params(&uuid);
        p.mode = Some("wfm".to_string());
        assert!(parse_connect(&p, "192.0.2.1".parse().unwrap(), &policy()).is_err());

        let mut p = params(&uuid);
        p.format = Some("flac".to_string());
        assert!(parse_connect(&p, "192.0.2.1".parse().unwrap(), &policy()).is_err());
    }

    #[test]
    fn missing_frequency_is_rejected() {
        let uuid = Uuid::new_v4().to_string();
        let mut p = params(&uuid);
        p.frequency = None;
        assert!(parse_connect(&p, "192.0.2.1".parse().unwrap(), &policy()).is_err());
    }

    #[test]
    fn spectrum_type_selects_spectrum_session() {
        let uuid = Uuid::new_v4().to_string();
        let mut p = params(&uuid);
        p.session_type = Some("spectrum".to_string());
        p.bin_count = Some(2048);
        p.bin_bandwidth = Some(50.0);
        let req = parse_connect(&p, "192.0.2.1".parse().unwrap(), &policy()).unwrap();
        assert_eq!(req.kind, ChannelKind::Spectrum);
        assert_eq!(req.bin_count, 2048);
        assert_eq!(req.bin_bandwidth, 50.0);
    }

    #[test]
    fn version_three_is_rejected() {
        let uuid = Uuid::new_v4().to_string();
        let mut p = params(&uuid);
        p.version = Some(3);
        assert!(parse_connect(&p, "192.0.2.1".parse().unwrap(), &policy()).is_err());
    }
}
