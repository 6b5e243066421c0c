// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Audio egress: drains a session's audio queue, encodes each RTP
//! packet into exactly one binary WebSocket frame (Opus or
//! zstd-compressed PCM), and emits silence frames while the channel is
//! quiet so v2 clients keep their meters alive.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use sdrx_protocol::frames::{self, PcmMeta, SignalQuality};
use sdrx_protocol::rtp::pcm_samples;
use sdrx_protocol::types::StreamFormat;

use super::adjusted_quality;
use crate::config::ServerConfig;
use crate::sessions::{AudioPacket, Session};

/// No audio for this long counts as squelch silence.
pub const SILENCE_AFTER: Duration = Duration::from_millis(200);
/// Silence frame cadence.
pub const SILENCE_TICK: Duration = Duration::from_millis(100);
/// Length of each emitted silence frame.
const SILENCE_FRAME_MS: u32 = 100;

const ZSTD_LEVEL: i32 = 1;
const OPUS_OUT_BUF_LEN: usize = 4096;

/// Run until the queue closes or the session's Done signal fires.
pub async fn run_audio_egress(
    session: Arc<Session>,
    mut audio_rx: mpsc::Receiver<AudioPacket>,
    out_tx: mpsc::Sender<Message>,
    config: Arc<ServerConfig>,
) {
    let mut done = session.subscribe_done();
    let mut encoder = StreamEncoder::new(&session, &config);
    let mut ticker = tokio::time::interval(SILENCE_TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // tokio's clock, so tests can drive the quiet period with paused time.
    let mut last_audio = tokio::time::Instant::now();

    loop {
        tokio::select! {
            pkt = audio_rx.recv() => {
                let Some(pkt) = pkt else { break };
                last_audio = tokio::time::Instant::now();
                let quality = adjusted_quality(&session, &config);
                if let Some(frame) = encoder.encode_packet(&session, &pkt, quality) {
                    if out_tx.try_send(Message::Binary(frame)).is_err() {
                        session.audio_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            _ = ticker.tick() => {
                if session.version >= 2 && last_audio.elapsed() >= SILENCE_AFTER {
                    let quality = adjusted_quality(&session, &config);
                    if let Some(frame) = encoder.encode_silence(&session, quality) {
                        let _ = out_tx.try_send(Message::Binary(frame));
                    }
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

/// Per-connection stream encoder. Rebuilds itself when the session's
/// observed sample rate, channel count, or effective format changes
/// (a tune into an IQ mode flips Opus connections to lossless PCM).
struct StreamEncoder {
    format: StreamFormat,
    sample_rate: u32,
    channels: u8,
    version: u8,
    opus: Option<opus::Encoder>,
    opus_bitrate: u32,
    opus_complexity: u8,
    opus_buf: Vec<u8>,
    sent_full_header: bool,
    last_meta: PcmMeta,
    last_rtp_timestamp: u32,
}

impl StreamEncoder {
    fn new(session: &Session, config: &ServerConfig) -> Self {
        let state = session.state();
        let mut enc = Self {
            format: StreamFormat::PcmZstd,
            sample_rate: 0,
            channels: 0,
            version: session.version,
            opus: None,
            opus_bitrate: config.audio.opus.bitrate,
            opus_complexity: config.audio.opus.complexity,
            opus_buf: vec![0u8; OPUS_OUT_BUF_LEN],
            sent_full_header: false,
            last_meta: PcmMeta {
                sample_rate: 0,
                channels: 0,
                bits_per_sample: 16,
                frequency_hz: 0.0,
            },
            last_rtp_timestamp: 0,
        };
        enc.reconfigure(
            session.effective_format(),
            state.sample_rate,
            state.channels,
        );
        enc
    }

    fn reconfigure(&mut self, format: StreamFormat, sample_rate: u32, channels: u8) {
        self.sample_rate = sample_rate;
        self.channels = channels;
        self.format = format;
        self.opus = None;
        if format != StreamFormat::Opus {
            return;
        }
        let opus_channels = match channels {
            2 => opus::Channels::Stereo,
            _ => opus::Channels::Mono,
        };
        match opus::Encoder::new(sample_rate, opus_channels, opus::Application::Audio) {
            Ok(mut encoder) => {
                if let Err(e) = encoder.set_bitrate(opus::Bitrate::Bits(self.opus_bitrate as i32)) {
                    warn!("opus set_bitrate failed: {}", e);
                }
                if let Err(e) = encoder.set_complexity(self.opus_complexity as i32) {
                    warn!("opus set_complexity failed: {}", e);
                }
                self.opus = Some(encoder);
            }
            Err(e) => {
                // Rates outside the Opus set fall back to lossless PCM.
                warn!(
                    "opus encoder at {} Hz unavailable ({}), falling back to pcm-zstd",
                    sample_rate, e
                );
                self.format = StreamFormat::PcmZstd;
            }
        }
    }

    fn ensure_current(&mut self, session: &Session) {
        let state = session.state();
        let format = session.effective_format();
        if state.sample_rate != self.sample_rate
            || state.channels != self.channels
            || format != self.format
        {
            self.reconfigure(format, state.sample_rate, state.channels);
        }
    }

    /// One RTP packet in, at most one binary frame out.
    fn encode_packet(
        &mut self,
        session: &Session,
        pkt: &AudioPacket,
        quality: SignalQuality,
    ) -> Option<Vec<u8>> {
        self.ensure_current(session);
        self.last_rtp_timestamp = pkt.rtp_timestamp;
        match self.format {
            StreamFormat::Opus => {
                let samples = pcm_samples(&pkt.pcm);
                let encoder = self.opus.as_mut()?;
                match encoder.encode(&samples, &mut self.opus_buf) {
                    Ok(len) => Some(frames::encode_opus(
                        self.version,
                        pkt.gps_time_ns,
                        self.sample_rate,
                        self.channels,
                        quality,
                        &self.opus_buf[..len],
                    )),
                    Err(e) => {
                        debug!("opus encode failed ({} samples): {}", samples.len(), e);
                        None
                    }
                }
            }
            StreamFormat::PcmZstd => {
                let payload = match zstd::bulk::compress(&pkt.pcm, ZSTD_LEVEL) {
                    Ok(compressed) => compressed,
                    Err(e) => {
                        debug!("zstd compress failed: {}", e);
                        return None;
                    }
                };
                Some(self.pcm_frame(session, pkt.gps_time_ns, pkt.rtp_timestamp, &payload, quality))
            }
        }
    }

    /// Full header on the first frame and on metadata changes, minimal
    /// header otherwise.
    fn pcm_frame(
        &mut self,
        session: &Session,
        gps_time_ns: u64,
        rtp_timestamp: u32,
        payload: &[u8],
        quality: SignalQuality,
    ) -> Vec<u8> {
        let state = session.state();
        let meta = PcmMeta {
            sample_rate: self.sample_rate,
            channels: self.channels,
            bits_per_sample: 16,
            frequency_hz: state.desired.frequency_hz as f64,
        };
        if !self.sent_full_header || meta != self.last_meta {
            self.sent_full_header = true;
            self.last_meta = meta;
            frames::encode_pcm_full(self.version, gps_time_ns, rtp_timestamp, meta, quality, payload)
        } else {
            frames::encode_pcm_minimal(gps_time_ns, rtp_timestamp, payload)
        }
    }

    /// A zero-sample frame carrying the current signal quality. PCM
    /// silence always uses the full header so the annotation reaches
    /// the client.
    fn encode_silence(&mut self, session: &Session, quality: SignalQuality) -> Option<Vec<u8>> {
        self.ensure_current(session);
        if self.sample_rate == 0 {
            return None;
        }
        let gps_time_ns = crate::net::gps_time_ns();
        match self.format {
            StreamFormat::Opus => {
                let encoder = self.opus.as_mut()?;
                // 100 ms of zeros; older libopus rejects frames above
                // 60 ms, so fall back to one 20 ms frame.
                for ms in [SILENCE_FRAME_MS, 20] {
                    let n = (self.sample_rate * ms / 1000) as usize * self.channels.max(1) as usize;
                    let zeros = vec![0i16; n];
                    if let Ok(len) = encoder.encode(&zeros, &mut self.opus_buf) {
                        return Some(frames::encode_opus(
                            self.version,
                            gps_time_ns,
                            self.sample_rate,
                            self.channels,
                            quality,
                            &self.opus_buf[..len],
                        ));
                    }
                }
                None
            }
            StreamFormat::PcmZstd => {
                let n = (self.sample_rate * SILENCE_FRAME_MS / 1000) as usize
                    * self.channels.max(1) as usize
                    * 2;
                let zeros = vec![0u8; n];
                let payload = zstd::bulk::compress(&zeros, ZSTD_LEVEL).ok()?;
                let state = session.state();
                let meta = PcmMeta {
                    sample_rate: self.sample_rate,
                    channels: self.channels,
                    bits_per_sample: 16,
                    frequency_hz: state.desired.frequency_hz as f64,
                };
                self.sent_full_header = true;
                self.last_meta = meta;
                Some(frames::encode_pcm_full(
                    self.version,
                    gps_time_ns,
                    self.last_rtp_timestamp,
                    meta,
                    quality,
                    &payload,
                ))
            }
        }
    }
}
