// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Command path to the radiod backend and the per-SSRC state cache.
//!
//! Commands are fire-and-forget UDP multicast: radiod acknowledges
//! nothing, it just starts emitting STATUS packets for the channel.
//! The cache is seeded from each command so the reconciliation loop has
//! a baseline before the first STATUS arrives, then overwritten
//! field-by-field by `apply_status`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Instant;

use rand::Rng;
use tracing::debug;

use sdrx_core::channel::{ChannelKind, ChannelState};
use sdrx_core::error::{CoreError, CoreResult};
use sdrx_core::modes::Mode;
use sdrx_protocol::tlv::{self, tags, Value};

use crate::logging::RepeatErrorLogger;

/// Transport for encoded command packets. The UDP implementation is the
/// only one used in production; tests capture packets instead.
pub trait ControlLink: Send + Sync {
    fn send(&self, pkt: &[u8]) -> std::io::Result<()>;
}

/// Sends commands to the radiod status/control multicast group.
pub struct UdpControlLink {
    socket: std::net::UdpSocket,
    target: SocketAddr,
}

impl UdpControlLink {
    pub fn connect(target: SocketAddr) -> std::io::Result<Self> {
        let bind_addr = if target.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = std::net::UdpSocket::bind(bind_addr)?;
        Ok(Self { socket, target })
    }
}

impl ControlLink for UdpControlLink {
    fn send(&self, pkt: &[u8]) -> std::io::Result<()> {
        self.socket.send_to(pkt, self.target).map(|_| ())
    }
}

/// Channel update with absent-means-unchanged fields.
///
/// Absence maps to a missing tag on the wire, which radiod reads as "no
/// change"; callers never pass sentinel zeros.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateCommand {
    pub ssrc: u32,
    pub frequency_hz: Option<f64>,
    pub mode: Option<Mode>,
    pub low_edge_hz: Option<f32>,
    pub high_edge_hz: Option<f32>,
}

pub struct RadiodController {
    link: Mutex<Box<dyn ControlLink>>,
    cache: RwLock<HashMap<u32, ChannelState>>,
    started: Instant,
    send_errors: AtomicU64,
    send_error_log: RepeatErrorLogger,
}

impl RadiodController {
    pub fn new(link: Box<dyn ControlLink>) -> Self {
        Self {
            link: Mutex::new(link),
            cache: RwLock::new(HashMap::new()),
            started: Instant::now(),
            send_errors: AtomicU64::new(0),
            send_error_log: RepeatErrorLogger::new("radiod command send failed"),
        }
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn send(&self, fields: &[(u8, Value)]) -> CoreResult<()> {
        let pkt = tlv::encode_cmd(fields);
        let link = self.link.lock().expect("control link mutex poisoned");
        link.send(&pkt).map_err(|e| {
            self.send_errors.fetch_add(1, Ordering::Relaxed);
            self.send_error_log.log(&e.to_string());
            CoreError::BackendUnreachable(e)
        })
    }

    fn command_tag() -> u32 {
        rand::thread_rng().gen()
    }

    /// Create a demodulating channel. No ack is awaited; the cache is
    /// seeded with the requested values.
    pub fn create_audio_channel(
        &self,
        name: &str,
        frequency_hz: u64,
        mode: Mode,
        ssrc: u32,
        low_edge_hz: Option<f32>,
        high_edge_hz: Option<f32>,
    ) -> CoreResult<()> {
        debug!(
            "create audio channel {} ssrc={:#010x} freq={} mode={}",
            name, ssrc, frequency_hz, mode
        );
        let mut fields = vec![
            (tags::COMMAND_TAG, Value::U32(Self::command_tag())),
            (tags::OUTPUT_SSRC, Value::U32(ssrc)),
            (tags::RADIO_FREQUENCY, Value::F64(frequency_hz as f64)),
            (tags::PRESET, Value::Str(mode.as_str().to_string())),
        ];
        if let Some(low) = low_edge_hz {
            fields.push((tags::LOW_EDGE, Value::F32(low)));
        }
        if let Some(high) = high_edge_hz {
            fields.push((tags::HIGH_EDGE, Value::F32(high)));
        }
        self.send(&fields)?;

        let mut cache = self.cache.write().expect("radiod cache lock poisoned");
        let entry = cache.entry(ssrc).or_default();
        entry.kind = Some(ChannelKind::Audio);
        entry.frequency_hz = frequency_hz as f64;
        entry.preset = Some(mode.as_str().to_string());
        entry.low_edge_hz = low_edge_hz.unwrap_or(0.0);
        entry.high_edge_hz = high_edge_hz.unwrap_or(0.0);
        entry.updated_ms = self.now_ms();
        Ok(())
    }

    /// Update a channel; only the present fields are encoded.
    pub fn update_channel(&self, cmd: &UpdateCommand) -> CoreResult<()> {
        let mut fields = vec![
            (tags::COMMAND_TAG, Value::U32(Self::command_tag())),
            (tags::OUTPUT_SSRC, Value::U32(cmd.ssrc)),
        ];
        if let Some(freq) = cmd.frequency_hz {
            fields.push((tags::RADIO_FREQUENCY, Value::F64(freq)));
        }
        if let Some(mode) = cmd.mode {
            fields.push((tags::PRESET, Value::Str(mode.as_str().to_string())));
        }
        if let Some(low) = cmd.low_edge_hz {
            fields.push((tags::LOW_EDGE, Value::F32(low)));
        }
        if let Some(high) = cmd.high_edge_hz {
            fields.push((tags::HIGH_EDGE, Value::F32(high)));
        }
        self.send(&fields)?;

        let mut cache = self.cache.write().expect("radiod cache lock poisoned");
        if let Some(entry) = cache.get_mut(&cmd.ssrc) {
            if let Some(freq) = cmd.frequency_hz {
                entry.frequency_hz = freq;
            }
            if let Some(mode) = cmd.mode {
                entry.preset = Some(mode.as_str().to_string());
            }
            if let Some(low) = cmd.low_edge_hz {
                entry.low_edge_hz = low;
            }
            if let Some(high) = cmd.high_edge_hz {
                entry.high_edge_hz = high;
            }
            entry.updated_ms = self.now_ms();
        }
        Ok(())
    }

    /// Create an FFT channel. `bin_count_changed` marks re-creates where
    /// the backend must reallocate its FFT.
    pub fn create_spectrum_channel(
        &self,
        name: &str,
        center_frequency_hz: u64,
        bin_count: u32,
        bin_bandwidth_hz: f32,
        ssrc: u32,
        bin_count_changed: bool,
    ) -> CoreResult<()> {
        debug!(
            "create spectrum channel {} ssrc={:#010x} bins={} bw={} realloc={}",
            name, ssrc, bin_count, bin_bandwidth_hz, bin_count_changed
        );
        let fields = vec![
            (tags::COMMAND_TAG, Value::U32(Self::command_tag())),
            (tags::OUTPUT_SSRC, Value::U32(ssrc)),
            (
                tags::RADIO_FREQUENCY,
                Value::F64(center_frequency_hz as f64),
            ),
            (tags::PRESET, Value::Str("spectrum".to_string())),
            (tags::NONCOHERENT_BIN_BW, Value::F32(bin_bandwidth_hz)),
            (tags::BIN_COUNT, Value::I32(bin_count as i32)),
        ];
        self.send(&fields)?;

        let mut cache = self.cache.write().expect("radiod cache lock poisoned");
        let entry = cache.entry(ssrc).or_default();
        entry.kind = Some(ChannelKind::Spectrum);
        entry.frequency_hz = center_frequency_hz as f64;
        entry.preset = Some("spectrum".to_string());
        entry.bin_bandwidth_hz = bin_bandwidth_hz;
        entry.bin_count = bin_count as i32;
        entry.updated_ms = self.now_ms();
        Ok(())
    }

    /// Request channel destruction: frequency 0 starts radiod's
    /// 20-second lifetime countdown.
    pub fn disable_channel(&self, name: &str, ssrc: u32) -> CoreResult<()> {
        debug!("disable channel {} ssrc={:#010x}", name, ssrc);
        let fields = vec![
            (tags::COMMAND_TAG, Value::U32(Self::command_tag())),
            (tags::OUTPUT_SSRC, Value::U32(ssrc)),
            (tags::RADIO_FREQUENCY, Value::F64(0.0)),
        ];
        let result = self.send(&fields);
        self.cache
            .write()
            .expect("radiod cache lock poisoned")
            .remove(&ssrc);
        result
    }

    /// Ask radiod to emit one spectrum STATUS for this SSRC.
    pub fn poll_spectrum(&self, ssrc: u32) -> CoreResult<()> {
        let fields = vec![
            (tags::COMMAND_TAG, Value::U32(Self::command_tag())),
            (tags::OUTPUT_SSRC, Value::U32(ssrc)),
        ];
        self.send(&fields)
    }

    /// Snapshot of the last STATUS-sourced parameters, or None.
    pub fn get_channel_status(&self, ssrc: u32) -> Option<ChannelState> {
        self.cache
            .read()
            .expect("radiod cache lock poisoned")
            .get(&ssrc)
            .cloned()
    }

    /// Fold one decoded STATUS packet into the cache. Returns the SSRC
    /// and the updated snapshot when the packet carries one.
    pub fn apply_status(&self, map: &tlv::StatusMap) -> Option<(u32, ChannelState)> {
        let ssrc = map.get_u32(tags::OUTPUT_SSRC)?;
        let mut cache = self.cache.write().expect("radiod cache lock poisoned");
        let entry = cache.entry(ssrc).or_default();
        if let Some(freq) = map.get_f64(tags::RADIO_FREQUENCY) {
            entry.frequency_hz = freq;
        }
        if let Some(preset) = map.get_str(tags::PRESET) {
            entry.preset = Some(preset.to_string());
        }
        if let Some(low) = map.get_f32(tags::LOW_EDGE) {
            entry.low_edge_hz = low;
        }
        if let Some(high) = map.get_f32(tags::HIGH_EDGE) {
            entry.high_edge_hz = high;
        }
        if let Some(rate) = map.get_u32(tags::OUTPUT_SAMPRATE) {
            entry.sample_rate = rate;
        }
        if let Some(channels) = map.get_u32(tags::OUTPUT_CHANNELS) {
            entry.channels = channels as u8;
        }
        if let Some(bw) = map.get_f32(tags::NONCOHERENT_BIN_BW) {
            entry.bin_bandwidth_hz = bw;
        }
        if let Some(count) = map.get_i32(tags::BIN_COUNT) {
            entry.bin_count = count;
        }
        if let Some(power) = map.get_f32(tags::BASEBAND_POWER) {
            entry.baseband_power_db = power;
        }
        if let Some(noise) = map.get_f32(tags::NOISE_DENSITY) {
            entry.noise_density_db = noise;
        }
        entry.updated_ms = self.now_ms();
        Some((ssrc, entry.clone()))
    }

    pub fn send_error_count(&self) -> u64 {
        self.send_errors.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Arc;

    /// Captures every packet handed to the link, for assertions.
    #[derive(Default)]
    pub struct CaptureLink {
        pub sent: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl CaptureLink {
        pub fn new() -> (Box<dyn ControlLink>, Arc<Mutex<Vec<Vec<u8>>>>) {
            let sent = Arc::new(Mutex::new(Vec::new()));
            (
                Box::new(CaptureLink { sent: sent.clone() }),
                sent,
            )
        }
    }

    impl ControlLink for CaptureLink {
        fn send(&self, pkt: &[u8]) -> std::io::Result<()> {
            self.sent.lock().unwrap().push(pkt.to_vec());
            Ok(())
        }
    }

    /// A link whose sends always fail, for BackendUnreachable paths.
    pub struct BrokenLink;

    impl ControlLink for BrokenLink {
        fn send(&self, _pkt: &[u8]) -> std::io::Result<()> {
            Err(std::io::Error::new(
                std::io::ErrorKind::NetworkUnreachable,
                "no route to radiod",
            ))
        }
    }
}
