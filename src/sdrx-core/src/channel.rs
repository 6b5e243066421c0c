// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Channel state as the server desires it and as the backend reports it.

use serde::{Deserialize, Serialize};

use crate::modes::Mode;

/// Squelch threshold sentinel: gate permanently open.
pub const SQUELCH_ALWAYS_OPEN_DB: f32 = -999.0;

/// Widest passband edge a non-bypassed client may request, in Hz.
pub const MAX_EDGE_HZ: f32 = 8000.0;

/// Audio channels stream demodulated PCM; spectrum channels stream FFT
/// bin arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Audio,
    Spectrum,
}

/// Amplitude gate with hysteresis.
///
/// `open_db` is the level at which the gate opens, `close_db` the level
/// at which it closes again; `close_db < open_db` is required unless the
/// always-open sentinel is set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Squelch {
    pub open_db: f32,
    pub close_db: f32,
}

impl Squelch {
    /// Build a squelch setting, enforcing hysteresis.
    ///
    /// `open_db == SQUELCH_ALWAYS_OPEN_DB` disables the gate and ignores
    /// `close_db`. Otherwise `close_db` must be strictly below `open_db`;
    /// when absent it defaults to one dB below the open threshold.
    pub fn new(open_db: f32, close_db: Option<f32>) -> Result<Self, crate::CoreError> {
        if open_db == SQUELCH_ALWAYS_OPEN_DB {
            return Ok(Self::always_open());
        }
        let close_db = close_db.unwrap_or(open_db - 1.0);
        if close_db >= open_db {
            return Err(crate::CoreError::InvalidInput(format!(
                "squelch close ({close_db} dB) must be below open ({open_db} dB)"
            )));
        }
        Ok(Self { open_db, close_db })
    }

    pub fn always_open() -> Self {
        Self {
            open_db: SQUELCH_ALWAYS_OPEN_DB,
            close_db: SQUELCH_ALWAYS_OPEN_DB,
        }
    }

    pub fn is_always_open(&self) -> bool {
        self.open_db == SQUELCH_ALWAYS_OPEN_DB
    }
}

impl Default for Squelch {
    fn default() -> Self {
        Self::always_open()
    }
}

/// What the session wants the backend channel to look like.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredChannel {
    pub frequency_hz: u64,
    pub mode: Mode,
    /// Passband edges in Hz. None for wide-IQ modes.
    pub low_edge_hz: Option<f32>,
    pub high_edge_hz: Option<f32>,
    pub squelch: Squelch,
}

impl DesiredChannel {
    pub fn new(frequency_hz: u64, mode: Mode) -> Self {
        let (low, high) = match mode.default_edges() {
            Some((l, h)) => (Some(l), Some(h)),
            None => (None, None),
        };
        Self {
            frequency_hz,
            mode,
            low_edge_hz: low,
            high_edge_hz: high,
            squelch: Squelch::default(),
        }
    }
}

/// Mirror of the backend's last-reported parameters for one SSRC.
///
/// Seeded from the create command, then overwritten field-by-field as
/// STATUS packets arrive.
#[derive(Debug, Clone, Default)]
pub struct ChannelState {
    pub kind: Option<ChannelKind>,
    pub frequency_hz: f64,
    pub preset: Option<String>,
    pub low_edge_hz: f32,
    pub high_edge_hz: f32,
    pub sample_rate: u32,
    pub channels: u8,
    pub bin_bandwidth_hz: f32,
    pub bin_count: i32,
    pub baseband_power_db: f32,
    pub noise_density_db: f32,
    /// Monotonic milliseconds of the last STATUS update, maintained by
    /// the cache owner.
    pub updated_ms: u64,
}
