// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Receiver demodulation modes and their preset passbands.

use serde::{Deserialize, Serialize};

/// Demodulation preset understood by the DSP backend.
///
/// The set is closed: a tune request naming anything else is rejected
/// before a command is built. Wide-IQ modes (`Iq48`..`Iq384`) have their
/// passband fixed by the backend preset and never carry edge tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Usb,
    Lsb,
    Am,
    Sam,
    Fm,
    Nfm,
    Cwu,
    Cwl,
    Iq,
    Iq48,
    Iq96,
    Iq192,
    Iq384,
}

impl Mode {
    /// Parse a lowercase mode tag. Returns None for anything outside the
    /// closed set.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "usb" => Some(Mode::Usb),
            "lsb" => Some(Mode::Lsb),
            "am" => Some(Mode::Am),
            "sam" => Some(Mode::Sam),
            "fm" => Some(Mode::Fm),
            "nfm" => Some(Mode::Nfm),
            "cwu" => Some(Mode::Cwu),
            "cwl" => Some(Mode::Cwl),
            "iq" => Some(Mode::Iq),
            "iq48" => Some(Mode::Iq48),
            "iq96" => Some(Mode::Iq96),
            "iq192" => Some(Mode::Iq192),
            "iq384" => Some(Mode::Iq384),
            _ => None,
        }
    }

    /// The preset name sent to the backend.
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Usb => "usb",
            Mode::Lsb => "lsb",
            Mode::Am => "am",
            Mode::Sam => "sam",
            Mode::Fm => "fm",
            Mode::Nfm => "nfm",
            Mode::Cwu => "cwu",
            Mode::Cwl => "cwl",
            Mode::Iq => "iq",
            Mode::Iq48 => "iq48",
            Mode::Iq96 => "iq96",
            Mode::Iq192 => "iq192",
            Mode::Iq384 => "iq384",
        }
    }

    /// Wide-IQ modes use the preset's fixed bandwidth; callers cannot set
    /// edges on them.
    pub fn is_wide_iq(&self) -> bool {
        matches!(self, Mode::Iq48 | Mode::Iq96 | Mode::Iq192 | Mode::Iq384)
    }

    /// Any IQ output, wide or narrow. IQ payloads must reach the client
    /// losslessly, so the egress path refuses Opus for these.
    pub fn is_iq(&self) -> bool {
        matches!(
            self,
            Mode::Iq | Mode::Iq48 | Mode::Iq96 | Mode::Iq192 | Mode::Iq384
        )
    }

    /// Default passband edges (low, high) in Hz for the mode.
    ///
    /// None for wide-IQ modes: the backend preset decides and no edge
    /// tags are sent.
    pub fn default_edges(&self) -> Option<(f32, f32)> {
        match self {
            Mode::Usb => Some((50.0, 2700.0)),
            Mode::Lsb => Some((-2700.0, -50.0)),
            Mode::Am | Mode::Sam => Some((-5000.0, 5000.0)),
            Mode::Cwu | Mode::Cwl => Some((-200.0, 200.0)),
            Mode::Fm => Some((-8000.0, 8000.0)),
            Mode::Nfm => Some((-5000.0, 5000.0)),
            Mode::Iq => Some((-5000.0, 5000.0)),
            Mode::Iq48 | Mode::Iq96 | Mode::Iq192 | Mode::Iq384 => None,
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
