// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Binary WebSocket frame layouts for the audio egress path.
//!
//! Two parallel encodings exist: lossy Opus and lossless zstd-compressed
//! PCM. Opus frames carry a fixed header (21 bytes for protocol v2, 13
//! for v1). PCM frames start with a full header on the first packet and
//! whenever stream metadata changes (29 bytes v1, 37 bytes v2), and a
//! 13-byte minimal header otherwise. All header fields are
//! little-endian.

pub const OPUS_HEADER_V1_LEN: usize = 13;
pub const OPUS_HEADER_V2_LEN: usize = 21;
pub const PCM_FULL_HEADER_V1_LEN: usize = 29;
pub const PCM_FULL_HEADER_V2_LEN: usize = 37;
pub const PCM_MINIMAL_HEADER_LEN: usize = 13;

/// First byte of a PCM frame with a full header.
pub const PCM_FULL_MARKER: u8 = 0xFF;
/// First byte of a PCM frame with a minimal header.
pub const PCM_MINIMAL_MARKER: u8 = 0xFE;

/// Backend-reported signal levels, gain-adjusted by the egress path so
/// the client's S-meter tracks the displayed spectrum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalQuality {
    pub baseband_power_db: f32,
    pub noise_density_db: f32,
}

impl SignalQuality {
    /// Placeholder used before the first STATUS packet arrives.
    pub fn unknown() -> Self {
        Self {
            baseband_power_db: -999.0,
            noise_density_db: -999.0,
        }
    }
}

/// Stream metadata carried in PCM full headers. A change in any field
/// forces the next frame to carry a full header again.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PcmMeta {
    pub sample_rate: u32,
    pub channels: u8,
    pub bits_per_sample: u8,
    pub frequency_hz: f64,
}

/// Encode an Opus frame.
///
/// v2: `[timestamp:u64][sampleRate:u32][channels:u8][basebandPower:f32]
/// [noiseDensity:f32][payload]`; v1 omits the two f32 fields.
pub fn encode_opus(
    version: u8,
    gps_time_ns: u64,
    sample_rate: u32,
    channels: u8,
    quality: SignalQuality,
    payload: &[u8],
) -> Vec<u8> {
    let header_len = if version >= 2 {
        OPUS_HEADER_V2_LEN
    } else {
        OPUS_HEADER_V1_LEN
    };
    let mut buf = Vec::with_capacity(header_len + payload.len());
    buf.extend_from_slice(&gps_time_ns.to_le_bytes());
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.push(channels);
    if version >= 2 {
        buf.extend_from_slice(&quality.baseband_power_db.to_le_bytes());
        buf.extend_from_slice(&quality.noise_density_db.to_le_bytes());
    }
    buf.extend_from_slice(payload);
    buf
}

/// Encode a PCM frame with a full header.
pub fn encode_pcm_full(
    version: u8,
    gps_time_ns: u64,
    rtp_timestamp: u32,
    meta: PcmMeta,
    quality: SignalQuality,
    payload: &[u8],
) -> Vec<u8> {
    let header_len = if version >= 2 {
        PCM_FULL_HEADER_V2_LEN
    } else {
        PCM_FULL_HEADER_V1_LEN
    };
    let mut buf = Vec::with_capacity(header_len + payload.len());
    buf.push(PCM_FULL_MARKER);
    buf.push(version);
    buf.extend_from_slice(&gps_time_ns.to_le_bytes());
    buf.extend_from_slice(&meta.sample_rate.to_le_bytes());
    buf.push(meta.channels);
    buf.push(meta.bits_per_sample);
    buf.extend_from_slice(&meta.frequency_hz.to_le_bytes());
    buf.extend_from_slice(&rtp_timestamp.to_le_bytes());
    if version >= 2 {
        buf.extend_from_slice(&quality.baseband_power_db.to_le_bytes());
        buf.extend_from_slice(&quality.noise_density_db.to_le_bytes());
    }
    buf.push(0); // flags, reserved
    buf.extend_from_slice(payload);
    buf
}

/// Encode a PCM frame with the 13-byte minimal header.
pub fn encode_pcm_minimal(gps_time_ns: u64, rtp_timestamp: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(PCM_MINIMAL_HEADER_LEN + payload.len());
    buf.push(PCM_MINIMAL_MARKER);
    buf.extend_from_slice(&gps_time_ns.to_le_bytes());
    buf.extend_from_slice(&rtp_timestamp.to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

pub const SPECTRUM_HEADER_LEN: usize = 24;

/// Encode a spectrum frame:
/// `[timestamp:u64][centerFreq:f64][binBandwidth:f32][binCount:u32]
/// [bins:f32…]`, all little-endian, bins in dB in FFT order.
pub fn encode_spectrum(
    gps_time_ns: u64,
    center_frequency_hz: f64,
    bin_bandwidth_hz: f32,
    bins: &[f32],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(SPECTRUM_HEADER_LEN + bins.len() * 4);
    buf.extend_from_slice(&gps_time_ns.to_le_bytes());
    buf.extend_from_slice(&center_frequency_hz.to_le_bytes());
    buf.extend_from_slice(&bin_bandwidth_hz.to_le_bytes());
    buf.extend_from_slice(&(bins.len() as u32).to_le_bytes());
    for b in bins {
        buf.extend_from_slice(&b.to_le_bytes());
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quality() -> SignalQuality {
        SignalQuality {
            baseband_power_db: -37.5,
            noise_density_db: -132.25,
        }
    }

    fn meta() -> PcmMeta {
        PcmMeta {
            sample_rate: 12_000,
            channels: 1,
            bits_per_sample: 16,
            frequency_hz: 14_074_000.0,
        }
    }

    #[test]
    fn opus_v2_header_is_21_bytes() {
        let frame = encode_opus(2, 1_700_000_000_000_000_000, 12_000, 1, quality(), b"opus");
        assert_eq!(frame.len(), OPUS_HEADER_V2_LEN + 4);
        assert_eq!(
            u64::from_le_bytes(frame[0..8].try_into().unwrap()),
            1_700_000_000_000_000_000
        );
        assert_eq!(u32::from_le_bytes(frame[8..12].try_into().unwrap()), 12_000);
        assert_eq!(frame[12], 1);
        assert_eq!(
            f32::from_le_bytes(frame[13..17].try_into().unwrap()),
            -37.5
        );
        assert_eq!(
            f32::from_le_bytes(frame[17..21].try_into().unwrap()),
            -132.25
        );
        assert_eq!(&frame[21..], b"opus");
    }

    #[test]
    fn opus_v1_header_is_13_bytes_without_quality() {
        let frame = encode_opus(1, 7, 24_000, 2, quality(), b"x");
        assert_eq!(frame.len(), OPUS_HEADER_V1_LEN + 1);
        assert_eq!(frame[12], 2);
        assert_eq!(frame[13], b'x');
    }

    #[test]
    fn unknown_quality_encodes_minus_999() {
        let frame = encode_opus(2, 0, 12_000, 1, SignalQuality::unknown(), &[]);
        assert_eq!(
            f32::from_le_bytes(frame[13..17].try_into().unwrap()),
            -999.0
        );
        assert_eq!(
            f32::from_le_bytes(frame[17..21].try_into().unwrap()),
            -999.0
        );
    }

    #[test]
    fn pcm_full_header_sizes_match_contract() {
        let v1 = encode_pcm_full(1, 0, 0, meta(), quality(), &[]);
        let v2 = encode_pcm_full(2, 0, 0, meta(), quality(), &[]);
        assert_eq!(v1.len(), PCM_FULL_HEADER_V1_LEN);
        assert_eq!(v2.len(), PCM_FULL_HEADER_V2_LEN);
        assert_eq!(v1[0], PCM_FULL_MARKER);
        assert_eq!(v2[0], PCM_FULL_MARKER);
    }

    #[test]
    fn pcm_full_carries_stream_metadata() {
        let frame = encode_pcm_full(2, 42, 960, meta(), quality(), b"pcm");
        assert_eq!(frame[1], 2);
        assert_eq!(u64::from_le_bytes(frame[2..10].try_into().unwrap()), 42);
        assert_eq!(
            u32::from_le_bytes(frame[10..14].try_into().unwrap()),
            12_000
        );
        assert_eq!(frame[14], 1);
        assert_eq!(frame[15], 16);
        assert_eq!(
            f64::from_le_bytes(frame[16..24].try_into().unwrap()),
            14_074_000.0
        );
        assert_eq!(u32::from_le_bytes(frame[24..28].try_into().unwrap()), 960);
        assert_eq!(&frame[PCM_FULL_HEADER_V2_LEN..], b"pcm");
    }

    #[test]
    fn spectrum_frame_carries_bin_geometry() {
        let frame = encode_spectrum(9, 10_000_000.0, 100.0, &[-120.0, -60.5]);
        assert_eq!(frame.len(), SPECTRUM_HEADER_LEN + 8);
        assert_eq!(u64::from_le_bytes(frame[0..8].try_into().unwrap()), 9);
        assert_eq!(
            f64::from_le_bytes(frame[8..16].try_into().unwrap()),
            10_000_000.0
        );
        assert_eq!(f32::from_le_bytes(frame[16..20].try_into().unwrap()), 100.0);
        assert_eq!(u32::from_le_bytes(frame[20..24].try_into().unwrap()), 2);
        assert_eq!(
            f32::from_le_bytes(frame[24..28].try_into().unwrap()),
            -120.0
        );
    }

    #[test]
    fn pcm_minimal_header_is_13_bytes() {
        let frame = encode_pcm_minimal(5, 1920, b"z");
        assert_eq!(frame.len(), PCM_MINIMAL_HEADER_LEN + 1);
        assert_eq!(frame[0], PCM_MINIMAL_MARKER);
        assert_eq!(u64::from_le_bytes(frame[1..9].try_into().unwrap()), 5);
        assert_eq!(u32::from_le_bytes(frame[9..13].try_into().unwrap()), 1920);
    }
}
