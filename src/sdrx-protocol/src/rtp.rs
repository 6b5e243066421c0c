// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Minimal RTP parsing for the radiod audio multicast.
//!
//! radiod frames demodulated audio as standard RTP with a 16-bit
//! little-endian PCM payload. The SSRC is the routing key; sequence
//! numbers are only used to surface gaps in counters.

use sdrx_core::error::{CoreError, CoreResult};

const RTP_HEADER_LEN: usize = 12;
const RTP_VERSION: u8 = 2;

/// Parsed fixed header of one RTP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub payload_type: u8,
    pub marker: bool,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

/// Parse an RTP datagram, returning the header and the payload slice.
///
/// CSRC entries and header extensions are skipped; padding is trimmed.
pub fn parse(buf: &[u8]) -> CoreResult<(RtpHeader, &[u8])> {
    if buf.len() < RTP_HEADER_LEN {
        return Err(CoreError::MalformedPacket(format!(
            "rtp datagram too short: {} bytes",
            buf.len()
        )));
    }

    let version = buf[0] >> 6;
    if version != RTP_VERSION {
        return Err(CoreError::MalformedPacket(format!(
            "rtp version {version}"
        )));
    }
    let padding = buf[0] & 0x20 != 0;
    let extension = buf[0] & 0x10 != 0;
    let csrc_count = (buf[0] & 0x0F) as usize;

    let header = RtpHeader {
        payload_type: buf[1] & 0x7F,
        marker: buf[1] & 0x80 != 0,
        sequence: u16::from_be_bytes([buf[2], buf[3]]),
        timestamp: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        ssrc: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
    };

    let mut offset = RTP_HEADER_LEN + csrc_count * 4;
    if buf.len() < offset {
        return Err(CoreError::MalformedPacket("rtp csrc overrun".into()));
    }
    if extension {
        if buf.len() < offset + 4 {
            return Err(CoreError::MalformedPacket("rtp extension overrun".into()));
        }
        let ext_words = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
        offset += 4 + ext_words * 4;
        if buf.len() < offset {
            return Err(CoreError::MalformedPacket("rtp extension overrun".into()));
        }
    }

    let mut end = buf.len();
    if padding {
        let pad = buf[end - 1] as usize;
        if pad == 0 || pad > end - offset {
            return Err(CoreError::MalformedPacket("rtp padding overrun".into()));
        }
        end -= pad;
    }

    Ok((header, &buf[offset..end]))
}

/// Convert a 16-bit little-endian PCM payload into samples. A trailing
/// odd byte is dropped.
pub fn pcm_samples(payload: &[u8]) -> Vec<i16> {
    payload
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

/// Build an RTP datagram. Used by test fixtures and the soak tooling;
/// the server itself never transmits RTP.
pub fn build(header: &RtpHeader, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RTP_HEADER_LEN + payload.len());
    buf.push(RTP_VERSION << 6);
    buf.push(header.payload_type | if header.marker { 0x80 } else { 0 });
    buf.extend_from_slice(&header.sequence.to_be_bytes());
    buf.extend_from_slice(&header.timestamp.to_be_bytes());
    buf.extend_from_slice(&header.ssrc.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}
