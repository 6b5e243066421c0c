// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Tag-length-value codec for the radiod control/status protocol.
//!
//! Integers are sent big-endian with leading zero bytes stripped; floats
//! keep their big-endian bit pattern with trailing zero bytes stripped.
//! A zero-length value decodes to 0 / 0.0. Lengths of 128 and above
//! carry a length-of-length in the low seven bits, followed by that many
//! big-endian length bytes. Tag 0 terminates a packet.

use std::collections::HashMap;

use sdrx_core::error::{CoreError, CoreResult};

/// Leading packet-type byte: STATUS from radiod.
pub const PKT_STATUS: u8 = 0;
/// Leading packet-type byte: command to radiod.
pub const PKT_CMD: u8 = 1;

/// Tags consumed and emitted by the core.
pub mod tags {
    pub const EOL: u8 = 0x00;
    pub const COMMAND_TAG: u8 = 0x01;
    pub const OUTPUT_SSRC: u8 = 0x12;
    pub const OUTPUT_SAMPRATE: u8 = 0x16;
    pub const OUTPUT_CHANNELS: u8 = 0x17;
    pub const PRESET: u8 = 0x1F;
    pub const RADIO_FREQUENCY: u8 = 0x21;
    pub const LOW_EDGE: u8 = 0x27;
    pub const HIGH_EDGE: u8 = 0x28;
    pub const BASEBAND_POWER: u8 = 0x35;
    pub const NOISE_DENSITY: u8 = 0x36;
    pub const NONCOHERENT_BIN_BW: u8 = 0x5D;
    pub const BIN_COUNT: u8 = 0x5E;
    pub const BIN_DATA: u8 = 0x60;
    pub const BIN_DATA_ALT: u8 = 0x8E;
}

/// A typed TLV value on the encode side.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    U32(u32),
    U64(u64),
    I32(i32),
    F32(f32),
    F64(f64),
    Str(String),
    F32Vec(Vec<f32>),
}

fn encode_uint(buf: &mut Vec<u8>, bytes: &[u8]) {
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    let stripped = &bytes[start..];
    write_len(buf, stripped.len());
    buf.extend_from_slice(stripped);
}

fn encode_float(buf: &mut Vec<u8>, bytes: &[u8]) {
    let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
    let stripped = &bytes[..end];
    write_len(buf, stripped.len());
    buf.extend_from_slice(stripped);
}

fn write_len(buf: &mut Vec<u8>, len: usize) {
    if len < 128 {
        buf.push(len as u8);
        return;
    }
    let be = (len as u64).to_be_bytes();
    let start = be.iter().position(|&b| b != 0).unwrap_or(be.len() - 1);
    let len_bytes = &be[start..];
    buf.push(0x80 | len_bytes.len() as u8);
    buf.extend_from_slice(len_bytes);
}

fn encode_value(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::U32(v) => encode_uint(buf, &v.to_be_bytes()),
        Value::U64(v) => encode_uint(buf, &v.to_be_bytes()),
        Value::I32(v) => encode_uint(buf, &(*v as u32).to_be_bytes()),
        Value::F32(v) => encode_float(buf, &v.to_be_bytes()),
        Value::F64(v) => encode_float(buf, &v.to_be_bytes()),
        Value::Str(s) => {
            write_len(buf, s.len());
            buf.extend_from_slice(s.as_bytes());
        }
        Value::F32Vec(vs) => {
            write_len(buf, vs.len() * 4);
            for v in vs {
                buf.extend_from_slice(&v.to_be_bytes());
            }
        }
    }
}

/// Encode a command packet: type byte 1, the fields in order, then EOL.
pub fn encode_cmd(fields: &[(u8, Value)]) -> Vec<u8> {
    encode_packet(PKT_CMD, fields)
}

/// Encode a packet with an explicit type byte. STATUS encoding is only
/// exercised by fixtures and sidecar tooling; radiod is the normal
/// STATUS source.
pub fn encode_packet(pkt_type: u8, fields: &[(u8, Value)]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    buf.push(pkt_type);
    for (tag, value) in fields {
        buf.push(*tag);
        encode_value(&mut buf, value);
    }
    buf.push(tags::EOL);
    buf
}

/// Decoded STATUS packet: raw value bytes per tag, with typed accessors
/// applying the zero-suppression rules. Unknown tags are retained but
/// never interpreted.
#[derive(Debug, Default)]
pub struct StatusMap {
    fields: HashMap<u8, Vec<u8>>,
}

impl StatusMap {
    pub fn contains(&self, tag: u8) -> bool {
        self.fields.contains_key(&tag)
    }

    pub fn get_u32(&self, tag: u8) -> Option<u32> {
        let raw = self.fields.get(&tag)?;
        if raw.len() > 4 {
            return None;
        }
        let mut be = [0u8; 4];
        be[4 - raw.len()..].copy_from_slice(raw);
        Some(u32::from_be_bytes(be))
    }

    pub fn get_u64(&self, tag: u8) -> Option<u64> {
        let raw = self.fields.get(&tag)?;
        if raw.len() > 8 {
            return None;
        }
        let mut be = [0u8; 8];
        be[8 - raw.len()..].copy_from_slice(raw);
        Some(u64::from_be_bytes(be))
    }

    pub fn get_i32(&self, tag: u8) -> Option<i32> {
        self.get_u32(tag).map(|v| v as i32)
    }

    /// Short float values are left-justified back into the high bytes to
    /// restore the original bit pattern.
    pub fn get_f32(&self, tag: u8) -> Option<f32> {
        let raw = self.fields.get(&tag)?;
        if raw.len() > 4 {
            return None;
        }
        let mut be = [0u8; 4];
        be[..raw.len()].copy_from_slice(raw);
        Some(f32::from_be_bytes(be))
    }

    pub fn get_f64(&self, tag: u8) -> Option<f64> {
        let raw = self.fields.get(&tag)?;
        if raw.len() > 8 {
            return None;
        }
        let mut be = [0u8; 8];
        be[..raw.len()].copy_from_slice(raw);
        Some(f64::from_be_bytes(be))
    }

    pub fn get_str(&self, tag: u8) -> Option<&str> {
        let raw = self.fields.get(&tag)?;
        std::str::from_utf8(raw).ok()
    }

    pub fn get_f32_array(&self, tag: u8) -> Option<Vec<f32>> {
        let raw = self.fields.get(&tag)?;
        if raw.len() % 4 != 0 {
            return None;
        }
        Some(
            raw.chunks_exact(4)
                .map(|c| f32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }

    /// Bin data arrives under either of two tags depending on the radiod
    /// build.
    pub fn bin_data(&self) -> Option<Vec<f32>> {
        self.get_f32_array(tags::BIN_DATA)
            .or_else(|| self.get_f32_array(tags::BIN_DATA_ALT))
    }
}

/// Decode a STATUS packet body (including the leading type byte).
///
/// Packets whose type byte is not STATUS decode to an empty map; the
/// multicast group carries our own commands back to us and those must
/// not be misread as backend state.
pub fn decode_status(buf: &[u8]) -> CoreResult<StatusMap> {
    let (pkt_type, map) = decode_packet(buf)?;
    if pkt_type == PKT_STATUS {
        Ok(map)
    } else {
        Ok(StatusMap::default())
    }
}

/// Decode any packet, returning its type byte and field map.
pub fn decode_packet(buf: &[u8]) -> CoreResult<(u8, StatusMap)> {
    let mut map = StatusMap::default();
    let Some((&pkt_type, mut rest)) = buf.split_first() else {
        return Err(CoreError::MalformedPacket("empty packet".into()));
    };

    while let Some((&tag, after_tag)) = rest.split_first() {
        if tag == tags::EOL {
            break;
        }
        let (len, after_len) = read_len(after_tag)?;
        if after_len.len() < len {
            return Err(CoreError::MalformedPacket(format!(
                "tag {tag:#04x}: length {len} exceeds remaining {}",
                after_len.len()
            )));
        }
        let (value, tail) = after_len.split_at(len);
        map.fields.insert(tag, value.to_vec());
        rest = tail;
    }
    Ok((pkt_type, map))
}

fn read_len(buf: &[u8]) -> CoreResult<(usize, &[u8])> {
    let Some((&first, rest)) = buf.split_first() else {
        return Err(CoreError::MalformedPacket("truncated length".into()));
    };
    if first < 0x80 {
        return Ok((first as usize, rest));
    }
    let n = (first & 0x7F) as usize;
    if n == 0 || n > 8 || rest.len() < n {
        return Err(CoreError::MalformedPacket(format!(
            "bad length-of-length {n} with {} bytes left",
            rest.len()
        )));
    }
    let (len_bytes, tail) = rest.split_at(n);
    let mut len: u64 = 0;
    for &b in len_bytes {
        len = (len << 8) | b as u64;
    }
    Ok((len as usize, tail))
}
