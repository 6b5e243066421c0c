// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Transport DTOs for the client WebSocket protocol.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Audio encoding negotiated at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamFormat {
    #[serde(rename = "opus")]
    Opus,
    #[serde(rename = "pcm-zstd")]
    PcmZstd,
}

impl StreamFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "opus" => Some(StreamFormat::Opus),
            "pcm-zstd" => Some(StreamFormat::PcmZstd),
            _ => None,
        }
    }
}

/// Query string presented at the WebSocket upgrade.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectParams {
    pub user_session_id: String,
    pub frequency: Option<u64>,
    pub mode: Option<String>,
    #[serde(rename = "bandwidthLow")]
    pub bandwidth_low: Option<f32>,
    #[serde(rename = "bandwidthHigh")]
    pub bandwidth_high: Option<f32>,
    pub password: Option<String>,
    /// Client protocol version, 1 or 2. Defaults to 1.
    pub version: Option<u8>,
    /// "opus" or "pcm-zstd". Defaults to opus.
    pub format: Option<String>,
    /// "audio" (default) or "spectrum".
    #[serde(rename = "type")]
    pub session_type: Option<String>,
    #[serde(rename = "binCount")]
    pub bin_count: Option<u32>,
    #[serde(rename = "binBandwidth")]
    pub bin_bandwidth: Option<f32>,
}

/// Validate a client-supplied user session ID: UUID v4 with the RFC 4122
/// variant. Anything else — including other UUID versions — is rejected.
pub fn validate_user_session_id(s: &str) -> Option<Uuid> {
    let uuid = Uuid::try_parse(s).ok()?;
    if uuid.get_version_num() != 4 {
        return None;
    }
    match uuid.get_variant() {
        uuid::Variant::RFC4122 => Some(uuid),
        _ => None,
    }
}

/// Command received from the client over the WebSocket (JSON).
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Tune {
        frequency: Option<u64>,
        mode: Option<String>,
        #[serde(rename = "bandwidthLow")]
        bandwidth_low: Option<f32>,
        #[serde(rename = "bandwidthHigh")]
        bandwidth_high: Option<f32>,
    },
    Ping,
    GetStatus,
    SetSquelch {
        #[serde(rename = "squelchOpen")]
        squelch_open: f32,
        #[serde(rename = "squelchClose")]
        squelch_close: Option<f32>,
    },
}

/// Snapshot of one session, returned for `get_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub ssrc: u32,
    pub frequency: u64,
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bandwidth_low: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bandwidth_high: Option<f32>,
    pub sample_rate: u32,
    pub channels: u8,
    pub baseband_power: f32,
    pub noise_density: f32,
    pub squelch_open: f32,
    pub squelch_close: f32,
    pub bytes_sent: u64,
    pub uptime_seconds: u64,
}

/// Response sent to the client over the WebSocket (JSON).
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Status(SessionStatus),
    Pong,
    Error {
        status: u16,
        message: String,
    },
    SquelchUpdated {
        #[serde(rename = "squelchOpen")]
        squelch_open: f32,
        #[serde(rename = "squelchClose")]
        squelch_close: f32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tune_parses_partial_fields() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"tune","mode":"lsb"}"#).unwrap();
        match msg {
            ClientMessage::Tune {
                frequency,
                mode,
                bandwidth_low,
                bandwidth_high,
            } => {
                assert_eq!(frequency, None);
                assert_eq!(mode.as_deref(), Some("lsb"));
                assert_eq!(bandwidth_low, None);
                assert_eq!(bandwidth_high, None);
            }
            other => panic!("expected tune, got {other:?}"),
        }
    }

    #[test]
    fn tune_accepts_camel_case_bandwidth() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"tune","frequency":14074000,"bandwidthLow":200,"bandwidthHigh":2700}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::Tune {
                bandwidth_low,
                bandwidth_high,
                ..
            } => {
                assert_eq!(bandwidth_low, Some(200.0));
                assert_eq!(bandwidth_high, Some(2700.0));
            }
            other => panic!("expected tune, got {other:?}"),
        }
    }

    #[test]
    fn set_squelch_close_is_optional() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"set_squelch","squelchOpen":5}"#).unwrap();
        match msg {
            ClientMessage::SetSquelch {
                squelch_open,
                squelch_close,
            } => {
                assert_eq!(squelch_open, 5.0);
                assert_eq!(squelch_close, None);
            }
            other => panic!("expected set_squelch, got {other:?}"),
        }
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"reboot"}"#).is_err());
    }

    #[test]
    fn error_response_serializes_status() {
        let json = serde_json::to_string(&ServerMessage::Error {
            status: 429,
            message: "rate limited".into(),
        })
        .unwrap();
        assert!(json.contains(r#""type":"error""#));
        assert!(json.contains(r#""status":429"#));
    }

    #[test]
    fn stream_format_parse_is_exact() {
        assert_eq!(StreamFormat::parse("opus"), Some(StreamFormat::Opus));
        assert_eq!(StreamFormat::parse("pcm-zstd"), Some(StreamFormat::PcmZstd));
        assert_eq!(StreamFormat::parse("flac"), None);
        assert_eq!(StreamFormat::parse("OPUS"), None);
    }

    #[test]
    fn user_session_id_accepts_v4_only() {
        let v4 = Uuid::new_v4().to_string();
        assert!(validate_user_session_id(&v4).is_some());
        // v1-style UUID: version nibble 1.
        assert!(validate_user_session_id("c232ab00-9414-11ec-b3c8-9f68deced846").is_none());
        assert!(validate_user_session_id("not-a-uuid").is_none());
        assert!(validate_user_session_id("").is_none());
    }
}
