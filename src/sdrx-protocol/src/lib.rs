// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Wire formats spoken by the server: the radiod TLV control/status
//! protocol, RTP audio framing, the client JSON control messages, and
//! the binary WebSocket frame layouts.

pub mod frames;
pub mod rtp;
pub mod tlv;
pub mod types;

pub use tlv::{StatusMap, Value, PKT_CMD, PKT_STATUS};
pub use types::{ClientMessage, ServerMessage, StreamFormat};
