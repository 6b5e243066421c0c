// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Error taxonomy shared across the server.
//!
//! Transport-layer kinds (`MalformedPacket`, `QueueFull`,
//! `BackendUnreachable`, `ChannelStalled`) recover locally — drop,
//! retry, count. Control-plane kinds surface to the client as JSON
//! errors with an HTTP-style status.

use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Query value out of range or tag outside its closed set.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Banned IP, UUID mismatch, kicked UUID, or a gated mode without
    /// bypass.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// A second audio session for the same (UUID, IP) pair.
    #[error("already connected: {0}")]
    AlreadyConnected(String),

    /// Per-IP connection rate, per-UUID command rate, or an internal
    /// retry cooldown.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// UDP send on the control socket failed.
    #[error("backend unreachable: {0}")]
    BackendUnreachable(#[from] std::io::Error),

    /// Bad TLV framing on the status or data path.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// Bounded session queue overflowed; the packet was dropped.
    #[error("queue full")]
    QueueFull,

    /// Spectrum session produced no data for too long.
    #[error("channel stalled: ssrc {0:#010x}")]
    ChannelStalled(u32),
}

impl CoreError {
    /// HTTP-style status surfaced in client-visible `error` messages.
    pub fn status(&self) -> u16 {
        match self {
            CoreError::InvalidInput(_) => 400,
            CoreError::Unauthorized(_) => 401,
            CoreError::AlreadyConnected(_) => 409,
            CoreError::RateLimited(_) => 429,
            CoreError::BackendUnreachable(_)
            | CoreError::MalformedPacket(_)
            | CoreError::QueueFull
            | CoreError::ChannelStalled(_) => 500,
        }
    }
}
