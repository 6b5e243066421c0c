// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Multicast RTP audio receiver.
//!
//! One UDP socket serves every session: packets are demultiplexed by
//! SSRC and enqueued on the owning session's bounded audio queue.
//! Enqueue never blocks — a slow client fills its own queue and loses
//! packets; nothing upstream stalls.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::info;

use sdrx_protocol::rtp;

use crate::logging::RepeatErrorLogger;
use crate::net::gps_time_ns;
use crate::sessions::{AudioPacket, SessionManager};

const RECV_BUF_LEN: usize = 65_536;

/// Counters surfaced through the status endpoint.
#[derive(Default)]
pub struct ReceiverStats {
    pub packets: AtomicU64,
    pub malformed: AtomicU64,
    pub unknown_ssrc: AtomicU64,
    pub dropped: AtomicU64,
}

/// Run the RTP receive loop until shutdown.
pub async fn run_audio_receiver(
    socket: UdpSocket,
    manager: Arc<SessionManager>,
    stats: Arc<ReceiverStats>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let recv_errors = RepeatErrorLogger::new("audio multicast recv failed");
    let mut buf = vec![0u8; RECV_BUF_LEN];
    info!("audio receiver listening");

    loop {
        tokio::select! {
            recv = socket.recv_from(&mut buf) => {
                match recv {
                    Ok((len, _peer)) => {
                        handle_datagram(&manager, &stats, &buf[..len], gps_time_ns());
                    }
                    Err(e) => {
                        recv_errors.log(&e.to_string());
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
            changed = shutdown_rx.changed() => {
                match changed {
                    Ok(()) if *shutdown_rx.borrow() => break,
                    Ok(()) => {}
                    Err(_) => break,
                }
            }
        }
    }
    info!("audio receiver shutting down");
}

/// Route one RTP datagram to its session. Malformed packets and unknown
/// SSRCs are dropped with a counter bump, never an error.
pub fn handle_datagram(
    manager: &SessionManager,
    stats: &ReceiverStats,
    datagram: &[u8],
    gps_time_ns: u64,
) {
    let (header, payload) = match rtp::parse(datagram) {
        Ok(parsed) => parsed,
        Err(_) => {
            stats.malformed.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };
    let Some(session) = manager.get_by_ssrc(header.ssrc) else {
        stats.unknown_ssrc.fetch_add(1, Ordering::Relaxed);
        return;
    };
    stats.packets.fetch_add(1, Ordering::Relaxed);

    let packet = AudioPacket {
        pcm: Bytes::copy_from_slice(payload),
        gps_time_ns,
        rtp_timestamp: header.timestamp,
    };
    if session.audio_tx.try_send(packet).is_err() {
        session.audio_dropped.fetch_add(1, Ordering::Relaxed);
        stats.dropped.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitsConfig;
    use crate::policy::ConfigPolicy;
    use crate::radiod::test_support::CaptureLink;
    use crate::radiod::RadiodController;
    use crate::sessions::AudioSessionRequest;
    use sdrx_core::modes::Mode;
    use sdrx_protocol::types::StreamFormat;
    use uuid::Uuid;

    fn manager_with_queue(depth: usize) -> Arc<SessionManager> {
        let (link, _) = CaptureLink::new();
        let limits = LimitsConfig {
            audio_queue: depth,
            ..Default::default()
        };
        SessionManager::new(
            Arc::new(RadiodController::new(link)),
            Arc::new(ConfigPolicy::new(Default::default())),
            limits,
            "test".to_string(),
            true,
        )
    }

    fn create_session(
        manager: &SessionManager,
    ) -> (Arc<crate::sessions::Session>, tokio::sync::mpsc::Receiver<AudioPacket>) {
        manager
            .create_audio_session(AudioSessionRequest {
                user_session_id: Uuid::new_v4(),
                client_ip: "192.0.2.1".parse().unwrap(),
                frequency: 14_074_000,
                mode: Mode::Usb,
                bandwidth_low: None,
                bandwidth_high: None,
                bypass: false,
                version: 2,
                format: StreamFormat::Opus,
            })
            .unwrap()
    }

    fn rtp_for(ssrc: u32, samples: u16) -> Vec<u8> {
        let payload: Vec<u8> = (0..samples).flat_map(|s| (s as i16).to_le_bytes()).collect();
        rtp::build(
            &rtp::RtpHeader {
                payload_type: 122,
                marker: false,
                sequence: 1,
                timestamp: 960,
                ssrc,
            },
            &payload,
        )
    }

    #[tokio::test]
    async fn datagram_reaches_the_owning_session() {
        let manager = manager_with_queue(4);
        let (session, mut rx) = create_session(&manager);
        let stats = ReceiverStats::default();

        handle_datagram(&manager, &stats, &rtp_for(session.ssrc, 960), 1234);

        let pkt = rx.try_recv().expect("packet routed");
        assert_eq!(pkt.pcm.len(), 1920);
        assert_eq!(pkt.gps_time_ns, 1234);
        assert_eq!(pkt.rtp_timestamp, 960);
        assert_eq!(stats.packets.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn unknown_ssrc_increments_counter_only() {
        let manager = manager_with_queue(4);
        let (_session, mut rx) = create_session(&manager);
        let stats = ReceiverStats::default();

        handle_datagram(&manager, &stats, &rtp_for(0x0BAD_F00D, 8), 0);

        assert!(rx.try_recv().is_err());
        assert_eq!(stats.unknown_ssrc.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn malformed_datagram_is_counted() {
        let manager = manager_with_queue(4);
        let stats = ReceiverStats::default();
        handle_datagram(&manager, &stats, &[0u8; 5], 0);
        assert_eq!(stats.malformed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn full_queue_drops_without_touching_other_sessions() {
        let manager = manager_with_queue(2);
        let (slow, _slow_rx) = create_session(&manager);
        let (fast, mut fast_rx) = create_session(&manager);
        let stats = ReceiverStats::default();

        // Fill the slow session's queue, then overflow it.
        for _ in 0..3 {
            handle_datagram(&manager, &stats, &rtp_for(slow.ssrc, 8), 0);
        }
        assert_eq!(slow.audio_dropped.load(Ordering::Relaxed), 1);

        // The other session still receives.
        handle_datagram(&manager, &stats, &rtp_for(fast.ssrc, 8), 0);
        assert!(fast_rx.try_recv().is_ok());
        assert_eq!(fast.audio_dropped.load(Ordering::Relaxed), 0);
    }
}
