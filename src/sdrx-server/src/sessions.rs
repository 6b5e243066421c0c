// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Session registry and lifecycle.
//!
//! The manager owns both index maps (session ID and SSRC); nothing else
//! touches them. Mutation goes through manager methods, reads through
//! snapshot accessors. Each session carries its own bounded transport
//! queues and a Done signal that fires exactly once, on destruction.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use uuid::Uuid;

use sdrx_core::channel::{ChannelKind, DesiredChannel, Squelch, MAX_EDGE_HZ};
use sdrx_core::error::{CoreError, CoreResult};
use sdrx_core::modes::Mode;
use sdrx_core::radio::freq::Freq;
use sdrx_protocol::types::StreamFormat;

use crate::config::LimitsConfig;
use crate::policy::{mode_permitted, Policy};
use crate::radiod::{RadiodController, UpdateCommand};

/// Backend preset-load window: edge commands wait this long after a
/// mode change so the preset does not clobber them.
pub const MODE_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Sessions idle longer than this are garbage collected.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Idle GC sweep cadence.
pub const IDLE_SWEEP_PERIOD: Duration = Duration::from_secs(60);

pub type SessionId = u64;

/// One demodulated audio packet on its way to a WebSocket writer.
#[derive(Debug, Clone)]
pub struct AudioPacket {
    pub pcm: Bytes,
    /// Wall clock at multicast receipt, nanoseconds since epoch.
    pub gps_time_ns: u64,
    pub rtp_timestamp: u32,
}

/// One spectrum frame (bins already converted to dB with master gain).
#[derive(Debug, Clone)]
pub struct SpectrumFrame {
    pub bins: Vec<f32>,
    pub center_frequency_hz: f64,
    pub bin_bandwidth_hz: f32,
    pub gps_time_ns: u64,
}

/// Mutable per-session state behind the session lock.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub desired: DesiredChannel,
    pub sample_rate: u32,
    pub channels: u8,
    pub baseband_power_db: f32,
    pub noise_density_db: f32,
    pub bin_count: u32,
    pub bin_bandwidth_hz: f32,
}

/// Reconciliation cooldowns, session-scoped so destruction evicts them.
#[derive(Debug, Default)]
pub struct ReconcileCooldown {
    pub last_retry: Option<Instant>,
    pub last_log: Option<Instant>,
}

pub struct Session {
    pub id: SessionId,
    pub ssrc: u32,
    pub user_session_id: Uuid,
    pub client_ip: IpAddr,
    pub kind: ChannelKind,
    pub bypass: bool,
    pub version: u8,
    /// Format the client asked for; IQ modes force PCM at the egress.
    pub requested_format: StreamFormat,

    state: RwLock<SessionState>,
    pub audio_tx: mpsc::Sender<AudioPacket>,
    pub spectrum_tx: mpsc::Sender<SpectrumFrame>,
    done_tx: watch::Sender<bool>,
    running: AtomicBool,

    pub bytes_sent: AtomicU64,
    pub audio_dropped: AtomicU64,
    pub spectrum_dropped: AtomicU64,
    pub created_at: Instant,
    last_active: Mutex<Instant>,
    pub last_spectrum_data: Mutex<Instant>,
    pub last_stall_recreate: Mutex<Option<Instant>>,
    pub reconcile: Mutex<ReconcileCooldown>,
}

impl Session {
    /// The Done signal; fires exactly once, on destruction.
    pub fn subscribe_done(&self) -> watch::Receiver<bool> {
        self.done_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn touch(&self) {
        *self.last_active.lock().expect("last_active mutex poisoned") = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active
            .lock()
            .expect("last_active mutex poisoned")
            .elapsed()
    }

    /// Snapshot of the mutable state.
    pub fn state(&self) -> SessionState {
        self.state.read().expect("session state lock poisoned").clone()
    }

    pub fn desired(&self) -> DesiredChannel {
        self.state
            .read()
            .expect("session state lock poisoned")
            .desired
            .clone()
    }

    pub fn update_state(&self, f: impl FnOnce(&mut SessionState)) {
        let mut state = self.state.write().expect("session state lock poisoned");
        f(&mut state);
    }

    /// Effective egress format: IQ must reach the client losslessly.
    pub fn effective_format(&self) -> StreamFormat {
        if self.desired().mode.is_iq() {
            StreamFormat::PcmZstd
        } else {
            self.requested_format
        }
    }

    fn channel_name(&self, prefix: &str) -> String {
        format!("{}-{:08x}", prefix, self.ssrc)
    }

    /// Fire the Done signal directly, bypassing the manager. Test-only:
    /// production destruction goes through `SessionManager`.
    #[cfg(test)]
    pub fn done_test_fire(&self) {
        let _ = self.done_tx.send(true);
    }
}

/// Arguments of a client `tune` message after JSON parsing.
#[derive(Debug, Clone, Default)]
pub struct TuneArgs {
    pub frequency: Option<u64>,
    pub mode: Option<String>,
    pub bandwidth_low: Option<f32>,
    pub bandwidth_high: Option<f32>,
}

#[derive(Default)]
struct Registry {
    by_id: HashMap<SessionId, Arc<Session>>,
    by_ssrc: HashMap<u32, Arc<Session>>,
    kicked: HashSet<Uuid>,
}

pub struct SessionManager {
    controller: Arc<RadiodController>,
    policy: Arc<dyn Policy>,
    limits: LimitsConfig,
    channel_prefix: String,
    enforce_session_ip_match: bool,
    inner: RwLock<Registry>,
    next_id: AtomicU64,
}

/// Parameters of a new audio session.
#[derive(Debug, Clone)]
pub struct AudioSessionRequest {
    pub user_session_id: Uuid,
    pub client_ip: IpAddr,
    pub frequency: u64,
    pub mode: Mode,
    pub bandwidth_low: Option<f32>,
    pub bandwidth_high: Option<f32>,
    pub bypass: bool,
    pub version: u8,
    pub format: StreamFormat,
}

/// Parameters of a new spectrum session.
#[derive(Debug, Clone)]
pub struct SpectrumSessionRequest {
    pub user_session_id: Uuid,
    pub client_ip: IpAddr,
    pub center_frequency: u64,
    pub bin_count: u32,
    pub bin_bandwidth_hz: f32,
    pub version: u8,
}

impl SessionManager {
    pub fn new(
        controller: Arc<RadiodController>,
        policy: Arc<dyn Policy>,
        limits: LimitsConfig,
        channel_prefix: String,
        enforce_session_ip_match: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            controller,
            policy,
            limits,
            channel_prefix,
            enforce_session_ip_match,
            inner: RwLock::new(Registry::default()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn session_count(&self) -> usize {
        self.registry_read().by_id.len()
    }

    /// Backend channel name for a session.
    pub fn channel_name(&self, session: &Session) -> String {
        session.channel_name(&self.channel_prefix)
    }

    pub fn get_by_ssrc(&self, ssrc: u32) -> Option<Arc<Session>> {
        self.registry_read().by_ssrc.get(&ssrc).cloned()
    }

    pub fn get_by_uuid(&self, uuid: &Uuid) -> Option<Arc<Session>> {
        self.registry_read()
            .by_id
            .values()
            .find(|s| s.user_session_id == *uuid)
            .cloned()
    }

    /// Visit every live session without exposing the maps.
    pub fn for_each_session(&self, mut f: impl FnMut(&Arc<Session>)) {
        let sessions: Vec<Arc<Session>> = self.registry_read().by_id.values().cloned().collect();
        for s in &sessions {
            f(s);
        }
    }

    fn registry_read(&self) -> std::sync::RwLockReadGuard<'_, Registry> {
        self.inner.read().expect("session registry lock poisoned")
    }

    fn registry_write(&self) -> std::sync::RwLockWriteGuard<'_, Registry> {
        self.inner.write().expect("session registry lock poisoned")
    }

    /// Draw an unused SSRC: uniform 32-bit, excluding 0 and
    /// 0xFFFFFFFF, retried on collision. With a 32-bit space and a few
    /// hundred sessions the bound is never reached in practice.
    fn alloc_ssrc(registry: &Registry) -> CoreResult<u32> {
        let mut rng = rand::thread_rng();
        for _ in 0..128 {
            let ssrc: u32 = rng.gen();
            if ssrc == 0 || ssrc == u32::MAX {
                continue;
            }
            if !registry.by_ssrc.contains_key(&ssrc) {
                return Ok(ssrc);
            }
        }
        Err(CoreError::InvalidInput("ssrc space exhausted".into()))
    }

    fn sessions_for_ip(registry: &Registry, ip: IpAddr) -> usize {
        registry
            .by_id
            .values()
            .filter(|s| s.client_ip == ip)
            .count()
    }

    /// Validate a requested passband against ordering and the clamp.
    fn validate_edges(low: f32, high: f32, bypass: bool) -> CoreResult<()> {
        if low >= high {
            return Err(CoreError::InvalidInput(format!(
                "bandwidth low {low} must be below high {high}"
            )));
        }
        if !bypass && (low.abs() > MAX_EDGE_HZ || high.abs() > MAX_EDGE_HZ) {
            return Err(CoreError::InvalidInput(format!(
                "bandwidth edges {low}..{high} exceed ±{MAX_EDGE_HZ} Hz"
            )));
        }
        Ok(())
    }

    fn build_session(
        &self,
        registry: &mut Registry,
        kind: ChannelKind,
        ssrc: u32,
        req_uuid: Uuid,
        client_ip: IpAddr,
        bypass: bool,
        version: u8,
        format: StreamFormat,
        state: SessionState,
    ) -> (Arc<Session>, mpsc::Receiver<AudioPacket>, mpsc::Receiver<SpectrumFrame>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (audio_tx, audio_rx) = mpsc::channel(self.limits.audio_queue);
        let (spectrum_tx, spectrum_rx) = mpsc::channel(self.limits.spectrum_queue);
        let (done_tx, _) = watch::channel(false);
        let now = Instant::now();
        let session = Arc::new(Session {
            id,
            ssrc,
            user_session_id: req_uuid,
            client_ip,
            kind,
            bypass,
            version,
            requested_format: format,
            state: RwLock::new(state),
            audio_tx,
            spectrum_tx,
            done_tx,
            running: AtomicBool::new(true),
            bytes_sent: AtomicU64::new(0),
            audio_dropped: AtomicU64::new(0),
            spectrum_dropped: AtomicU64::new(0),
            created_at: now,
            last_active: Mutex::new(now),
            last_spectrum_data: Mutex::new(now),
            last_stall_recreate: Mutex::new(None),
            reconcile: Mutex::new(ReconcileCooldown::default()),
        });
        registry.by_id.insert(id, session.clone());
        registry.by_ssrc.insert(ssrc, session.clone());
        (session, audio_rx, spectrum_rx)
    }

    /// Create an audio session and provision its backend channel.
    pub fn create_audio_session(
        &self,
        req: AudioSessionRequest,
    ) -> CoreResult<(Arc<Session>, mpsc::Receiver<AudioPacket>)> {
        if !Freq::new(req.frequency).is_tunable() {
            return Err(CoreError::InvalidInput(format!(
                "frequency {} outside tunable range",
                req.frequency
            )));
        }
        if !mode_permitted(&*self.policy, req.mode, req.client_ip, req.bypass) {
            return Err(CoreError::Unauthorized(format!(
                "mode {} requires bypass",
                req.mode
            )));
        }

        // Edge handling: wide-IQ ignores caller edges; otherwise missing
        // edges fall back to the mode defaults and supplied ones are
        // validated.
        let (low, high) = if req.mode.is_wide_iq() {
            (None, None)
        } else {
            let (dl, dh) = req.mode.default_edges().expect("narrow mode has edges");
            let low = req.bandwidth_low.unwrap_or(dl);
            let high = req.bandwidth_high.unwrap_or(dh);
            Self::validate_edges(low, high, req.bypass)?;
            (Some(low), Some(high))
        };

        let (session, audio_rx) = {
            let mut registry = self.registry_write();
            if registry.kicked.contains(&req.user_session_id) {
                return Err(CoreError::Unauthorized("session was kicked".into()));
            }
            for existing in registry.by_id.values() {
                if existing.kind != ChannelKind::Audio
                    || existing.user_session_id != req.user_session_id
                {
                    continue;
                }
                if existing.client_ip == req.client_ip {
                    return Err(CoreError::AlreadyConnected(format!(
                        "uuid {} already has an audio session",
                        req.user_session_id
                    )));
                }
                if self.enforce_session_ip_match {
                    return Err(CoreError::Unauthorized(format!(
                        "uuid {} is bound to another address",
                        req.user_session_id
                    )));
                }
            }
            if Self::sessions_for_ip(&registry, req.client_ip) >= self.limits.sessions_per_ip {
                return Err(CoreError::RateLimited(format!(
                    "too many sessions from {}",
                    req.client_ip
                )));
            }

            let ssrc = Self::alloc_ssrc(&registry)?;
            let mut desired = DesiredChannel::new(req.frequency, req.mode);
            desired.low_edge_hz = low;
            desired.high_edge_hz = high;
            let state = SessionState {
                desired,
                sample_rate: 12_000,
                channels: 1,
                baseband_power_db: -999.0,
                noise_density_db: -999.0,
                bin_count: 0,
                bin_bandwidth_hz: 0.0,
            };
            let (session, audio_rx, _spectrum_rx) = self.build_session(
                &mut registry,
                ChannelKind::Audio,
                ssrc,
                req.user_session_id,
                req.client_ip,
                req.bypass,
                req.version,
                req.format,
                state,
            );
            (session, audio_rx)
        };

        let name = session.channel_name(&self.channel_prefix);
        if let Err(e) = self.controller.create_audio_channel(
            &name,
            req.frequency,
            req.mode,
            session.ssrc,
            low,
            high,
        ) {
            self.remove_entry(session.id);
            return Err(e);
        }

        info!(
            "audio session {} ssrc={:#010x} {} {} from {}",
            session.id,
            session.ssrc,
            Freq::new(req.frequency),
            req.mode,
            req.client_ip
        );
        Ok((session, audio_rx))
    }

    /// Create a spectrum session and provision its backend FFT channel.
    pub fn create_spectrum_session(
        &self,
        req: SpectrumSessionRequest,
    ) -> CoreResult<(Arc<Session>, mpsc::Receiver<SpectrumFrame>)> {
        if req.bin_count == 0 || req.bin_count > 65_536 {
            return Err(CoreError::InvalidInput(format!(
                "bin count {} out of range",
                req.bin_count
            )));
        }
        if req.bin_bandwidth_hz <= 0.0 {
            return Err(CoreError::InvalidInput(format!(
                "bin bandwidth {} must be positive",
                req.bin_bandwidth_hz
            )));
        }

        let (session, spectrum_rx) = {
            let mut registry = self.registry_write();
            if registry.kicked.contains(&req.user_session_id) {
                return Err(CoreError::Unauthorized("session was kicked".into()));
            }
            if Self::sessions_for_ip(&registry, req.client_ip) >= self.limits.sessions_per_ip {
                return Err(CoreError::RateLimited(format!(
                    "too many sessions from {}",
                    req.client_ip
                )));
            }
            let ssrc = Self::alloc_ssrc(&registry)?;
            let state = SessionState {
                desired: DesiredChannel::new(req.center_frequency, Mode::Iq),
                sample_rate: 0,
                channels: 0,
                baseband_power_db: -999.0,
                noise_density_db: -999.0,
                bin_count: req.bin_count,
                bin_bandwidth_hz: req.bin_bandwidth_hz,
            };
            let (session, _audio_rx, spectrum_rx) = self.build_session(
                &mut registry,
                ChannelKind::Spectrum,
                ssrc,
                req.user_session_id,
                req.client_ip,
                false,
                req.version,
                StreamFormat::PcmZstd,
                state,
            );
            (session, spectrum_rx)
        };

        let name = session.channel_name(&self.channel_prefix);
        if let Err(e) = self.controller.create_spectrum_channel(
            &name,
            req.center_frequency,
            req.bin_count,
            req.bin_bandwidth_hz,
            session.ssrc,
            false,
        ) {
            self.remove_entry(session.id);
            return Err(e);
        }

        info!(
            "spectrum session {} ssrc={:#010x} {} bins x {} Hz from {}",
            session.id,
            session.ssrc,
            req.bin_count,
            req.bin_bandwidth_hz,
            req.client_ip
        );
        Ok((session, spectrum_rx))
    }

    /// Compound update from one client `tune` message.
    ///
    /// Mode changes split into two commands: the preset load resets the
    /// backend's passband, so edges are re-sent once the preset window
    /// has passed. Wide-IQ targets skip the edge command entirely.
    pub async fn tune(&self, session: &Arc<Session>, args: &TuneArgs) -> CoreResult<()> {
        session.touch();
        let current = session.desired();

        let new_mode = match args.mode.as_deref() {
            Some(s) => Some(Mode::parse(s).ok_or_else(|| {
                CoreError::InvalidInput(format!("unknown mode {s:?}"))
            })?),
            None => None,
        };
        if let Some(f) = args.frequency {
            if !Freq::new(f).is_tunable() {
                return Err(CoreError::InvalidInput(format!(
                    "frequency {f} outside tunable range"
                )));
            }
        }
        if let Some(mode) = new_mode {
            if !mode_permitted(&*self.policy, mode, session.client_ip, session.bypass) {
                return Err(CoreError::Unauthorized(format!(
                    "mode {mode} requires bypass"
                )));
            }
        }

        let target_mode = new_mode.unwrap_or(current.mode);
        let edges_supplied = args.bandwidth_low.is_some() || args.bandwidth_high.is_some();

        // Resolve and validate the candidate passband for narrow modes.
        // Wide-IQ ignores caller edges without error.
        let candidate_edges = if target_mode.is_wide_iq() {
            None
        } else if edges_supplied {
            let low = args
                .bandwidth_low
                .or(current.low_edge_hz)
                .unwrap_or_else(|| target_mode.default_edges().map(|(l, _)| l).unwrap_or(50.0));
            let high = args
                .bandwidth_high
                .or(current.high_edge_hz)
                .unwrap_or_else(|| target_mode.default_edges().map(|(_, h)| h).unwrap_or(3000.0));
            Self::validate_edges(low, high, session.bypass)?;
            Some((low, high))
        } else {
            None
        };

        let mode_changed = new_mode.map_or(false, |m| m != current.mode);
        let freq_changed = args
            .frequency
            .map_or(false, |f| f != current.frequency_hz);

        if !mode_changed {
            let edges_changed = candidate_edges.map_or(false, |(l, h)| {
                current.low_edge_hz != Some(l) || current.high_edge_hz != Some(h)
            });
            if !freq_changed && !edges_changed {
                return Ok(());
            }
            let mut cmd = UpdateCommand {
                ssrc: session.ssrc,
                ..Default::default()
            };
            if freq_changed {
                cmd.frequency_hz = args.frequency.map(|f| f as f64);
            }
            if edges_changed {
                if let Some((low, high)) = candidate_edges {
                    cmd.low_edge_hz = Some(low);
                    cmd.high_edge_hz = Some(high);
                }
            }
            self.controller.update_channel(&cmd)?;
            session.update_state(|state| {
                if let Some(f) = args.frequency {
                    state.desired.frequency_hz = f;
                }
                if let Some((low, high)) = candidate_edges {
                    state.desired.low_edge_hz = Some(low);
                    state.desired.high_edge_hz = Some(high);
                }
            });
            return Ok(());
        }

        let mode = target_mode;
        self.controller.update_channel(&UpdateCommand {
            ssrc: session.ssrc,
            frequency_hz: freq_changed.then(|| args.frequency.unwrap_or_default() as f64),
            mode: Some(mode),
            ..Default::default()
        })?;

        let final_edges = if mode.is_wide_iq() {
            None
        } else {
            let (low, high) = candidate_edges.unwrap_or_else(|| {
                mode.default_edges().expect("narrow mode has edges")
            });
            tokio::time::sleep(MODE_SETTLE_DELAY).await;
            self.controller.update_channel(&UpdateCommand {
                ssrc: session.ssrc,
                low_edge_hz: Some(low),
                high_edge_hz: Some(high),
                ..Default::default()
            })?;
            Some((low, high))
        };

        session.update_state(|state| {
            if let Some(f) = args.frequency {
                state.desired.frequency_hz = f;
            }
            state.desired.mode = mode;
            state.desired.low_edge_hz = final_edges.map(|(l, _)| l);
            state.desired.high_edge_hz = final_edges.map(|(_, h)| h);
        });
        Ok(())
    }

    /// Apply a `set_squelch` message.
    pub fn set_squelch(
        &self,
        session: &Arc<Session>,
        open_db: f32,
        close_db: Option<f32>,
    ) -> CoreResult<Squelch> {
        session.touch();
        let squelch = Squelch::new(open_db, close_db)?;
        session.update_state(|state| state.desired.squelch = squelch);
        Ok(squelch)
    }

    /// Mark the UUID kicked and destroy its sessions. Subsequent
    /// connects with that UUID are rejected.
    pub fn kick(&self, uuid: &Uuid) -> usize {
        self.registry_write().kicked.insert(*uuid);
        let mut destroyed = 0;
        while let Some(session) = self.get_by_uuid(uuid) {
            if self.destroy_session(session.id) {
                destroyed += 1;
            } else {
                break;
            }
        }
        destroyed
    }

    fn remove_entry(&self, id: SessionId) {
        let mut registry = self.registry_write();
        if let Some(session) = registry.by_id.remove(&id) {
            registry.by_ssrc.remove(&session.ssrc);
        }
    }

    /// Destroy a session: flip the running flag, fire Done, disable the
    /// backend channel, then drop the registry entries. Returns false if
    /// the session was already destroyed.
    pub fn destroy_session(&self, id: SessionId) -> bool {
        let Some(session) = self.registry_read().by_id.get(&id).cloned() else {
            return false;
        };
        if !session.running.swap(false, Ordering::SeqCst) {
            return false;
        }
        let _ = session.done_tx.send(true);

        let name = session.channel_name(&self.channel_prefix);
        if let Err(e) = self.controller.disable_channel(&name, session.ssrc) {
            warn!("disable of {} failed: {}", name, e);
        }
        self.remove_entry(id);
        info!(
            "session {} ssrc={:#010x} destroyed ({} bytes sent, {} audio drops)",
            session.id,
            session.ssrc,
            session.bytes_sent.load(Ordering::Relaxed),
            session.audio_dropped.load(Ordering::Relaxed)
        );
        true
    }

    /// Destroy sessions idle beyond the timeout. Returns how many.
    pub fn sweep_idle(&self) -> usize {
        let idle: Vec<SessionId> = {
            let registry = self.registry_read();
            registry
                .by_id
                .values()
                .filter(|s| s.idle_for() > IDLE_TIMEOUT)
                .map(|s| s.id)
                .collect()
        };
        let mut swept = 0;
        for id in idle {
            info!("session {} idle beyond timeout, destroying", id);
            if self.destroy_session(id) {
                swept += 1;
            }
        }
        swept
    }

    /// Destroy everything (process shutdown).
    pub fn shutdown_all(&self) {
        let ids: Vec<SessionId> = self.registry_read().by_id.keys().copied().collect();
        for id in ids {
            self.destroy_session(id);
        }
    }

    /// Background idle sweep, one pass per minute.
    pub async fn run_idle_gc(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(IDLE_SWEEP_PERIOD);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let swept = self.sweep_idle();
                    if swept > 0 {
                        info!("idle sweep destroyed {} sessions", swept);
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
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::ConfigPolicy;
    use crate::radiod::test_support::CaptureLink;
    use sdrx_protocol::tlv::{decode_packet, tags};

    fn test_manager() -> (Arc<SessionManager>, Arc<Mutex<Vec<Vec<u8>>>>) {
        test_manager_with(|_| {})
    }

    fn test_manager_with(
        f: impl FnOnce(&mut crate::config::PolicyConfig),
    ) -> (Arc<SessionManager>, Arc<Mutex<Vec<Vec<u8>>>>) {
        let (link, sent) = CaptureLink::new();
        let controller = Arc::new(RadiodController::new(link));
        let mut policy_cfg = crate::config::PolicyConfig::default();
        f(&mut policy_cfg);
        let enforce = policy_cfg.enforce_session_ip_match;
        let manager = SessionManager::new(
            controller,
            Arc::new(ConfigPolicy::new(policy_cfg)),
            LimitsConfig::default(),
            "test".to_string(),
            enforce,
        );
        (manager, sent)
    }

    fn audio_request(uuid: Uuid, ip: &str) -> AudioSessionRequest {
        AudioSessionRequest {
            user_session_id: uuid,
            client_ip: ip.parse().unwrap(),
            frequency: 14_074_000,
            mode: Mode::Usb,
            bandwidth_low: Some(200.0),
            bandwidth_high: Some(2700.0),
            bypass: false,
            version: 2,
            format: StreamFormat::Opus,
        }
    }

    #[test]
    fn ssrc_stays_unique_across_create_destroy() {
        let (manager, _) = test_manager();
        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        for i in 0..32 {
            let ip = format!("192.0.2.{}", i + 1);
            let (s, _rx) = manager
                .create_audio_session(audio_request(Uuid::new_v4(), &ip))
                .unwrap();
            assert_ne!(s.ssrc, 0);
            assert_ne!(s.ssrc, u32::MAX);
            assert!(seen.insert(s.ssrc), "ssrc reused while alive");
            ids.push(s.id);
        }
        for id in ids.iter().take(16) {
            assert!(manager.destroy_session(*id));
        }
        for i in 0..16 {
            let ip = format!("198.51.100.{}", i + 1);
            let (s, _rx) = manager
                .create_audio_session(audio_request(Uuid::new_v4(), &ip))
                .unwrap();
            // Live sessions never share an SSRC.
            let mut live = HashSet::new();
            manager.for_each_session(|s| {
                assert!(live.insert(s.ssrc));
            });
            drop(s);
        }
    }

    #[test]
    fn duplicate_uuid_same_ip_is_already_connected() {
        let (manager, _) = test_manager();
        let uuid = Uuid::new_v4();
        let (_s, _rx) = manager
            .create_audio_session(audio_request(uuid, "192.0.2.1"))
            .unwrap();
        let err = manager
            .create_audio_session(audio_request(uuid, "192.0.2.1"))
            .unwrap_err();
        assert!(matches!(err, CoreError::AlreadyConnected(_)));
    }

    #[test]
    fn uuid_from_other_ip_is_unauthorized_when_enforced() {
        let (manager, _) = test_manager();
        let uuid = Uuid::new_v4();
        let (_s, _rx) = manager
            .create_audio_session(audio_request(uuid, "192.0.2.1"))
            .unwrap();
        let err = manager
            .create_audio_session(audio_request(uuid, "198.51.100.1"))
            .unwrap_err();
        assert!(matches!(err, CoreError::Unauthorized(_)));
    }

    #[test]
    fn uuid_from_other_ip_is_allowed_when_not_enforced() {
        let (manager, _) = test_manager_with(|c| c.enforce_session_ip_match = false);
        let uuid = Uuid::new_v4();
        let (_s, _rx) = manager
            .create_audio_session(audio_request(uuid, "192.0.2.1"))
            .unwrap();
        assert!(manager
            .create_audio_session(audio_request(uuid, "198.51.100.1"))
            .is_ok());
    }

    #[test]
    fn kicked_uuid_cannot_reconnect() {
        let (manager, _) = test_manager();
        let uuid = Uuid::new_v4();
        let (_s, _rx) = manager
            .create_audio_session(audio_request(uuid, "192.0.2.1"))
            .unwrap();
        assert_eq!(manager.kick(&uuid), 1);
        assert!(manager.get_by_uuid(&uuid).is_none());
        let err = manager
            .create_audio_session(audio_request(uuid, "192.0.2.1"))
            .unwrap_err();
        assert!(matches!(err, CoreError::Unauthorized(_)));
    }

    #[test]
    fn edge_clamp_rejects_without_sending() {
        let (manager, sent) = test_manager();
        let mut req = audio_request(Uuid::new_v4(), "192.0.2.1");
        req.bandwidth_high = Some(9_000.0);
        let before = sent.lock().unwrap().len();
        let err = manager.create_audio_session(req).unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
        assert_eq!(sent.lock().unwrap().len(), before, "no command sent");
    }

    #[test]
    fn bypass_lifts_edge_clamp() {
        let (manager, _) = test_manager();
        let mut req = audio_request(Uuid::new_v4(), "192.0.2.1");
        req.mode = Mode::Fm;
        req.bandwidth_low = Some(-10_000.0);
        req.bandwidth_high = Some(10_000.0);
        req.bypass = true;
        assert!(manager.create_audio_session(req).is_ok());
    }

    #[test]
    fn wide_iq_requires_grant() {
        let (manager, _) = test_manager();
        let mut req = audio_request(Uuid::new_v4(), "192.0.2.1");
        req.mode = Mode::Iq96;
        let err = manager.create_audio_session(req).unwrap_err();
        assert!(matches!(err, CoreError::Unauthorized(_)));
    }

    #[test]
    fn public_iq_mode_is_open() {
        let (manager, sent) = test_manager_with(|c| {
            c.public_iq_modes.insert(Mode::Iq96);
        });
        let mut req = audio_request(Uuid::new_v4(), "192.0.2.1");
        req.mode = Mode::Iq96;
        req.bandwidth_low = Some(-20_000.0); // ignored for wide IQ
        req.bandwidth_high = Some(20_000.0);
        let (session, _rx) = manager.create_audio_session(req).unwrap();
        assert_eq!(session.desired().low_edge_hz, None);
        // No edge tags on the wire.
        let sent = sent.lock().unwrap();
        let (_, map) = decode_packet(sent.last().unwrap()).unwrap();
        assert!(!map.contains(tags::LOW_EDGE));
        assert!(!map.contains(tags::HIGH_EDGE));
    }

    #[tokio::test(start_paused = true)]
    async fn mode_change_splits_into_two_commands() {
        let (manager, sent) = test_manager();
        let (session, _rx) = manager
            .create_audio_session(audio_request(Uuid::new_v4(), "192.0.2.1"))
            .unwrap();
        let before = sent.lock().unwrap().len();

        let started = tokio::time::Instant::now();
        manager
            .tune(
                &session,
                &TuneArgs {
                    mode: Some("lsb".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(
            started.elapsed() >= MODE_SETTLE_DELAY,
            "edge command waits out the preset load window"
        );

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), before + 2, "mode change emits two commands");

        let (_, first) = decode_packet(&sent[before]).unwrap();
        assert_eq!(first.get_str(tags::PRESET), Some("lsb"));
        assert!(!first.contains(tags::LOW_EDGE));
        assert!(!first.contains(tags::HIGH_EDGE));

        let (_, second) = decode_packet(&sent[before + 1]).unwrap();
        assert!(!second.contains(tags::PRESET));
        assert_eq!(second.get_f32(tags::LOW_EDGE), Some(-2700.0));
        assert_eq!(second.get_f32(tags::HIGH_EDGE), Some(-50.0));

        assert_eq!(session.desired().mode, Mode::Lsb);
        assert_eq!(session.desired().low_edge_hz, Some(-2700.0));
    }

    #[tokio::test(start_paused = true)]
    async fn tune_into_wide_iq_skips_edge_command() {
        let (manager, sent) = test_manager_with(|c| {
            c.public_iq_modes.insert(Mode::Iq96);
        });
        let (session, _rx) = manager
            .create_audio_session(audio_request(Uuid::new_v4(), "192.0.2.1"))
            .unwrap();
        let before = sent.lock().unwrap().len();

        manager
            .tune(
                &session,
                &TuneArgs {
                    mode: Some("iq96".to_string()),
                    bandwidth_low: Some(-3000.0),
                    bandwidth_high: Some(3000.0),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), before + 1, "wide IQ sends a single command");
        let (_, map) = decode_packet(&sent[before]).unwrap();
        assert_eq!(map.get_str(tags::PRESET), Some("iq96"));
        assert!(!map.contains(tags::LOW_EDGE));
        assert!(!map.contains(tags::HIGH_EDGE));
        assert_eq!(session.desired().low_edge_hz, None);
    }

    #[tokio::test]
    async fn frequency_only_tune_sends_one_command() {
        let (manager, sent) = test_manager();
        let (session, _rx) = manager
            .create_audio_session(audio_request(Uuid::new_v4(), "192.0.2.1"))
            .unwrap();
        let before = sent.lock().unwrap().len();

        manager
            .tune(
                &session,
                &TuneArgs {
                    frequency: Some(7_100_000),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), before + 1);
        let (_, map) = decode_packet(&sent[before]).unwrap();
        assert_eq!(map.get_f64(tags::RADIO_FREQUENCY), Some(7_100_000.0));
        assert!(!map.contains(tags::PRESET));
        assert_eq!(session.desired().frequency_hz, 7_100_000);
    }

    #[tokio::test]
    async fn noop_tune_sends_nothing() {
        let (manager, sent) = test_manager();
        let (session, _rx) = manager
            .create_audio_session(audio_request(Uuid::new_v4(), "192.0.2.1"))
            .unwrap();
        let before = sent.lock().unwrap().len();
        manager.tune(&session, &TuneArgs::default()).await.unwrap();
        assert_eq!(sent.lock().unwrap().len(), before);
    }

    #[tokio::test]
    async fn tune_with_out_of_clamp_edges_is_rejected() {
        let (manager, sent) = test_manager();
        let (session, _rx) = manager
            .create_audio_session(audio_request(Uuid::new_v4(), "192.0.2.1"))
            .unwrap();
        let before = sent.lock().unwrap().len();
        let err = manager
            .tune(
                &session,
                &TuneArgs {
                    bandwidth_high: Some(9_000.0),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
        assert_eq!(sent.lock().unwrap().len(), before);
    }

    #[test]
    fn squelch_validation_follows_hysteresis() {
        let (manager, _) = test_manager();
        let (session, _rx) = manager
            .create_audio_session(audio_request(Uuid::new_v4(), "192.0.2.1"))
            .unwrap();
        assert!(manager.set_squelch(&session, 5.0, Some(5.0)).is_err());
        let s = manager.set_squelch(&session, 5.0, Some(3.0)).unwrap();
        assert_eq!(s.open_db, 5.0);
        let s = manager.set_squelch(&session, -999.0, Some(100.0)).unwrap();
        assert!(s.is_always_open());
    }

    #[test]
    fn destroy_fires_done_once_and_sends_disable() {
        let (manager, sent) = test_manager();
        let (session, _rx) = manager
            .create_audio_session(audio_request(Uuid::new_v4(), "192.0.2.1"))
            .unwrap();
        let mut done = session.subscribe_done();
        assert!(!*done.borrow());

        assert!(manager.destroy_session(session.id));
        assert!(*done.borrow_and_update());
        assert!(!manager.destroy_session(session.id), "second destroy is a no-op");

        let sent = sent.lock().unwrap();
        let (_, map) = decode_packet(sent.last().unwrap()).unwrap();
        assert_eq!(map.get_f64(tags::RADIO_FREQUENCY), Some(0.0));
        assert_eq!(manager.session_count(), 0);
        assert!(manager.get_by_ssrc(session.ssrc).is_none());
    }

    #[test]
    fn spectrum_and_audio_share_the_ssrc_namespace() {
        let (manager, _) = test_manager();
        let (audio, _arx) = manager
            .create_audio_session(audio_request(Uuid::new_v4(), "192.0.2.1"))
            .unwrap();
        let (spectrum, _srx) = manager
            .create_spectrum_session(SpectrumSessionRequest {
                user_session_id: Uuid::new_v4(),
                client_ip: "192.0.2.1".parse().unwrap(),
                center_frequency: 10_000_000,
                bin_count: 1024,
                bin_bandwidth_hz: 100.0,
                version: 2,
            })
            .unwrap();
        assert_ne!(audio.ssrc, spectrum.ssrc);
        assert_eq!(manager.session_count(), 2);
    }

    #[test]
    fn per_ip_session_limit_is_enforced() {
        let (manager, _) = test_manager();
        let mut rxs = Vec::new();
        for _ in 0..LimitsConfig::default().sessions_per_ip {
            let (_s, rx) = manager
                .create_audio_session(audio_request(Uuid::new_v4(), "192.0.2.9"))
                .unwrap();
            rxs.push(rx);
        }
        let err = manager
            .create_audio_session(audio_request(Uuid::new_v4(), "192.0.2.9"))
            .unwrap_err();
        assert!(matches!(err, CoreError::RateLimited(_)));
    }

    #[test]
    fn iq_mode_forces_lossless_format() {
        let (manager, _) = test_manager();
        let mut req = audio_request(Uuid::new_v4(), "192.0.2.1");
        req.mode = Mode::Iq;
        req.bandwidth_low = None;
        req.bandwidth_high = None;
        req.format = StreamFormat::Opus;
        let (session, _rx) = manager.create_audio_session(req).unwrap();
        assert_eq!(session.effective_format(), StreamFormat::PcmZstd);
    }
}
