// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Access policy consulted at connect and tune time.
//!
//! The session core never decides bans or bypass itself; it asks this
//! trait so deployments can plug in external sources (the default
//! implementation reads the static config lists).

use std::net::IpAddr;

use sdrx_core::modes::Mode;

use crate::config::PolicyConfig;

pub trait Policy: Send + Sync {
    /// Reject the connection outright.
    fn is_banned(&self, ip: IpAddr) -> bool;

    /// Bypass lifts the 8 kHz edge clamp and grants wide-IQ modes.
    fn grants_bypass(&self, ip: IpAddr, password: Option<&str>) -> bool;

    /// Wide-IQ modes open to everyone.
    fn is_public_iq_mode(&self, mode: Mode) -> bool;

    /// Instance reporters are always granted iq48, bypass or not.
    fn allows_instance_reporting(&self, ip: IpAddr) -> bool;
}

/// Policy backed by the static `[server]` config section.
pub struct ConfigPolicy {
    cfg: PolicyConfig,
}

impl ConfigPolicy {
    pub fn new(cfg: PolicyConfig) -> Self {
        Self { cfg }
    }
}

impl Policy for ConfigPolicy {
    fn is_banned(&self, ip: IpAddr) -> bool {
        self.cfg.banned_ips.contains(&ip)
    }

    fn grants_bypass(&self, ip: IpAddr, password: Option<&str>) -> bool {
        if self.cfg.bypassed_ips.contains(&ip) {
            return true;
        }
        match password {
            Some(p) => !self.cfg.bypass_password.is_empty() && p == self.cfg.bypass_password,
            None => false,
        }
    }

    fn is_public_iq_mode(&self, mode: Mode) -> bool {
        self.cfg.public_iq_modes.contains(&mode)
    }

    fn allows_instance_reporting(&self, ip: IpAddr) -> bool {
        self.cfg.instance_reporter_ips.contains(&ip)
    }
}

/// Whether `mode` is permitted for a session with the given grants.
///
/// Wide-IQ modes require bypass unless public; iq48 is additionally
/// granted to instance reporters.
pub fn mode_permitted(policy: &dyn Policy, mode: Mode, ip: IpAddr, bypass: bool) -> bool {
    if !mode.is_wide_iq() {
        return true;
    }
    if bypass || policy.is_public_iq_mode(mode) {
        return true;
    }
    mode == Mode::Iq48 && policy.allows_instance_reporting(ip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn policy_with(f: impl FnOnce(&mut PolicyConfig)) -> ConfigPolicy {
        let mut cfg = PolicyConfig::default();
        f(&mut cfg);
        ConfigPolicy::new(cfg)
    }

    #[test]
    fn banned_ip_is_rejected() {
        let p = policy_with(|c| {
            c.banned_ips.insert(ip("203.0.113.9"));
        });
        assert!(p.is_banned(ip("203.0.113.9")));
        assert!(!p.is_banned(ip("203.0.113.10")));
    }

    #[test]
    fn password_bypass_requires_configured_password() {
        let p = policy_with(|c| c.bypass_password = "hunter2".to_string());
        assert!(p.grants_bypass(ip("198.51.100.1"), Some("hunter2")));
        assert!(!p.grants_bypass(ip("198.51.100.1"), Some("wrong")));
        assert!(!p.grants_bypass(ip("198.51.100.1"), None));
    }

    #[test]
    fn empty_password_config_never_grants() {
        let p = policy_with(|_| {});
        assert!(!p.grants_bypass(ip("198.51.100.1"), Some("")));
    }

    #[test]
    fn wide_iq_needs_bypass_unless_public() {
        let p = policy_with(|c| {
            c.public_iq_modes = HashSet::from([Mode::Iq96]);
        });
        let addr = ip("198.51.100.7");
        assert!(mode_permitted(&p, Mode::Usb, addr, false));
        assert!(mode_permitted(&p, Mode::Iq96, addr, false));
        assert!(!mode_permitted(&p, Mode::Iq192, addr, false));
        assert!(mode_permitted(&p, Mode::Iq192, addr, true));
    }

    #[test]
    fn instance_reporters_always_get_iq48() {
        let p = policy_with(|c| {
            c.instance_reporter_ips.insert(ip("192.0.2.50"));
        });
        assert!(mode_permitted(&p, Mode::Iq48, ip("192.0.2.50"), false));
        assert!(!mode_permitted(&p, Mode::Iq96, ip("192.0.2.50"), false));
        assert!(!mode_permitted(&p, Mode::Iq48, ip("192.0.2.51"), false));
    }
}
