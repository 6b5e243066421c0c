// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use tracing::{error, warn};

/// Initialize logging with optional level from config.
/// Falls back to INFO if level is None or invalid.
pub fn init_logging(log_level: Option<&str>) {
    let level = log_level
        .and_then(|s| s.parse::<Level>().ok())
        .unwrap_or(Level::INFO);

    FmtSubscriber::builder()
        .with_target(false)
        .with_max_level(level)
        .init();
}

const REPEAT_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Suppressing logger for recurring transport errors.
///
/// The first occurrence of an error class logs at `error!`; repeats of
/// the same class are counted and summarized at `warn!` once per
/// interval. UDP send failures and socket errors can fire thousands of
/// times per second when the backend is down.
pub struct RepeatErrorLogger {
    label: &'static str,
    state: Mutex<RepeatErrorState>,
}

#[derive(Default)]
struct RepeatErrorState {
    last_error: Option<String>,
    last_logged_at: Option<Instant>,
    suppressed: u64,
}

impl RepeatErrorLogger {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            state: Mutex::new(RepeatErrorState::default()),
        }
    }

    pub fn log(&self, err: &str) {
        let now = Instant::now();
        let mut state = self.state.lock().expect("repeat logger mutex poisoned");

        if state.last_error.as_deref() != Some(err) {
            if state.suppressed > 0 {
                warn!(
                    "{} repeated {} times: {}",
                    self.label,
                    state.suppressed,
                    state.last_error.as_deref().unwrap_or("<unknown>")
                );
            }
            error!("{}: {}", self.label, err);
            state.last_error = Some(err.to_string());
            state.last_logged_at = Some(now);
            state.suppressed = 0;
            return;
        }

        state.suppressed += 1;
        let due = state
            .last_logged_at
            .map(|ts| now.duration_since(ts) >= REPEAT_LOG_INTERVAL)
            .unwrap_or(true);
        if due {
            warn!(
                "{} recurring ({} repeats/{}s): {}",
                self.label,
                state.suppressed,
                REPEAT_LOG_INTERVAL.as_secs(),
                err
            );
            state.last_logged_at = Some(now);
            state.suppressed = 0;
        }
    }
}
