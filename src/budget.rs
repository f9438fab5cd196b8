//! Daily API budget accounting: a persisted calls-per-day counter, the
//! adaptive polling interval that spreads remaining calls across the
//! remaining active hours, and the rate limit on forced re-fetches.

use chrono::{Datelike, NaiveDateTime, Timelike};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::BudgetConfig;
use crate::transit::Direction;

/// Persisted across restarts so a reboot cannot launder the day's calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetState {
    pub calls_today: u32,
    pub last_reset_day: u32,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("budget store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("budget state unreadable: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Durable key-value home for [`BudgetState`]; injected so hosts and tests
/// choose their own persistence.
pub trait BudgetStore: Send {
    fn load(&self) -> Result<Option<BudgetState>, StoreError>;
    fn save(&self, state: &BudgetState) -> Result<(), StoreError>;
}

/// JSON file next to the binary; good enough for a single-writer host.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl BudgetStore for JsonFileStore {
    fn load(&self) -> Result<Option<BudgetState>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&self.path)?;
        Ok(Some(serde_json::from_str(&text)?))
    }

    fn save(&self, state: &BudgetState) -> Result<(), StoreError> {
        fs::write(&self.path, serde_json::to_string(state)?)?;
        Ok(())
    }
}

pub struct BudgetController {
    settings: BudgetConfig,
    store: Box<dyn BudgetStore>,
    state: BudgetState,
    last_warned_hour: Option<u32>,
    last_refresh: Option<Instant>,
}

impl BudgetController {
    pub fn load(settings: BudgetConfig, store: Box<dyn BudgetStore>) -> Result<Self, StoreError> {
        let state = store.load()?.unwrap_or(BudgetState {
            calls_today: 0,
            last_reset_day: 0,
        });
        info!(
            "Loaded API counter: {} calls today, last reset day: {}",
            state.calls_today, state.last_reset_day
        );
        Ok(Self {
            settings,
            store,
            state,
            last_warned_hour: None,
            last_refresh: None,
        })
    }

    pub fn calls_today(&self) -> u32 {
        self.state.calls_today
    }

    /// Zero the counter when the local calendar day has changed. A missing
    /// clock skips the check rather than guessing.
    pub fn reset_if_new_day(&mut self, now: Option<NaiveDateTime>) -> Result<(), StoreError> {
        let Some(now) = now else {
            return Ok(());
        };
        let today = now.day();
        if today != self.state.last_reset_day {
            info!(
                "New day detected (day {}). Resetting API counter from {}.",
                today, self.state.calls_today
            );
            self.state = BudgetState {
                calls_today: 0,
                last_reset_day: today,
            };
            self.store.save(&self.state)?;
        }
        Ok(())
    }

    /// Add a pass's consumed calls and persist immediately so a crash
    /// mid-cycle cannot lose the accounting.
    pub fn record_calls(&mut self, calls: u32) -> Result<(), StoreError> {
        self.state.calls_today += calls;
        self.store.save(&self.state)?;
        info!(
            "API calls today: {}/{}",
            self.state.calls_today, self.settings.daily_limit
        );
        Ok(())
    }

    pub fn is_active_hours(&self, now: Option<NaiveDateTime>) -> bool {
        // Default to active when time is unknown
        match now {
            Some(now) => {
                let hour = now.hour();
                hour >= self.settings.active_hours_start && hour < self.settings.active_hours_end
            }
            None => true,
        }
    }

    /// Interval until the next scheduled refresh, spreading the remaining
    /// daily calls evenly over the remaining active hours.
    pub fn next_interval(&mut self, now: Option<NaiveDateTime>, direction: Direction) -> Duration {
        let Some(now) = now else {
            return self.settings.base_interval();
        };

        let hour = now.hour();
        let remaining_hours = if hour < self.settings.active_hours_start {
            self.settings.active_hours_end - self.settings.active_hours_start
        } else if hour >= self.settings.active_hours_end {
            0
        } else {
            self.settings.active_hours_end - hour
        };

        if remaining_hours == 0 {
            return self.settings.base_interval();
        }

        let remaining_calls = self.settings.daily_limit.saturating_sub(self.state.calls_today);
        if remaining_calls == 0 {
            self.warn_once_per_hour(hour, "API limit reached for today, using 1-hour interval");
            return self.settings.max_interval();
        }

        let avg = self.settings.avg_calls_per_refresh(direction);
        let max_refreshes = (remaining_calls as f32 / avg).floor() as u64;
        if max_refreshes == 0 {
            self.warn_once_per_hour(hour, "Not enough API calls left for even one refresh");
            return self.settings.max_interval();
        }

        let remaining_secs = u64::from(remaining_hours) * 3600;
        let mut interval_secs = remaining_secs / max_refreshes;

        if interval_secs < self.settings.min_interval_secs {
            interval_secs = self.settings.min_interval_secs;
        } else if interval_secs > self.settings.max_interval_secs {
            interval_secs = self.settings.max_interval_secs;
        } else if interval_secs > self.settings.comfort_cap_secs
            && remaining_calls > self.settings.comfort_threshold_calls
        {
            // Plenty of calls left: poll more often than the even spread.
            interval_secs = self.settings.comfort_cap_secs;
        }

        debug!(
            "Budget: {} used, {} remaining, {} h left, {:.1} avg calls/refresh -> {} s interval",
            self.state.calls_today, remaining_calls, remaining_hours, avg, interval_secs
        );

        Duration::from_secs(interval_secs)
    }

    /// Record that a refresh of any kind just happened; forced re-fetches
    /// are rate limited against this moment.
    pub fn note_refresh(&mut self, at: Instant) {
        self.last_refresh = Some(at);
    }

    /// Whether the caller may run a forced full sweep right now. An empty
    /// display set refetches immediately; a set merely under quota waits
    /// out the rate-limit window.
    pub fn forced_refetch_allowed(
        &self,
        remaining_entries: usize,
        display_quota: usize,
        now: Instant,
    ) -> bool {
        if remaining_entries >= display_quota {
            return false;
        }
        if remaining_entries == 0 {
            return true;
        }
        match self.last_refresh {
            Some(last) => now.duration_since(last) >= self.settings.min_refetch_interval(),
            None => true,
        }
    }

    fn warn_once_per_hour(&mut self, hour: u32, message: &str) {
        if self.last_warned_hour != Some(hour) {
            warn!("{}", message);
            self.last_warned_hour = Some(hour);
        }
    }
}
