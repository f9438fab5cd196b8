use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::transit::Direction;

/// A monitored bus stop with its provider code and the walking time from
/// the viewer's location. Stop lists are ordered nearest-first.
#[derive(Debug, Deserialize, Clone)]
pub struct Stop {
    pub id: String,
    pub name: String,
    pub walk_minutes: i32,
    /// Routes that do not actually call at this stop, even though the
    /// provider sometimes lists them here.
    #[serde(default)]
    pub skip_routes: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DirectionConfig {
    pub label: String,
    pub keywords: Vec<String>,
    pub stops: Vec<Stop>,
}

impl DirectionConfig {
    fn init(&mut self) {
        for keyword in &mut self.keywords {
            *keyword = keyword.to_lowercase();
        }
    }

    /// Case-insensitive substring match against the direction's
    /// destination keywords.
    pub fn matches_destination(&self, destination: &str) -> bool {
        let lower = destination.to_lowercase();
        self.keywords.iter().any(|k| lower.contains(k.as_str()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Siri,
    TransportApi,
}

/// Knobs for the per-stop fetch loop and the aggregation pass. The early
/// stop thresholds and dedup tolerance are tuning values, not contracts.
#[derive(Debug, Deserialize, Clone)]
pub struct FetchConfig {
    #[serde(default = "default_display_capacity")]
    pub display_capacity: usize,
    #[serde(default = "default_raw_capacity")]
    pub raw_capacity: usize,
    #[serde(default = "default_per_stop_cap")]
    pub per_stop_cap: usize,
    #[serde(default = "default_dedup_tolerance")]
    pub dedup_tolerance_minutes: i32,
    /// Stop visiting further stops once this many unique catchable entries
    /// have accumulated...
    #[serde(default = "default_early_stop_unique_min")]
    pub early_stop_unique_min: usize,
    /// ...and the total accumulated count has reached this floor.
    #[serde(default = "default_early_stop_total_min")]
    pub early_stop_total_min: usize,
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_inter_stop_delay_ms")]
    pub inter_stop_delay_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            display_capacity: default_display_capacity(),
            raw_capacity: default_raw_capacity(),
            per_stop_cap: default_per_stop_cap(),
            dedup_tolerance_minutes: default_dedup_tolerance(),
            early_stop_unique_min: default_early_stop_unique_min(),
            early_stop_total_min: default_early_stop_total_min(),
            retry_limit: default_retry_limit(),
            retry_backoff_ms: default_retry_backoff_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            inter_stop_delay_ms: default_inter_stop_delay_ms(),
        }
    }
}

impl FetchConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_display_capacity() -> usize {
    3
}
fn default_raw_capacity() -> usize {
    30
}
fn default_per_stop_cap() -> usize {
    3
}
fn default_dedup_tolerance() -> i32 {
    1
}
fn default_early_stop_unique_min() -> usize {
    3
}
fn default_early_stop_total_min() -> usize {
    3
}
fn default_retry_limit() -> u32 {
    2
}
fn default_retry_backoff_ms() -> u64 {
    500
}
fn default_request_timeout_secs() -> u64 {
    15
}
fn default_inter_stop_delay_ms() -> u64 {
    100
}

/// Daily call budget and the active-hours window the budget is spread
/// across.
#[derive(Debug, Deserialize, Clone)]
pub struct BudgetConfig {
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u32,
    #[serde(default = "default_active_hours_start")]
    pub active_hours_start: u32,
    #[serde(default = "default_active_hours_end")]
    pub active_hours_end: u32,
    #[serde(default = "default_base_interval_secs")]
    pub base_interval_secs: u64,
    #[serde(default = "default_min_interval_secs")]
    pub min_interval_secs: u64,
    #[serde(default = "default_max_interval_secs")]
    pub max_interval_secs: u64,
    /// Tighter interval ceiling applied while calls are plentiful.
    #[serde(default = "default_comfort_cap_secs")]
    pub comfort_cap_secs: u64,
    #[serde(default = "default_comfort_threshold_calls")]
    pub comfort_threshold_calls: u32,
    /// Empirical average API calls one refresh consumes per direction,
    /// reflecting how often the early stop fires there.
    #[serde(default = "default_outbound_avg_calls")]
    pub outbound_avg_calls_per_refresh: f32,
    #[serde(default = "default_inbound_avg_calls")]
    pub inbound_avg_calls_per_refresh: f32,
    #[serde(default = "default_min_refetch_interval_secs")]
    pub min_refetch_interval_secs: u64,
    #[serde(default = "default_state_path")]
    pub state_path: String,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_limit: default_daily_limit(),
            active_hours_start: default_active_hours_start(),
            active_hours_end: default_active_hours_end(),
            base_interval_secs: default_base_interval_secs(),
            min_interval_secs: default_min_interval_secs(),
            max_interval_secs: default_max_interval_secs(),
            comfort_cap_secs: default_comfort_cap_secs(),
            comfort_threshold_calls: default_comfort_threshold_calls(),
            outbound_avg_calls_per_refresh: default_outbound_avg_calls(),
            inbound_avg_calls_per_refresh: default_inbound_avg_calls(),
            min_refetch_interval_secs: default_min_refetch_interval_secs(),
            state_path: default_state_path(),
        }
    }
}

impl BudgetConfig {
    pub fn base_interval(&self) -> Duration {
        Duration::from_secs(self.base_interval_secs)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_secs(self.max_interval_secs)
    }

    pub fn min_refetch_interval(&self) -> Duration {
        Duration::from_secs(self.min_refetch_interval_secs)
    }

    pub fn avg_calls_per_refresh(&self, direction: Direction) -> f32 {
        match direction {
            Direction::Outbound => self.outbound_avg_calls_per_refresh,
            Direction::Inbound => self.inbound_avg_calls_per_refresh,
        }
    }
}

fn default_daily_limit() -> u32 {
    300
}
fn default_active_hours_start() -> u32 {
    6
}
fn default_active_hours_end() -> u32 {
    22
}
fn default_base_interval_secs() -> u64 {
    600
}
fn default_min_interval_secs() -> u64 {
    300
}
fn default_max_interval_secs() -> u64 {
    3600
}
fn default_comfort_cap_secs() -> u64 {
    1800
}
fn default_comfort_threshold_calls() -> u32 {
    50
}
fn default_outbound_avg_calls() -> f32 {
    1.5
}
fn default_inbound_avg_calls() -> f32 {
    1.0
}
fn default_min_refetch_interval_secs() -> u64 {
    300
}
fn default_state_path() -> String {
    "budget_state.json".to_string()
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub provider: ProviderKind,
    pub routes: Vec<String>,
    #[serde(default = "default_direction")]
    pub direction: Direction,
    pub outbound: DirectionConfig,
    pub inbound: DirectionConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
}

fn default_direction() -> Direction {
    Direction::Outbound
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from("config.toml")
    }

    pub fn load_from(path: &str) -> anyhow::Result<Self> {
        let config_str =
            fs::read_to_string(path).with_context(|| format!("failed to read {}", path))?;
        let mut config: Config =
            toml::from_str(&config_str).with_context(|| format!("failed to parse {}", path))?;

        config.outbound.init();
        config.inbound.init();
        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.fetch.raw_capacity >= 3 * self.fetch.display_capacity,
            "raw_capacity must be at least 3x display_capacity to survive dedup and filtering"
        );
        anyhow::ensure!(
            self.budget.active_hours_start < self.budget.active_hours_end
                && self.budget.active_hours_end <= 24,
            "active hours window is invalid"
        );
        anyhow::ensure!(
            !self.outbound.stops.is_empty() && !self.inbound.stops.is_empty(),
            "each direction needs at least one stop"
        );
        Ok(())
    }

    pub fn direction_config(&self, direction: Direction) -> &DirectionConfig {
        match direction {
            Direction::Outbound => &self.outbound,
            Direction::Inbound => &self.inbound,
        }
    }
}
