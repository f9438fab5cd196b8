use std::env;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use log::{debug, info, warn};

mod budget;
mod config;
mod display;
mod transit;

use budget::{BudgetController, JsonFileStore};
use config::{Config, ProviderKind};
use display::{ConsolePresenter, Presenter};
use transit::aggregate;
use transit::fetch::FetchOrchestrator;
use transit::siri::SiriClient;
use transit::times::{Clock, SystemClock};
use transit::transportapi::TransportApiClient;
use transit::{Departure, DepartureApi, Direction};

/// Granularity of the host loop; countdowns tick per elapsed minute.
const TICK_PERIOD: Duration = Duration::from_secs(60);

fn build_api(config: &Config) -> anyhow::Result<Box<dyn DepartureApi>> {
    let timeout = config.fetch.request_timeout();
    match config.provider {
        ProviderKind::Siri => {
            let endpoint = env::var("SIRI_ENDPOINT").context("SIRI_ENDPOINT must be set")?;
            let username = env::var("SIRI_USERNAME").context("SIRI_USERNAME must be set")?;
            let password = env::var("SIRI_PASSWORD").context("SIRI_PASSWORD must be set")?;
            Ok(Box::new(SiriClient::new(
                endpoint,
                username,
                password,
                config.routes.clone(),
                timeout,
            )))
        }
        ProviderKind::TransportApi => {
            let app_id = env::var("TRANSPORT_API_ID").context("TRANSPORT_API_ID must be set")?;
            let app_key =
                env::var("TRANSPORT_API_KEY").context("TRANSPORT_API_KEY must be set")?;
            Ok(Box::new(TransportApiClient::new(
                app_id,
                app_key,
                config.routes.clone(),
                timeout,
            )))
        }
    }
}

fn clock_string(now: Option<chrono::NaiveDateTime>) -> String {
    match now {
        Some(now) => now.format("%H:%M").to_string(),
        None => "--:--".to_string(),
    }
}

struct Board {
    config: Config,
    direction: Direction,
    orchestrator: FetchOrchestrator,
    budget: BudgetController,
    clock: Arc<dyn Clock>,
    presenter: Box<dyn Presenter>,
    /// The set currently on screen, full (not truncated) so spares can
    /// take over when a displayed bus becomes uncatchable.
    displayed: Vec<Departure>,
    sleep_mode: bool,
    last_fetch: Option<Instant>,
    last_countdown: Instant,
}

impl Board {
    async fn run(&mut self) -> anyhow::Result<()> {
        loop {
            self.tick().await;
            tokio::time::sleep(TICK_PERIOD).await;
        }
    }

    async fn tick(&mut self) {
        let now = self.clock.now();
        if let Err(err) = self.budget.reset_if_new_day(now) {
            warn!("Failed to persist API counter reset: {}", err);
        }

        if !self.budget.is_active_hours(now) {
            if !self.sleep_mode {
                info!("Outside active hours, showing clock");
                self.displayed.clear();
                self.sleep_mode = true;
            }
            self.presenter.show_clock(&clock_string(now));
            return;
        }
        if self.sleep_mode {
            // Coming back online: refresh right away.
            self.sleep_mode = false;
            self.last_fetch = None;
        }

        let due = match self.last_fetch {
            Some(at) => at.elapsed() >= self.budget.next_interval(now, self.direction),
            None => true,
        };
        if due {
            self.refresh(false).await;
            return;
        }

        // Between refreshes, advance the countdowns once per elapsed minute.
        let elapsed_minutes = (self.last_countdown.elapsed().as_secs() / 60) as u32;
        if elapsed_minutes == 0 {
            return;
        }
        self.last_countdown += Duration::from_secs(u64::from(elapsed_minutes) * 60);

        let removed = aggregate::age_departures(&mut self.displayed, elapsed_minutes);
        if removed > 0 {
            info!(
                "Removed {} bus(es) that can't be caught. Remaining: {}",
                removed,
                self.displayed.len()
            );
            let remaining = self.displayed.len();
            let quota = self.config.fetch.display_capacity;
            if remaining < quota {
                if self
                    .budget
                    .forced_refetch_allowed(remaining, quota, Instant::now())
                {
                    warn!(
                        "Display set under quota ({}/{}), forcing a full refetch",
                        remaining, quota
                    );
                    self.refresh(true).await;
                    return;
                }
                debug!("Under quota but refetch is rate-limited, waiting");
            }
        }
        self.render();
    }

    async fn refresh(&mut self, force_fetch_all: bool) {
        let dir_config = self.config.direction_config(self.direction).clone();
        info!(
            "Refreshing bus data towards {}{}",
            dir_config.label,
            if force_fetch_all {
                " (forced full sweep)"
            } else {
                ""
            }
        );

        let tolerance = self.config.fetch.dedup_tolerance_minutes;
        let mut outcome = self
            .orchestrator
            .fetch_departures(&dir_config, force_fetch_all)
            .await;
        let mut calls = outcome.api_calls_used;
        let mut aggregated = aggregate::aggregate(&outcome.departures, tolerance);

        // A pass that stopped early but came up short gets one forced sweep.
        if !force_fetch_all
            && !outcome.fetched_all_stops
            && aggregated.len() < self.config.fetch.display_capacity
        {
            info!(
                "Only {} catchable buses after early stop; refetching all stops",
                aggregated.len()
            );
            outcome = self.orchestrator.fetch_departures(&dir_config, true).await;
            calls += outcome.api_calls_used;
            aggregated = aggregate::aggregate(&outcome.departures, tolerance);
        }

        if let Err(err) = self.budget.record_calls(calls) {
            warn!("Failed to persist API counter: {}", err);
        }
        let now = Instant::now();
        self.budget.note_refresh(now);
        self.last_fetch = Some(now);
        self.last_countdown = now;

        if aggregated.is_empty() {
            let reason = if !outcome.success {
                outcome
                    .error_reason
                    .clone()
                    .unwrap_or_else(|| "API error".to_string())
            } else if outcome.departures.is_empty() {
                "no departures".to_string()
            } else {
                "no catchable buses".to_string()
            };
            warn!("No departures to display: {}", reason);
            self.displayed.clear();
            self.presenter.show_empty(&dir_config.label, &reason);
            return;
        }

        info!("Fetched {} catchable departures:", aggregated.len());
        for (i, dep) in aggregated.iter().enumerate() {
            info!(
                "  [{}] {}: {} at {} (departs in {} min, walk {} min, leave in {} min)",
                i + 1,
                dep.route,
                dep.stop_name,
                dep.display_time,
                dep.minutes_until,
                dep.walk_minutes,
                dep.leave_in()
            );
        }
        self.displayed = aggregated;
        self.render();
    }

    fn render(&mut self) {
        let cap = self.config.fetch.display_capacity.min(self.displayed.len());
        let label = &self.config.direction_config(self.direction).label;
        self.presenter
            .show_departures(&self.displayed[..cap], label, false);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    match dotenv::dotenv() {
        Ok(_) => info!("Loaded .env file"),
        Err(e) => debug!("No .env file loaded: {}", e),
    }

    let config = Config::load()?;
    let api = build_api(&config)?;
    info!("Using {} departures API", api.name());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let orchestrator = FetchOrchestrator::new(api, clock.clone(), config.fetch.clone());
    let store = JsonFileStore::new(config.budget.state_path.clone());
    let mut budget = BudgetController::load(config.budget.clone(), Box::new(store))?;
    budget.reset_if_new_day(clock.now())?;
    info!(
        "API budget: {}/{} calls used today",
        budget.calls_today(),
        config.budget.daily_limit
    );

    println!("Bus Board Starting...");
    println!("Press Ctrl+C to exit");

    let mut board = Board {
        direction: config.direction,
        orchestrator,
        budget,
        clock,
        presenter: Box::new(ConsolePresenter),
        config,
        displayed: Vec::new(),
        sleep_mode: false,
        last_fetch: None,
        last_countdown: Instant::now(),
    };
    board.run().await
}
