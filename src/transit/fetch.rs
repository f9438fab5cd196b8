//! Per-stop fetch loop: bounded retries, nearest-first ordering, and the
//! early-stop heuristic that trades completeness for API calls.

use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;

use super::times::Clock;
use super::{aggregate, DepartureApi, DepartureSet, FetchOutcome, TransportError};
use crate::config::{DirectionConfig, FetchConfig, Stop};

pub struct FetchOrchestrator {
    api: Box<dyn DepartureApi>,
    clock: Arc<dyn Clock>,
    tuning: FetchConfig,
}

impl FetchOrchestrator {
    pub fn new(api: Box<dyn DepartureApi>, clock: Arc<dyn Clock>, tuning: FetchConfig) -> Self {
        Self { api, clock, tuning }
    }

    /// Visit the direction's stops nearest-first, accumulating raw
    /// departure records. A failed stop never aborts the pass; its error is
    /// kept for reporting and the loop moves on.
    ///
    /// With `force_fetch_all` every stop is visited; otherwise the pass
    /// ends early once enough unique catchable entries have accumulated.
    pub async fn fetch_departures(
        &self,
        dir_config: &DirectionConfig,
        force_fetch_all: bool,
    ) -> FetchOutcome {
        let stops = &dir_config.stops;
        if force_fetch_all {
            info!(
                "Fetching departures for ALL {} stops towards {}",
                stops.len(),
                dir_config.label
            );
        } else {
            info!(
                "Fetching departures for up to {} stops towards {} (may stop early)",
                stops.len(),
                dir_config.label
            );
        }

        let mut sink = DepartureSet::with_capacity(self.tuning.raw_capacity);
        let mut calls: u32 = 0;
        let mut last_error: Option<String> = None;
        let mut any_success = false;
        let mut fetched_all_stops = false;

        for (i, stop) in stops.iter().enumerate() {
            debug!("Fetching: {} (stop {}/{})", stop.name, i + 1, stops.len());

            match self.fetch_with_retry(stop, &mut calls).await {
                Ok(body) => {
                    let now = self.clock.now();
                    match self.api.parse(
                        &body,
                        stop,
                        dir_config,
                        now,
                        &mut sink,
                        self.tuning.per_stop_cap,
                    ) {
                        Ok(added) => {
                            any_success = true;
                            debug!(
                                "Collected {} buses from {} (total: {})",
                                added,
                                stop.name,
                                sink.len()
                            );
                            if sink.is_empty() && i == 0 {
                                debug!(
                                    "First stop returned no departures; quiet period or filters too strict"
                                );
                            }
                        }
                        Err(err) => {
                            warn!("Failed to parse departures for {}: {}", stop.name, err);
                            last_error = Some(err.to_string());
                        }
                    }
                }
                Err(err) => {
                    warn!("Giving up on {}: {}", stop.name, err);
                    last_error = Some(err.to_string());
                }
            }

            if i + 1 == stops.len() {
                fetched_all_stops = true;
                break;
            }

            if !force_fetch_all && self.enough_data(&sink) {
                debug!(
                    "Early stop after {}/{} stops: {} records, {} unique catchable",
                    i + 1,
                    stops.len(),
                    sink.len(),
                    aggregate::unique_catchable(sink.entries(), self.tuning.dedup_tolerance_minutes)
                );
                break;
            }

            // Small delay between requests to be nice to the API
            tokio::time::sleep(Duration::from_millis(self.tuning.inter_stop_delay_ms)).await;
        }

        debug!(
            "Pass complete: {} raw records, {} API calls, fetched {} stops",
            sink.len(),
            calls,
            if fetched_all_stops { "all" } else { "some" }
        );

        FetchOutcome {
            departures: sink.into_vec(),
            api_calls_used: calls,
            fetched_all_stops,
            success: any_success,
            error_reason: last_error,
        }
    }

    /// One stop's request with bounded retries and linearly growing
    /// backoff. Every attempt counts against the pass's call budget,
    /// successful or not.
    async fn fetch_with_retry(
        &self,
        stop: &Stop,
        calls: &mut u32,
    ) -> Result<String, TransportError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            *calls += 1;
            match self.api.fetch_raw(stop).await {
                Ok(body) => return Ok(body),
                Err(err) if attempt <= self.tuning.retry_limit => {
                    debug!(
                        "Request for {} failed ({}), retrying ({}/{})",
                        stop.name, err, attempt, self.tuning.retry_limit
                    );
                    tokio::time::sleep(Duration::from_millis(
                        self.tuning.retry_backoff_ms * u64::from(attempt),
                    ))
                    .await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn enough_data(&self, sink: &DepartureSet) -> bool {
        sink.len() >= self.tuning.early_stop_total_min
            && aggregate::unique_catchable(sink.entries(), self.tuning.dedup_tolerance_minutes)
                >= self.tuning.early_stop_unique_min
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transit::{Departure, ParseError};
    use async_trait::async_trait;
    use chrono::{NaiveDate, NaiveDateTime};
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FixedClock(Option<NaiveDateTime>);

    impl Clock for FixedClock {
        fn now(&self) -> Option<NaiveDateTime> {
            self.0
        }
    }

    fn ten_am() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 7, 15)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
    }

    fn departure(route: &str, stop: &str, minutes_until: i32) -> Departure {
        Departure {
            route: route.to_string(),
            stop_name: stop.to_string(),
            destination: "Town".to_string(),
            display_time: "10:30".to_string(),
            minutes_until,
            walk_minutes: 5,
            is_live: true,
            status_text: "Live".to_string(),
        }
    }

    /// Scripted provider: per-stop queues of fetch results, and a fixed
    /// record set handed out when the fetched body parses.
    struct ScriptedApi {
        fetches: Mutex<HashMap<String, Vec<Result<String, TransportError>>>>,
        records: HashMap<String, Vec<Departure>>,
    }

    impl ScriptedApi {
        fn new() -> Self {
            Self {
                fetches: Mutex::new(HashMap::new()),
                records: HashMap::new(),
            }
        }

        fn on_fetch(mut self, stop_id: &str, results: Vec<Result<String, TransportError>>) -> Self {
            self.fetches
                .lock()
                .unwrap()
                .insert(stop_id.to_string(), results);
            self
        }

        fn with_records(mut self, stop_id: &str, records: Vec<Departure>) -> Self {
            self.records.insert(stop_id.to_string(), records);
            self
        }
    }

    #[async_trait]
    impl DepartureApi for ScriptedApi {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn fetch_raw(&self, stop: &Stop) -> Result<String, TransportError> {
            let mut fetches = self.fetches.lock().unwrap();
            match fetches.get_mut(&stop.id) {
                Some(queue) if !queue.is_empty() => queue.remove(0),
                _ => Ok(stop.id.clone()),
            }
        }

        fn parse(
            &self,
            body: &str,
            _stop: &Stop,
            _direction: &DirectionConfig,
            now: Option<NaiveDateTime>,
            sink: &mut DepartureSet,
            per_stop_cap: usize,
        ) -> Result<usize, ParseError> {
            if now.is_none() {
                return Err(ParseError::ClockUnsynced);
            }
            let mut added = 0;
            if let Some(records) = self.records.get(body) {
                for record in records {
                    if added >= per_stop_cap || !sink.push(record.clone()) {
                        break;
                    }
                    added += 1;
                }
            }
            Ok(added)
        }
    }

    fn stop(id: &str, name: &str) -> Stop {
        Stop {
            id: id.to_string(),
            name: name.to_string(),
            walk_minutes: 5,
            skip_routes: vec![],
        }
    }

    fn two_stop_direction() -> DirectionConfig {
        DirectionConfig {
            label: "Town".to_string(),
            keywords: vec!["town".to_string()],
            stops: vec![stop("A", "Stop A"), stop("B", "Stop B")],
        }
    }

    fn tuning() -> FetchConfig {
        FetchConfig {
            retry_backoff_ms: 1,
            inter_stop_delay_ms: 0,
            ..FetchConfig::default()
        }
    }

    fn orchestrator(api: ScriptedApi, clock: Option<NaiveDateTime>) -> FetchOrchestrator {
        FetchOrchestrator::new(Box::new(api), Arc::new(FixedClock(clock)), tuning())
    }

    #[tokio::test]
    async fn early_stop_skips_remaining_stops_when_confident() {
        let api = ScriptedApi::new().with_records(
            "A",
            vec![
                departure("94", "Stop A", 10),
                departure("95", "Stop A", 20),
                departure("97", "Stop A", 30),
            ],
        );
        let orch = orchestrator(api, Some(ten_am()));
        let outcome = orch
            .fetch_departures(&two_stop_direction(), false)
            .await;

        assert_eq!(outcome.api_calls_used, 1);
        assert!(!outcome.fetched_all_stops);
        assert!(outcome.success);
        assert_eq!(outcome.departures.len(), 3);
    }

    #[tokio::test]
    async fn forced_pass_visits_every_stop() {
        let api = ScriptedApi::new()
            .with_records(
                "A",
                vec![
                    departure("94", "Stop A", 10),
                    departure("95", "Stop A", 20),
                    departure("97", "Stop A", 30),
                ],
            )
            .with_records("B", vec![departure("98", "Stop B", 40)]);
        let orch = orchestrator(api, Some(ten_am()));
        let outcome = orch
            .fetch_departures(&two_stop_direction(), true)
            .await;

        assert_eq!(outcome.api_calls_used, 2);
        assert!(outcome.fetched_all_stops);
        assert_eq!(outcome.departures.len(), 4);
    }

    #[tokio::test]
    async fn uncertain_data_keeps_the_pass_going() {
        // One catchable record from stop A is under the confidence
        // threshold, so stop B is visited too.
        let api = ScriptedApi::new()
            .with_records("A", vec![departure("94", "Stop A", 10)])
            .with_records("B", vec![departure("97", "Stop B", 15)]);
        let orch = orchestrator(api, Some(ten_am()));
        let outcome = orch
            .fetch_departures(&two_stop_direction(), false)
            .await;

        assert_eq!(outcome.api_calls_used, 2);
        assert!(outcome.fetched_all_stops);
        assert_eq!(outcome.departures.len(), 2);
    }

    #[tokio::test]
    async fn a_failing_stop_does_not_abort_the_pass() {
        let api = ScriptedApi::new()
            .on_fetch(
                "A",
                vec![
                    Err(TransportError::Status(500)),
                    Err(TransportError::Status(500)),
                    Err(TransportError::Status(500)),
                ],
            )
            .with_records("B", vec![departure("97", "Stop B", 15)]);
        let orch = orchestrator(api, Some(ten_am()));
        let outcome = orch
            .fetch_departures(&two_stop_direction(), false)
            .await;

        // Three attempts against A, one against B.
        assert_eq!(outcome.api_calls_used, 4);
        assert!(outcome.success);
        assert!(outcome.fetched_all_stops);
        assert_eq!(outcome.departures.len(), 1);
        assert_eq!(outcome.departures[0].stop_name, "Stop B");
        assert_eq!(outcome.error_reason.as_deref(), Some("HTTP 500"));
    }

    #[tokio::test]
    async fn transient_failures_are_retried_and_counted() {
        let api = ScriptedApi::new()
            .on_fetch(
                "A",
                vec![Err(TransportError::Status(503)), Ok("A".to_string())],
            )
            .with_records(
                "A",
                vec![
                    departure("94", "Stop A", 10),
                    departure("95", "Stop A", 20),
                    departure("97", "Stop A", 30),
                ],
            );
        let orch = orchestrator(api, Some(ten_am()));
        let outcome = orch
            .fetch_departures(&two_stop_direction(), false)
            .await;

        assert_eq!(outcome.api_calls_used, 2);
        assert!(outcome.success);
        assert_eq!(outcome.departures.len(), 3);
    }

    #[tokio::test]
    async fn unsynced_clock_yields_no_records_and_a_reason() {
        let api = ScriptedApi::new().with_records("A", vec![departure("94", "Stop A", 10)]);
        let orch = orchestrator(api, None);
        let outcome = orch
            .fetch_departures(&two_stop_direction(), false)
            .await;

        assert!(!outcome.success);
        assert!(outcome.departures.is_empty());
        assert!(outcome
            .error_reason
            .as_deref()
            .unwrap()
            .contains("clock not synchronised"));
    }

    #[tokio::test]
    async fn all_stops_failing_reports_the_last_error() {
        let api = ScriptedApi::new()
            .on_fetch("A", (0..3).map(|_| Err(TransportError::Status(401))).collect())
            .on_fetch("B", (0..3).map(|_| Err(TransportError::Status(403))).collect());
        let orch = orchestrator(api, Some(ten_am()));
        let outcome = orch
            .fetch_departures(&two_stop_direction(), false)
            .await;

        assert!(!outcome.success);
        assert!(outcome.departures.is_empty());
        assert_eq!(outcome.api_calls_used, 6);
        assert_eq!(outcome.error_reason.as_deref(), Some("HTTP 403"));
    }
}
