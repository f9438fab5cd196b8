use async_trait::async_trait;
use chrono::NaiveDateTime;
use log::debug;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use super::{times, Departure, DepartureApi, DepartureSet, ParseError, TransportError};
use crate::config::{DirectionConfig, Stop};

const BASE_URL: &str = "https://transportapi.com";

/// TransportAPI live departures client. Responses arrive as JSON with
/// departures grouped by route under a `departures` object.
pub struct TransportApiClient {
    app_id: String,
    app_key: String,
    routes: Vec<String>,
    timeout: Duration,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct LiveResponse {
    departures: Option<HashMap<String, Vec<RouteDeparture>>>,
}

#[derive(Debug, Deserialize)]
struct RouteDeparture {
    line: Option<String>,
    direction: Option<String>,
    aimed_departure_time: Option<String>,
    expected_departure_time: Option<String>,
    best_departure_estimate: Option<String>,
}

impl TransportApiClient {
    pub fn new(app_id: String, app_key: String, routes: Vec<String>, timeout: Duration) -> Self {
        Self {
            app_id,
            app_key,
            routes,
            timeout,
            client: reqwest::Client::new(),
        }
    }

    fn build_url(&self, stop: &Stop) -> String {
        format!(
            "{}/v3/uk/bus/stop/{}/live.json?app_id={}&app_key={}&group=route&nextbuses=yes&limit=8",
            BASE_URL, stop.id, self.app_id, self.app_key
        )
    }
}

#[async_trait]
impl DepartureApi for TransportApiClient {
    fn name(&self) -> &'static str {
        "TransportAPI"
    }

    async fn fetch_raw(&self, stop: &Stop) -> Result<String, TransportError> {
        let response = self
            .client
            .get(self.build_url(stop))
            .header("accept", "application/json")
            .timeout(self.timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(TransportError::Status(response.status().as_u16()));
        }

        Ok(response.text().await?)
    }

    fn parse(
        &self,
        body: &str,
        stop: &Stop,
        direction: &DirectionConfig,
        now: Option<NaiveDateTime>,
        sink: &mut DepartureSet,
        per_stop_cap: usize,
    ) -> Result<usize, ParseError> {
        let now = now.ok_or(ParseError::ClockUnsynced)?;

        // Remove BOM if present before handing to serde
        let cleaned = body.strip_prefix('\u{FEFF}').unwrap_or(body).trim();

        let response: LiveResponse =
            serde_json::from_str(cleaned).map_err(|e| ParseError::Malformed(e.to_string()))?;
        let grouped = response
            .departures
            .ok_or_else(|| ParseError::Malformed("no departures object".to_string()))?;

        let mut added = 0;
        // Walk the whitelist in its configured order so preferred routes
        // claim the per-stop cap first.
        'routes: for route in &self.routes {
            let Some(route_departures) = grouped.get(route) else {
                continue;
            };
            if stop.skip_routes.contains(route) {
                continue;
            }

            for entry in route_departures {
                if added >= per_stop_cap || sink.is_full() {
                    debug!(
                        "Reached collection limit for {} ({} this stop, {} total)",
                        stop.name,
                        added,
                        sink.len()
                    );
                    break 'routes;
                }

                let destination = entry.direction.as_deref().unwrap_or_default().trim();
                if !direction.matches_destination(destination) {
                    continue;
                }

                let aimed = entry.aimed_departure_time.as_deref().unwrap_or("").trim();
                let expected = entry
                    .expected_departure_time
                    .as_deref()
                    .unwrap_or("")
                    .trim();
                let estimate = entry
                    .best_departure_estimate
                    .as_deref()
                    .unwrap_or("")
                    .trim();

                let is_live = !expected.is_empty();
                let time_to_use = if is_live {
                    expected
                } else if !aimed.is_empty() {
                    aimed
                } else {
                    estimate
                };
                let Some(parsed) = times::minutes_until(time_to_use, now) else {
                    continue;
                };
                if parsed.minutes_until < 0 {
                    debug!("Skipped bus {}: already departed", route);
                    continue;
                }

                let aimed_minutes = if is_live {
                    times::minutes_until(aimed, now).map(|p| p.minutes_until)
                } else {
                    None
                };
                let status_text = times::status_text(parsed.minutes_until, aimed_minutes, is_live);

                let line = entry.line.as_deref().unwrap_or(route).trim().to_string();
                if sink.push(Departure {
                    route: line,
                    stop_name: stop.name.clone(),
                    destination: destination.to_string(),
                    display_time: parsed.display,
                    minutes_until: parsed.minutes_until,
                    walk_minutes: stop.walk_minutes,
                    is_live,
                    status_text,
                }) {
                    added += 1;
                }
            }
        }

        Ok(added)
    }
}
