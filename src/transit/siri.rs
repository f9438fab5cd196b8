use async_trait::async_trait;
use chrono::NaiveDateTime;
use log::debug;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::{times, Departure, DepartureApi, DepartureSet, ParseError, TransportError};
use crate::config::{DirectionConfig, Stop};

/// Traveline/Nextbus SIRI-SM client. Departure boards are requested by
/// POSTing a StopMonitoringRequest envelope and come back as SIRI XML.
pub struct SiriClient {
    endpoint: String,
    username: String,
    password: String,
    routes: Vec<String>,
    timeout: Duration,
    client: reqwest::Client,
    message_id: AtomicU64,
}

#[derive(Debug, Deserialize)]
#[allow(non_snake_case)]
struct Siri {
    ServiceDelivery: Option<ServiceDelivery>,
}

#[derive(Debug, Deserialize)]
#[allow(non_snake_case)]
struct ServiceDelivery {
    StopMonitoringDelivery: Option<StopMonitoringDelivery>,
}

#[derive(Debug, Deserialize)]
#[allow(non_snake_case)]
struct StopMonitoringDelivery {
    #[serde(default)]
    MonitoredStopVisit: Vec<MonitoredStopVisit>,
}

#[derive(Debug, Deserialize)]
#[allow(non_snake_case)]
struct MonitoredStopVisit {
    MonitoredVehicleJourney: Option<MonitoredVehicleJourney>,
}

#[derive(Debug, Deserialize)]
#[allow(non_snake_case)]
struct MonitoredVehicleJourney {
    PublishedLineName: Option<String>,
    DirectionName: Option<String>,
    MonitoredCall: Option<MonitoredCall>,
}

#[derive(Debug, Deserialize)]
#[allow(non_snake_case)]
struct MonitoredCall {
    AimedDepartureTime: Option<String>,
    ExpectedDepartureTime: Option<String>,
}

impl SiriClient {
    pub fn new(
        endpoint: String,
        username: String,
        password: String,
        routes: Vec<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            endpoint,
            username,
            password,
            routes,
            timeout,
            client: reqwest::Client::new(),
            message_id: AtomicU64::new(1),
        }
    }

    fn build_request(&self, stop: &Stop) -> String {
        let timestamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
        let message_id = self.message_id.fetch_add(1, Ordering::Relaxed);

        format!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Siri version="1.0" xmlns="http://www.siri.org.uk/">
    <ServiceRequest>
        <RequestTimestamp>{timestamp}</RequestTimestamp>
        <RequestorRef>{requestor}</RequestorRef>
        <StopMonitoringRequest version="1.0">
            <RequestTimestamp>{timestamp}</RequestTimestamp>
            <MessageIdentifier>{message_id}</MessageIdentifier>
            <MonitoringRef>{monitoring_ref}</MonitoringRef>
        </StopMonitoringRequest>
    </ServiceRequest>
</Siri>"#,
            timestamp = timestamp,
            requestor = self.username,
            message_id = message_id,
            monitoring_ref = stop.id,
        )
    }
}

#[async_trait]
impl DepartureApi for SiriClient {
    fn name(&self) -> &'static str {
        "SIRI-SM"
    }

    async fn fetch_raw(&self, stop: &Stop) -> Result<String, TransportError> {
        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.username, Some(&self.password))
            .header("Content-Type", "application/xml")
            .timeout(self.timeout)
            .body(self.build_request(stop))
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

        let envelope: Siri =
            quick_xml::de::from_str(body).map_err(|e| ParseError::Malformed(e.to_string()))?;
        let delivery = envelope
            .ServiceDelivery
            .ok_or_else(|| ParseError::Malformed("no ServiceDelivery in response".to_string()))?;

        // No StopMonitoringDelivery just means no buses are due right now.
        let Some(monitoring) = delivery.StopMonitoringDelivery else {
            return Ok(0);
        };

        let mut added = 0;
        for visit in monitoring.MonitoredStopVisit {
            if added >= per_stop_cap || sink.is_full() {
                debug!(
                    "Reached collection limit for {} ({} this stop, {} total)",
                    stop.name,
                    added,
                    sink.len()
                );
                break;
            }

            let Some(journey) = visit.MonitoredVehicleJourney else {
                continue;
            };
            let route = match &journey.PublishedLineName {
                Some(line) => line.trim().to_string(),
                None => continue,
            };
            if !super::is_target_route(&self.routes, &route)
                || stop.skip_routes.iter().any(|r| r == &route)
            {
                continue;
            }

            let destination = journey
                .DirectionName
                .as_deref()
                .unwrap_or_default()
                .trim()
                .to_string();
            if !direction.matches_destination(&destination) {
                debug!(
                    "Skipped bus {}: destination '{}' does not match {}",
                    route, destination, direction.label
                );
                continue;
            }

            let Some(call) = journey.MonitoredCall else {
                continue;
            };
            let aimed = call.AimedDepartureTime.as_deref().unwrap_or("").trim();
            let expected = call.ExpectedDepartureTime.as_deref().unwrap_or("").trim();

            // Real-time estimate wins over the timetable when present.
            let is_live = !expected.is_empty();
            let time_to_use = if is_live { expected } else { aimed };
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

            if sink.push(Departure {
                route,
                stop_name: stop.name.clone(),
                destination,
                display_time: parsed.display,
                minutes_until: parsed.minutes_until,
                walk_minutes: stop.walk_minutes,
                is_live,
                status_text,
            }) {
                added += 1;
            }
        }

        Ok(added)
    }
}
