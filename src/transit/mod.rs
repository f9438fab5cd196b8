use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{DirectionConfig, Stop};

/// One of the two monitored travel directions. Each maps to its own stop
/// list, destination keywords and label via [`DirectionConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outbound,
    Inbound,
}

/// A single departure prediction, normalized from either wire format.
///
/// `minutes_until` is relative to the moment of parsing and is not
/// re-derived afterwards; the host's countdown tick decrements it once per
/// elapsed minute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub route: String,
    pub stop_name: String,
    pub destination: String,
    pub display_time: String,
    pub minutes_until: i32,
    pub walk_minutes: i32,
    pub is_live: bool,
    pub status_text: String,
}

impl Departure {
    /// Minutes left before the viewer must start walking to catch this bus.
    pub fn leave_in(&self) -> i32 {
        self.minutes_until - self.walk_minutes
    }

    pub fn is_catchable(&self) -> bool {
        self.leave_in() >= 0
    }
}

/// Capacity-checked accumulator for one fetch pass. The cap is a hard
/// limit: `push` refuses once full rather than growing past it.
#[derive(Debug, Clone)]
pub struct DepartureSet {
    entries: Vec<Departure>,
    capacity: usize,
}

impl DepartureSet {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, departure: Departure) -> bool {
        if self.entries.len() >= self.capacity {
            return false;
        }
        self.entries.push(departure);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn entries(&self) -> &[Departure] {
        &self.entries
    }

    pub fn into_vec(self) -> Vec<Departure> {
        self.entries
    }
}

/// Result of one orchestration pass over a direction's stops.
#[derive(Debug)]
pub struct FetchOutcome {
    /// Raw accumulated records, unsorted and undeduplicated; run them
    /// through [`aggregate::aggregate`] before display.
    pub departures: Vec<Departure>,
    pub api_calls_used: u32,
    pub fetched_all_stops: bool,
    /// At least one stop produced a parseable response this pass.
    pub success: bool,
    pub error_reason: Option<String>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP {0}")]
    Status(u16),
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("local clock not synchronised")]
    ClockUnsynced,
}

/// A stop-monitoring provider: one bounded network request per stop, plus
/// extraction of that response into normalized [`Departure`] records.
///
/// Two implementations exist (SIRI-SM XML and the grouped-by-route JSON
/// API); the orchestrator is agnostic to which one is configured.
#[async_trait]
pub trait DepartureApi: Send + Sync {
    fn name(&self) -> &'static str;

    /// Issue one request for the given stop and return the raw body.
    async fn fetch_raw(&self, stop: &Stop) -> Result<String, TransportError>;

    /// Extract departures for `stop` from a raw body into `sink`, applying
    /// route/destination filters. Adds at most `per_stop_cap` records and
    /// never grows `sink` past its capacity. Returns the number added.
    ///
    /// `now` is the local wall-clock time, or `None` while the host clock
    /// is not yet synchronised (in which case nothing is committed).
    fn parse(
        &self,
        body: &str,
        stop: &Stop,
        direction: &DirectionConfig,
        now: Option<NaiveDateTime>,
        sink: &mut DepartureSet,
        per_stop_cap: usize,
    ) -> Result<usize, ParseError>;
}

pub(crate) fn is_target_route(routes: &[String], route: &str) -> bool {
    routes.iter().any(|r| r == route)
}

pub mod aggregate;
pub mod fetch;
pub mod siri;
pub mod times;
pub mod transportapi;

#[cfg(test)]
mod tests {
    use super::*;

    fn departure(minutes_until: i32, walk_minutes: i32) -> Departure {
        Departure {
            route: "94".to_string(),
            stop_name: "Test Stop".to_string(),
            destination: "Town".to_string(),
            display_time: "12:00".to_string(),
            minutes_until,
            walk_minutes,
            is_live: true,
            status_text: "Live".to_string(),
        }
    }

    #[test]
    fn leave_in_subtracts_walking_time() {
        assert_eq!(departure(8, 5).leave_in(), 3);
        assert_eq!(departure(2, 5).leave_in(), -3);
        assert!(departure(8, 5).is_catchable());
        assert!(!departure(2, 5).is_catchable());
    }

    #[test]
    fn departure_set_enforces_hard_cap() {
        let mut set = DepartureSet::with_capacity(2);
        assert!(set.push(departure(5, 0)));
        assert!(set.push(departure(6, 0)));
        assert!(set.is_full());
        assert!(!set.push(departure(7, 0)));
        assert_eq!(set.len(), 2);
    }
}
