//! Post-processing of one fetch pass: ordering by urgency, dropping
//! near-duplicates and departures that can no longer be caught.

use itertools::Itertools;
use log::debug;

use super::Departure;

/// Sort by leave-in time (stable), drop near-duplicates, drop uncatchable
/// entries and re-sort. Pure: the same input always yields the same output,
/// and the output is a fixed point (aggregating twice changes nothing).
///
/// Truncation to the display capacity is left to presentation so spares
/// survive for when a displayed bus becomes uncatchable.
pub fn aggregate(raw: &[Departure], dedup_tolerance: i32) -> Vec<Departure> {
    let sorted: Vec<Departure> = raw
        .iter()
        .cloned()
        .sorted_by_key(Departure::leave_in)
        .collect();

    let mut kept: Vec<Departure> = Vec::with_capacity(sorted.len());
    for departure in sorted {
        if kept
            .iter()
            .any(|k| is_duplicate(k, &departure, dedup_tolerance))
        {
            debug!(
                "Dropping duplicate {} at {} ({} min)",
                departure.route, departure.stop_name, departure.minutes_until
            );
            continue;
        }
        kept.push(departure);
    }

    kept.retain(|d| {
        if d.is_catchable() {
            true
        } else {
            debug!(
                "Filtering out bus {} from {}: leave in {} min (departs in {}, walk {} min)",
                d.route,
                d.stop_name,
                d.leave_in(),
                d.minutes_until,
                d.walk_minutes
            );
            false
        }
    });

    // Filtering preserves order, but the contract calls for sorted output.
    kept.sort_by_key(Departure::leave_in);
    kept
}

/// How many accumulated records are catchable and not a near-duplicate of
/// an earlier one. Drives the orchestrator's early-stop confidence check.
pub fn unique_catchable(raw: &[Departure], dedup_tolerance: i32) -> usize {
    let mut kept: Vec<&Departure> = Vec::new();
    for departure in raw.iter().filter(|d| d.is_catchable()) {
        if !kept
            .iter()
            .any(|k| is_duplicate(k, departure, dedup_tolerance))
        {
            kept.push(departure);
        }
    }
    kept.len()
}

/// Advance the displayed set by `minutes_elapsed`: decrement every
/// countdown (floored at zero) and drop entries that are no longer
/// catchable. Returns how many were dropped.
pub fn age_departures(departures: &mut Vec<Departure>, minutes_elapsed: u32) -> usize {
    if minutes_elapsed == 0 {
        return 0;
    }
    for departure in departures.iter_mut() {
        departure.minutes_until = (departure.minutes_until - minutes_elapsed as i32).max(0);
    }
    let before = departures.len();
    departures.retain(|d| {
        if d.is_catchable() {
            true
        } else {
            debug!(
                "Removing bus {} - too late (departs in {} min, walk {} min)",
                d.route, d.minutes_until, d.walk_minutes
            );
            false
        }
    });
    before - departures.len()
}

fn is_duplicate(a: &Departure, b: &Departure, tolerance: i32) -> bool {
    a.route == b.route
        && a.stop_name == b.stop_name
        && (a.minutes_until - b.minutes_until).abs() <= tolerance
}
