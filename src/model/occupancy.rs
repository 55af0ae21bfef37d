use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Last passenger count reported by a matatu. Value of `matatu-snapshot-store`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatatuSnapshot {
    pub matatu_id: String,
    pub route_id: String,
    pub last_passenger_count: u32,
    pub last_updated: DateTime<Utc>,
}

/// Change in passengers on board between two consecutive pings of one matatu.
///
/// Only ever lives on the internal delta repartition topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaEvent {
    pub matatu_id: String,
    pub route_id: String,
    pub route_name: String,
    pub passenger_delta: i64,
    pub boardings: u64,
    pub alightings: u64,
}

impl DeltaEvent {
    pub fn between(
        matatu_id: &str,
        route_id: &str,
        route_name: &str,
        previous: u32,
        current: u32,
    ) -> Self {
        let delta = i64::from(current) - i64::from(previous);
        Self {
            matatu_id: matatu_id.to_string(),
            route_id: route_id.to_string(),
            route_name: route_name.to_string(),
            passenger_delta: delta,
            boardings: delta.max(0) as u64,
            alightings: (-delta).max(0) as u64,
        }
    }
}

/// Live occupancy of a route across all of its matatus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteOccupancy {
    pub route_id: String,
    pub route_name: String,
    pub current_passengers: u64,
    pub total_boardings: u64,
    pub total_alightings: u64,
    pub last_updated: DateTime<Utc>,
}

impl RouteOccupancy {
    pub fn empty(route_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            route_id: route_id.to_string(),
            route_name: String::new(),
            current_passengers: 0,
            total_boardings: 0,
            total_alightings: 0,
            last_updated: now,
        }
    }

    /// Folds one delta into the row. Passengers on board never drop below zero.
    pub fn apply(&mut self, delta: &DeltaEvent, now: DateTime<Utc>) {
        self.route_name = delta.route_name.clone();
        self.current_passengers = clamped_add(self.current_passengers, delta.passenger_delta);
        self.total_boardings += delta.boardings;
        self.total_alightings += delta.alightings;
        self.last_updated = now;
    }
}

/// Running passenger aggregate per route, with the number of pings folded in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PassengerCount {
    pub route_id: String,
    pub route_name: String,
    pub current_passengers: u64,
    pub total_boardings: u64,
    pub event_count: u64,
    pub last_updated: DateTime<Utc>,
}

impl PassengerCount {
    pub fn empty(route_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            route_id: route_id.to_string(),
            route_name: String::new(),
            current_passengers: 0,
            total_boardings: 0,
            event_count: 0,
            last_updated: now,
        }
    }

    pub fn apply(&mut self, delta: &DeltaEvent, now: DateTime<Utc>) {
        self.route_name = delta.route_name.clone();
        self.current_passengers = clamped_add(self.current_passengers, delta.passenger_delta);
        self.total_boardings += delta.boardings;
        self.event_count += 1;
        self.last_updated = now;
    }
}

fn clamped_add(current: u64, delta: i64) -> u64 {
    if delta >= 0 {
        current.saturating_add(delta as u64)
    } else {
        current.saturating_sub(delta.unsigned_abs())
    }
}
