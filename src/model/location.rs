use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::SaccoInfo;

/// A GPS ping from a single matatu.
///
/// Written to `matatu.location` keyed by `route_id`. The producer API rejects
/// blank ids, negative speed and negative passenger counts before the event
/// reaches the log, so processors can rely on those fields being sane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationEvent {
    pub matatu_id: String,
    pub route_id: String,
    pub route_name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub speed_kmh: f64,
    pub passengers_onboard: u32,
    pub timestamp: DateTime<Utc>,
}

/// A location ping joined with the operator that runs its route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedLocationEvent {
    pub matatu_id: String,
    pub route_id: String,
    pub route_name: String,
    pub sacco_name: String,
    pub sacco_id: String,
    pub terminus: String,
    pub latitude: f64,
    pub longitude: f64,
    pub speed_kmh: f64,
    pub passengers_onboard: u32,
    pub is_speeding: bool,
    pub original_timestamp: DateTime<Utc>,
    pub enriched_at: DateTime<Utc>,
}

impl EnrichedLocationEvent {
    pub fn new(
        event: &LocationEvent,
        sacco: &SaccoInfo,
        is_speeding: bool,
        enriched_at: DateTime<Utc>,
    ) -> Self {
        Self {
            matatu_id: event.matatu_id.clone(),
            route_id: event.route_id.clone(),
            route_name: event.route_name.clone(),
            sacco_name: sacco.sacco_name.clone(),
            sacco_id: sacco.sacco_id.clone(),
            terminus: sacco.terminus.clone(),
            latitude: event.latitude,
            longitude: event.longitude,
            speed_kmh: event.speed_kmh,
            passengers_onboard: event.passengers_onboard,
            is_speeding,
            original_timestamp: event.timestamp,
            enriched_at,
        }
    }
}
