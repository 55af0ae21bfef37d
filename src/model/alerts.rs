use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where and when a matatu was last heard from. Value of `matatu-last-seen-store`.
///
/// `alerted` is set once an off-grid alert has been raised for the current
/// silence and cleared by the next ping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatatuLastSeen {
    pub matatu_id: String,
    pub route_id: String,
    pub route_name: String,
    pub last_latitude: f64,
    pub last_longitude: f64,
    pub last_seen_at: DateTime<Utc>,
    #[serde(default)]
    pub alerted: bool,
}

/// Raised when a matatu stays silent longer than the configured threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OffGridAlert {
    pub matatu_id: String,
    pub route_id: String,
    pub route_name: String,
    pub last_known_latitude: f64,
    pub last_known_longitude: f64,
    pub silence_duration_ms: i64,
    pub last_seen_at: DateTime<Utc>,
    pub alert_raised_at: DateTime<Utc>,
}

impl OffGridAlert {
    pub fn for_silence(last_seen: &MatatuLastSeen, now: DateTime<Utc>) -> Self {
        Self {
            matatu_id: last_seen.matatu_id.clone(),
            route_id: last_seen.route_id.clone(),
            route_name: last_seen.route_name.clone(),
            last_known_latitude: last_seen.last_latitude,
            last_known_longitude: last_seen.last_longitude,
            silence_duration_ms: (now - last_seen.last_seen_at).num_milliseconds(),
            last_seen_at: last_seen.last_seen_at,
            alert_raised_at: now,
        }
    }
}
