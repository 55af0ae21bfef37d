//! Topic catalogue.

pub const LOCATION: &str = "matatu.location";
pub const FARES: &str = "matatu.fares";

pub const SPEED_ALERTS: &str = "matatu.speed.alerts";
pub const LOCATION_ENRICHED: &str = "matatu.location.enriched";
pub const FARES_FAILED: &str = "matatu.fares.failed";

pub const PASSENGER_COUNTS: &str = "matatu.passenger.counts";
pub const SACCO_REVENUE: &str = "matatu.sacco.revenue";
pub const OFFGRID_ALERTS: &str = "matatu.offgrid.alerts";
pub const ROUTE_OCCUPANCY: &str = "matatu.route.occupancy";

/// Input topics, written only by the producer API.
pub const INPUTS: &[&str] = &[LOCATION, FARES];

/// Topics the topology writes for outside readers.
pub const OUTPUTS: &[&str] = &[
    SPEED_ALERTS,
    LOCATION_ENRICHED,
    FARES_FAILED,
    PASSENGER_COUNTS,
    SACCO_REVENUE,
    OFFGRID_ALERTS,
    ROUTE_OCCUPANCY,
];

/// Internal topic used to move records onto a new key's partition.
pub fn repartition(application_id: &str, name: &str) -> String {
    format!("{application_id}-{name}-repartition")
}

/// Internal topic recording every mutation of a state store.
pub fn changelog(application_id: &str, store: &str) -> String {
    format!("{application_id}-{store}-changelog")
}
