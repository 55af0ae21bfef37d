//! Event and state payloads carried through the topology.
//!
//! Every type here is a plain serde record. Values cross the event log as
//! camelCase JSON so that any reader of a topic can decode them without
//! linking this crate.

mod alerts;
mod fare;
mod location;
mod occupancy;
mod revenue;

pub use alerts::{MatatuLastSeen, OffGridAlert};
pub use fare::{FareEvent, PaymentMethod, PaymentStatus};
pub use location::{EnrichedLocationEvent, LocationEvent};
pub use occupancy::{DeltaEvent, MatatuSnapshot, PassengerCount, RouteOccupancy};
pub use revenue::{SaccoInfo, SaccoRevenueWindow};
