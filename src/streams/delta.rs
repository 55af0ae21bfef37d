use tracing::debug;

use crate::engine::{Processor, ProcessorContext, StreamRecord};
use crate::error::Result;
use crate::model::{DeltaEvent, LocationEvent, MatatuSnapshot};

/// Turns absolute passenger counts into boardings and alightings.
///
/// Input is keyed by matatuId. The store keeps each matatu's last count; a
/// matatu seen for the first time counts as starting from zero.
pub struct DeltaProcessor {
    store: String,
}

impl DeltaProcessor {
    pub fn new(store: &str) -> Self {
        Self {
            store: store.to_string(),
        }
    }
}

impl Processor for DeltaProcessor {
    fn process(&mut self, record: &StreamRecord, ctx: &mut ProcessorContext<'_>) -> Result<()> {
        let event: LocationEvent = record.decode()?;
        let matatu_id = record.key.as_str();
        let now = ctx.now();
        let store = ctx.store(&self.store)?;

        let previous = store
            .get::<MatatuSnapshot>(matatu_id)?
            .map_or(0, |s| s.last_passenger_count);
        let delta = DeltaEvent::between(
            matatu_id,
            &event.route_id,
            &event.route_name,
            previous,
            event.passengers_onboard,
        );
        debug!(
            matatu_id,
            previous,
            current = event.passengers_onboard,
            delta = delta.passenger_delta,
            "Passenger delta"
        );

        store.put(
            matatu_id,
            &MatatuSnapshot {
                matatu_id: matatu_id.to_string(),
                route_id: event.route_id.clone(),
                last_passenger_count: event.passengers_onboard,
                last_updated: now,
            },
        )?;
        ctx.forward(record.key.clone(), &delta, record.timestamp)
    }
}
