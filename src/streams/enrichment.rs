use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::engine::{Processor, ProcessorContext, StreamRecord};
use crate::error::Result;
use crate::model::{EnrichedLocationEvent, FareEvent, LocationEvent, SaccoInfo};
use crate::reference::ReferenceData;

/// Attaches SACCO and terminus metadata to each location ping.
pub struct EnrichmentProcessor {
    reference: Arc<dyn ReferenceData>,
    speed_threshold_kmh: f64,
}

impl EnrichmentProcessor {
    pub fn new(reference: Arc<dyn ReferenceData>, speed_threshold_kmh: f64) -> Self {
        Self {
            reference,
            speed_threshold_kmh,
        }
    }
}

impl Processor for EnrichmentProcessor {
    fn process(&mut self, record: &StreamRecord, ctx: &mut ProcessorContext<'_>) -> Result<()> {
        let event: LocationEvent = record.decode()?;
        let sacco = match self.reference.lookup_route(&event.route_id) {
            Some(sacco) => sacco,
            None => {
                warn!(
                    route_id = %event.route_id,
                    matatu_id = %event.matatu_id,
                    "No SACCO found for route"
                );
                ctx.record_lookup_miss();
                SaccoInfo::unknown()
            }
        };

        let enriched = EnrichedLocationEvent::new(
            &event,
            &sacco,
            event.speed_kmh > self.speed_threshold_kmh,
            ctx.now(),
        );
        debug!(
            matatu_id = %enriched.matatu_id,
            route = %enriched.route_name,
            sacco = %enriched.sacco_name,
            "Enriched location"
        );
        ctx.forward(record.key.clone(), &enriched, record.timestamp)
    }
}

/// A fare tagged with the SACCO that collected it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaccoFare {
    pub sacco_id: String,
    pub sacco_name: String,
    pub fare: FareEvent,
}

/// Re-keys fares from matatuId to saccoId. Matatus without a registered
/// route are attributed to the unknown SACCO.
pub struct SaccoKeySelector {
    reference: Arc<dyn ReferenceData>,
}

impl SaccoKeySelector {
    pub fn new(reference: Arc<dyn ReferenceData>) -> Self {
        Self { reference }
    }
}

impl Processor for SaccoKeySelector {
    fn process(&mut self, record: &StreamRecord, ctx: &mut ProcessorContext<'_>) -> Result<()> {
        let fare: FareEvent = record.decode()?;
        let sacco = match self.reference.sacco_of_matatu(&fare.matatu_id) {
            Some(sacco) => sacco,
            None => {
                warn!(matatu_id = %fare.matatu_id, "No SACCO found for matatu");
                ctx.record_lookup_miss();
                SaccoInfo::unknown()
            }
        };

        let tagged = SaccoFare {
            sacco_id: sacco.sacco_id,
            sacco_name: sacco.sacco_name,
            fare,
        };
        ctx.forward(tagged.sacco_id.clone(), &tagged, record.timestamp)
    }
}
