use chrono::TimeDelta;
use std::time::Duration;
use tracing::{debug, warn};

use crate::engine::{Processor, ProcessorContext, StreamRecord};
use crate::error::Result;
use crate::model::{LocationEvent, MatatuLastSeen, OffGridAlert};

/// Raises an alert for matatus that stop reporting.
///
/// Each ping records when the matatu was last seen and clears its alert
/// flag. A wall-clock punctuator scans the store and alerts once for every
/// matatu silent for at least `silence`; the flag keeps later scans quiet
/// until the matatu reports again.
pub struct OffGridDetector {
    store: String,
    silence: TimeDelta,
    check_interval: Duration,
}

impl OffGridDetector {
    pub fn new(store: &str, silence: TimeDelta, check_interval: Duration) -> Self {
        Self {
            store: store.to_string(),
            silence,
            check_interval,
        }
    }
}

impl Processor for OffGridDetector {
    fn init(&mut self, ctx: &mut ProcessorContext<'_>) -> Result<()> {
        ctx.schedule(self.check_interval);
        Ok(())
    }

    fn process(&mut self, record: &StreamRecord, ctx: &mut ProcessorContext<'_>) -> Result<()> {
        let event: LocationEvent = record.decode()?;
        let now = ctx.now();
        let last_seen = MatatuLastSeen {
            matatu_id: record.key.clone(),
            route_id: event.route_id,
            route_name: event.route_name,
            last_latitude: event.latitude,
            last_longitude: event.longitude,
            last_seen_at: now,
            alerted: false,
        };
        ctx.store(&self.store)?.put(&record.key, &last_seen)?;
        Ok(())
    }

    fn punctuate(&mut self, ctx: &mut ProcessorContext<'_>) -> Result<()> {
        let now = ctx.now();
        let store = ctx.store(&self.store)?;
        let mut alerts = Vec::new();
        for (matatu_id, mut last_seen) in store.all::<MatatuLastSeen>()? {
            if last_seen.alerted || now - last_seen.last_seen_at < self.silence {
                continue;
            }
            let alert = OffGridAlert::for_silence(&last_seen, now);
            last_seen.alerted = true;
            store.put(&matatu_id, &last_seen)?;
            alerts.push((matatu_id, alert));
        }

        debug!(partition = ctx.partition(), alerts = alerts.len(), "Off-grid scan");
        for (matatu_id, alert) in alerts {
            warn!(
                matatu_id = %matatu_id,
                route = %alert.route_name,
                silence_ms = alert.silence_duration_ms,
                "Matatu off grid"
            );
            ctx.forward(matatu_id, &alert, now)?;
        }
        Ok(())
    }
}
