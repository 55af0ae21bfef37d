use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use std::marker::PhantomData;

use crate::engine::{Processor, ProcessorContext, StreamRecord};
use crate::error::Result;
use crate::model::{DeltaEvent, PassengerCount, RouteOccupancy};

/// A per-route running aggregate of passenger deltas.
pub trait RouteTable: Serialize + DeserializeOwned + Send + 'static {
    fn seed(route_id: &str, now: DateTime<Utc>) -> Self;

    fn apply(&mut self, delta: &DeltaEvent, now: DateTime<Utc>);
}

impl RouteTable for RouteOccupancy {
    fn seed(route_id: &str, now: DateTime<Utc>) -> Self {
        RouteOccupancy::empty(route_id, now)
    }

    fn apply(&mut self, delta: &DeltaEvent, now: DateTime<Utc>) {
        RouteOccupancy::apply(self, delta, now)
    }
}

impl RouteTable for PassengerCount {
    fn seed(route_id: &str, now: DateTime<Utc>) -> Self {
        PassengerCount::empty(route_id, now)
    }

    fn apply(&mut self, delta: &DeltaEvent, now: DateTime<Utc>) {
        PassengerCount::apply(self, delta, now)
    }
}

/// Folds each DeltaEvent into its route's row and emits the updated row.
///
/// Every update goes to the store's changelog and to the output topic, so
/// either can be replayed to rebuild the table.
pub struct RouteAggregator<T> {
    store: String,
    _row: PhantomData<fn() -> T>,
}

impl<T: RouteTable> RouteAggregator<T> {
    pub fn new(store: &str) -> Self {
        Self {
            store: store.to_string(),
            _row: PhantomData,
        }
    }
}

impl<T: RouteTable> Processor for RouteAggregator<T> {
    fn process(&mut self, record: &StreamRecord, ctx: &mut ProcessorContext<'_>) -> Result<()> {
        let delta: DeltaEvent = record.decode()?;
        let now = ctx.now();
        let store = ctx.store(&self.store)?;

        let mut row = store
            .get::<T>(&record.key)?
            .unwrap_or_else(|| T::seed(&record.key, now));
        row.apply(&delta, now);
        store.put(&record.key, &row)?;

        ctx.forward(record.key.clone(), &row, record.timestamp)
    }
}
