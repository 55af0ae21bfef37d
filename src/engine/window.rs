//! Tumbling windows and the windowed aggregation processor.
//!
//! Windows are aligned to the epoch: with a 60s size, a record at 08:00:42
//! belongs to `[08:00:00, 08:01:00)`. A window closes once the processor's
//! stream time (the largest record timestamp it has seen) reaches
//! `window_end + grace`. At that point its result is forwarded exactly once
//! and its accumulator is deleted; records that still map to it are dropped
//! as late.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::{debug, warn};

use super::processor::{Processor, ProcessorContext, StreamRecord};
use crate::error::Result;

/// A half-open time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.start && timestamp < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TumblingWindows {
    size: Duration,
    grace: Duration,
}

impl TumblingWindows {
    /// # Panics
    ///
    /// Panics if `size` is not positive.
    pub fn of(size: Duration) -> Self {
        assert!(size > Duration::zero(), "Window size must be positive");
        Self {
            size,
            grace: Duration::zero(),
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace.max(Duration::zero());
        self
    }

    pub fn size(&self) -> Duration {
        self.size
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    pub fn window_for(&self, timestamp: DateTime<Utc>) -> TimeWindow {
        let size = self.size.num_milliseconds();
        let start = timestamp.timestamp_millis().div_euclid(size) * size;
        let start = Utc
            .timestamp_millis_opt(start)
            .single()
            .unwrap_or(timestamp);
        TimeWindow {
            start,
            end: start + self.size,
        }
    }

    pub fn is_closed(&self, window: &TimeWindow, stream_time: DateTime<Utc>) -> bool {
        stream_time >= window.end + self.grace
    }
}

/// The per-window logic plugged into a [`WindowedAggregator`].
pub trait WindowAggregate: Send {
    type Input: DeserializeOwned;
    type Accumulator: Serialize + DeserializeOwned + Default;
    type Output: Serialize;

    /// Whether the record contributes to its window at all.
    fn accepts(&self, _input: &Self::Input) -> bool {
        true
    }

    fn aggregate(&self, key: &str, input: &Self::Input, acc: &mut Self::Accumulator);

    fn finish(
        &self,
        key: &str,
        window: TimeWindow,
        acc: Self::Accumulator,
        now: DateTime<Utc>,
    ) -> Self::Output;
}

#[derive(Debug, Serialize, Deserialize)]
struct WindowSlot<A> {
    window: TimeWindow,
    key: String,
    acc: A,
}

const STREAM_TIME_KEY: &str = "~stream-time";
const SLOT_PREFIX: &str = "w|";

/// A stateful processor bucketing records into tumbling windows per key.
///
/// Open windows live in the store as `w|<shifted start millis>|<key>`; the stream
/// time is persisted beside them so that a restored store keeps rejecting
/// records for windows it has already emitted.
pub struct WindowedAggregator<A> {
    store: String,
    windows: TumblingWindows,
    aggregate: A,
}

impl<A: WindowAggregate> WindowedAggregator<A> {
    pub fn new(store: &str, windows: TumblingWindows, aggregate: A) -> Self {
        Self {
            store: store.to_string(),
            windows,
            aggregate,
        }
    }

    /// Start millis are shifted into `u64` so that keys sort by window start,
    /// including windows before the epoch.
    fn slot_key(window: &TimeWindow, key: &str) -> String {
        let start = i128::from(window.start.timestamp_millis()) - i128::from(i64::MIN);
        format!("{SLOT_PREFIX}{start:020}|{key}")
    }
}

impl<A: WindowAggregate> Processor for WindowedAggregator<A> {
    fn process(&mut self, record: &StreamRecord, ctx: &mut ProcessorContext<'_>) -> Result<()> {
        let input: A::Input = record.decode()?;
        let now = ctx.now();
        let store = ctx.store(&self.store)?;

        let previous: Option<DateTime<Utc>> = store.get(STREAM_TIME_KEY)?;
        let stream_time = previous.map_or(record.timestamp, |t| t.max(record.timestamp));
        if previous != Some(stream_time) {
            store.put(STREAM_TIME_KEY, &stream_time)?;
        }

        let window = self.windows.window_for(record.timestamp);
        debug_assert!(window.contains(record.timestamp));
        let mut late = false;
        if self.windows.is_closed(&window, stream_time) {
            late = true;
        } else if self.aggregate.accepts(&input) {
            let slot_key = Self::slot_key(&window, &record.key);
            let mut slot = store
                .get::<WindowSlot<A::Accumulator>>(&slot_key)?
                .unwrap_or_else(|| WindowSlot {
                    window,
                    key: record.key.clone(),
                    acc: A::Accumulator::default(),
                });
            self.aggregate.aggregate(&record.key, &input, &mut slot.acc);
            store.put(&slot_key, &slot)?;
        }

        let open: Vec<(String, WindowSlot<A::Accumulator>)> = store.prefix(SLOT_PREFIX)?;
        let mut closed = Vec::new();
        for (slot_key, slot) in open {
            if !self.windows.is_closed(&slot.window, stream_time) {
                // slots are ordered by window start
                break;
            }
            store.delete(&slot_key);
            closed.push(slot);
        }

        if late {
            warn!(
                node = ctx.node(),
                key = %record.key,
                timestamp = %record.timestamp,
                window_end = %window.end,
                stream_time = %stream_time,
                "Dropping record for closed window"
            );
            ctx.record_late_drop();
        }

        for slot in closed {
            debug!(key = %slot.key, start = %slot.window.start, "Closing window");
            let output = self.aggregate.finish(&slot.key, slot.window, slot.acc, now);
            ctx.forward(slot.key, &output, slot.window.end)?;
        }
        Ok(())
    }
}
