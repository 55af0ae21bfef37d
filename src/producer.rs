//! The only write path into the topology's input topics.
//!
//! Events are validated here, before they reach the log; processors never
//! see a blank id or a negative speed.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::error::{Result, ValidationError};
use crate::log::{EventLog, ProducerRecord, RecordMetadata};
use crate::model::{FareEvent, LocationEvent};
use crate::topics;

/// One line of a replay file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum IngestEvent {
    Location(LocationEvent),
    Fare(FareEvent),
}

pub fn validate_location(event: &LocationEvent) -> std::result::Result<(), ValidationError> {
    not_blank("matatuId", &event.matatu_id)?;
    not_blank("routeId", &event.route_id)?;
    for (field, value) in [
        ("latitude", event.latitude),
        ("longitude", event.longitude),
        ("speedKmh", event.speed_kmh),
    ] {
        if !value.is_finite() {
            return Err(ValidationError::NotFinite { field });
        }
    }
    if event.speed_kmh < 0.0 {
        return Err(ValidationError::Negative {
            field: "speedKmh",
            value: event.speed_kmh,
        });
    }
    Ok(())
}

pub fn validate_fare(fare: &FareEvent) -> std::result::Result<(), ValidationError> {
    not_blank("transactionId", &fare.transaction_id)?;
    not_blank("matatuId", &fare.matatu_id)?;
    if fare.amount_kes <= rust_decimal::Decimal::ZERO {
        return Err(ValidationError::NonPositiveAmount(fare.amount_kes.to_string()));
    }
    Ok(())
}

fn not_blank(field: &'static str, value: &str) -> std::result::Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Blank { field });
    }
    Ok(())
}

#[derive(Clone)]
pub struct EventProducer {
    log: Arc<dyn EventLog>,
}

impl EventProducer {
    pub fn new(log: Arc<dyn EventLog>) -> Self {
        Self { log }
    }

    /// Appends a location ping to `matatu.location`, keyed by routeId.
    pub async fn send_location(&self, event: &LocationEvent) -> Result<RecordMetadata> {
        validate_location(event)?;
        let record = ProducerRecord::keyed(
            topics::LOCATION,
            &event.route_id,
            serde_json::to_value(event)?,
            event.timestamp,
        );
        let metadata = self.log.produce(record).await?;
        debug!(
            matatu_id = %event.matatu_id,
            route_id = %event.route_id,
            partition = metadata.partition,
            offset = metadata.offset,
            "Sent location"
        );
        Ok(metadata)
    }

    /// Appends a fare to `matatu.fares`, keyed by matatuId.
    pub async fn send_fare(&self, fare: &FareEvent) -> Result<RecordMetadata> {
        validate_fare(fare)?;
        let record = ProducerRecord::keyed(
            topics::FARES,
            &fare.matatu_id,
            serde_json::to_value(fare)?,
            fare.timestamp,
        );
        let metadata = self.log.produce(record).await?;
        debug!(
            txn = %fare.transaction_id,
            matatu_id = %fare.matatu_id,
            partition = metadata.partition,
            offset = metadata.offset,
            "Sent fare"
        );
        Ok(metadata)
    }

    pub async fn send(&self, event: &IngestEvent) -> Result<RecordMetadata> {
        match event {
            IngestEvent::Location(location) => self.send_location(location).await,
            IngestEvent::Fare(fare) => self.send_fare(fare).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::log::InMemoryLog;
    use crate::model::{PaymentMethod, PaymentStatus};
    use chrono::{DateTime, Utc};
    use rust_decimal::Decimal;

    fn ts() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn location() -> LocationEvent {
        LocationEvent {
            matatu_id: "KBZ 123A".to_string(),
            route_id: "route_33".to_string(),
            route_name: "Route 33 - CBD to Kikuyu".to_string(),
            latitude: -1.2921,
            longitude: 36.8219,
            speed_kmh: 42.0,
            passengers_onboard: 14,
            timestamp: ts(),
        }
    }

    fn fare() -> FareEvent {
        FareEvent {
            transaction_id: "TXN-1000".to_string(),
            matatu_id: "KBZ 123A".to_string(),
            passenger_id: "PAX-1".to_string(),
            amount_kes: Decimal::new(7000, 2),
            payment_method: PaymentMethod::Mpesa,
            status: PaymentStatus::Success,
            timestamp: ts(),
        }
    }

    #[test]
    fn test_location_validation() {
        assert_eq!(validate_location(&location()), Ok(()));

        let mut blank = location();
        blank.route_id = "  ".to_string();
        assert_eq!(
            validate_location(&blank),
            Err(ValidationError::Blank { field: "routeId" })
        );

        let mut negative = location();
        negative.speed_kmh = -3.0;
        assert!(matches!(
            validate_location(&negative),
            Err(ValidationError::Negative { field: "speedKmh", .. })
        ));

        let mut nan = location();
        nan.latitude = f64::NAN;
        assert_eq!(
            validate_location(&nan),
            Err(ValidationError::NotFinite { field: "latitude" })
        );
    }

    #[test]
    fn test_fare_validation() {
        assert_eq!(validate_fare(&fare()), Ok(()));
        let mut free = fare();
        free.amount_kes = Decimal::ZERO;
        assert!(matches!(
            validate_fare(&free),
            Err(ValidationError::NonPositiveAmount(_))
        ));
    }

    #[test]
    fn test_ingest_event_tagging() {
        let line = serde_json::to_string(&IngestEvent::Location(location())).unwrap();
        assert!(line.contains(r#""type":"location""#));
        let parsed: IngestEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed, IngestEvent::Location(location()));
    }

    #[tokio::test]
    async fn test_send_keys_by_topic_rules() {
        let log = Arc::new(InMemoryLog::new());
        log.create_topic(topics::LOCATION, 3).await.unwrap();
        log.create_topic(topics::FARES, 3).await.unwrap();
        let producer = EventProducer::new(log.clone());

        producer.send_location(&location()).await.unwrap();
        producer.send_fare(&fare()).await.unwrap();

        let locations = log.records(topics::LOCATION).await.unwrap();
        assert_eq!(locations[0].key, "route_33");
        assert_eq!(locations[0].partition, 1);
        let fares = log.records(topics::FARES).await.unwrap();
        assert_eq!(fares[0].key, "KBZ 123A");
        assert_eq!(fares[0].partition, 0);
    }

    #[tokio::test]
    async fn test_invalid_events_never_reach_the_log() {
        let log = Arc::new(InMemoryLog::new());
        log.create_topic(topics::LOCATION, 3).await.unwrap();
        let producer = EventProducer::new(log.clone());

        let mut bad = location();
        bad.matatu_id.clear();
        let err = producer.send_location(&bad).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(log.records(topics::LOCATION).await.unwrap().is_empty());
    }
}
