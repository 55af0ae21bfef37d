//! A simulated Nairobi fleet.
//!
//! Every matatu sends a GPS ping every 3 seconds and two fare payments every
//! 5 seconds, about one in ten of which fail. Everything goes through
//! [`EventProducer`], like a real device would.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::model::{FareEvent, LocationEvent, PaymentMethod, PaymentStatus};
use crate::producer::EventProducer;
use crate::reference::NAIROBI_FLEET;

pub const GPS_INTERVAL: Duration = Duration::from_secs(3);
pub const FARE_INTERVAL: Duration = Duration::from_secs(5);

/// Simulated routes: id, display name, base latitude and longitude.
const ROUTES: &[(&str, &str, f64, f64)] = &[
    ("route_33", "Route 33", -1.2921, 36.8219),
    ("route_23", "Route 23", -1.2650, 36.8100),
    ("route_58", "Route 58", -1.2800, 36.7500),
    ("route_111", "Route 111", -1.4200, 36.7800),
    ("route_46", "Route 46", -1.2780, 36.8450),
];

const JITTER_DEGREES: f64 = 0.01;
const FIRST_TRANSACTION: u64 = 1000;

pub struct FleetSimulator<R = StdRng> {
    rng: R,
    next_transaction: u64,
}

impl FleetSimulator<StdRng> {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }
}

impl Default for FleetSimulator<StdRng> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Rng> FleetSimulator<R> {
    pub fn with_rng(rng: R) -> Self {
        Self {
            rng,
            next_transaction: FIRST_TRANSACTION,
        }
    }

    /// One GPS ping per matatu.
    pub fn location_tick(&mut self, now: DateTime<Utc>) -> Vec<LocationEvent> {
        let mut events = Vec::with_capacity(NAIROBI_FLEET.len());
        for (matatu_id, route_id) in NAIROBI_FLEET {
            let Some((_, route_name, lat, lon)) = ROUTES.iter().find(|r| r.0 == *route_id) else {
                continue;
            };
            events.push(LocationEvent {
                matatu_id: matatu_id.to_string(),
                route_id: route_id.to_string(),
                route_name: route_name.to_string(),
                latitude: self.jitter(*lat),
                longitude: self.jitter(*lon),
                speed_kmh: self.rng.gen_range(20.0..90.0),
                passengers_onboard: self.rng.gen_range(1..34),
                timestamp: now,
            });
        }
        events
    }

    /// Two fares per matatu.
    pub fn fare_tick(&mut self, now: DateTime<Utc>) -> Vec<FareEvent> {
        let mut fares = Vec::with_capacity(NAIROBI_FLEET.len() * 2);
        for (matatu_id, _) in NAIROBI_FLEET {
            for _ in 0..2 {
                let fare = self.fare(matatu_id, now);
                fares.push(fare);
            }
        }
        fares
    }

    fn fare(&mut self, matatu_id: &str, now: DateTime<Utc>) -> FareEvent {
        self.next_transaction += 1;
        let failed = self.rng.gen_range(0..10u32) == 0;
        FareEvent {
            transaction_id: format!("TXN-{}", self.next_transaction),
            matatu_id: matatu_id.to_string(),
            passenger_id: format!("PAX-{}", self.rng.gen_range(1..500u32)),
            amount_kes: Decimal::from(self.rng.gen_range(30..150i64)),
            payment_method: if self.rng.gen_bool(0.5) {
                PaymentMethod::Mpesa
            } else {
                PaymentMethod::Cash
            },
            status: if failed {
                PaymentStatus::Failed
            } else {
                PaymentStatus::Success
            },
            timestamp: now,
        }
    }

    fn jitter(&mut self, base: f64) -> f64 {
        base + self.rng.gen_range(-JITTER_DEGREES..JITTER_DEGREES)
    }
}

/// Publishes simulated traffic until `shutdown` flips to `true`.
#[tracing::instrument(skip_all)]
pub async fn run(producer: EventProducer, mut shutdown: watch::Receiver<bool>) {
    let mut simulator = FleetSimulator::new();
    let mut gps = tokio::time::interval(GPS_INTERVAL);
    let mut fares = tokio::time::interval(FARE_INTERVAL);
    info!(matatus = NAIROBI_FLEET.len(), "Fleet simulator started");

    loop {
        tokio::select! {
            _ = gps.tick() => {
                for event in simulator.location_tick(Utc::now()) {
                    if let Err(e) = producer.send_location(&event).await {
                        warn!(matatu_id = %event.matatu_id, error = %e, "Failed to send location");
                    }
                }
            }
            _ = fares.tick() => {
                for fare in simulator.fare_tick(Utc::now()) {
                    if let Err(e) = producer.send_fare(&fare).await {
                        warn!(txn = %fare.transaction_id, error = %e, "Failed to send fare");
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("Fleet simulator stopped");
}
