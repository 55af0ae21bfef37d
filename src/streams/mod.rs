//! The matatu tracking topology.
//!
//! ```text
//! matatu.location (routeId)
//!   ├─ speed-filter ─ speed-alert-log ─────────────────────▶ matatu.speed.alerts
//!   ├─ route-enrichment ───────────────────────────────────▶ matatu.location.enriched
//!   └─ key-by-matatu ═▶ location-by-matatu (matatuId)
//!        ├─ matatu-delta-processor ─ key-by-route ═▶ deltas-by-route (routeId)
//!        │     ├─ route-occupancy-aggregator ─ occupancy-log ▶ matatu.route.occupancy
//!        │     └─ passenger-count-aggregator ──────────────▶ matatu.passenger.counts
//!        └─ off-grid-detector (punctuated) ────────────────▶ matatu.offgrid.alerts
//!
//! matatu.fares (matatuId)
//!   ├─ fare-status-router
//!   │     ├─ failed-fare-log ──────────────────────────────▶ matatu.fares.failed
//!   │     ├─ successful-fare-log
//!   │     └─ pending-fare-log
//!   └─ key-by-sacco ═▶ fares-by-sacco (saccoId)
//!        └─ sacco-revenue-aggregator (tumbling window) ────▶ matatu.sacco.revenue
//! ```
//!
//! `═▶` is a physical repartition through an internal topic.

mod delta;
mod enrichment;
mod occupancy;
mod offgrid;
mod revenue;

pub use delta::DeltaProcessor;
pub use enrichment::{EnrichmentProcessor, SaccoFare, SaccoKeySelector};
pub use occupancy::{RouteAggregator, RouteTable};
pub use offgrid::OffGridDetector;
pub use revenue::{RevenueAccumulator, SaccoRevenue};

use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::engine::{
    BranchBuilder, ProcessorNode, Topology, TopologyBuilder, TumblingWindows, WindowedAggregator,
    filter, peek, select_key, supplier,
};
use crate::error::TopologyError;
use crate::model::{
    DeltaEvent, FareEvent, LocationEvent, PassengerCount, PaymentStatus, RouteOccupancy,
};
use crate::reference::ReferenceData;
use crate::topics;

pub const MATATU_SNAPSHOT_STORE: &str = "matatu-snapshot-store";
pub const MATATU_LAST_SEEN_STORE: &str = "matatu-last-seen-store";
pub const ROUTE_OCCUPANCY_STORE: &str = "route-occupancy-store";
pub const PASSENGER_COUNT_STORE: &str = "passenger-count-store";
pub const SACCO_REVENUE_STORE: &str = "sacco-revenue-store";

pub fn build_topology(
    settings: &Settings,
    reference: Arc<dyn ReferenceData>,
) -> Result<Topology, TopologyError> {
    let mut b = TopologyBuilder::new(&settings.application_id);
    for store in [
        MATATU_SNAPSHOT_STORE,
        MATATU_LAST_SEEN_STORE,
        ROUTE_OCCUPANCY_STORE,
        PASSENGER_COUNT_STORE,
        SACCO_REVENUE_STORE,
    ] {
        b.add_state_store(store)?;
    }

    add_location_streams(&mut b, settings, reference.clone())?;
    add_fare_streams(&mut b, settings, reference)?;

    let topology = b.build()?;
    info!(
        sub_topologies = topology.sub_topologies().len(),
        "Built matatu topology"
    );
    Ok(topology)
}

fn add_location_streams(
    b: &mut TopologyBuilder,
    settings: &Settings,
    reference: Arc<dyn ReferenceData>,
) -> Result<(), TopologyError> {
    let threshold = settings.speed_threshold_kmh;
    b.add_source("location-source", topics::LOCATION, "routeId")?;

    // Speed alerts: the input record, unchanged
    b.add_processor(
        "speed-filter",
        ProcessorNode::new(filter(move |_, e: &LocationEvent| e.speed_kmh > threshold)),
        &["location-source"],
    )?;
    b.add_processor(
        "speed-alert-log",
        ProcessorNode::new(peek(move |_, e: &LocationEvent| {
            warn!(
                matatu_id = %e.matatu_id,
                route = %e.route_name,
                speed_kmh = e.speed_kmh,
                threshold_kmh = threshold,
                "Speed alert"
            )
        })),
        &["speed-filter"],
    )?;
    b.add_sink("speed-alerts-sink", topics::SPEED_ALERTS, &["speed-alert-log"])?;

    let enrich_reference = reference.clone();
    b.add_processor(
        "route-enrichment",
        ProcessorNode::new(supplier(move || {
            EnrichmentProcessor::new(enrich_reference.clone(), threshold)
        })),
        &["location-source"],
    )?;
    b.add_sink(
        "enriched-location-sink",
        topics::LOCATION_ENRICHED,
        &["route-enrichment"],
    )?;

    // Occupancy: routeId -> matatuId -> routeId
    b.add_processor(
        "key-by-matatu",
        ProcessorNode::new(select_key(|_, e: &LocationEvent| e.matatu_id.clone()))
            .rekeys("matatuId"),
        &["location-source"],
    )?;
    let by_matatu = b.add_repartition("location-by-matatu", "matatuId", "key-by-matatu")?;

    b.add_processor(
        "matatu-delta-processor",
        ProcessorNode::new(supplier(|| DeltaProcessor::new(MATATU_SNAPSHOT_STORE)))
            .with_stores(&[MATATU_SNAPSHOT_STORE])
            .requires_key("matatuId"),
        &[by_matatu.as_str()],
    )?;
    b.add_processor(
        "key-by-route",
        ProcessorNode::new(select_key(|_, d: &DeltaEvent| d.route_id.clone())).rekeys("routeId"),
        &["matatu-delta-processor"],
    )?;
    let by_route = b.add_repartition("deltas-by-route", "routeId", "key-by-route")?;

    b.add_processor(
        "route-occupancy-aggregator",
        ProcessorNode::new(supplier(|| {
            RouteAggregator::<RouteOccupancy>::new(ROUTE_OCCUPANCY_STORE)
        }))
        .with_stores(&[ROUTE_OCCUPANCY_STORE])
        .requires_key("routeId"),
        &[by_route.as_str()],
    )?;
    b.add_processor(
        "occupancy-log",
        ProcessorNode::new(peek(|route_id, o: &RouteOccupancy| {
            info!(
                route_id,
                on_board = o.current_passengers,
                boarded = o.total_boardings,
                alighted = o.total_alightings,
                "Route occupancy"
            )
        })),
        &["route-occupancy-aggregator"],
    )?;
    b.add_sink(
        "route-occupancy-sink",
        topics::ROUTE_OCCUPANCY,
        &["occupancy-log"],
    )?;

    b.add_processor(
        "passenger-count-aggregator",
        ProcessorNode::new(supplier(|| {
            RouteAggregator::<PassengerCount>::new(PASSENGER_COUNT_STORE)
        }))
        .with_stores(&[PASSENGER_COUNT_STORE])
        .requires_key("routeId"),
        &[by_route.as_str()],
    )?;
    b.add_sink(
        "passenger-counts-sink",
        topics::PASSENGER_COUNTS,
        &["passenger-count-aggregator"],
    )?;

    // Off-grid: shares the matatu-keyed stream with the delta processor
    let silence = settings.off_grid_silence_delta();
    let interval = settings.off_grid_check_interval;
    b.add_processor(
        "off-grid-detector",
        ProcessorNode::new(supplier(move || {
            OffGridDetector::new(MATATU_LAST_SEEN_STORE, silence, interval)
        }))
        .with_stores(&[MATATU_LAST_SEEN_STORE])
        .requires_key("matatuId"),
        &[by_matatu.as_str()],
    )?;
    b.add_sink(
        "offgrid-alerts-sink",
        topics::OFFGRID_ALERTS,
        &["off-grid-detector"],
    )?;
    Ok(())
}

fn add_fare_streams(
    b: &mut TopologyBuilder,
    settings: &Settings,
    reference: Arc<dyn ReferenceData>,
) -> Result<(), TopologyError> {
    b.add_source("fares-source", topics::FARES, "matatuId")?;

    b.add_processor(
        "fare-status-router",
        ProcessorNode::new(
            BranchBuilder::<FareEvent>::new()
                .branch("failed-fare-log", |f| f.status == PaymentStatus::Failed)
                .branch("successful-fare-log", |f| f.status == PaymentStatus::Success)
                .default_branch("pending-fare-log")
                .build(),
        ),
        &["fares-source"],
    )?;
    b.add_processor(
        "failed-fare-log",
        ProcessorNode::new(peek(|_, f: &FareEvent| {
            error!(
                txn = %f.transaction_id,
                matatu_id = %f.matatu_id,
                amount_kes = %f.amount_kes,
                method = ?f.payment_method,
                "Failed payment"
            )
        })),
        &["fare-status-router"],
    )?;
    b.add_sink(
        "failed-fares-sink",
        topics::FARES_FAILED,
        &["failed-fare-log"],
    )?;
    b.add_processor(
        "successful-fare-log",
        ProcessorNode::new(peek(|_, f: &FareEvent| {
            info!(
                txn = %f.transaction_id,
                matatu_id = %f.matatu_id,
                amount_kes = %f.amount_kes,
                method = ?f.payment_method,
                "Successful payment"
            )
        })),
        &["fare-status-router"],
    )?;
    b.add_processor(
        "pending-fare-log",
        ProcessorNode::new(peek(|_, f: &FareEvent| {
            warn!(txn = %f.transaction_id, matatu_id = %f.matatu_id, "Pending payment")
        })),
        &["fare-status-router"],
    )?;

    b.add_processor(
        "key-by-sacco",
        ProcessorNode::new(supplier(move || SaccoKeySelector::new(reference.clone())))
            .rekeys("saccoId"),
        &["fares-source"],
    )?;
    let by_sacco = b.add_repartition("fares-by-sacco", "saccoId", "key-by-sacco")?;

    let windows = TumblingWindows::of(settings.window_size_delta())
        .with_grace(settings.window_grace_delta());
    b.add_processor(
        "sacco-revenue-aggregator",
        ProcessorNode::new(supplier(move || {
            WindowedAggregator::new(SACCO_REVENUE_STORE, windows, SaccoRevenue)
        }))
        .with_stores(&[SACCO_REVENUE_STORE])
        .requires_key("saccoId"),
        &[by_sacco.as_str()],
    )?;
    b.add_sink(
        "sacco-revenue-sink",
        topics::SACCO_REVENUE,
        &["sacco-revenue-aggregator"],
    )?;
    Ok(())
}
