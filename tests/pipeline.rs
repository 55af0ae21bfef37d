use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

use matatu_streams::config::Settings;
use matatu_streams::engine::{
    CheckpointDir, Clock, ManualClock, ProcessorNode, RuntimeConfig, StreamsRuntime, SystemClock,
    TaskId, Topology, TopologyBuilder, select_key, supplier,
};
use matatu_streams::error::{LogError, TopologyError};
use matatu_streams::log::{
    EventLog, InMemoryLog, ProducerRecord, Record, RecordMetadata, partition_for,
};
use matatu_streams::model::{
    FareEvent, LocationEvent, MatatuSnapshot, OffGridAlert, PassengerCount, PaymentMethod,
    PaymentStatus, RouteOccupancy, SaccoInfo, SaccoRevenueWindow,
};
use matatu_streams::producer::EventProducer;
use matatu_streams::reference::{ReferenceData, StaticReferenceData};
use matatu_streams::streams::{DeltaProcessor, MATATU_SNAPSHOT_STORE, build_topology};
use matatu_streams::topics;

const DRAIN: Duration = Duration::from_secs(10);

fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
}

fn settings() -> Settings {
    Settings {
        commit_interval: Duration::from_millis(20),
        ..Settings::default()
    }
}

fn runtime_config(state_dir: Option<PathBuf>) -> RuntimeConfig {
    RuntimeConfig {
        state_dir,
        ..settings().runtime_config()
    }
}

fn reference() -> Arc<dyn ReferenceData> {
    let mut data = StaticReferenceData::nairobi();
    data.insert_route("R1", SaccoInfo::new("S1", "Test Sacco", "CBD"));
    data.insert_matatu("M1", "R1");
    Arc::new(data)
}

fn topology() -> Arc<Topology> {
    Arc::new(build_topology(&settings(), reference()).unwrap())
}

async fn start(
    log: &Arc<InMemoryLog>,
    topology: Arc<Topology>,
    config: RuntimeConfig,
    clock: Arc<dyn Clock>,
) -> StreamsRuntime {
    start_on(log.clone(), topology, config, clock).await
}

async fn start_on(
    log: Arc<dyn EventLog>,
    topology: Arc<Topology>,
    config: RuntimeConfig,
    clock: Arc<dyn Clock>,
) -> StreamsRuntime {
    StreamsRuntime::start(topology, log, config, clock)
        .await
        .unwrap()
}

/// Rejects writes to the delta task's output topics while `failing` is set.
struct FlakyLog {
    inner: Arc<InMemoryLog>,
    failing: AtomicBool,
    rejected: AtomicUsize,
}

impl FlakyLog {
    fn new(inner: Arc<InMemoryLog>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failing: AtomicBool::new(false),
            rejected: AtomicUsize::new(0),
        })
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn rejected(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }

    fn affected(topic: &str) -> bool {
        [
            "matatu-snapshot-store-changelog",
            "matatu-last-seen-store-changelog",
            "deltas-by-route",
        ]
        .iter()
        .any(|t| topic.contains(t))
    }
}

#[async_trait]
impl EventLog for FlakyLog {
    async fn create_topic(&self, topic: &str, partitions: u32) -> Result<(), LogError> {
        self.inner.create_topic(topic, partitions).await
    }

    async fn partition_count(&self, topic: &str) -> Result<u32, LogError> {
        self.inner.partition_count(topic).await
    }

    async fn list_topics(&self) -> Vec<(String, u32)> {
        self.inner.list_topics().await
    }

    async fn produce(&self, record: ProducerRecord) -> Result<RecordMetadata, LogError> {
        if self.failing.load(Ordering::SeqCst) && Self::affected(&record.topic) {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(LogError::Unavailable(format!("{} is down", record.topic)));
        }
        self.inner.produce(record).await
    }

    async fn fetch(
        &self,
        topic: &str,
        partition: u32,
        offset: u64,
        max: usize,
    ) -> Result<Vec<Record>, LogError> {
        self.inner.fetch(topic, partition, offset, max).await
    }

    async fn end_offset(&self, topic: &str, partition: u32) -> Result<u64, LogError> {
        self.inner.end_offset(topic, partition).await
    }

    async fn commit(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        offset: u64,
    ) -> Result<(), LogError> {
        self.inner.commit(group, topic, partition, offset).await
    }

    async fn committed(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
    ) -> Result<Option<u64>, LogError> {
        self.inner.committed(group, topic, partition).await
    }

    fn append_signal(&self) -> Arc<Notify> {
        self.inner.append_signal()
    }
}

async fn wait_for_rejections(log: &FlakyLog, count: usize) {
    let deadline = tokio::time::Instant::now() + DRAIN;
    while log.rejected() < count {
        assert!(tokio::time::Instant::now() < deadline, "writes were never attempted");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn occupancy_triple(o: &RouteOccupancy) -> (u64, u64, u64) {
    (o.current_passengers, o.total_boardings, o.total_alightings)
}

/// Partition of the matatu-keyed repartition topic that M1 lands on.
fn by_matatu_position() -> (String, u32) {
    let settings = settings();
    (
        topics::repartition(&settings.application_id, "location-by-matatu"),
        partition_for("M1", settings.partitions),
    )
}

fn location(matatu: &str, route: &str, passengers: u32, speed: f64, ts: DateTime<Utc>) -> LocationEvent {
    LocationEvent {
        matatu_id: matatu.to_string(),
        route_id: route.to_string(),
        route_name: format!("Route {route}"),
        latitude: -1.2921,
        longitude: 36.8219,
        speed_kmh: speed,
        passengers_onboard: passengers,
        timestamp: ts,
    }
}

fn fare(txn: &str, matatu: &str, amount: i64, status: PaymentStatus, ts: DateTime<Utc>) -> FareEvent {
    FareEvent {
        transaction_id: txn.to_string(),
        matatu_id: matatu.to_string(),
        passenger_id: "PAX-1".to_string(),
        amount_kes: Decimal::new(amount, 0),
        payment_method: PaymentMethod::Mpesa,
        status,
        timestamp: ts,
    }
}

async fn values<T: DeserializeOwned>(log: &InMemoryLog, topic: &str) -> Vec<T> {
    log.records(topic)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|r| r.value)
        .map(|v| serde_json::from_value(v).unwrap())
        .collect()
}

/// Polls `topic` until it holds at least `count` records or `timeout` passes.
async fn wait_for(log: &InMemoryLog, topic: &str, count: usize, timeout: Duration) -> usize {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let n = log.records(topic).await.unwrap().len();
        if n >= count || tokio::time::Instant::now() >= deadline {
            return n;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_route_occupancy_from_passenger_counts() {
    let log = Arc::new(InMemoryLog::new());
    let runtime = start(&log, topology(), runtime_config(None), Arc::new(SystemClock)).await;
    let producer = EventProducer::new(log.clone());

    producer.send_location(&location("M1", "R1", 10, 40.0, at(1_700_000_000))).await.unwrap();
    producer.send_location(&location("M1", "R1", 7, 40.0, at(1_700_000_003))).await.unwrap();
    assert!(runtime.drain(DRAIN).await.unwrap());

    let occupancy: Vec<RouteOccupancy> = values(&log, topics::ROUTE_OCCUPANCY).await;
    assert_eq!(occupancy.len(), 2);
    let first = &occupancy[0];
    assert_eq!(
        (first.current_passengers, first.total_boardings, first.total_alightings),
        (10, 10, 0)
    );
    let second = &occupancy[1];
    assert_eq!(second.route_id, "R1");
    assert_eq!(
        (second.current_passengers, second.total_boardings, second.total_alightings),
        (7, 10, 3)
    );

    let counts: Vec<PassengerCount> = values(&log, topics::PASSENGER_COUNTS).await;
    let last = counts.last().unwrap();
    assert_eq!(last.event_count, 2);
    assert_eq!(last.current_passengers, 7);

    let report = runtime.shutdown().await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.totals().lookup_misses, 0);
}

#[tokio::test]
async fn test_speed_alert_is_the_input_record() {
    let log = Arc::new(InMemoryLog::new());
    let runtime = start(&log, topology(), runtime_config(None), Arc::new(SystemClock)).await;
    let producer = EventProducer::new(log.clone());

    let fast = location("KBZ 123A", "route_33", 12, 95.0, at(1_700_000_000));
    let normal = location("KDA 456B", "route_33", 12, 60.0, at(1_700_000_000));
    producer.send_location(&fast).await.unwrap();
    producer.send_location(&normal).await.unwrap();
    assert!(runtime.drain(DRAIN).await.unwrap());

    let alerts: Vec<LocationEvent> = values(&log, topics::SPEED_ALERTS).await;
    assert_eq!(alerts, vec![fast]);

    let enriched = log.records(topics::LOCATION_ENRICHED).await.unwrap();
    assert_eq!(enriched.len(), 2);
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_only_failed_fares_reach_failed_topic() {
    let log = Arc::new(InMemoryLog::new());
    let runtime = start(&log, topology(), runtime_config(None), Arc::new(SystemClock)).await;
    let producer = EventProducer::new(log.clone());

    let ts = at(1_700_000_000);
    producer.send_fare(&fare("TXN-1", "KBZ 123A", 50, PaymentStatus::Success, ts)).await.unwrap();
    producer.send_fare(&fare("TXN-2", "KBZ 123A", 50, PaymentStatus::Failed, ts)).await.unwrap();
    producer.send_fare(&fare("TXN-3", "KCX 789C", 50, PaymentStatus::Pending, ts)).await.unwrap();
    assert!(runtime.drain(DRAIN).await.unwrap());

    let failed: Vec<FareEvent> = values(&log, topics::FARES_FAILED).await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].transaction_id, "TXN-2");
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_revenue_window_closes_after_grace() {
    let log = Arc::new(InMemoryLog::new());
    let runtime = start(&log, topology(), runtime_config(None), Arc::new(SystemClock)).await;
    let producer = EventProducer::new(log.clone());

    // 60s windows with 10s grace; `base` is window aligned
    let base = 1_700_000_040;
    let fares = [
        fare("TXN-1", "KBZ 123A", 50, PaymentStatus::Success, at(base + 5)),
        fare("TXN-2", "KDA 456B", 70, PaymentStatus::Success, at(base + 20)),
        fare("TXN-3", "KBZ 123A", 40, PaymentStatus::Failed, at(base + 30)),
    ];
    for f in &fares {
        producer.send_fare(f).await.unwrap();
    }
    assert!(runtime.drain(DRAIN).await.unwrap());
    assert!(log.records(topics::SACCO_REVENUE).await.unwrap().is_empty());

    // Stream time reaches end + grace
    producer
        .send_fare(&fare("TXN-4", "KBZ 123A", 60, PaymentStatus::Success, at(base + 75)))
        .await
        .unwrap();
    assert!(runtime.drain(DRAIN).await.unwrap());
    // Belongs to the closed window
    producer
        .send_fare(&fare("TXN-5", "KBZ 123A", 80, PaymentStatus::Success, at(base + 10)))
        .await
        .unwrap();
    assert!(runtime.drain(DRAIN).await.unwrap());

    let windows: Vec<SaccoRevenueWindow> = values(&log, topics::SACCO_REVENUE).await;
    assert_eq!(windows.len(), 1);
    let window = &windows[0];
    assert_eq!(window.sacco_id, "sacco_01");
    assert_eq!(window.sacco_name, "Citi Hoppa");
    assert_eq!(window.total_revenue_kes, Decimal::new(120, 0));
    assert_eq!(window.transaction_count, 2);
    assert_eq!(window.window_start, at(base));
    assert_eq!(window.window_end, at(base + 60));

    let report = runtime.shutdown().await.unwrap();
    assert_eq!(report.totals().late_drops, 1);
}

#[tokio::test]
async fn test_off_grid_alerts_once_per_silence() {
    let clock = Arc::new(ManualClock::new(at(1_700_000_000)));
    let log = Arc::new(InMemoryLog::new());
    let runtime = start(&log, topology(), runtime_config(None), clock.clone()).await;
    let producer = EventProducer::new(log.clone());

    producer.send_location(&location("M1", "R1", 5, 30.0, clock.now())).await.unwrap();
    assert!(runtime.drain(DRAIN).await.unwrap());

    clock.advance(TimeDelta::seconds(301));
    assert_eq!(wait_for(&log, topics::OFFGRID_ALERTS, 1, DRAIN).await, 1);

    // Still silent, but already alerted
    clock.advance(TimeDelta::seconds(20));
    assert_eq!(
        wait_for(&log, topics::OFFGRID_ALERTS, 2, Duration::from_millis(300)).await,
        1
    );

    // A new ping starts a new episode
    producer.send_location(&location("M1", "R1", 5, 30.0, clock.now())).await.unwrap();
    assert!(runtime.drain(DRAIN).await.unwrap());
    clock.advance(TimeDelta::seconds(301));
    assert_eq!(wait_for(&log, topics::OFFGRID_ALERTS, 2, DRAIN).await, 2);

    let alerts: Vec<OffGridAlert> = values(&log, topics::OFFGRID_ALERTS).await;
    for alert in &alerts {
        assert_eq!(alert.matatu_id, "M1");
        assert_eq!(alert.route_id, "R1");
        assert!(alert.silence_duration_ms >= 300_000);
    }
    assert_eq!(alerts[0].last_seen_at, at(1_700_000_000));

    runtime.shutdown().await.unwrap();
}

async fn restart_continues_counts(state_dir: Option<PathBuf>) {
    let log = Arc::new(InMemoryLog::new());
    let topology = topology();
    let producer = EventProducer::new(log.clone());

    let first = start(&log, topology.clone(), runtime_config(state_dir.clone()), Arc::new(SystemClock)).await;
    producer.send_location(&location("M1", "R1", 10, 40.0, at(1_700_000_000))).await.unwrap();
    assert!(first.drain(DRAIN).await.unwrap());
    first.shutdown().await.unwrap();

    let second = start(&log, topology, runtime_config(state_dir), Arc::new(SystemClock)).await;
    producer.send_location(&location("M1", "R1", 7, 40.0, at(1_700_000_003))).await.unwrap();
    assert!(second.drain(DRAIN).await.unwrap());
    let report = second.shutdown().await.unwrap();
    assert!(report.is_clean());

    // The first event is not reprocessed and the snapshot survived
    let occupancy: Vec<RouteOccupancy> = values(&log, topics::ROUTE_OCCUPANCY).await;
    assert_eq!(occupancy.len(), 2);
    let last = &occupancy[1];
    assert_eq!(
        (last.current_passengers, last.total_boardings, last.total_alightings),
        (7, 10, 3)
    );
}

#[tokio::test]
async fn test_restart_restores_from_changelog() {
    restart_continues_counts(None).await;
}

#[tokio::test]
async fn test_restart_restores_from_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    restart_continues_counts(Some(dir.path().to_path_buf())).await;

    let app_dir = dir.path().join(settings().application_id);
    let checkpoints = std::fs::read_dir(app_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".checkpoint.json.gz"))
        .count();
    assert!(checkpoints > 0);
}

#[tokio::test]
async fn test_occupancy_tracks_a_generated_run() {
    let log = Arc::new(InMemoryLog::new());
    let runtime = start(&log, topology(), runtime_config(None), Arc::new(SystemClock)).await;
    let producer = EventProducer::new(log.clone());

    let mut rng = StdRng::seed_from_u64(21);
    let mut last = [0u32, 0u32];
    let matatus = ["M1", "M2"];
    for i in 0..60 {
        let m = rng.gen_range(0..2usize);
        last[m] = rng.gen_range(0..=33u32);
        let event = location(matatus[m], "R1", last[m], 40.0, at(1_700_000_000 + i));
        producer.send_location(&event).await.unwrap();
    }
    assert!(runtime.drain(DRAIN).await.unwrap());

    let occupancy: Vec<RouteOccupancy> = values(&log, topics::ROUTE_OCCUPANCY).await;
    assert_eq!(occupancy.len(), 60);
    for row in &occupancy {
        // Every matatu starts empty, so the route never needs clamping
        assert_eq!(
            row.current_passengers as i64,
            row.total_boardings as i64 - row.total_alightings as i64
        );
    }
    let final_row = occupancy
        .iter()
        .max_by_key(|o| o.total_boardings + o.total_alightings)
        .unwrap();
    assert_eq!(final_row.current_passengers, u64::from(last[0] + last[1]));

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_writes_stall_the_partition() {
    let log = Arc::new(InMemoryLog::new());
    let flaky = FlakyLog::new(log.clone());
    let runtime = start_on(flaky.clone(), topology(), runtime_config(None), Arc::new(SystemClock)).await;
    let producer = EventProducer::new(log.clone());
    let group = settings().application_id;
    let (by_matatu, partition) = by_matatu_position();

    flaky.set_failing(true);
    producer.send_location(&location("M1", "R1", 10, 40.0, at(1_700_000_000))).await.unwrap();
    wait_for_rejections(&flaky, 3).await;

    // Retrying, not skipping: nothing downstream, position not committed
    assert!(!runtime.drain(Duration::from_millis(300)).await.unwrap());
    assert_eq!(log.end_offset(&by_matatu, partition).await.unwrap(), 1);
    assert_eq!(log.committed(&group, &by_matatu, partition).await.unwrap().unwrap_or(0), 0);
    assert!(log.records(topics::ROUTE_OCCUPANCY).await.unwrap().is_empty());

    flaky.set_failing(false);
    assert!(runtime.drain(DRAIN).await.unwrap());
    let occupancy: Vec<RouteOccupancy> = values(&log, topics::ROUTE_OCCUPANCY).await;
    assert_eq!(occupancy.iter().map(occupancy_triple).collect::<Vec<_>>(), vec![(10, 10, 0)]);
    assert_eq!(log.committed(&group, &by_matatu, partition).await.unwrap(), Some(1));

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unwritten_output_is_not_checkpointed() {
    let dir = tempfile::tempdir().unwrap();
    let config = runtime_config(Some(dir.path().to_path_buf()));
    let log = Arc::new(InMemoryLog::new());
    let flaky = FlakyLog::new(log.clone());
    let topology = topology();
    let producer = EventProducer::new(log.clone());
    let group = settings().application_id;
    let (by_matatu, partition) = by_matatu_position();

    let first = start_on(flaky.clone(), topology.clone(), config.clone(), Arc::new(SystemClock)).await;
    producer.send_location(&location("M1", "R1", 10, 40.0, at(1_700_000_000))).await.unwrap();
    assert!(first.drain(DRAIN).await.unwrap());

    // The delta for the second ping never reaches the log before shutdown
    flaky.set_failing(true);
    producer.send_location(&location("M1", "R1", 7, 40.0, at(1_700_000_003))).await.unwrap();
    wait_for_rejections(&flaky, 1).await;
    first.shutdown().await.unwrap();
    assert_eq!(log.committed(&group, &by_matatu, partition).await.unwrap(), Some(1));

    flaky.set_failing(false);
    let second = start_on(flaky.clone(), topology, config, Arc::new(SystemClock)).await;
    assert!(second.drain(DRAIN).await.unwrap());
    second.shutdown().await.unwrap();

    let occupancy: Vec<RouteOccupancy> = values(&log, topics::ROUTE_OCCUPANCY).await;
    assert_eq!(
        occupancy.iter().map(occupancy_triple).collect::<Vec<_>>(),
        vec![(10, 10, 0), (7, 10, 3)]
    );
}

#[tokio::test]
async fn test_checkpoint_ahead_of_changelog_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let config = runtime_config(Some(dir.path().to_path_buf()));
    let log = Arc::new(InMemoryLog::new());
    let topology = topology();
    let producer = EventProducer::new(log.clone());

    let first = start(&log, topology.clone(), config.clone(), Arc::new(SystemClock)).await;
    producer.send_location(&location("M1", "R1", 10, 40.0, at(1_700_000_000))).await.unwrap();
    assert!(first.drain(DRAIN).await.unwrap());
    first.shutdown().await.unwrap();

    // Claim a changelog position the log never reached, with a bogus count
    let sub_topology = topology
        .sub_topologies()
        .iter()
        .find(|s| s.stores.iter().any(|n| n == MATATU_SNAPSHOT_STORE))
        .unwrap()
        .id;
    let task = TaskId {
        sub_topology,
        partition: by_matatu_position().1,
    }
    .to_string();
    let checkpoints = CheckpointDir::new(dir.path(), &settings().application_id);
    let mut saved = checkpoints.read(&task).unwrap();
    let snapshot = saved.stores.get_mut(MATATU_SNAPSHOT_STORE).unwrap();
    snapshot.changelog_offset = 99;
    snapshot.entries.insert(
        "M1".to_string(),
        serde_json::to_value(MatatuSnapshot {
            matatu_id: "M1".to_string(),
            route_id: "R1".to_string(),
            last_passenger_count: 50,
            last_updated: at(1_700_000_000),
        })
        .unwrap(),
    );
    checkpoints.write(&saved).unwrap();

    let second = start(&log, topology, config, Arc::new(SystemClock)).await;
    producer.send_location(&location("M1", "R1", 7, 40.0, at(1_700_000_003))).await.unwrap();
    assert!(second.drain(DRAIN).await.unwrap());
    second.shutdown().await.unwrap();

    // Restored from the changelog: the previous count is 10, not 50
    let occupancy: Vec<RouteOccupancy> = values(&log, topics::ROUTE_OCCUPANCY).await;
    assert_eq!(occupancy_triple(occupancy.last().unwrap()), (7, 10, 3));
}

#[test]
fn test_stateful_processor_after_rekey_needs_repartition() {
    let mut b = TopologyBuilder::new("app");
    b.add_state_store(MATATU_SNAPSHOT_STORE).unwrap();
    b.add_source("location-source", topics::LOCATION, "routeId").unwrap();
    b.add_processor(
        "key-by-matatu",
        ProcessorNode::new(select_key(|_, e: &LocationEvent| e.matatu_id.clone())).rekeys("matatuId"),
        &["location-source"],
    )
    .unwrap();
    b.add_processor(
        "deltas",
        ProcessorNode::new(supplier(|| DeltaProcessor::new(MATATU_SNAPSHOT_STORE)))
            .with_stores(&[MATATU_SNAPSHOT_STORE])
            .requires_key("matatuId"),
        &["key-by-matatu"],
    )
    .unwrap();

    assert_eq!(
        b.build().unwrap_err(),
        TopologyError::MissingRepartition {
            processor: "deltas".to_string(),
            required: "matatuId".to_string(),
            upstream: "key-by-matatu".to_string(),
        }
    );
}
