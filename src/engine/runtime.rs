//! Runs a [`Topology`] against an [`EventLog`].
//!
//! Partition `p` of every sub-topology is owned by worker `p % workers`
//! for the lifetime of the runtime, and each worker is a single tokio task.
//! A worker restores its tasks' stores, then loops: fetch and process
//! records, fire due punctuators, flush output, commit positions. Nothing
//! else touches a task, so stores need no locking.
//!
//! Output is always written before the consumed position is committed. A
//! failed write is retried with exponential backoff and the partition stalls
//! until it succeeds.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::checkpoint::CheckpointDir;
use super::clock::Clock;
use super::metrics::TaskMetrics;
use super::task::{StreamTask, TaskId};
use super::topology::Topology;
use crate::error::{EngineError, LogError, Result, StoreError};
use crate::log::{EventLog, ProducerRecord};

const RESTORE_BATCH: usize = 1000;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub partitions: u32,
    /// Number of workers, clamped to `1..=partitions`
    pub concurrency: usize,
    pub poll_batch: usize,
    pub commit_interval: Duration,
    /// Directory for task checkpoints; `None` restores from changelogs only
    pub state_dir: Option<PathBuf>,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            partitions: 3,
            concurrency: 3,
            poll_batch: 500,
            commit_interval: Duration::from_secs(1),
            state_dir: None,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RuntimeConfig {
    pub fn workers(&self) -> usize {
        self.concurrency.clamp(1, self.partitions.max(1) as usize)
    }
}

/// A task that stopped because of an unrecoverable error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub task: TaskId,
    pub reason: String,
}

/// What the runtime did, collected at shutdown.
#[derive(Debug, Clone, Default)]
pub struct RuntimeReport {
    pub tasks: BTreeMap<TaskId, TaskMetrics>,
    pub failures: Vec<TaskFailure>,
}

impl RuntimeReport {
    pub fn totals(&self) -> TaskMetrics {
        let mut totals = TaskMetrics::default();
        for metrics in self.tasks.values() {
            totals += *metrics;
        }
        totals
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

type SharedMetrics = Arc<Mutex<BTreeMap<TaskId, TaskMetrics>>>;

struct WorkerContext {
    id: usize,
    topology: Arc<Topology>,
    log: Arc<dyn EventLog>,
    clock: Arc<dyn Clock>,
    config: RuntimeConfig,
    checkpoints: Option<CheckpointDir>,
    metrics: SharedMetrics,
    shutdown: watch::Receiver<bool>,
}

struct WorkerTask {
    task: StreamTask,
    committed: BTreeMap<String, u64>,
    failed: Option<String>,
}

pub struct StreamsRuntime {
    topology: Arc<Topology>,
    log: Arc<dyn EventLog>,
    config: RuntimeConfig,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<Vec<TaskFailure>>>,
    metrics: SharedMetrics,
}

impl StreamsRuntime {
    /// Creates every topic the topology touches and starts the workers.
    #[tracing::instrument(skip_all, fields(application = %topology.application_id()))]
    pub async fn start(
        topology: Arc<Topology>,
        log: Arc<dyn EventLog>,
        config: RuntimeConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let partitions = config.partitions;
        if partitions == 0 {
            return Err(crate::error::ConfigError::Zero { name: "partitions" }.into());
        }

        let mut topics = topology.external_source_topics();
        topics.extend(topology.internal_topics());
        topics.extend(topology.sink_topics());
        topics.sort();
        topics.dedup();
        for topic in &topics {
            log.create_topic(topic, partitions).await?;
        }

        let workers = config.workers();
        let checkpoints = config
            .state_dir
            .as_ref()
            .map(|dir| CheckpointDir::new(dir, topology.application_id()));

        let mut assigned: Vec<Vec<StreamTask>> = (0..workers).map(|_| Vec::new()).collect();
        for sub in topology.sub_topologies() {
            for partition in 0..partitions {
                let task = StreamTask::new(&topology, sub.id, partition)?;
                assigned[partition as usize % workers].push(task);
            }
        }

        info!(
            partitions,
            workers,
            sub_topologies = topology.sub_topologies().len(),
            topics = topics.len(),
            "Starting streams runtime"
        );

        let (shutdown, receiver) = watch::channel(false);
        let metrics: SharedMetrics = Arc::new(Mutex::new(BTreeMap::new()));
        let mut handles = Vec::with_capacity(workers);
        for (id, tasks) in assigned.into_iter().enumerate() {
            let ctx = WorkerContext {
                id,
                topology: topology.clone(),
                log: log.clone(),
                clock: clock.clone(),
                config: config.clone(),
                checkpoints: checkpoints.clone(),
                metrics: metrics.clone(),
                shutdown: receiver.clone(),
            };
            let span = info_span!("worker", worker = id);
            handles.push(tokio::spawn(run_worker(ctx, tasks).instrument(span)));
        }

        Ok(Self {
            topology,
            log,
            config,
            shutdown,
            workers: handles,
            metrics,
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Latest per-task counters published by the workers.
    pub async fn metrics(&self) -> BTreeMap<TaskId, TaskMetrics> {
        self.metrics.lock().await.clone()
    }

    /// Waits until every source partition (input and repartition topics) is
    /// committed up to its end offset. Returns `false` on timeout.
    pub async fn drain(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut previous: Option<Vec<(String, u32, u64)>> = None;
        loop {
            let (ends, settled) = self.source_positions().await?;
            if settled && previous.as_ref() == Some(&ends) {
                return Ok(true);
            }
            previous = settled.then_some(ends);
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Stops pulling records, flushes and commits what was processed, writes
    /// checkpoints, and reports per-task metrics and failures.
    pub async fn shutdown(self) -> Result<RuntimeReport> {
        info!("Shutting down streams runtime");
        let _ = self.shutdown.send(true);

        let mut failures = Vec::new();
        for (worker, handle) in self.workers.into_iter().enumerate() {
            match handle.await {
                Ok(mut failed) => failures.append(&mut failed),
                Err(e) => {
                    return Err(EngineError::WorkerFailed {
                        worker,
                        reason: e.to_string(),
                    });
                }
            }
        }

        let tasks = self.metrics.lock().await.clone();
        let report = RuntimeReport { tasks, failures };
        let totals = report.totals();
        info!(
            processed = totals.records_processed,
            produced = totals.records_produced,
            changelog_writes = totals.changelog_writes,
            late_drops = totals.late_drops,
            lookup_misses = totals.lookup_misses,
            punctuations = totals.punctuations,
            failed_tasks = report.failures.len(),
            "Streams runtime stopped"
        );
        for failure in &report.failures {
            error!(task = %failure.task, reason = %failure.reason, "Task halted");
        }
        Ok(report)
    }

    async fn source_positions(&self) -> Result<(Vec<(String, u32, u64)>, bool)> {
        let group = self.topology.application_id();
        let mut ends = Vec::new();
        let mut settled = true;
        for sub in self.topology.sub_topologies() {
            for topic in &sub.source_topics {
                for partition in 0..self.config.partitions {
                    let end = self.log.end_offset(topic, partition).await?;
                    let committed = self.log.committed(group, topic, partition).await?;
                    if committed.unwrap_or(0) < end {
                        settled = false;
                    }
                    ends.push((topic.clone(), partition, end));
                }
            }
        }
        Ok((ends, settled))
    }
}

async fn run_worker(mut ctx: WorkerContext, tasks: Vec<StreamTask>) -> Vec<TaskFailure> {
    let mut tasks: Vec<WorkerTask> = tasks
        .into_iter()
        .map(|task| WorkerTask {
            task,
            committed: BTreeMap::new(),
            failed: None,
        })
        .collect();

    for entry in &mut tasks {
        let restored = restore(&ctx, &mut entry.task).await;
        let init = restored.and_then(|_| entry.task.init(ctx.clock.now()));
        if let Err(e) = init {
            halt(entry, &e);
        }
        entry.committed = entry.task.positions().clone();
    }
    debug!(worker = ctx.id, tasks = tasks.len(), "Worker ready");

    let signal = ctx.log.append_signal();
    let mut last_commit = Instant::now();
    loop {
        if *ctx.shutdown.borrow() {
            break;
        }
        let notified = signal.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let mut fetched = 0;
        for entry in tasks.iter_mut().filter(|t| t.failed.is_none()) {
            match poll_task(&ctx, &mut entry.task).await {
                Ok(n) => fetched += n,
                Err(e) => {
                    halt(entry, &e);
                    continue;
                }
            }
            if let Err(e) = flush(&mut ctx, &mut entry.task).await {
                warn!(task = %entry.task.id(), error = %e, "Flush interrupted by shutdown");
            }
        }

        let idle = fetched == 0;
        if idle || last_commit.elapsed() >= ctx.config.commit_interval {
            for entry in tasks.iter_mut().filter(|t| t.failed.is_none()) {
                commit(&ctx, entry).await;
            }
            last_commit = Instant::now();
        }
        let snapshot = snapshot(&tasks);
        publish_metrics(&ctx.metrics, snapshot).await;

        if !idle {
            tokio::task::yield_now().await;
            continue;
        }

        let wait = next_wake(&ctx, &tasks);
        tokio::select! {
            _ = &mut notified => {}
            _ = tokio::time::sleep(wait) => {}
            changed = ctx.shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    for entry in tasks.iter_mut().filter(|t| t.failed.is_none()) {
        if entry.task.has_output() {
            // Stores hold mutations the changelog never received; restore
            // must replay the changelog and reprocess from the committed position.
            warn!(task = %entry.task.id(), "Stopping with unwritten output, discarding checkpoint");
            if let Some(checkpoints) = &ctx.checkpoints {
                checkpoints.remove(&entry.task.id().to_string());
            }
            continue;
        }
        commit(&ctx, entry).await;
        if let Err(e) = write_checkpoint(&ctx, &mut entry.task).await {
            warn!(task = %entry.task.id(), error = %e, "Failed to write checkpoint");
        }
    }
    let snapshot = snapshot(&tasks);
    publish_metrics(&ctx.metrics, snapshot).await;

    tasks
        .into_iter()
        .filter_map(|entry| {
            entry.failed.map(|reason| TaskFailure {
                task: entry.task.id(),
                reason,
            })
        })
        .collect()
}

fn halt(entry: &mut WorkerTask, e: &EngineError) {
    error!(task = %entry.task.id(), error = %e, "Task failed, halting its partition");
    entry.failed = Some(e.to_string());
}

fn next_wake(ctx: &WorkerContext, tasks: &[WorkerTask]) -> Duration {
    let now = ctx.clock.now();
    tasks
        .iter()
        .filter(|t| t.failed.is_none())
        .filter_map(|t| t.task.next_punctuation())
        .min()
        .map(|due| until(now, due))
        .unwrap_or(ctx.config.commit_interval)
        .min(ctx.config.commit_interval)
}

fn until(now: DateTime<Utc>, due: DateTime<Utc>) -> Duration {
    (due - now).to_std().unwrap_or(Duration::ZERO)
}

/// Processes up to `poll_batch` records per source topic, then fires due
/// punctuators. Returns the number of records fetched.
async fn poll_task(ctx: &WorkerContext, task: &mut StreamTask) -> Result<usize> {
    let partition = task.partition();
    let mut fetched = 0;
    for topic in task.source_topics() {
        let offset = task.position(&topic).unwrap_or(0);
        let records = ctx
            .log
            .fetch(&topic, partition, offset, ctx.config.poll_batch)
            .await?;
        fetched += records.len();
        for record in records {
            task.process(record, ctx.clock.now())?;
        }
    }

    let now = ctx.clock.now();
    if task.next_punctuation().is_some_and(|due| due <= now) {
        task.punctuate(now)?;
    }
    Ok(fetched)
}

/// Writes the task's buffered output, retrying each record until the log
/// accepts it. Gives up only when shutdown is requested.
async fn flush(ctx: &mut WorkerContext, task: &mut StreamTask) -> Result<()> {
    if !task.has_output() {
        return Ok(());
    }
    let mut records = task.take_output(ctx.clock.now()).into_iter();
    let mut count = 0;
    while let Some(record) = records.next() {
        if let Err(e) = produce_with_retry(ctx, &record).await {
            let mut unsent = vec![record];
            unsent.extend(records);
            task.requeue(unsent);
            return Err(e);
        }
        count += 1;
    }
    debug!(task = %task.id(), records = count, "Flushed output");
    Ok(())
}

async fn produce_with_retry(ctx: &mut WorkerContext, record: &ProducerRecord) -> Result<()> {
    let mut backoff = ctx.config.initial_backoff;
    let mut attempt = 1u32;
    loop {
        match ctx.log.produce(record.clone()).await {
            Ok(_) => return Ok(()),
            Err(e) => {
                warn!(
                    topic = %record.topic,
                    key = %record.key,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Write failed, retrying"
                );
                if *ctx.shutdown.borrow() {
                    return Err(e.into());
                }
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    changed = ctx.shutdown.changed() => {
                        if changed.is_err() {
                            return Err(e.into());
                        }
                    }
                }
                backoff = (backoff * 2).min(ctx.config.max_backoff);
                attempt += 1;
            }
        }
    }
}

async fn commit(ctx: &WorkerContext, entry: &mut WorkerTask) {
    if entry.task.has_output() {
        // Output that failed to flush must not be skipped over.
        return;
    }
    let group = ctx.topology.application_id();
    let partition = entry.task.partition();
    let positions = entry.task.positions().clone();
    for (topic, offset) in positions {
        if entry.committed.get(&topic) == Some(&offset) {
            continue;
        }
        match ctx.log.commit(group, &topic, partition, offset).await {
            Ok(()) => {
                entry.committed.insert(topic, offset);
            }
            Err(e) => warn!(topic = %topic, partition, error = %e, "Commit failed"),
        }
    }
}

fn snapshot(tasks: &[WorkerTask]) -> Vec<(TaskId, TaskMetrics)> {
    tasks
        .iter()
        .map(|entry| (entry.task.id(), entry.task.metrics()))
        .collect()
}

async fn publish_metrics(metrics: &SharedMetrics, snapshot: Vec<(TaskId, TaskMetrics)>) {
    metrics.lock().await.extend(snapshot);
}

/// Rebuilds the task's stores and positions.
///
/// Stores start from the task's checkpoint when one exists and is not ahead
/// of the changelog, and replay the changelog from there; otherwise they
/// replay it from the earliest offset. Source positions come from the
/// committed offsets of the application's consumer group.
#[tracing::instrument(skip_all, fields(task = %task.id()))]
async fn restore(ctx: &WorkerContext, task: &mut StreamTask) -> Result<()> {
    let partition = task.partition();
    let task_name = task.id().to_string();
    let checkpoint = ctx.checkpoints.as_ref().and_then(|c| c.read(&task_name));

    for name in task.store_names() {
        let Some(changelog) = ctx.topology.changelog_topic(&name).map(str::to_string) else {
            continue;
        };
        let end = ctx.log.end_offset(&changelog, partition).await?;
        let Some(store) = task.store_mut(&name) else {
            continue;
        };

        let mut offset = 0;
        match checkpoint.as_ref().and_then(|c| c.stores.get(&name)) {
            Some(saved) if saved.changelog_offset <= end => {
                store.load_snapshot(saved.entries.clone());
                offset = saved.changelog_offset;
            }
            Some(saved) => {
                warn!(
                    store = %name,
                    checkpoint_offset = saved.changelog_offset,
                    changelog_end = end,
                    "Checkpoint is ahead of the changelog, replaying from the start"
                );
            }
            None => {}
        }

        let from = offset;
        while offset < end {
            let records = ctx
                .log
                .fetch(&changelog, partition, offset, RESTORE_BATCH)
                .await
                .map_err(|e| restore_failed(&name, partition, &e))?;
            if records.is_empty() {
                return Err(StoreError::RestoreFailed {
                    store: name,
                    partition,
                    reason: format!("changelog ended at {offset}, expected {end}"),
                }
                .into());
            }
            for record in &records {
                store.restore(record);
            }
            offset += records.len() as u64;
        }
        debug!(store = %name, from, to = end, entries = store.len(), "Restored store");
    }

    let group = ctx.topology.application_id();
    for topic in task.source_topics() {
        let committed = ctx.log.committed(group, &topic, partition).await?;
        task.set_position(&topic, committed.unwrap_or(0));
    }
    Ok(())
}

fn restore_failed(store: &str, partition: u32, e: &LogError) -> StoreError {
    StoreError::RestoreFailed {
        store: store.to_string(),
        partition,
        reason: e.to_string(),
    }
}

async fn write_checkpoint(ctx: &WorkerContext, task: &mut StreamTask) -> Result<()> {
    let Some(checkpoints) = &ctx.checkpoints else {
        return Ok(());
    };
    if task.store_names().is_empty() {
        return Ok(());
    }
    let mut offsets = BTreeMap::new();
    for name in task.store_names() {
        if let Some(changelog) = ctx.topology.changelog_topic(&name) {
            let end = ctx.log.end_offset(changelog, task.partition()).await?;
            offsets.insert(name, end);
        }
    }
    checkpoints.write(&task.checkpoint(&offsets, ctx.clock.now()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workers_clamped_to_partitions() {
        let config = RuntimeConfig {
            partitions: 3,
            concurrency: 8,
            ..RuntimeConfig::default()
        };
        assert_eq!(config.workers(), 3);

        let config = RuntimeConfig {
            concurrency: 0,
            ..config
        };
        assert_eq!(config.workers(), 1);
    }

    #[test]
    fn test_until_never_negative() {
        let now = Utc::now();
        assert_eq!(until(now, now - chrono::Duration::seconds(5)), Duration::ZERO);
        assert_eq!(
            until(now, now + chrono::Duration::seconds(2)),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_report_totals() {
        let mut report = RuntimeReport::default();
        let id = |p| TaskId {
            sub_topology: 0,
            partition: p,
        };
        report.tasks.insert(
            id(0),
            TaskMetrics {
                records_processed: 2,
                late_drops: 1,
                ..TaskMetrics::default()
            },
        );
        report.tasks.insert(
            id(1),
            TaskMetrics {
                records_processed: 3,
                ..TaskMetrics::default()
            },
        );
        let totals = report.totals();
        assert_eq!(totals.records_processed, 5);
        assert_eq!(totals.late_drops, 1);
        assert!(report.is_clean());
    }
}
