//! CLI entry point for the matatu streams pipeline.
//!
//! Provides subcommands for running the topology live against the fleet
//! simulator, replaying a file of recorded events, and listing topics.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use matatu_streams::{
    config::Settings,
    engine::{StreamsRuntime, SystemClock, Topology},
    log::InMemoryLog,
    output::{OutputFormat, RunSummary, append_record, write_topic},
    producer::{EventProducer, IngestEvent},
    reference::{ReferenceData, StaticReferenceData},
    simulator,
    streams::build_topology,
    topics,
};
use std::ffi::OsStr;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "matatu_streams")]
#[command(about = "Real-time matatu fleet tracking on a partitioned stream engine", long_about = None)]
struct Cli {
    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Commands,
}

/// Overrides for settings otherwise taken from `MATATU_*` variables.
#[derive(Args)]
struct Overrides {
    /// Application id, used as consumer group and internal topic prefix
    #[arg(long, global = true)]
    application_id: Option<String>,

    /// Partitions per topic
    #[arg(short, long, global = true)]
    partitions: Option<u32>,

    /// Worker count (clamped to the partition count)
    #[arg(short, long, global = true)]
    concurrency: Option<usize>,

    /// Directory for task checkpoints
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Speed above which a location event raises an alert
    #[arg(long, global = true)]
    speed_threshold_kmh: Option<f64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the topology, optionally fed by the fleet simulator
    Run {
        /// Feed the input topics from the simulated fleet
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        simulate: bool,

        /// Stop after this many seconds instead of waiting for Ctrl+C
        #[arg(long)]
        duration_secs: Option<u64>,

        /// Directory the output topics are written to on shutdown
        #[arg(short, long, default_value = "output")]
        output_dir: PathBuf,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Csv)]
        format: OutputFormat,
    },
    /// Ingest newline-delimited JSON events and process them to completion
    Replay {
        /// File with one {"type":"location"|"fare",...} event per line
        #[arg(value_name = "FILE")]
        file: PathBuf,

        #[arg(short, long, default_value = "output")]
        output_dir: PathBuf,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Csv)]
        format: OutputFormat,

        /// Give up waiting for the topology to catch up after this long
        #[arg(long, default_value_t = 60)]
        drain_timeout_secs: u64,
    },
    /// List every topic the topology reads or writes
    Topics,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/matatu_streams.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("matatu_streams.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();
    let settings = settings(cli.overrides)?;
    let reference = reference_data(&settings)?;
    let topology = Arc::new(build_topology(&settings, reference)?);

    match cli.command {
        Commands::Run {
            simulate,
            duration_secs,
            output_dir,
            format,
        } => {
            run(
                &settings,
                topology,
                simulate,
                duration_secs.map(Duration::from_secs),
                &output_dir,
                format,
            )
            .await?;
        }
        Commands::Replay {
            file,
            output_dir,
            format,
            drain_timeout_secs,
        } => {
            replay(
                &settings,
                topology,
                &file,
                &output_dir,
                format,
                Duration::from_secs(drain_timeout_secs),
            )
            .await?;
        }
        Commands::Topics => list_topics(&settings, &topology),
    }

    Ok(())
}

fn settings(overrides: Overrides) -> Result<Settings> {
    let mut settings = Settings::from_env()?;
    if let Some(id) = overrides.application_id {
        settings.application_id = id;
    }
    if let Some(partitions) = overrides.partitions {
        settings.partitions = partitions;
        if overrides.concurrency.is_none() {
            settings.concurrency = partitions as usize;
        }
    }
    if let Some(concurrency) = overrides.concurrency {
        settings.concurrency = concurrency;
    }
    if let Some(dir) = overrides.state_dir {
        settings.state_dir = dir;
    }
    if let Some(threshold) = overrides.speed_threshold_kmh {
        settings.speed_threshold_kmh = threshold;
    }
    settings.validate()?;
    Ok(settings)
}

/// Built-in Nairobi tables, extended by the CSV files named in the settings.
fn reference_data(settings: &Settings) -> Result<Arc<dyn ReferenceData>> {
    let mut data = StaticReferenceData::nairobi();
    if let Some(path) = &settings.routes_file {
        data.load_routes(path)
            .with_context(|| format!("loading routes from {}", path.display()))?;
    }
    if let Some(path) = &settings.fleet_file {
        data.load_fleet(path)
            .with_context(|| format!("loading fleet from {}", path.display()))?;
    }
    info!(
        routes = data.route_count(),
        matatus = data.fleet_size(),
        "Reference data ready"
    );
    Ok(Arc::new(data))
}

/// Runs the topology until Ctrl+C or the optional deadline.
#[tracing::instrument(skip(settings, topology, output_dir), fields(application = %settings.application_id))]
async fn run(
    settings: &Settings,
    topology: Arc<Topology>,
    simulate: bool,
    duration: Option<Duration>,
    output_dir: &Path,
    format: OutputFormat,
) -> Result<()> {
    let log = Arc::new(InMemoryLog::new());
    let runtime = StreamsRuntime::start(
        topology,
        log.clone(),
        settings.runtime_config(),
        Arc::new(SystemClock),
    )
    .await?;

    let (stop, stopped) = watch::channel(false);
    let simulator = if simulate {
        let producer = EventProducer::new(log.clone());
        Some(tokio::spawn(simulator::run(producer, stopped)))
    } else {
        info!("Simulator disabled, waiting for events");
        None
    };

    match duration {
        Some(duration) => {
            info!(secs = duration.as_secs(), "Running for a fixed duration. Press Ctrl+C to stop early.");
            tokio::select! {
                _ = tokio::time::sleep(duration) => {}
                signal = tokio::signal::ctrl_c() => signal?,
            }
        }
        None => {
            info!("Running. Press Ctrl+C to stop.");
            tokio::signal::ctrl_c().await?;
        }
    }

    let _ = stop.send(true);
    if let Some(handle) = simulator {
        if let Err(e) = handle.await {
            error!(error = %e, "Simulator task panicked");
        }
    }

    let report = runtime.shutdown().await?;
    dump_outputs(&log, output_dir, format).await?;
    append_record(
        &output_dir.join("runs.csv"),
        &RunSummary::from_report("run", &report, Utc::now()),
    )?;
    Ok(())
}

/// Ingests a recorded event file and processes it to completion.
#[tracing::instrument(skip(settings, topology, file, output_dir), fields(file = %file.display()))]
async fn replay(
    settings: &Settings,
    topology: Arc<Topology>,
    file: &Path,
    output_dir: &Path,
    format: OutputFormat,
    drain_timeout: Duration,
) -> Result<()> {
    let reader = BufReader::new(
        File::open(file).with_context(|| format!("opening {}", file.display()))?,
    );

    let log = Arc::new(InMemoryLog::new());
    let runtime = StreamsRuntime::start(
        topology,
        log.clone(),
        settings.runtime_config(),
        Arc::new(SystemClock),
    )
    .await?;
    let producer = EventProducer::new(log.clone());

    let mut sent = 0;
    let mut rejected = 0;
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event: IngestEvent = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}", file.display(), index + 1))?;
        match producer.send(&event).await {
            Ok(_) => sent += 1,
            Err(e) => {
                warn!(line = index + 1, error = %e, "Rejected event");
                rejected += 1;
            }
        }
    }
    info!(sent, rejected, "Replay file ingested");

    if !runtime.drain(drain_timeout).await? {
        warn!(
            timeout_secs = drain_timeout.as_secs(),
            "Topology did not catch up before the drain timeout"
        );
    }

    let report = runtime.shutdown().await?;
    dump_outputs(&log, output_dir, format).await?;
    append_record(
        &output_dir.join("runs.csv"),
        &RunSummary::from_report("replay", &report, Utc::now()),
    )?;
    if !report.is_clean() {
        anyhow::bail!("{} task(s) halted during replay", report.failures.len());
    }
    Ok(())
}

async fn dump_outputs(log: &InMemoryLog, dir: &Path, format: OutputFormat) -> Result<()> {
    for topic in topics::OUTPUTS {
        let records = log.records(topic).await?;
        write_topic(&records, topic, dir, format)?;
    }
    info!(dir = %dir.display(), "Output topics written");
    Ok(())
}

fn list_topics(settings: &Settings, topology: &Topology) {
    let partitions = settings.partitions;
    for topic in topics::INPUTS {
        info!(topic, partitions, kind = "input", "Topic");
    }
    for topic in topics::OUTPUTS {
        info!(topic, partitions, kind = "output", "Topic");
    }
    for topic in topology.internal_topics() {
        info!(topic = %topic, partitions, kind = "internal", "Topic");
    }
    info!(
        inputs = topics::INPUTS.len(),
        outputs = topics::OUTPUTS.len(),
        internal = topology.internal_topics().len(),
        sub_topologies = topology.sub_topologies().len(),
        "Topic catalogue"
    );
}
