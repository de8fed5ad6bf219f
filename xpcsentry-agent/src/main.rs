#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use xpcsentry_agent::{
    ConnectionEventSource, ConnectionPipeline, EsloggerSource, FileSink, RecordSink, ReplaySource,
    StdoutSink, Subscription,
};
use xpcsentry_lib::config::{ConfigLoader, OutputFormat};
use xpcsentry_lib::telemetry;

#[derive(Parser)]
#[command(name = "xpcsentry-agent")]
#[command(about = "Flags XPC connections whose client does not match the endpoint owner")]
#[command(version)]
struct Cli {
    /// Replay a saved eslogger capture instead of capturing live
    #[arg(long, value_name = "FILE")]
    replay: Option<PathBuf>,

    /// Record output format (human or json)
    #[arg(short, long, value_name = "FORMAT")]
    format: Option<String>,

    /// Log level
    #[arg(short, long)]
    log_level: Option<String>,

    /// Capacity of the channel between event source and pipeline
    #[arg(long, value_name = "N")]
    channel_capacity: Option<usize>,

    /// Append JSON records to this file
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Configuration file merged above the system and user files
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut loader = ConfigLoader::new("xpcsentry-agent");
    if let Some(path) = &cli.config {
        loader = loader.with_file(path);
    }
    let mut config = loader.load().context("failed to load configuration")?;

    if let Some(format) = &cli.format {
        config.agent.output_format = format.parse::<OutputFormat>()?;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(capacity) = cli.channel_capacity {
        config.agent.channel_capacity = capacity;
    }
    if let Some(output) = cli.output {
        config.agent.output_file = Some(output);
    }
    ConfigLoader::validate_config(&config)?;

    telemetry::init_tracing(&config.logging)?;

    let mut sinks: Vec<Box<dyn RecordSink>> = vec![Box::new(StdoutSink::new(config.agent.output_format))];
    if let Some(path) = &config.agent.output_file {
        let sink = FileSink::open(path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        sinks.push(Box::new(sink));
    }

    let source: Arc<dyn ConnectionEventSource> = match &cli.replay {
        Some(path) => Arc::new(ReplaySource::new(path)),
        None => Arc::new(EsloggerSource::new(&config.agent.eslogger_path)),
    };
    let subscription = Subscription::from(&config.agent);
    let pipeline = Arc::new(ConnectionPipeline::from_config(&config));
    let (tx, rx) = mpsc::channel(config.agent.channel_capacity);

    info!(
        source = source.name(),
        kinds = ?subscription.event_kinds(),
        channel_capacity = config.agent.channel_capacity,
        format = %config.agent.output_format,
        "xpcsentry-agent started"
    );

    let pipeline_task = tokio::spawn({
        let pipeline = Arc::clone(&pipeline);
        async move { pipeline.run(rx, &sinks).await }
    });
    let mut source_task = tokio::spawn({
        let source = Arc::clone(&source);
        async move { source.subscribe(&subscription, tx).await }
    });

    let source_result = tokio::select! {
        result = &mut source_task => result,
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received; stopping event source");
            if let Err(e) = source.stop().await {
                warn!(error = %e, "Event source did not stop cleanly");
            }
            source_task.await
        }
    };

    let produced = pipeline_task.await.context("pipeline task panicked")?;

    let health = pipeline.health_check();
    info!(
        status = %health.status,
        produced,
        details = ?health.details,
        "xpcsentry-agent health summary"
    );

    source_result
        .context("event source task panicked")?
        .with_context(|| format!("event source {} failed", source.name()))?;
    Ok(())
}
