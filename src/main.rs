//! splitfec CLI
//!
//! Inserts content into an in-memory block network with configurable loss,
//! then fetches it back through the getter and checks the result.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          splitfec                               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │  Splitfile   │───▶│  In-memory   │───▶│    Client    │       │
//! │  │  Inserter    │    │   Network    │    │    Getter    │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use splitfec::adapters::{BundleExtractor, InMemoryNetwork, LoggingEventPublisher};
use splitfec::fec::{SegmentLayout, SegmentLimits};
use splitfec::{
    ArchiveBucketCache, ClientConfig, ClientContext, ClientGetter, ClientMetrics, ClientUri,
    SplitfileInserter,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// splitfec - FEC splitfile engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Insert content into a lossy in-memory network and fetch it back
    Roundtrip {
        /// File to insert; random content is generated when omitted
        #[arg(long)]
        input: Option<PathBuf>,

        /// Size of generated content in bytes
        #[arg(long, default_value = "1048576")]
        size: usize,

        /// Probability that a block fetch reports data-not-found
        #[arg(long, env = "SPLITFEC_LOSS_RATE", default_value = "0.1")]
        loss_rate: f64,

        /// Probability that a block insert reports route-not-found
        #[arg(long, env = "SPLITFEC_PUT_LOSS_RATE", default_value = "0.0")]
        put_loss_rate: f64,

        /// Seed for generated content and simulated loss
        #[arg(long, env = "SPLITFEC_SEED")]
        seed: Option<u64>,

        /// YAML configuration file
        #[arg(long, env = "SPLITFEC_CONFIG")]
        config: Option<PathBuf>,

        /// Print Prometheus metrics when done
        #[arg(long)]
        metrics: bool,
    },

    /// Print the effective configuration and the segment layout of a size
    Info {
        /// YAML configuration file
        #[arg(long, env = "SPLITFEC_CONFIG")]
        config: Option<PathBuf>,

        /// Content size to lay out, in bytes
        #[arg(long, default_value = "1048576")]
        size: u64,
    },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    match args.command {
        Command::Roundtrip {
            input,
            size,
            loss_rate,
            put_loss_rate,
            seed,
            config,
            metrics,
        } => {
            let config = load_config(config.as_ref())?;
            let seed = seed.unwrap_or_else(rand::random);
            let content = match input {
                Some(path) => Bytes::from(
                    std::fs::read(&path)
                        .with_context(|| format!("reading {}", path.display()))?,
                ),
                None => generate(size, seed),
            };
            roundtrip(config, content, loss_rate, put_loss_rate, seed, metrics).await
        }
        Command::Info { config, size } => {
            let config = load_config(config.as_ref())?;
            info(&config, size)
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<ClientConfig> {
    match path {
        Some(path) => ClientConfig::load(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(ClientConfig::default()),
    }
}

fn generate(size: usize, seed: u64) -> Bytes {
    let mut data = vec![0u8; size];
    StdRng::seed_from_u64(seed).fill_bytes(&mut data);
    Bytes::from(data)
}

// =============================================================================
// Commands
// =============================================================================

async fn roundtrip(
    config: ClientConfig,
    content: Bytes,
    loss_rate: f64,
    put_loss_rate: f64,
    seed: u64,
    print_metrics: bool,
) -> anyhow::Result<()> {
    info!("Starting splitfile round trip");
    info!("  Content: {} bytes", content.len());
    info!("  Fetch loss rate: {}", loss_rate);
    info!("  Insert loss rate: {}", put_loss_rate);
    info!("  Seed: {}", seed);

    let network = Arc::new(InMemoryNetwork::with_seed(seed));
    let metrics = Arc::new(ClientMetrics::new()?);
    let ctx = ClientContext::new(network.clone(), config)?
        .with_metrics(metrics.clone())
        .with_events(Arc::new(LoggingEventPublisher::info_level()));
    let cancel = CancellationToken::new();

    let started = Instant::now();
    network.set_put_loss(put_loss_rate);
    let inserted = SplitfileInserter::new(ctx.clone())
        .insert(content.clone(), &cancel)
        .await?;
    info!(
        root = %inserted.root,
        segments = inserted.segments,
        blocks = network.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Insert finished"
    );

    let started = Instant::now();
    network.set_put_loss(0.0);
    network.set_fetch_loss(loss_rate);
    let cache = Arc::new(
        ArchiveBucketCache::new(&ctx.config.archive_cache).with_metrics(metrics.clone()),
    );
    let getter = ClientGetter::new(ctx.clone(), cache, Arc::new(BundleExtractor::new()));
    let fetched = getter.fetch(&ClientUri::new(inserted.root), &cancel).await?;
    info!(
        bytes = fetched.len(),
        block_fetches = network.fetch_count(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Fetch finished"
    );

    if fetched.as_slice() != &content[..] {
        bail!("fetched content differs from inserted content");
    }
    info!("Round trip verified");

    if print_metrics {
        print!("{}", metrics.gather_text()?);
    }
    Ok(())
}

fn info(config: &ClientConfig, size: u64) -> anyhow::Result<()> {
    print!("{}", config.to_yaml()?);

    let block_size = config.insert.block_size as u64;
    let data_blocks = size.div_ceil(block_size).max(1) as usize;
    let layout = SegmentLayout::compute(
        data_blocks,
        SegmentLimits {
            codec: config.insert.codec,
            data_blocks: config.insert.segment_data_blocks,
            check_blocks: config.insert.segment_check_blocks,
        },
    )?;
    if layout.len() > 1 && layout.total_check_blocks() == 0 {
        warn!("Layout has no check blocks; any lost block fails the fetch");
    }

    println!(
        "# {} bytes: {} segments, {} data blocks, {} check blocks",
        size,
        layout.len(),
        layout.total_data_blocks(),
        layout.total_check_blocks()
    );
    for segment in layout.segments() {
        println!("#   segment {}: {}", segment.index, segment.shape);
    }
    Ok(())
}

// =============================================================================
// Logging
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
