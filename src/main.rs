use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use trident_adapter::adapter::{metrics, stats, TridentAdapter};
use trident_adapter::logging::{Facility, Logger, StderrSink};
use trident_adapter::{Config, PacketBuffer, QueueWriter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a JSON5 configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured listen port.
    #[arg(long)]
    listen_port: Option<u16>,

    /// Override the configured reorder window size.
    #[arg(long)]
    cache_size: Option<u32>,

    /// Override the configured downstream queue count.
    #[arg(long)]
    queue_count: Option<usize>,

    /// Expose Prometheus metrics on this address.
    #[arg(long)]
    prometheus_addr: Option<SocketAddr>,
}

/// Stand-in downstream queue: counts nothing and drops the packet, which
/// releases its buffer. Real deployments hang their pipeline off
/// `QueueWriter` instead.
struct DiscardQueue;

impl QueueWriter for DiscardQueue {
    fn put(&self, _packet: PacketBuffer) {}
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load_from_file(path)
            .with_context(|| format!("load config from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(port) = args.listen_port {
        config.listen_port = port;
    }
    if let Some(cache_size) = args.cache_size {
        config.cache_size = cache_size;
    }
    if let Some(queue_count) = args.queue_count {
        config.queue_count = queue_count;
    }
    config.validate().context("invalid configuration")?;

    let (logger, _log_consumer) =
        Logger::start(Box::new(StderrSink), config.log_level).context("start logger")?;

    if let Some(addr) = args.prometheus_addr {
        metrics::install_prometheus_recorder(addr)
            .with_context(|| format!("install prometheus exporter on {}", addr))?;
        logger.notice(Facility::Stats, &format!("prometheus exporter on {}", addr));
    }

    let queues: Vec<Box<dyn QueueWriter>> = (0..config.queue_count)
        .map(|_| Box::new(DiscardQueue) as Box<dyn QueueWriter>)
        .collect();

    let adapter = TridentAdapter::new(&config, queues, logger.clone())
        .context("set up trident adapter")?;
    let handle = adapter.start().context("start trident adapter")?;

    let reporter = stats::spawn_reporter(
        handle.counter_cells(),
        Duration::from_secs(config.reporting_interval),
        handle.running(),
        logger.clone(),
    );

    // The receive loop runs until a fatal socket error or an external
    // kill; its outcome decides the exit status.
    let outcome = handle.join();
    let _ = reporter.join();
    outcome
}
