// Permits load generator
//
// Design Decision: Drive a real BufferedDispatcher against a simulated backend
// so limits can be tuned by watching the outcome mix.
// Design Decision: Start from PERMITS_* environment config; flags override it.

mod backend;
mod output;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use futures::future::join_all;
use permits::{BufferedDispatcher, DispatcherConfig, RateLimitSpec, WorkloadKind};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use backend::{BackendCall, LoadProfile, TenantDirectory};
use output::{OutcomeCounts, OutputFormat, RunSummary};

#[derive(Parser)]
#[command(name = "permits")]
#[command(about = "Push synthetic multi-tenant load through a bounded dispatcher")]
#[command(version)]
pub struct Cli {
    /// Workload kind (read or write)
    #[arg(long, short, default_value = "read")]
    pub kind: WorkloadKind,

    /// Number of distinct tenants
    #[arg(long, default_value = "8")]
    pub tenants: usize,

    /// Total submissions
    #[arg(long, short = 'n', default_value = "10000")]
    pub items: u64,

    /// Submissions per second (unpaced if omitted)
    #[arg(long)]
    pub submit_rate: Option<u64>,

    /// Per-tenant rate limit, e.g. "100:1,3000:60"
    #[arg(long)]
    pub rate_limit: Option<RateLimitSpec>,

    /// Buffer capacity
    #[arg(long)]
    pub buffer: Option<usize>,

    /// Soft concurrency limit
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// End-to-end budget per item in milliseconds
    #[arg(long)]
    pub max_wait_ms: Option<u64>,

    /// Number of dispatch workers
    #[arg(long)]
    pub dispatch_workers: Option<usize>,

    /// Base backend latency in milliseconds
    #[arg(long, default_value = "20")]
    pub latency_ms: u64,

    /// Extra random latency in milliseconds
    #[arg(long, default_value = "30")]
    pub jitter_ms: u64,

    /// Fraction of calls the backend fails
    #[arg(long, default_value = "0.01")]
    pub failure_rate: f64,

    /// Fraction of calls submitted without a tenant
    #[arg(long, default_value = "0.0")]
    pub system_rate: f64,

    /// Stats snapshot interval in milliseconds
    #[arg(long)]
    pub stats_interval_ms: Option<u64>,

    /// Output format
    #[arg(long, short, default_value = "text", value_parser = ["text", "json"])]
    pub output: String,
}

impl Cli {
    fn dispatcher_config(&self) -> anyhow::Result<DispatcherConfig> {
        let mut config = DispatcherConfig::from_env(self.kind)
            .context("failed to load dispatcher config from environment")?
            .with_print_tenant_names(true);

        if let Some(spec) = &self.rate_limit {
            config = config.with_rate_limits(spec.clone());
        }
        if let Some(capacity) = self.buffer {
            config = config.with_buffer_capacity(capacity);
        }
        if let Some(limit) = self.concurrency {
            config = config.with_concurrency_limit(limit);
        }
        if let Some(ms) = self.max_wait_ms {
            config = config.with_max_wait_time(Duration::from_millis(ms));
        }
        if let Some(workers) = self.dispatch_workers {
            config = config.with_dispatch_workers(workers);
        }
        if let Some(ms) = self.stats_interval_ms {
            config = config.with_stats_interval(Duration::from_millis(ms));
        }

        config.validate()?;
        Ok(config)
    }

    fn load_profile(&self) -> anyhow::Result<LoadProfile> {
        for (name, rate) in [
            ("failure-rate", self.failure_rate),
            ("system-rate", self.system_rate),
        ] {
            anyhow::ensure!(
                (0.0..=1.0).contains(&rate),
                "--{name} must be between 0 and 1, got {rate}"
            );
        }
        Ok(LoadProfile {
            latency: Duration::from_millis(self.latency_ms),
            jitter: Duration::from_millis(self.jitter_ms),
            failure_rate: self.failure_rate,
            system_rate: self.system_rate,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "permits=info,permits_cli=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    anyhow::ensure!(cli.tenants > 0, "--tenants must be at least 1");
    let config = cli.dispatcher_config()?;
    let profile = cli.load_profile()?;
    let format = OutputFormat::from_str(&cli.output);

    let directory = Arc::new(TenantDirectory::generate(cli.tenants));
    let tenants = directory.tenants();
    let dispatcher = BufferedDispatcher::from_config(config)?.with_tenant_names(directory);
    dispatcher.start()?;

    tracing::info!(
        kind = %cli.kind,
        items = cli.items,
        tenants = tenants.len(),
        "Submitting load"
    );

    let started = Instant::now();
    let mut pacer = cli
        .submit_rate
        .filter(|rate| *rate > 0)
        .map(|rate| tokio::time::interval(Duration::from_secs_f64(1.0 / rate as f64)));

    let mut handles = Vec::with_capacity(cli.items as usize);
    for i in 0..cli.items {
        if let Some(pacer) = pacer.as_mut() {
            pacer.tick().await;
        }
        let tenant = tenants[i as usize % tenants.len()];
        handles.push(dispatcher.submit(BackendCall::sample(tenant, &profile)));
    }

    let mut outcomes = OutcomeCounts::default();
    for result in join_all(handles).await {
        outcomes.record(&result);
    }
    let elapsed = started.elapsed();

    if let Err(e) = dispatcher.stop().await {
        tracing::warn!(error = %e, "dispatcher did not stop cleanly");
    }

    RunSummary::new(
        cli.kind.to_string(),
        elapsed,
        outcomes,
        dispatcher.stats().totals(),
    )
    .print(format)
}
