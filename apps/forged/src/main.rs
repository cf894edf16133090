use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use forge_kernel::HarnessBuilder;
use forge_protocol::{LatencyProfile, SessionConfig, SessionId, StressConfig};
use tokio_stream::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Profile {
    Uniform,
    FlakyWifi,
    DataCenterOutage,
}

impl From<Profile> for LatencyProfile {
    fn from(profile: Profile) -> Self {
        match profile {
            Profile::Uniform => LatencyProfile::Uniform,
            Profile::FlakyWifi => LatencyProfile::flaky_wifi(),
            Profile::DataCenterOutage => LatencyProfile::data_center_outage(),
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "forged")]
#[command(about = "Agent Forge stress-run daemon")]
struct Cli {
    /// Directory holding one Justice Log per session.
    #[arg(long, default_value = ".forge")]
    root: PathBuf,
    #[arg(long, default_value = "forge-demo")]
    session: String,
    #[arg(long, default_value_t = 2)]
    agents: usize,
    #[arg(long, default_value_t = 10)]
    grid_size: i64,
    #[arg(long, default_value_t = 50)]
    steps: u64,
    #[arg(long, default_value_t = 0.0)]
    latency_rate: f64,
    #[arg(long, default_value_t = 0.0)]
    failure_rate: f64,
    #[arg(long, default_value_t = 0.0)]
    drop_rate: f64,
    #[arg(long, value_enum, default_value_t = Profile::Uniform)]
    profile: Profile,
    /// Drop every bus delivery.
    #[arg(long)]
    partition: bool,
    /// Flag agents whose battery falls under this reserve.
    #[arg(long)]
    min_battery: Option<f64>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    no_rails: bool,
    #[arg(long, default_value_t = 5)]
    broadcast_every: u64,
}

impl Cli {
    fn session_config(&self) -> SessionConfig {
        let mut stress = StressConfig::calm()
            .with_latency(self.latency_rate, 0.1, 0.5)
            .with_failure_rate(self.failure_rate)
            .with_drop_rate(self.drop_rate)
            .with_profile(self.profile.into())
            .with_network_partition(self.partition);
        if let Some(seed) = self.seed {
            stress = stress.with_seed(seed);
        }
        let config = SessionConfig::default()
            .with_agents(self.agents)
            .with_grid_size(self.grid_size)
            .with_max_steps(self.steps)
            .with_stress(stress)
            .with_safety_rails(!self.no_rails)
            .with_broadcast_every(self.broadcast_every);
        match self.min_battery {
            Some(min) => config.with_min_battery(min),
            None => config,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .compact()
        .init();

    let cli = Cli::parse();
    let config = cli.session_config();
    let session_id = SessionId::from_string(cli.session.clone());

    let forge = HarnessBuilder::new().justice_root(&cli.root).build();

    let mut frames = forge.subscribe(&session_id).await?.into_stream();
    let frame_task = tokio::spawn(async move {
        let mut last = 0;
        while let Some(frame) = frames.next().await {
            if frame.seq_id > last + 1 {
                info!(skipped = frame.seq_id - last - 1, "frames conflated");
            }
            last = frame.seq_id;
            let rendered = serde_json::to_string(&frame).unwrap_or_else(|_| "{}".to_owned());
            info!(frame = %rendered, "frame");
        }
    });

    let status = forge.start_session(&session_id, Some(config)).await?;
    info!(session_id = %session_id, agents = status.agent_ids.len(), "session started");

    let runner = forge.runner(&session_id).await?;
    for report in runner.wait_for_agents().await {
        info!(
            agent_id = %report.agent_id,
            steps = report.steps,
            halted = report.halted,
            messages = report.messages_received,
            end = ?report.end,
            "agent finished"
        );
    }

    let status = forge.stop_session(&session_id).await?;
    info!(phase = ?status.phase, error = ?status.error, "session stopped");

    if let Some(engine) = runner.engine() {
        for (agent_id, score) in engine.monitor().scores() {
            info!(agent_id = %agent_id, score, level = ?engine.monitor().level(&agent_id), "risk");
        }
        info!(violations = engine.violations().await.len(), seq_id = engine.current_seq(), "run summary");
    }

    let bus = runner.bus().stats();
    info!(
        published = bus.published,
        delivered = bus.delivered,
        dropped = bus.dropped,
        propagation = bus.propagation_ratio(),
        "bus summary"
    );

    let report = runner.justice().verify_integrity().await?;
    if report.valid {
        info!(entries = report.total_entries, "justice log intact");
    } else {
        warn!(failed_at = ?report.failed_at_index, message = %report.message, "justice log broken");
    }
    let manifest = runner.justice().seal(None).await?;
    info!(chain_hash = %manifest.chain_hash, entries = manifest.total_entries, "justice log sealed");

    tokio::time::sleep(Duration::from_millis(50)).await;
    frame_task.abort();
    if let Err(error) = frame_task.await
        && !error.is_cancelled()
    {
        warn!(%error, "frame task stopped");
    }

    Ok(())
}
