//! Runs put/get rendezvous traffic between rank pairs over the in-process fabric.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, ensure, Context, Result};
use clap::{Parser, ValueEnum};
use comm_engine::{EngineConfig, ServiceEngine, WorkerRuntime};
use comm_scenarios::{verify_pair, ArcStatsSink, RankScenario, ScenarioKind, StatsSink};
use parking_lot::Mutex;
use tracing::{debug, info};
use tracing_subscriber::{fmt, EnvFilter};
use transport::{FabricConfig, LocalEndpoint, LocalFabric};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    /// Partners take turns putting into each other.
    PingPong,
    /// Even ranks fire every put at once.
    Burst,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Put/get rendezvous driver for the communication engine")]
struct Args {
    /// Number of ranks; pairs are (0, 1), (2, 3), ...
    #[arg(long, default_value_t = 2)]
    ranks: usize,

    #[arg(long, value_enum, default_value_t = Mode::PingPong)]
    mode: Mode,

    /// Round trips (ping-pong) or puts (burst) per pair
    #[arg(long, default_value_t = 100)]
    rounds: u32,

    /// Bytes moved per put
    #[arg(long, default_value_t = 4096)]
    bytes: usize,

    /// TOML file with engine settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Drive every rank from the main thread
    #[arg(long)]
    single_thread: bool,

    /// Seconds before the run is declared stuck
    #[arg(long, default_value_t = 30)]
    timeout: u64,
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    ensure!(args.ranks >= 2, "need at least two ranks, got {}", args.ranks);

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => EngineConfig::default(),
    };
    let kind = match args.mode {
        Mode::PingPong => ScenarioKind::PingPong {
            rounds: args.rounds,
            bytes: args.bytes,
        },
        Mode::Burst => ScenarioKind::Burst {
            transfers: args.rounds,
            bytes: args.bytes,
        },
    };
    let endpoints = LocalFabric::endpoints(FabricConfig {
        ranks: args.ranks,
        ..FabricConfig::default()
    });
    let stats: Vec<_> = (0..args.ranks)
        .map(|_| ArcStatsSink::new(Arc::new(Mutex::new(Default::default()))))
        .collect();
    let timeout = Duration::from_secs(args.timeout);

    info!(ranks = args.ranks, scenario = kind.name(), bytes = kind.bytes(), "starting");
    let started = Instant::now();
    if args.single_thread {
        run_single_thread(endpoints, &stats, config, kind, timeout)?;
    } else {
        run_threaded(endpoints, &stats, config, kind, timeout)?;
    }
    let elapsed = started.elapsed();

    for (pair, sinks) in stats.chunks(2).enumerate() {
        let [even, odd] = sinks else {
            continue;
        };
        let (even, odd) = (even.snapshot(), odd.snapshot());
        verify_pair(kind, &even, &odd, config.dynamic_slots)
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("pair {pair} failed verification"))?;
        info!(
            pair,
            puts = even.puts_issued + odd.puts_issued,
            bytes = even.bytes_sent + odd.bytes_sent,
            overflow_waits = even.overflow_waits + odd.overflow_waits,
            "pair verified"
        );
    }
    let moved: u64 = stats.iter().map(|sink| sink.snapshot().bytes_sent).sum();
    info!(
        elapsed_ms = elapsed.as_millis() as u64,
        mib_per_sec = moved as f64 / (1 << 20) as f64 / elapsed.as_secs_f64().max(1e-9),
        "run complete"
    );
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // Ignore error if already set (e.g., during tests).
    let _ = fmt().with_env_filter(env_filter).try_init();
}

fn load_config(path: &Path) -> Result<EngineConfig> {
    let text =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let config: EngineConfig =
        toml::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn run_single_thread(
    endpoints: Vec<LocalEndpoint>,
    stats: &[ArcStatsSink],
    config: EngineConfig,
    kind: ScenarioKind,
    timeout: Duration,
) -> Result<()> {
    let mut runtime = WorkerRuntime::new();
    for (endpoint, sink) in endpoints.into_iter().zip(stats) {
        runtime.register(RankScenario::new(endpoint, config, kind, sink.clone())?);
    }
    if !runtime.run_until_finished(timeout)? {
        bail!("ranks did not finish within {timeout:?}");
    }
    Ok(())
}

fn run_threaded(
    endpoints: Vec<LocalEndpoint>,
    stats: &[ArcStatsSink],
    config: EngineConfig,
    kind: ScenarioKind,
    timeout: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let workers: Vec<_> = endpoints
        .into_iter()
        .zip(stats.iter().cloned())
        .map(|(endpoint, sink)| {
            thread::spawn(move || -> Result<()> {
                let mut scenario = RankScenario::new(endpoint, config, kind, sink)?;
                let rank = scenario.engine().rank();
                while !scenario.is_finished() {
                    if Instant::now() >= deadline {
                        bail!("rank {rank} did not finish within {timeout:?}");
                    }
                    if scenario.poll()? == 0 {
                        thread::yield_now();
                    }
                }
                let mut engine = scenario.into_engine();
                engine.sync()?;
                debug!(rank, stats = ?engine.stats(), "rank done");
                engine.shutdown()?;
                Ok(())
            })
        })
        .collect();
    for (rank, worker) in workers.into_iter().enumerate() {
        match worker.join() {
            Ok(result) => result.with_context(|| format!("rank {rank} failed"))?,
            Err(_) => bail!("rank {rank} panicked"),
        }
    }
    Ok(())
}
