// ============================================================================
// main.rs — slime-engine
// Entry point. Initializes logging, parses the command line and runs the
// simulation headless on the chosen backend.
// ============================================================================

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};

use slime_engine::churn::{DEFAULT_CHURN_BATCH, DEFAULT_CHURN_INTERVAL};
use slime_engine::headless::{run_headless, ChurnConfig, HeadlessConfig};
use slime_engine::{CpuBackend, GpuBackend, SimResult, SimulationSettings};

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    Cpu,
    Gpu,
}

#[derive(Parser, Debug)]
#[command(name = "slime-engine", version, about = "Run the slime mold simulation headless")]
struct Cli {
    /// JSON settings file; missing fields take their defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of frames to simulate.
    #[arg(long, default_value_t = 3600)]
    frames: u32,

    #[arg(long, value_enum, default_value_t = BackendKind::Cpu)]
    backend: BackendKind,

    /// Seconds of simulated time per frame.
    #[arg(long, default_value_t = 1.0 / 60.0)]
    dt: f32,

    /// Seconds between population churn cycles.
    #[arg(long, default_value_t = DEFAULT_CHURN_INTERVAL)]
    churn_interval: f64,

    /// Agents replaced per churn cycle.
    #[arg(long, default_value_t = DEFAULT_CHURN_BATCH)]
    churn_batch: usize,

    #[arg(long)]
    no_churn: bool,

    /// Seed for spawning; overrides the config file.
    #[arg(long)]
    seed: Option<u64>,

    /// Frames between diagnostics reports (0 disables them).
    #[arg(long, default_value_t = 600)]
    diag_interval: u32,

    #[arg(long)]
    save_state: Option<PathBuf>,

    #[arg(long)]
    load_state: Option<PathBuf>,

    /// Write a JSON run summary here.
    #[arg(long)]
    summary: Option<PathBuf>,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> SimResult<()> {
    let mut settings = match &cli.config {
        Some(path) => SimulationSettings::load_json(path)?,
        None => SimulationSettings::default(),
    };
    if cli.seed.is_some() {
        settings.seed = cli.seed;
    }

    let config = HeadlessConfig {
        frames: cli.frames,
        dt: cli.dt,
        churn: (!cli.no_churn).then(|| ChurnConfig {
            interval: cli.churn_interval,
            batch: cli.churn_batch,
        }),
        diag_interval: cli.diag_interval,
        load_state_path: cli.load_state,
        save_state_path: cli.save_state,
        summary_path: cli.summary,
        ..Default::default()
    };

    let summary = match cli.backend {
        BackendKind::Cpu => run_headless(CpuBackend::new(), settings, &config)?,
        BackendKind::Gpu => run_headless(GpuBackend::new()?, settings, &config)?,
    };
    log::info!(
        "Final: population={} intensity={:.2} coverage={:.1}% fps={:.0}",
        summary.population,
        summary.total_intensity,
        summary.coverage * 100.0,
        summary.fps
    );
    Ok(())
}
