// ============================================================================
// headless.rs — slime-engine
// Headless runner: fixed-dt stepping, churn polling, periodic diagnostics,
// state save/load and a JSON run summary.
// ============================================================================

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Local;
use serde::Serialize;

use crate::backend::ComputeBackend;
use crate::churn::{PopulationChurnScheduler, DEFAULT_CHURN_BATCH, DEFAULT_CHURN_INTERVAL};
use crate::config::SimulationSettings;
use crate::engine::SimulationEngine;
use crate::error::{SimError, SimResult};
use crate::metrics::FieldDiagnostics;
use crate::state_io;

#[derive(Clone, Debug, PartialEq)]
pub struct ChurnConfig {
    pub interval: f64,
    pub batch: usize,
}

impl Default for ChurnConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_CHURN_INTERVAL,
            batch: DEFAULT_CHURN_BATCH,
        }
    }
}

#[derive(Clone, Debug)]
pub struct HeadlessConfig {
    pub frames: u32,
    pub dt: f32,
    pub churn: Option<ChurnConfig>,
    pub diag_interval: u32,
    pub progress_interval: u32,
    pub load_state_path: Option<PathBuf>,
    pub save_state_path: Option<PathBuf>,
    pub summary_path: Option<PathBuf>,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            frames: 3_600,
            dt: 1.0 / 60.0,
            churn: Some(ChurnConfig::default()),
            diag_interval: 600,
            progress_interval: 600,
            load_state_path: None,
            save_state_path: None,
            summary_path: None,
        }
    }
}

/// What a headless run did, written to the summary file.
#[derive(Clone, Debug, Serialize)]
pub struct RunSummary {
    pub backend: String,
    pub frames: u32,
    pub ticks: u64,
    pub sim_time: f64,
    pub wall_secs: f64,
    pub fps: f64,
    pub failed_frames: u32,
    pub churn_cycles: u64,
    pub churn_skipped: u64,
    pub population: usize,
    pub total_intensity: f64,
    pub coverage: f32,
}

pub fn run_headless<B: ComputeBackend>(
    backend: B,
    settings: SimulationSettings,
    config: &HeadlessConfig,
) -> SimResult<RunSummary> {
    let backend_name = backend.name().to_string();
    let mut engine = SimulationEngine::new(backend);
    engine.initialize(settings)?;

    if let Some(path) = &config.load_state_path {
        let s = engine.settings();
        let snap = state_io::load_snapshot(path, s.width, s.height)?;
        engine.restore_snapshot(&snap)?;
        log::info!("Loaded state from {}", path.display());
    }

    let mut churn = match &config.churn {
        Some(c) => Some(PopulationChurnScheduler::new(c.interval, c.batch, engine.sim_time())?),
        None => None,
    };

    log::info!(
        "Headless run started: {} frames on {}x{} ({} backend, dt={:.4})",
        config.frames,
        engine.settings().width,
        engine.settings().height,
        backend_name,
        config.dt
    );

    let started = Instant::now();
    let mut last_report = Instant::now();
    let mut last_report_frame = 0u32;
    let mut failed_frames = 0u32;
    let mut prev_diag: Option<FieldDiagnostics> = None;

    for frame in 0..config.frames {
        match engine.step(config.dt) {
            Ok(()) => {}
            Err(e) if e.is_transient() => failed_frames += 1,
            Err(e) => return Err(e),
        }

        if let Some(scheduler) = churn.as_mut() {
            match scheduler.poll(engine.sim_time(), &mut engine) {
                Ok(_) => {}
                Err(SimError::ChurnUnderflow { .. }) => {}
                Err(e) if e.is_transient() => {}
                Err(e) => return Err(e),
            }
        }

        let done = frame + 1;
        if config.diag_interval > 0 && done % config.diag_interval == 0 {
            let diag = FieldDiagnostics::from_snapshot(&engine.current_field()?);
            diag.log(engine.tick(), prev_diag.as_ref());
            prev_diag = Some(diag);
        }

        if config.progress_interval > 0 && done % config.progress_interval == 0 {
            let total_elapsed = started.elapsed().as_secs_f64().max(1e-6);
            let total_fps = done as f64 / total_elapsed;

            let window_elapsed = last_report.elapsed().as_secs_f64().max(1e-6);
            let window_frames = done - last_report_frame;
            let window_fps = window_frames as f64 / window_elapsed;

            let remaining = config.frames.saturating_sub(done);
            let eta_secs = if total_fps > 1e-6 {
                remaining as f64 / total_fps
            } else {
                0.0
            };

            log::info!(
                "Headless progress: {}/{} | fps={:.0} (window {:.0}) | ETA={:.1} min",
                done,
                config.frames,
                total_fps,
                window_fps,
                eta_secs / 60.0,
            );

            last_report = Instant::now();
            last_report_frame = done;
        }
    }

    let wall_secs = started.elapsed().as_secs_f64();
    let final_diag = FieldDiagnostics::from_snapshot(&engine.current_field()?);

    if let Some(path) = &config.save_state_path {
        let snapshot = engine.capture_snapshot()?;
        state_io::save_snapshot(path, &snapshot)?;
        log::info!("Saved final state to {}", path.display());
    }

    let summary = RunSummary {
        backend: backend_name,
        frames: config.frames,
        ticks: engine.tick(),
        sim_time: engine.sim_time(),
        wall_secs,
        fps: config.frames as f64 / wall_secs.max(1e-6),
        failed_frames,
        churn_cycles: churn.as_ref().map_or(0, |c| c.cycles()),
        churn_skipped: churn.as_ref().map_or(0, |c| c.skipped()),
        population: engine.population_len(),
        total_intensity: final_diag.total_intensity,
        coverage: final_diag.coverage,
    };

    if let Some(path) = &config.summary_path {
        write_summary(path, &summary, engine.settings())?;
    }

    engine.dispose();
    log::info!(
        "Headless run finished: {} ticks in {:.1}s ({} failed frames)",
        summary.ticks,
        summary.wall_secs,
        summary.failed_frames
    );
    Ok(summary)
}

fn write_summary(path: &Path, summary: &RunSummary, settings: &SimulationSettings) -> SimResult<()> {
    let now = Local::now();
    let doc = serde_json::json!({
        "run_id": format!("run_{}", now.format("%Y%m%d_%H%M%S")),
        "timestamp": now.format("%Y-%m-%d %H:%M:%S").to_string(),
        "app_version": env!("CARGO_PKG_VERSION"),
        "settings": settings,
        "summary": summary,
    });
    let json = serde_json::to_string_pretty(&doc)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    fs::write(path, json)?;
    log::info!("Saved run summary to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CpuBackend;

    fn tiny() -> SimulationSettings {
        SimulationSettings {
            width: 24,
            height: 24,
            num_agents: 40,
            seed: Some(5),
            ..Default::default()
        }
    }

    #[test]
    fn short_run_reports_ticks_and_churn() {
        let config = HeadlessConfig {
            frames: 30,
            dt: 0.1,
            churn: Some(ChurnConfig { interval: 1.0, batch: 10 }),
            diag_interval: 10,
            progress_interval: 0,
            ..Default::default()
        };
        let summary = run_headless(CpuBackend::new(), tiny(), &config).unwrap();
        assert_eq!(summary.ticks, 30);
        assert_eq!(summary.population, 40);
        assert!(summary.churn_cycles >= 2);
        assert_eq!(summary.failed_frames, 0);
        assert!(summary.total_intensity > 0.0);
    }

    #[test]
    fn underflowing_churn_does_not_abort_the_run() {
        let config = HeadlessConfig {
            frames: 20,
            dt: 0.1,
            churn: Some(ChurnConfig { interval: 0.5, batch: 1000 }),
            diag_interval: 0,
            progress_interval: 0,
            ..Default::default()
        };
        let summary = run_headless(CpuBackend::new(), tiny(), &config).unwrap();
        assert_eq!(summary.churn_cycles, 0);
        assert!(summary.churn_skipped >= 1);
    }

    #[test]
    fn saves_state_and_summary() {
        let dir = std::env::temp_dir();
        let state = dir.join(format!("slime_headless_{}.bin", std::process::id()));
        let summary_path = dir.join(format!("slime_headless_{}.json", std::process::id()));
        let config = HeadlessConfig {
            frames: 5,
            churn: None,
            diag_interval: 0,
            progress_interval: 0,
            save_state_path: Some(state.clone()),
            summary_path: Some(summary_path.clone()),
            ..Default::default()
        };
        run_headless(CpuBackend::new(), tiny(), &config).unwrap();

        let snap = state_io::load_snapshot(&state, 24, 24).unwrap();
        assert_eq!(snap.tick, 5);
        assert_eq!(snap.agents.len(), 40);
        let text = fs::read_to_string(&summary_path).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(doc["summary"]["ticks"], 5);
        assert_eq!(doc["settings"]["width"], 24);

        let resumed = HeadlessConfig {
            frames: 2,
            load_state_path: Some(state.clone()),
            ..config
        };
        let summary = run_headless(CpuBackend::new(), tiny(), &resumed).unwrap();
        assert_eq!(summary.ticks, 7);

        let _ = fs::remove_file(&state);
        let _ = fs::remove_file(&summary_path);
    }
}
