// ============================================================================
// engine.rs — slime-engine
// Top-level orchestrator: lifecycle state machine, per-tick settings snapshot,
// field ping-pong and the population operations used by churn and display.
// ============================================================================

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::agent::{Agent, AgentPopulation};
use crate::backend::ComputeBackend;
use crate::config::{SimulationSettings, MAX_AGENTS};
use crate::error::{SimError, SimResult};
use crate::field::{Field, FieldSnapshot};
use crate::pipeline::{ComputePipeline, TickClock};
use crate::spawn::{self, ExternalPlacement};
use crate::state_io::SimSnapshot;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Ready,
    Stepping,
    Disposed,
}

/// What a display should draw each frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DisplayMode {
    #[default]
    Trail,
    AgentsOnly,
}

pub struct SimulationEngine<B: ComputeBackend> {
    backend: B,
    state: EngineState,
    settings: SimulationSettings,
    rng: StdRng,
    placement: Option<Box<dyn ExternalPlacement>>,
    field: Option<Field>,
    population: AgentPopulation,
    pipeline: ComputePipeline,
    cached_field: Option<FieldSnapshot>,
    display_mode: DisplayMode,
    tick: u64,
    sim_time: f64,
}

impl<B: ComputeBackend> SimulationEngine<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            state: EngineState::Uninitialized,
            settings: SimulationSettings::default(),
            rng: StdRng::from_entropy(),
            placement: None,
            field: None,
            population: AgentPopulation::default(),
            pipeline: ComputePipeline::new(),
            cached_field: None,
            display_mode: DisplayMode::default(),
            tick: 0,
            sim_time: 0.0,
        }
    }

    // ======================== Lifecycle ========================

    /// Validate `settings`, allocate the field, spawn and upload the initial
    /// population. Nothing stays allocated if any part fails.
    pub fn initialize(&mut self, settings: SimulationSettings) -> SimResult<()> {
        match self.state {
            EngineState::Uninitialized => {}
            EngineState::Disposed => return Err(SimError::UseAfterDispose { op: "initialize" }),
            state => return Err(SimError::InvalidState { op: "initialize", state }),
        }
        settings.validate()?;

        self.rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let field = Field::allocate(&mut self.backend, settings.width, settings.height)?;
        let agents = spawn::spawn_batch(
            &settings,
            &mut self.rng,
            self.placement.as_deref(),
            settings.num_agents,
        );
        let mut population = AgentPopulation::new(agents);
        if let Err(e) = self.pipeline.sync_agents(&mut self.backend, &mut population) {
            field.release(&mut self.backend);
            self.pipeline.release(&mut self.backend);
            return Err(e);
        }

        log::info!(
            "Simulation initialized on {}: {}x{}, {} agents, {} species, {:?} spawn, {:?} boundary",
            self.backend.name(),
            settings.width,
            settings.height,
            population.len(),
            settings.species_count(),
            settings.spawn_mode,
            settings.boundary
        );

        self.field = Some(field);
        self.population = population;
        self.settings = settings;
        self.cached_field = None;
        self.tick = 0;
        self.sim_time = 0.0;
        self.state = EngineState::Ready;
        Ok(())
    }

    /// Release every backend resource. Calling it again is a no-op.
    pub fn dispose(&mut self) {
        if self.state == EngineState::Disposed {
            return;
        }
        if let Some(field) = self.field.take() {
            field.release(&mut self.backend);
        }
        self.pipeline.release(&mut self.backend);
        self.cached_field = None;
        self.population = AgentPopulation::default();
        self.state = EngineState::Disposed;
        log::info!("Simulation disposed after {} ticks", self.tick);
    }

    pub fn is_disposed(&self) -> bool {
        self.state == EngineState::Disposed
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    fn require_ready(&self, op: &'static str) -> SimResult<()> {
        match self.state {
            EngineState::Ready => Ok(()),
            EngineState::Disposed => Err(SimError::UseAfterDispose { op }),
            state => Err(SimError::InvalidState { op, state }),
        }
    }

    // ======================== Stepping ========================

    /// Advance `steps_per_frame` ticks of `dt` seconds each. A failing tick
    /// leaves the field and population as they were before that tick.
    pub fn step(&mut self, dt: f32) -> SimResult<()> {
        self.require_ready("step")?;
        if !dt.is_finite() || dt < 0.0 {
            return Err(SimError::InvalidArgument(format!("dt must be finite and >= 0, got {dt}")));
        }

        self.state = EngineState::Stepping;
        let mut result = Ok(());
        for _ in 0..self.settings.steps_per_frame {
            result = self.tick_once(dt);
            if result.is_err() {
                break;
            }
        }
        self.state = EngineState::Ready;

        if let Err(e) = &result {
            log::warn!("Tick {} failed: {e}", self.tick);
        }
        result
    }

    fn tick_once(&mut self, dt: f32) -> SimResult<()> {
        let snapshot = self.settings.clone();
        let field = self
            .field
            .as_mut()
            .ok_or(SimError::InvalidState { op: "step", state: self.state })?;
        let clock = TickClock {
            dt,
            frame: self.tick as u32,
        };
        self.pipeline.run_update_and_diffuse(
            &mut self.backend,
            &mut self.population,
            &snapshot,
            field,
            clock,
        )?;
        field.swap();
        self.cached_field = None;
        self.tick += 1;
        self.sim_time += dt as f64;
        Ok(())
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Simulated seconds accumulated over completed ticks.
    pub fn sim_time(&self) -> f64 {
        self.sim_time
    }

    // ======================== Population ========================

    pub fn population_len(&self) -> usize {
        self.population.len()
    }

    /// Pull the backend copy into the host mirror unless the host mirror
    /// holds changes not yet uploaded.
    fn refresh_population(&mut self) -> SimResult<()> {
        if self.population.is_dirty() {
            return Ok(());
        }
        let agents = self.pipeline.read_agents(&mut self.backend, self.population.len())?;
        self.population.sync_from_backend(agents);
        Ok(())
    }

    /// Live agents as of the most recently completed tick.
    pub fn read_population(&mut self) -> SimResult<&[Agent]> {
        self.require_ready("read_population")?;
        self.refresh_population()?;
        Ok(self.population.as_slice())
    }

    /// Spawn `count` agents with the live settings and the engine's random
    /// source.
    pub fn spawn_batch(&mut self, count: usize) -> SimResult<Vec<Agent>> {
        self.require_ready("spawn_batch")?;
        Ok(spawn::spawn_batch(
            &self.settings,
            &mut self.rng,
            self.placement.as_deref(),
            count,
        ))
    }

    /// Evict the `new_agents.len()` oldest agents and append `new_agents`.
    /// The population is unchanged on error.
    pub fn replace_population_prefix(&mut self, new_agents: &[Agent]) -> SimResult<()> {
        self.require_ready("replace_population_prefix")?;
        if new_agents.len() > self.population.len() {
            return Err(SimError::InvalidArgument(format!(
                "cannot replace {} agents in a population of {}",
                new_agents.len(),
                self.population.len()
            )));
        }
        self.check_agents(new_agents)?;
        self.refresh_population()?;
        self.population.replace_prefix(new_agents)
    }

    /// Reject agents the kernels can't run: unknown species, a mask that
    /// doesn't match the species, or a position off the field.
    fn check_agents(&self, agents: &[Agent]) -> SimResult<()> {
        let species = self.settings.species_count() as u32;
        let (width, height) = (self.settings.width, self.settings.height);
        for (i, agent) in agents.iter().enumerate() {
            if agent.species_index >= species || !agent.has_consistent_mask() {
                return Err(SimError::InvalidArgument(format!(
                    "agent {i}: species index {} with mask {:?} invalid for {species} species",
                    agent.species_index, agent.species_mask
                )));
            }
            if !agent.is_inside(width, height) {
                return Err(SimError::InvalidArgument(format!(
                    "agent {i}: position {:?} outside the {width}x{height} field",
                    agent.position
                )));
            }
        }
        Ok(())
    }

    // ======================== Field & display ========================

    /// Copy of the trail field after the most recently completed tick.
    pub fn current_field(&mut self) -> SimResult<FieldSnapshot> {
        self.require_ready("current_field")?;
        if let Some(cached) = &self.cached_field {
            return Ok(cached.clone());
        }
        let field = self
            .field
            .as_ref()
            .ok_or(SimError::InvalidState { op: "current_field", state: self.state })?;
        let snapshot = field.snapshot(&mut self.backend)?;
        self.cached_field = Some(snapshot.clone());
        Ok(snapshot)
    }

    pub fn display_mode(&self) -> DisplayMode {
        self.display_mode
    }

    pub fn set_display_mode(&mut self, mode: DisplayMode) {
        self.display_mode = mode;
    }

    // ======================== Settings ========================

    pub fn settings(&self) -> &SimulationSettings {
        &self.settings
    }

    /// Edit the live settings. The edit is checked as a whole and becomes
    /// visible at the next tick; a rejected edit changes nothing.
    pub fn tune<F: FnOnce(&mut SimulationSettings)>(&mut self, edit: F) -> SimResult<()> {
        self.require_ready("tune")?;
        let mut next = self.settings.clone();
        edit(&mut next);
        if next.num_agents != self.settings.num_agents {
            return Err(SimError::InvalidArgument(
                "num_agents is fixed after initialization".into(),
            ));
        }
        self.settings.check_runtime_compatible(&next)?;
        self.settings = next;
        Ok(())
    }

    pub fn set_external_placement(&mut self, placement: Box<dyn ExternalPlacement>) {
        self.placement = Some(placement);
    }

    pub fn clear_external_placement(&mut self) {
        self.placement = None;
    }

    // ======================== State I/O ========================

    /// Capture field and population for saving.
    pub fn capture_snapshot(&mut self) -> SimResult<SimSnapshot> {
        let field = self.current_field()?;
        self.refresh_population()?;
        Ok(SimSnapshot {
            width: field.width,
            height: field.height,
            tick: self.tick,
            sim_time: self.sim_time,
            texels: field.texels().to_vec(),
            agents: self.population.as_slice().to_vec(),
        })
    }

    /// Load a saved field and population into a ready engine of the same
    /// dimensions. The population size follows the snapshot.
    pub fn restore_snapshot(&mut self, snapshot: &SimSnapshot) -> SimResult<()> {
        self.require_ready("restore_snapshot")?;
        if snapshot.width != self.settings.width || snapshot.height != self.settings.height {
            return Err(SimError::InvalidArgument(format!(
                "snapshot is {}x{} but the engine runs {}x{}",
                snapshot.width, snapshot.height, self.settings.width, self.settings.height
            )));
        }
        if snapshot.agents.len() > MAX_AGENTS {
            return Err(SimError::InvalidArgument(format!(
                "snapshot holds {} agents, more than the {MAX_AGENTS} supported",
                snapshot.agents.len()
            )));
        }
        if !snapshot.sim_time.is_finite() || snapshot.sim_time < 0.0 {
            return Err(SimError::InvalidArgument(format!(
                "snapshot sim_time {} is not a valid clock",
                snapshot.sim_time
            )));
        }
        self.check_agents(&snapshot.agents)?;
        let field = self
            .field
            .as_ref()
            .ok_or(SimError::InvalidState { op: "restore_snapshot", state: self.state })?;
        field.upload(&mut self.backend, &snapshot.texels)?;

        self.population = AgentPopulation::new(snapshot.agents.clone());
        self.settings.num_agents = snapshot.agents.len();
        self.cached_field = None;
        self.tick = snapshot.tick;
        self.sim_time = snapshot.sim_time;
        log::info!(
            "Restored snapshot: tick {}, {} agents",
            snapshot.tick,
            snapshot.agents.len()
        );
        Ok(())
    }

    // ======================== Backend access ========================

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }
}
