// ============================================================================
// pipeline.rs — slime-engine
// Two-stage compute pipeline: keeps the agent and species buffers in step with
// the host data, binds field textures by current index and records one tick.
// ============================================================================

use crate::agent::{Agent, AgentPopulation};
use crate::backend::{
    agent_workgroups, field_workgroups, BufferHandle, ComputeBackend, GpuSpecies, Scalar, Slot,
    Stage,
};
use crate::config::{SimulationSettings, SpeciesSettings};
use crate::error::SimResult;
use crate::field::Field;

/// Backend buffer plus the element count it was sized for.
#[derive(Clone, Copy, Debug)]
struct SizedBuffer {
    handle: BufferHandle,
    len: usize,
}

/// Per-tick timing fed to the kernels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TickClock {
    pub dt: f32,
    pub frame: u32,
}

#[derive(Debug, Default)]
pub struct ComputePipeline {
    agents: Option<SizedBuffer>,
    species: Option<SizedBuffer>,
    agent_reallocs: u32,
}

impl ComputePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn agent_buffer(&self) -> Option<BufferHandle> {
        self.agents.map(|b| b.handle)
    }

    /// Number of times the agent buffer had to be (re)allocated.
    pub fn agent_reallocations(&self) -> u32 {
        self.agent_reallocs
    }

    // ======================== Buffer sync ========================

    /// Upload the population if it changed since the last upload. The buffer
    /// is reallocated when the length changed, otherwise overwritten in place.
    pub fn sync_agents<B: ComputeBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        population: &mut AgentPopulation,
    ) -> SimResult<BufferHandle> {
        if let (Some(buffer), false) = (self.agents, population.is_dirty()) {
            return Ok(buffer.handle);
        }

        // Storage bindings can't be empty; an empty population still gets one
        // placeholder record that the kernel never reads.
        let placeholder = [Agent::new([0.0, 0.0], 0.0, 0, Agent::ALL_CHANNELS)];
        let contents: &[Agent] = if population.is_empty() {
            &placeholder
        } else {
            population.as_slice()
        };
        let bytes: &[u8] = bytemuck::cast_slice(contents);

        let handle = match self.agents {
            Some(buffer) if buffer.len == population.len() => {
                backend.write_buffer(buffer.handle, bytes)?;
                buffer.handle
            }
            previous => {
                let handle = backend.allocate_buffer("agents", bytes)?;
                if let Some(old) = previous {
                    backend.release_buffer(old.handle);
                }
                log::debug!(
                    "Agent buffer allocated for {} agents ({} bytes)",
                    population.len(),
                    bytes.len()
                );
                self.agent_reallocs += 1;
                self.agents = Some(SizedBuffer { handle, len: population.len() });
                handle
            }
        };
        population.mark_uploaded();
        Ok(handle)
    }

    /// Write this tick's species snapshot, reallocating on a count change.
    pub fn sync_species<B: ComputeBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        species: &[SpeciesSettings],
    ) -> SimResult<BufferHandle> {
        let records: Vec<GpuSpecies> = species.iter().map(GpuSpecies::from).collect();
        let bytes: &[u8] = bytemuck::cast_slice(&records);

        match self.species {
            Some(buffer) if buffer.len == records.len() => {
                backend.write_buffer(buffer.handle, bytes)?;
                Ok(buffer.handle)
            }
            previous => {
                let handle = backend.allocate_buffer("species", bytes)?;
                if let Some(old) = previous {
                    backend.release_buffer(old.handle);
                }
                log::debug!("Species buffer allocated for {} species", records.len());
                self.species = Some(SizedBuffer { handle, len: records.len() });
                Ok(handle)
            }
        }
    }

    /// Read `count` agents back from the backend copy.
    pub fn read_agents<B: ComputeBackend + ?Sized>(
        &self,
        backend: &mut B,
        count: usize,
    ) -> SimResult<Vec<Agent>> {
        let Some(buffer) = self.agents else {
            return Ok(Vec::new());
        };
        let bytes = backend.read_buffer(buffer.handle)?;
        let mut agents: Vec<Agent> = bytemuck::pod_collect_to_vec(&bytes);
        agents.truncate(count.min(buffer.len));
        Ok(agents)
    }

    // ======================== Tick ========================

    /// Record and submit one tick: clear deposits, update agents, diffuse
    /// into the scratch texture. The caller swaps the field on success. On
    /// failure nothing recorded is kept and the field is untouched.
    pub fn run_update_and_diffuse<B: ComputeBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        population: &mut AgentPopulation,
        settings: &SimulationSettings,
        field: &Field,
        clock: TickClock,
    ) -> SimResult<()> {
        let result = self.record_tick(backend, population, settings, field, clock);
        let result = result.and_then(|()| backend.submit());
        if result.is_err() {
            backend.discard_pending();
        }
        result
    }

    fn record_tick<B: ComputeBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        population: &mut AgentPopulation,
        settings: &SimulationSettings,
        field: &Field,
        clock: TickClock,
    ) -> SimResult<()> {
        let agents = self.sync_agents(backend, population)?;
        let species = self.sync_species(backend, &settings.species)?;

        backend.set_scalar(Scalar::Width(field.width));
        backend.set_scalar(Scalar::Height(field.height));
        backend.set_scalar(Scalar::NumAgents(population.len() as u32));
        backend.set_scalar(Scalar::Frame(clock.frame));
        backend.set_scalar(Scalar::TrailWeight(settings.trail_weight));
        backend.set_scalar(Scalar::DecayRate(settings.decay_rate));
        backend.set_scalar(Scalar::DiffuseRate(settings.diffuse_rate));
        backend.set_scalar(Scalar::DeltaTime(clock.dt));
        backend.set_scalar(Scalar::Boundary(settings.boundary.as_u32()));

        backend.bind_buffer(Stage::UpdateAgents, Slot::Agents, agents);
        backend.bind_buffer(Stage::UpdateAgents, Slot::Species, species);
        backend.bind_texture(Stage::UpdateAgents, Slot::TrailMap, field.current_texture());
        backend.bind_texture(Stage::UpdateAgents, Slot::DepositMap, field.deposit_texture());

        backend.bind_texture(Stage::Diffuse, Slot::TrailMap, field.current_texture());
        backend.bind_texture(Stage::Diffuse, Slot::DepositMap, field.deposit_texture());
        backend.bind_texture(Stage::Diffuse, Slot::DiffusedTrailMap, field.scratch_texture());

        backend.clear_texture(field.deposit_texture());
        backend.dispatch(Stage::UpdateAgents, agent_workgroups(population.len()))?;
        backend.dispatch(Stage::Diffuse, field_workgroups(field.width, field.height))?;
        Ok(())
    }

    pub fn release<B: ComputeBackend + ?Sized>(&mut self, backend: &mut B) {
        if let Some(buffer) = self.agents.take() {
            backend.release_buffer(buffer.handle);
        }
        if let Some(buffer) = self.species.take() {
            backend.release_buffer(buffer.handle);
        }
    }
}
