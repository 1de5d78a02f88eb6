// ============================================================================
// agent.rs — slime-engine
// Agent record (GPU layout) and the live agent population.
// ============================================================================

use bytemuck::{Pod, Zeroable};

use crate::config::MAX_SPECIES;
use crate::error::{SimError, SimResult};

/// One simulated particle. Layout matches `struct Agent` in the WGSL shaders:
/// position (0), angle (8), species_index (12), species_mask (16, vec3<i32>).
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct Agent {
    pub position: [f32; 2],
    pub angle: f32,
    pub species_index: u32,
    pub species_mask: [i32; 3],
    pub _pad: i32,
}

impl Agent {
    pub fn new(position: [f32; 2], angle: f32, species_index: u32, species_mask: [i32; 3]) -> Self {
        Self {
            position,
            angle,
            species_index,
            species_mask,
            _pad: 0,
        }
    }

    /// Mask used when only one species exists: the agent reads and writes
    /// every trail channel.
    pub const ALL_CHANNELS: [i32; 3] = [1, 1, 1];

    pub fn one_hot(species_index: u32) -> [i32; 3] {
        let mut mask = [0; 3];
        mask[species_index as usize] = 1;
        mask
    }

    /// The mask is all channels on species 0, or one-hot on `species_index`.
    pub fn has_consistent_mask(&self) -> bool {
        let index = self.species_index as usize;
        (index == 0 && self.species_mask == Self::ALL_CHANNELS)
            || (index < MAX_SPECIES && self.species_mask == Self::one_hot(self.species_index))
    }

    /// Position is finite and inside a `width` x `height` field.
    pub fn is_inside(&self, width: u32, height: u32) -> bool {
        (0.0..width as f32).contains(&self.position[0])
            && (0.0..height as f32).contains(&self.position[1])
    }
}

/// The ordered agent sequence plus a flag recording whether the backend copy
/// is stale.
#[derive(Clone, Debug, Default)]
pub struct AgentPopulation {
    agents: Vec<Agent>,
    dirty: bool,
}

impl AgentPopulation {
    pub fn new(agents: Vec<Agent>) -> Self {
        Self { agents, dirty: true }
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn as_slice(&self) -> &[Agent] {
        &self.agents
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_uploaded(&mut self) {
        self.dirty = false;
    }

    /// Replace the CPU mirror with agents read back from the backend. The
    /// backend copy is authoritative, so this does not dirty the population.
    pub fn sync_from_backend(&mut self, agents: Vec<Agent>) {
        self.agents = agents;
    }

    /// Drop the oldest `new_agents.len()` agents and append `new_agents`.
    /// Leaves the population untouched on error.
    pub fn replace_prefix(&mut self, new_agents: &[Agent]) -> SimResult<()> {
        if new_agents.len() > self.agents.len() {
            return Err(SimError::InvalidArgument(format!(
                "cannot replace {} agents in a population of {}",
                new_agents.len(),
                self.agents.len()
            )));
        }
        self.agents.drain(..new_agents.len());
        self.agents.extend_from_slice(new_agents);
        self.dirty = true;
        Ok(())
    }
}
