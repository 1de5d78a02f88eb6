// ============================================================================
// backend.rs — slime-engine
// Compute backend contract: resource handles, binding slots, step uniforms and
// the verbs the pipeline drives (allocate / bind / set / dispatch / submit).
// ============================================================================

use bytemuck::{Pod, Zeroable};

use crate::config::SpeciesSettings;
use crate::error::SimResult;

pub const AGENT_WORKGROUP_SIZE: u32 = 64;
pub const FIELD_WORKGROUP_X: u32 = 16;
pub const FIELD_WORKGROUP_Y: u32 = 16;

/// Largest workgroup count a single dispatch dimension may carry.
pub const MAX_WORKGROUPS_PER_DIMENSION: u32 = 65_535;

/// Fixed-point scale of the deposit accumulator (u32 per channel).
pub const DEPOSIT_SCALE: f32 = 65536.0;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u32);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub u32);

/// The two kernels of one simulation tick.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    UpdateAgents,
    Diffuse,
}

/// Named binding points. Which ones a stage reads is fixed by the kernels.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Slot {
    Agents,
    Species,
    TrailMap,
    DepositMap,
    DiffusedTrailMap,
}

impl Stage {
    pub fn buffer_slots(self) -> &'static [Slot] {
        match self {
            Stage::UpdateAgents => &[Slot::Agents, Slot::Species],
            Stage::Diffuse => &[],
        }
    }

    pub fn texture_slots(self) -> &'static [Slot] {
        match self {
            Stage::UpdateAgents => &[Slot::TrailMap, Slot::DepositMap],
            Stage::Diffuse => &[Slot::TrailMap, Slot::DepositMap, Slot::DiffusedTrailMap],
        }
    }
}

/// Scalar parameters shared by both stages.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Scalar {
    Width(u32),
    Height(u32),
    NumAgents(u32),
    Frame(u32),
    TrailWeight(f32),
    DecayRate(f32),
    DiffuseRate(f32),
    DeltaTime(f32),
    Boundary(u32),
}

/// Uniform block seen by the kernels. Layout matches `struct Params` in the
/// WGSL sources.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct StepUniforms {
    pub width: u32,
    pub height: u32,
    pub num_agents: u32,
    pub frame: u32,
    pub trail_weight: f32,
    pub decay_rate: f32,
    pub diffuse_rate: f32,
    pub delta_time: f32,
    pub boundary: u32,
    pub deposit_scale: f32,
    pub _pad: [u32; 2],
}

impl StepUniforms {
    pub fn new() -> Self {
        Self {
            deposit_scale: DEPOSIT_SCALE,
            ..Default::default()
        }
    }

    pub fn apply(&mut self, scalar: Scalar) {
        match scalar {
            Scalar::Width(v) => self.width = v,
            Scalar::Height(v) => self.height = v,
            Scalar::NumAgents(v) => self.num_agents = v,
            Scalar::Frame(v) => self.frame = v,
            Scalar::TrailWeight(v) => self.trail_weight = v,
            Scalar::DecayRate(v) => self.decay_rate = v,
            Scalar::DiffuseRate(v) => self.diffuse_rate = v,
            Scalar::DeltaTime(v) => self.delta_time = v,
            Scalar::Boundary(v) => self.boundary = v,
        }
    }
}

/// GPU-side species record, 48 bytes.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct GpuSpecies {
    pub move_speed: f32,
    pub turn_speed: f32,
    pub sensor_angle_degrees: f32,
    pub sensor_offset_dst: f32,
    pub sensor_size: i32,
    pub _pad: [u32; 3],
    pub colour: [f32; 4],
}

impl From<&SpeciesSettings> for GpuSpecies {
    fn from(s: &SpeciesSettings) -> Self {
        Self {
            move_speed: s.move_speed,
            turn_speed: s.turn_speed,
            sensor_angle_degrees: s.sensor_angle_degrees,
            sensor_offset_dst: s.sensor_offset_dst,
            sensor_size: s.sensor_size as i32,
            _pad: [0; 3],
            colour: s.colour,
        }
    }
}

/// Execution target for the two simulation stages.
///
/// `clear_texture` and `dispatch` only record work. `submit` runs everything
/// recorded since the previous submit, in order, with a full barrier between
/// commands, and returns once the work has completed. A failed submit leaves
/// every resource as it was before the submit.
pub trait ComputeBackend {
    fn name(&self) -> &'static str;

    fn allocate_buffer(&mut self, label: &str, contents: &[u8]) -> SimResult<BufferHandle>;
    fn write_buffer(&mut self, buffer: BufferHandle, contents: &[u8]) -> SimResult<()>;
    fn read_buffer(&mut self, buffer: BufferHandle) -> SimResult<Vec<u8>>;
    fn release_buffer(&mut self, buffer: BufferHandle);

    /// Allocate a zeroed `width` x `height` texture of four 32-bit channels.
    fn allocate_texture(&mut self, label: &str, width: u32, height: u32) -> SimResult<TextureHandle>;
    fn write_texture(&mut self, texture: TextureHandle, texels: &[[f32; 4]]) -> SimResult<()>;
    fn read_texture(&mut self, texture: TextureHandle) -> SimResult<Vec<[f32; 4]>>;
    fn release_texture(&mut self, texture: TextureHandle);

    fn bind_buffer(&mut self, stage: Stage, slot: Slot, buffer: BufferHandle);
    fn bind_texture(&mut self, stage: Stage, slot: Slot, texture: TextureHandle);
    fn set_scalar(&mut self, scalar: Scalar);

    fn clear_texture(&mut self, texture: TextureHandle);
    fn dispatch(&mut self, stage: Stage, workgroups: [u32; 3]) -> SimResult<()>;
    fn submit(&mut self) -> SimResult<()>;

    /// Drop recorded commands without running them.
    fn discard_pending(&mut self);
}

pub fn ceil_div(x: u32, y: u32) -> u32 {
    x.div_ceil(y)
}

/// Workgroup counts covering every agent / every field cell.
pub fn agent_workgroups(num_agents: usize) -> [u32; 3] {
    [ceil_div(num_agents as u32, AGENT_WORKGROUP_SIZE).max(1), 1, 1]
}

pub fn field_workgroups(width: u32, height: u32) -> [u32; 3] {
    [
        ceil_div(width, FIELD_WORKGROUP_X),
        ceil_div(height, FIELD_WORKGROUP_Y),
        1,
    ]
}

/// Handle-indexed storage shared by the backends. Slots are never reused so a
/// stale handle can't alias a newer resource.
#[derive(Debug)]
pub(crate) struct Slab<T> {
    entries: Vec<Option<T>>,
}

impl<T> Default for Slab<T> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<T> Slab<T> {
    pub fn insert(&mut self, value: T) -> u32 {
        self.entries.push(Some(value));
        (self.entries.len() - 1) as u32
    }

    pub fn get(&self, id: u32) -> Option<&T> {
        self.entries.get(id as usize).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        self.entries.get_mut(id as usize).and_then(Option::as_mut)
    }

    pub fn remove(&mut self, id: u32) -> Option<T> {
        self.entries.get_mut(id as usize).and_then(Option::take)
    }

    pub fn live(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }
}
