// ============================================================================
// cpu.rs — slime-engine
// Reference backend: host memory resources, recorded command list, rayon for
// the data-parallel kernels. Used by tests and by hosts without a GPU.
// ============================================================================

use std::collections::HashMap;

use rayon::prelude::*;

use crate::agent::Agent;
use crate::backend::{
    BufferHandle, ComputeBackend, GpuSpecies, Scalar, Slab, Slot, Stage, StepUniforms,
    TextureHandle, AGENT_WORKGROUP_SIZE, FIELD_WORKGROUP_X, FIELD_WORKGROUP_Y,
    MAX_WORKGROUPS_PER_DIMENSION,
};
use crate::error::{SimError, SimResult};
use crate::kernels::{self, TrailView};

const AGENT_BYTES: usize = std::mem::size_of::<Agent>();
const SPECIES_BYTES: usize = std::mem::size_of::<GpuSpecies>();

struct CpuBuffer {
    label: String,
    words: Vec<u32>,
}

struct CpuTexture {
    label: String,
    width: u32,
    height: u32,
    texels: Vec<[u32; 4]>,
}

impl CpuTexture {
    fn byte_len(&self) -> u64 {
        self.texels.len() as u64 * 16
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Binding {
    Buffer(BufferHandle),
    Texture(TextureHandle),
}

enum Command {
    Clear(TextureHandle),
    Dispatch {
        stage: Stage,
        workgroups: [u32; 3],
        bindings: Vec<(Slot, Binding)>,
    },
}

/// A command whose resources have been checked against the live slabs.
enum Resolved {
    Clear(TextureHandle),
    UpdateAgents {
        agents: BufferHandle,
        species: BufferHandle,
        trail: TextureHandle,
        deposits: TextureHandle,
        count: usize,
    },
    Diffuse {
        trail: TextureHandle,
        deposits: TextureHandle,
        output: TextureHandle,
        x_end: u32,
        y_end: u32,
    },
}

#[derive(Default)]
pub struct CpuBackend {
    buffers: Slab<CpuBuffer>,
    textures: Slab<CpuTexture>,
    bindings: HashMap<(Stage, Slot), Binding>,
    uniforms: StepUniforms,
    pending: Vec<Command>,
    memory_limit: Option<u64>,
    allocated_bytes: u64,
    submissions: u64,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self {
            uniforms: StepUniforms::new(),
            ..Default::default()
        }
    }

    /// Backend that refuses allocations past `bytes` in total.
    pub fn with_memory_limit(bytes: u64) -> Self {
        Self {
            memory_limit: Some(bytes),
            ..Self::new()
        }
    }

    pub fn live_resources(&self) -> usize {
        self.buffers.live() + self.textures.live()
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes
    }

    pub fn pending_commands(&self) -> usize {
        self.pending.len()
    }

    pub fn submissions(&self) -> u64 {
        self.submissions
    }

    pub fn uniforms(&self) -> &StepUniforms {
        &self.uniforms
    }

    fn reserve(&mut self, label: &str, bytes: u64) -> SimResult<()> {
        if let Some(limit) = self.memory_limit {
            if self.allocated_bytes + bytes > limit {
                return Err(SimError::AllocationFailure {
                    label: label.to_string(),
                    bytes,
                });
            }
        }
        self.allocated_bytes += bytes;
        Ok(())
    }

    fn texture(&self, handle: TextureHandle) -> SimResult<&CpuTexture> {
        self.textures
            .get(handle.0)
            .ok_or_else(|| SimError::BackendUnavailable(format!("texture {} is not live", handle.0)))
    }

    fn buffer(&self, handle: BufferHandle) -> SimResult<&CpuBuffer> {
        self.buffers
            .get(handle.0)
            .ok_or_else(|| SimError::BackendUnavailable(format!("buffer {} is not live", handle.0)))
    }

    // ------------------------------------------------------------------
    // Validation: every recorded command is checked before any runs
    // ------------------------------------------------------------------

    fn resolve(&self, command: &Command) -> SimResult<Resolved> {
        let (stage, workgroups, bindings) = match command {
            Command::Clear(texture) => {
                self.texture(*texture)?;
                return Ok(Resolved::Clear(*texture));
            }
            Command::Dispatch { stage, workgroups, bindings } => (*stage, *workgroups, bindings),
        };

        let buffer_at = |slot: Slot| -> SimResult<BufferHandle> {
            match bindings.iter().find(|(s, _)| *s == slot) {
                Some((_, Binding::Buffer(b))) => Ok(*b),
                _ => Err(SimError::BackendUnavailable(format!("{stage:?}: no buffer bound at {slot:?}"))),
            }
        };
        let texture_at = |slot: Slot| -> SimResult<TextureHandle> {
            match bindings.iter().find(|(s, _)| *s == slot) {
                Some((_, Binding::Texture(t))) => Ok(*t),
                _ => Err(SimError::BackendUnavailable(format!("{stage:?}: no texture bound at {slot:?}"))),
            }
        };
        let (width, height) = (self.uniforms.width, self.uniforms.height);
        let check_dims = |texture: TextureHandle| -> SimResult<()> {
            let t = self.texture(texture)?;
            if t.width != width || t.height != height {
                return Err(SimError::BackendUnavailable(format!(
                    "texture `{}` is {}x{} but the step runs on {}x{}",
                    t.label, t.width, t.height, width, height
                )));
            }
            Ok(())
        };

        let trail = texture_at(Slot::TrailMap)?;
        let deposits = texture_at(Slot::DepositMap)?;
        check_dims(trail)?;
        check_dims(deposits)?;
        if trail == deposits {
            return Err(SimError::BackendUnavailable("trail and deposit maps alias".into()));
        }

        match stage {
            Stage::UpdateAgents => {
                let agents = buffer_at(Slot::Agents)?;
                let species = buffer_at(Slot::Species)?;
                let agent_buf = self.buffer(agents)?;
                let species_buf = self.buffer(species)?;

                let agent_bytes = agent_buf.words.len() * 4;
                let count = (self.uniforms.num_agents as usize)
                    .min(workgroups[0] as usize * AGENT_WORKGROUP_SIZE as usize);
                if agent_bytes % AGENT_BYTES != 0 || agent_bytes < count * AGENT_BYTES {
                    return Err(SimError::BackendUnavailable(format!(
                        "agent buffer `{}` holds {agent_bytes} bytes, {count} agents requested",
                        agent_buf.label
                    )));
                }
                let species_bytes = species_buf.words.len() * 4;
                if species_bytes == 0 || species_bytes % SPECIES_BYTES != 0 {
                    return Err(SimError::BackendUnavailable(format!(
                        "species buffer `{}` has invalid size {species_bytes}",
                        species_buf.label
                    )));
                }
                let species_count = (species_bytes / SPECIES_BYTES) as u32;
                let agents_view: &[Agent] = bytemuck::cast_slice(&agent_buf.words);
                if agents_view[..count].iter().any(|a| a.species_index >= species_count) {
                    return Err(SimError::BackendUnavailable(
                        "agent references a species outside the species buffer".into(),
                    ));
                }
                Ok(Resolved::UpdateAgents { agents, species, trail, deposits, count })
            }
            Stage::Diffuse => {
                let output = texture_at(Slot::DiffusedTrailMap)?;
                check_dims(output)?;
                if output == trail || output == deposits {
                    return Err(SimError::BackendUnavailable(
                        "diffusion output aliases one of its inputs".into(),
                    ));
                }
                Ok(Resolved::Diffuse {
                    trail,
                    deposits,
                    output,
                    x_end: (workgroups[0] * FIELD_WORKGROUP_X).min(width),
                    y_end: (workgroups[1] * FIELD_WORKGROUP_Y).min(height),
                })
            }
        }
    }

    // ------------------------------------------------------------------
    // Execution: resolved commands only touch live, correctly sized data
    // ------------------------------------------------------------------

    fn execute(&mut self, command: Resolved) {
        match command {
            Resolved::Clear(texture) => {
                if let Some(t) = self.textures.get_mut(texture.0) {
                    t.texels.fill([0; 4]);
                }
            }
            Resolved::UpdateAgents { agents, species, trail, deposits, count } => {
                self.run_update_agents(agents, species, trail, deposits, count)
            }
            Resolved::Diffuse { trail, deposits, output, x_end, y_end } => {
                self.run_diffuse(trail, deposits, output, x_end, y_end)
            }
        }
    }

    fn run_update_agents(
        &mut self,
        agents: BufferHandle,
        species: BufferHandle,
        trail: TextureHandle,
        deposits: TextureHandle,
        count: usize,
    ) {
        let u = self.uniforms;
        let Some(species) = self.buffers.get(species.0) else { return };
        let species: Vec<GpuSpecies> = bytemuck::pod_collect_to_vec(&species.words);
        let Some(trail) = self.textures.get(trail.0) else { return };
        let view = TrailView {
            width: trail.width,
            height: trail.height,
            texels: bytemuck::cast_slice(&trail.texels),
            wrap: u.boundary == 1,
        };
        let Some(agent_buf) = self.buffers.get_mut(agents.0) else { return };
        let agents: &mut [Agent] = bytemuck::cast_slice_mut(&mut agent_buf.words);

        let produced: Vec<Option<kernels::Deposit>> = agents[..count]
            .par_iter_mut()
            .enumerate()
            .map(|(i, agent)| {
                let sp = species.get(agent.species_index as usize)?;
                kernels::update_agent(i as u32, agent, sp, &view, &u)
            })
            .collect();

        let Some(accumulator) = self.textures.get_mut(deposits.0) else { return };
        for (cell, amount) in produced.into_iter().flatten() {
            let texel = &mut accumulator.texels[cell];
            for c in 0..3 {
                texel[c] = texel[c].saturating_add(amount[c]);
            }
        }
    }

    fn run_diffuse(
        &mut self,
        trail: TextureHandle,
        deposits: TextureHandle,
        output: TextureHandle,
        x_end: u32,
        y_end: u32,
    ) {
        let u = self.uniforms;
        let (Some(trail), Some(deposits)) = (self.textures.get(trail.0), self.textures.get(deposits.0))
        else {
            return;
        };
        let width = trail.width;
        let view = TrailView {
            width,
            height: trail.height,
            texels: bytemuck::cast_slice(&trail.texels),
            wrap: u.boundary == 1,
        };
        let deposit_texels = &deposits.texels;

        let rows: Vec<Vec<[f32; 4]>> = (0..y_end)
            .into_par_iter()
            .map(|y| {
                (0..x_end)
                    .map(|x| kernels::diffuse_cell(x, y, &view, deposit_texels, &u))
                    .collect()
            })
            .collect();

        let Some(out) = self.textures.get_mut(output.0) else { return };
        let out_texels: &mut [[f32; 4]] = bytemuck::cast_slice_mut(&mut out.texels);
        for (y, row) in rows.into_iter().enumerate() {
            let start = y * width as usize;
            out_texels[start..start + row.len()].copy_from_slice(&row);
        }
    }
}

impl ComputeBackend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn allocate_buffer(&mut self, label: &str, contents: &[u8]) -> SimResult<BufferHandle> {
        if contents.len() % 4 != 0 {
            return Err(SimError::InvalidArgument(format!(
                "buffer `{label}` size {} is not a multiple of 4",
                contents.len()
            )));
        }
        self.reserve(label, contents.len() as u64)?;
        let words = bytemuck::pod_collect_to_vec(contents);
        let id = self.buffers.insert(CpuBuffer { label: label.to_string(), words });
        Ok(BufferHandle(id))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, contents: &[u8]) -> SimResult<()> {
        let buf = self
            .buffers
            .get_mut(buffer.0)
            .ok_or_else(|| SimError::InvalidArgument(format!("buffer {} is not live", buffer.0)))?;
        if contents.len() % 4 != 0 || contents.len() > buf.words.len() * 4 {
            return Err(SimError::InvalidArgument(format!(
                "write of {} bytes does not fit buffer `{}`",
                contents.len(),
                buf.label
            )));
        }
        let words: Vec<u32> = bytemuck::pod_collect_to_vec(contents);
        buf.words[..words.len()].copy_from_slice(&words);
        Ok(())
    }

    fn read_buffer(&mut self, buffer: BufferHandle) -> SimResult<Vec<u8>> {
        let buf = self.buffer(buffer)?;
        Ok(bytemuck::cast_slice(&buf.words).to_vec())
    }

    fn release_buffer(&mut self, buffer: BufferHandle) {
        if let Some(buf) = self.buffers.remove(buffer.0) {
            self.allocated_bytes -= buf.words.len() as u64 * 4;
        }
    }

    fn allocate_texture(&mut self, label: &str, width: u32, height: u32) -> SimResult<TextureHandle> {
        if width == 0 || height == 0 {
            return Err(SimError::InvalidArgument(format!(
                "texture `{label}` must have positive dimensions"
            )));
        }
        let cells = width as usize * height as usize;
        self.reserve(label, cells as u64 * 16)?;
        let id = self.textures.insert(CpuTexture {
            label: label.to_string(),
            width,
            height,
            texels: vec![[0; 4]; cells],
        });
        Ok(TextureHandle(id))
    }

    fn write_texture(&mut self, texture: TextureHandle, texels: &[[f32; 4]]) -> SimResult<()> {
        let t = self
            .textures
            .get_mut(texture.0)
            .ok_or_else(|| SimError::InvalidArgument(format!("texture {} is not live", texture.0)))?;
        if texels.len() != t.texels.len() {
            return Err(SimError::InvalidArgument(format!(
                "texture `{}` holds {} texels, got {}",
                t.label,
                t.texels.len(),
                texels.len()
            )));
        }
        t.texels.copy_from_slice(bytemuck::cast_slice(texels));
        Ok(())
    }

    fn read_texture(&mut self, texture: TextureHandle) -> SimResult<Vec<[f32; 4]>> {
        let t = self.texture(texture)?;
        Ok(bytemuck::cast_slice(&t.texels).to_vec())
    }

    fn release_texture(&mut self, texture: TextureHandle) {
        if let Some(t) = self.textures.remove(texture.0) {
            self.allocated_bytes -= t.byte_len();
        }
    }

    fn bind_buffer(&mut self, stage: Stage, slot: Slot, buffer: BufferHandle) {
        self.bindings.insert((stage, slot), Binding::Buffer(buffer));
    }

    fn bind_texture(&mut self, stage: Stage, slot: Slot, texture: TextureHandle) {
        self.bindings.insert((stage, slot), Binding::Texture(texture));
    }

    fn set_scalar(&mut self, scalar: Scalar) {
        self.uniforms.apply(scalar);
    }

    fn clear_texture(&mut self, texture: TextureHandle) {
        self.pending.push(Command::Clear(texture));
    }

    fn dispatch(&mut self, stage: Stage, workgroups: [u32; 3]) -> SimResult<()> {
        if workgroups.iter().any(|&n| n > MAX_WORKGROUPS_PER_DIMENSION) {
            return Err(SimError::BackendUnavailable(format!(
                "{stage:?}: workgroup count {workgroups:?} exceeds {MAX_WORKGROUPS_PER_DIMENSION}"
            )));
        }
        let slots = stage.buffer_slots().iter().chain(stage.texture_slots());
        let mut bindings = Vec::new();
        for &slot in slots {
            let binding = self.bindings.get(&(stage, slot)).copied().ok_or_else(|| {
                SimError::BackendUnavailable(format!("{stage:?}: nothing bound at {slot:?}"))
            })?;
            bindings.push((slot, binding));
        }
        self.pending.push(Command::Dispatch { stage, workgroups, bindings });
        Ok(())
    }

    fn submit(&mut self) -> SimResult<()> {
        let commands = std::mem::take(&mut self.pending);
        let resolved = commands
            .iter()
            .map(|c| self.resolve(c))
            .collect::<SimResult<Vec<_>>>()?;
        for command in resolved {
            self.execute(command);
        }
        self.submissions += 1;
        log::trace!("cpu submit #{} ran {} commands", self.submissions, commands.len());
        Ok(())
    }

    fn discard_pending(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{agent_workgroups, field_workgroups, DEPOSIT_SCALE};
    use crate::config::SpeciesSettings;

    fn setup(backend: &mut CpuBackend, agents: &[Agent], w: u32, h: u32) -> [TextureHandle; 3] {
        let species = [GpuSpecies::from(&SpeciesSettings { move_speed: 0.0, ..Default::default() })];
        let a = backend.allocate_buffer("agents", bytemuck::cast_slice(agents)).unwrap();
        let s = backend.allocate_buffer("species", bytemuck::cast_slice(&species)).unwrap();
        let trail = backend.allocate_texture("trail", w, h).unwrap();
        let deposits = backend.allocate_texture("deposits", w, h).unwrap();
        let out = backend.allocate_texture("out", w, h).unwrap();

        backend.set_scalar(Scalar::Width(w));
        backend.set_scalar(Scalar::Height(h));
        backend.set_scalar(Scalar::NumAgents(agents.len() as u32));
        backend.set_scalar(Scalar::TrailWeight(5.0));
        backend.set_scalar(Scalar::DeltaTime(1.0 / 60.0));
        backend.bind_buffer(Stage::UpdateAgents, Slot::Agents, a);
        backend.bind_buffer(Stage::UpdateAgents, Slot::Species, s);
        for stage in [Stage::UpdateAgents, Stage::Diffuse] {
            backend.bind_texture(stage, Slot::TrailMap, trail);
            backend.bind_texture(stage, Slot::DepositMap, deposits);
        }
        backend.bind_texture(Stage::Diffuse, Slot::DiffusedTrailMap, out);
        [trail, deposits, out]
    }

    #[test]
    fn commands_only_run_on_submit() {
        let mut backend = CpuBackend::new();
        let agents = [Agent::new([1.5, 1.5], 0.0, 0, Agent::ALL_CHANNELS)];
        let [_, deposits, out] = setup(&mut backend, &agents, 4, 4);

        backend.dispatch(Stage::UpdateAgents, agent_workgroups(1)).unwrap();
        backend.dispatch(Stage::Diffuse, field_workgroups(4, 4)).unwrap();
        assert_eq!(backend.pending_commands(), 2);
        assert!(backend.read_texture(out).unwrap().iter().all(|t| *t == [0.0; 4]));

        backend.submit().unwrap();
        assert_eq!(backend.pending_commands(), 0);
        let raw = backend.read_texture(deposits).unwrap();
        let bits = raw[5].map(f32::to_bits);
        assert_eq!(bits[0], (5.0f32 / 60.0 * DEPOSIT_SCALE).round() as u32);
        let diffused = backend.read_texture(out).unwrap();
        assert!((diffused[5][0] - 5.0 / 60.0).abs() < 1e-4);
    }

    #[test]
    fn concurrent_deposits_into_one_cell_all_count() {
        let mut backend = CpuBackend::new();
        let agents = vec![Agent::new([0.5, 0.5], 0.0, 0, Agent::ALL_CHANNELS); 200];
        let [_, deposits, _] = setup(&mut backend, &agents, 2, 2);
        backend.dispatch(Stage::UpdateAgents, agent_workgroups(agents.len())).unwrap();
        backend.submit().unwrap();
        let raw = backend.read_texture(deposits).unwrap();
        let one = (5.0f32 / 60.0 * DEPOSIT_SCALE).round() as u32;
        assert_eq!(raw[0][1].to_bits(), one * 200);
    }

    #[test]
    fn overflowing_deposits_saturate() {
        let mut backend = CpuBackend::new();
        let agents = vec![Agent::new([0.5, 0.5], 0.0, 0, Agent::ALL_CHANNELS); 3];
        let [_, deposits, out] = setup(&mut backend, &agents, 2, 2);
        // ~2^31 units per agent, so three of them overflow a u32
        backend.set_scalar(Scalar::TrailWeight(60.0 * 32_768.0));
        backend.set_scalar(Scalar::DecayRate(0.0));
        backend.set_scalar(Scalar::DiffuseRate(0.0));
        backend.dispatch(Stage::UpdateAgents, agent_workgroups(agents.len())).unwrap();
        backend.dispatch(Stage::Diffuse, field_workgroups(2, 2)).unwrap();
        backend.submit().unwrap();

        let raw = backend.read_texture(deposits).unwrap();
        assert_eq!(raw[0][0].to_bits(), u32::MAX);
        assert_eq!(backend.read_texture(out).unwrap()[0], [1.0, 1.0, 1.0, 0.0]);
    }

    #[test]
    fn failed_submit_changes_nothing() {
        let mut backend = CpuBackend::new();
        let agents = [Agent::new([1.5, 1.5], 0.0, 0, Agent::ALL_CHANNELS)];
        let [trail, deposits, out] = setup(&mut backend, &agents, 4, 4);
        let seeded = vec![[0.5, 0.25, 0.0, 0.0]; 16];
        backend.write_texture(trail, &seeded).unwrap();
        backend.write_texture(deposits, &vec![[0.0; 4]; 16]).unwrap();

        backend.clear_texture(out);
        backend.dispatch(Stage::UpdateAgents, agent_workgroups(1)).unwrap();
        // field size no longer matches the bound textures
        backend.set_scalar(Scalar::Width(8));
        let err = backend.submit().unwrap_err();
        assert!(matches!(err, SimError::BackendUnavailable(_)));

        assert_eq!(backend.read_texture(trail).unwrap(), seeded);
        assert!(backend.read_texture(deposits).unwrap().iter().all(|t| *t == [0.0; 4]));
        assert_eq!(backend.pending_commands(), 0);
        assert_eq!(backend.submissions(), 0);
    }

    #[test]
    fn dispatch_without_bindings_is_rejected() {
        let mut backend = CpuBackend::new();
        let err = backend.dispatch(Stage::Diffuse, [1, 1, 1]).unwrap_err();
        assert!(matches!(err, SimError::BackendUnavailable(_)));
        assert_eq!(backend.pending_commands(), 0);
    }

    #[test]
    fn oversized_dispatch_is_rejected() {
        let mut backend = CpuBackend::new();
        let agents = [Agent::new([0.0, 0.0], 0.0, 0, Agent::ALL_CHANNELS)];
        setup(&mut backend, &agents, 2, 2);
        let err = backend.dispatch(Stage::UpdateAgents, [70_000, 1, 1]).unwrap_err();
        assert!(matches!(err, SimError::BackendUnavailable(_)));
    }

    #[test]
    fn memory_limit_yields_allocation_failure() {
        let mut backend = CpuBackend::with_memory_limit(1024);
        let small = backend.allocate_texture("small", 4, 4).unwrap();
        let err = backend.allocate_texture("big", 64, 64).unwrap_err();
        assert!(matches!(err, SimError::AllocationFailure { bytes: 65536, .. }));
        backend.release_texture(small);
        assert_eq!(backend.allocated_bytes(), 0);
        assert_eq!(backend.live_resources(), 0);
    }

    #[test]
    fn buffer_write_and_read() {
        let mut backend = CpuBackend::new();
        let b = backend.allocate_buffer("b", &[0u8; 16]).unwrap();
        backend.write_buffer(b, &[1, 0, 0, 0, 2, 0, 0, 0]).unwrap();
        let bytes = backend.read_buffer(b).unwrap();
        assert_eq!(&bytes[..8], &[1, 0, 0, 0, 2, 0, 0, 0]);
        assert!(backend.write_buffer(b, &[0u8; 20]).is_err());
        assert!(backend.allocate_buffer("odd", &[0u8; 3]).is_err());
    }

    #[test]
    fn clear_zeroes_a_texture() {
        let mut backend = CpuBackend::new();
        let t = backend.allocate_texture("t", 2, 2).unwrap();
        backend.write_texture(t, &[[1.0; 4]; 4]).unwrap();
        backend.clear_texture(t);
        assert_eq!(backend.read_texture(t).unwrap()[0], [1.0; 4]);
        backend.submit().unwrap();
        assert_eq!(backend.read_texture(t).unwrap(), vec![[0.0; 4]; 4]);
    }
}
