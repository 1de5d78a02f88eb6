// ============================================================================
// gpu.rs — slime-engine
// wgpu backend: storage-buffer resources, the two compute pipelines and
// fenced submission with error scopes.
// ============================================================================

use std::collections::HashMap;

use crate::backend::{
    BufferHandle, ComputeBackend, Scalar, Slab, Slot, Stage, StepUniforms, TextureHandle,
};
use crate::error::{SimError, SimResult};

const TEXEL_BYTES: u64 = 16;

struct GpuBuffer {
    label: String,
    buffer: wgpu::Buffer,
    size: u64,
}

struct GpuTexture {
    label: String,
    width: u32,
    height: u32,
    buffer: wgpu::Buffer,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
enum Binding {
    Buffer(BufferHandle),
    Texture(TextureHandle),
}

/// Bind groups are cached per stage and per set of bound resources.
type BindKey = (Stage, Vec<Binding>);

enum Command {
    Clear(TextureHandle),
    Dispatch {
        stage: Stage,
        workgroups: [u32; 3],
        key: BindKey,
    },
}

pub struct GpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_name: String,

    agents_pipeline: wgpu::ComputePipeline,
    agents_bgl: wgpu::BindGroupLayout,
    diffuse_pipeline: wgpu::ComputePipeline,
    diffuse_bgl: wgpu::BindGroupLayout,
    params_buffer: wgpu::Buffer,
    uniforms: StepUniforms,

    buffers: Slab<GpuBuffer>,
    textures: Slab<GpuTexture>,
    bindings: HashMap<(Stage, Slot), Binding>,
    bind_groups: HashMap<BindKey, wgpu::BindGroup>,
    pending: Vec<Command>,
}

impl GpuBackend {
    /// Acquire an adapter and device without a surface.
    pub fn new() -> SimResult<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| SimError::BackendUnavailable("no GPU adapter available".into()))?;

        let adapter_limits = adapter.limits();
        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("slime_engine_device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits {
                    max_storage_buffer_binding_size: adapter_limits
                        .max_storage_buffer_binding_size
                        .min(256 * 1024 * 1024),
                    ..Default::default()
                },
                memory_hints: Default::default(),
            },
            None,
        ))
        .map_err(|e| SimError::BackendUnavailable(format!("failed to create device: {e}")))?;

        device.on_uncaptured_error(Box::new(|e| {
            log::error!("Uncaptured wgpu error: {e}");
        }));

        let adapter_name = adapter.get_info().name;
        log::info!("GPU backend on {adapter_name}");

        let agents_shader = load_shader(&device, "agents", include_str!("shaders/agents.wgsl"));
        let diffuse_shader = load_shader(&device, "diffuse", include_str!("shaders/diffuse.wgsl"));

        let agents_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("agents_bgl"),
            entries: &[
                bgl_uniform(0),
                bgl_storage_rw(1),
                bgl_storage_ro(2),
                bgl_storage_ro(3),
                bgl_storage_rw(4),
            ],
        });
        let agents_pipeline = create_compute_pipeline(&device, "agents", &agents_bgl, &agents_shader, "update");

        let diffuse_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("diffuse_bgl"),
            entries: &[
                bgl_uniform(0),
                bgl_storage_ro(1),
                bgl_storage_ro(2),
                bgl_storage_rw(3),
            ],
        });
        let diffuse_pipeline =
            create_compute_pipeline(&device, "diffuse", &diffuse_bgl, &diffuse_shader, "diffuse");

        let uniforms = StepUniforms::new();
        let params_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("step_params"),
            size: std::mem::size_of::<StepUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Ok(Self {
            device,
            queue,
            adapter_name,
            agents_pipeline,
            agents_bgl,
            diffuse_pipeline,
            diffuse_bgl,
            params_buffer,
            uniforms,
            buffers: Slab::default(),
            textures: Slab::default(),
            bindings: HashMap::new(),
            bind_groups: HashMap::new(),
            pending: Vec::new(),
        })
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    fn create_storage(&self, label: &str, size: u64) -> SimResult<wgpu::Buffer> {
        let limits = self.device.limits();
        if size > limits.max_buffer_size || size > limits.max_storage_buffer_binding_size as u64 {
            return Err(SimError::AllocationFailure {
                label: label.to_string(),
                bytes: size,
            });
        }
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        if let Some(e) = pollster::block_on(self.device.pop_error_scope()) {
            log::warn!("Allocation of `{label}` ({size} bytes) failed: {e}");
            return Err(SimError::AllocationFailure {
                label: label.to_string(),
                bytes: size,
            });
        }
        Ok(buffer)
    }

    /// Copy a storage buffer into a mappable staging buffer and wait for it.
    fn read_back(&self, source: &wgpu::Buffer, size: u64) -> SimResult<Vec<u8>> {
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("slime_readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("readback_encoder"),
        });
        encoder.copy_buffer_to_buffer(source, 0, &staging, 0, size);
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);

        match rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(SimError::BackendUnavailable(format!("readback failed: {e}"))),
            Err(_) => return Err(SimError::BackendUnavailable("readback never completed".into())),
        }
        let bytes = slice.get_mapped_range().to_vec();
        staging.unmap();
        Ok(bytes)
    }

    fn binding_resource(&self, binding: Binding) -> Option<&wgpu::Buffer> {
        match binding {
            Binding::Buffer(b) => self.buffers.get(b.0).map(|b| &b.buffer),
            Binding::Texture(t) => self.textures.get(t.0).map(|t| &t.buffer),
        }
    }

    fn create_bind_group(&self, stage: Stage, bound: &[Binding]) -> SimResult<wgpu::BindGroup> {
        let mut resources = Vec::with_capacity(bound.len());
        for &binding in bound {
            let buffer = self.binding_resource(binding).ok_or_else(|| {
                SimError::BackendUnavailable(format!("{stage:?}: bound resource {binding:?} was released"))
            })?;
            resources.push(buffer);
        }

        let (label, layout) = match stage {
            Stage::UpdateAgents => ("agents_bg", &self.agents_bgl),
            Stage::Diffuse => ("diffuse_bg", &self.diffuse_bgl),
        };
        let mut entries = vec![bg_buffer(0, &self.params_buffer)];
        entries.extend(
            resources
                .iter()
                .enumerate()
                .map(|(i, buffer)| bg_buffer(i as u32 + 1, buffer)),
        );
        Ok(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
            layout,
            entries: &entries,
        }))
    }

    fn check_dims(&self, key: &BindKey) -> SimResult<()> {
        for binding in &key.1 {
            if let Binding::Texture(t) = binding {
                let texture = self.textures.get(t.0).ok_or_else(|| {
                    SimError::BackendUnavailable(format!("texture {} was released", t.0))
                })?;
                if texture.width != self.uniforms.width || texture.height != self.uniforms.height {
                    return Err(SimError::BackendUnavailable(format!(
                        "texture `{}` is {}x{} but the step runs on {}x{}",
                        texture.label,
                        texture.width,
                        texture.height,
                        self.uniforms.width,
                        self.uniforms.height
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Bind order of each stage's resources; matches the WGSL binding indices
/// after the uniform block at binding 0.
fn stage_layout(stage: Stage) -> &'static [Slot] {
    match stage {
        Stage::UpdateAgents => &[Slot::Agents, Slot::Species, Slot::TrailMap, Slot::DepositMap],
        Stage::Diffuse => &[Slot::TrailMap, Slot::DepositMap, Slot::DiffusedTrailMap],
    }
}

impl ComputeBackend for GpuBackend {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn allocate_buffer(&mut self, label: &str, contents: &[u8]) -> SimResult<BufferHandle> {
        let size = contents.len() as u64;
        if size == 0 || size % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
            return Err(SimError::InvalidArgument(format!(
                "buffer `{label}` size {size} must be a positive multiple of 4"
            )));
        }
        let buffer = self.create_storage(label, size)?;
        self.queue.write_buffer(&buffer, 0, contents);
        let id = self.buffers.insert(GpuBuffer { label: label.to_string(), buffer, size });
        Ok(BufferHandle(id))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, contents: &[u8]) -> SimResult<()> {
        let buf = self
            .buffers
            .get(buffer.0)
            .ok_or_else(|| SimError::InvalidArgument(format!("buffer {} is not live", buffer.0)))?;
        let len = contents.len() as u64;
        if len % wgpu::COPY_BUFFER_ALIGNMENT != 0 || len > buf.size {
            return Err(SimError::InvalidArgument(format!(
                "write of {len} bytes does not fit buffer `{}`",
                buf.label
            )));
        }
        self.queue.write_buffer(&buf.buffer, 0, contents);
        Ok(())
    }

    fn read_buffer(&mut self, buffer: BufferHandle) -> SimResult<Vec<u8>> {
        let buf = self
            .buffers
            .get(buffer.0)
            .ok_or_else(|| SimError::InvalidArgument(format!("buffer {} is not live", buffer.0)))?;
        self.read_back(&buf.buffer, buf.size)
    }

    fn release_buffer(&mut self, buffer: BufferHandle) {
        if let Some(buf) = self.buffers.remove(buffer.0) {
            buf.buffer.destroy();
            self.bind_groups
                .retain(|(_, bound), _| !bound.contains(&Binding::Buffer(buffer)));
        }
    }

    fn allocate_texture(&mut self, label: &str, width: u32, height: u32) -> SimResult<TextureHandle> {
        if width == 0 || height == 0 {
            return Err(SimError::InvalidArgument(format!(
                "texture `{label}` must have positive dimensions"
            )));
        }
        let size = width as u64 * height as u64 * TEXEL_BYTES;
        let buffer = self.create_storage(label, size)?;
        let id = self.textures.insert(GpuTexture {
            label: label.to_string(),
            width,
            height,
            buffer,
        });
        Ok(TextureHandle(id))
    }

    fn write_texture(&mut self, texture: TextureHandle, texels: &[[f32; 4]]) -> SimResult<()> {
        let t = self
            .textures
            .get(texture.0)
            .ok_or_else(|| SimError::InvalidArgument(format!("texture {} is not live", texture.0)))?;
        let expected = t.width as usize * t.height as usize;
        if texels.len() != expected {
            return Err(SimError::InvalidArgument(format!(
                "texture `{}` holds {expected} texels, got {}",
                t.label,
                texels.len()
            )));
        }
        self.queue.write_buffer(&t.buffer, 0, bytemuck::cast_slice(texels));
        Ok(())
    }

    fn read_texture(&mut self, texture: TextureHandle) -> SimResult<Vec<[f32; 4]>> {
        let t = self
            .textures
            .get(texture.0)
            .ok_or_else(|| SimError::InvalidArgument(format!("texture {} is not live", texture.0)))?;
        let size = t.width as u64 * t.height as u64 * TEXEL_BYTES;
        let bytes = self.read_back(&t.buffer, size)?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }

    fn release_texture(&mut self, texture: TextureHandle) {
        if let Some(t) = self.textures.remove(texture.0) {
            t.buffer.destroy();
            self.bind_groups
                .retain(|(_, bound), _| !bound.contains(&Binding::Texture(texture)));
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
        let max = self.device.limits().max_compute_workgroups_per_dimension;
        if workgroups.iter().any(|&n| n > max) {
            return Err(SimError::BackendUnavailable(format!(
                "{stage:?}: workgroup count {workgroups:?} exceeds {max}"
            )));
        }

        let mut bound = Vec::new();
        for &slot in stage_layout(stage) {
            let binding = self.bindings.get(&(stage, slot)).copied().ok_or_else(|| {
                SimError::BackendUnavailable(format!("{stage:?}: nothing bound at {slot:?}"))
            })?;
            bound.push(binding);
        }
        let key = (stage, bound);
        if !self.bind_groups.contains_key(&key) {
            let group = self.create_bind_group(stage, &key.1)?;
            self.bind_groups.insert(key.clone(), group);
        }
        self.pending.push(Command::Dispatch { stage, workgroups, key });
        Ok(())
    }

    fn submit(&mut self) -> SimResult<()> {
        let commands = std::mem::take(&mut self.pending);
        for command in &commands {
            if let Command::Dispatch { key, .. } = command {
                self.check_dims(key)?;
            }
        }

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);

        self.queue
            .write_buffer(&self.params_buffer, 0, bytemuck::bytes_of(&self.uniforms));

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("slime_step_encoder"),
        });
        for command in &commands {
            match command {
                Command::Clear(texture) => {
                    if let Some(t) = self.textures.get(texture.0) {
                        encoder.clear_buffer(&t.buffer, 0, None);
                    }
                }
                Command::Dispatch { stage, workgroups, key } => {
                    let (label, pipeline) = match stage {
                        Stage::UpdateAgents => ("update_agents", &self.agents_pipeline),
                        Stage::Diffuse => ("diffuse", &self.diffuse_pipeline),
                    };
                    let Some(group) = self.bind_groups.get(key) else {
                        continue;
                    };
                    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                        label: Some(label),
                        timestamp_writes: None,
                    });
                    pass.set_pipeline(pipeline);
                    pass.set_bind_group(0, group, &[]);
                    pass.dispatch_workgroups(workgroups[0], workgroups[1], workgroups[2]);
                }
            }
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        self.device.poll(wgpu::Maintain::Wait);

        let validation = pollster::block_on(self.device.pop_error_scope());
        let out_of_memory = pollster::block_on(self.device.pop_error_scope());
        if let Some(e) = out_of_memory {
            return Err(SimError::AllocationFailure {
                label: format!("submission: {e}"),
                bytes: 0,
            });
        }
        if let Some(e) = validation {
            return Err(SimError::BackendUnavailable(format!("submission rejected: {e}")));
        }
        Ok(())
    }

    fn discard_pending(&mut self) {
        self.pending.clear();
    }
}

// ======================== Helpers ========================

fn load_shader(device: &wgpu::Device, label: &str, source: &str) -> wgpu::ShaderModule {
    device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    })
}

fn create_compute_pipeline(
    device: &wgpu::Device,
    name: &str,
    bgl: &wgpu::BindGroupLayout,
    module: &wgpu::ShaderModule,
    entry_point: &str,
) -> wgpu::ComputePipeline {
    let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(&format!("{name}_pipeline_layout")),
        bind_group_layouts: &[bgl],
        push_constant_ranges: &[],
    });
    device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(&format!("{name}_pipeline")),
        layout: Some(&layout),
        module,
        entry_point: Some(entry_point),
        compilation_options: Default::default(),
        cache: None,
    })
}

fn bgl_uniform(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn bgl_storage_ro(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: true },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn bgl_storage_rw(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: false },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn bg_buffer(binding: u32, buffer: &wgpu::Buffer) -> wgpu::BindGroupEntry<'_> {
    wgpu::BindGroupEntry {
        binding,
        resource: buffer.as_entire_binding(),
    }
}
