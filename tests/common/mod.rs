// Shared helpers for the integration tests.

#![allow(dead_code)]

use slime_engine::backend::{BufferHandle, Scalar, Slot, Stage, TextureHandle};
use slime_engine::{ComputeBackend, CpuBackend, SimError, SimResult};

/// CPU backend whose next submit(s) can be made to fail.
#[derive(Default)]
pub struct FlakyBackend {
    pub inner: CpuBackend,
    pub fail_submits: u32,
}

impl FlakyBackend {
    pub fn new() -> Self {
        Self { inner: CpuBackend::new(), fail_submits: 0 }
    }
}

impl ComputeBackend for FlakyBackend {
    fn name(&self) -> &'static str {
        "flaky-cpu"
    }

    fn allocate_buffer(&mut self, label: &str, contents: &[u8]) -> SimResult<BufferHandle> {
        self.inner.allocate_buffer(label, contents)
    }

    fn write_buffer(&mut self, buffer: BufferHandle, contents: &[u8]) -> SimResult<()> {
        self.inner.write_buffer(buffer, contents)
    }

    fn read_buffer(&mut self, buffer: BufferHandle) -> SimResult<Vec<u8>> {
        self.inner.read_buffer(buffer)
    }

    fn release_buffer(&mut self, buffer: BufferHandle) {
        self.inner.release_buffer(buffer)
    }

    fn allocate_texture(&mut self, label: &str, width: u32, height: u32) -> SimResult<TextureHandle> {
        self.inner.allocate_texture(label, width, height)
    }

    fn write_texture(&mut self, texture: TextureHandle, texels: &[[f32; 4]]) -> SimResult<()> {
        self.inner.write_texture(texture, texels)
    }

    fn read_texture(&mut self, texture: TextureHandle) -> SimResult<Vec<[f32; 4]>> {
        self.inner.read_texture(texture)
    }

    fn release_texture(&mut self, texture: TextureHandle) {
        self.inner.release_texture(texture)
    }

    fn bind_buffer(&mut self, stage: Stage, slot: Slot, buffer: BufferHandle) {
        self.inner.bind_buffer(stage, slot, buffer)
    }

    fn bind_texture(&mut self, stage: Stage, slot: Slot, texture: TextureHandle) {
        self.inner.bind_texture(stage, slot, texture)
    }

    fn set_scalar(&mut self, scalar: Scalar) {
        self.inner.set_scalar(scalar)
    }

    fn clear_texture(&mut self, texture: TextureHandle) {
        self.inner.clear_texture(texture)
    }

    fn dispatch(&mut self, stage: Stage, workgroups: [u32; 3]) -> SimResult<()> {
        self.inner.dispatch(stage, workgroups)
    }

    fn submit(&mut self) -> SimResult<()> {
        if self.fail_submits > 0 {
            self.fail_submits -= 1;
            self.inner.discard_pending();
            return Err(SimError::BackendUnavailable("injected device loss".into()));
        }
        self.inner.submit()
    }

    fn discard_pending(&mut self) {
        self.inner.discard_pending()
    }
}
