// ============================================================================
// field.rs — slime-engine
// Trail field: ping-pong texture pair plus the deposit accumulator, and the
// read-only snapshot handed to the display.
// ============================================================================

use std::sync::Arc;

use crate::backend::{ComputeBackend, TextureHandle};
use crate::error::SimResult;

/// Backend-resident double buffer. `textures[current]` holds the most recent
/// completed step; the other one is scratch for the next diffusion pass.
#[derive(Debug)]
pub struct Field {
    pub width: u32,
    pub height: u32,
    textures: [TextureHandle; 2],
    deposits: TextureHandle,
    current: usize,
}

impl Field {
    pub fn allocate<B: ComputeBackend + ?Sized>(
        backend: &mut B,
        width: u32,
        height: u32,
    ) -> SimResult<Self> {
        let trail_a = backend.allocate_texture("trail_map_0", width, height)?;
        let trail_b = match backend.allocate_texture("trail_map_1", width, height) {
            Ok(t) => t,
            Err(e) => {
                backend.release_texture(trail_a);
                return Err(e);
            }
        };
        let deposits = match backend.allocate_texture("deposit_map", width, height) {
            Ok(t) => t,
            Err(e) => {
                backend.release_texture(trail_a);
                backend.release_texture(trail_b);
                return Err(e);
            }
        };
        Ok(Self {
            width,
            height,
            textures: [trail_a, trail_b],
            deposits,
            current: 0,
        })
    }

    /// Swap ping-pong buffers after a completed diffusion pass
    pub fn swap(&mut self) {
        self.current = 1 - self.current;
    }

    /// Index of the current (read) texture
    pub fn cur(&self) -> usize {
        self.current
    }

    /// Index of the scratch (write) texture
    pub fn next(&self) -> usize {
        1 - self.current
    }

    pub fn current_texture(&self) -> TextureHandle {
        self.textures[self.cur()]
    }

    pub fn scratch_texture(&self) -> TextureHandle {
        self.textures[self.next()]
    }

    pub fn deposit_texture(&self) -> TextureHandle {
        self.deposits
    }

    /// Copy the current texture back from the backend.
    pub fn snapshot<B: ComputeBackend + ?Sized>(&self, backend: &mut B) -> SimResult<FieldSnapshot> {
        let texels = backend.read_texture(self.current_texture())?;
        Ok(FieldSnapshot::new(self.width, self.height, texels))
    }

    /// Overwrite the current texture, e.g. when restoring a saved state.
    pub fn upload<B: ComputeBackend + ?Sized>(
        &self,
        backend: &mut B,
        texels: &[[f32; 4]],
    ) -> SimResult<()> {
        backend.write_texture(self.current_texture(), texels)
    }

    pub fn release<B: ComputeBackend + ?Sized>(self, backend: &mut B) {
        for texture in self.textures {
            backend.release_texture(texture);
        }
        backend.release_texture(self.deposits);
    }
}

/// Immutable copy of the trail field after a completed step. Cheap to clone.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldSnapshot {
    pub width: u32,
    pub height: u32,
    texels: Arc<[[f32; 4]]>,
}

impl FieldSnapshot {
    pub fn new(width: u32, height: u32, texels: Vec<[f32; 4]>) -> Self {
        debug_assert_eq!(texels.len(), width as usize * height as usize);
        Self {
            width,
            height,
            texels: texels.into(),
        }
    }

    pub fn texels(&self) -> &[[f32; 4]] {
        &self.texels
    }

    pub fn get(&self, x: u32, y: u32) -> Option<[f32; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.texels.get((y * self.width + x) as usize).copied()
    }

    /// Sum of the three trail channels of one cell.
    pub fn intensity(&self, x: u32, y: u32) -> f32 {
        self.get(x, y).map(|t| t[0] + t[1] + t[2]).unwrap_or(0.0)
    }

    pub fn total_intensity(&self) -> f64 {
        self.texels
            .iter()
            .map(|t| (t[0] + t[1] + t[2]) as f64)
            .sum()
    }
}
