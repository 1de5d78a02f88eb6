// ============================================================================
// kernels.rs — slime-engine
// Per-agent and per-cell kernel arithmetic for the CPU backend. Mirrors
// shaders/agents.wgsl and shaders/diffuse.wgsl statement for statement.
// ============================================================================

use std::f32::consts::{PI, TAU};

use crate::agent::Agent;
use crate::backend::{GpuSpecies, StepUniforms};
use crate::config::MAX_SENSOR_SIZE;

const BOUNDARY_WRAP: u32 = 1;

/// Integer hash used for per-agent random steering.
pub fn hash(mut state: u32) -> u32 {
    state ^= 2747636419;
    state = state.wrapping_mul(2654435769);
    state ^= state >> 16;
    state = state.wrapping_mul(2654435769);
    state ^= state >> 16;
    state = state.wrapping_mul(2654435769);
    state
}

pub fn scale_to_unit(state: u32) -> f32 {
    state as f32 / 4294967295.0
}

/// Read-only view of a trail texture.
pub struct TrailView<'a> {
    pub width: u32,
    pub height: u32,
    pub texels: &'a [[f32; 4]],
    pub wrap: bool,
}

impl TrailView<'_> {
    fn index(&self, x: i32, y: i32) -> usize {
        let (w, h) = (self.width as i32, self.height as i32);
        let (sx, sy) = if self.wrap {
            (x.rem_euclid(w), y.rem_euclid(h))
        } else {
            (x.clamp(0, w - 1), y.clamp(0, h - 1))
        };
        (sy * w + sx) as usize
    }

    pub fn sample(&self, x: i32, y: i32) -> [f32; 4] {
        self.texels[self.index(x, y)]
    }

    /// Cell coordinate under a sensor at `v`. Far-off sensors are pulled in
    /// to a cell that samples the same texels, so `cell +/- reach` stays
    /// well inside i32.
    fn sensor_cell(&self, v: f32, extent: u32, reach: i32) -> i32 {
        let extent = extent as f32;
        let v = if self.wrap {
            if v < -extent || v > 2.0 * extent {
                wrap_coord(v, extent)
            } else {
                v
            }
        } else {
            v.clamp(-(reach as f32) - 1.0, extent + reach as f32)
        };
        v.floor() as i32
    }
}

/// A deposit produced by one agent: target cell and fixed-point amounts.
pub type Deposit = (usize, [u32; 3]);

fn sense(agent: &Agent, species: &GpuSpecies, angle_offset: f32, trail: &TrailView) -> f32 {
    let sensor_angle = agent.angle + angle_offset;
    let sensor_x = agent.position[0] + sensor_angle.cos() * species.sensor_offset_dst;
    let sensor_y = agent.position[1] + sensor_angle.sin() * species.sensor_offset_dst;
    let size = species.sensor_size.clamp(0, MAX_SENSOR_SIZE as i32);
    let cx = trail.sensor_cell(sensor_x, trail.width, size);
    let cy = trail.sensor_cell(sensor_y, trail.height, size);

    let weight = [
        (agent.species_mask[0] * 2 - 1) as f32,
        (agent.species_mask[1] * 2 - 1) as f32,
        (agent.species_mask[2] * 2 - 1) as f32,
    ];
    let mut sum = 0.0;
    for dy in -size..=size {
        for dx in -size..=size {
            let t = trail.sample(cx + dx, cy + dy);
            sum += weight[0] * t[0] + weight[1] * t[1] + weight[2] * t[2];
        }
    }
    sum
}

/// Steer, move and bound one agent. Returns the deposit it leaves, if any.
pub fn update_agent(
    index: u32,
    agent: &mut Agent,
    species: &GpuSpecies,
    trail: &TrailView,
    u: &StepUniforms,
) -> Option<Deposit> {
    let width = u.width as f32;
    let height = u.height as f32;
    let dt = u.delta_time;

    let cell_seed = (agent.position[1] * width + agent.position[0]) as u32;
    let mut random = hash(cell_seed ^ hash(index ^ hash(u.frame)));

    let sensor_angle = species.sensor_angle_degrees * (PI / 180.0);
    let forward = sense(agent, species, 0.0, trail);
    let left = sense(agent, species, sensor_angle, trail);
    let right = sense(agent, species, -sensor_angle, trail);

    let steer = scale_to_unit(random);
    let turn_speed = species.turn_speed * TAU;

    if forward > left && forward > right {
        // keep heading
    } else if forward < left && forward < right {
        agent.angle += (steer - 0.5) * 2.0 * turn_speed * dt;
    } else if right > left {
        agent.angle -= steer * turn_speed * dt;
    } else if left > right {
        agent.angle += steer * turn_speed * dt;
    }

    let mut x = agent.position[0] + agent.angle.cos() * species.move_speed * dt;
    let mut y = agent.position[1] + agent.angle.sin() * species.move_speed * dt;

    let outside = x < 0.0 || x >= width || y < 0.0 || y >= height;
    if outside && u.boundary != BOUNDARY_WRAP {
        random = hash(random);
        agent.angle = scale_to_unit(random) * TAU;
        agent.position = [x.clamp(0.0, width - 1.0), y.clamp(0.0, height - 1.0)];
        return None;
    }
    if outside {
        x = wrap_coord(x, width);
        y = wrap_coord(y, height);
    }
    agent.position = [x, y];

    let cell = (y as u32 * u.width + x as u32) as usize;
    let amount = u.trail_weight * dt * u.deposit_scale;
    let deposit = [
        (agent.species_mask[0].max(0) as f32 * amount).round() as u32,
        (agent.species_mask[1].max(0) as f32 * amount).round() as u32,
        (agent.species_mask[2].max(0) as f32 * amount).round() as u32,
    ];
    Some((cell, deposit))
}

fn wrap_coord(v: f32, extent: f32) -> f32 {
    let wrapped = v.rem_euclid(extent);
    // rem_euclid can round up to `extent` for tiny negative inputs
    if wrapped >= extent {
        0.0
    } else {
        wrapped
    }
}

/// Trail value of a cell after this tick's deposits are merged in.
pub fn merged_texel(trail: [f32; 4], deposit: [u32; 4], scale: f32) -> [f32; 4] {
    let mut out = trail;
    for c in 0..4 {
        if deposit[c] > 0 {
            out[c] = (trail[c] + deposit[c] as f32 / scale).min(1.0);
        }
    }
    out
}

/// Blur, blend and decay one cell of the merged trail.
pub fn diffuse_cell(
    x: u32,
    y: u32,
    trail: &TrailView,
    deposits: &[[u32; 4]],
    u: &StepUniforms,
) -> [f32; 4] {
    let merged = |sx: i32, sy: i32| {
        let i = trail.index(sx, sy);
        merged_texel(trail.texels[i], deposits[i], u.deposit_scale)
    };

    let original = merged(x as i32, y as i32);
    let mut sum = [0.0f32; 4];
    for dy in -1..=1 {
        for dx in -1..=1 {
            let t = merged(x as i32 + dx, y as i32 + dy);
            for c in 0..4 {
                sum[c] += t[c];
            }
        }
    }

    let diffuse_weight = (u.diffuse_rate * u.delta_time).clamp(0.0, 1.0);
    let decay = u.decay_rate * u.delta_time;
    let mut out = [0.0f32; 4];
    for c in 0..4 {
        let blurred = sum[c] / 9.0;
        let blended = original[c] * (1.0 - diffuse_weight) + blurred * diffuse_weight;
        out[c] = (blended - decay).max(0.0);
    }
    out
}
