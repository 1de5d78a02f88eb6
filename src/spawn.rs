// ============================================================================
// spawn.rs — slime-engine
// Spawn policy: settings + random source -> a fresh agent.
// ============================================================================

use std::f32::consts::TAU;

use rand::Rng;

use crate::agent::Agent;
use crate::config::{SimulationSettings, SpawnMode};

/// Disc radii for the circular spawn modes, as a fraction of field height.
pub const INWARD_CIRCLE_RADIUS: f32 = 0.2;
pub const RANDOM_CIRCLE_RADIUS: f32 = 0.15;

/// Supplies position and heading for `SpawnMode::ExternallyControlled`.
pub trait ExternalPlacement {
    fn place(&self, settings: &SimulationSettings) -> ([f32; 2], f32);
}

/// Create one agent according to `settings.spawn_mode`.
///
/// Only the random source is touched. Without an external placement the
/// externally-controlled mode spawns at the origin facing angle 0.
pub fn spawn_agent<R: Rng + ?Sized>(
    settings: &SimulationSettings,
    rng: &mut R,
    external: Option<&dyn ExternalPlacement>,
) -> Agent {
    let centre = settings.centre();
    let height = settings.height as f32;

    let (position, angle) = match settings.spawn_mode {
        SpawnMode::Random => {
            let x = rng.gen_range(0.0..settings.width as f32);
            let y = rng.gen_range(0.0..height);
            ([x, y], random_angle(rng))
        }
        SpawnMode::Point => (centre, random_angle(rng)),
        SpawnMode::InwardCircle => {
            let offset = inside_unit_circle(rng);
            let r = height * INWARD_CIRCLE_RADIUS;
            let pos = [centre[0] + offset[0] * r, centre[1] + offset[1] * r];
            let angle = (centre[1] - pos[1]).atan2(centre[0] - pos[0]);
            (pos, angle)
        }
        SpawnMode::RandomCircle => {
            let offset = inside_unit_circle(rng);
            let r = height * RANDOM_CIRCLE_RADIUS;
            let pos = [centre[0] + offset[0] * r, centre[1] + offset[1] * r];
            (pos, random_angle(rng))
        }
        SpawnMode::ExternallyControlled => match external {
            Some(placement) => placement.place(settings),
            None => ([0.0, 0.0], 0.0),
        },
    };

    // circle modes on narrow fields and external placements can land off it
    let position = [
        onto_field(position[0], settings.width),
        onto_field(position[1], settings.height),
    ];
    let (species_index, species_mask) = assign_species(settings.species_count(), rng);
    Agent::new(position, angle, species_index, species_mask)
}

fn onto_field(v: f32, extent: u32) -> f32 {
    let extent = extent as f32;
    if (0.0..extent).contains(&v) {
        v
    } else if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, extent - 1.0)
    }
}

/// Spawn `count` agents in sequence from the same random source.
pub fn spawn_batch<R: Rng + ?Sized>(
    settings: &SimulationSettings,
    rng: &mut R,
    external: Option<&dyn ExternalPlacement>,
    count: usize,
) -> Vec<Agent> {
    (0..count).map(|_| spawn_agent(settings, rng, external)).collect()
}

fn assign_species<R: Rng + ?Sized>(species_count: usize, rng: &mut R) -> (u32, [i32; 3]) {
    if species_count <= 1 {
        return (0, Agent::ALL_CHANNELS);
    }
    let species = rng.gen_range(1..=species_count as u32);
    let index = species - 1;
    (index, Agent::one_hot(index))
}

fn random_angle<R: Rng + ?Sized>(rng: &mut R) -> f32 {
    rng.gen_range(0.0..TAU)
}

/// Uniform point in the unit disc.
fn inside_unit_circle<R: Rng + ?Sized>(rng: &mut R) -> [f32; 2] {
    let theta = rng.gen_range(0.0..TAU);
    let r = rng.gen::<f32>().sqrt();
    [theta.cos() * r, theta.sin() * r]
}
