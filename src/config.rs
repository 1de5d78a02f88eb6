// ============================================================================
// config.rs — slime-engine
// Simulation settings, per-species tunables, spawn/boundary modes and JSON
// loading.
// ============================================================================

use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::backend::{AGENT_WORKGROUP_SIZE, MAX_WORKGROUPS_PER_DIMENSION};
use crate::error::{SimError, SimResult};

/// The species mask has one integer per trail channel, so at most three
/// species can be told apart.
pub const MAX_SPECIES: usize = 3;

/// Agents one update dispatch can cover.
pub const MAX_AGENTS: usize = MAX_WORKGROUPS_PER_DIMENSION as usize * AGENT_WORKGROUP_SIZE as usize;

/// Largest sensor half-width; each sensor reads `(2n + 1)^2` cells.
pub const MAX_SENSOR_SIZE: u32 = 16;

/// How agents are placed when spawned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpawnMode {
    Random,
    Point,
    InwardCircle,
    RandomCircle,
    /// Position and heading come from an `ExternalPlacement` (the live tuner).
    ExternallyControlled,
}

/// What happens when an agent's move takes it outside the field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoundaryMode {
    /// Clamp to the edge, pick a fresh random heading, skip the deposit.
    Clamp,
    /// Toroidal field: positions and sensor samples wrap around.
    Wrap,
}

impl BoundaryMode {
    pub fn as_u32(self) -> u32 {
        match self {
            BoundaryMode::Clamp => 0,
            BoundaryMode::Wrap => 1,
        }
    }
}

/// Per-species tunables.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeciesSettings {
    pub move_speed: f32,
    pub turn_speed: f32,
    pub sensor_angle_degrees: f32,
    pub sensor_offset_dst: f32,
    /// Sample radius around each sensor; 0 samples a single cell.
    pub sensor_size: u32,
    pub colour: [f32; 4],
}

impl Default for SpeciesSettings {
    fn default() -> Self {
        Self {
            move_speed: 30.0,
            turn_speed: 6.0,
            sensor_angle_degrees: 30.0,
            sensor_offset_dst: 35.0,
            sensor_size: 1,
            colour: [1.0, 1.0, 1.0, 1.0],
        }
    }
}

/// Global simulation parameters plus the ordered species collection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationSettings {
    pub width: u32,
    pub height: u32,
    pub num_agents: usize,
    pub spawn_mode: SpawnMode,
    pub trail_weight: f32,
    pub decay_rate: f32,
    pub diffuse_rate: f32,
    pub steps_per_frame: u32,
    pub boundary: BoundaryMode,
    pub seed: Option<u64>,
    pub species: Vec<SpeciesSettings>,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            width: 512,
            height: 512,
            num_agents: 50_000,
            spawn_mode: SpawnMode::Random,
            trail_weight: 5.0,
            decay_rate: 0.2,
            diffuse_rate: 3.0,
            steps_per_frame: 1,
            boundary: BoundaryMode::Clamp,
            seed: None,
            species: vec![SpeciesSettings::default()],
        }
    }
}

impl SimulationSettings {
    pub fn species_count(&self) -> usize {
        self.species.len()
    }

    pub fn centre(&self) -> [f32; 2] {
        [self.width as f32 * 0.5, self.height as f32 * 0.5]
    }

    pub fn cell_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Reject settings no simulation can be created from.
    pub fn validate(&self) -> SimResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(SimError::Configuration(format!(
                "field dimensions must be positive, got {}x{}",
                self.width, self.height
            )));
        }
        // cell indices are computed in i32 by the kernels
        if self.cell_count() > i32::MAX as usize {
            return Err(SimError::Configuration(format!(
                "field of {}x{} cells is too large",
                self.width, self.height
            )));
        }
        if self.num_agents > MAX_AGENTS {
            return Err(SimError::Configuration(format!(
                "{} agents exceed the {MAX_AGENTS} one dispatch can update",
                self.num_agents
            )));
        }
        if self.species.is_empty() {
            return Err(SimError::Configuration("species collection is empty".into()));
        }
        if self.species.len() > MAX_SPECIES {
            return Err(SimError::Configuration(format!(
                "{} species configured but the species mask holds at most {}",
                self.species.len(),
                MAX_SPECIES
            )));
        }
        if self.steps_per_frame == 0 {
            return Err(SimError::Configuration("steps_per_frame must be at least 1".into()));
        }
        let rates = [
            ("trail_weight", self.trail_weight),
            ("decay_rate", self.decay_rate),
            ("diffuse_rate", self.diffuse_rate),
        ];
        for (name, value) in rates {
            if !value.is_finite() || value < 0.0 {
                return Err(SimError::Configuration(format!(
                    "{name} must be a finite non-negative number, got {value}"
                )));
            }
        }
        for (i, s) in self.species.iter().enumerate() {
            let values = [s.move_speed, s.turn_speed, s.sensor_angle_degrees, s.sensor_offset_dst];
            if values.iter().any(|v| !v.is_finite()) {
                return Err(SimError::Configuration(format!(
                    "species {i} has a non-finite tunable"
                )));
            }
            if s.sensor_size > MAX_SENSOR_SIZE {
                return Err(SimError::Configuration(format!(
                    "species {i} sensor_size {} exceeds {MAX_SENSOR_SIZE}",
                    s.sensor_size
                )));
            }
        }
        Ok(())
    }

    /// Check that `other` only differs in fields that may change after init.
    pub fn check_runtime_compatible(&self, other: &SimulationSettings) -> SimResult<()> {
        if self.width != other.width || self.height != other.height {
            return Err(SimError::InvalidArgument(
                "field dimensions are fixed after initialization".into(),
            ));
        }
        if self.species.len() != other.species.len() {
            return Err(SimError::InvalidArgument(
                "species count is fixed after initialization".into(),
            ));
        }
        other.validate()
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(path, json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let s = SimulationSettings::default();
        s.validate().expect("default settings validate");
        assert_eq!(s.species_count(), 1);
        assert_eq!(s.centre(), [256.0, 256.0]);
        assert_eq!(s.boundary, BoundaryMode::Clamp);
    }

    #[test]
    fn zero_dimensions_are_rejected() {
        let s = SimulationSettings { width: 0, ..Default::default() };
        assert!(matches!(s.validate(), Err(SimError::Configuration(_))));
        let s = SimulationSettings { height: 0, ..Default::default() };
        assert!(matches!(s.validate(), Err(SimError::Configuration(_))));
    }

    #[test]
    fn species_must_be_between_one_and_three() {
        let s = SimulationSettings { species: vec![], ..Default::default() };
        assert!(matches!(s.validate(), Err(SimError::Configuration(_))));
        let s = SimulationSettings {
            species: vec![SpeciesSettings::default(); 4],
            ..Default::default()
        };
        assert!(matches!(s.validate(), Err(SimError::Configuration(_))));
        let s = SimulationSettings {
            species: vec![SpeciesSettings::default(); 3],
            ..Default::default()
        };
        assert!(s.validate().is_ok());
    }

    #[test]
    fn oversized_populations_fields_and_sensors_are_rejected() {
        let s = SimulationSettings { num_agents: MAX_AGENTS, ..Default::default() };
        assert!(s.validate().is_ok());
        let s = SimulationSettings { num_agents: MAX_AGENTS + 1, ..Default::default() };
        assert!(matches!(s.validate(), Err(SimError::Configuration(_))));

        let s = SimulationSettings { width: 65_536, height: 65_536, ..Default::default() };
        assert!(matches!(s.validate(), Err(SimError::Configuration(_))));

        let wide = SpeciesSettings { sensor_size: MAX_SENSOR_SIZE + 1, ..Default::default() };
        let s = SimulationSettings { species: vec![wide], ..Default::default() };
        assert!(matches!(s.validate(), Err(SimError::Configuration(_))));
    }

    #[test]
    fn negative_or_nan_rates_are_rejected() {
        let s = SimulationSettings { decay_rate: -0.1, ..Default::default() };
        assert!(s.validate().is_err());
        let s = SimulationSettings { diffuse_rate: f32::NAN, ..Default::default() };
        assert!(s.validate().is_err());
    }

    #[test]
    fn runtime_edits_cannot_resize() {
        let base = SimulationSettings::default();
        let mut edited = base.clone();
        edited.trail_weight = 9.0;
        assert!(base.check_runtime_compatible(&edited).is_ok());

        edited.width = 1024;
        assert!(matches!(
            base.check_runtime_compatible(&edited),
            Err(SimError::InvalidArgument(_))
        ));

        let mut more_species = base.clone();
        more_species.species.push(SpeciesSettings::default());
        assert!(base.check_runtime_compatible(&more_species).is_err());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let json = r#"{ "width": 64, "height": 32, "spawn_mode": "InwardCircle",
                        "species": [ { "move_speed": 12.0 } ] }"#;
        let s: SimulationSettings = serde_json::from_str(json).expect("parse");
        assert_eq!(s.width, 64);
        assert_eq!(s.height, 32);
        assert_eq!(s.spawn_mode, SpawnMode::InwardCircle);
        assert_eq!(s.num_agents, SimulationSettings::default().num_agents);
        assert_eq!(s.species[0].move_speed, 12.0);
        assert_eq!(s.species[0].sensor_offset_dst, 35.0);
    }

    #[test]
    fn json_file_round_trip() {
        let path = std::env::temp_dir().join(format!("slime_settings_{}.json", std::process::id()));
        let s = SimulationSettings {
            seed: Some(7),
            boundary: BoundaryMode::Wrap,
            ..Default::default()
        };
        s.save_json(&path).expect("save");
        let loaded = SimulationSettings::load_json(&path).expect("load");
        let _ = fs::remove_file(&path);
        assert_eq!(loaded, s);
    }
}
