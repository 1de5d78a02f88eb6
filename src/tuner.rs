// ============================================================================
// tuner.rs — slime-engine
// Live parameter control from a knob/pad controller. Events are mapped onto
// settings edits and an external spawn placement.
// ============================================================================

use std::f32::consts::TAU;

use crate::backend::ComputeBackend;
use crate::config::SimulationSettings;
use crate::engine::SimulationEngine;
use crate::error::SimResult;
use crate::spawn::ExternalPlacement;

/// Pad that collapses species 0's sensor offset while held.
pub const HOLD_SENSOR_NOTE: u8 = 53;

/// Device-agnostic controller input. Control values are normalised to 0..=1.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TunerEvent {
    ControlChange { control: u8, value: f32 },
    NoteOn { note: u8, velocity: f32 },
    NoteOff { note: u8 },
}

impl TunerEvent {
    /// Decode a raw three-byte MIDI channel message. Note-on with zero
    /// velocity is a note-off.
    pub fn from_midi(status: u8, data1: u8, data2: u8) -> Option<Self> {
        let value = data2 as f32 / 127.0;
        match status & 0xF0 {
            0xB0 => Some(TunerEvent::ControlChange { control: data1, value }),
            0x90 if data2 > 0 => Some(TunerEvent::NoteOn { note: data1, velocity: value }),
            0x90 | 0x80 => Some(TunerEvent::NoteOff { note: data1 }),
            _ => None,
        }
    }
}

/// Spawn position and heading, as fractions of the field.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpawnPoint {
    pub x: f32,
    pub y: f32,
    pub heading: f32,
}

impl Default for SpawnPoint {
    fn default() -> Self {
        Self { x: 0.5, y: 0.5, heading: 0.0 }
    }
}

impl ExternalPlacement for SpawnPoint {
    fn place(&self, settings: &SimulationSettings) -> ([f32; 2], f32) {
        let w = settings.width as f32;
        let h = settings.height as f32;
        // keep the spawn inside [0, dim)
        let x = (self.x * w).clamp(0.0, w - 1.0);
        let y = (self.y * h).clamp(0.0, h - 1.0);
        ([x, y], self.heading)
    }
}

#[derive(Debug, Default)]
pub struct LiveTuner {
    spawn: SpawnPoint,
    saved_sensor_offset: Option<f32>,
}

impl LiveTuner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn_point(&self) -> SpawnPoint {
        self.spawn
    }

    /// Apply one event. Settings edits go through `SimulationEngine::tune`
    /// and take effect at the next tick.
    pub fn apply<B: ComputeBackend>(
        &mut self,
        event: TunerEvent,
        engine: &mut SimulationEngine<B>,
    ) -> SimResult<()> {
        match event {
            TunerEvent::ControlChange { control, value } => {
                let value = value.clamp(0.0, 1.0);
                match control {
                    1 => engine.tune(|s| s.trail_weight = value * 10.0),
                    2 => engine.tune(|s| s.decay_rate = value),
                    3 => engine.tune(|s| s.species[0].move_speed = value * 100.0),
                    4 => engine.tune(|s| s.species[0].sensor_offset_dst = value * 100.0),
                    5 => self.move_spawn(engine, |p| p.x = value),
                    6 => self.move_spawn(engine, |p| p.y = value),
                    7 => self.move_spawn(engine, |p| p.heading = value * TAU),
                    other => {
                        log::debug!("Ignoring control change {other} = {value:.3}");
                        Ok(())
                    }
                }
            }
            TunerEvent::NoteOn { note: HOLD_SENSOR_NOTE, .. } => {
                let current = engine.settings().species[0].sensor_offset_dst;
                engine.tune(|s| s.species[0].sensor_offset_dst = 0.0)?;
                // a repeated note-on must not overwrite the offset to restore
                self.saved_sensor_offset.get_or_insert(current);
                Ok(())
            }
            TunerEvent::NoteOff { note: HOLD_SENSOR_NOTE } => match self.saved_sensor_offset.take() {
                Some(offset) => engine.tune(|s| s.species[0].sensor_offset_dst = offset),
                None => Ok(()),
            },
            TunerEvent::NoteOn { note, .. } | TunerEvent::NoteOff { note } => {
                log::debug!("Ignoring note {note}");
                Ok(())
            }
        }
    }

    fn move_spawn<B: ComputeBackend, F: FnOnce(&mut SpawnPoint)>(
        &mut self,
        engine: &mut SimulationEngine<B>,
        edit: F,
    ) -> SimResult<()> {
        edit(&mut self.spawn);
        engine.set_external_placement(Box::new(self.spawn));
        Ok(())
    }
}

impl ExternalPlacement for LiveTuner {
    fn place(&self, settings: &SimulationSettings) -> ([f32; 2], f32) {
        self.spawn.place(settings)
    }
}
