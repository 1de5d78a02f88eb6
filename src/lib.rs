// ============================================================================
// lib.rs — slime-engine
// Slime mold agent simulation: fixed-step orchestration of agent update and
// trail diffusion over a pluggable compute backend.
// ============================================================================

pub mod agent;
pub mod backend;
pub mod churn;
pub mod config;
pub mod cpu;
pub mod engine;
pub mod error;
pub mod field;
pub mod gpu;
pub mod headless;
pub mod kernels;
pub mod metrics;
pub mod pipeline;
pub mod spawn;
pub mod state_io;
pub mod tuner;

pub use agent::{Agent, AgentPopulation};
pub use backend::ComputeBackend;
pub use churn::{ChurnReport, PopulationChurnScheduler};
pub use config::{BoundaryMode, SimulationSettings, SpawnMode, SpeciesSettings};
pub use cpu::CpuBackend;
pub use engine::{DisplayMode, EngineState, SimulationEngine};
pub use error::{SimError, SimResult};
pub use field::FieldSnapshot;
pub use gpu::GpuBackend;
pub use tuner::{LiveTuner, TunerEvent};
