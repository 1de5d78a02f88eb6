// ============================================================================
// error.rs — slime-engine
// Error taxonomy shared by the engine, the compute pipeline and the backends.
// ============================================================================

use thiserror::Error;

use crate::engine::EngineState;

pub type SimResult<T> = Result<T, SimError>;

#[derive(Debug, Error)]
pub enum SimError {
    /// Invalid initialization parameters; no simulation is created.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A dispatch or submission could not be executed by the backend.
    #[error("compute backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The backend could not allocate a buffer or texture.
    #[error("allocation of {bytes} bytes failed for `{label}`")]
    AllocationFailure { label: String, bytes: u64 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A churn cycle asked for more agents than the population holds.
    #[error("churn batch of {batch} exceeds population of {population}")]
    ChurnUnderflow { batch: usize, population: usize },

    #[error("`{op}` called on a disposed engine")]
    UseAfterDispose { op: &'static str },

    #[error("`{op}` is not allowed while the engine is {state:?}")]
    InvalidState { op: &'static str, state: EngineState },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SimError {
    /// True for failures local to one tick that a host may retry next frame.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SimError::BackendUnavailable(_) | SimError::AllocationFailure { .. }
        )
    }
}
