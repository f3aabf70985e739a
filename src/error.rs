//! Error kinds surfaced by the detection-to-composite pipeline.

use std::fmt::Display;

use crate::epoch::Epoch;

/// Pipeline failure. Cloneable so one cached outcome can be handed to every
/// caller awaiting it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    #[error("Model load failed: {message}")]
    ModelLoad { message: String },

    #[error("Face detection failed: {message}")]
    Detection { message: String },

    #[error("Overlay asset failed to load: {message}")]
    Asset { message: String },

    #[error("Minimum confidence must be within [0, 1], got {value}")]
    InvalidThreshold { value: f32 },

    #[error("Result for epoch {epoch} is stale")]
    Stale { epoch: Epoch },

    #[error("Render is not ready for export")]
    NotReady,

    #[error("Export failed: {message}")]
    Export { message: String },
}

pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    pub fn model_load(msg: impl Display) -> Self {
        Self::ModelLoad {
            message: msg.to_string(),
        }
    }

    pub fn detection(msg: impl Display) -> Self {
        Self::Detection {
            message: msg.to_string(),
        }
    }

    pub fn asset(msg: impl Display) -> Self {
        Self::Asset {
            message: msg.to_string(),
        }
    }

    pub fn export(msg: impl Display) -> Self {
        Self::Export {
            message: msg.to_string(),
        }
    }

    /// Stale results are discarded silently rather than reported.
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale { .. })
    }
}
