//! Error types shared across FramePump crates.

/// Top-level error type for FramePump operations.
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    /// A stage failed while initializing or running. Aborts the current cycle.
    #[error("Render command '{stage}' failed: {message}")]
    Stage { stage: String, message: String },

    /// A stage panicked on the pump thread.
    #[error("Render command '{stage}' panicked: {message}")]
    StagePanicked { stage: String, message: String },

    #[error("Cannot bind program to target '{requested}': already bound to '{bound}'")]
    TargetRebind { bound: String, requested: String },

    #[error("Render command '{stage}' ({id}) is not part of the program")]
    UnknownStage { stage: String, id: u64 },

    #[error("No program set for target '{target}'")]
    NoProgram { target: String },

    #[error("Target '{target}' is already rendering")]
    AlreadyRendering { target: String },

    #[error("Parameter error: {message}")]
    Parameter { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Task pool error: {message}")]
    Pool { message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias using MediaError.
pub type MediaResult<T> = Result<T, MediaError>;

impl MediaError {
    pub fn stage(stage: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Stage {
            stage: stage.into(),
            message: msg.into(),
        }
    }

    pub fn stage_panicked(stage: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::StagePanicked {
            stage: stage.into(),
            message: msg.into(),
        }
    }

    pub fn parameter(msg: impl Into<String>) -> Self {
        Self::Parameter {
            message: msg.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn pool(msg: impl Into<String>) -> Self {
        Self::Pool {
            message: msg.into(),
        }
    }

    /// Whether this error is a pipeline failure (stops rendering when raised on the pump).
    pub fn is_pipeline_failure(&self) -> bool {
        matches!(self, Self::Stage { .. } | Self::StagePanicked { .. })
    }
}
