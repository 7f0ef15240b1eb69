//! Error taxonomy shared by readers, steps and the persistence layer.
//!
//! Functions return `anyhow::Result` and wrap these values with context;
//! callers that need to branch on the kind use `downcast_ref::<PipelineError>()`.

/// Typed pipeline failures.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    /// A source or container does not match its expected schema.
    #[error("format error: {0}")]
    Format(String),

    /// A named modality, assay, column, reference or format cannot be resolved.
    #[error("unresolved reference: {0}")]
    Reference(String),

    /// Array lengths or shapes disagree.
    #[error("inconsistent dimensions: {0}")]
    Consistency(String),

    /// A step was wired with the wrong upstream, or called in an invalid state.
    #[error("invalid state: {0}")]
    State(String),
}

impl PipelineError {
    /// Build a [`PipelineError::Format`].
    pub fn format(msg: impl Into<String>) -> Self {
        PipelineError::Format(msg.into())
    }

    /// Build a [`PipelineError::Reference`].
    pub fn reference(msg: impl Into<String>) -> Self {
        PipelineError::Reference(msg.into())
    }

    /// Build a [`PipelineError::Consistency`].
    pub fn consistency(msg: impl Into<String>) -> Self {
        PipelineError::Consistency(msg.into())
    }

    /// Build a [`PipelineError::State`].
    pub fn state(msg: impl Into<String>) -> Self {
        PipelineError::State(msg.into())
    }
}

/// Fail with a [`PipelineError::Consistency`] unless `actual == expected`.
pub fn check_length(what: &str, actual: usize, expected: usize) -> anyhow::Result<()> {
    if actual != expected {
        return Err(PipelineError::consistency(format!(
            "{what} has length {actual}, expected {expected}"
        ))
        .into());
    }
    Ok(())
}

/// Find the typed error anywhere in an `anyhow` chain.
pub fn find_pipeline_error(err: &anyhow::Error) -> Option<&PipelineError> {
    err.chain().find_map(|cause| cause.downcast_ref::<PipelineError>())
}
