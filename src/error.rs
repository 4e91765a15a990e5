use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconstructionError {
    #[error("Invalid reconstruction state: {0}")]
    InvalidState(String),

    #[error("Slice {slice_index} has a singular index-to-location transform")]
    SingularTransform { slice_index: usize },

    #[error("Compute backend failed during {operation}{}", format_diagnostic(.diagnostic))]
    ComputeBackend {
        operation: &'static str,
        diagnostic: Option<String>,
    },
}

pub type Result<T> = std::result::Result<T, ReconstructionError>;

impl ReconstructionError {
    pub(crate) fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    pub(crate) fn backend(operation: &'static str, diagnostic: impl ToString) -> Self {
        Self::ComputeBackend {
            operation,
            diagnostic: Some(diagnostic.to_string()),
        }
    }
}

fn format_diagnostic(diagnostic: &Option<String>) -> String {
    match diagnostic {
        Some(text) if !text.is_empty() => format!(": {text}"),
        _ => String::new(),
    }
}
