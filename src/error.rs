//! The closed set of error kinds surfaced by the engine.

use std::fmt::{self, Display};
use thiserror::Error;

/// A parameter value that falls outside its domain. The inference engine is expected to
/// treat this as zero posterior density rather than as a failure.
#[derive(Clone, Debug, PartialEq)]
pub struct ParameterRejection {
    pub parameter: String,
    pub constraint: String,
}

impl ParameterRejection {
    pub fn new(parameter: impl Into<String>, constraint: impl Into<String>) -> Self {
        ParameterRejection {
            parameter: parameter.into(),
            constraint: constraint.into(),
        }
    }
}

impl Display for ParameterRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}` violates {}", self.parameter, self.constraint)
    }
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("parameter rejected: {0}")]
    Rejected(ParameterRejection),

    #[error("corrupt dataset (individual {individual}): {message}")]
    StructuralData { individual: usize, message: String },

    #[error("inconsistent design: {0}")]
    Design(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("computation cancelled")]
    Cancelled,
}

impl ModelError {
    pub(crate) fn structural(individual: usize, message: impl Into<String>) -> Self {
        ModelError::StructuralData {
            individual,
            message: message.into(),
        }
    }

    /// Whether this error means "the parameters are outside the support" as opposed to a
    /// genuine failure.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(self, ModelError::Rejected(_))
    }
}

impl From<ParameterRejection> for ModelError {
    fn from(rejection: ParameterRejection) -> Self {
        ModelError::Rejected(rejection)
    }
}

impl From<serde_json::Error> for ModelError {
    fn from(error: serde_json::Error) -> Self {
        ModelError::Config(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ModelError>;
