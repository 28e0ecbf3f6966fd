use std::fmt;

/// Precondition failures raised by models and priors. They travel
/// inside `anyhow::Error`; use `downcast_ref::<ModelError>()` to
/// inspect them.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelError {
    InvalidArgument(String),
    FamilyMismatch { posterior: String, prior: String },
    MissingParentMessage(&'static str),
    ParameterCountMismatch { expected: usize, got: usize },
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            ModelError::FamilyMismatch { posterior, prior } => write!(
                f,
                "cannot compare distributions of different families: {} vs {}",
                posterior, prior
            ),
            ModelError::MissingParentMessage(model) => {
                write!(f, "{} requires a parent message", model)
            }
            ModelError::ParameterCountMismatch { expected, got } => {
                write!(f, "expected {} parameters, got {}", expected, got)
            }
        }
    }
}

impl std::error::Error for ModelError {}

/// `Err(ModelError::InvalidArgument(..))` with a formatted message
#[macro_export]
macro_rules! invalid_arg {
    ($($arg:tt)*) => {
        return Err($crate::error::ModelError::InvalidArgument(format!($($arg)*)).into())
    };
}
