use thiserror::Error;

/// Error raised by an [`crate::expr::ExprEvaluator`] implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExprError {
    #[error("could not parse expression '{text}': {message}")]
    Parse { text: String, message: String },
    #[error("could not evaluate expression '{text}': {message}")]
    Eval { text: String, message: String },
}

/// Error raised by a [`crate::storage::StorageProvider`].
///
/// Decode failures are recoverable by design: callers substitute an empty
/// value map and keep going.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("could not decode stored blob for key '{key}': {message}")]
    Decode { key: String, message: String },
    #[error("could not encode value map for key '{key}': {message}")]
    Encode { key: String, message: String },
}

/// Fatal errors surfaced to the caller of the system facade.
///
/// Everything else in the engine is reported through the `log` facade and
/// degrades locally (sentinel weights/values, no-op mutations).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Definition(#[from] aspect_model::DefinitionError),
    #[error("formula for aspect '{name}' is invalid: {source}")]
    Formula {
        name: String,
        #[source]
        source: ExprError,
    },
}
