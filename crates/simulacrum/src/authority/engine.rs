//! Physics engine boundary
//!
//! The authority treats its engine as a synchronous executor of textual
//! instructions. Everything it broadcasts is derived from instruction output.

/// Error type for engine instructions
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("Empty instruction")]
    Empty,

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Unknown element: {0}")]
    UnknownElement(String),

    #[error("Element {element} has no attribute {attribute}")]
    UnknownAttribute { element: String, attribute: String },

    #[error("Unknown datum: {0}")]
    UnknownDatum(String),

    #[error("Invalid value '{0}'")]
    InvalidValue(String),

    #[error("Invalid pattern '{0}'")]
    InvalidPattern(String),
}

/// A model the authority can drive
pub trait ModelEngine: Send + 'static {
    /// Saved model state, used to undo a partially applied batch
    type Checkpoint: Send;

    /// Run one instruction and return its output lines
    fn execute(&mut self, instruction: &str) -> Result<Vec<String>, EngineError>;

    fn checkpoint(&self) -> Self::Checkpoint;

    fn restore(&mut self, checkpoint: Self::Checkpoint);

    /// Whether `instruction` changes the model
    fn is_mutating(&self, instruction: &str) -> bool {
        instruction.trim_start().starts_with("set")
    }
}
