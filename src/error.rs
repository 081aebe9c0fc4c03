use serde::{Deserialize, Serialize};

/// A positioned message produced while compiling a model definition.
///
/// `line` and `column` are 1 based positions in the normalized definition. A diagnostic at
/// `0, 0` with `is_error == false` means no issues were found.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{line}:{column}: {message}")]
pub struct Diagnostic {
    /// Line of the offending directive.
    pub line: usize,
    /// Column of the offending value.
    pub column: usize,
    /// Human readable message.
    pub message: String,
    /// Whether this is an error.
    pub is_error: bool,
}

impl Diagnostic {
    /// An error at `line`, `column`.
    pub fn error(line: usize, column: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            column,
            message: message.into(),
            is_error: true,
        }
    }
    /// The "no issues found" diagnostic.
    pub fn ok() -> Self {
        Self::default()
    }
}

/// Recoverable errors raised by layers while negotiating formats and building primitives.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum LayerError {
    /// The inputs require layouts that cannot be reconciled.
    #[error("Layer {layer} has incompatible input formats: {reason}")]
    Format {
        /// Layer name.
        layer: String,
        /// What conflicted.
        reason: String,
    },
    /// The input shapes cannot be combined.
    #[error("Layer {layer} has incompatible input shapes: {reason}")]
    Shape {
        /// Layer name.
        layer: String,
        /// What conflicted.
        reason: String,
    },
    /// A stored weight file does not fit the layer.
    #[error("Layer {layer} expected {expected} bytes, found {found}")]
    WeightsSize {
        /// Layer name.
        layer: String,
        /// Bytes the layer needs.
        expected: usize,
        /// Bytes available.
        found: usize,
    },
    /// NaN or Inf found in parameters or optimizer state.
    #[error("Layer {layer} has non finite {what}")]
    NonFinite {
        /// Layer name.
        layer: String,
        /// Which buffer.
        what: String,
    },
}
