//! Error handling for the BSP Framework
//!
//! Every fallible operation in the workspace reports a [`BspError`]. Messages
//! name the argument or entity at fault and, where one exists, a remedy.

use thiserror::Error;

/// Result type alias for BSP Framework operations
pub type BspResult<T> = Result<T, BspError>;

/// Comprehensive error type for all BSP Framework operations
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum BspError {
    /// A request parameter was malformed
    #[error("Invalid argument '{argument}': {reason}")]
    InvalidArgument {
        /// Name of the offending argument
        argument: &'static str,
        /// What was wrong with it
        reason: String,
    },

    /// A named stream, predictor or operator does not exist
    #[error("{kind} '{name}' not found{}", hint_suffix(.hint))]
    NotFound {
        /// Kind of entity that was looked up
        kind: &'static str,
        /// Name used for the lookup
        name: String,
        /// Optional remedy
        hint: Option<String>,
    },

    /// The named entity exists but was replaced since it was bound
    #[error("{kind} '{name}' was replaced (bound to {expected}, found {found}); rebuild the binding")]
    StaleBinding {
        /// Kind of entity that was looked up
        kind: &'static str,
        /// Name used for the lookup
        name: String,
        /// Identity captured at binding time
        expected: String,
        /// Identity currently registered under the name
        found: String,
    },

    /// Requested history has already been overwritten by ring wraparound
    #[error("Sample range starting at {start} is no longer buffered (oldest retained sample is {oldest}, capacity {capacity}); reduce the requested length or enlarge the buffer")]
    Range {
        /// First requested logical sample index
        start: u64,
        /// Oldest logical sample index still retained
        oldest: u64,
        /// Ring capacity in samples
        capacity: usize,
    },

    /// Channel count or dimension mismatch
    #[error("Shape mismatch in {context}: expected {expected}, got {actual}")]
    Shape {
        /// Where the mismatch was detected
        context: String,
        /// Expected dimension
        expected: usize,
        /// Actual dimension
        actual: usize,
    },

    /// More than one live stream satisfies a raw-data leaf
    #[error("Raw data leaf [{leaf}] matches several streams ({}); pass a single stream name or restrict the needed channels", .candidates.join(", "))]
    AmbiguousBinding {
        /// Description of the leaf requirement
        leaf: String,
        /// Names of the equally valid candidates
        candidates: Vec<String>,
    },

    /// A pipeline node's operator failed
    #[error("Operator '{operator}' at node '{node}' failed: {cause}")]
    OperatorFailure {
        /// Label of the failing node
        node: String,
        /// Operator name
        operator: String,
        /// Underlying cause
        cause: Box<BspError>,
    },

    /// Configuration validation failure
    #[error("Configuration error: {message}")]
    Configuration {
        /// What is wrong with the configuration
        message: String,
    },

    /// Numerical or runtime failure inside an operator or model
    #[error("Processing error: {message}")]
    Processing {
        /// What went wrong
        message: String,
    },
}

fn hint_suffix(hint: &Option<String>) -> String {
    match hint {
        Some(hint) => format!("; {}", hint),
        None => String::new(),
    }
}

impl BspError {
    /// Shorthand for an [`BspError::InvalidArgument`]
    pub fn invalid_argument(argument: &'static str, reason: impl Into<String>) -> Self {
        BspError::InvalidArgument {
            argument,
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`BspError::Configuration`]
    pub fn configuration(message: impl Into<String>) -> Self {
        BspError::Configuration {
            message: message.into(),
        }
    }

    /// Shorthand for a [`BspError::Processing`]
    pub fn processing(message: impl Into<String>) -> Self {
        BspError::Processing {
            message: message.into(),
        }
    }

    /// Shorthand for a [`BspError::Shape`]
    pub fn shape(context: impl Into<String>, expected: usize, actual: usize) -> Self {
        BspError::Shape {
            context: context.into(),
            expected,
            actual,
        }
    }

    /// Unwrap nested operator failures down to the originating error
    pub fn root_cause(&self) -> &BspError {
        match self {
            BspError::OperatorFailure { cause, .. } => cause.root_cause(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = BspError::Range {
            start: 3,
            oldest: 16,
            capacity: 10,
        };
        let display = format!("{}", error);
        assert!(display.contains("reduce the requested length"));
        assert!(display.contains("16"));
    }

    #[test]
    fn test_not_found_hint() {
        let error = BspError::NotFound {
            kind: "stream",
            name: "eeg".to_string(),
            hint: Some("open the stream first".to_string()),
        };
        assert_eq!(
            error.to_string(),
            "stream 'eeg' not found; open the stream first"
        );
    }

    #[test]
    fn test_root_cause() {
        let inner = BspError::shape("merge input", 4, 3);
        let error = BspError::OperatorFailure {
            node: "merge#2".to_string(),
            operator: "merge".to_string(),
            cause: Box::new(BspError::OperatorFailure {
                node: "inner".to_string(),
                operator: "scale".to_string(),
                cause: Box::new(inner.clone()),
            }),
        };
        assert_eq!(error.root_cause(), &inner);
    }
}
