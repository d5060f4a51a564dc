use thiserror::Error;

use crate::metadata::Token;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! invariant_error {
    ($method:expr, $offset:expr, $msg:expr) => {
        crate::Error::InvariantViolation {
            method: $method,
            offset: $offset,
            message: $msg.to_string(),
        }
    };

    ($method:expr, $offset:expr, $fmt:expr, $($arg:tt)*) => {
        crate::Error::InvariantViolation {
            method: $method,
            offset: $offset,
            message: format!($fmt, $($arg)*),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Only conditions that make a run untrustworthy are reported through this type. Problems the
/// analysis can tolerate (unresolvable references, missing implementations, untraceable callback
/// values) are collected as [`crate::analysis::Diagnostic`]s instead and never abort a run.
///
/// # Error Categories
///
/// ## Module Errors
/// - [`Error::TypeNotFound`], [`Error::MethodNotFound`], [`Error::FieldNotFound`] - A token does
///   not resolve inside the module
/// - [`Error::Malformed`] - The module violates a structural assumption (e.g. a branch target
///   outside of the method body)
///
/// ## Rewrite Errors
/// - [`Error::InvariantViolation`] - An assumption the injection engine relies on for
///   correctness does not hold. A partially-applied rewrite cannot be trusted, so this aborts.
/// - [`Error::Unsupported`] - A code shape the rewrite cannot express without changing semantics
///
/// ## Infrastructure Errors
/// - [`Error::GraphError`] - Graph construction failure
/// - [`Error::Pipeline`] - Patch pipeline misuse (missing prerequisite stage output)
/// - [`Error::Emulation`] - Failure inside the reference interpreter
/// - [`Error::Serialization`] - JSON encoding / decoding of models and id maps
///
/// # Examples
///
/// ```rust,no_run
/// use ctxweave::{Error, patch::{PatchPipeline, WeaveConfig}};
/// # fn run(module: ctxweave::metadata::Module) {
/// match PatchPipeline::standard().weave(module, WeaveConfig::default()) {
///     Ok(output) => println!("converted {} fields", output.report.converted.len()),
///     Err(Error::InvariantViolation { method, offset, message }) => {
///         eprintln!("rewrite aborted in {method} at {offset:?}: {message}");
///     }
///     Err(e) => eprintln!("Other error: {e}"),
/// }
/// # }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The module is damaged or violates a structural assumption.
    ///
    /// The error includes the source location where the malformation was detected.
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// Failed to find a type in the module.
    #[error("Failed to find type in module - {0}")]
    TypeNotFound(Token),

    /// Failed to find a method in the module.
    #[error("Failed to find method in module - {0}")]
    MethodNotFound(Token),

    /// Failed to find a field in the module.
    #[error("Failed to find field in module - {0}")]
    FieldNotFound(Token),

    /// A rewrite precondition does not hold.
    ///
    /// Raised when the injection engine finds an instruction-position ambiguity it cannot
    /// resolve deterministically, e.g. an expected unique predecessor or base constructor call
    /// that turns out not to be unique. This indicates a violated invariant in the surrounding
    /// analysis and aborts the whole run.
    #[error("Invariant violation in {method} at {offset:?}: {message}")]
    InvariantViolation {
        /// The method being rewritten
        method: Token,
        /// Instruction index the violation was detected at, if any
        offset: Option<usize>,
        /// Description of the violated assumption
        message: String,
    },

    /// The code shape cannot be rewritten without altering semantics.
    #[error("Unsupported rewrite - {0}")]
    Unsupported(String),

    /// Graph construction or query error.
    #[error("{0}")]
    GraphError(String),

    /// A pipeline stage ran without the output of a stage it depends on.
    #[error("Pipeline error - {0}")]
    Pipeline(String),

    /// Reference interpreter failure.
    #[error("Emulation error - {0}")]
    Emulation(String),

    /// JSON encoding or decoding failed.
    #[error("{0}")]
    Serialization(#[from] serde_json::Error),
}
