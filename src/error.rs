//! Failure taxonomy of the agent.
//!
//! Nothing here is ever fatal to the host JVM: configuration errors drop the
//! offending entry, method-level errors skip one selector, and class-level
//! errors let the class load unmodified. Every variant ends up as one
//! `>>> DebugAgent ERROR:` line.

use crate::classfile::ClassFileError;
use crate::descriptor::TypeResolutionError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    /// A malformed `key=value` option or method selector.
    #[error("{reason}: '{input}'")]
    ConfigParse { input: String, reason: &'static str },

    /// An argument type of a selector does not name a JVM type.
    #[error("Failed to resolve argument type of {selector}: {source}")]
    TypeResolution {
        selector: String,
        #[source]
        source: TypeResolutionError,
    },

    /// The selected class declares no method with that name and parameter list.
    #[error("Failed to instrument class {class}, method {selector} : no such method")]
    MethodNotFound { class: String, selector: String },

    /// The method exists but its body could not be rewritten.
    #[error("Failed to instrument method {method} : {reason}")]
    Transform { method: String, reason: String },

    /// The class as a whole could not be processed; it loads unmodified.
    #[error("Failed to instrument class {class} : {reason}")]
    ClassTransformFailure { class: String, reason: String },
}

impl AgentError {
    pub(crate) fn config(input: impl Into<String>, reason: &'static str) -> Self {
        AgentError::ConfigParse { input: input.into(), reason }
    }

    pub(crate) fn transform(method: impl Into<String>, reason: impl Into<String>) -> Self {
        AgentError::Transform { method: method.into(), reason: reason.into() }
    }

    pub(crate) fn class_failure(class: impl Into<String>, source: &ClassFileError) -> Self {
        AgentError::ClassTransformFailure { class: class.into(), reason: source.to_string() }
    }
}
