//! Errors raised while assembling templates.

use thiserror::Error;

/// Errors that can occur while building or synthesizing stacks.
#[derive(Error, Debug)]
pub enum CfnError {
    /// A logical id was added twice to the same stack.
    #[error("Duplicate logical id '{logical_id}' in stack {stack}")]
    DuplicateLogicalId { stack: String, logical_id: String },

    /// A resource was looked up by a logical id the stack does not hold.
    #[error("Unknown resource '{logical_id}' in stack {stack}")]
    UnknownResource { stack: String, logical_id: String },

    /// A stack id or name is not part of the app.
    #[error("Unknown stack: {0}")]
    UnknownStack(String),

    /// Two stacks share an id or a deployed name.
    #[error("Duplicate stack: {0}")]
    DuplicateStack(String),

    /// A stack was declared to depend on itself.
    #[error("Stack {0} cannot depend on itself")]
    SelfDependency(String),

    /// The dependency edges between stacks do not form a DAG.
    #[error("Dependency cycle between stacks: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    /// Writing the assembly failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Rendering a template failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
