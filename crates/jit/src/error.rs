//! Error types for the lazy JIT.

/// Errors produced by the session, the pipeline stages and the collaborators
/// they drive.
///
/// The type is `Clone` so one materialization failure can be handed to every
/// caller that joined the same attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JitError {
    /// Module layout conflicts with the session's target layout.
    #[error(
        "added modules have incompatible data layouts: {module_layout} (module `{module}`) vs {session_layout} (jit)"
    )]
    IncompatibleDataLayout {
        module: String,
        module_layout: String,
        session_layout: String,
    },

    /// A symbol name is already defined in the session namespace.
    #[error("duplicate definition of symbol `{0}`")]
    DuplicateSymbol(String),

    /// An optimization pipeline descriptor could not be parsed.
    #[error("invalid pass pipeline `{descriptor}`: {reason}")]
    InvalidPipelineDescriptor { descriptor: String, reason: String },

    /// A configuration value could not be parsed.
    #[error("invalid configuration `{setting}`: {reason}")]
    InvalidConfig { setting: String, reason: String },

    /// No definition exists in the session, the process, or the front end.
    #[error("symbol not found: `{0}`")]
    SymbolNotFound(String),

    /// The native backend rejected a module.
    #[error("compilation of module `{module}` failed: {reason}")]
    CompilationFailed { module: String, reason: String },

    /// A stub was invoked but its body could never be located.
    #[error("lazy call-through error: could not find function body for `{0}`")]
    LazyCallThroughInconsistency(String),

    /// The front end has nothing further to load.
    #[error("front end has nothing to load for `{name}`: {reason}")]
    NothingToLoad { name: String, reason: String },

    /// Executed code faulted (division by zero, stack overflow, bad arity).
    #[error("trap in `{function}`: {reason}")]
    Trap { function: String, reason: String },

    /// The session was already torn down.
    #[error("execution session has ended")]
    SessionEnded,

    /// The resource tracker was removed or belongs to another session.
    #[error("resource tracker {0} is defunct")]
    ResourceTrackerDefunct(u64),

    /// Background workers could not be started or died.
    #[error("reoptimization worker failure: {0}")]
    Worker(String),

    /// Errors collected while releasing native resources at teardown.
    #[error("{} error(s) while ending session: {}", .0.len(), join_errors(.0))]
    Teardown(Vec<JitError>),
}

impl JitError {
    /// Convenience constructor for backend failures.
    pub fn compilation_failed(module: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CompilationFailed {
            module: module.into(),
            reason: reason.into(),
        }
    }

    /// Convenience constructor for runtime traps.
    pub fn trap(function: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Trap {
            function: function.into(),
            reason: reason.into(),
        }
    }

    /// Convenience constructor for pipeline parse failures.
    pub fn invalid_pipeline(descriptor: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPipelineDescriptor {
            descriptor: descriptor.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_config(setting: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            setting: setting.into(),
            reason: reason.into(),
        }
    }
}

fn join_errors(errors: &[JitError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn teardown_lists_every_error() {
        let err = JitError::Teardown(vec![
            JitError::SymbolNotFound("a".to_string()),
            JitError::compilation_failed("m", "boom"),
        ]);
        let message = err.to_string();
        assert!(message.starts_with("2 error(s)"));
        assert!(message.contains("symbol not found: `a`"));
        assert!(message.contains("compilation of module `m` failed: boom"));
    }

    #[test]
    fn layout_message_names_both_layouts() {
        let err = JitError::IncompatibleDataLayout {
            module: "m".to_string(),
            module_layout: "E".to_string(),
            session_layout: "e".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "added modules have incompatible data layouts: E (module `m`) vs e (jit)"
        );
    }
}
