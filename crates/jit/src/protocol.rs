//! Front-end / back-end request protocol.
//!
//! When a name is unknown to the session and to the process, the JIT asks
//! the front end for the module that defines it.

use lazyjit_ir::Module;

use crate::error::JitError;
use crate::jit::ResourceTracker;

/// A module handed over by the front end, plus the tracker it belongs to.
#[derive(Debug)]
pub struct CapturedModule {
    pub module: Module,
    /// `None` adds the module to the default tracker.
    pub tracker: Option<ResourceTracker>,
}

impl CapturedModule {
    pub fn new(module: Module) -> Self {
        Self {
            module,
            tracker: None,
        }
    }
}

/// Supplies modules on demand.
pub trait ModuleProvider: Send + Sync {
    /// Produce the module defining `name`, or an error if there is none.
    /// Must not hang and must not return an empty placeholder module.
    fn request_module(&self, name: &str) -> Result<CapturedModule, JitError>;
}

/// Front end that submitted every module up front.
#[derive(Debug, Default, Clone, Copy)]
pub struct AheadOfTimeProvider;

impl ModuleProvider for AheadOfTimeProvider {
    fn request_module(&self, name: &str) -> Result<CapturedModule, JitError> {
        Err(JitError::NothingToLoad {
            name: name.to_owned(),
            reason: "Everything should be loaded.".to_owned(),
        })
    }
}
