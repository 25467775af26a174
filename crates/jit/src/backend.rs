//! Contracts required from the external collaborators.
//!
//! The core never generates machine code or runs passes itself. It drives a
//! [`NativeBackend`] (compile, load, process-symbol fallback) and a
//! [`PassPipeline`] (apply a named pipeline to a module) through these
//! traits. `lazyjit-backend` provides reference implementations.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use lazyjit_ir::{DataLayout, Module};

use crate::error::JitError;
use crate::types::{ExecutorAddr, SymbolFlags};

/// Executable code for one function.
///
/// Implementations must be safe to invoke from several threads at once.
pub trait NativeFunction: Send + Sync {
    /// Run the function with the given arguments.
    fn invoke(&self, args: &[i64]) -> Result<i64, JitError>;

    /// Number of parameters the function expects.
    fn arity(&self) -> u32;
}

/// Body of a resolved symbol.
#[derive(Clone)]
pub enum SymbolBody {
    Function(Arc<dyn NativeFunction>),
    Data(i64),
}

impl fmt::Debug for SymbolBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SymbolBody::Function(function) => f
                .debug_struct("Function")
                .field("arity", &function.arity())
                .finish_non_exhaustive(),
            SymbolBody::Data(value) => f.debug_tuple("Data").field(value).finish(),
        }
    }
}

/// A resolved symbol: its address, flags and body.
#[derive(Debug, Clone)]
pub struct ExecutorSymbolDef {
    pub addr: ExecutorAddr,
    pub flags: SymbolFlags,
    pub body: SymbolBody,
}

/// What an external reference binds to at load time.
#[derive(Clone)]
pub enum LinkTarget {
    /// Call target. For lazily compiled symbols this is the stub, so binding
    /// never forces materialization.
    Function(Arc<dyn NativeFunction>),
    Data(i64),
}

impl From<SymbolBody> for LinkTarget {
    fn from(body: SymbolBody) -> Self {
        match body {
            SymbolBody::Function(function) => LinkTarget::Function(function),
            SymbolBody::Data(value) => LinkTarget::Data(value),
        }
    }
}

/// Resolves external references while loading an object.
pub trait LinkResolver {
    fn resolve(&self, name: &str) -> Result<LinkTarget, JitError>;
}

/// The target the backend generates code for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDescriptor {
    pub triple: String,
    pub data_layout: DataLayout,
}

/// Backend-specific output of [`NativeBackend::compile`], consumed by
/// [`NativeBackend::load`].
pub struct LoadableCode {
    module: String,
    payload: Box<dyn Any + Send>,
}

impl LoadableCode {
    pub fn new<T: Any + Send>(module: impl Into<String>, payload: T) -> Self {
        Self {
            module: module.into(),
            payload: Box::new(payload),
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    /// Recover the backend's own payload type.
    pub fn downcast<T: Any + Send>(self) -> Result<T, JitError> {
        let module = self.module;
        self.payload
            .downcast::<T>()
            .map(|payload| *payload)
            .map_err(|_| JitError::compilation_failed(module, "loadable code from a foreign backend"))
    }
}

impl fmt::Debug for LoadableCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadableCode")
            .field("module", &self.module)
            .finish_non_exhaustive()
    }
}

/// Code placed in executable memory.
pub trait LoadedObject: Send + Sync {
    /// Address and body of a symbol defined by this object.
    fn address_of(&self, name: &str) -> Option<ExecutorSymbolDef>;

    /// Free the native resources backing this object.
    fn release(&self) -> Result<(), JitError>;
}

/// Native code generator and loader.
pub trait NativeBackend: Send + Sync {
    /// Target triple and data layout of generated code.
    fn target(&self) -> TargetDescriptor;

    /// Generate loadable code for a module.
    fn compile(&self, module: &Module, target: &TargetDescriptor) -> Result<LoadableCode, JitError>;

    /// Link and load compiled code.
    fn load(
        &self,
        code: LoadableCode,
        resolver: &dyn LinkResolver,
    ) -> Result<Box<dyn LoadedObject>, JitError>;

    /// Resolve a symbol already present in the running process.
    fn resolve_process_symbol(&self, name: &str) -> Option<ExecutorSymbolDef>;
}

/// Applies named optimization pipelines to modules.
pub trait PassPipeline: Send + Sync {
    /// Check that a descriptor parses.
    fn validate(&self, descriptor: &str) -> Result<(), JitError>;

    /// Transform `module` with the pipeline named by `descriptor`.
    fn apply(&self, module: &mut Module, descriptor: &str) -> Result<(), JitError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loadable_code_downcast() {
        let code = LoadableCode::new("m", 42_u32);
        assert_eq!(code.module(), "m");
        assert_eq!(code.downcast::<u32>().unwrap(), 42);

        let code = LoadableCode::new("m", 42_u32);
        assert!(matches!(
            code.downcast::<String>(),
            Err(JitError::CompilationFailed { .. })
        ));
    }
}
