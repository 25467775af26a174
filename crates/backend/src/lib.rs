//! Reference back end for the lazy JIT.
//!
//! Implements the collaborator contracts of `lazyjit-core` without a native
//! code generator: modules are verified and lowered to a compact operation
//! list that runs on a small interpreter, and the pass pipeline is a handful
//! of peephole-level rewrites.
//!
//! # Architecture
//!
//! ```text
//! lazyjit-core (sessions, stubs, reoptimization)
//!   └── NativeBackend / PassPipeline traits
//!
//! lazyjit-backend (this crate)
//!   ├── compiler  : verification and lowering
//!   ├── execution : interpreter for lowered functions
//!   ├── backend   : compile, link and load
//!   ├── host      : process symbols (`abs`, `min`, `max`, `print_i64`)
//!   └── passes    : `default<On>` pipelines and named passes
//! ```

pub mod backend;
pub mod compiler;
pub mod execution;
pub mod host;
pub mod passes;

use std::sync::Arc;

pub use backend::{ReferenceBackend, ReferenceObject, host_triple};
pub use host::HostSymbols;
pub use passes::{OptimizationStats, Pass, ReferencePassPipeline, parse_pipeline};

use lazyjit_core::{Jit, JitBuilder};

/// Builder for a [`Jit`] running on the reference backend and passes.
pub fn reference_jit() -> JitBuilder {
    reference_jit_with(ReferenceBackend::new())
}

/// Like [`reference_jit`], with a customized backend.
pub fn reference_jit_with(backend: ReferenceBackend) -> JitBuilder {
    tracing::debug!(triple = %host_triple(), "Using reference backend");
    Jit::builder(Arc::new(backend), Arc::new(ReferencePassPipeline))
}

#[cfg(test)]
mod tests;
