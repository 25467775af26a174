//! Lazy, reoptimizing JIT core.
//!
//! Modules go through intake (layout check, internal symbol uniquing) and
//! are registered behind call-through stubs. The first call or lookup of a
//! symbol optimizes, compiles and loads its module. Units that get hot are
//! recompiled in the background with a more aggressive pipeline and their
//! stubs are redirected to the new code.
//!
//! Code generation and pass execution are delegated to a [`NativeBackend`]
//! and a [`PassPipeline`].

pub mod activity;
pub mod backend;
pub mod compiler_thread;
pub mod error;
pub mod intake;
pub mod jit;
pub mod lazy;
pub mod optimize;
pub mod protocol;
pub mod reoptimize;
pub mod session;
pub mod telemetry;
pub mod types;

pub use backend::{
    ExecutorSymbolDef, LinkResolver, LinkTarget, LoadableCode, LoadedObject, NativeBackend,
    NativeFunction, PassPipeline, SymbolBody, TargetDescriptor,
};
pub use error::JitError;
pub use jit::{Jit, JitBuilder, JitSymbol, ResourceTracker};
pub use protocol::{AheadOfTimeProvider, CapturedModule, ModuleProvider};
pub use reoptimize::{ReoptPhase, ReoptimizeDecision, ReoptimizeStatus};
pub use session::{ExecutionSession, TrackerId};
pub use types::{
    ExecutorAddr, JitConfig, JitMetrics, MetricsSnapshot, SymbolFlags, SymbolVisibility,
    DEFAULT_OPTIMIZE_PIPELINE, DEFAULT_REOPTIMIZE_PIPELINE, DEFAULT_REOPTIMIZE_THRESHOLD,
};
