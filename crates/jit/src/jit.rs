//! The lazy JIT: intake, lookup, resource trackers and teardown.

use std::sync::{Arc, Weak};

use lazyjit_ir::{DataLayout, Module};
use tracing::{debug, error, info, warn};

use crate::backend::{
    ExecutorSymbolDef, LoadedObject, NativeBackend, NativeFunction, PassPipeline, SymbolBody,
    TargetDescriptor,
};
use crate::compiler_thread::CompilerThreadPool;
use crate::error::JitError;
use crate::intake;
use crate::lazy::{LazyUnit, SessionLinker};
use crate::optimize::OptimizeStage;
use crate::protocol::{AheadOfTimeProvider, ModuleProvider};
use crate::reoptimize::{ReoptimizeController, ReoptimizeDecision, ReoptimizeStatus};
use crate::session::{EntryState, ExecutionSession, TrackerId};
use crate::types::{ExecutorAddr, JitConfig, JitMetrics, MetricsSnapshot, SymbolFlags};

pub(crate) struct JitInner {
    this: Weak<JitInner>,
    pub(crate) session: ExecutionSession,
    backend: Arc<dyn NativeBackend>,
    target: TargetDescriptor,
    pub(crate) optimizer: OptimizeStage,
    pub(crate) reoptimizer: ReoptimizeController,
    provider: Arc<dyn ModuleProvider>,
    pub(crate) metrics: JitMetrics,
    config: JitConfig,
}

impl JitInner {
    /// Optimize a copy of the unit's source with `stage`, compile and load it.
    pub(crate) fn build(
        &self,
        unit: &LazyUnit,
        stage: &OptimizeStage,
    ) -> Result<Box<dyn LoadedObject>, JitError> {
        let mut module = unit.record().source().clone();
        stage.run(&mut module)?;
        let code = self.backend.compile(&module, &self.target)?;
        self.backend.load(code, &SessionLinker { engine: self })
    }

    /// Find a definition without materializing it.
    ///
    /// Falls back to the process symbols and then to the front end.
    pub(crate) fn find(&self, name: &str) -> Result<EntryState, JitError> {
        if let Some(state) = self.session.get(name) {
            return Ok(state);
        }
        if let Some(def) = self.backend.resolve_process_symbol(name) {
            debug!(symbol = name, addr = %def.addr, "Resolved process symbol");
            return Ok(match self.session.define(TrackerId::DEFAULT, name, def.clone()) {
                // Lost a race with another resolver; take whatever won.
                Ok(()) | Err(JitError::DuplicateSymbol(_)) => self
                    .session
                    .get(name)
                    .unwrap_or(EntryState::Absolute { def }),
                Err(_) => EntryState::Absolute { def },
            });
        }
        self.request_module(name)?;
        self.session
            .get(name)
            .ok_or_else(|| JitError::SymbolNotFound(name.to_owned()))
    }

    fn request_module(&self, name: &str) -> Result<(), JitError> {
        JitMetrics::bump(&self.metrics.module_requests);
        let captured = self.provider.request_module(name).map_err(|err| {
            debug!(symbol = name, %err, "Front end supplied no module");
            JitError::SymbolNotFound(name.to_owned())
        })?;
        let tracker = match &captured.tracker {
            Some(tracker) => self.tracker_id(tracker)?,
            None => TrackerId::DEFAULT,
        };
        info!(symbol = name, module = %captured.module.name, "Front end supplied module on demand");
        self.add_module(captured.module, tracker)
    }

    fn tracker_id(&self, tracker: &ResourceTracker) -> Result<TrackerId, JitError> {
        if std::ptr::eq(tracker.engine.as_ptr(), self) {
            Ok(tracker.id)
        } else {
            Err(JitError::ResourceTrackerDefunct(tracker.id.value()))
        }
    }

    fn add_module(&self, mut module: Module, tracker: TrackerId) -> Result<(), JitError> {
        self.session.ensure_live()?;
        if !self.session.tracker_is_live(tracker) {
            return Err(JitError::ResourceTrackerDefunct(tracker.value()));
        }
        let renamed = intake::normalize(&mut module, &self.session)?;

        let data: Vec<(String, ExecutorSymbolDef)> = module
            .globals
            .iter()
            .map(|global| {
                let def = ExecutorSymbolDef {
                    addr: self.session.allocate_data_addr(),
                    flags: SymbolFlags::EXPORTED_DATA,
                    body: SymbolBody::Data(global.value),
                };
                (global.name.clone(), def)
            })
            .collect();
        let name = module.name.clone();
        let functions = module.defined_functions().count();
        let globals = data.len();

        let unit = LazyUnit::new(
            self.session.next_unit_id(),
            tracker,
            self.this.clone(),
            module,
            self.config.entry_symbol.as_deref(),
        );
        self.session.define_unit(&unit, data)?;
        JitMetrics::bump(&self.metrics.modules_added);
        info!(
            module = %name,
            functions,
            globals,
            renamed = renamed.len(),
            tracker = tracker.value(),
            "Added module"
        );
        Ok(())
    }

    fn remove_tracker(&self, id: TrackerId) -> Result<(), JitError> {
        let state = self.session.remove_tracker(id)?;
        let errors: Vec<JitError> = state.units.iter().flat_map(|unit| unit.retire()).collect();
        info!(
            tracker = id.value(),
            units = state.units.len(),
            symbols = state.symbols.len(),
            "Removed resource tracker"
        );
        if errors.is_empty() {
            Ok(())
        } else {
            Err(JitError::Teardown(errors))
        }
    }

    fn end_session(&self) -> Result<(), JitError> {
        if !self.session.mark_ended() {
            return Ok(());
        }
        let mut errors: Vec<JitError> = self
            .reoptimizer
            .shutdown()
            .into_iter()
            .map(|worker| JitError::Worker(format!("{worker} panicked")))
            .collect();
        self.session.activity().wait_idle();

        let mut units = 0;
        for state in self.session.drain_trackers() {
            units += state.units.len();
            for unit in state.units {
                errors.extend(unit.retire());
            }
        }
        info!(units, errors = errors.len(), "Execution session ended");
        if errors.is_empty() {
            Ok(())
        } else {
            Err(JitError::Teardown(errors))
        }
    }
}

/// Builds a [`Jit`].
pub struct JitBuilder {
    backend: Arc<dyn NativeBackend>,
    pipeline: Arc<dyn PassPipeline>,
    config: JitConfig,
    provider: Arc<dyn ModuleProvider>,
    decision: Option<Arc<dyn ReoptimizeDecision>>,
}

impl JitBuilder {
    pub fn config(mut self, config: JitConfig) -> Self {
        self.config = config;
        self
    }

    /// Front end asked for modules defining unknown symbols. Defaults to
    /// [`AheadOfTimeProvider`].
    pub fn module_provider(mut self, provider: Arc<dyn ModuleProvider>) -> Self {
        self.provider = provider;
        self
    }

    /// Policy consulted each time a unit becomes hot.
    pub fn reoptimize_decision(mut self, decision: Arc<dyn ReoptimizeDecision>) -> Self {
        self.decision = Some(decision);
        self
    }

    /// Validate the pipelines and start the reoptimization workers.
    ///
    /// An unparsable first-compile pipeline is fatal. An unparsable
    /// reoptimization pipeline is reported and every later reoptimization
    /// attempt fails without touching the serving code.
    pub fn build(self) -> Result<Jit, JitError> {
        let JitBuilder {
            backend,
            pipeline,
            config,
            provider,
            decision,
        } = self;

        let mut target = backend.target();
        if let Some(layout) = &config.data_layout {
            target.data_layout = layout.clone();
        }
        let optimizer = OptimizeStage::new(
            Arc::clone(&pipeline),
            config.optimize_pipeline.clone(),
            "Optimize",
        )?;
        let aggressive = match OptimizeStage::new(
            Arc::clone(&pipeline),
            config.reoptimize_pipeline.clone(),
            "Reoptimize",
        ) {
            Ok(stage) => stage,
            Err(err) => {
                warn!(%err, "Invalid reoptimization pipeline, hot units will fail to reoptimize");
                OptimizeStage::unchecked(pipeline, config.reoptimize_pipeline.clone(), "Reoptimize")
            }
        };
        let reoptimizer = ReoptimizeController::new(
            config.reoptimize_threshold,
            config.max_reoptimize_version,
            decision,
            aggressive,
        );

        let inner = Arc::new_cyclic(|this: &Weak<JitInner>| JitInner {
            this: this.clone(),
            session: ExecutionSession::new(target.data_layout.clone()),
            backend,
            target,
            optimizer,
            reoptimizer,
            provider,
            metrics: JitMetrics::new(),
            config,
        });

        let engine = Arc::downgrade(&inner);
        let pool = CompilerThreadPool::start(
            inner.config.reoptimize_workers,
            inner.session.activity().clone(),
            move |unit: Arc<LazyUnit>| {
                if let Some(engine) = engine.upgrade() {
                    engine.reoptimizer.reoptimize(&engine, &unit);
                }
            },
        )
        .map_err(|err| JitError::Worker(err.to_string()))?;
        let workers = pool.workers();
        inner.reoptimizer.register_pool(pool);

        info!(
            triple = %inner.target.triple,
            data_layout = %inner.target.data_layout,
            optimize = %inner.optimizer.descriptor(),
            reoptimize = %inner.config.reoptimize_pipeline,
            threshold = inner.config.reoptimize_threshold,
            workers,
            "Lazy JIT ready"
        );
        Ok(Jit { inner })
    }
}

/// A lazily compiling, reoptimizing JIT over one execution session.
///
/// Dropping the JIT ends the session if [`Jit::end_session`] was not called.
pub struct Jit {
    inner: Arc<JitInner>,
}

impl Jit {
    pub fn builder(backend: Arc<dyn NativeBackend>, pipeline: Arc<dyn PassPipeline>) -> JitBuilder {
        JitBuilder {
            backend,
            pipeline,
            config: JitConfig::default(),
            provider: Arc::new(AheadOfTimeProvider),
            decision: None,
        }
    }

    /// Add a module to the default resource tracker. Nothing is compiled
    /// until one of its symbols is looked up or called.
    pub fn add_module(&self, module: Module) -> Result<(), JitError> {
        self.inner.add_module(module, TrackerId::DEFAULT)
    }

    pub fn add_module_with_tracker(
        &self,
        module: Module,
        tracker: &ResourceTracker,
    ) -> Result<(), JitError> {
        let id = self.inner.tracker_id(tracker)?;
        self.inner.add_module(module, id)
    }

    pub fn create_resource_tracker(&self) -> Result<ResourceTracker, JitError> {
        self.inner.session.ensure_live()?;
        Ok(ResourceTracker {
            id: self.inner.session.create_tracker(),
            engine: Arc::downgrade(&self.inner),
        })
    }

    pub fn default_resource_tracker(&self) -> ResourceTracker {
        ResourceTracker {
            id: TrackerId::DEFAULT,
            engine: Arc::downgrade(&self.inner),
        }
    }

    /// Define a resolved symbol in the default tracker.
    pub fn define(&self, name: &str, def: ExecutorSymbolDef) -> Result<(), JitError> {
        self.inner.session.ensure_live()?;
        self.inner.session.define(TrackerId::DEFAULT, name, def)
    }

    /// Resolve `name`, materializing its unit first if needed. Blocks while
    /// another thread materializes the same unit.
    pub fn lookup(&self, name: &str) -> Result<JitSymbol, JitError> {
        self.inner.session.ensure_live()?;
        match self.inner.find(name)? {
            EntryState::Absolute { def } => Ok(JitSymbol::absolute(name, def)),
            EntryState::Materialized { def, stub } => Ok(JitSymbol::lazy(name, def, stub)),
            EntryState::Lazy { stub } => {
                stub.materialize()?;
                match self.inner.session.get(name) {
                    Some(EntryState::Materialized { def, stub }) => {
                        Ok(JitSymbol::lazy(name, def, stub))
                    }
                    Some(_) => Err(JitError::LazyCallThroughInconsistency(name.to_owned())),
                    None => Err(JitError::SymbolNotFound(name.to_owned())),
                }
            }
        }
    }

    /// Address to transfer control to for the named entry point.
    pub fn lookup_entry_address(&self, name: &str) -> Result<ExecutorAddr, JitError> {
        self.lookup(name).map(|symbol| symbol.address())
    }

    /// Reoptimization record of the unit defining `name`.
    pub fn reoptimization_status(&self, name: &str) -> Option<ReoptimizeStatus> {
        match self.inner.session.get(name)? {
            EntryState::Lazy { stub } | EntryState::Materialized { stub, .. } => {
                stub.unit().ok().map(|unit| unit.record().status())
            }
            EntryState::Absolute { .. } => None,
        }
    }

    /// Block until every queued reoptimization and running materialization
    /// has settled.
    pub fn wait_for_background_work(&self) {
        self.inner.session.activity().wait_idle();
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Zero every metrics counter.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn reset_metrics(&self) {
        self.inner.metrics.reset();
    }

    pub fn session(&self) -> &ExecutionSession {
        &self.inner.session
    }

    pub fn config(&self) -> &JitConfig {
        &self.inner.config
    }

    pub fn data_layout(&self) -> &DataLayout {
        self.inner.session.data_layout()
    }

    /// Stop the workers, wait for in-flight work, release all loaded code
    /// and invalidate every resource tracker.
    ///
    /// Release errors are collected into [`JitError::Teardown`]. Calling it
    /// again is a no-op.
    pub fn end_session(&self) -> Result<(), JitError> {
        self.inner.end_session()
    }
}

impl Drop for Jit {
    fn drop(&mut self) {
        if let Err(err) = self.inner.end_session() {
            error!(%err, "Errors while ending execution session");
        }
    }
}

impl std::fmt::Debug for Jit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Jit")
            .field("session", &self.inner.session)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

/// Handle grouping modules for collective removal.
#[derive(Debug, Clone)]
pub struct ResourceTracker {
    id: TrackerId,
    engine: Weak<JitInner>,
}

impl ResourceTracker {
    pub fn id(&self) -> TrackerId {
        self.id
    }

    /// Remove every symbol added through this tracker and release its code.
    ///
    /// Calls through stubs of removed symbols fail with
    /// [`JitError::ResourceTrackerDefunct`]; reoptimizations in flight
    /// discard their result.
    pub fn remove(&self) -> Result<(), JitError> {
        let engine = self.engine.upgrade().ok_or(JitError::SessionEnded)?;
        engine.remove_tracker(self.id)
    }
}

/// A resolved symbol.
#[derive(Clone)]
pub struct JitSymbol {
    name: String,
    def: ExecutorSymbolDef,
    callee: Option<Arc<dyn NativeFunction>>,
}

impl JitSymbol {
    fn absolute(name: &str, def: ExecutorSymbolDef) -> Self {
        let callee = match &def.body {
            SymbolBody::Function(function) => Some(Arc::clone(function)),
            SymbolBody::Data(_) => None,
        };
        Self {
            name: name.to_owned(),
            def,
            callee,
        }
    }

    /// Calls go through the stub so they are counted and follow redirects.
    fn lazy(name: &str, def: ExecutorSymbolDef, stub: Arc<crate::lazy::Stub>) -> Self {
        Self {
            name: name.to_owned(),
            def,
            callee: Some(stub),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address of the code serving the symbol when it was looked up.
    pub fn address(&self) -> ExecutorAddr {
        self.def.addr
    }

    pub fn flags(&self) -> SymbolFlags {
        self.def.flags
    }

    pub fn arity(&self) -> Option<u32> {
        self.callee.as_ref().map(|callee| callee.arity())
    }

    /// Data value, for data symbols.
    pub fn value(&self) -> Option<i64> {
        match self.def.body {
            SymbolBody::Data(value) => Some(value),
            SymbolBody::Function(_) => None,
        }
    }

    pub fn call(&self, args: &[i64]) -> Result<i64, JitError> {
        match &self.callee {
            Some(callee) => callee.invoke(args),
            None => Err(JitError::trap(&self.name, "symbol is not callable")),
        }
    }
}

impl std::fmt::Debug for JitSymbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitSymbol")
            .field("name", &self.name)
            .field("addr", &self.def.addr)
            .field("flags", &self.def.flags)
            .finish_non_exhaustive()
    }
}
