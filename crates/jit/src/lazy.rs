//! Lazy materialization: call-through stubs and the units behind them.
//!
//! Adding a module creates one [`LazyUnit`] holding the normalized source
//! and one [`Stub`] per defined function. Nothing is compiled until a stub
//! is called or looked up. The first demand runs the optimize, compile and
//! load steps exactly once per unit; every concurrent caller waits on the
//! same attempt and sees the same outcome.
//!
//! A stub's target is a swappable `Arc<dyn NativeFunction>` cell. A call
//! clones the current target out of the cell and runs it with no lock held,
//! so a redirect never disturbs a call that has already entered a body.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};

use lazyjit_ir::Module;
use tracing::{debug, error, info, warn};

use crate::backend::{LinkResolver, LinkTarget, LoadedObject, NativeFunction, SymbolBody};
use crate::error::JitError;
use crate::jit::JitInner;
use crate::reoptimize::ReoptRecord;
use crate::session::{EntryState, TrackerId};
use crate::telemetry::{self, LogKind, LogPart};
use crate::types::JitMetrics;

enum StubTarget {
    Unresolved,
    Resolved(Arc<dyn NativeFunction>),
    Retired,
}

/// Redirectable call target for one lazily compiled function.
pub struct Stub {
    name: String,
    arity: u32,
    tracker: TrackerId,
    unit: Weak<LazyUnit>,
    target: RwLock<StubTarget>,
    report_first_call: bool,
    reported: AtomicBool,
}

impl Stub {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the stub already forwards to compiled code.
    pub fn is_resolved(&self) -> bool {
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let target = self.target.read().unwrap();
        matches!(*target, StubTarget::Resolved(_))
    }

    fn current(&self) -> Result<Option<Arc<dyn NativeFunction>>, JitError> {
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let target = self.target.read().unwrap();
        match &*target {
            StubTarget::Unresolved => Ok(None),
            StubTarget::Resolved(body) => Ok(Some(Arc::clone(body))),
            StubTarget::Retired => Err(JitError::ResourceTrackerDefunct(self.tracker.value())),
        }
    }

    /// Swap in a new body. Fails once the stub is retired.
    pub(crate) fn redirect(&self, body: Arc<dyn NativeFunction>) -> bool {
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let mut target = self.target.write().unwrap();
        if matches!(*target, StubTarget::Retired) {
            return false;
        }
        *target = StubTarget::Resolved(body);
        true
    }

    fn retire(&self) {
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let mut target = self.target.write().unwrap();
        *target = StubTarget::Retired;
    }

    pub(crate) fn unit(&self) -> Result<Arc<LazyUnit>, JitError> {
        self.unit
            .upgrade()
            .ok_or(JitError::ResourceTrackerDefunct(self.tracker.value()))
    }

    /// Materialize the owning unit if that has not happened yet.
    pub(crate) fn materialize(&self) -> Result<(), JitError> {
        self.unit()?.materialize()
    }
}

impl NativeFunction for Stub {
    fn invoke(&self, args: &[i64]) -> Result<i64, JitError> {
        let body = match self.current()? {
            Some(body) => body,
            None => {
                self.materialize()?;
                match self.current()? {
                    Some(body) => body,
                    None => handle_lazy_call_through_error(&self.name),
                }
            }
        };
        if self.report_first_call && !self.reported.swap(true, Ordering::AcqRel) {
            telemetry::log_data("EntryReached", LogKind::List, LogPart::BackEnd, &self.name);
        }
        if let Some(unit) = self.unit.upgrade() {
            unit.record_call();
        }
        body.invoke(args)
    }

    fn arity(&self) -> u32 {
        self.arity
    }
}

impl std::fmt::Debug for Stub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stub")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("resolved", &self.is_resolved())
            .finish_non_exhaustive()
    }
}

/// A stub with no body after successful materialization: the unit's
/// bookkeeping is corrupt and the process stops.
pub(crate) fn handle_lazy_call_through_error(name: &str) -> ! {
    error!(symbol = name, "LazyCallThrough error: Could not find function body");
    eprintln!("LazyCallThrough error: Could not find function body for `{name}`");
    std::process::exit(1)
}

/// One added module: its stubs, its retained source and its loaded code.
pub struct LazyUnit {
    id: u64,
    tracker: TrackerId,
    engine: Weak<JitInner>,
    stubs: Vec<Arc<Stub>>,
    materialized: OnceLock<Result<(), JitError>>,
    record: ReoptRecord,
    /// Object serving the stubs. Superseded versions are released.
    serving: Mutex<Option<Box<dyn LoadedObject>>>,
    retired: AtomicBool,
}

impl LazyUnit {
    /// Create a unit and one stub per defined function of `source`.
    pub(crate) fn new(
        id: u64,
        tracker: TrackerId,
        engine: Weak<JitInner>,
        source: Module,
        entry_symbol: Option<&str>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|unit: &Weak<LazyUnit>| {
            let stubs = source
                .defined_functions()
                .map(|function| {
                    Arc::new(Stub {
                        name: function.name.clone(),
                        arity: function.params,
                        tracker,
                        unit: unit.clone(),
                        target: RwLock::new(StubTarget::Unresolved),
                        report_first_call: entry_symbol == Some(function.name.as_str()),
                        reported: AtomicBool::new(false),
                    })
                })
                .collect();
            LazyUnit {
                id,
                tracker,
                engine,
                stubs,
                materialized: OnceLock::new(),
                record: ReoptRecord::new(source),
                serving: Mutex::new(None),
                retired: AtomicBool::new(false),
            }
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Name of the module this unit was built from.
    pub fn module_name(&self) -> &str {
        &self.record.source().name
    }

    pub fn tracker(&self) -> TrackerId {
        self.tracker
    }

    pub fn stubs(&self) -> &[Arc<Stub>] {
        &self.stubs
    }

    pub(crate) fn record(&self) -> &ReoptRecord {
        &self.record
    }

    pub fn is_materialized(&self) -> bool {
        matches!(self.materialized.get(), Some(Ok(())))
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Compile and load the unit once. Later and concurrent callers get
    /// the stored outcome; a failure is never retried.
    pub(crate) fn materialize(&self) -> Result<(), JitError> {
        self.materialized
            .get_or_init(|| self.materialize_once())
            .clone()
    }

    fn materialize_once(&self) -> Result<(), JitError> {
        let engine = self.engine.upgrade().ok_or(JitError::SessionEnded)?;
        let _activity = engine.session.activity().enter();
        // Checked after entering so teardown either waits for us or we see
        // the flag.
        engine.session.ensure_live()?;

        let result = engine
            .build(self, &engine.optimizer)
            .and_then(|object| self.install(&engine, object));
        match &result {
            Ok(()) => {
                JitMetrics::bump(&engine.metrics.materializations);
                info!(
                    module = %self.module_name(),
                    functions = self.stubs.len(),
                    "Materialized unit"
                );
            }
            Err(err) => {
                JitMetrics::bump(&engine.metrics.materialization_failures);
                error!(module = %self.module_name(), %err, "Materialization failed");
            }
        }
        result
    }

    /// Point every stub this object defines at its new body and keep the
    /// object alive. Releases the object instead if the unit was retired.
    ///
    /// The object it replaces is released once the stubs are redirected.
    /// Calls already inside the old code hold their own reference to it.
    pub(crate) fn install(
        &self,
        engine: &JitInner,
        object: Box<dyn LoadedObject>,
    ) -> Result<(), JitError> {
        #[expect(clippy::unwrap_used, reason = "Mutex poisoning is unrecoverable")]
        let mut serving = self.serving.lock().unwrap();
        if self.is_retired() {
            drop(serving);
            if let Err(err) = object.release() {
                error!(module = %self.module_name(), %err, "Failed to release code of a retired unit");
            }
            return Err(JitError::ResourceTrackerDefunct(self.tracker.value()));
        }
        for stub in &self.stubs {
            match object.address_of(stub.name()) {
                Some(def) if matches!(def.body, SymbolBody::Function(_)) => {
                    if !engine.session.resolve(stub, def) {
                        debug!(symbol = %stub.name(), "Symbol left the namespace during install");
                    }
                }
                _ => debug!(symbol = %stub.name(), "Loaded object has no body for symbol"),
            }
        }
        let superseded = serving.replace(object);
        drop(serving);

        if let Some(old) = superseded {
            match old.release() {
                Ok(()) => debug!(module = %self.module_name(), "Released superseded code"),
                Err(err) => {
                    JitMetrics::bump(&engine.metrics.release_failures);
                    warn!(module = %self.module_name(), %err, "Failed to release superseded code");
                }
            }
        }
        Ok(())
    }

    /// Count one call and maybe hand the unit to the reoptimizer.
    fn record_call(self: &Arc<Self>) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        JitMetrics::bump(&engine.metrics.stub_calls);
        engine.reoptimizer.on_call(self, &engine.metrics);
    }

    /// Detach the unit: stubs stop forwarding and loaded code is released.
    ///
    /// Returns the release errors.
    pub(crate) fn retire(&self) -> Vec<JitError> {
        #[expect(clippy::unwrap_used, reason = "Mutex poisoning is unrecoverable")]
        let mut serving = self.serving.lock().unwrap();
        self.retired.store(true, Ordering::SeqCst);
        for stub in &self.stubs {
            stub.retire();
        }
        serving
            .take()
            .and_then(|object| object.release().err())
            .into_iter()
            .collect()
    }
}

impl std::fmt::Debug for LazyUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyUnit")
            .field("id", &self.id)
            .field("module", &self.module_name())
            .field("tracker", &self.tracker)
            .field("materialized", &self.is_materialized())
            .field("retired", &self.is_retired())
            .finish_non_exhaustive()
    }
}

/// Binds external references of freshly compiled code.
///
/// Lazy symbols bind to their stub, so linking never compiles anything.
/// Unknown names fall back to process symbols, then to the front end.
pub(crate) struct SessionLinker<'a> {
    pub(crate) engine: &'a JitInner,
}

impl LinkResolver for SessionLinker<'_> {
    fn resolve(&self, name: &str) -> Result<LinkTarget, JitError> {
        Ok(match self.engine.find(name)? {
            EntryState::Lazy { stub } | EntryState::Materialized { stub, .. } => {
                LinkTarget::Function(stub)
            }
            EntryState::Absolute { def } => def.body.into(),
        })
    }
}
