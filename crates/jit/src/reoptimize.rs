//! Call-count driven reoptimization.
//!
//! Every call through a unit's stubs bumps the unit's counter. When the
//! counter reaches the threshold the unit moves from `Cold` to `Triggered`
//! and is queued on the background worker pool. A worker recompiles the
//! retained source with the aggressive pipeline, loads it, and redirects
//! every stub of the unit. Calls keep running the old code meanwhile. A
//! failed attempt leaves the serving code and the version untouched.

use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use lazyjit_ir::Module;
use tracing::{debug, info, warn};

use crate::compiler_thread::CompilerThreadPool;
use crate::jit::JitInner;
use crate::lazy::LazyUnit;
use crate::optimize::OptimizeStage;
use crate::telemetry::{self, LogKind, LogPart};
use crate::types::JitMetrics;

/// Reoptimization state of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReoptPhase {
    /// Counting calls.
    Cold = 0,
    /// Threshold crossed, waiting for a worker.
    Triggered = 1,
    /// A worker is recompiling the unit.
    Reoptimizing = 2,
}

impl ReoptPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ReoptPhase::Triggered,
            2 => ReoptPhase::Reoptimizing,
            _ => ReoptPhase::Cold,
        }
    }
}

/// Point-in-time view of a unit's reoptimization record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReoptimizeStatus {
    pub module: String,
    pub version: u32,
    pub calls: u64,
    pub phase: ReoptPhase,
}

/// Decides whether a hot unit may advance to another version.
pub trait ReoptimizeDecision: Send + Sync {
    fn should_reoptimize(&self, module: &str, current_version: u32) -> bool;
}

impl<F> ReoptimizeDecision for F
where
    F: Fn(&str, u32) -> bool + Send + Sync,
{
    fn should_reoptimize(&self, module: &str, current_version: u32) -> bool {
        self(module, current_version)
    }
}

/// Per-unit version, call counter, phase and retained source.
#[derive(Debug)]
pub struct ReoptRecord {
    source: Module,
    version: AtomicU32,
    calls: AtomicU64,
    phase: AtomicU8,
}

impl ReoptRecord {
    pub(crate) fn new(source: Module) -> Self {
        Self {
            source,
            version: AtomicU32::new(0),
            calls: AtomicU64::new(0),
            phase: AtomicU8::new(ReoptPhase::Cold as u8),
        }
    }

    /// The post-intake module every recompilation starts from.
    pub fn source(&self) -> &Module {
        &self.source
    }

    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn phase(&self) -> ReoptPhase {
        ReoptPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn status(&self) -> ReoptimizeStatus {
        ReoptimizeStatus {
            module: self.source.name.clone(),
            version: self.version(),
            calls: self.calls(),
            phase: self.phase(),
        }
    }

    /// Count one call. Returns the new count.
    fn count_call(&self) -> u64 {
        self.calls.fetch_add(1, Ordering::Relaxed).saturating_add(1)
    }

    /// `Cold -> Triggered`. Only one caller wins.
    fn try_trigger(&self) -> bool {
        self.phase
            .compare_exchange(
                ReoptPhase::Cold as u8,
                ReoptPhase::Triggered as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn begin(&self) {
        self.phase
            .store(ReoptPhase::Reoptimizing as u8, Ordering::Release);
    }

    /// Back to `Cold` with a fresh counter, one version up on success.
    fn settle(&self, succeeded: bool) {
        if succeeded {
            self.version.fetch_add(1, Ordering::AcqRel);
        }
        self.calls.store(0, Ordering::Relaxed);
        self.phase.store(ReoptPhase::Cold as u8, Ordering::Release);
    }
}

/// Watches call counts and recompiles hot units in the background.
pub struct ReoptimizeController {
    threshold: u64,
    max_version: Option<u32>,
    decision: Option<Arc<dyn ReoptimizeDecision>>,
    stage: OptimizeStage,
    pool: RwLock<Option<CompilerThreadPool<Arc<LazyUnit>>>>,
}

impl ReoptimizeController {
    pub(crate) fn new(
        threshold: u64,
        max_version: Option<u32>,
        decision: Option<Arc<dyn ReoptimizeDecision>>,
        stage: OptimizeStage,
    ) -> Self {
        Self {
            threshold,
            max_version,
            decision,
            stage,
            pool: RwLock::new(None),
        }
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Register the worker pool hot units are queued on.
    pub(crate) fn register_pool(&self, pool: CompilerThreadPool<Arc<LazyUnit>>) {
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let mut guard = self.pool.write().unwrap();
        *guard = Some(pool);
    }

    /// Stop the workers after they drained the queue.
    ///
    /// Returns the names of workers that panicked.
    pub(crate) fn shutdown(&self) -> Vec<String> {
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let pool = self.pool.write().unwrap().take();
        match pool {
            Some(mut pool) => pool.shutdown(),
            None => Vec::new(),
        }
    }

    fn may_advance(&self, unit: &LazyUnit) -> bool {
        let version = unit.record().version();
        if self.max_version.is_some_and(|max| version >= max) {
            return false;
        }
        self.decision
            .as_ref()
            .is_none_or(|decision| decision.should_reoptimize(unit.module_name(), version))
    }

    /// Account one call into `unit`. Never blocks on the recompile.
    pub(crate) fn on_call(&self, unit: &Arc<LazyUnit>, metrics: &JitMetrics) {
        let record = unit.record();
        if record.count_call() < self.threshold || !record.try_trigger() {
            return;
        }
        if !self.may_advance(unit) {
            JitMetrics::bump(&metrics.reoptimizations_declined);
            debug!(module = %unit.module_name(), version = record.version(), "Reoptimization declined");
            record.settle(false);
            return;
        }
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let pool = self.pool.read().unwrap();
        let queued = pool
            .as_ref()
            .is_some_and(|pool| pool.send(Arc::clone(unit)));
        if queued {
            debug!(module = %unit.module_name(), calls = self.threshold, "Unit is hot, reoptimization queued");
        } else {
            record.settle(false);
        }
    }

    /// Worker side: recompile `unit` and redirect its stubs.
    pub(crate) fn reoptimize(&self, engine: &JitInner, unit: &LazyUnit) {
        let record = unit.record();
        if unit.is_retired() || engine.session.is_ended() {
            record.settle(false);
            return;
        }
        record.begin();
        let started = Instant::now();
        let result = engine
            .build(unit, &self.stage)
            .and_then(|object| unit.install(engine, object));
        match result {
            Ok(()) => {
                record.settle(true);
                JitMetrics::bump(&engine.metrics.reoptimizations);
                let version = record.version();
                info!(
                    module = %unit.module_name(),
                    version,
                    elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "Reoptimized unit"
                );
                telemetry::log_data(
                    "Recompiled",
                    LogKind::List,
                    LogPart::BackEnd,
                    format_args!("{}@{version}", unit.module_name()),
                );
            }
            Err(err) => {
                record.settle(false);
                JitMetrics::bump(&engine.metrics.reoptimization_failures);
                warn!(
                    module = %unit.module_name(),
                    version = record.version(),
                    %err,
                    "Reoptimization failed, keeping current version"
                );
            }
        }
    }
}

impl std::fmt::Debug for ReoptimizeController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReoptimizeController")
            .field("threshold", &self.threshold)
            .field("max_version", &self.max_version)
            .field("stage", &self.stage)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_is_won_once() {
        let record = ReoptRecord::new(Module::new("m"));
        assert!(record.try_trigger());
        assert!(!record.try_trigger());
        assert_eq!(record.phase(), ReoptPhase::Triggered);
        record.begin();
        assert_eq!(record.phase(), ReoptPhase::Reoptimizing);
    }

    #[test]
    fn settle_resets_counter_and_bumps_on_success() {
        let record = ReoptRecord::new(Module::new("m"));
        for _ in 0..4 {
            record.count_call();
        }
        record.try_trigger();
        record.settle(false);
        assert_eq!(record.status(), ReoptimizeStatus {
            module: "m".to_string(),
            version: 0,
            calls: 0,
            phase: ReoptPhase::Cold,
        });

        assert_eq!(record.count_call(), 1);
        record.try_trigger();
        record.settle(true);
        assert_eq!(record.version(), 1);
        assert_eq!(record.calls(), 0);
        assert!(record.try_trigger());
    }

    #[test]
    fn closures_are_decisions() {
        let only_first = |_: &str, version: u32| version == 0;
        assert!(only_first.should_reoptimize("m", 0));
        assert!(!only_first.should_reoptimize("m", 1));
    }
}
