//! Configuration, addresses, symbol flags and metrics.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use lazyjit_ir::DataLayout;
use tracing::warn;

use crate::error::JitError;

/// Pipeline used for first-time compilation.
pub const DEFAULT_OPTIMIZE_PIPELINE: &str = "default<O1>";
/// Pipeline used when a unit is recompiled after becoming hot.
pub const DEFAULT_REOPTIMIZE_PIPELINE: &str = "default<O2>";
/// Calls before a unit becomes a reoptimization candidate.
pub const DEFAULT_REOPTIMIZE_THRESHOLD: u64 = 10;

/// Configuration for the lazy JIT.
#[derive(Debug, Clone)]
pub struct JitConfig {
    /// Fast, conservative pipeline applied at first materialization.
    pub optimize_pipeline: String,
    /// Aggressive pipeline applied when a unit is reoptimized.
    pub reoptimize_pipeline: String,
    /// Number of calls into a unit before it is reoptimized. Zero means the
    /// first call already triggers.
    pub reoptimize_threshold: u64,
    /// Highest version a unit may reach. `None` means unbounded.
    pub max_reoptimize_version: Option<u32>,
    /// Number of background reoptimization workers (min 1).
    pub reoptimize_workers: usize,
    /// Symbol whose first invocation is reported to telemetry.
    pub entry_symbol: Option<String>,
    /// Overrides the backend's target layout when set.
    pub data_layout: Option<DataLayout>,
}

impl JitConfig {
    /// Apply back-end arguments of the form `-opt=<pipeline>`,
    /// `-reopt=<pipeline>` and `-threshold=<calls>`.
    ///
    /// Each argument is split once on `=`. Unknown keys are ignored with a
    /// warning.
    pub fn apply_backend_args<S: AsRef<str>>(&mut self, args: &[S]) -> Result<(), JitError> {
        for argument in args {
            let argument = argument.as_ref();
            let (key, value) = argument.split_once('=').unwrap_or((argument, ""));
            match key {
                "-opt" => self.optimize_pipeline = value.to_owned(),
                "-reopt" => self.reoptimize_pipeline = value.to_owned(),
                "-threshold" => {
                    self.reoptimize_threshold = value.parse().map_err(|_| {
                        JitError::invalid_config(argument, "threshold must be an unsigned integer")
                    })?;
                }
                _ => warn!(argument, "Ignoring unknown back-end argument"),
            }
        }
        Ok(())
    }
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            optimize_pipeline: DEFAULT_OPTIMIZE_PIPELINE.to_owned(),
            reoptimize_pipeline: DEFAULT_REOPTIMIZE_PIPELINE.to_owned(),
            reoptimize_threshold: DEFAULT_REOPTIMIZE_THRESHOLD,
            max_reoptimize_version: None,
            reoptimize_workers: 1,
            entry_symbol: None,
            data_layout: None,
        }
    }
}

/// An address in the executor's code or data space.
///
/// Addresses are opaque: they identify a loaded body and compare equal only
/// when they name the same code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutorAddr(u64);

impl ExecutorAddr {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ExecutorAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Symbol visibility in the session namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolVisibility {
    Exported,
    Hidden,
}

/// Flags attached to every symbol table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolFlags {
    pub visibility: SymbolVisibility,
    pub callable: bool,
}

impl SymbolFlags {
    pub const EXPORTED_FUNCTION: Self = Self {
        visibility: SymbolVisibility::Exported,
        callable: true,
    };
    pub const EXPORTED_DATA: Self = Self {
        visibility: SymbolVisibility::Exported,
        callable: false,
    };

    pub fn is_exported(&self) -> bool {
        self.visibility == SymbolVisibility::Exported
    }
}

/// Atomic metrics for materialization and reoptimization events.
#[derive(Debug, Default)]
pub struct JitMetrics {
    /// Modules accepted by intake.
    pub modules_added: AtomicU64,
    /// Successful first-time materializations.
    pub materializations: AtomicU64,
    /// Failed first-time materializations.
    pub materialization_failures: AtomicU64,
    /// Successful reoptimizations.
    pub reoptimizations: AtomicU64,
    /// Failed (absorbed) reoptimizations.
    pub reoptimization_failures: AtomicU64,
    /// Hot units that the decision policy declined to reoptimize.
    pub reoptimizations_declined: AtomicU64,
    /// Calls that went through a stub.
    pub stub_calls: AtomicU64,
    /// On-demand module requests sent to the front end.
    pub module_requests: AtomicU64,
    /// Superseded objects whose release failed.
    pub release_failures: AtomicU64,
}

/// Point-in-time copy of [`JitMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub modules_added: u64,
    pub materializations: u64,
    pub materialization_failures: u64,
    pub reoptimizations: u64,
    pub reoptimization_failures: u64,
    pub reoptimizations_declined: u64,
    pub stub_calls: u64,
    pub module_requests: u64,
    pub release_failures: u64,
}

impl JitMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            modules_added: self.modules_added.load(Ordering::Relaxed),
            materializations: self.materializations.load(Ordering::Relaxed),
            materialization_failures: self.materialization_failures.load(Ordering::Relaxed),
            reoptimizations: self.reoptimizations.load(Ordering::Relaxed),
            reoptimization_failures: self.reoptimization_failures.load(Ordering::Relaxed),
            reoptimizations_declined: self.reoptimizations_declined.load(Ordering::Relaxed),
            stub_calls: self.stub_calls.load(Ordering::Relaxed),
            module_requests: self.module_requests.load(Ordering::Relaxed),
            release_failures: self.release_failures.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters to zero.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn reset(&self) {
        for counter in [
            &self.modules_added,
            &self.materializations,
            &self.materialization_failures,
            &self.reoptimizations,
            &self.reoptimization_failures,
            &self.reoptimizations_declined,
            &self.stub_calls,
            &self.module_requests,
            &self.release_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_args_override_defaults() {
        let mut config = JitConfig::default();
        config
            .apply_backend_args(&["-opt=default<O0>", "-reopt=const-fold,dce", "-threshold=3"])
            .unwrap();
        assert_eq!(config.optimize_pipeline, "default<O0>");
        assert_eq!(config.reoptimize_pipeline, "const-fold,dce");
        assert_eq!(config.reoptimize_threshold, 3);
    }

    #[test]
    fn backend_args_split_once() {
        let mut config = JitConfig::default();
        config.apply_backend_args(&["-opt=a=b"]).unwrap();
        assert_eq!(config.optimize_pipeline, "a=b");
    }

    #[test]
    fn unknown_backend_args_are_ignored() {
        let mut config = JitConfig::default();
        config.apply_backend_args(&["-verbose"]).unwrap();
        assert_eq!(config.optimize_pipeline, DEFAULT_OPTIMIZE_PIPELINE);
    }

    #[test]
    fn bad_threshold_is_rejected() {
        let mut config = JitConfig::default();
        assert_eq!(
            config.apply_backend_args(&["-threshold=-1"]),
            Err(JitError::invalid_config(
                "-threshold=-1",
                "threshold must be an unsigned integer"
            ))
        );
    }

    #[test]
    fn metrics_reset() {
        let metrics = JitMetrics::new();
        JitMetrics::bump(&metrics.stub_calls);
        JitMetrics::bump(&metrics.reoptimizations);
        assert_eq!(metrics.snapshot().stub_calls, 1);
        assert_eq!(metrics.snapshot().reoptimizations, 1);
        metrics.reset();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn address_display_is_hex() {
        assert_eq!(ExecutorAddr::new(255).to_string(), "0xff");
    }
}
