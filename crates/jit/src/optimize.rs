//! Optimization stage run right before code generation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use lazyjit_ir::Module;
use tracing::debug;

use crate::backend::PassPipeline;
use crate::error::JitError;
use crate::telemetry::{self, LogKind, LogPart};

/// Applies one pipeline descriptor to every module handed to it.
#[derive(Clone)]
pub struct OptimizeStage {
    pipeline: Arc<dyn PassPipeline>,
    descriptor: String,
    tag: &'static str,
}

impl OptimizeStage {
    /// Build a stage, rejecting a descriptor the pipeline cannot parse.
    pub fn new(
        pipeline: Arc<dyn PassPipeline>,
        descriptor: impl Into<String>,
        tag: &'static str,
    ) -> Result<Self, JitError> {
        let descriptor = descriptor.into();
        pipeline.validate(&descriptor)?;
        Ok(Self {
            pipeline,
            descriptor,
            tag,
        })
    }

    /// Build a stage without validating the descriptor. `run` reports the
    /// parse failure each time it is used.
    pub fn unchecked(
        pipeline: Arc<dyn PassPipeline>,
        descriptor: impl Into<String>,
        tag: &'static str,
    ) -> Self {
        Self {
            pipeline,
            descriptor: descriptor.into(),
            tag,
        }
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    /// Transform `module` in place and report the time spent.
    pub fn run(&self, module: &mut Module) -> Result<Duration, JitError> {
        let started = Instant::now();
        self.pipeline.apply(module, &self.descriptor)?;
        let elapsed = started.elapsed();
        debug!(
            module = %module.name,
            pipeline = %self.descriptor,
            stage = self.tag,
            elapsed_us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX),
            "Applied optimization pipeline"
        );
        telemetry::log_data("OptimizeTime", LogKind::Average, LogPart::BackEnd, elapsed.as_micros());
        Ok(elapsed)
    }
}

impl std::fmt::Debug for OptimizeStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimizeStage")
            .field("descriptor", &self.descriptor)
            .field("tag", &self.tag)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lazyjit_ir::{Function, Inst};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Accepts only "strip", which cuts every body to two instructions.
    #[derive(Default)]
    struct Strip {
        applied: AtomicUsize,
    }

    impl PassPipeline for Strip {
        fn validate(&self, descriptor: &str) -> Result<(), JitError> {
            if descriptor == "strip" {
                Ok(())
            } else {
                Err(JitError::invalid_pipeline(descriptor, "unknown pipeline"))
            }
        }

        fn apply(&self, module: &mut Module, descriptor: &str) -> Result<(), JitError> {
            self.validate(descriptor)?;
            self.applied.fetch_add(1, Ordering::Relaxed);
            for body in module.functions.iter_mut().filter_map(|f| f.body.as_mut()) {
                body.truncate(2);
            }
            Ok(())
        }
    }

    #[test]
    fn invalid_descriptor_fails_at_construction() {
        let err = OptimizeStage::new(Arc::new(Strip::default()), "bogus", "Optimize").unwrap_err();
        assert!(matches!(err, JitError::InvalidPipelineDescriptor { .. }));
    }

    #[test]
    fn unchecked_stage_fails_loudly_on_run() {
        let stage = OptimizeStage::unchecked(Arc::new(Strip::default()), "bogus", "Reoptimize");
        let mut module = Module::new("m");
        assert!(stage.run(&mut module).is_err());
    }

    #[test]
    fn run_transforms_module() {
        let pipeline = Arc::new(Strip::default());
        let stage = OptimizeStage::new(pipeline.clone(), "strip", "Optimize").unwrap();
        let mut module = Module::new("m").with_function(Function::define(
            "f",
            0,
            vec![Inst::Const(1), Inst::Ret, Inst::Const(2), Inst::Ret],
        ));
        stage.run(&mut module).unwrap();
        assert_eq!(module.instruction_count(), 2);
        assert_eq!(pipeline.applied.load(Ordering::Relaxed), 1);
        assert_eq!(stage.descriptor(), "strip");
    }
}
