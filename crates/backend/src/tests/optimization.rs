//! Optimization pipelines: descriptor validation at build time and
//! semantic preservation of the reference passes.

use std::sync::Arc;

use lazyjit_core::{
    Jit, JitConfig, JitError, LinkResolver, LinkTarget, NativeBackend, NativeFunction,
    PassPipeline, SymbolBody,
};
use lazyjit_ir::{Function, Inst, Module};
use proptest::prelude::*;

use crate::tests::test_helpers::*;
use crate::{ReferenceBackend, ReferencePassPipeline};

#[test]
fn invalid_first_compile_pipeline_is_fatal() {
    let backend = Arc::new(CountingBackend::new());
    let pipeline = Arc::new(MarkingPipeline::new());
    let config = JitConfig {
        optimize_pipeline: "default<O9>".to_string(),
        ..JitConfig::default()
    };
    let result = Jit::builder(backend, pipeline).config(config).build();
    assert!(matches!(
        result,
        Err(JitError::InvalidPipelineDescriptor { .. })
    ));
}

#[test]
fn invalid_reoptimization_pipeline_only_fails_reoptimization() {
    let config = JitConfig {
        reoptimize_pipeline: "no-such-pass".to_string(),
        reoptimize_threshold: 1,
        ..JitConfig::default()
    };
    let (jit, backend, _) = setup(config);
    jit.add_module(constant_module("hot", "value", 3)).unwrap();

    let value = jit.lookup("value").unwrap();
    assert_eq!(value.call(&[]).unwrap(), 3);
    jit.wait_for_background_work();

    assert_eq!(jit.metrics().reoptimization_failures, 1);
    assert_eq!(jit.reoptimization_status("value").unwrap().version, 0);
    assert_eq!(value.call(&[]).unwrap(), 3);
    assert_eq!(backend.compiles("hot"), 1);
}

#[test]
fn backend_args_select_pipelines() {
    let mut config = JitConfig::default();
    config
        .apply_backend_args(&["-opt=mark", "-threshold=7", "-verbose"])
        .unwrap();
    assert_eq!(config.optimize_pipeline, "mark");
    assert_eq!(config.reoptimize_threshold, 7);

    let (jit, _, _) = setup(config);
    jit.add_module(constant_module("m", "value", 1)).unwrap();
    assert_eq!(jit.lookup("value").unwrap().call(&[]).unwrap(), 1 + MARK_OFFSET);
}

struct NoImports;

impl LinkResolver for NoImports {
    fn resolve(&self, name: &str) -> Result<LinkTarget, JitError> {
        Err(JitError::SymbolNotFound(name.to_string()))
    }
}

fn run(module: &Module, args: &[i64]) -> Result<i64, JitError> {
    let backend = ReferenceBackend::new();
    let object = backend.load(backend.compile(module, &backend.target())?, &NoImports)?;
    match object.address_of("f").map(|def| def.body) {
        Some(SymbolBody::Function(function)) => function.invoke(args),
        _ => panic!("`f` was not loaded"),
    }
}

/// Builds a stack-valid straight-line body from arbitrary choices.
fn straight_line(choices: &[(u8, i64)]) -> Vec<Inst> {
    let mut body = Vec::new();
    let mut depth = 0_usize;
    for (kind, value) in choices {
        let binary = [Inst::Add, Inst::Sub, Inst::Mul, Inst::Div, Inst::Rem, Inst::Lt, Inst::Eq];
        match kind % 10 {
            0..=6 if depth >= 2 => {
                body.push(binary[usize::from(kind % 10)].clone());
                depth -= 1;
            }
            7 => {
                body.push(Inst::Arg(0));
                depth += 1;
            }
            8 if depth >= 1 => {
                body.push(Inst::Dup);
                body.push(Inst::Pop);
            }
            _ => {
                body.push(Inst::Const(*value % 8));
                depth += 1;
            }
        }
    }
    if depth == 0 {
        body.push(Inst::Const(0));
        depth = 1;
    }
    for _ in 1..depth {
        body.push(Inst::Add);
    }
    body.push(Inst::Ret);
    body
}

proptest! {
    #[test]
    fn passes_preserve_results(
        choices in proptest::collection::vec((any::<u8>(), any::<i64>()), 0..40),
        arg in -50_i64..50,
    ) {
        let module = Module::new("m").with_function(Function::define("f", 1, straight_line(&choices)));
        let expected = run(&module, &[arg]);

        for descriptor in ["default<O1>", "default<O2>", "default<O3>", "peephole,const-fold,dce"] {
            let mut optimized = module.clone();
            ReferencePassPipeline.apply(&mut optimized, descriptor).unwrap();
            prop_assert!(optimized.instruction_count() <= module.instruction_count());
            prop_assert_eq!(run(&optimized, &[arg]), expected.clone());
        }
    }
}
