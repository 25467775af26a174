//! Lazy materialization: laziness, exactly-once compilation, failure
//! sharing and symbol resolution fallbacks.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use lazyjit_core::{
    CapturedModule, ExecutorAddr, ExecutorSymbolDef, Jit, JitConfig, JitError, ModuleProvider,
    NativeBackend, PassPipeline, SymbolBody, SymbolFlags,
};
use lazyjit_ir::{Global, Inst, Module};

use crate::tests::test_helpers::*;

#[test]
fn nothing_compiles_before_first_use() {
    let (jit, backend, _) = setup(JitConfig::default());
    jit.add_module(constant_module("one", "one_fn", 1)).unwrap();
    jit.add_module(constant_module("two", "two_fn", 2)).unwrap();
    assert_eq!(backend.total_compiles(), 0);
    assert!(jit.session().is_defined("one_fn"));

    assert_eq!(jit.lookup("two_fn").unwrap().call(&[]).unwrap(), 2);
    assert_eq!(backend.compiles("one"), 0);
    assert_eq!(backend.compiles("two"), 1);
    assert_eq!(jit.metrics().materializations, 1);
}

#[test]
fn concurrent_lookups_materialize_once() {
    let backend = Arc::new(CountingBackend::new().with_delay(Duration::from_millis(100)));
    let pipeline = Arc::new(MarkingPipeline::new());
    let jit = build_jit(&backend, &pipeline, JitConfig::default());
    jit.add_module(constant_module("shared", "value", 9)).unwrap();

    let threads = 8;
    let barrier = Barrier::new(threads);
    let addresses: Vec<ExecutorAddr> = thread::scope(|scope| {
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    jit.lookup_entry_address("value").unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(addresses.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(backend.compiles("shared"), 1);
    assert_eq!(jit.metrics().materializations, 1);
}

#[test]
fn failed_materialization_is_shared_and_not_retried() {
    let backend = Arc::new(CountingBackend::new().failing_when(|module, _| module == "broken"));
    let pipeline = Arc::new(MarkingPipeline::new());
    let jit = build_jit(&backend, &pipeline, JitConfig::default());
    jit.add_module(constant_module("broken", "broken_fn", 1)).unwrap();

    let first = jit.lookup("broken_fn").unwrap_err();
    assert_eq!(first, JitError::compilation_failed("broken", "injected failure"));
    assert_eq!(jit.lookup("broken_fn").unwrap_err(), first);
    assert_eq!(backend.compiles("broken"), 1);
    assert_eq!(jit.metrics().materialization_failures, 1);
    assert!(jit.session().is_defined("broken_fn"));
}

#[test]
fn concurrent_callers_share_one_failure() {
    let backend = Arc::new(
        CountingBackend::new()
            .with_delay(Duration::from_millis(100))
            .failing_when(|module, _| module == "broken"),
    );
    let pipeline = Arc::new(MarkingPipeline::new());
    let jit = build_jit(&backend, &pipeline, JitConfig::default());
    jit.add_module(constant_module("broken", "broken_fn", 1)).unwrap();

    let threads = 8;
    let barrier = Barrier::new(threads);
    let errors: Vec<JitError> = thread::scope(|scope| {
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    jit.lookup("broken_fn").unwrap_err()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let expected = JitError::compilation_failed("broken", "injected failure");
    assert!(errors.iter().all(|err| *err == expected));
    assert_eq!(backend.compiles("broken"), 1);
    assert_eq!(jit.metrics().materialization_failures, 1);
}

#[test]
fn linking_binds_stubs_without_compiling_callees() {
    let (jit, backend, _) = setup(JitConfig::default());
    jit.add_module(constant_module("callee", "callee_fn", 11)).unwrap();
    jit.add_module(Module::new("caller").with_function(forwarding_function("main", "callee_fn")))
        .unwrap();

    let main = jit.lookup("main").unwrap();
    assert_eq!(backend.compiles("caller"), 1);
    assert_eq!(backend.compiles("callee"), 0);

    assert_eq!(main.call(&[]).unwrap(), 11);
    assert_eq!(backend.compiles("callee"), 1);
}

#[test]
fn process_symbols_are_the_fallback() {
    let (jit, backend, _) = setup(JitConfig::default());
    let abs = jit.lookup("abs").unwrap();
    assert_eq!(abs.call(&[-3]).unwrap(), 3);
    assert!(jit.session().is_defined("abs"));
    assert_eq!(backend.total_compiles(), 0);
    assert_eq!(jit.metrics().module_requests, 0);
    // Process symbols are absolute: same address on every lookup.
    assert_eq!(jit.lookup("abs").unwrap().address(), abs.address());
}

#[test]
fn duplicate_definitions_leave_the_namespace_untouched() {
    let (jit, _, _) = setup(JitConfig::default());
    jit.add_module(constant_module("first", "shared_name", 1)).unwrap();

    let second = Module::new("second")
        .with_function(constant_function("fresh", 2))
        .with_function(constant_function("shared_name", 3));
    assert_eq!(
        jit.add_module(second).unwrap_err(),
        JitError::DuplicateSymbol("shared_name".to_string())
    );
    assert!(!jit.session().is_defined("fresh"));
    assert_eq!(jit.lookup("shared_name").unwrap().call(&[]).unwrap(), 1);
}

#[test]
fn data_symbols_resolve_to_values() {
    let (jit, _, _) = setup(JitConfig::default());
    let module = Module::new("data")
        .with_global(Global {
            name: "answer".to_string(),
            linkage: Default::default(),
            value: 42,
        })
        .with_function(lazyjit_ir::Function::define(
            "read",
            0,
            vec![
                Inst::Global("answer".to_string()),
                Inst::Global("external".to_string()),
                Inst::Add,
                Inst::Ret,
            ],
        ));
    jit.define(
        "external",
        ExecutorSymbolDef {
            addr: ExecutorAddr::new(0x9000),
            flags: SymbolFlags::EXPORTED_DATA,
            body: SymbolBody::Data(8),
        },
    )
    .unwrap();
    jit.add_module(module).unwrap();

    let answer = jit.lookup("answer").unwrap();
    assert_eq!(answer.value(), Some(42));
    assert_eq!(answer.flags(), SymbolFlags::EXPORTED_DATA);
    assert!(matches!(answer.call(&[]), Err(JitError::Trap { .. })));
    assert_eq!(jit.lookup("read").unwrap().call(&[]).unwrap(), 50);

    assert_eq!(
        jit.define(
            "external",
            ExecutorSymbolDef {
                addr: ExecutorAddr::new(0x9008),
                flags: SymbolFlags::EXPORTED_DATA,
                body: SymbolBody::Data(1),
            },
        )
        .unwrap_err(),
        JitError::DuplicateSymbol("external".to_string())
    );
}

/// Front end that produces `answer_fn` on demand.
struct OnDemand;

impl ModuleProvider for OnDemand {
    fn request_module(&self, name: &str) -> Result<CapturedModule, JitError> {
        match name {
            "answer_fn" => Ok(CapturedModule::new(constant_module("generated", "answer_fn", 42))),
            _ => Err(JitError::NothingToLoad {
                name: name.to_string(),
                reason: "unknown".to_string(),
            }),
        }
    }
}

#[test]
fn front_end_supplies_modules_on_demand() {
    let backend = Arc::new(CountingBackend::new());
    let jit = Jit::builder(
        Arc::clone(&backend) as Arc<dyn NativeBackend>,
        Arc::new(MarkingPipeline::new()) as Arc<dyn PassPipeline>,
    )
    .module_provider(Arc::new(OnDemand))
    .build()
    .unwrap();
    jit.add_module(Module::new("main").with_function(forwarding_function("main", "answer_fn")))
        .unwrap();

    assert_eq!(jit.lookup("main").unwrap().call(&[]).unwrap(), 42);
    assert_eq!(jit.metrics().module_requests, 1);
    assert_eq!(jit.metrics().modules_added, 2);

    jit.reset_metrics();
    assert_eq!(jit.lookup("answer_fn").unwrap().call(&[]).unwrap(), 42);
    assert_eq!(jit.metrics().module_requests, 0);
    assert_eq!(backend.compiles("generated"), 1);
}

#[test]
fn unresolved_reference_fails_materialization() {
    let (jit, _, _) = setup(JitConfig::default());
    jit.add_module(Module::new("dangling").with_function(forwarding_function("main", "nowhere")))
        .unwrap();
    assert_eq!(
        jit.lookup("main").unwrap_err(),
        JitError::SymbolNotFound("nowhere".to_string())
    );
    assert_eq!(jit.metrics().materialization_failures, 1);
}
