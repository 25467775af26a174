//! Session teardown and resource tracker removal.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use lazyjit_core::{JitConfig, JitError};

use crate::tests::test_helpers::*;

#[test]
fn end_session_releases_every_loaded_object() {
    let (jit, backend, _) = setup(JitConfig::default());
    jit.add_module(constant_module("one", "one_fn", 1)).unwrap();
    jit.add_module(constant_module("two", "two_fn", 2)).unwrap();
    jit.add_module(constant_module("never", "never_fn", 3)).unwrap();
    jit.lookup("one_fn").unwrap();
    jit.lookup("two_fn").unwrap();

    jit.end_session().unwrap();
    assert_eq!(backend.releases(), 2);
    assert!(jit.session().is_ended());
    assert_eq!(jit.session().symbol_count(), 0);
}

#[test]
fn ended_session_rejects_further_work() {
    let (jit, _, _) = setup(JitConfig::default());
    jit.add_module(constant_module("m", "value", 1)).unwrap();
    let symbol = jit.lookup("value").unwrap();
    jit.end_session().unwrap();

    assert_eq!(jit.lookup("value").unwrap_err(), JitError::SessionEnded);
    assert_eq!(
        jit.add_module(constant_module("late", "late_fn", 1))
            .unwrap_err(),
        JitError::SessionEnded
    );
    assert!(jit.create_resource_tracker().is_err());
    assert!(matches!(
        symbol.call(&[]),
        Err(JitError::ResourceTrackerDefunct(_))
    ));
    // A second teardown has nothing left to do.
    assert_eq!(jit.end_session(), Ok(()));
}

#[test]
fn release_failures_are_collected() {
    let backend = Arc::new(CountingBackend::new().failing_release());
    let pipeline = Arc::new(MarkingPipeline::new());
    let jit = build_jit(&backend, &pipeline, JitConfig::default());
    jit.add_module(constant_module("one", "one_fn", 1)).unwrap();
    jit.add_module(constant_module("two", "two_fn", 2)).unwrap();
    jit.lookup("one_fn").unwrap();
    jit.lookup("two_fn").unwrap();

    match jit.end_session() {
        Err(JitError::Teardown(errors)) => assert_eq!(errors.len(), 2),
        other => panic!("expected teardown errors, got {other:?}"),
    }
    assert_eq!(backend.releases(), 2);
}

#[test]
#[serial_test::serial]
fn end_session_waits_for_inflight_reoptimization() {
    let config = JitConfig {
        reoptimize_pipeline: "mark-slow".to_string(),
        ..marking_config(1)
    };
    let (jit, backend, pipeline) = setup(config);
    jit.add_module(constant_module("hot", "value", 1)).unwrap();
    assert_eq!(jit.lookup("value").unwrap().call(&[]).unwrap(), 1);

    for _ in 0..200 {
        if pipeline.slow_started() == 1 {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(pipeline.slow_started(), 1, "reoptimization never started");

    jit.end_session().unwrap();
    assert_eq!(jit.metrics().reoptimizations, 1);
    // The first object goes on redirect, the reoptimized one at teardown.
    assert_eq!(backend.releases(), 2);
}

#[test]
#[serial_test::serial]
fn end_session_waits_for_inflight_materialization() {
    let backend = Arc::new(CountingBackend::new().with_delay(Duration::from_millis(300)));
    let pipeline = Arc::new(MarkingPipeline::new());
    let jit = build_jit(&backend, &pipeline, JitConfig::default());
    jit.add_module(constant_module("slow", "value", 1)).unwrap();

    let ended = thread::scope(|scope| {
        let lookup = scope.spawn(|| jit.lookup("value").map(|symbol| symbol.name().to_string()));
        for _ in 0..200 {
            if backend.compiles("slow") == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(backend.compiles("slow"), 1, "materialization never started");

        let ended = jit.end_session();
        // The lookup may lose the namespace to teardown, but it must return.
        let _ = lookup.join().unwrap();
        ended
    });

    assert_eq!(ended, Ok(()));
    assert_eq!(jit.metrics().materializations, 1);
    assert_eq!(backend.releases(), 1);
}

#[test]
fn removing_a_tracker_detaches_its_symbols() {
    let (jit, backend, _) = setup(JitConfig::default());
    let tracker = jit.create_resource_tracker().unwrap();
    jit.add_module_with_tracker(constant_module("temp", "temp_fn", 5), &tracker)
        .unwrap();
    jit.add_module(constant_module("keep", "keep_fn", 6)).unwrap();

    let temp = jit.lookup("temp_fn").unwrap();
    assert_eq!(temp.call(&[]).unwrap(), 5);

    tracker.remove().unwrap();
    let defunct = JitError::ResourceTrackerDefunct(tracker.id().value());
    assert_eq!(temp.call(&[]).unwrap_err(), defunct);
    assert_eq!(
        jit.lookup("temp_fn").unwrap_err(),
        JitError::SymbolNotFound("temp_fn".to_string())
    );
    assert_eq!(
        jit.add_module_with_tracker(constant_module("again", "again_fn", 1), &tracker)
            .unwrap_err(),
        defunct
    );
    assert_eq!(tracker.remove().unwrap_err(), defunct);
    assert_eq!(backend.releases(), 1);

    // The default tracker is unaffected and the freed name can be reused.
    assert_eq!(jit.lookup("keep_fn").unwrap().call(&[]).unwrap(), 6);
    jit.add_module(constant_module("temp2", "temp_fn", 7)).unwrap();
    assert_eq!(jit.lookup("temp_fn").unwrap().call(&[]).unwrap(), 7);
}

#[test]
fn unmaterialized_units_release_nothing() {
    let (jit, backend, _) = setup(JitConfig::default());
    let tracker = jit.create_resource_tracker().unwrap();
    jit.add_module_with_tracker(constant_module("cold", "cold_fn", 1), &tracker)
        .unwrap();
    tracker.remove().unwrap();
    assert_eq!(backend.total_compiles(), 0);
    assert_eq!(backend.releases(), 0);
}

#[test]
fn trackers_do_not_cross_sessions() {
    let (first, _, _) = setup(JitConfig::default());
    let (second, _, _) = setup(JitConfig::default());
    let foreign = first.create_resource_tracker().unwrap();
    assert!(matches!(
        second.add_module_with_tracker(constant_module("m", "f", 1), &foreign),
        Err(JitError::ResourceTrackerDefunct(_))
    ));
}

#[test]
fn dropping_the_jit_ends_the_session() {
    let backend = Arc::new(CountingBackend::new());
    let pipeline = Arc::new(MarkingPipeline::new());
    {
        let jit = build_jit(&backend, &pipeline, JitConfig::default());
        jit.add_module(constant_module("m", "value", 1)).unwrap();
        jit.lookup("value").unwrap();
    }
    assert_eq!(backend.releases(), 1);
}
