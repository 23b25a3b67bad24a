use scry_config::SessionConfig;
use scry_engine::{ClassRegistry, EngineError, SessionEvent, SessionState, SuspendReason};
use scry_jdwp::scripted::ScriptedVm;
use scry_jdwp::wire::EVENT_KIND_BREAKPOINT;

use crate::harness::{prepare, start, suspensions, watch};

const TARGET: &str = "demo.GeneratorTarget";
const GENERATOR: &str = "demo.Generator";

/// `GeneratorTarget.main` calls `Generator.next` between lines 15 and 16.
fn generator_vm() -> ScriptedVm {
    let mut b = ScriptedVm::builder();
    let target = b.class(TARGET);
    let main = b.method(target, "main", "([Ljava/lang/String;)V", &[14, 15, 16, 24, 25]);
    let generator = b.class(GENERATOR);
    let next = b.method(generator, "next", "()I", &[202, 203]);
    let count = b.string("three");
    b.step(target, main, 14, 0, &[])
        .step(target, main, 15, 0, &[("label", count)])
        .step(generator, next, 202, 1, &[])
        .step(generator, next, 203, 1, &[])
        .step(target, main, 16, 0, &[("label", count)])
        .step(target, main, 24, 0, &[("label", count)])
        .step(target, main, 25, 0, &[]);
    b.build()
}

fn generator_classes(target_lines: &[u32], generator_lines: &[u32]) -> ClassRegistry {
    let classes = ClassRegistry::new();
    watch(&classes, TARGET, target_lines);
    watch(&classes, GENERATOR, generator_lines);
    classes
}

#[tokio::test]
async fn breakpoints_in_two_classes_suspend_in_execution_order() {
    let mut running = start(generator_vm(), generator_classes(&[15, 24], &[203]));

    let events = running.run_to_end().await;
    assert_eq!(
        suspensions(&events),
        [
            "demo.GeneratorTarget:15",
            "demo.Generator:203",
            "demo.GeneratorTarget:24"
        ]
    );
    let reasons: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::Suspended { suspension, .. } => Some(suspension.reason),
            _ => None,
        })
        .collect();
    assert!(reasons.iter().all(|reason| *reason == SuspendReason::Breakpoint));

    let resumes = events
        .iter()
        .filter(|event| matches!(event, SessionEvent::ResumeCompleted))
        .count();
    assert_eq!(resumes, 3, "every suspension is acknowledged once resumed: {events:?}");

    let terminations = events
        .iter()
        .filter(|event| matches!(event, SessionEvent::Terminated { .. }))
        .count();
    assert_eq!(terminations, 1);
    assert_eq!(running.handle.state(), SessionState::Terminated);
}

#[tokio::test]
async fn breakpoints_are_pending_until_their_class_loads() {
    let prepared = prepare(
        generator_vm(),
        generator_classes(&[15], &[203]),
        SessionConfig::default(),
    );
    let handle = prepared.session.handle();
    assert_eq!(handle.state(), SessionState::Idle);
    let pending = handle.breakpoints().await;
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|bp| bp.enabled && !bp.installed));

    let mut running = prepared.spawn();
    let (suspension, _) = running.next_suspension().await;
    assert_eq!(suspension.location.to_string(), "demo.GeneratorTarget:15");
    assert_eq!(running.handle.state(), SessionState::Running);

    let target = running.handle.breakpoint_registry().get(TARGET, 15).await.unwrap();
    assert!(target.installed);
    let generator = running
        .handle
        .breakpoint_registry()
        .get(GENERATOR, 203)
        .await
        .unwrap();
    assert!(!generator.installed, "Generator has not been loaded yet");
    assert_eq!(running.vm.request_count(EVENT_KIND_BREAKPOINT), 1);

    running.handle.resume();
    let (suspension, _) = running.next_suspension().await;
    assert_eq!(suspension.location.to_string(), "demo.Generator:203");
    assert_eq!(running.vm.request_count(EVENT_KIND_BREAKPOINT), 2);

    running.handle.resume();
    running.expect_termination().await;
}

#[tokio::test]
async fn toggling_a_breakpoint_off_skips_it() {
    let mut running = start(generator_vm(), generator_classes(&[15, 24], &[203]));

    let (suspension, _) = running.next_suspension().await;
    assert_eq!(suspension.location.to_string(), "demo.GeneratorTarget:15");

    let toggled = running.handle.toggle_breakpoint(TARGET, 24).await.unwrap();
    assert!(!toggled.enabled);
    assert!(!toggled.installed);
    assert!(running.handle.breakpoint_registry().classes_of_interest().await.contains(TARGET));

    running.handle.resume();
    let events = running.run_to_end().await;
    assert_eq!(suspensions(&events), ["demo.Generator:203"]);
}

#[tokio::test]
async fn toggling_an_absent_breakpoint_creates_it() {
    let mut running = start(generator_vm(), generator_classes(&[15], &[]));

    running.next_suspension().await;
    let created = running.handle.toggle_breakpoint(TARGET, 24).await.unwrap();
    assert!(created.enabled);
    assert!(created.installed);

    running.handle.resume();
    let events = running.run_to_end().await;
    assert_eq!(suspensions(&events), ["demo.GeneratorTarget:24"]);
}

#[tokio::test]
async fn disabling_an_absent_breakpoint_is_a_no_op() {
    let prepared = prepare(
        generator_vm(),
        generator_classes(&[15], &[]),
        SessionConfig::default(),
    );
    let handle = prepared.session.handle();
    let registry = handle.breakpoint_registry();
    let before = registry.classes_of_interest().await;

    assert!(!handle.set_breakpoint_enabled(TARGET, 99, false).await.unwrap());
    assert!(!handle.set_breakpoint_enabled(GENERATOR, 203, false).await.unwrap());

    assert_eq!(registry.classes_of_interest().await, before);
    assert!(registry.get(TARGET, 99).await.is_none());
    assert!(registry.get(GENERATOR, 203).await.is_none());
    assert!(!registry.is_enabled(TARGET, 99).await);
}

#[tokio::test]
async fn set_remove_and_get_while_suspended() {
    let mut running = start(generator_vm(), generator_classes(&[15], &[]));
    running.next_suspension().await;

    let added = running
        .handle
        .set_breakpoint(TARGET, 16, Some("after next()".into()))
        .await
        .unwrap();
    assert!(added.installed);
    assert_eq!(added.annotation.as_deref(), Some("after next()"));
    assert_eq!(running.handle.breakpoint_registry().enabled_lines(TARGET).await, [15, 16]);

    assert!(running.handle.remove_breakpoint(TARGET, 16).await);
    assert!(!running.handle.remove_breakpoint(TARGET, 16).await);
    assert!(running.handle.breakpoint_registry().get(TARGET, 16).await.is_none());
    assert_eq!(running.vm.request_count(EVENT_KIND_BREAKPOINT), 1);

    running.handle.set_breakpoint(TARGET, 25, None).await.unwrap();
    running.handle.resume();
    let events = running.run_to_end().await;
    assert_eq!(suspensions(&events), ["demo.GeneratorTarget:25"]);
}

#[tokio::test]
async fn breakpoints_on_unwatched_classes_are_rejected() {
    let running = start(generator_vm(), generator_classes(&[15], &[]));
    let err = running
        .handle
        .set_breakpoint("demo.Elsewhere", 3, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::UnknownClass(ref class) if class == "demo.Elsewhere"));
    running.handle.shutdown();
    running.finish().await;
}

#[tokio::test]
async fn lines_without_code_are_rejected_once_the_class_is_loaded() {
    let mut running = start(generator_vm(), generator_classes(&[15], &[]));
    running.next_suspension().await;

    let err = running.handle.set_breakpoint(TARGET, 17, None).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::UnresolvableLocation { ref class, line: 17 } if class == TARGET
    ));
    assert!(running.handle.breakpoint_registry().get(TARGET, 17).await.is_none());

    running.handle.resume();
    running.expect_termination().await;
}

#[tokio::test]
async fn pending_lines_without_code_are_skipped_on_load() {
    let mut running = start(generator_vm(), generator_classes(&[], &[250, 203]));

    let events = running.run_to_end().await;
    assert_eq!(suspensions(&events), ["demo.Generator:203"]);
    let skipped = running
        .handle
        .breakpoint_registry()
        .get(GENERATOR, 250)
        .await
        .unwrap();
    assert!(skipped.enabled);
    assert!(!skipped.installed);
}
