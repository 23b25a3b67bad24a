use scry_config::SessionConfig;
use scry_engine::{
    CapturedOutput, ClassRegistry, LocalValue, SessionEvent, SessionState, TerminationReason,
};
use scry_jdwp::scripted::ScriptedVm;
use scry_jdwp::wire::{EVENT_KIND_CLASS_PREPARE, EVENT_KIND_EXCEPTION};

use crate::harness::{prepare, start, suspensions, watch, Prepared, Running, EVENT_TIMEOUT};

const MAIN: &str = "demo.Main";

fn two_line_vm() -> ScriptedVm {
    let mut b = ScriptedVm::builder();
    let class = b.class(MAIN);
    let main = b.method(class, "main", "([Ljava/lang/String;)V", &[3, 4]);
    b.step(class, main, 3, 0, &[]).step(class, main, 4, 0, &[]);
    b.build()
}

fn main_classes(lines: &[u32]) -> ClassRegistry {
    let classes = ClassRegistry::new();
    watch(&classes, MAIN, lines);
    classes
}

/// `Thrower.run` throws a caught exception on line 8 and an uncaught one on
/// line 9.
fn throwing_vm() -> ScriptedVm {
    let mut b = ScriptedVm::builder();
    let class = b.class("demo.Thrower");
    let run = b.method(class, "run", "()V", &[7, 8, 9]);
    let bad_input = b.class("demo.BadInput");
    let first = b.object(bad_input);
    let second = b.object(bad_input);
    b.step(class, run, 7, 0, &[])
        .step_throwing(class, run, 8, 0, first, true)
        .step_throwing(class, run, 9, 0, second, false);
    b.build()
}

fn exception_reports(events: &[SessionEvent]) -> Vec<(String, bool)> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::Exception(report) => Some((
                report
                    .location
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default(),
                report.caught,
            )),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn the_target_running_to_completion_terminates_once() {
    let mut running = start(two_line_vm(), main_classes(&[]));

    let events = running.run_to_end().await;
    assert!(suspensions(&events).is_empty());
    assert!(matches!(events.last(), Some(SessionEvent::Terminated { .. })));
    assert_eq!(running.finish().await, TerminationReason::Disconnected);
}

#[tokio::test]
async fn disconnect_while_suspended_terminates_exactly_once() {
    let mut running = start(two_line_vm(), main_classes(&[3]));
    running.next_suspension().await;
    assert!(running.handle.suspended_thread().is_some());

    running.vm.disconnect();

    running.expect_termination().await;
    let Running {
        handle,
        mut events,
        task,
        ..
    } = running;
    let reason = tokio::time::timeout(EVENT_TIMEOUT, task)
        .await
        .expect("timed out waiting for the session task")
        .expect("session task panicked");
    assert_eq!(reason, TerminationReason::Disconnected);

    // The observer is gone with the session; nothing follows the termination.
    let rest = tokio::time::timeout(EVENT_TIMEOUT, events.recv())
        .await
        .expect("event channel should close");
    assert!(rest.is_none(), "unexpected event after termination: {rest:?}");
    assert_eq!(handle.state(), SessionState::Terminated);
    assert_eq!(handle.suspended_thread(), None);
}

#[tokio::test]
async fn resuming_after_termination_is_harmless() {
    let mut running = start(two_line_vm(), main_classes(&[3]));
    running.next_suspension().await;
    running.vm.disconnect();
    running.expect_termination().await;

    running.handle.resume();
    running.handle.step_over();
    assert_eq!(running.finish().await, TerminationReason::Disconnected);
}

#[tokio::test]
async fn shutdown_while_suspended_stops_the_target() {
    let mut running = start(two_line_vm(), main_classes(&[3]));
    running.next_suspension().await;

    running.handle.shutdown();
    running.expect_termination().await;
    assert_eq!(running.vm.exit_code(), Some(1));
    assert_eq!(running.finish().await, TerminationReason::Cancelled);
}

#[tokio::test]
async fn shutdown_can_leave_the_target_running() {
    let config = SessionConfig {
        exit_target_on_cancel: false,
        ..SessionConfig::default()
    };
    let mut running = prepare(two_line_vm(), main_classes(&[3]), config).spawn();
    running.next_suspension().await;

    running.handle.shutdown();
    running.expect_termination().await;
    assert_eq!(running.vm.exit_code(), None);
    assert_eq!(running.finish().await, TerminationReason::Cancelled);
}

#[tokio::test]
async fn captured_output_is_reported_on_termination() {
    let Prepared {
        vm,
        session,
        events,
    } = prepare(two_line_vm(), main_classes(&[]), SessionConfig::default());
    let mut running = Prepared {
        vm,
        session: session.with_output(CapturedOutput::fixed("hello\n", "warning\n")),
        events,
    }
    .spawn();

    let (stdout, stderr) = running.expect_termination().await;
    assert_eq!(stdout, "hello\n");
    assert_eq!(stderr, "warning\n");
}

#[tokio::test]
async fn exceptions_are_reported_without_suspending() {
    let classes = ClassRegistry::new();
    watch(&classes, "demo.Thrower", &[]);
    let mut running = start(throwing_vm(), classes);

    let events = running.run_to_end().await;
    assert!(suspensions(&events).is_empty());
    assert_eq!(
        exception_reports(&events),
        [
            ("demo.Thrower:8".to_string(), true),
            ("demo.Thrower:9".to_string(), false)
        ]
    );
    let values: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::Exception(report) => Some(&report.value),
            _ => None,
        })
        .collect();
    assert!(values
        .iter()
        .all(|value| matches!(value, LocalValue::String(text) if text.starts_with("BadInput@"))));
}

#[tokio::test]
async fn caught_exceptions_can_be_left_unreported() {
    let config = SessionConfig {
        report_caught_exceptions: false,
        ..SessionConfig::default()
    };
    let classes = ClassRegistry::new();
    watch(&classes, "demo.Thrower", &[]);
    let mut running = prepare(throwing_vm(), classes, config).spawn();

    let events = running.run_to_end().await;
    assert_eq!(
        exception_reports(&events),
        [("demo.Thrower:9".to_string(), false)]
    );
}

#[tokio::test]
async fn no_exception_request_when_reporting_is_off() {
    let config = SessionConfig {
        report_caught_exceptions: false,
        report_uncaught_exceptions: false,
        ..SessionConfig::default()
    };
    let classes = ClassRegistry::new();
    watch(&classes, "demo.Thrower", &[]);
    let mut running = prepare(throwing_vm(), classes, config).spawn();

    let events = running.run_to_end().await;
    assert!(exception_reports(&events).is_empty());
    assert_eq!(running.vm.request_count(EVENT_KIND_EXCEPTION), 0);
}

#[tokio::test]
async fn a_rejected_class_watch_does_not_stop_the_others() {
    let mut b = ScriptedVm::builder();
    b.class("demo.Ghost");
    let class = b.class(MAIN);
    let main = b.method(class, "main", "([Ljava/lang/String;)V", &[3, 4]);
    b.step(class, main, 3, 0, &[]).step(class, main, 4, 0, &[]);
    // Watched classes are set up in name order; this one fails first.
    b.reject_class_match("demo.Ghost");

    let classes = main_classes(&[3]);
    watch(&classes, "demo.Ghost", &[]);
    let mut running = start(b.build(), classes);

    let (suspension, _) = running.next_suspension().await;
    assert_eq!(suspension.location.to_string(), "demo.Main:3");
    assert_eq!(running.vm.request_count(EVENT_KIND_CLASS_PREPARE), 1);
    assert_eq!(running.vm.request_count(EVENT_KIND_EXCEPTION), 1);

    running.handle.resume();
    running.expect_termination().await;
}
