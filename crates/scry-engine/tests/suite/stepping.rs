use scry_config::SessionConfig;
use scry_engine::{ClassRegistry, SuspendReason};
use scry_jdwp::scripted::ScriptedVm;
use scry_jdwp::wire::{EVENT_KIND_SINGLE_STEP, STEP_DEPTH_INTO, STEP_DEPTH_OVER};

use crate::harness::{prepare, start, suspensions, watch, Running};

const STEPS: &str = "demo.Steps";

/// `main` calls `helper` from line 5; `helper` spans lines 30 and 31.
fn call_vm() -> ScriptedVm {
    let mut b = ScriptedVm::builder();
    let class = b.class(STEPS);
    let main = b.method(class, "main", "([Ljava/lang/String;)V", &[5, 6, 7]);
    let helper = b.method(class, "helper", "()V", &[30, 31]);
    b.step(class, main, 5, 0, &[])
        .step(class, helper, 30, 1, &[])
        .step(class, helper, 31, 1, &[])
        .step(class, main, 6, 0, &[])
        .step(class, main, 7, 0, &[]);
    b.build()
}

fn start_steps(vm: ScriptedVm, lines: &[u32]) -> Running {
    let classes = ClassRegistry::new();
    watch(&classes, STEPS, lines);
    start(vm, classes)
}

async fn expect_stop(running: &mut Running, location: &str, reason: SuspendReason) {
    let (suspension, _) = running.next_suspension().await;
    assert_eq!(suspension.location.to_string(), location);
    assert_eq!(suspension.reason, reason);
}

#[tokio::test]
async fn step_over_skips_the_callee() {
    let mut running = start_steps(call_vm(), &[5]);
    expect_stop(&mut running, "demo.Steps:5", SuspendReason::Breakpoint).await;

    running.handle.step_over();
    expect_stop(&mut running, "demo.Steps:6", SuspendReason::Step).await;
    assert_eq!(running.vm.step_depths(), [STEP_DEPTH_OVER]);

    running.handle.resume();
    running.expect_termination().await;
    assert_eq!(running.vm.request_count(EVENT_KIND_SINGLE_STEP), 0);
}

#[tokio::test]
async fn step_into_enters_the_callee() {
    let mut running = start_steps(call_vm(), &[5]);
    expect_stop(&mut running, "demo.Steps:5", SuspendReason::Breakpoint).await;

    running.handle.step_into();
    expect_stop(&mut running, "demo.Steps:30", SuspendReason::Step).await;
    running.handle.step_into();
    expect_stop(&mut running, "demo.Steps:31", SuspendReason::Step).await;
    running.handle.step_into();
    expect_stop(&mut running, "demo.Steps:6", SuspendReason::Step).await;

    running.handle.resume();
    running.expect_termination().await;
}

#[tokio::test]
async fn step_out_returns_to_the_caller() {
    let mut running = start_steps(call_vm(), &[30]);
    expect_stop(&mut running, "demo.Steps:30", SuspendReason::Breakpoint).await;

    running.handle.step_out();
    expect_stop(&mut running, "demo.Steps:6", SuspendReason::Step).await;

    running.handle.resume();
    running.expect_termination().await;
}

#[tokio::test]
async fn only_one_step_request_is_ever_installed() {
    let mut running = start_steps(call_vm(), &[5]);
    expect_stop(&mut running, "demo.Steps:5", SuspendReason::Breakpoint).await;
    assert!(running.vm.step_depths().is_empty());

    running.handle.step_into();
    expect_stop(&mut running, "demo.Steps:30", SuspendReason::Step).await;
    assert_eq!(running.vm.step_depths(), [STEP_DEPTH_INTO]);

    running.handle.step_over();
    expect_stop(&mut running, "demo.Steps:31", SuspendReason::Step).await;
    assert_eq!(running.vm.step_depths(), [STEP_DEPTH_OVER]);

    running.handle.step_over();
    expect_stop(&mut running, "demo.Steps:6", SuspendReason::Step).await;
    assert_eq!(running.vm.request_count(EVENT_KIND_SINGLE_STEP), 1);

    running.handle.resume();
    running.expect_termination().await;
}

#[tokio::test]
async fn a_later_command_replaces_an_earlier_one() {
    let mut running = start_steps(call_vm(), &[5]);
    expect_stop(&mut running, "demo.Steps:5", SuspendReason::Breakpoint).await;

    running.handle.step_into();
    running.handle.step_over();
    expect_stop(&mut running, "demo.Steps:6", SuspendReason::Step).await;

    running.handle.resume();
    running.expect_termination().await;
}

#[tokio::test]
async fn a_breakpoint_hit_while_stepping_ends_the_step() {
    let mut running = start_steps(call_vm(), &[5, 31]);
    expect_stop(&mut running, "demo.Steps:5", SuspendReason::Breakpoint).await;

    // Stepping out of main runs to the end, unless something stops it first.
    running.handle.step_out();
    expect_stop(&mut running, "demo.Steps:31", SuspendReason::Breakpoint).await;
    assert!(running.vm.step_depths().is_empty());

    running.handle.resume();
    running.expect_termination().await;
}

#[tokio::test]
async fn a_breakpoint_added_mid_step_wins_over_the_step_at_the_same_line() {
    let mut running = start_steps(call_vm(), &[5]);
    expect_stop(&mut running, "demo.Steps:5", SuspendReason::Breakpoint).await;
    running.handle.step_over();
    expect_stop(&mut running, "demo.Steps:6", SuspendReason::Step).await;

    // The breakpoint's request is newer than the step's, so the VM lists the
    // step event first in the set that lands on line 7.
    let added = running
        .handle
        .toggle_breakpoint(STEPS, 7)
        .await
        .expect("class is loaded");
    assert!(added.installed);
    running.handle.step_over();

    expect_stop(&mut running, "demo.Steps:7", SuspendReason::Breakpoint).await;
    assert!(running.vm.step_depths().is_empty());

    running.handle.resume();
    let events = running.run_to_end().await;
    assert!(suspensions(&events).is_empty());
}

/// `fact` recurses on a single line; stepping into it lands on the same
/// source line at every depth.
#[tokio::test]
async fn step_into_recursion_does_not_stop_twice_on_one_line() {
    let mut b = ScriptedVm::builder();
    let class = b.class("demo.Recur");
    let main = b.method(class, "main", "([Ljava/lang/String;)V", &[5, 6]);
    let fact = b.method(class, "fact", "(I)I", &[20]);
    b.step(class, main, 5, 0, &[])
        .step(class, fact, 20, 1, &[])
        .step(class, fact, 20, 2, &[])
        .step(class, fact, 20, 3, &[])
        .step(class, main, 6, 0, &[]);
    let classes = ClassRegistry::new();
    watch(&classes, "demo.Recur", &[5]);
    let mut running = start(b.build(), classes);

    expect_stop(&mut running, "demo.Recur:5", SuspendReason::Breakpoint).await;
    running.handle.step_into();
    expect_stop(&mut running, "demo.Recur:20", SuspendReason::Step).await;
    running.handle.step_into();
    expect_stop(&mut running, "demo.Recur:6", SuspendReason::Step).await;

    running.handle.resume();
    let events = running.run_to_end().await;
    assert!(suspensions(&events).is_empty());
}

#[tokio::test]
async fn step_over_may_stop_on_the_same_line_again() {
    // A loop body on one line: stepping over revisits it.
    let mut b = ScriptedVm::builder();
    let class = b.class("demo.Loop");
    let main = b.method(class, "main", "([Ljava/lang/String;)V", &[3, 4]);
    b.step(class, main, 3, 0, &[])
        .step(class, main, 3, 0, &[])
        .step(class, main, 4, 0, &[]);
    let classes = ClassRegistry::new();
    watch(&classes, "demo.Loop", &[]);
    let prepared = prepare(b.build(), classes, SessionConfig::default());

    // Nothing is declared up front; a breakpoint added before the class
    // loads stays pending until it does.
    let added = prepared
        .session
        .handle()
        .set_breakpoint("demo.Loop", 3, None)
        .await
        .expect("class is watched");
    assert!(!added.installed);

    let mut running = prepared.spawn();
    expect_stop(&mut running, "demo.Loop:3", SuspendReason::Breakpoint).await;
    assert!(running.handle.remove_breakpoint("demo.Loop", 3).await);

    running.handle.step_over();
    expect_stop(&mut running, "demo.Loop:3", SuspendReason::Step).await;

    running.handle.resume();
    running.expect_termination().await;
}
