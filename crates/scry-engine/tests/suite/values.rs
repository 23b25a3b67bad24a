use scry_config::SessionConfig;
use scry_engine::{ClassRegistry, LocalValue, MarshalError, StrategyRegistry, Unpack};
use scry_jdwp::scripted::{Outcome, ScriptedVm, ScriptedVmBuilder};
use scry_jdwp::wire::{JdwpValue, ReferenceTypeId};

use crate::harness::{prepare, start, watch, Prepared};

const HOLDER: &str = "demo.Holder";

/// One stop at `Holder.show` line 12 with the given locals.
fn holder_vm(
    build: impl FnOnce(&mut ScriptedVmBuilder, ReferenceTypeId) -> Vec<(&'static str, JdwpValue)>,
) -> ScriptedVm {
    let mut b = ScriptedVm::builder();
    let holder = b.class(HOLDER);
    let show = b.method(holder, "show", "()V", &[12, 13]);
    let locals = build(&mut b, holder);
    b.step(holder, show, 12, 0, &locals).step(holder, show, 13, 0, &[]);
    b.build()
}

fn holder_classes() -> ClassRegistry {
    let classes = ClassRegistry::new();
    watch(&classes, HOLDER, &[12]);
    classes
}

fn point_class(b: &mut ScriptedVmBuilder) -> ReferenceTypeId {
    let point = b.class("demo.Point");
    b.method(point, "x", "()I", &[]);
    b.method(point, "y", "()I", &[]);
    point
}

#[tokio::test]
async fn snapshot_holds_primitives_strings_and_nested_arrays() {
    let vm = holder_vm(|b, holder| {
        let this = b.object(holder);
        let name = b.string("gen");
        let empty = b.array("I", Vec::new());
        let mixed = b.array(
            "Ljava/lang/Object;",
            vec![JdwpValue::Boolean(true), JdwpValue::Char(u16::from(b'x')), empty],
        );
        vec![
            ("this", this),
            ("count", JdwpValue::Int(3)),
            ("total", JdwpValue::Long(-4)),
            ("name", name),
            ("mixed", mixed),
            ("missing", JdwpValue::null()),
        ]
    });
    let mut running = start(vm, holder_classes());

    let (_, snapshot) = running.next_suspension().await;
    assert!(!snapshot.contains_key("this"));
    assert_eq!(snapshot["count"], LocalValue::Int(3));
    assert_eq!(snapshot["total"], LocalValue::Long(-4));
    assert_eq!(snapshot["name"], LocalValue::String("gen".into()));
    assert_eq!(snapshot["missing"], LocalValue::Null);
    assert_eq!(
        snapshot["mixed"],
        LocalValue::Array(vec![
            LocalValue::Boolean(true),
            LocalValue::Char('x'),
            LocalValue::Array(Vec::new()),
        ])
    );
    assert_eq!(snapshot["mixed"].to_string(), "[true, 'x', []]");

    running.handle.resume();
    running.expect_termination().await;
}

#[tokio::test]
async fn strategies_apply_to_subclasses_and_everything_else_uses_to_string() {
    let vm = holder_vm(|b, _| {
        let point = point_class(b);
        let point3 = b.subclass("demo.Point3", point);
        let widget = b.class("demo.Widget");

        let origin = b.object(point);
        b.on_invoke(origin, "x", Outcome::Return(JdwpValue::Int(1)));
        b.on_invoke(origin, "y", Outcome::Return(JdwpValue::Int(2)));
        let corner = b.object(point3);
        b.on_invoke(corner, "x", Outcome::Return(JdwpValue::Int(7)));
        b.on_invoke(corner, "y", Outcome::Return(JdwpValue::Int(8)));
        let widget = b.object(widget);
        vec![("origin", origin), ("corner", corner), ("widget", widget)]
    });

    let mut strategies = StrategyRegistry::new();
    strategies.register("demo.Point", Unpack::Accessors(vec!["x".into(), "y".into()]));
    let Prepared {
        vm,
        session,
        events,
    } = prepare(vm, holder_classes(), SessionConfig::default());
    let mut running = Prepared {
        vm,
        session: session.with_strategies(strategies),
        events,
    }
    .spawn();

    let (_, snapshot) = running.next_suspension().await;
    assert_eq!(snapshot["origin"].to_string(), "(1, 2)");
    assert_eq!(snapshot["corner"].to_string(), "(7, 8)");
    match &snapshot["widget"] {
        LocalValue::String(text) => assert!(text.starts_with("Widget@"), "{text}"),
        other => panic!("expected toString() text, got {other:?}"),
    }
    assert_eq!(
        running.vm.invocations(),
        [
            "demo.Point.x",
            "demo.Point.y",
            "demo.Point3.x",
            "demo.Point3.y",
            "demo.Widget.toString"
        ]
    );

    running.handle.resume();
    running.expect_termination().await;
}

#[tokio::test]
async fn boxed_primitives_unwrap_to_their_primitive_kind() {
    let vm = holder_vm(|b, _| {
        let integer = b.class("java.lang.Integer");
        b.method(integer, "intValue", "()I", &[]);
        let character = b.class("java.lang.Character");
        b.method(character, "charValue", "()C", &[]);

        let count = b.object(integer);
        b.on_invoke(count, "intValue", Outcome::Return(JdwpValue::Int(42)));
        let initial = b.object(character);
        b.on_invoke(initial, "charValue", Outcome::Return(JdwpValue::Char(u16::from(b'q'))));
        vec![("count", count), ("initial", initial)]
    });
    let mut running = start(vm, holder_classes());

    let (_, snapshot) = running.next_suspension().await;
    assert_eq!(snapshot["count"], LocalValue::Int(42));
    assert_eq!(snapshot["initial"], LocalValue::Char('q'));
    assert!(!running
        .vm
        .invocations()
        .iter()
        .any(|call| call.ends_with(".toString")));

    running.handle.resume();
    running.expect_termination().await;
}

#[tokio::test]
async fn a_throwing_to_string_only_spoils_its_own_value() {
    let vm = holder_vm(|b, _| {
        let broken = b.class("demo.Broken");
        let failure = b.class("demo.BrokenState");
        let object = b.object(broken);
        let thrown = b.object(failure);
        b.on_invoke(object, "toString", Outcome::Throw(thrown));
        vec![("broken", object), ("fine", JdwpValue::Boolean(false))]
    });
    let mut running = start(vm, holder_classes());

    let (_, snapshot) = running.next_suspension().await;
    assert_eq!(
        snapshot["broken"],
        LocalValue::Unavailable(MarshalError::RemoteInvocation {
            method: "toString".into(),
            message: "threw demo.BrokenState".into(),
        })
    );
    assert_eq!(snapshot["fine"], LocalValue::Boolean(false));

    running.handle.resume();
    running.expect_termination().await;
}

#[tokio::test]
async fn nesting_beyond_the_depth_limit_is_unavailable() {
    let vm = holder_vm(|b, _| {
        let inner = b.array("I", vec![JdwpValue::Int(1)]);
        let outer = b.array("[I", vec![inner]);
        vec![("grid", outer)]
    });
    let config = SessionConfig {
        max_marshal_depth: 1,
        ..SessionConfig::default()
    };
    let mut running = prepare(vm, holder_classes(), config).spawn();

    let (_, snapshot) = running.next_suspension().await;
    assert_eq!(
        snapshot["grid"],
        LocalValue::Array(vec![LocalValue::Unavailable(MarshalError::DepthLimit)])
    );

    running.handle.resume();
    running.expect_termination().await;
}

#[tokio::test]
async fn events_raised_inside_a_remote_call_do_not_suspend_the_session() {
    let vm = holder_vm(|b, _| {
        let chatty = b.class("demo.Chatty");
        let object = b.object(chatty);
        b.reenter_on_invoke(object, "toString");
        vec![("chatty", object)]
    });
    let mut running = start(vm, holder_classes());

    let (suspension, snapshot) = running.next_suspension().await;
    assert_eq!(suspension.location.to_string(), "demo.Holder:12");
    match &snapshot["chatty"] {
        LocalValue::String(text) => assert!(text.starts_with("Chatty@"), "{text}"),
        other => panic!("expected toString() text, got {other:?}"),
    }
    assert_eq!(running.vm.invocations(), ["demo.Chatty.toString"]);
    let resumes_during_snapshot = running.vm.resume_count();

    running.handle.resume();
    let (stdout, stderr) = running.expect_termination().await;
    assert!(stdout.is_empty() && stderr.is_empty());
    assert!(running.vm.resume_count() > resumes_during_snapshot);
}

#[tokio::test]
async fn pins_are_released_once_the_target_resumes() {
    let vm = holder_vm(|b, _| {
        let name = b.string("pinned");
        let list = b.array("Ljava/lang/String;", vec![name]);
        vec![("name", name), ("list", list)]
    });
    let mut running = start(vm, holder_classes());

    running.next_suspension().await;
    assert_eq!(running.vm.pinned_objects().len(), 2);

    running.handle.resume();
    running.next_resume_completed().await;
    assert!(running.vm.pinned_objects().is_empty());
    running.expect_termination().await;
}
