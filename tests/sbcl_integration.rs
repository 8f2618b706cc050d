//! Integration tests against a real SBCL process.
//!
//! # Requirements
//!
//! `sbcl` on `PATH` (or `LISP_BRIDGE_COMMAND` pointing at a compatible
//! interpreter invocation).
//!
//! # Running
//!
//! ```bash
//! LISP_BRIDGE_TEST_SBCL=1 cargo test --test sbcl_integration -- --nocapture
//! ```
//!
//! # Behavior
//!
//! Tests return early unless `LISP_BRIDGE_TEST_SBCL` is set and the
//! interpreter can be found.

use std::process::{Command, Stdio};

use lisp_bridge::{Error, Returned, Session, SessionConfig, SessionState, Value};

/// Opt-in switch for tests that spawn an interpreter.
fn should_run_sbcl_tests() -> bool {
    std::env::var("LISP_BRIDGE_TEST_SBCL").is_ok()
}

fn interpreter_available(config: &SessionConfig) -> bool {
    let Some(program) = config.command.first() else {
        return false;
    };
    Command::new(program)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Start a session, or `None` when the test should be skipped.
fn start() -> Option<Session> {
    if !should_run_sbcl_tests() {
        eprintln!("Skipping: LISP_BRIDGE_TEST_SBCL not set");
        return None;
    }
    let config = SessionConfig::default().with_env_overrides(|key| std::env::var(key).ok());
    if !interpreter_available(&config) {
        eprintln!("Skipping: {:?} not available", config.command);
        return None;
    }
    Some(Session::start(config).expect("Failed to start Lisp session"))
}

#[test]
fn test_arithmetic_and_multiple_values() {
    let Some(mut lisp) = start() else { return };

    let sum = lisp
        .call("cl:+", &[Value::from(1), Value::from(2)])
        .expect("call failed");
    assert_eq!(sum, Returned::One(Value::Integer(3)));

    let floor = lisp
        .call("cl:floor", &[Value::from(7), Value::from(2)])
        .expect("call failed");
    assert_eq!(
        floor,
        Returned::Many(vec![Value::Integer(3), Value::Integer(1)])
    );

    let nothing = lisp.call("cl:values", &[]).expect("call failed");
    assert!(nothing.is_nothing());
}

#[test]
fn test_remote_condition_keeps_session_usable() {
    let Some(mut lisp) = start() else { return };

    let err = lisp
        .call("cl:/", &[Value::from(1), Value::from(0)])
        .unwrap_err();
    assert_eq!(err.kind_name(), Some("DIVISION-BY-ZERO"));
    assert_eq!(lisp.state(), SessionState::Ready);

    let ok = lisp.call("cl:1+", &[Value::from(41)]).expect("call failed");
    assert_eq!(ok, Returned::One(Value::Integer(42)));
}

#[test]
fn test_strings_and_lists_round_trip() {
    let Some(mut lisp) = start() else { return };

    let text = Value::from("say \"hi\" \\ bye");
    let echoed = lisp.call("cl:identity", &[text.clone()]).expect("call failed");
    assert_eq!(echoed, Returned::One(text));

    let list = Value::list([Value::from(1), Value::from(2.5f64), Value::from('x')]);
    let reversed = lisp
        .call("cl:reverse", &[list])
        .expect("call failed")
        .into_one()
        .and_then(|v| v.to_vec())
        .expect("list");
    assert_eq!(
        reversed,
        vec![Value::Char('x'), Value::Float(2.5), Value::Integer(1)]
    );
}

#[test]
fn test_non_ascii_characters_and_long_lists() {
    let Some(mut lisp) = start() else { return };

    for c in ['λ', '€', '\u{a0}', ' ', '\t'] {
        let echoed = lisp.call("cl:identity", &[Value::Char(c)]).expect("call failed");
        assert_eq!(echoed, Returned::One(Value::Char(c)));
    }

    let list = lisp
        .call("cl:make-list", &[Value::from(20_000)])
        .expect("call failed")
        .into_one()
        .and_then(|v| v.to_vec())
        .expect("list");
    assert_eq!(list.len(), 20_000);
}

#[test]
fn test_configured_namespace_is_entered_at_startup() {
    if !should_run_sbcl_tests() {
        return;
    }
    let config = SessionConfig {
        namespace: "COMMON-LISP".to_string(),
        ..SessionConfig::default().with_env_overrides(|key| std::env::var(key).ok())
    };
    if !interpreter_available(&config) {
        return;
    }
    let mut lisp = Session::start(config).expect("Failed to start Lisp session");
    assert_eq!(lisp.namespace(), "COMMON-LISP");
    assert_eq!(lisp.symbol("foo").namespace(), Some("COMMON-LISP"));
}

#[test]
fn test_namespace_follows_in_package() {
    let Some(mut lisp) = start() else { return };

    let define = lisp.symbol("cl:defpackage");
    let name = lisp.symbol(":bridge-test");
    let use_option = Value::list([
        Value::Symbol(lisp.symbol(":use")),
        Value::Symbol(lisp.symbol(":common-lisp")),
    ]);
    let form = Value::call_form(define, [Value::Symbol(name), use_option]);
    lisp.eval(&form).expect("defpackage failed");

    let in_package = Value::list([
        Value::Symbol(lisp.symbol("cl:in-package")),
        Value::from("BRIDGE-TEST"),
    ]);
    lisp.eval(&in_package).expect("in-package failed");
    assert_eq!(lisp.namespace(), "BRIDGE-TEST");
}

#[test]
fn test_printed_output_and_find_package() {
    let Some(mut lisp) = start() else { return };

    // Goes to stdout of the test process; only the return value is checked.
    let printed = lisp
        .call("cl:princ", &[Value::from("hello from lisp")])
        .expect("princ failed");
    assert_eq!(printed, Returned::One(Value::from("hello from lisp")));

    let package = lisp
        .find_package("COMMON-LISP")
        .expect("find-package failed")
        .into_one();
    let Some(Value::Package(package)) = package else {
        panic!("expected a package");
    };
    assert_eq!(package.name, "COMMON-LISP");
    assert!(package.function("car").is_some());
}

#[test]
fn test_clos_instances_get_member_functions() {
    let Some(mut lisp) = start() else { return };

    let source = "(progn (defclass bridge-point () ((x :initarg :x :reader point-x))) t)";
    let form = lisp_bridge::read_from_str(source).expect("read failed");
    lisp.eval(&form).expect("defclass failed");

    let class = Value::Symbol(lisp.symbol("bridge-point"));
    let x = Value::Symbol(lisp.symbol(":x"));
    let point = lisp
        .call("cl:make-instance", &[class, x, Value::from(5)])
        .expect("make-instance failed")
        .into_one()
        .and_then(|v| v.as_foreign().cloned())
        .expect("foreign object");
    assert!(point.is_patched());

    let value = point.call(&mut lisp, "point-x", &[]).expect("member call failed");
    assert_eq!(value, Returned::One(Value::Integer(5)));

    assert!(matches!(
        point.call(&mut lisp, "point-y", &[]),
        Err(Error::NoSuchMember { .. })
    ));
}

#[test]
fn test_close_twice() {
    let Some(mut lisp) = start() else { return };
    lisp.close();
    lisp.close();
    assert!(matches!(lisp.eval(&Value::Nil), Err(Error::Closed)));
}
