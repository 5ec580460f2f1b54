use crate::common::{launch, resume_and_wait, script, script_session, test_config};
use mdbg::debugger::variable::format::{FormatHint, NumericBase};
use mdbg::debugger::{BreakpointRequest, Error, ResumeCommand};

fn at_line(line: u64) -> BreakpointRequest {
    BreakpointRequest::Line {
        file: script("calc.mds"),
        line,
    }
}

#[test]
fn test_locals_and_expand() {
    let (mut session, _) = script_session(test_config());
    session.add_breakpoint(at_line(12), None, 0).unwrap();
    launch(&mut session, "calc.mds");

    let ids: Vec<_> = session.watch_items().into_iter().map(|i| i.id).collect();
    for id in ["local.x", "local.y", "local.p"] {
        assert!(ids.iter().any(|i| i == id), "{id} not in {ids:?}");
    }

    let y = session.find_watch_item("local.y").unwrap();
    assert_eq!(y.value, "3");
    assert_eq!(y.type_name, "int");

    let p = session.find_watch_item("local.p").unwrap();
    assert!(p.expandable);
    assert!(p.children.is_none());

    let children = session.expand("local.p").unwrap();
    let ids: Vec<_> = children.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["local.p.name", "local.p.xs"]);
    assert!(children[1].expandable);
    assert!(session
        .find_watch_item("local.p")
        .unwrap()
        .children
        .is_some());

    session.collapse("local.p").unwrap();
    assert!(session
        .find_watch_item("local.p")
        .unwrap()
        .children
        .is_none());

    assert!(matches!(
        session.expand("local.nope"),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn test_numeric_format() {
    let (mut session, _) = script_session(test_config());
    session.add_breakpoint(at_line(12), None, 0).unwrap();
    launch(&mut session, "calc.mds");

    session
        .set_format("int", Some(FormatHint::Base(NumericBase::Hex)))
        .unwrap();
    assert_eq!(session.find_watch_item("local.y").unwrap().value, "0x3");

    session.set_format("int", None).unwrap();
    assert_eq!(session.find_watch_item("local.y").unwrap().value, "3");
}

#[test]
fn test_watch_scope() {
    let (mut session, _) = script_session(test_config());
    let watch = session.add_watch("s", false).unwrap();
    assert_eq!(watch.id, "watch.1");

    session.add_breakpoint(at_line(3), None, 0).unwrap();
    session.add_breakpoint(at_line(12), None, 0).unwrap();
    launch(&mut session, "calc.mds");

    let s = session.find_watch_item("watch.1").unwrap();
    assert!(s.in_scope);
    assert_eq!(s.value, "3");

    resume_and_wait(&mut session, ResumeCommand::Continue);
    let s = session.find_watch_item("watch.1").unwrap();
    assert!(!s.in_scope);
    assert_eq!(s.expression, "s");

    session.remove_watch("watch.1").unwrap();
    assert!(session.find_watch_item("watch.1").is_none());
    assert!(session.remove_watch("watch.1").is_err());
}

#[test]
fn test_side_effects_refused() {
    let (mut session, _) = script_session(test_config());
    session.add_breakpoint(at_line(12), None, 0).unwrap();
    launch(&mut session, "calc.mds");

    let err = session.add_watch("reset(p)", false).unwrap_err();
    assert!(matches!(err, Error::SideEffectRefused { .. }));
    let err = session.evaluate("x = 2", false).unwrap_err();
    assert!(matches!(err, Error::SideEffectRefused { .. }));

    // pure builtins are fine
    let len = session.evaluate("len(p.xs)", false).unwrap();
    assert_eq!(len.value, "3");

    let forced = session.add_watch("reset(p)", true).unwrap();
    assert!(forced.id.starts_with("watch."));
}
