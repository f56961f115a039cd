#![cfg(feature = "test-support")]

#[path = "session_support.rs"]
mod support;

use spectre_session::{OwnerKind, ParameterAddress};
use support::{config, start, Bench};

fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
    items
        .iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

#[test]
fn lists_netlist_structure() {
    let bench = Bench::new();
    let mut session = start(bench.spec("structure.raw"), config());

    assert_eq!(
        session.list_analyses().expect("analyses"),
        pairs(&[("tran1", "tran"), ("ac1", "ac")])
    );
    assert_eq!(
        session.list_instances().expect("instances"),
        vec!["V0", "M0", "R0"]
    );
    assert_eq!(
        session.list_nets().expect("nets"),
        vec!["vdd", "0", "out", "in"]
    );
    assert_eq!(
        session.list_parameters(&OwnerKind::Circuit).expect("circuit parameters"),
        vec!["L", "W", "vdd"]
    );
    assert_eq!(
        session
            .list_parameters(&OwnerKind::instance("M0"))
            .expect("instance parameters"),
        vec!["l", "w"]
    );
    assert_eq!(
        session
            .list_attributes(&OwnerKind::Circuit, "W")
            .expect("attributes"),
        pairs(&[("value", "1e-6")])
    );

    session.stop(true).expect("stop");
}

#[test]
fn instance_and_analysis_attributes_round_trip() {
    let bench = Bench::new();
    let mut session = start(bench.spec("attributes.raw"), config());

    let width = ParameterAddress::new(OwnerKind::instance("M0"), "w");
    assert_eq!(session.get_attribute(&width).expect("get w"), "1e-6");
    assert!(session.set_attribute(&width, 2e-6).expect("set w"));
    assert_eq!(session.get_attribute(&width).expect("get w"), "2e-6");

    let stop = ParameterAddress::new(OwnerKind::analysis("tran1"), "stop").with_attribute("value");
    assert!(session.set_attribute(&stop, "2u").expect("set stop"));
    assert_eq!(session.get_attribute(&stop).expect("get stop"), "2u");

    let ghost = ParameterAddress::new(OwnerKind::instance("M9"), "w");
    assert!(!session.set_attribute(&ghost, 1.0).expect("reply expected"));
    assert!(session.get_attribute(&ghost).is_err());

    session.stop(true).expect("stop");
}

#[test]
fn created_analyses_become_runnable() {
    let bench = Bench::new();
    let mut session = start(bench.spec("created.raw"), config());

    assert!(session.create_analysis("tran", "tran2").expect("create"));
    assert!(!session.create_analysis("tran", "tran2").expect("duplicate"));
    assert!(session
        .list_analyses()
        .expect("analyses")
        .contains(&("tran2".to_string(), "tran".to_string())));

    // A fresh analysis has no parameters; the engine answers nil.
    assert!(session
        .list_parameters(&OwnerKind::analysis("tran2"))
        .expect("empty listing")
        .is_empty());

    let results = session.run_analysis("tran2").expect("run tran2");
    assert_eq!(results.keys().collect::<Vec<_>>(), vec!["tran2"]);

    session.stop(true).expect("stop");
}

#[test]
fn setter_error_text_is_not_success() {
    let bench = Bench::new();
    let mut session = start(bench.spec("bogus.raw"), config());

    let bogus = ParameterAddress::circuit("W").with_attribute("bogus");
    assert!(!session.set_attribute(&bogus, 1.0).expect("reply expected"));
    assert_eq!(session.get_parameter("W").expect("get W"), 1e-6);

    session.stop(true).expect("stop");
}

#[test]
fn getter_ignores_diagnostics_before_the_value() {
    let bench = Bench::new();
    let mut session = start(
        bench.spec("chatty.raw"),
        config().with_env("FAKE_ENGINE_CHATTY", "1"),
    );

    assert_eq!(session.get_parameter("W").expect("get W"), 1e-6);
    let width = ParameterAddress::new(OwnerKind::instance("M0"), "w");
    assert_eq!(session.get_attribute(&width).expect("get w"), "1e-6");

    session.stop(true).expect("stop");
}
