#![cfg(feature = "test-support")]

#[path = "session_support.rs"]
mod support;

use spectre_session::OFFSET_KEY;
use support::{config, start, Bench};

#[test]
fn run_all_returns_only_new_plots() {
    let bench = Bench::new();
    let mut session = start(bench.spec("incremental.raw"), config());
    assert_eq!(session.offset(), 0);

    let first = session.run_all().expect("first run");
    assert_eq!(first.keys().collect::<Vec<_>>(), vec!["ac1", "tran1"]);
    assert!(!first.contains_key(OFFSET_KEY));
    assert_eq!(first["tran1"].variables, vec!["time", "out"]);
    assert_eq!(first["ac1"].variables, vec!["freq", "out"]);
    assert_eq!(first["tran1"].len(), 3);
    let after_first = session.offset();
    assert!(after_first > 0);

    session.set_parameter("vdd", 3.3).expect("set vdd");
    let second = session.run_all().expect("second run");
    assert_eq!(second.len(), 2);
    assert_ne!(second["tran1"], first["tran1"]);
    assert!(session.offset() > after_first);

    session.stop(true).expect("stop");
}

#[test]
fn run_analysis_reads_from_start_and_keeps_offset() {
    let bench = Bench::new();
    let mut session = start(bench.spec("single.raw"), config());

    let tran = session.run_analysis("tran1").expect("run tran1");
    assert_eq!(tran.keys().collect::<Vec<_>>(), vec!["tran1"]);
    assert_eq!(session.offset(), 0);

    // run_all still starts from offset zero and so sees the earlier tran1 plot too.
    let all = session.run_all().expect("run all");
    assert_eq!(all.keys().collect::<Vec<_>>(), vec!["ac1", "tran1"]);
    let offset = session.offset();
    assert!(offset > 0);

    let ac = session.run_analysis("ac1").expect("run ac1");
    assert!(ac.contains_key("ac1") && ac.contains_key("tran1"));
    assert_eq!(session.offset(), offset);

    session.stop(true).expect("stop");
}

#[test]
fn stop_removes_raw_file_only_when_asked() {
    let bench = Bench::new();

    let mut kept = start(bench.spec("kept.raw"), config());
    kept.run_all().expect("run");
    let kept_path = kept.raw_path().to_path_buf();
    assert!(kept.stop(false).expect("stop"));
    assert!(kept_path.exists());

    let mut removed = start(bench.spec("removed.raw"), config());
    removed.run_all().expect("run");
    let removed_path = removed.raw_path().to_path_buf();
    assert!(removed.stop(true).expect("stop"));
    assert!(!removed_path.exists());
}
