#![cfg(feature = "test-support")]
#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use spectre_session::{EngineConfig, JsonPlotReader, Session, SessionPool, SessionSpec};
use tempfile::TempDir;

pub const NETLIST: &str = "\
// two-stage test bench
simulator lang=spectre
parameters W=1e-6 L=1.8e-7 vdd=1.8
V0 (vdd 0) vsource dc=1.8
M0 (out in 0 0) nmos w=1e-6 l=1.8e-7
R0 (vdd out) resistor r=1000
tran1 tran stop=1e-6
ac1 ac start=1 stop=1e9
";

pub fn fake_engine_path() -> PathBuf {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_fake_engine") {
        return PathBuf::from(path);
    }

    // Fallback to the workspace target directory.
    let mut path = std::env::current_exe().expect("current exe");
    path.pop(); // deps
    path.pop(); // debug or release
    path.push("fake_engine");
    if cfg!(windows) {
        path.set_extension("exe");
    }
    path
}

/// A temp directory holding the test netlist.
pub struct Bench {
    pub dir: TempDir,
    pub netlist: PathBuf,
}

impl Bench {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let netlist = dir.path().join("bench.scs");
        fs::write(&netlist, NETLIST).expect("write netlist");
        Self { dir, netlist }
    }

    /// Spec whose raw file lives inside the bench directory.
    pub fn spec(&self, raw_name: &str) -> SessionSpec {
        SessionSpec::new(&self.netlist).with_raw_path(self.dir.path().join(raw_name))
    }
}

pub fn config() -> EngineConfig {
    EngineConfig::new(fake_engine_path().display().to_string())
        .with_startup_timeout(Duration::from_secs(10))
        .with_command_timeout(Duration::from_secs(10))
        .with_quit_timeout(Duration::from_secs(2))
}

pub fn start(spec: SessionSpec, config: EngineConfig) -> Session {
    Session::start_new(spec, Arc::new(config), Arc::new(JsonPlotReader))
        .expect("fake engine should start")
}

pub fn pool() -> SessionPool {
    SessionPool::new(Arc::new(config()), Arc::new(JsonPlotReader))
}
