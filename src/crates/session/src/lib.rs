//! Drive interactive Spectre sessions over a pseudo-terminal and fan the same
//! operations out across many sessions.
//!
//! Typical usage:
//! ```no_run
//! use std::sync::Arc;
//! use spectre_session::{EngineConfig, JsonPlotReader, Session, SessionPool, SessionSpec};
//!
//! let config = Arc::new(EngineConfig::default().with_overrides_from("config.yaml"));
//! let reader = Arc::new(JsonPlotReader);
//!
//! let spec = SessionSpec::new("amp.scs").with_include("/opt/pdk/models/spectre");
//! let mut session = Session::start_new(spec, config.clone(), reader.clone()).unwrap();
//! session.set_parameter("W", 1.5e-6).unwrap();
//! let results = session.run_all().unwrap();
//! println!("analyses: {:?}", results.keys().collect::<Vec<_>>());
//! session.stop(false).unwrap();
//!
//! let pool = SessionPool::new(config, reader);
//! let mut sessions: Vec<Session> = pool
//!     .start_n_sessions("amp.scs", 4, &[])
//!     .unwrap()
//!     .into_iter()
//!     .filter_map(Result::ok)
//!     .collect();
//! let results = pool.run_all(&mut sessions).unwrap();
//! assert_eq!(results.len(), sessions.len());
//! pool.stop(&mut sessions, true).unwrap();
//! ```

mod address;
mod channel;
mod config;
mod error;
mod log_sink;
mod pool;
mod reader;
mod session;
pub mod sexpr;
mod supervisor;

pub use address::{
    command, AttributeValue, ChildKind, OwnerKind, ParameterAddress, DEFAULT_ATTRIBUTE,
};
pub use channel::{ChannelState, CommandChannel, CommandResult, Expect, ExpectError, Verdict};
pub use config::{
    ApsPreset, EngineConfig, EngineMode, Invocation, LogMode, ProtocolPatterns, SessionSpec,
    XPreset, DEFAULT_FAILURE, DEFAULT_PROMPT, DEFAULT_SUCCESS,
};
pub use error::{SessionError, SessionResult};
pub use log_sink::LogSink;
pub use pool::SessionPool;
pub use reader::{
    check_readable, JsonPlotReader, PlotRecord, ReadBatch, ResultReader, ResultSet, ResultTable,
    OFFSET_KEY,
};
pub use session::{LifecycleState, Session};
pub use supervisor::{
    build_arguments, expand_user, log_path_for, netlist_to_tmp, raw_tmp, EngineProcess,
    ProcessSupervisor,
};
