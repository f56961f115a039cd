//! Concurrent execution of one operation across many sessions.
//!
//! Every pool call builds a bounded rayon pool of `min(N, available cores)`
//! workers, runs one unit of work per session, and returns only when all of
//! them are done. `result[i]` always answers `request[i]`; an error or panic in
//! one worker only fills that worker's slot.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::config::{EngineConfig, SessionSpec};
use crate::error::{SessionError, SessionResult};
use crate::reader::{ResultReader, ResultSet};
use crate::session::Session;

/// Coordinator that fans session operations out over a worker pool.
#[derive(Clone)]
pub struct SessionPool {
    config: Arc<EngineConfig>,
    reader: Arc<dyn ResultReader>,
    max_workers: Option<usize>,
}

impl SessionPool {
    pub fn new(config: Arc<EngineConfig>, reader: Arc<dyn ResultReader>) -> Self {
        Self {
            config,
            reader,
            max_workers: None,
        }
    }

    /// Cap the number of workers below the available parallelism.
    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = Some(workers.max(1));
        self
    }

    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    /// Worker count for a batch of `jobs`.
    pub fn pool_size(&self, jobs: usize) -> usize {
        let available = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);
        let limit = self.max_workers.map_or(available, |cap| cap.min(available));
        jobs.min(limit).max(1)
    }

    fn build_pool(&self, jobs: usize) -> SessionResult<rayon::ThreadPool> {
        let threads = self.pool_size(jobs);
        debug!(jobs, threads, "building session pool");
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("session-pool-{i}"))
            .build()
            .map_err(|err| SessionError::PoolBuild(err.to_string()))
    }

    /// Apply `op` to every job concurrently, preserving job order in the output.
    pub fn execute<T, R, F>(&self, jobs: Vec<T>, op: F) -> SessionResult<Vec<SessionResult<R>>>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> SessionResult<R> + Sync + Send,
    {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        let pool = self.build_pool(jobs.len())?;
        Ok(pool.install(|| {
            jobs.into_par_iter()
                .enumerate()
                .map(|(index, job)| isolate(index, || op(job)))
                .collect()
        }))
    }

    /// Apply `op` to each session with its own argument. `args` must match `sessions` in length.
    pub fn execute_on<A, R, F>(
        &self,
        sessions: &mut [Session],
        args: Vec<A>,
        op: F,
    ) -> SessionResult<Vec<SessionResult<R>>>
    where
        A: Send,
        R: Send,
        F: Fn(&mut Session, A) -> SessionResult<R> + Sync + Send,
    {
        if args.len() != sessions.len() {
            return Err(SessionError::dimension("arguments", sessions.len(), args.len()));
        }
        if sessions.is_empty() {
            return Ok(Vec::new());
        }
        let pool = self.build_pool(sessions.len())?;
        Ok(pool.install(|| {
            sessions
                .par_iter_mut()
                .zip(args.into_par_iter())
                .enumerate()
                .map(|(index, (session, arg))| isolate(index, || op(session, arg)))
                .collect()
        }))
    }

    fn execute_each<R, F>(&self, sessions: &mut [Session], op: F) -> SessionResult<Vec<SessionResult<R>>>
    where
        R: Send,
        F: Fn(&mut Session) -> SessionResult<R> + Sync + Send,
    {
        let units = vec![(); sessions.len()];
        self.execute_on(sessions, units, |session, ()| op(session))
    }

    /// Start one session per spec.
    pub fn start(&self, specs: Vec<SessionSpec>) -> SessionResult<Vec<SessionResult<Session>>> {
        self.execute(specs, |spec| {
            Session::start_new(spec, Arc::clone(&self.config), Arc::clone(&self.reader))
        })
    }

    /// Start sessions from parallel lists; `includes` and `raw_paths` must match `netlists`.
    pub fn start_sessions(
        &self,
        netlists: Vec<PathBuf>,
        includes: Option<Vec<Vec<PathBuf>>>,
        raw_paths: Option<Vec<PathBuf>>,
    ) -> SessionResult<Vec<SessionResult<Session>>> {
        let count = netlists.len();
        if let Some(includes) = &includes {
            if includes.len() != count {
                return Err(SessionError::dimension("include lists", count, includes.len()));
            }
        }
        if let Some(raw_paths) = &raw_paths {
            if raw_paths.len() != count {
                return Err(SessionError::dimension("raw paths", count, raw_paths.len()));
            }
        }

        let mut includes = includes.map(Vec::into_iter);
        let mut raw_paths = raw_paths.map(Vec::into_iter);
        let specs = netlists
            .into_iter()
            .map(|netlist| {
                let mut spec = SessionSpec::new(netlist);
                if let Some(dirs) = includes.as_mut().and_then(Iterator::next) {
                    spec = spec.with_includes(dirs);
                }
                if let Some(raw) = raw_paths.as_mut().and_then(Iterator::next) {
                    spec = spec.with_raw_path(raw);
                }
                spec
            })
            .collect();
        self.start(specs)
    }

    /// Start `count` sessions of the same netlist, each with its own raw file.
    pub fn start_n_sessions(
        &self,
        netlist: impl Into<PathBuf>,
        count: usize,
        includes: &[PathBuf],
    ) -> SessionResult<Vec<SessionResult<Session>>> {
        let spec = SessionSpec::new(netlist).with_includes(includes.iter().cloned());
        self.start(vec![spec; count])
    }

    pub fn run_all(&self, sessions: &mut [Session]) -> SessionResult<Vec<SessionResult<ResultSet>>> {
        self.execute_each(sessions, Session::run_all)
    }

    pub fn run_analysis(
        &self,
        sessions: &mut [Session],
        analyses: Vec<String>,
    ) -> SessionResult<Vec<SessionResult<ResultSet>>> {
        self.execute_on(sessions, analyses, |session, analysis| {
            session.run_analysis(&analysis)
        })
    }

    pub fn list_analyses(
        &self,
        sessions: &mut [Session],
    ) -> SessionResult<Vec<SessionResult<Vec<(String, String)>>>> {
        self.execute_each(sessions, Session::list_analyses)
    }

    pub fn set_parameters(
        &self,
        sessions: &mut [Session],
        parameters: Vec<BTreeMap<String, f64>>,
    ) -> SessionResult<Vec<SessionResult<bool>>> {
        self.execute_on(sessions, parameters, |session, params| {
            session.set_parameters(&params)
        })
    }

    pub fn get_parameters(
        &self,
        sessions: &mut [Session],
        names: Vec<Vec<String>>,
    ) -> SessionResult<Vec<SessionResult<BTreeMap<String, f64>>>> {
        self.execute_on(sessions, names, |session, names| session.get_parameters(names))
    }

    pub fn stop(
        &self,
        sessions: &mut [Session],
        remove_raw: bool,
    ) -> SessionResult<Vec<SessionResult<bool>>> {
        self.execute_each(sessions, |session| session.stop(remove_raw))
    }
}

fn isolate<R>(index: usize, work: impl FnOnce() -> SessionResult<R>) -> SessionResult<R> {
    let outcome = panic::catch_unwind(AssertUnwindSafe(work)).unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|text| text.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Err(SessionError::WorkerPanicked(message))
    });
    if let Err(err) = &outcome {
        warn!(index, error = %err, "pool worker failed");
    }
    outcome
}
