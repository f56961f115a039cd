use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::address::{command, AttributeValue, ChildKind, OwnerKind, ParameterAddress};
use crate::channel::{CommandResult, Verdict};
use crate::config::{EngineConfig, SessionSpec};
use crate::error::{SessionError, SessionResult};
use crate::reader::{ResultReader, ResultSet, OFFSET_KEY};
use crate::sexpr;
use crate::supervisor::{raw_tmp, EngineProcess, ProcessSupervisor};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Constructed, not yet spawned.
    Created,
    /// Process running and prompt observed.
    Active,
    /// Process gone, either stopped or failed to start.
    Terminated,
}

/// One interactive engine instance and its protocol state.
///
/// Every method that talks to the engine takes `&mut self`, so a session never
/// has two commands in flight and its read offset has a single writer.
pub struct Session {
    spec: SessionSpec,
    raw_path: PathBuf,
    config: Arc<EngineConfig>,
    reader: Arc<dyn ResultReader>,
    process: Option<EngineProcess>,
    state: LifecycleState,
    offset: u64,
    // The raw path was reserved here rather than supplied by the caller.
    reserved_raw: bool,
    // An engine reached its prompt at least once.
    spawned: bool,
}

impl Session {
    /// Build a session in the `Created` state, reserving a raw path when `spec.raw_path` is unset.
    pub fn new(
        spec: SessionSpec,
        config: Arc<EngineConfig>,
        reader: Arc<dyn ResultReader>,
    ) -> SessionResult<Self> {
        let (raw_path, reserved_raw) = match &spec.raw_path {
            Some(path) => (path.clone(), false),
            None => (raw_tmp(&spec.netlist)?, true),
        };
        Ok(Self {
            spec,
            raw_path,
            config,
            reader,
            process: None,
            state: LifecycleState::Created,
            offset: 0,
            reserved_raw,
            spawned: false,
        })
    }

    /// Construct and start in one step.
    pub fn start_new(
        spec: SessionSpec,
        config: Arc<EngineConfig>,
        reader: Arc<dyn ResultReader>,
    ) -> SessionResult<Self> {
        let mut session = Self::new(spec, config, reader)?;
        session.start()?;
        Ok(session)
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn netlist(&self) -> &Path {
        &self.spec.netlist
    }

    pub fn raw_path(&self) -> &Path {
        &self.raw_path
    }

    /// Byte position (or decoder-specific cursor) of the next `run_all` read.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// OS process id of the engine, while one is attached.
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(EngineProcess::pid)
    }

    pub fn is_alive(&mut self) -> bool {
        self.process
            .as_mut()
            .map(EngineProcess::is_alive)
            .unwrap_or(false)
    }

    /// Spawn the engine and wait for its prompt.
    ///
    /// A missing or unreadable netlist leaves the session `Created`. Any other
    /// failure leaves it `Terminated`; construct a new one to retry. A raw file
    /// reserved by [`Session::new`] is removed when the session ends without
    /// ever reaching the prompt.
    pub fn start(&mut self) -> SessionResult<()> {
        if self.state != LifecycleState::Created {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                to: LifecycleState::Active,
            });
        }

        let launched = ProcessSupervisor::new(&self.config).launch(&self.spec, &self.raw_path);
        match launched {
            Ok(process) => {
                info!(
                    netlist = %self.spec.netlist.display(),
                    raw = %self.raw_path.display(),
                    pid = ?process.pid(),
                    "session active"
                );
                self.process = Some(process);
                self.state = LifecycleState::Active;
                self.spawned = true;
                self.offset = 0;
                Ok(())
            }
            Err(err) => {
                // Precondition failures never spawned anything and may be fixed and retried.
                if !matches!(
                    err,
                    SessionError::MissingFile(_) | SessionError::Unreadable { .. }
                ) {
                    self.state = LifecycleState::Terminated;
                    if self.reserved_raw {
                        self.remove_raw_file();
                    }
                }
                Err(err)
            }
        }
    }

    fn active_process(&mut self) -> SessionResult<&mut EngineProcess> {
        if self.state != LifecycleState::Active {
            return Err(SessionError::NotActive(self.state));
        }
        self.process
            .as_mut()
            .ok_or(SessionError::NotActive(LifecycleState::Terminated))
    }

    /// Send an arbitrary command and classify the reply.
    pub fn run_command(&mut self, command: &str) -> SessionResult<CommandResult> {
        let process = self.active_process()?;
        process.channel.execute(command)
    }

    /// Commands answered with `t` or `nil`; anything else counts as a failure.
    fn run_flag(&mut self, command: &str) -> SessionResult<bool> {
        let result = self.run_command(command)?;
        if result.verdict == Verdict::Returned {
            warn!(command, reply = %result.reply, "engine answered without a success marker");
        }
        Ok(result.accepted())
    }

    /// Commands that must answer with a value; `nil` is an error.
    fn run_value(&mut self, command: &str) -> SessionResult<CommandResult> {
        let result = self.run_command(command)?;
        if !result.success() {
            return Err(SessionError::unexpected(format!(
                "`{command}` was rejected: {}",
                result.reply
            )));
        }
        Ok(result)
    }

    /// `nil` is the engine's spelling of an empty list.
    fn run_listing(&mut self, command: &str) -> SessionResult<Vec<sexpr::Expr>> {
        let result = self.run_command(command)?;
        if !result.success() {
            return Ok(Vec::new());
        }
        result.parse()
    }

    /// Run every analysis and return the plots appended since the previous `run_all`.
    pub fn run_all(&mut self) -> SessionResult<ResultSet> {
        self.run_command(&command::run_all())?;
        let batch = self.reader.read(&self.raw_path, self.offset)?;
        if batch.next_offset < self.offset {
            debug!(
                current = self.offset,
                reported = batch.next_offset,
                "ignoring offset that would move backwards"
            );
        }
        self.offset = self.offset.max(batch.next_offset);

        let mut tables = batch.tables;
        tables.remove(OFFSET_KEY);
        Ok(tables)
    }

    /// Run one analysis and return every plot in the raw file, read from the start.
    ///
    /// The session offset is left untouched, so a later `run_all` still reads from
    /// where the previous `run_all` stopped.
    pub fn run_analysis(&mut self, analysis: &str) -> SessionResult<ResultSet> {
        self.run_command(&command::run_analysis(analysis))?;
        let mut tables = self.reader.read(&self.raw_path, 0)?.tables;
        tables.remove(OFFSET_KEY);
        Ok(tables)
    }

    pub fn list_children(&mut self, kind: ChildKind) -> SessionResult<Vec<String>> {
        let exprs = self.run_listing(&command::list_children(kind))?;
        // Nets come back as a flat list of names; the others as (name, kind) pairs.
        if kind == ChildKind::Nets {
            return Ok(sexpr::strings(&exprs));
        }
        let pairs = sexpr::name_value_pairs(&exprs);
        if pairs.is_empty() {
            Ok(sexpr::strings(&exprs))
        } else {
            Ok(pairs.into_iter().map(|(name, _)| name).collect())
        }
    }

    /// Analyses as `(name, type)` pairs.
    pub fn list_analyses(&mut self) -> SessionResult<Vec<(String, String)>> {
        let exprs = self.run_listing(&command::list_children(ChildKind::Analyses))?;
        Ok(sexpr::name_value_pairs(&exprs))
    }

    pub fn list_instances(&mut self) -> SessionResult<Vec<String>> {
        self.list_children(ChildKind::Instances)
    }

    pub fn list_nets(&mut self) -> SessionResult<Vec<String>> {
        self.list_children(ChildKind::Nets)
    }

    pub fn list_parameters(&mut self, owner: &OwnerKind) -> SessionResult<Vec<String>> {
        let exprs = self.run_listing(&command::list_parameters(owner))?;
        Ok(sexpr::name_value_pairs(&exprs)
            .into_iter()
            .map(|(name, _)| name)
            .collect())
    }

    /// Attributes of a parameter as `(attribute, value)` pairs.
    pub fn list_attributes(
        &mut self,
        owner: &OwnerKind,
        parameter: &str,
    ) -> SessionResult<Vec<(String, String)>> {
        let address = ParameterAddress::new(owner.clone(), parameter);
        let exprs = self.run_listing(&command::list_attributes(&address))?;
        Ok(sexpr::name_value_pairs(&exprs))
    }

    /// Read one attribute. Only the last reply line is parsed, so engine
    /// diagnostics printed ahead of the value are ignored.
    pub fn get_attribute(&mut self, address: &ParameterAddress) -> SessionResult<String> {
        let result = self.run_value(&command::get_attribute(address))?;
        let line = result.value_line();
        let exprs = sexpr::parse(line)
            .map_err(|err| SessionError::unexpected(format!("{err} in reply line {line:?}")))?;
        sexpr::last_scalar(&exprs)
            .map(str::to_string)
            .ok_or_else(|| {
                SessionError::unexpected(format!(
                    "no value for {}.{}",
                    address.parameter,
                    address.attribute()
                ))
            })
    }

    pub fn set_attribute(
        &mut self,
        address: &ParameterAddress,
        value: impl Into<AttributeValue>,
    ) -> SessionResult<bool> {
        self.run_flag(&command::set_attribute(address, &value.into()))
    }

    pub fn create_analysis(&mut self, analysis_type: &str, name: &str) -> SessionResult<bool> {
        self.run_flag(&command::create_analysis(analysis_type, name))
    }

    /// Numeric value of a circuit parameter.
    pub fn get_parameter(&mut self, parameter: &str) -> SessionResult<f64> {
        let text = self.get_attribute(&ParameterAddress::circuit(parameter))?;
        text.trim().parse().map_err(|_| {
            SessionError::unexpected(format!("parameter {parameter} is not numeric: {text}"))
        })
    }

    pub fn get_parameters<I, S>(&mut self, parameters: I) -> SessionResult<BTreeMap<String, f64>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        parameters
            .into_iter()
            .map(|name| {
                let name = name.as_ref();
                self.get_parameter(name).map(|value| (name.to_string(), value))
            })
            .collect()
    }

    pub fn set_parameter(&mut self, parameter: &str, value: f64) -> SessionResult<bool> {
        self.set_attribute(&ParameterAddress::circuit(parameter), value)
    }

    /// Set several circuit parameters, stopping at the first rejected one.
    pub fn set_parameters(&mut self, parameters: &BTreeMap<String, f64>) -> SessionResult<bool> {
        for (name, value) in parameters {
            if !self.set_parameter(name, *value)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Quit the engine, forcing termination if it will not exit, and report whether it is gone.
    ///
    /// Stopping a terminated session is a no-op that returns `true`. The raw file is
    /// removed only when `remove_raw` is set and only after the process has exited.
    pub fn stop(&mut self, remove_raw: bool) -> SessionResult<bool> {
        let mut process = match (self.state, self.process.take()) {
            (LifecycleState::Created, _) => {
                return Err(SessionError::InvalidTransition {
                    from: LifecycleState::Created,
                    to: LifecycleState::Terminated,
                })
            }
            (_, None) => {
                self.state = LifecycleState::Terminated;
                if remove_raw {
                    self.remove_raw_file();
                }
                return Ok(true);
            }
            (_, Some(process)) => process,
        };

        if process.is_alive() {
            if let Err(err) = process.channel.send_line(command::QUIT) {
                debug!(error = %err, "quit command could not be written");
            }
            if !process.wait_for_exit(self.config.quit_timeout) {
                warn!(pid = ?process.pid(), "engine refused to exit gracefully, forcing");
                process.force_kill();
            }
        }

        let dead = !process.is_alive();
        if let Some(mut sink) = process.log_sink.take() {
            sink.close();
        }
        if remove_raw && dead {
            self.remove_raw_file();
        }
        info!(pid = ?process.pid(), dead, "session stopped");
        drop(process);
        self.state = LifecycleState::Terminated;
        Ok(dead)
    }

    fn remove_raw_file(&self) {
        match fs::remove_file(&self.raw_path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(raw = %self.raw_path.display(), error = %err, "failed to remove raw file"),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.process.is_some() {
            let _ = self.stop(false);
        } else if self.reserved_raw && !self.spawned {
            self.remove_raw_file();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::JsonPlotReader;

    fn created(raw: &Path) -> Session {
        Session::new(
            SessionSpec::new("/nonexistent/amp.scs").with_raw_path(raw),
            Arc::new(EngineConfig::default()),
            Arc::new(JsonPlotReader),
        )
        .unwrap()
    }

    #[test]
    fn created_session_rejects_commands() {
        let mut session = created(Path::new("/tmp/created.raw"));
        assert_eq!(session.state(), LifecycleState::Created);
        assert!(!session.is_alive());
        let err = session.run_all().unwrap_err();
        assert!(matches!(err, SessionError::NotActive(LifecycleState::Created)));
        let err = session.set_parameter("W", 1.0).unwrap_err();
        assert!(matches!(err, SessionError::NotActive(_)));
        assert!(matches!(
            session.stop(false),
            Err(SessionError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn precondition_failure_keeps_session_created() {
        let mut session = created(Path::new("/tmp/precondition.raw"));
        let err = session.start().unwrap_err();
        assert!(matches!(err, SessionError::MissingFile(_)));
        assert_eq!(session.state(), LifecycleState::Created);
        assert_eq!(session.offset(), 0);
    }

    #[test]
    fn raw_path_is_reserved_from_netlist_name() {
        let session = Session::new(
            SessionSpec::new("/work/bias.scs"),
            Arc::new(EngineConfig::default()),
            Arc::new(JsonPlotReader),
        )
        .unwrap();
        let name = session.raw_path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("bias") && name.ends_with(".raw"));
        fs::remove_file(session.raw_path()).unwrap();
    }

    #[test]
    fn reserved_raw_file_is_removed_when_never_started() {
        let mut session = Session::new(
            SessionSpec::new("/nonexistent/unused.scs"),
            Arc::new(EngineConfig::default()),
            Arc::new(JsonPlotReader),
        )
        .unwrap();
        let raw = session.raw_path().to_path_buf();
        assert!(raw.exists());
        assert!(matches!(session.start(), Err(SessionError::MissingFile(_))));
        drop(session);
        assert!(!raw.exists());
    }

    #[test]
    fn caller_raw_file_survives_drop() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("kept.raw");
        fs::write(&raw, b"").unwrap();
        drop(created(&raw));
        assert!(raw.exists());
    }
}
