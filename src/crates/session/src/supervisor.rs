use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tracing::{debug, info, warn};

use crate::channel::{CommandChannel, Expect, ExpectError};
use crate::config::{EngineConfig, LogMode, SessionSpec};
use crate::error::{SessionError, SessionResult};
use crate::log_sink::LogSink;
use crate::reader::check_readable;

/// Expand a leading `~` to the home directory.
pub fn expand_user(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(rest),
        None => path.to_path_buf(),
    }
}

/// Reserve a `<netlist-stem>*.raw` file in the temp directory.
pub fn raw_tmp(netlist: &Path) -> SessionResult<PathBuf> {
    let stem = netlist
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "session".to_string());
    let path = tempfile::Builder::new()
        .prefix(&stem)
        .suffix(".raw")
        .tempfile()?
        .into_temp_path()
        .keep()
        .map_err(|err| SessionError::Io(err.error))?;
    Ok(path)
}

/// Write netlist text into a temporary `.scs` file that outlives the call.
pub fn netlist_to_tmp(netlist: &str) -> SessionResult<PathBuf> {
    let mut file = tempfile::Builder::new().suffix(".scs").tempfile()?;
    file.write_all(netlist.as_bytes())?;
    file.flush()?;
    let path = file
        .into_temp_path()
        .keep()
        .map_err(|err| SessionError::Io(err.error))?;
    Ok(path)
}

/// Log FIFO path: the raw path with its extension replaced by `.log`.
pub fn log_path_for(raw_path: &Path) -> PathBuf {
    raw_path.with_extension("log")
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split_whitespace().map(str::to_string)
}

/// Full argument vector after the executable:
/// `[prefix] netlist [-I include]* -raw raw [log option] [args] [mode flags] [postfix]`.
pub fn build_arguments(
    config: &EngineConfig,
    netlist: &Path,
    includes: &[PathBuf],
    raw_path: &Path,
    log_fifo: Option<&Path>,
) -> Vec<String> {
    let invocation = &config.invocation;
    let mut args: Vec<String> = tokens(&invocation.command_prefix).collect();
    args.push(netlist.display().to_string());
    args.extend(
        includes
            .iter()
            .map(|dir| format!("-I{}", expand_user(dir).display())),
    );
    args.push("-raw".to_string());
    args.push(raw_path.display().to_string());

    match (&config.log_mode, log_fifo) {
        (LogMode::Silent, Some(fifo)) => {
            args.push("=log".to_string());
            args.push(fifo.display().to_string());
        }
        (LogMode::Silent, None) | (LogMode::Terminal, _) => args.push("-log".to_string()),
        (LogMode::File { path, echo }, _) => {
            args.push(if *echo { "+log" } else { "=log" }.to_string());
            args.push(path.display().to_string());
        }
    }

    args.extend(invocation.args.iter().flat_map(|arg| tokens(arg)));
    args.extend(config.extra_args.iter().flat_map(|arg| tokens(arg)));
    args.extend(tokens(&invocation.command_postfix));
    args
}

/// A running engine attached to a pty and showing its prompt.
pub struct EngineProcess {
    pub(crate) child: Box<dyn Child + Send + Sync>,
    pub(crate) channel: CommandChannel,
    pub(crate) log_sink: Option<LogSink>,
    // Keeps the pty open for the lifetime of the process.
    _master: Box<dyn MasterPty + Send>,
    pid: Option<u32>,
}

impl EngineProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Poll for exit until `timeout` elapses.
    pub(crate) fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            match self.child.try_wait() {
                Ok(Some(_status)) => return true,
                Ok(None) => thread::sleep(Duration::from_millis(10)),
                Err(err) => {
                    debug!(error = %err, "try_wait failed while waiting for exit");
                    return false;
                }
            }
        }
        false
    }

    /// Kill the process and reap it.
    pub(crate) fn force_kill(&mut self) {
        if let Err(err) = self.child.kill() {
            debug!(error = %err, "kill failed");
        }
        let _ = self.wait_for_exit(Duration::from_secs(5));
    }
}

/// Turns a session spec plus engine config into a running, ready engine.
pub struct ProcessSupervisor<'a> {
    config: &'a EngineConfig,
}

impl<'a> ProcessSupervisor<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self { config }
    }

    /// Check the netlist, then spawn the engine and wait for its first prompt.
    pub fn launch(&self, spec: &SessionSpec, raw_path: &Path) -> SessionResult<EngineProcess> {
        let netlist = expand_user(&spec.netlist);
        check_readable(&netlist)?;

        let log_sink = match self.config.log_mode {
            LogMode::Silent => Some(LogSink::create(log_path_for(raw_path))?),
            _ => None,
        };
        let args = build_arguments(
            self.config,
            &netlist,
            &spec.includes,
            raw_path,
            log_sink.as_ref().map(LogSink::path),
        );
        self.spawn(args, log_sink)
    }

    fn spawn(&self, args: Vec<String>, log_sink: Option<LogSink>) -> SessionResult<EngineProcess> {
        let config = self.config;
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: config.pty_cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| SessionError::engine_start(err.to_string()))?;

        let mut cmd = CommandBuilder::new(&config.invocation.executable);
        cmd.args(&args);
        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        // The pty builder would otherwise start the engine in $HOME.
        let cwd = config
            .working_directory
            .clone()
            .or_else(|| std::env::current_dir().ok());
        if let Some(dir) = cwd {
            cmd.cwd(dir);
        }

        info!(
            executable = %config.invocation.executable,
            args = ?args,
            "spawning engine"
        );
        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|err| SessionError::engine_start(err.to_string()))?;
        // The reader only sees EOF once no slave handle remains in this process.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|err| SessionError::engine_start(err.to_string()));
        let writer = pair
            .master
            .take_writer()
            .map_err(|err| SessionError::engine_start(err.to_string()));
        let (reader, writer) = match (reader, writer) {
            (Ok(reader), Ok(writer)) => (reader, writer),
            (Err(err), _) | (_, Err(err)) => {
                let _ = child.kill();
                return Err(err);
            }
        };

        let mut output = match Expect::spawn(reader) {
            Ok(output) => output,
            Err(err) => {
                let _ = child.kill();
                return Err(SessionError::engine_start(err.to_string()));
            }
        };

        if let Err(err) = output.expect(&config.patterns.prompt, config.startup_timeout) {
            let failure = match child.try_wait() {
                Ok(Some(status)) => SessionError::EngineExited(status.exit_code()),
                _ => match err {
                    ExpectError::Timeout(timeout) => SessionError::StartupTimeout(timeout),
                    ExpectError::Eof => SessionError::engine_start("terminal closed before prompt"),
                },
            };
            warn!(error = %failure, pending = %output.pending(), "engine failed to start");
            let _ = child.kill();
            let _ = child.wait();
            return Err(failure);
        }

        let pid = child.process_id();
        info!(pid = ?pid, "engine ready");
        let channel = CommandChannel::new(
            writer,
            output,
            config.patterns.clone(),
            config.command_timeout,
        );
        Ok(EngineProcess {
            child,
            channel,
            log_sink,
            _master: pair.master,
            pid,
        })
    }
}
