use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex_lite::Regex;
use serde::Deserialize;
use tracing::debug;

/// Prompt the engine prints when it is ready for the next command.
pub const DEFAULT_PROMPT: &str = r"\r\n>\s";
/// Marker on the last reply line of an accepted command.
pub const DEFAULT_SUCCESS: &str = r"^t$";
/// Marker on the last reply line of a rejected command.
pub const DEFAULT_FAILURE: &str = r"^nil$";

/// Executable name, base arguments, and wrapper tokens used to launch the engine.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Invocation {
    pub executable: String,
    pub args: Vec<String>,
    #[serde(default)]
    pub command_prefix: String,
    #[serde(default)]
    pub command_postfix: String,
}

impl Default for Invocation {
    fn default() -> Self {
        Self {
            executable: "spectre".to_string(),
            args: vec![
                "-64".to_string(),
                "-format nutbin".to_string(),
                "+interactive".to_string(),
            ],
            command_prefix: String::new(),
            command_postfix: String::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OverrideDocument {
    spectre: Invocation,
}

impl Invocation {
    /// Read an override document, returning `None` when it is missing or malformed.
    pub fn from_document(path: &Path) -> Option<Self> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) => {
                debug!(path = %path.display(), error = %err, "invocation overrides unavailable");
                return None;
            }
        };
        match serde_yaml::from_str::<OverrideDocument>(&text) {
            Ok(document) => Some(document.spectre),
            Err(err) => {
                debug!(path = %path.display(), error = %err, "ignoring malformed invocation overrides");
                None
            }
        }
    }
}

/// Where the engine writes its log.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogMode {
    /// Log into a private named pipe that is drained and discarded.
    #[default]
    Silent,
    /// Log into a file; `echo` also copies the log to the terminal.
    File { path: PathBuf, echo: bool },
    /// Log only to the terminal.
    Terminal,
}

/// APS++ error preset for transient analyses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApsPreset {
    Liberal,
    Moderate,
    Conservative,
}

/// Spectre X accuracy/performance preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XPreset {
    Cx,
    Ax,
    Mx,
    Lx,
    Vx,
}

/// Optional accelerated simulation mode passed as an extra flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineMode {
    Aps(ApsPreset),
    X(XPreset),
}

impl EngineMode {
    pub fn flag(&self) -> String {
        match self {
            EngineMode::Aps(preset) => {
                let name = match preset {
                    ApsPreset::Liberal => "liberal",
                    ApsPreset::Moderate => "moderate",
                    ApsPreset::Conservative => "conservative",
                };
                format!("++aps={name}")
            }
            EngineMode::X(preset) => {
                let name = match preset {
                    XPreset::Cx => "cx",
                    XPreset::Ax => "ax",
                    XPreset::Mx => "mx",
                    XPreset::Lx => "lx",
                    XPreset::Vx => "vx",
                };
                format!("+preset={name}")
            }
        }
    }
}

/// Protocol markers compiled once per configuration.
#[derive(Debug, Clone)]
pub struct ProtocolPatterns {
    pub prompt: Regex,
    pub success: Regex,
    pub failure: Regex,
}

impl Default for ProtocolPatterns {
    fn default() -> Self {
        Self {
            prompt: Regex::new(DEFAULT_PROMPT).expect("default prompt pattern compiles"),
            success: Regex::new(DEFAULT_SUCCESS).expect("default success pattern compiles"),
            failure: Regex::new(DEFAULT_FAILURE).expect("default failure pattern compiles"),
        }
    }
}

/// Process-level configuration shared by every session launched from it.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Executable, base arguments, prefix and postfix.
    pub invocation: Invocation,
    /// Mode flags appended after the base arguments.
    pub extra_args: Vec<String>,
    /// Log destination for every session.
    pub log_mode: LogMode,
    /// Prompt and reply markers.
    pub patterns: ProtocolPatterns,
    /// Extra environment variables applied to the engine.
    pub env: BTreeMap<String, String>,
    /// Optional working directory override for the engine.
    pub working_directory: Option<PathBuf>,
    /// Upper bound on how long to wait for the first prompt.
    pub startup_timeout: Duration,
    /// Upper bound on how long to wait for the prompt after each command.
    pub command_timeout: Duration,
    /// Upper bound on how long to wait for a graceful exit before killing.
    pub quit_timeout: Duration,
    /// Terminal width reported to the engine.
    pub pty_cols: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            invocation: Invocation::default(),
            extra_args: Vec::new(),
            log_mode: LogMode::default(),
            patterns: ProtocolPatterns::default(),
            env: BTreeMap::new(),
            working_directory: None,
            startup_timeout: Duration::from_secs(120),
            command_timeout: Duration::from_secs(120),
            quit_timeout: Duration::from_secs(10),
            pty_cols: 512,
        }
    }
}

impl EngineConfig {
    /// Create a config targeting a specific engine executable.
    pub fn new(executable: impl Into<String>) -> Self {
        let mut config = Self::default();
        config.invocation.executable = executable.into();
        config
    }

    /// Merge an override document. A missing or malformed document keeps the current values.
    pub fn with_overrides_from(mut self, path: impl AsRef<Path>) -> Self {
        if let Some(invocation) = Invocation::from_document(path.as_ref()) {
            self.invocation = invocation;
        }
        self
    }

    /// Replace the base argument list.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.invocation.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Add a passthrough CLI argument after the base arguments.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    /// Append the flag selecting an accelerated simulation mode.
    pub fn with_mode(self, mode: EngineMode) -> Self {
        let flag = mode.flag();
        self.with_arg(flag)
    }

    /// Tokens placed before the netlist, e.g. a job wrapper's options.
    pub fn with_command_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.invocation.command_prefix = prefix.into();
        self
    }

    /// Tokens placed after every other argument.
    pub fn with_command_postfix(mut self, postfix: impl Into<String>) -> Self {
        self.invocation.command_postfix = postfix.into();
        self
    }

    /// Choose where the engine writes its log.
    pub fn with_log_mode(mut self, mode: LogMode) -> Self {
        self.log_mode = mode;
        self
    }

    /// Override the prompt and reply markers.
    pub fn with_patterns(mut self, patterns: ProtocolPatterns) -> Self {
        self.patterns = patterns;
        self
    }

    /// Add an environment variable override.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Override the working directory for the spawned process.
    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    /// How long `start` waits for the first prompt.
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// How long each command waits for the prompt to return.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// How long `stop` waits for a graceful exit before killing the engine.
    pub fn with_quit_timeout(mut self, timeout: Duration) -> Self {
        self.quit_timeout = timeout;
        self
    }
}

/// Per-session inputs: the netlist, include directories, and the raw results path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSpec {
    pub netlist: PathBuf,
    pub includes: Vec<PathBuf>,
    /// Generated from the netlist name in the temp directory when absent.
    pub raw_path: Option<PathBuf>,
}

impl SessionSpec {
    pub fn new(netlist: impl Into<PathBuf>) -> Self {
        Self {
            netlist: netlist.into(),
            includes: Vec::new(),
            raw_path: None,
        }
    }

    pub fn with_include(mut self, dir: impl Into<PathBuf>) -> Self {
        self.includes.push(dir.into());
        self
    }

    pub fn with_includes<I, P>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.includes.extend(dirs.into_iter().map(Into::into));
        self
    }

    pub fn with_raw_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.raw_path = Some(path.into());
        self
    }
}
