//! Worker launch configuration.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use sockwire::supervisor::WorkerConfig;
//!
//! let config = WorkerConfig::new("python3", "completion_server.py")
//!     .cwd("/work/project")
//!     .env("PYTHONUNBUFFERED", "1")
//!     .startup_timeout(Duration::from_secs(30));
//! assert_eq!(config.ready_line, "Started");
//! ```

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;
use crate::protocol::DEFAULT_MAX_STRING_LENGTH;

/// Default stdout line a worker prints once it is serving.
pub const DEFAULT_READY_LINE: &str = "Started";

/// How to launch a worker and decide that it is ready.
///
/// Can be loaded from a JSON settings blob; missing fields take their
/// defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Interpreter or executable to run.
    pub interpreter: PathBuf,
    /// Worker script, passed as the first argument.
    pub script: PathBuf,
    /// Extra arguments after the port.
    pub args: Vec<String>,
    /// Working directory of the worker.
    pub cwd: Option<PathBuf>,
    /// Variables added to the worker's environment.
    pub env: HashMap<String, String>,
    /// Stdout line that signals the worker is serving.
    pub ready_line: String,
    /// Give up on startup after this many milliseconds.
    pub startup_timeout_ms: Option<u64>,
    /// Largest string field accepted from the worker.
    pub max_string_length: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interpreter: PathBuf::from("python"),
            script: PathBuf::new(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            ready_line: DEFAULT_READY_LINE.to_string(),
            startup_timeout_ms: None,
            max_string_length: DEFAULT_MAX_STRING_LENGTH,
        }
    }
}

impl WorkerConfig {
    /// Run `script` with `interpreter`.
    pub fn new(interpreter: impl Into<PathBuf>, script: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: interpreter.into(),
            script: script.into(),
            ..Self::default()
        }
    }

    /// Parse a JSON settings blob.
    ///
    /// # Errors
    ///
    /// Returns `Decode` if the text is not a valid configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Append an argument after the port.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set the working directory.
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the readiness line.
    pub fn ready_line(mut self, line: impl Into<String>) -> Self {
        self.ready_line = line.into();
        self
    }

    /// Bound the time to readiness.
    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Set the largest string field accepted from the worker.
    pub fn max_string_length(mut self, max: u64) -> Self {
        self.max_string_length = max;
        self
    }

    /// The startup bound, if any.
    pub fn startup_timeout_duration(&self) -> Option<Duration> {
        self.startup_timeout_ms.map(Duration::from_millis)
    }

    /// Variables to add to the worker's environment.
    ///
    /// `extra` overrides this config's `env`; both only fill keys that
    /// `ambient` does not define.
    pub(crate) fn env_additions<'a>(
        &'a self,
        extra: &'a HashMap<String, String>,
        ambient: impl Fn(&OsStr) -> bool,
    ) -> HashMap<&'a str, &'a str> {
        self.env
            .iter()
            .chain(extra)
            .filter(|(key, _)| !ambient(OsStr::new(key.as_str())))
            .map(|(key, value)| (key.as_str(), value.as_str()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.ready_line, "Started");
        assert_eq!(config.startup_timeout_duration(), None);
        assert_eq!(config.max_string_length, DEFAULT_MAX_STRING_LENGTH);
    }

    #[test]
    fn test_from_json_partial() {
        let config = WorkerConfig::from_json(
            r#"{"interpreter": "/usr/bin/python3", "script": "srv.py", "startup_timeout_ms": 1500}"#,
        )
        .unwrap();
        assert_eq!(config.interpreter, PathBuf::from("/usr/bin/python3"));
        assert_eq!(config.startup_timeout_duration(), Some(Duration::from_millis(1500)));
        assert_eq!(config.ready_line, DEFAULT_READY_LINE);
        assert!(config.args.is_empty());
    }

    #[test]
    fn test_from_json_rejects_wrong_types() {
        assert!(WorkerConfig::from_json(r#"{"args": "not a list"}"#).is_err());
    }

    #[test]
    fn test_builder() {
        let config = WorkerConfig::new("py", "w.py")
            .arg("--verbose")
            .cwd("/tmp")
            .env("A", "1")
            .ready_line("READY")
            .startup_timeout(Duration::from_secs(2))
            .max_string_length(1024);
        assert_eq!(config.args, ["--verbose"]);
        assert_eq!(config.cwd, Some(PathBuf::from("/tmp")));
        assert_eq!(config.env["A"], "1");
        assert_eq!(config.ready_line, "READY");
        assert_eq!(config.startup_timeout_ms, Some(2000));
        assert_eq!(config.max_string_length, 1024);
    }

    #[test]
    fn test_ambient_environment_wins() {
        let config = WorkerConfig::default().env("PATH", "/nope").env("FROM_CONFIG", "c").env("BOTH", "config");
        let extra = HashMap::from([("BOTH".to_string(), "caller".to_string()), ("HOME".to_string(), "/x".to_string())]);
        let ambient = |key: &OsStr| key == "PATH" || key == "HOME";

        let added = config.env_additions(&extra, ambient);
        assert_eq!(added.get("FROM_CONFIG"), Some(&"c"));
        assert_eq!(added.get("BOTH"), Some(&"caller"));
        assert!(!added.contains_key("PATH"));
        assert!(!added.contains_key("HOME"));
    }
}
