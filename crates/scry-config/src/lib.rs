//! Configuration for the Scry debugger engine.
//!
//! A config file is plain TOML. Every section is optional; missing keys fall
//! back to the defaults documented on each field.
//!
//! ```toml
//! [launch]
//! classpath = ["build/classes"]
//! main_class = "com.example.GeneratorTarget"
//!
//! [[classes]]
//! name = "com.example.GeneratorTarget"
//! breakpoints = [15, 24]
//! ```

mod logging;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use logging::init_tracing;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // Keep the message and drop the source snippet.
        ConfigError::Toml(err.message().to_owned())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScryConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub jdwp: JdwpConfig,
    #[serde(default)]
    pub launch: LaunchConfig,
    #[serde(default)]
    pub session: SessionConfig,
    /// Classes whose execution the session watches.
    #[serde(default)]
    pub classes: Vec<ClassConfig>,
}

impl ScryConfig {
    /// Load a config file from TOML.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: ScryConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Semantic checks that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for class in &self.classes {
            if class.name.trim().is_empty() {
                return Err(ConfigError::Invalid("classes.name must not be empty".into()));
            }
            if class.breakpoints.iter().any(|line| *line == 0) {
                return Err(ConfigError::Invalid(format!(
                    "classes.breakpoints for {} must be 1-based line numbers",
                    class.name
                )));
            }
        }
        if self.jdwp.connect_attempts == 0 {
            return Err(ConfigError::Invalid(
                "jdwp.connect_attempts must be at least 1".into(),
            ));
        }
        if self.session.max_marshal_depth == 0 {
            return Err(ConfigError::Invalid(
                "session.max_marshal_depth must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Either a simple level (`info`, `debug`, ...) or a full `EnvFilter`
    /// directive string.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Emit logs in JSON format.
    #[serde(default)]
    pub json: bool,

    /// Write logs to stderr.
    #[serde(default = "LoggingConfig::default_stderr")]
    pub stderr: bool,

    /// Append logs to the given file path.
    ///
    /// If the file cannot be opened, file logging is disabled while other sinks
    /// remain active.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    fn default_stderr() -> bool {
        true
    }

    pub(crate) fn normalize_level_directives(input: &str) -> String {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Self::default_level();
        }

        match trimmed.to_ascii_lowercase().as_str() {
            "trace" => "trace".to_owned(),
            "debug" => "debug".to_owned(),
            "info" => "info".to_owned(),
            "warn" | "warning" => "warn".to_owned(),
            "error" => "error".to_owned(),
            _ => trimmed.to_owned(),
        }
    }

    fn config_env_filter(&self) -> tracing_subscriber::EnvFilter {
        let directives = Self::normalize_level_directives(&self.level);
        tracing_subscriber::EnvFilter::try_new(directives).unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::default()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        })
    }

    /// The effective filter: configured directives, with `RUST_LOG` merged on top.
    pub fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        let env_directives = std::env::var("RUST_LOG")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());

        let config_directives = Self::normalize_level_directives(&self.level);

        match env_directives {
            Some(env_directives) => {
                let combined = format!("{config_directives},{env_directives}");
                tracing_subscriber::EnvFilter::try_new(combined)
                    .or_else(|_| tracing_subscriber::EnvFilter::try_new(env_directives))
                    .unwrap_or_else(|_| self.config_env_filter())
            }
            None => self.config_env_filter(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
            stderr: Self::default_stderr(),
            file: None,
        }
    }
}

/// Wire-level knobs for the JDWP connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct JdwpConfig {
    pub handshake_timeout_ms: u64,
    pub reply_timeout_ms: u64,
    /// How many times to try connecting to a freshly launched target.
    pub connect_attempts: u32,
    pub connect_retry_delay_ms: u64,
}

impl JdwpConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }
}

impl Default for JdwpConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 5_000,
            reply_timeout_ms: 10_000,
            connect_attempts: 50,
            connect_retry_delay_ms: 100,
        }
    }
}

/// How to start the target JVM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LaunchConfig {
    /// `java` executable; resolved through `PATH` when not absolute.
    pub java: PathBuf,
    pub classpath: Vec<PathBuf>,
    pub main_class: Option<String>,
    /// Extra JVM options placed before the main class.
    pub vm_options: Vec<String>,
    /// Program arguments placed after the main class.
    pub args: Vec<String>,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            java: PathBuf::from("java"),
            classpath: Vec::new(),
            main_class: None,
            vm_options: Vec::new(),
            args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SessionConfig {
    /// Report exceptions that are caught by the target.
    pub report_caught_exceptions: bool,
    /// Report exceptions that escape the target's code.
    pub report_uncaught_exceptions: bool,
    /// Class patterns (`java.*`, `*.Foo`) the VM steps through without reporting.
    pub step_class_exclusions: Vec<String>,
    /// Ask the target VM to exit when the session is cancelled.
    pub exit_target_on_cancel: bool,
    /// Nesting limit for value marshalling.
    pub max_marshal_depth: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            report_caught_exceptions: true,
            report_uncaught_exceptions: true,
            step_class_exclusions: ["java.*", "javax.*", "jdk.*", "sun.*", "com.sun.*"]
                .into_iter()
                .map(str::to_owned)
                .collect(),
            exit_target_on_cancel: true,
            max_marshal_depth: 16,
        }
    }
}

/// A watched class and its compile-time breakpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassConfig {
    /// Binary class name, e.g. `com.example.GeneratorTarget`.
    pub name: String,
    #[serde(default)]
    pub breakpoints: Vec<u32>,
    /// Keep the class's source text in memory after the first read.
    #[serde(default)]
    pub cached: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = ScryConfig::from_toml_str("").unwrap();
        assert_eq!(config, ScryConfig::default());
        assert_eq!(config.jdwp.reply_timeout(), Duration::from_secs(10));
        assert!(config
            .session
            .step_class_exclusions
            .iter()
            .any(|p| p == "java.*"));
    }

    #[test]
    fn parses_full_document() {
        let config = ScryConfig::from_toml_str(
            r#"
            [logging]
            level = "Warning"
            json = true

            [jdwp]
            reply_timeout_ms = 250

            [launch]
            classpath = ["out", "lib/dep.jar"]
            main_class = "com.example.GeneratorTarget"
            vm_options = ["-Xmx64m"]

            [session]
            report_caught_exceptions = false
            step_class_exclusions = ["java.*"]

            [[classes]]
            name = "com.example.GeneratorTarget"
            breakpoints = [15, 24]

            [[classes]]
            name = "com.example.Generator"
            breakpoints = [203]
            cached = true
            "#,
        )
        .unwrap();

        assert!(config.logging.json);
        assert_eq!(
            LoggingConfig::normalize_level_directives(&config.logging.level),
            "warn",
        );
        assert_eq!(config.jdwp.reply_timeout(), Duration::from_millis(250));
        assert_eq!(config.jdwp.connect_attempts, 50);
        assert_eq!(config.launch.classpath.len(), 2);
        assert_eq!(
            config.launch.main_class.as_deref(),
            Some("com.example.GeneratorTarget")
        );
        assert!(!config.session.report_caught_exceptions);
        assert!(config.session.report_uncaught_exceptions);
        assert_eq!(config.classes.len(), 2);
        assert_eq!(config.classes[1].breakpoints, vec![203]);
        assert!(config.classes[1].cached);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = ScryConfig::from_toml_str("[session]\nbogus = 1\n").unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)), "{err:?}");
    }

    #[test]
    fn zero_line_is_invalid() {
        let err = ScryConfig::from_toml_str(
            "[[classes]]\nname = \"Foo\"\nbreakpoints = [0]\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)), "{err:?}");
    }

    #[test]
    fn load_from_path_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");
        let err = ScryConfig::load_from_path(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }), "{err:?}");
    }

    #[test]
    fn load_from_path_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scry.toml");
        std::fs::write(&path, "[launch]\nmain_class = \"Main\"\n").unwrap();
        let config = ScryConfig::load_from_path(&path).unwrap();
        assert_eq!(config.launch.main_class.as_deref(), Some("Main"));
    }
}
