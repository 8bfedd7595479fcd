//! Configuration for pty-relay
//!
//! Sources, in order of precedence: CLI > env > file > defaults. The file is
//! TOML at `$XDG_CONFIG_HOME/pty-relay/config.toml` unless `--config` names
//! another one.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::pty::{SetupResult, ShellCommand};
use crate::relay::WritePolicy;

/// Shell used when none is configured
pub const DEFAULT_SHELL: &str = "/bin/sh";

const MAX_HANGUP_GRACE_MS: u64 = 60_000;

/// CLI arguments for pty-relay
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "pty-relay")]
#[command(version)]
#[command(about = "Run a shell on a new pseudoterminal and relay the invoking terminal to it", long_about = None)]
pub struct CliArgs {
    /// Path to custom config file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Shell to run on the PTY
    #[arg(short, long, value_name = "SHELL")]
    pub shell: Option<String>,

    /// What to do on short writes (best-effort, write-all)
    #[arg(long, value_name = "POLICY")]
    pub write_policy: Option<String>,

    /// Do not copy the invoking terminal's size onto the PTY
    #[arg(long)]
    pub no_window_size: bool,

    /// Write logs to this file instead of stderr (stderr is in raw mode while relaying)
    #[arg(long, value_name = "FILE")]
    pub log_file: Option<PathBuf>,
}

/// Relay configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Shell program (None = /bin/sh)
    #[serde(default)]
    pub shell: Option<String>,

    /// Extra arguments passed to the shell after argv[0]
    #[serde(default)]
    pub shell_args: Vec<String>,

    /// Short-write handling
    #[serde(default)]
    pub write_policy: WritePolicy,

    /// Copy the invoking terminal's size onto the PTY before relaying
    #[serde(default = "default_true")]
    pub inherit_window_size: bool,

    /// How long to wait for the shell to exit after hang-up before killing it
    #[serde(default = "default_hangup_grace_ms")]
    pub hangup_grace_ms: u64,

    /// Log destination (None = stderr)
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}
fn default_hangup_grace_ms() -> u64 {
    500
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shell: None,
            shell_args: Vec::new(),
            write_policy: WritePolicy::default(),
            inherit_window_size: true,
            hangup_grace_ms: default_hangup_grace_ms(),
            log_file: None,
        }
    }
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub message: String,
    pub field: Option<String>,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(field) = &self.field {
            write!(f, "Config error in '{}': {}", field, self.message)
        } else {
            write!(f, "Config error: {}", self.message)
        }
    }
}

impl std::error::Error for ConfigError {}

impl ConfigError {
    fn new(message: impl Into<String>, field: Option<&str>) -> Self {
        Self {
            message: message.into(),
            field: field.map(str::to_string),
        }
    }
}

impl Config {
    /// Load configuration with full precedence
    ///
    /// Problems that fall back to a default instead of failing are returned
    /// as warnings, for the caller to log once logging is set up.
    pub fn load_with_args(args: &CliArgs) -> Result<(Self, Vec<String>), ConfigError> {
        let mut warnings = Vec::new();

        let mut config = match &args.config {
            // An explicitly requested file has to load
            Some(path) => Self::load_from_file(path)?,
            None => Self::default_config_path()
                .filter(|path| path.exists())
                .map(|path| Self::load_or_default(&path, &mut warnings))
                .unwrap_or_default(),
        };

        config.apply_env_vars(&mut warnings);
        config.apply_cli_args(args, &mut warnings);
        config.validate()?;

        Ok((config, warnings))
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::new(format!("Failed to read config file: {}", e), None))?;

        toml::from_str(&content)
            .map_err(|e| ConfigError::new(format!("Failed to parse config file: {}", e), None))
    }

    fn load_or_default(path: &Path, warnings: &mut Vec<String>) -> Self {
        Self::load_from_file(path).unwrap_or_else(|e| {
            warnings.push(format!("Failed to load config from {:?}: {}", path, e));
            Config::default()
        })
    }

    /// Apply environment variables to config
    fn apply_env_vars(&mut self, warnings: &mut Vec<String>) {
        if let Ok(val) = env::var("PTY_RELAY_SHELL") {
            self.shell = Some(val);
        }
        if let Ok(val) = env::var("PTY_RELAY_WRITE_POLICY") {
            match WritePolicy::from_name(&val) {
                Some(policy) => self.write_policy = policy,
                None => warnings.push(format!("Ignoring unknown PTY_RELAY_WRITE_POLICY {:?}", val)),
            }
        }
        if let Ok(val) = env::var("PTY_RELAY_LOG_FILE") {
            self.log_file = Some(PathBuf::from(val));
        }
    }

    fn apply_cli_args(&mut self, args: &CliArgs, warnings: &mut Vec<String>) {
        if let Some(shell) = &args.shell {
            self.shell = Some(shell.clone());
        }
        if let Some(name) = &args.write_policy {
            match WritePolicy::from_name(name) {
                Some(policy) => self.write_policy = policy,
                None => warnings.push(format!("Ignoring unknown --write-policy {:?}", name)),
            }
        }
        if args.no_window_size {
            self.inherit_window_size = false;
        }
        if let Some(path) = &args.log_file {
            self.log_file = Some(path.clone());
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(shell) = &self.shell {
            if shell.trim().is_empty() {
                return Err(ConfigError::new("Shell must not be empty", Some("shell")));
            }
        }

        if self.hangup_grace_ms > MAX_HANGUP_GRACE_MS {
            return Err(ConfigError::new(
                format!("Hang-up grace period must be at most {} ms", MAX_HANGUP_GRACE_MS),
                Some("hangup_grace_ms"),
            ));
        }

        Ok(())
    }

    /// The shell program to run
    pub fn shell_program(&self) -> &str {
        self.shell.as_deref().unwrap_or(DEFAULT_SHELL)
    }

    /// The command the child will exec
    pub fn shell_command(&self) -> SetupResult<ShellCommand> {
        ShellCommand::new(self.shell_program())?.args(&self.shell_args)
    }

    pub fn hangup_grace(&self) -> Duration {
        Duration::from_millis(self.hangup_grace_ms)
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("pty-relay").join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        file.write_all(content.as_bytes()).expect("Failed to write config");
        file
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.shell_program(), "/bin/sh");
        assert!(config.shell_args.is_empty());
        assert_eq!(config.write_policy, WritePolicy::BestEffort);
        assert!(config.inherit_window_size);
        assert_eq!(config.hangup_grace(), Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let file = write_config(
            r#"
shell = "/bin/bash"
shell_args = ["--norc"]
write_policy = "write-all"
inherit_window_size = false
hangup_grace_ms = 1500
"#,
        );

        let config = Config::load_from_file(file.path()).expect("Failed to load config");
        assert_eq!(config.shell.as_deref(), Some("/bin/bash"));
        assert_eq!(config.shell_args, vec!["--norc".to_string()]);
        assert_eq!(config.write_policy, WritePolicy::WriteAll);
        assert!(!config.inherit_window_size);
        assert_eq!(config.hangup_grace_ms, 1500);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let file = write_config("shell = \"/bin/dash\"\n");
        let config = Config::load_from_file(file.path()).expect("Failed to load config");
        assert_eq!(config.shell_program(), "/bin/dash");
        assert!(config.inherit_window_size);
        assert_eq!(config.hangup_grace_ms, 500);
    }

    #[test]
    fn test_invalid_file() {
        let file = write_config("write_policy = \"lossless\"\n");
        let err = Config::load_from_file(file.path()).unwrap_err();
        assert!(err.message.contains("Failed to parse config file"));
        assert!(err.field.is_none());
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let args = CliArgs {
            config: Some(dir.path().join("missing.toml")),
            ..CliArgs::default()
        };
        assert!(Config::load_with_args(&args).is_err());
    }

    #[test]
    fn test_cli_overrides_file() {
        let file = write_config("shell = \"/bin/bash\"\nwrite_policy = \"write-all\"\n");
        let args = CliArgs {
            config: Some(file.path().to_path_buf()),
            shell: Some("/bin/sh".to_string()),
            write_policy: Some("best-effort".to_string()),
            no_window_size: true,
            log_file: Some(PathBuf::from("/tmp/pty-relay.log")),
        };

        let mut config = Config::load_from_file(file.path()).expect("Failed to load config");
        let mut warnings = Vec::new();
        config.apply_cli_args(&args, &mut warnings);
        assert!(warnings.is_empty());
        assert_eq!(config.shell_program(), "/bin/sh");
        assert_eq!(config.write_policy, WritePolicy::BestEffort);
        assert!(!config.inherit_window_size);
        assert_eq!(config.log_file, Some(PathBuf::from("/tmp/pty-relay.log")));
    }

    #[test]
    fn test_unknown_cli_policy_keeps_current() {
        let mut config = Config {
            write_policy: WritePolicy::WriteAll,
            ..Config::default()
        };
        let mut warnings = Vec::new();
        config.apply_cli_args(
            &CliArgs {
                write_policy: Some("sometimes".to_string()),
                ..CliArgs::default()
            },
            &mut warnings,
        );
        assert_eq!(config.write_policy, WritePolicy::WriteAll);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("--write-policy"));
        assert!(warnings[0].contains("sometimes"));
    }

    #[test]
    fn test_load_with_args_returns_warnings() {
        let file = write_config("shell = \"/bin/sh\"\n");
        let args = CliArgs {
            config: Some(file.path().to_path_buf()),
            write_policy: Some("bogus".to_string()),
            ..CliArgs::default()
        };

        let (config, warnings) = Config::load_with_args(&args).expect("Failed to load config");
        assert_eq!(config.shell_program(), "/bin/sh");
        assert!(warnings.iter().any(|w| w.contains("Ignoring unknown --write-policy")));
    }

    #[test]
    fn test_unloadable_default_file_warns() {
        let file = write_config("shell = 5\n");
        let mut warnings = Vec::new();

        let config = Config::load_or_default(file.path(), &mut warnings);
        assert_eq!(config, Config::default());
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].starts_with("Failed to load config from"));
    }

    #[test]
    fn test_valid_default_file_does_not_warn() {
        let file = write_config("shell = \"/bin/dash\"\n");
        let mut warnings = Vec::new();

        let config = Config::load_or_default(file.path(), &mut warnings);
        assert_eq!(config.shell_program(), "/bin/dash");
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.shell = Some("  ".to_string());
        let err = config.validate().unwrap_err();
        assert_eq!(err.field.as_deref(), Some("shell"));
        config.shell = None;

        config.hangup_grace_ms = MAX_HANGUP_GRACE_MS + 1;
        let err = config.validate().unwrap_err();
        assert_eq!(err.field.as_deref(), Some("hangup_grace_ms"));
        assert!(err.to_string().starts_with("Config error in 'hangup_grace_ms'"));
    }

    #[test]
    fn test_shell_command() {
        let config = Config {
            shell: Some("/bin/bash".to_string()),
            shell_args: vec!["-i".to_string()],
            ..Config::default()
        };
        let shell = config.shell_command().expect("Failed to build shell command");
        assert_eq!(shell.program(), c"/bin/bash");
        assert_eq!(shell.argv().len(), 2);
    }

    #[test]
    fn test_log_file_help_mentions_raw_mode() {
        use clap::CommandFactory;

        let command = CliArgs::command();
        let help = command
            .get_arguments()
            .find(|arg| arg.get_id() == "log_file")
            .and_then(|arg| arg.get_help())
            .map(|help| help.to_string())
            .expect("--log-file has no help");
        assert!(help.contains("raw mode"), "{}", help);
    }

    #[test]
    fn test_cli_parsing() {
        let args = CliArgs::parse_from([
            "pty-relay",
            "--shell",
            "/bin/zsh",
            "--write-policy",
            "write-all",
            "--no-window-size",
        ]);
        assert_eq!(args.shell.as_deref(), Some("/bin/zsh"));
        assert_eq!(args.write_policy.as_deref(), Some("write-all"));
        assert!(args.no_window_size);
        assert!(args.config.is_none());
    }
}
