//! Command-line interface.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use gomote_core::config::{DEFAULT_LISTEN_ADDR, DEFAULT_SSH_ADDR};
use gomote_core::secret::SecretValue;
use gomote_core::telemetry::LogFormat;
use gomote_core::{Mode, ServerSettings};

/// gomote server: RPC and status on one port, plus an SSH front end.
#[derive(Parser, Debug)]
#[command(name = "gomoteserver", version, about)]
pub struct ServerArgs {
    /// Address of the primary listener (RPC + status page).
    #[arg(long, env = "GOMOTE_LISTEN_ADDR", default_value = DEFAULT_LISTEN_ADDR)]
    pub listen_addr: String,

    /// Address the gomote SSH server should listen on.
    #[arg(long, alias = "ssh_addr", env = "GOMOTE_SSH_ADDR", default_value = DEFAULT_SSH_ADDR)]
    pub ssh_addr: String,

    /// Build environment to use. Not required in dev mode or when running
    /// managed with auto-detection.
    #[arg(long, env = "GOMOTE_ENV")]
    pub env: Option<String>,

    /// Run mode. `dev` means localhost development, not the staging
    /// environment, which is still `prod`. Omit to auto-detect.
    #[arg(long, env = "GOMOTE_MODE", value_enum)]
    pub mode: Option<CliMode>,

    /// Environment catalog (YAML). If not specified, searches:
    /// GOMOTE_ENV_CATALOG env, /etc/gomote/environments.yaml, ./environments.yaml
    #[arg(long)]
    pub env_catalog: Option<PathBuf>,

    /// Directory of mounted secret files.
    #[arg(long, env = "GOMOTE_SECRETS_DIR")]
    pub secrets_dir: Option<PathBuf>,

    /// SSH host private key (OpenSSH PEM). Overrides the secrets directory.
    #[arg(long, env = "GOMOTE_SSH_PRIVATE_KEY", hide_env_values = true)]
    pub ssh_private_key: Option<String>,

    /// SSH host public key (authorized_keys line). Overrides the secrets directory.
    #[arg(long, env = "GOMOTE_SSH_PUBLIC_KEY", hide_env_values = true)]
    pub ssh_public_key: Option<String>,

    /// Log output format.
    #[arg(long, env = "GOMOTE_LOG_FORMAT", value_enum, default_value_t = CliLogFormat::Json)]
    pub log_format: CliLogFormat,

    /// Bound on creating the object storage client, in seconds.
    #[arg(long, env = "GOMOTE_STORAGE_TIMEOUT_SECS", default_value_t = 30)]
    pub storage_timeout_secs: u64,

    /// Bound on creating the remote configuration client, in seconds.
    #[arg(long, env = "GOMOTE_CONFIG_TIMEOUT_SECS", default_value_t = 10)]
    pub config_timeout_secs: u64,
}

/// `--mode` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliMode {
    /// Local development.
    Dev,
    /// Production.
    Prod,
    /// Detect from the runtime substrate.
    Auto,
}

impl From<CliMode> for Mode {
    fn from(mode: CliMode) -> Self {
        match mode {
            CliMode::Dev => Mode::Dev,
            CliMode::Prod => Mode::Prod,
            CliMode::Auto => Mode::Auto,
        }
    }
}

/// `--log-format` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliLogFormat {
    /// JSON lines.
    Json,
    /// Human-readable lines.
    Compact,
}

impl From<CliLogFormat> for LogFormat {
    fn from(format: CliLogFormat) -> Self {
        match format {
            CliLogFormat::Json => LogFormat::Json,
            CliLogFormat::Compact => LogFormat::Compact,
        }
    }
}

impl ServerArgs {
    /// Convert parsed flags into settings.
    #[must_use]
    pub fn into_settings(self) -> ServerSettings {
        ServerSettings {
            listen_addr: self.listen_addr,
            ssh_addr: self.ssh_addr,
            env_name: self.env.filter(|e| !e.trim().is_empty()),
            mode: self.mode.map(Mode::from).unwrap_or_default(),
            env_catalog: self.env_catalog,
            secrets_dir: self.secrets_dir,
            ssh_private_key: self.ssh_private_key.map(SecretValue::from),
            ssh_public_key: self.ssh_public_key.map(SecretValue::from),
            storage_timeout: Duration::from_secs(self.storage_timeout_secs),
            config_timeout: Duration::from_secs(self.config_timeout_secs),
            log_format: self.log_format.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(args: &[&str]) -> ServerSettings {
        let mut argv = vec!["gomoteserver"];
        argv.extend_from_slice(args);
        ServerArgs::try_parse_from(argv).unwrap().into_settings()
    }

    #[test]
    fn test_cli_is_well_formed() {
        ServerArgs::command().debug_assert();
    }

    #[test]
    #[serial_test::serial]
    fn test_defaults() {
        let settings = parse(&[]);
        assert_eq!(settings.listen_addr, ":8080");
        assert_eq!(settings.ssh_addr, ":2222");
        assert_eq!(settings.mode, Mode::Auto);
        assert!(settings.env_name.is_none());
        assert_eq!(settings.storage_timeout, Duration::from_secs(30));
        assert_eq!(settings.config_timeout, Duration::from_secs(10));
        assert_eq!(settings.log_format, LogFormat::Json);
    }

    #[test]
    #[serial_test::serial]
    fn test_flags() {
        let settings = parse(&[
            "--mode",
            "dev",
            "--env",
            "staging",
            "--ssh_addr",
            "127.0.0.1:2022",
            "--log-format",
            "compact",
            "--ssh-private-key",
            "private",
            "--config-timeout-secs",
            "3",
        ]);
        assert_eq!(settings.mode, Mode::Dev);
        assert_eq!(settings.explicit_env(), Some("staging"));
        assert_eq!(settings.ssh_addr, "127.0.0.1:2022");
        assert_eq!(settings.log_format, LogFormat::Compact);
        assert_eq!(settings.ssh_private_key.unwrap().expose(), "private");
        assert!(settings.ssh_public_key.is_none());
        assert_eq!(settings.config_timeout, Duration::from_secs(3));
    }

    #[test]
    #[serial_test::serial]
    fn test_env_fallback() {
        // SAFETY: serialised with every other test reading the environment.
        unsafe {
            std::env::set_var("GOMOTE_MODE", "prod");
            std::env::set_var("GOMOTE_SSH_ADDR", ":2223");
        }
        let settings = parse(&[]);
        unsafe {
            std::env::remove_var("GOMOTE_MODE");
            std::env::remove_var("GOMOTE_SSH_ADDR");
        }
        assert_eq!(settings.mode, Mode::Prod);
        assert_eq!(settings.ssh_addr, ":2223");
    }

    #[test]
    fn test_rejects_unknown_mode() {
        assert!(ServerArgs::try_parse_from(["gomoteserver", "--mode", "staging"]).is_err());
    }
}
