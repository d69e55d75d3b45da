//! Configuration for the Flag chat development server.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/flagchat-relay/config.toml`)
//! 4. Compiled defaults
//!
//! Members are listed as `[[users]]` tables mapping a bearer token to a user
//! profile. Without any, two demo members (`alice-token`, `bob-token`) are
//! registered so a pair of clients can talk out of the box.

use std::path::PathBuf;

use flagchat_proto::ids::UserId;

use crate::store::DEFAULT_HISTORY_CAP;

/// Errors that can occur when loading server configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// Two members share a token or a user id.
    #[error("duplicate member {0}")]
    DuplicateMember(String),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure for the server.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RelayConfigFile {
    server: ServerFileConfig,
    users: Vec<Member>,
}

/// `[server]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    bind_addr: Option<String>,
    history_cap: Option<usize>,
}

/// A registered chat member, authenticated by its bearer token.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct Member {
    /// Opaque bearer token presented on connect and on history requests.
    pub token: String,
    /// Numeric user id stamped on every message the member sends.
    pub id: UserId,
    /// Display name.
    pub name: String,
    /// Avatar URL.
    #[serde(default)]
    pub avatar: String,
}

impl Member {
    /// Creates a member.
    pub fn new(token: impl Into<String>, id: u64, name: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            id: UserId::new(id),
            name: name.into(),
            avatar: String::new(),
        }
    }
}

/// The members registered when the config names none.
#[must_use]
pub fn demo_members() -> Vec<Member> {
    vec![
        Member::new("alice-token", 1, "alice"),
        Member::new("bob-token", 2, "bob"),
    ]
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the server.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Flag chat development server")]
pub struct RelayCliArgs {
    /// Address to bind the server to.
    #[arg(short, long, env = "RELAY_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/flagchat-relay/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Messages kept per conversation for the history endpoints.
    #[arg(long)]
    pub history_cap: Option<usize>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "RELAY_LOG")]
    pub log_level: String,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind the server to (e.g., `0.0.0.0:9000`).
    pub bind_addr: String,
    /// Messages kept per conversation.
    pub history_cap: usize,
    /// Registered members.
    pub members: Vec<Member>,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9000".to_string(),
            history_cap: DEFAULT_HISTORY_CAP,
            members: demo_members(),
            log_level: "info".to_string(),
        }
    }
}

impl RelayConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path is tried and missing file
    /// is treated as empty config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed, or if two members collide.
    pub fn load(cli: &RelayCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Self::resolve(cli, file)
    }

    /// Resolve a `RelayConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    fn resolve(cli: &RelayCliArgs, file: RelayConfigFile) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let members = if file.users.is_empty() {
            defaults.members
        } else {
            file.users
        };
        check_unique(&members)?;

        Ok(Self {
            bind_addr: cli
                .bind
                .clone()
                .or(file.server.bind_addr)
                .unwrap_or(defaults.bind_addr),
            history_cap: cli
                .history_cap
                .or(file.server.history_cap)
                .unwrap_or(defaults.history_cap),
            members,
            log_level: cli.log_level.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn check_unique(members: &[Member]) -> Result<(), ConfigError> {
    for (i, member) in members.iter().enumerate() {
        let clash = members[..i]
            .iter()
            .any(|m| m.token == member.token || m.id == member.id);
        if clash {
            return Err(ConfigError::DuplicateMember(member.name.clone()));
        }
    }
    Ok(())
}

/// Load and parse a TOML config file for the server.
fn load_config_file(
    explicit_path: Option<&std::path::Path>,
) -> Result<RelayConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(RelayConfigFile::default());
        };
        config_dir.join("flagchat-relay").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RelayConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
