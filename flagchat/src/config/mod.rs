//! Configuration system for the Flag chat client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/flagchat/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use flagchat_proto::ids::UserId;
use url::Url;

use crate::chat::history::DEFAULT_HISTORY_LIMIT;
use crate::chat::merge::{DEFAULT_DEDUP_WINDOW, SelfEchoPolicy};
use crate::conversation::{ConversationIdentity, Credentials, UserProfile};
use crate::net::{DEFAULT_EVENT_BUFFER, ReconnectConfig};
use crate::session::SessionConfig;

/// Errors that can occur when loading configuration.
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

    /// A required setting has no value in any layer.
    #[error("missing required setting `{0}`")]
    Missing(&'static str),

    /// A setting has a value that cannot be used.
    #[error("invalid value for `{field}`: {reason}")]
    Invalid {
        /// Setting name as written in the config file.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    server: ServerFileConfig,
    auth: AuthFileConfig,
    chat: ChatFileConfig,
    reconnect: ReconnectFileConfig,
    http: HttpFileConfig,
}

/// `[server]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    api_url: Option<String>,
    ws_url: Option<String>,
}

/// `[auth]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct AuthFileConfig {
    token: Option<String>,
    user_id: Option<u64>,
    user_name: Option<String>,
    avatar: Option<String>,
}

/// `[chat]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ChatFileConfig {
    history_limit: Option<usize>,
    dedup_window_ms: Option<u64>,
    self_echo_policy: Option<String>,
    event_buffer: Option<usize>,
}

/// `[reconnect]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReconnectFileConfig {
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    max_attempts: Option<u32>,
    open_timeout_secs: Option<u64>,
}

/// `[http]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct HttpFileConfig {
    request_timeout_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Server --
    /// Base URL of the history endpoints.
    pub api_url: String,
    /// Base URL of the live endpoints.
    pub ws_url: String,

    // -- Auth --
    /// Bearer token.
    pub token: Option<String>,
    /// The viewing user's id.
    pub user_id: Option<u64>,
    /// The viewing user's display name (defaults to the id).
    pub user_name: Option<String>,
    /// The viewing user's avatar URL.
    pub avatar: String,

    // -- Chat --
    /// History page size.
    pub history_limit: usize,
    /// Dedup time bucket width.
    pub dedup_window: Duration,
    /// Self-echo handling.
    pub self_echo: SelfEchoPolicy,
    /// Connection event channel capacity.
    pub event_buffer: usize,

    // -- Reconnect --
    /// Reconnect policy.
    pub reconnect: ReconnectConfig,

    // -- HTTP --
    /// Timeout of one history request.
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:9000".to_string(),
            ws_url: "ws://127.0.0.1:9000".to_string(),
            token: None,
            user_id: None,
            user_name: None,
            avatar: String::new(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            dedup_window: DEFAULT_DEDUP_WINDOW,
            self_echo: SelfEchoPolicy::default(),
            event_buffer: DEFAULT_EVENT_BUFFER,
            reconnect: ReconnectConfig::default(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// CLI args and env vars are parsed via `clap`. If `--config` is given
    /// and the file does not exist, returns an error. If no `--config` is
    /// given, the default path (`~/.config/flagchat/config.toml`) is tried
    /// and silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed,
    /// or if a setting has an unusable value.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Self::resolve(cli, &file)
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default. Separated from `load()` to enable
    /// unit testing without CLI parsing.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let self_echo = match file.chat.self_echo_policy.as_deref() {
            Some(name) => name.parse().map_err(|reason| ConfigError::Invalid {
                field: "chat.self_echo_policy",
                reason,
            })?,
            None => defaults.self_echo,
        };

        let reconnect = ReconnectConfig {
            base_delay: file
                .reconnect
                .base_delay_ms
                .map_or(defaults.reconnect.base_delay, Duration::from_millis),
            max_delay: file
                .reconnect
                .max_delay_ms
                .map_or(defaults.reconnect.max_delay, Duration::from_millis),
            max_attempts: file
                .reconnect
                .max_attempts
                .unwrap_or(defaults.reconnect.max_attempts),
            open_timeout: file
                .reconnect
                .open_timeout_secs
                .map_or(defaults.reconnect.open_timeout, Duration::from_secs),
        };
        if reconnect.base_delay > reconnect.max_delay {
            return Err(ConfigError::Invalid {
                field: "reconnect.base_delay_ms",
                reason: "must not exceed reconnect.max_delay_ms".to_string(),
            });
        }
        if reconnect.open_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "reconnect.open_timeout_secs",
                reason: "must be positive".to_string(),
            });
        }

        Ok(Self {
            api_url: cli
                .api_url
                .clone()
                .or_else(|| file.server.api_url.clone())
                .unwrap_or(defaults.api_url),
            ws_url: cli
                .ws_url
                .clone()
                .or_else(|| file.server.ws_url.clone())
                .unwrap_or(defaults.ws_url),
            token: cli.token.clone().or_else(|| file.auth.token.clone()),
            user_id: cli.user_id.or(file.auth.user_id),
            user_name: cli
                .user_name
                .clone()
                .or_else(|| file.auth.user_name.clone()),
            avatar: cli
                .avatar
                .clone()
                .or_else(|| file.auth.avatar.clone())
                .unwrap_or(defaults.avatar),
            history_limit: cli
                .history_limit
                .or(file.chat.history_limit)
                .unwrap_or(defaults.history_limit),
            dedup_window: file
                .chat
                .dedup_window_ms
                .map_or(defaults.dedup_window, Duration::from_millis),
            self_echo,
            event_buffer: file.chat.event_buffer.unwrap_or(defaults.event_buffer),
            reconnect,
            request_timeout: file
                .http
                .request_timeout_secs
                .map_or(defaults.request_timeout, Duration::from_secs),
        })
    }

    /// The viewing user's profile.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Missing`] without a user id, [`ConfigError::Invalid`]
    /// if the id is zero.
    pub fn profile(&self) -> Result<UserProfile, ConfigError> {
        let id = self.user_id.ok_or(ConfigError::Missing("auth.user_id"))?;
        if id == 0 {
            return Err(ConfigError::Invalid {
                field: "auth.user_id",
                reason: "must be non-zero".to_string(),
            });
        }
        Ok(UserProfile {
            id: UserId::new(id),
            name: self.user_name.clone().unwrap_or_else(|| id.to_string()),
            avatar: self.avatar.clone(),
        })
    }

    /// The bearer token.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Missing`] if no token is configured.
    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        self.token
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(Credentials::new)
            .ok_or(ConfigError::Missing("auth.token"))
    }

    /// Parsed history base URL.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] if the URL does not parse.
    pub fn api_base(&self) -> Result<Url, ConfigError> {
        parse_url("server.api_url", &self.api_url, &["http", "https"])
    }

    /// Build the [`SessionConfig`] for mounting conversations.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the live URL, token, or user id is missing
    /// or invalid.
    pub fn session_config(&self) -> Result<SessionConfig, ConfigError> {
        Ok(SessionConfig {
            ws_url: parse_url("server.ws_url", &self.ws_url, &["ws", "wss"])?,
            credentials: self.credentials()?,
            profile: self.profile()?,
            dedup_window: self.dedup_window,
            self_echo: self.self_echo,
            reconnect: self.reconnect,
            event_buffer: self.event_buffer,
        })
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Terminal client for Flag chat rooms and direct messages")]
pub struct CliArgs {
    /// Base URL of the history API.
    #[arg(long, env = "FLAGCHAT_API_URL")]
    pub api_url: Option<String>,

    /// Base URL of the live WebSocket endpoints.
    #[arg(long, env = "FLAGCHAT_WS_URL")]
    pub ws_url: Option<String>,

    /// Bearer token.
    #[arg(long, env = "FLAGCHAT_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Your numeric user id.
    #[arg(long, env = "FLAGCHAT_USER_ID")]
    pub user_id: Option<u64>,

    /// Your display name.
    #[arg(long)]
    pub user_name: Option<String>,

    /// Your avatar URL.
    #[arg(long)]
    pub avatar: Option<String>,

    /// Join this room.
    #[arg(long, conflicts_with = "peer")]
    pub room: Option<String>,

    /// Chat privately with this user id.
    #[arg(long)]
    pub peer: Option<u64>,

    /// Number of history messages to load.
    #[arg(long)]
    pub history_limit: Option<usize>,

    /// Path to config file (default: `~/.config/flagchat/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "FLAGCHAT_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/flagchat.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

impl CliArgs {
    /// The conversation selected on the command line.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Missing`] if neither `--room` nor `--peer` is given.
    pub fn identity(&self, profile: &UserProfile) -> Result<ConversationIdentity, ConfigError> {
        match (&self.room, self.peer) {
            (Some(room), _) => Ok(ConversationIdentity::room(room.clone())),
            (None, Some(peer)) => parse_peer(&peer.to_string(), profile),
            (None, None) => Err(ConfigError::Missing("--room or --peer")),
        }
    }
}

/// Parse a peer id typed by the user into a direct conversation.
///
/// # Errors
///
/// [`ConfigError::Invalid`] if `text` is not a non-zero id other than the
/// viewing user's own.
pub fn parse_peer(text: &str, profile: &UserProfile) -> Result<ConversationIdentity, ConfigError> {
    let peer: UserId = text.trim().parse().map_err(|_| ConfigError::Invalid {
        field: "peer",
        reason: format!("{text:?} is not a user id"),
    })?;
    if peer.is_broadcast() || peer == profile.id {
        return Err(ConfigError::Invalid {
            field: "peer",
            reason: format!("cannot open a direct chat with {peer}"),
        });
    }
    Ok(ConversationIdentity::direct(profile.id, peer))
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn parse_url(field: &'static str, value: &str, schemes: &[&str]) -> Result<Url, ConfigError> {
    let url = Url::parse(value).map_err(|e| ConfigError::Invalid {
        field,
        reason: e.to_string(),
    })?;
    if !schemes.contains(&url.scheme()) {
        return Err(ConfigError::Invalid {
            field,
            reason: format!("scheme must be one of {schemes:?}"),
        });
    }
    Ok(url)
}

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            // No config dir available, use defaults.
            return Ok(ConfigFile::default());
        };
        config_dir.join("flagchat").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
