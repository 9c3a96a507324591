//! # Gateway Configuration
//!
//! Layered configuration for the gateway process.
//!
//! ## Load Priority (highest wins)
//!
//! ```text
//! 1. Environment variables     (DATABASE_URL, PORT, TAILGATE_*)
//! 2. tailgate.toml [gateway]   (explicit path or search paths)
//! 3. Compiled defaults
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | TOML Key | Default |
//! |----------|----------|---------|
//! | `TAILSCALE_AUTHKEY` | (env only) | unset |
//! | `DATABASE_URL` | `database_url` | unset, required |
//! | `PORT` | `public_port` | unset, required |
//! | `TAILGATE_PROXY_PORT` | `proxy_port` | 3001 |
//! | `TAILGATE_BACKEND_URL` | `backend_url` | `http://localhost:3000/` |
//! | `TAILGATE_HOSTNAME` | `hostname` | `grafana-server` |
//! | `TAILGATE_STATE_FILE` | `state_file` | `/app/ts.state` |
//! | `TAILGATE_SOCKET` | `socket_path` | `/app/ts.sock` |
//! | `TAILGATE_TAILSCALED_BIN` | `tailscaled_bin` | `/app/tailscaled` |
//! | `TAILGATE_TAILSCALE_BIN` | `tailscale_bin` | `/app/tailscale` |
//! | `TAILGATE_TUN_MODE` | `tun_mode` | `userspace-networking` |
//! | `TAILGATE_STATE_RETENTION` | `state_retention` | 5 |
//! | `TAILGATE_READINESS_TIMEOUT_MS` | `readiness_timeout_ms` | 15000 |
//! | `TAILGATE_LOCAL_API_TIMEOUT_MS` | `local_api_timeout_ms` | 5000 |
//! | `TAILGATE_DAEMON_MAX_RESTARTS` | `daemon_max_restarts` | 3 |
//!
//! The auth key is read from the environment only; it is never accepted
//! from a file that might be committed.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::state::JoinCredential;
use crate::store::DEFAULT_STATE_RETENTION;

// ════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ════════════════════════════════════════════════════════════════════════════

/// Search paths tried in order when no explicit path is given.
pub const CONFIG_SEARCH_PATHS: &[&str] = &["tailgate.toml", "/etc/tailgate/tailgate.toml"];

pub const DEFAULT_PROXY_PORT: u16 = 3001;
pub const DEFAULT_BACKEND_URL: &str = "http://localhost:3000/";
pub const DEFAULT_HOSTNAME: &str = "grafana-server";
pub const DEFAULT_STATE_FILE: &str = "/app/ts.state";
pub const DEFAULT_SOCKET_PATH: &str = "/app/ts.sock";
pub const DEFAULT_TAILSCALED_BIN: &str = "/app/tailscaled";
pub const DEFAULT_TAILSCALE_BIN: &str = "/app/tailscale";
pub const DEFAULT_TUN_MODE: &str = "userspace-networking";
pub const DEFAULT_READINESS_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_LOCAL_API_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_DAEMON_MAX_RESTARTS: u32 = 3;

// ════════════════════════════════════════════════════════════════════════════
// ERROR TYPE
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to load env file {path:?}: {source}")]
    EnvFile {
        path: PathBuf,
        #[source]
        source: dotenvy::Error,
    },

    #[error("invalid value for {var}: {value:?}")]
    Env { var: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ════════════════════════════════════════════════════════════════════════════
// TOML SECTION
// ════════════════════════════════════════════════════════════════════════════

/// The `[gateway]` section of `tailgate.toml`. Every field is optional so
/// partial files fall through to env vars and defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayToml {
    pub database_url: Option<String>,
    pub public_port: Option<u16>,
    pub proxy_port: Option<u16>,
    pub backend_url: Option<String>,
    pub hostname: Option<String>,
    pub state_file: Option<PathBuf>,
    pub socket_path: Option<PathBuf>,
    pub tailscaled_bin: Option<PathBuf>,
    pub tailscale_bin: Option<PathBuf>,
    pub tun_mode: Option<String>,
    pub state_retention: Option<usize>,
    pub readiness_timeout_ms: Option<u64>,
    pub local_api_timeout_ms: Option<u64>,
    pub daemon_max_restarts: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct TailgateToml {
    gateway: Option<GatewayToml>,
}

// ════════════════════════════════════════════════════════════════════════════
// GATEWAY CONFIG
// ════════════════════════════════════════════════════════════════════════════

/// Complete runtime configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// One-time join secret. Only needed on the very first run.
    pub auth_key: Option<JoinCredential>,
    /// Relational store connection string.
    pub database_url: Option<String>,
    /// Platform-assigned public port for the placeholder responder.
    pub public_port: Option<u16>,
    /// Internal port for the authenticating proxy.
    pub proxy_port: u16,
    /// The protected application.
    pub backend_url: String,
    /// Hostname label passed to the join command.
    pub hostname: String,
    pub state_file: PathBuf,
    pub socket_path: PathBuf,
    pub tailscaled_bin: PathBuf,
    pub tailscale_bin: PathBuf,
    pub tun_mode: String,
    /// History rows kept after each append. `0` keeps everything.
    pub state_retention: usize,
    pub readiness_timeout_ms: u64,
    pub local_api_timeout_ms: u64,
    pub daemon_max_restarts: u32,
    /// Which config file was applied, if any.
    pub loaded_from: Option<PathBuf>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            auth_key: None,
            database_url: None,
            public_port: None,
            proxy_port: DEFAULT_PROXY_PORT,
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            hostname: DEFAULT_HOSTNAME.to_string(),
            state_file: PathBuf::from(DEFAULT_STATE_FILE),
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            tailscaled_bin: PathBuf::from(DEFAULT_TAILSCALED_BIN),
            tailscale_bin: PathBuf::from(DEFAULT_TAILSCALE_BIN),
            tun_mode: DEFAULT_TUN_MODE.to_string(),
            state_retention: DEFAULT_STATE_RETENTION,
            readiness_timeout_ms: DEFAULT_READINESS_TIMEOUT_MS,
            local_api_timeout_ms: DEFAULT_LOCAL_API_TIMEOUT_MS,
            daemon_max_restarts: DEFAULT_DAEMON_MAX_RESTARTS,
            loaded_from: None,
        }
    }
}

impl GatewayConfig {
    // ── PRIMARY ENTRY POINT ────────────────────────────────────────────

    /// Defaults, then the TOML file, then process environment overrides.
    ///
    /// An explicit path (argument or `TAILGATE_CONFIG_FILE`) must exist.
    /// Search-path files are optional.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(path) = Self::locate_file(explicit) {
            let section = Self::read_file(&path)?;
            config.apply_toml(&section);
            config.loaded_from = Some(path);
        }

        config.apply_env(|key| env::var(key).ok())?;
        Ok(config)
    }

    fn locate_file(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        if let Ok(path) = env::var("TAILGATE_CONFIG_FILE") {
            if !path.is_empty() {
                return Some(PathBuf::from(path));
            }
        }
        CONFIG_SEARCH_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
    }

    fn read_file(path: &Path) -> Result<GatewayToml, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse_toml_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parses a TOML document and returns its `[gateway]` section
    /// (empty when the section is absent).
    pub fn parse_toml_str(content: &str) -> Result<GatewayToml, toml::de::Error> {
        let doc: TailgateToml = toml::from_str(content)?;
        Ok(doc.gateway.unwrap_or_default())
    }

    // ── LAYERS ─────────────────────────────────────────────────────────

    /// Applies fields present in the TOML section.
    pub fn apply_toml(&mut self, toml: &GatewayToml) {
        if let Some(ref v) = toml.database_url {
            self.database_url = non_empty(v);
        }
        if let Some(v) = toml.public_port {
            self.public_port = Some(v);
        }
        if let Some(v) = toml.proxy_port {
            self.proxy_port = v;
        }
        if let Some(ref v) = toml.backend_url {
            self.backend_url = v.clone();
        }
        if let Some(ref v) = toml.hostname {
            self.hostname = v.clone();
        }
        if let Some(ref v) = toml.state_file {
            self.state_file = v.clone();
        }
        if let Some(ref v) = toml.socket_path {
            self.socket_path = v.clone();
        }
        if let Some(ref v) = toml.tailscaled_bin {
            self.tailscaled_bin = v.clone();
        }
        if let Some(ref v) = toml.tailscale_bin {
            self.tailscale_bin = v.clone();
        }
        if let Some(ref v) = toml.tun_mode {
            self.tun_mode = v.clone();
        }
        if let Some(v) = toml.state_retention {
            self.state_retention = v;
        }
        if let Some(v) = toml.readiness_timeout_ms {
            self.readiness_timeout_ms = v;
        }
        if let Some(v) = toml.local_api_timeout_ms {
            self.local_api_timeout_ms = v;
        }
        if let Some(v) = toml.daemon_max_restarts {
            self.daemon_max_restarts = v;
        }
    }

    /// Applies environment overrides read through `lookup`.
    ///
    /// Only set, non-empty variables override. A set variable that does not
    /// parse is an error rather than a silent fallback.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("TAILSCALE_AUTHKEY") {
            self.auth_key = JoinCredential::new(v);
        }
        if let Some(v) = get("DATABASE_URL") {
            self.database_url = Some(v);
        }
        if let Some(v) = parse_var(&get, "PORT")? {
            self.public_port = Some(v);
        }
        if let Some(v) = parse_var(&get, "TAILGATE_PROXY_PORT")? {
            self.proxy_port = v;
        }
        if let Some(v) = get("TAILGATE_BACKEND_URL") {
            self.backend_url = v;
        }
        if let Some(v) = get("TAILGATE_HOSTNAME") {
            self.hostname = v;
        }
        if let Some(v) = get("TAILGATE_STATE_FILE") {
            self.state_file = PathBuf::from(v);
        }
        if let Some(v) = get("TAILGATE_SOCKET") {
            self.socket_path = PathBuf::from(v);
        }
        if let Some(v) = get("TAILGATE_TAILSCALED_BIN") {
            self.tailscaled_bin = PathBuf::from(v);
        }
        if let Some(v) = get("TAILGATE_TAILSCALE_BIN") {
            self.tailscale_bin = PathBuf::from(v);
        }
        if let Some(v) = get("TAILGATE_TUN_MODE") {
            self.tun_mode = v;
        }
        if let Some(v) = parse_var(&get, "TAILGATE_STATE_RETENTION")? {
            self.state_retention = v;
        }
        if let Some(v) = parse_var(&get, "TAILGATE_READINESS_TIMEOUT_MS")? {
            self.readiness_timeout_ms = v;
        }
        if let Some(v) = parse_var(&get, "TAILGATE_LOCAL_API_TIMEOUT_MS")? {
            self.local_api_timeout_ms = v;
        }
        if let Some(v) = parse_var(&get, "TAILGATE_DAEMON_MAX_RESTARTS")? {
            self.daemon_max_restarts = v;
        }
        Ok(())
    }

    // ── VALIDATION ─────────────────────────────────────────────────────

    /// Checks everything the process needs before touching the network.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.is_none() {
            return Err(ConfigError::Invalid("DATABASE_URL is not set".to_string()));
        }

        match self.public_port {
            None => {
                return Err(ConfigError::Invalid(
                    "public port (PORT) is not set".to_string(),
                ))
            }
            Some(0) => return Err(ConfigError::Invalid("public port cannot be 0".to_string())),
            Some(p) if p == self.proxy_port => {
                return Err(ConfigError::Invalid(format!(
                    "proxy port {} collides with public port",
                    p
                )))
            }
            Some(_) => {}
        }

        if self.proxy_port == 0 {
            return Err(ConfigError::Invalid("proxy port cannot be 0".to_string()));
        }

        if self.hostname.trim().is_empty() {
            return Err(ConfigError::Invalid("hostname cannot be empty".to_string()));
        }

        let backend = Url::parse(&self.backend_url)
            .map_err(|e| ConfigError::Invalid(format!("backend url: {}", e)))?;
        if backend.scheme() != "http" || backend.host_str().is_none() {
            return Err(ConfigError::Invalid(format!(
                "backend url must be absolute http://, got {}",
                self.backend_url
            )));
        }

        Ok(())
    }

    // ── ACCESSORS ──────────────────────────────────────────────────────

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    pub fn local_api_timeout(&self) -> Duration {
        Duration::from_millis(self.local_api_timeout_ms)
    }

    /// Database URL with any password replaced, for logging.
    pub fn redacted_database_url(&self) -> String {
        self.database_url
            .as_deref()
            .map(redact_url)
            .unwrap_or_else(|| "<unset>".to_string())
    }
}

// ════════════════════════════════════════════════════════════════════════════
// HELPERS
// ════════════════════════════════════════════════════════════════════════════

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

fn parse_var<T, G>(get: &G, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Env { var, value }),
    }
}

/// Replaces the password of a URL with `***`. Unparseable input is fully
/// masked.
pub fn redact_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("***"));
            }
            url.to_string()
        }
        Err(_) => "<unparseable url>".to_string(),
    }
}

/// Loads an env file into the process environment.
///
/// Priority: explicit path, then `TAILGATE_ENV_FILE`, then `.env` if it
/// exists. A named file that cannot be loaded is an error; a broken `.env`
/// only warns. Returns the file that was loaded.
pub fn load_env_file(explicit: Option<&Path>) -> Result<Option<PathBuf>, ConfigError> {
    let named = explicit
        .map(Path::to_path_buf)
        .or_else(|| env::var("TAILGATE_ENV_FILE").ok().map(PathBuf::from));

    if let Some(path) = named {
        return match dotenvy::from_path(&path) {
            Ok(()) => Ok(Some(path)),
            Err(source) => Err(ConfigError::EnvFile { path, source }),
        };
    }

    let dotenv = PathBuf::from(".env");
    if !dotenv.exists() {
        return Ok(None);
    }
    match dotenvy::from_path(&dotenv) {
        Ok(()) => Ok(Some(dotenv)),
        Err(e) => {
            // tracing is not initialised yet
            eprintln!("warning: failed to load {}: {}", dotenv.display(), e);
            Ok(None)
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════
