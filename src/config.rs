use serde::{Deserialize, Serialize};
use anyhow::Result;
use std::{
    collections::HashMap,
    fmt, fs,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
    time::Duration,
};

use crate::error::MailError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Smtp,
    Imap,
    Pop3,
}

impl Protocol {
    fn env_prefix(self) -> &'static str {
        match self {
            Protocol::Smtp => "SMTP",
            Protocol::Imap => "IMAP",
            Protocol::Pop3 => "POP3",
        }
    }

    pub fn default_port(self, secure: bool) -> u16 {
        match (self, secure) {
            (Protocol::Smtp, true) => 465,
            (Protocol::Smtp, false) => 587,
            (Protocol::Imap, true) => 993,
            (Protocol::Imap, false) => 143,
            (Protocol::Pop3, true) => 995,
            (Protocol::Pop3, false) => 110,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.env_prefix())
    }
}

/// Per-protocol overrides. Anything left `None` is filled from the defaults provider.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub secure: Option<bool>,
}

/// A fully resolved endpoint. One of these is consumed by each session.
#[derive(Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub secure: bool,
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("secure", &self.secure)
            .finish()
    }
}

/// Source of process-wide fallback values.
pub trait DefaultProvider: Send + Sync {
    fn var(&self, key: &str) -> Option<String>;
}

/// Reads fallbacks from the process environment (`IMAP_HOST`, `EMAIL_USER`, ...).
#[derive(Clone, Copy, Debug, Default)]
pub struct EnvDefaults;

impl DefaultProvider for EnvDefaults {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.is_empty())
    }
}

impl DefaultProvider for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// Credentials are often pasted with line breaks in them.
pub fn strip_whitespace(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

impl ServerSettings {
    pub fn resolve(&self, protocol: Protocol, defaults: &dyn DefaultProvider) -> Result<ServerConfig, MailError> {
        let prefix = protocol.env_prefix();

        let host = self
            .host
            .clone()
            .filter(|h| !h.trim().is_empty())
            .or_else(|| defaults.var(&format!("{prefix}_HOST")))
            .map(|h| h.trim().to_string())
            .ok_or_else(|| MailError::Config(format!("no {protocol} host configured")))?;

        let secure = match self.secure {
            Some(s) => s,
            None => defaults
                .var(&format!("{prefix}_SECURE"))
                .map(|v| v.trim() == "true")
                .unwrap_or(false),
        };

        let port = match self.port {
            Some(p) => p,
            None => match defaults.var(&format!("{prefix}_PORT")) {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .map_err(|_| MailError::Config(format!("invalid {prefix}_PORT: {raw:?}")))?,
                None => protocol.default_port(secure),
            },
        };

        let user = self
            .user
            .clone()
            .filter(|u| !u.trim().is_empty())
            .or_else(|| defaults.var("EMAIL_USER"))
            .unwrap_or_default();
        let password = self
            .password
            .as_deref()
            .map(strip_whitespace)
            .filter(|p| !p.is_empty())
            .or_else(|| defaults.var("EMAIL_PASSWORD").map(|p| strip_whitespace(&p)))
            .unwrap_or_default();

        Ok(ServerConfig { host, port, user, password, secure })
    }
}

/// Shared, replaceable settings for one protocol.
///
/// Operations call [`SettingsHandle::resolve`] once when they open a session, so
/// a `configure` that lands mid-operation only affects the next one.
#[derive(Clone)]
pub struct SettingsHandle {
    protocol: Protocol,
    overrides: Arc<RwLock<ServerSettings>>,
    defaults: Arc<dyn DefaultProvider>,
}

impl SettingsHandle {
    pub fn new(protocol: Protocol, settings: ServerSettings, defaults: Arc<dyn DefaultProvider>) -> Self {
        Self {
            protocol,
            overrides: Arc::new(RwLock::new(settings)),
            defaults,
        }
    }

    pub fn configure(&self, settings: ServerSettings) {
        let mut guard = self.overrides.write().unwrap_or_else(|e| e.into_inner());
        *guard = settings;
    }

    pub fn current(&self) -> ServerSettings {
        self.overrides.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn resolve(&self) -> Result<ServerConfig, MailError> {
        self.current().resolve(self.protocol, self.defaults.as_ref())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub auth: Duration,
    /// Whole fetch+parse pipeline of a listing or search.
    pub fetch: Duration,
    /// Single flag/delete/info style commands.
    pub command: Duration,
    pub submit: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            auth: Duration::from_secs(10),
            fetch: Duration::from_secs(30),
            command: Duration::from_secs(15),
            submit: Duration::from_secs(30),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub smtp: ServerSettings,
    pub imap: ServerSettings,
    pub pop3: ServerSettings,
}

impl Config {
    pub fn path() -> Result<PathBuf> {
        let dir = dirs::config_dir().ok_or_else(|| anyhow::anyhow!("no config dir"))?;
        Ok(dir.join("mailbridge").join("config.toml"))
    }

    pub fn load_or_create(path: Option<&Path>) -> Result<(Self, bool, PathBuf)> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::path()?,
        };
        if !path.exists() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, DEFAULT_CONFIG)?;
            let cfg: Self = toml::from_str(DEFAULT_CONFIG)?;
            return Ok((cfg, true, path));
        }

        let data = fs::read_to_string(&path)?;
        let cfg = toml::from_str(&data)?;
        Ok((cfg, false, path))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let toml = toml::to_string_pretty(self)?;
        fs::write(path, toml)?;
        Ok(())
    }
}

// Every key is optional; unset keys fall back to EMAIL_USER, EMAIL_PASSWORD,
// <PROTO>_HOST, <PROTO>_PORT and <PROTO>_SECURE.
const DEFAULT_CONFIG: &str = r#"
[smtp]
# host = "smtp.example.com"
# port = 465
# secure = true

[imap]
# host = "imap.example.com"
# port = 993
# secure = true

[pop3]
# host = "pop.example.com"
# port = 995
# secure = true
"#;
