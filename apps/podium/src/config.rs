use std::env;
use std::time::Duration;
use url::Url;

/// Fixed per build, not runtime-negotiated.
pub const RECONNECT_ATTEMPTS: u32 = 5;
pub const RECONNECT_DELAY: Duration = Duration::from_millis(1000);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

const DEV_SERVER: &str = "ws://127.0.0.1:8080/ws";
const STAGING_SERVER: &str = "wss://quiz-staging.podium.app/ws";
const PRODUCTION_SERVER: &str = "wss://quiz.podium.app/ws";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployEnv {
    Development,
    Staging,
    Production,
}

impl DeployEnv {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Some(Self::Development),
            "staging" => Some(Self::Staging),
            "production" | "prod" => Some(Self::Production),
            _ => None,
        }
    }

    fn default_server(self) -> &'static str {
        match self {
            Self::Development => DEV_SERVER,
            Self::Staging => STAGING_SERVER,
            Self::Production => PRODUCTION_SERVER,
        }
    }
}

/// Podium client configuration, resolved from the environment once at
/// startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub session_server: Url,
    pub deploy_env: DeployEnv,
}

impl Config {
    /// `PODIUM_ENV` picks the deployment default; `PODIUM_SESSION_SERVER`
    /// overrides the server address outright.
    pub fn from_env() -> Result<Self, ConfigError> {
        let deploy_env = env::var("PODIUM_ENV")
            .ok()
            .as_deref()
            .and_then(DeployEnv::parse)
            .unwrap_or(DeployEnv::Development);
        let raw = env::var("PODIUM_SESSION_SERVER")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| deploy_env.default_server().to_string());
        let session_server = parse_server_url(&raw)?;
        Ok(Self {
            session_server,
            deploy_env,
        })
    }

    pub fn with_server(mut self, raw: &str) -> Result<Self, ConfigError> {
        self.session_server = parse_server_url(raw)?;
        Ok(self)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            session_server: Url::parse(DEV_SERVER).expect("default server url is valid"),
            deploy_env: DeployEnv::Development,
        }
    }
}

fn parse_server_url(raw: &str) -> Result<Url, ConfigError> {
    let mut base = raw.trim().to_string();
    if base.is_empty() {
        return Err(ConfigError::Empty);
    }
    if !base.contains("://") {
        // Bare host:port gets a scheme inferred the way people type it:
        // plain ws for local addresses, wss otherwise.
        let scheme = if base.starts_with("localhost") || base.starts_with("127.") {
            "ws://"
        } else {
            "wss://"
        };
        base = format!("{scheme}{base}");
    }
    let url = Url::parse(&base).map_err(|err| ConfigError::Invalid {
        raw: raw.to_string(),
        reason: err.to_string(),
    })?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(ConfigError::Invalid {
            raw: raw.to_string(),
            reason: format!("unsupported scheme '{other}'"),
        }),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("session server address cannot be empty")]
    Empty,
    #[error("invalid session server address '{raw}': {reason}")]
    Invalid { raw: String, reason: String },
}
