use std::{env, fmt, net::SocketAddr};

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";

const DEFAULT_DATABASE_URL: &str = "sqlite:stamphog.db?mode=rwc";
const DEFAULT_SLACK_API_BASE: &str = "https://slack.com/api/";

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Runtime configuration resolved from environment variables.
///
/// The Slack credentials are optional on purpose: the service starts without
/// them and surfaces a configuration error at the webhook boundary instead,
/// so a misconfigured deploy stays observable rather than crash-looping.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub slack_api_base: String,
    pub slack_signing_secret: Option<String>,
    pub slack_bot_token: Option<String>,
    pub channel_ids: Vec<String>,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;
        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());
        let slack_api_base =
            env::var("SLACK_API_BASE_URL").unwrap_or_else(|_| DEFAULT_SLACK_API_BASE.to_string());

        Ok(Self {
            bind_addr,
            environment,
            database_url,
            slack_api_base,
            slack_signing_secret: non_empty_var("SLACK_SIGNING_SECRET"),
            slack_bot_token: non_empty_var("SLACK_BOT_TOKEN"),
            channel_ids: parse_channel_ids(env::var("CHANNEL_IDS").ok().as_deref()),
        })
    }
}

/// Returns the address the HTTP server should bind to, resolved from
/// `APP_BIND_ADDR` with a loopback default.
pub fn server_bind_address() -> Result<SocketAddr, std::net::AddrParseError> {
    let value = env::var("APP_BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());
    value.parse()
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

/// Splits the comma-separated `CHANNEL_IDS` value into trimmed, non-empty ids.
pub fn parse_channel_ids(raw: Option<&str>) -> Vec<String> {
    raw.map(|value| {
        value
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
        }
    }
}

impl std::error::Error for ConfigError {}
