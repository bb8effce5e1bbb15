use parley_core::dedup::DEFAULT_MAX_CACHE_SIZE;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

pub const DEFAULT_NAME: &str = "parley";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8765;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Everything one participant needs to run its server and client legs.
#[derive(Clone, Debug, PartialEq)]
pub struct LinkConfig {
    /// Participant identity stamped into every outgoing message.
    pub name: String,
    pub bind_host: String,
    /// Local listen port. `0` lets the OS choose one.
    pub server_port: u16,
    pub target_host: String,
    /// Peer server to dial; `None` runs in server-only mode.
    pub target_port: Option<u16>,
    /// Give up on an unanswered question after this long. `None` waits forever.
    pub answer_timeout: Option<Duration>,
    pub max_cache_size: usize,
    pub log_level: Level,
}

impl LinkConfig {
    pub fn new(name: impl Into<String>, server_port: u16) -> Self {
        Self {
            name: name.into(),
            bind_host: DEFAULT_HOST.to_string(),
            server_port,
            target_host: DEFAULT_HOST.to_string(),
            target_port: None,
            answer_timeout: None,
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
            log_level: Level::INFO,
        }
    }

    pub fn with_target(mut self, host: impl Into<String>, port: u16) -> Self {
        self.target_host = host.into();
        self.target_port = Some(port);
        self
    }

    pub fn with_bind_host(mut self, host: impl Into<String>) -> Self {
        self.bind_host = host.into();
        self
    }

    pub fn with_answer_timeout(mut self, timeout: Duration) -> Self {
        self.answer_timeout = Some(timeout);
        self
    }

    pub fn with_max_cache_size(mut self, size: usize) -> Self {
        self.max_cache_size = size;
        self
    }

    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let name = std::env::var("PARLEY_NAME").unwrap_or_else(|_| DEFAULT_NAME.to_string());
        if name.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "PARLEY_NAME".to_string(),
                "name must not be empty".to_string(),
            ));
        }

        let bind_host =
            std::env::var("PARLEY_BIND_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());
        let server_port = parse_var::<u16>("PARLEY_PORT")?.unwrap_or(DEFAULT_PORT);
        let explicit_target_host = std::env::var("PARLEY_TARGET_HOST").ok();
        let target_port = parse_var::<u16>("PARLEY_TARGET_PORT")?;
        if explicit_target_host.is_some() && target_port.is_none() {
            return Err(ConfigError::MissingVar(
                "PARLEY_TARGET_PORT must be set when PARLEY_TARGET_HOST is given".to_string(),
            ));
        }
        let target_host = explicit_target_host.unwrap_or_else(|| DEFAULT_HOST.to_string());

        let answer_timeout = parse_var::<u64>("PARLEY_ANSWER_TIMEOUT_SECS")?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        let max_cache_size =
            parse_var::<usize>("PARLEY_CACHE_SIZE")?.unwrap_or(DEFAULT_MAX_CACHE_SIZE);
        if max_cache_size == 0 {
            return Err(ConfigError::InvalidValue(
                "PARLEY_CACHE_SIZE".to_string(),
                "cache size must be greater than zero".to_string(),
            ));
        }

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            name,
            bind_host,
            server_port,
            target_host,
            target_port,
            answer_timeout,
            max_cache_size,
            log_level,
        })
    }
}

/// Reads and parses an optional environment variable.
fn parse_var<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue(key.to_string(), e.to_string())),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    fn clear_env_vars() {
        unsafe {
            env::remove_var("PARLEY_NAME");
            env::remove_var("PARLEY_BIND_HOST");
            env::remove_var("PARLEY_PORT");
            env::remove_var("PARLEY_TARGET_HOST");
            env::remove_var("PARLEY_TARGET_PORT");
            env::remove_var("PARLEY_ANSWER_TIMEOUT_SECS");
            env::remove_var("PARLEY_CACHE_SIZE");
            env::remove_var("RUST_LOG");
        }
    }

    #[test]
    fn test_config_error_display() {
        let missing_var = ConfigError::MissingVar("TEST_VAR".to_string());
        assert_eq!(
            format!("{}", missing_var),
            "Missing environment variable: TEST_VAR"
        );

        let invalid_value =
            ConfigError::InvalidValue("TEST_VAR".to_string(), "bad_value".to_string());
        assert_eq!(
            format!("{}", invalid_value),
            "Invalid value for environment variable TEST_VAR: bad_value"
        );
    }

    #[test]
    fn test_builder_methods() {
        let config = LinkConfig::new("simulation", 9001)
            .with_target("localhost", 9002)
            .with_answer_timeout(Duration::from_secs(5))
            .with_max_cache_size(50);

        assert_eq!(config.name, "simulation");
        assert_eq!(config.server_port, 9001);
        assert_eq!(config.target_host, "localhost");
        assert_eq!(config.target_port, Some(9002));
        assert_eq!(config.answer_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.max_cache_size, 50);
    }

    #[test]
    #[serial]
    fn test_config_from_env_defaults() {
        clear_env_vars();

        let config = LinkConfig::from_env().expect("Config should load successfully");

        assert_eq!(config.name, "parley");
        assert_eq!(config.bind_host, "127.0.0.1");
        assert_eq!(config.server_port, 8765);
        assert_eq!(config.target_host, "127.0.0.1");
        assert_eq!(config.target_port, None);
        assert_eq!(config.answer_timeout, None);
        assert_eq!(config.max_cache_size, 1000);
        assert_eq!(config.log_level, Level::INFO);
    }

    #[test]
    #[serial]
    fn test_config_from_env_custom_values() {
        clear_env_vars();
        unsafe {
            env::set_var("PARLEY_NAME", "chatbot");
            env::set_var("PARLEY_BIND_HOST", "0.0.0.0");
            env::set_var("PARLEY_PORT", "8766");
            env::set_var("PARLEY_TARGET_HOST", "sim.local");
            env::set_var("PARLEY_TARGET_PORT", "8765");
            env::set_var("PARLEY_ANSWER_TIMEOUT_SECS", "30");
            env::set_var("PARLEY_CACHE_SIZE", "250");
            env::set_var("RUST_LOG", "debug");
        }

        let config = LinkConfig::from_env().expect("Config should load successfully");

        assert_eq!(config.name, "chatbot");
        assert_eq!(config.bind_host, "0.0.0.0");
        assert_eq!(config.server_port, 8766);
        assert_eq!(config.target_host, "sim.local");
        assert_eq!(config.target_port, Some(8765));
        assert_eq!(config.answer_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.max_cache_size, 250);
        assert_eq!(config.log_level, Level::DEBUG);
        clear_env_vars();
    }

    #[test]
    #[serial]
    fn test_zero_timeout_means_no_timeout() {
        clear_env_vars();
        unsafe {
            env::set_var("PARLEY_ANSWER_TIMEOUT_SECS", "0");
        }

        let config = LinkConfig::from_env().expect("Config should load successfully");
        assert_eq!(config.answer_timeout, None);
        clear_env_vars();
    }

    #[test]
    #[serial]
    fn test_config_invalid_port() {
        clear_env_vars();
        unsafe {
            env::set_var("PARLEY_PORT", "not-a-port");
        }

        let err = LinkConfig::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "PARLEY_PORT"),
            _ => panic!("Expected InvalidValue for PARLEY_PORT"),
        }
        clear_env_vars();
    }

    #[test]
    #[serial]
    fn test_config_zero_cache_size() {
        clear_env_vars();
        unsafe {
            env::set_var("PARLEY_CACHE_SIZE", "0");
        }

        let err = LinkConfig::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "PARLEY_CACHE_SIZE"),
            _ => panic!("Expected InvalidValue for PARLEY_CACHE_SIZE"),
        }
        clear_env_vars();
    }

    #[test]
    #[serial]
    fn test_config_target_host_without_port() {
        clear_env_vars();
        unsafe {
            env::set_var("PARLEY_TARGET_HOST", "sim.local");
        }

        let err = LinkConfig::from_env().unwrap_err();
        match err {
            ConfigError::MissingVar(msg) => assert!(msg.contains("PARLEY_TARGET_PORT")),
            _ => panic!("Expected MissingVar for PARLEY_TARGET_PORT"),
        }
        clear_env_vars();
    }

    #[test]
    #[serial]
    fn test_config_invalid_log_level() {
        clear_env_vars();
        unsafe {
            env::set_var("RUST_LOG", "not-a-level");
        }

        let err = LinkConfig::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "RUST_LOG"),
            _ => panic!("Expected InvalidValue for RUST_LOG"),
        }
        clear_env_vars();
    }
}
