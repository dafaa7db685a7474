use std::fmt;
use std::time::Duration;
use thiserror::Error;
use zeroize::Zeroizing;

/// Port the image server listens on by default
pub const DEFAULT_PORT: u16 = 9000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid config: server host is empty")]
    EmptyHost,
    #[error("Invalid config: server host {0:?} contains whitespace")]
    MalformedHost(String),
    #[error("Invalid config: port {0} is out of range 1-65535")]
    PortOutOfRange(i64),
    #[error("Invalid config: port {0:?} is not a number")]
    UnparsablePort(String),
    #[error("Invalid config: username and password must both be non-empty")]
    IncompleteCredentials,
}

/// Username/password pair sent in the `authenticate` handshake
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    password: Zeroizing<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Zeroizing::new(password.into()),
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Where and how to reach the streaming server.
///
/// Immutable once handed to `StreamingConnection::configure`; to change it,
/// configure again (which tears the old transport down).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub server_host: String,
    pub server_port: u16,
    pub credentials: Option<Credentials>,
    /// Request `wss://` instead of `ws://`
    pub secure: bool,
}

impl ConnectionConfig {
    pub fn new(server_host: impl Into<String>, server_port: u16) -> Self {
        Self {
            server_host: server_host.into(),
            server_port,
            credentials: None,
            secure: false,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials::new(username, password));
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Parse a port typed by a user (login form, CLI, env)
    pub fn parse_port(text: &str) -> Result<u16, ConfigError> {
        let value: i64 = text
            .trim()
            .parse()
            .map_err(|_| ConfigError::UnparsablePort(text.to_string()))?;
        if !(1..=65535).contains(&value) {
            return Err(ConfigError::PortOutOfRange(value));
        }
        Ok(value as u16)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let host = self.server_host.trim();
        if host.is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if host.chars().any(char::is_whitespace) {
            return Err(ConfigError::MalformedHost(self.server_host.clone()));
        }
        if self.server_port == 0 {
            return Err(ConfigError::PortOutOfRange(0));
        }
        if let Some(creds) = &self.credentials {
            if creds.username.is_empty() || creds.password().is_empty() {
                return Err(ConfigError::IncompleteCredentials);
            }
        }
        Ok(())
    }

    /// WebSocket URL of the server, e.g. `ws://10.0.0.5:9000/`
    pub fn url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        let host = self.server_host.trim();
        // Bare IPv6 literals need brackets in a URL authority
        if host.contains(':') && !host.starts_with('[') {
            format!("{}://[{}]:{}/", scheme, host, self.server_port)
        } else {
            format!("{}://{}:{}/", scheme, host, self.server_port)
        }
    }
}

/// Automatic reconnection budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Retries after the initial attempt before giving up
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            delay: Duration::from_secs(5),
        }
    }
}

/// Tuning knobs of a `StreamingConnection` that are not part of the server config
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub reconnect: ReconnectPolicy,
    /// How long a single transport connect may take before it counts as failed
    pub connect_timeout: Duration,
    /// How long to wait for the server's reply to `authenticate`
    pub auth_timeout: Duration,
    /// Frames that may sit in the outbound queue before new ones are dropped
    pub frame_queue: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(20),
            auth_timeout: Duration::from_secs(15),
            frame_queue: 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_bad_host_and_port() {
        assert_eq!(ConnectionConfig::new("", 9000).validate(), Err(ConfigError::EmptyHost));
        assert_eq!(ConnectionConfig::new("   ", 9000).validate(), Err(ConfigError::EmptyHost));
        assert!(matches!(
            ConnectionConfig::new("10.0 .0.5", 9000).validate(),
            Err(ConfigError::MalformedHost(_))
        ));
        assert_eq!(
            ConnectionConfig::new("10.0.0.5", 0).validate(),
            Err(ConfigError::PortOutOfRange(0))
        );
        assert!(ConnectionConfig::new("10.0.0.5", 65535).validate().is_ok());
    }

    #[test]
    fn test_parse_port() {
        assert_eq!(ConnectionConfig::parse_port("9000"), Ok(9000));
        assert_eq!(ConnectionConfig::parse_port(" 1 "), Ok(1));
        assert_eq!(ConnectionConfig::parse_port("65536"), Err(ConfigError::PortOutOfRange(65536)));
        assert_eq!(ConnectionConfig::parse_port("-3"), Err(ConfigError::PortOutOfRange(-3)));
        assert!(matches!(
            ConnectionConfig::parse_port("http"),
            Err(ConfigError::UnparsablePort(_))
        ));
    }

    #[test]
    fn test_credentials_must_be_complete() {
        let config = ConnectionConfig::new("localhost", 9000).with_credentials("a", "");
        assert_eq!(config.validate(), Err(ConfigError::IncompleteCredentials));

        let config = ConnectionConfig::new("localhost", 9000).with_credentials("a", "b");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_password_is_redacted() {
        let creds = Credentials::new("alice", "hunter2");
        let debug = format!("{:?}", creds);
        assert!(debug.contains("alice"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_url() {
        assert_eq!(ConnectionConfig::new("10.0.0.5", 9000).url(), "ws://10.0.0.5:9000/");
        assert_eq!(
            ConnectionConfig::new("example.org", 443).with_secure(true).url(),
            "wss://example.org:443/"
        );
        assert_eq!(ConnectionConfig::new("::1", 9000).url(), "ws://[::1]:9000/");
    }
}
