use thiserror::Error;

/// Errors raised while assembling configuration from the environment.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),

    #[error("Invalid value for {var}: {reason}")]
    InvalidVar { var: &'static str, reason: String },

    #[error("Invalid database URI: {0}")]
    InvalidUri(String),
}

/// SSH tunnel lifecycle errors.
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("SSH connection failed: {0}")]
    ConnectionFailed(String),

    #[error("SSH authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Host key verification failed: {0}")]
    HostKeyRejected(String),

    #[error("SSH private key error: {0}")]
    PrivateKey(String),

    #[error("Tunnel closed")]
    Closed,

    #[error("Reconnect attempts exhausted: {0}")]
    ReconnectExhausted(String),
}

/// Errors surfaced to tool callers by query execution.
#[derive(Error, Debug)]
pub enum QueryError {
    /// SQL rejected by the read-only validator. Never reaches the database.
    #[error("{0}")]
    Validation(String),

    /// No usable pool: initialization failed or a reconnect is in progress.
    #[error("{0}")]
    Pool(String),

    /// Database or driver failure.
    #[error("Query failed: {0}")]
    Database(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;
pub type TunnelResult<T> = Result<T, TunnelError>;
pub type DbResult<T> = Result<T, QueryError>;

impl From<std::io::Error> for TunnelError {
    fn from(error: std::io::Error) -> Self {
        TunnelError::ConnectionFailed(error.to_string())
    }
}

impl From<russh::Error> for TunnelError {
    fn from(error: russh::Error) -> Self {
        TunnelError::ConnectionFailed(error.to_string())
    }
}

impl From<sqlx::Error> for QueryError {
    fn from(error: sqlx::Error) -> Self {
        QueryError::Database(error.to_string())
    }
}
