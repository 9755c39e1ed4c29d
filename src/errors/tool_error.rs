use serde::Serialize;
use serde_json::Value;
use std::error::Error;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    InvalidParams,
    ConnectFailed,
    AuthFailed,
    HostKeyRejected,
    PoolExhausted,
    PoolClosed,
    SessionBusy,
    NotFound,
    AlreadyExists,
    Io,
    Parse,
    Timeout,
    Internal,
}

impl ToolErrorKind {
    fn is_retryable(self) -> bool {
        matches!(
            self,
            ToolErrorKind::ConnectFailed
                | ToolErrorKind::PoolExhausted
                | ToolErrorKind::SessionBusy
                | ToolErrorKind::Timeout
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub retryable: bool,
}

impl ToolError {
    pub fn new(kind: ToolErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            hint: None,
            details: None,
            retryable: kind.is_retryable(),
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Prefixes the message with the step that failed, keeping kind and code.
    pub fn context(mut self, step: &str) -> Self {
        self.message = format!("{}: {}", step, self.message);
        self
    }

    pub fn is(&self, kind: ToolErrorKind) -> bool {
        self.kind == kind
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::InvalidParams, "INVALID_PARAMS", message)
    }

    pub fn connect_failed(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::ConnectFailed, "CONNECT_FAILED", message)
    }

    pub fn auth_failed(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::AuthFailed, "AUTH_FAILED", message)
    }

    pub fn host_key_rejected(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::HostKeyRejected, "HOST_KEY_REJECTED", message)
    }

    pub fn pool_exhausted(max_connections: usize) -> Self {
        Self::new(
            ToolErrorKind::PoolExhausted,
            "POOL_EXHAUSTED",
            format!(
                "connection pool is at capacity (max {} connections)",
                max_connections
            ),
        )
        .with_details(serde_json::json!({ "max_connections": max_connections }))
    }

    pub fn pool_closed() -> Self {
        Self::new(
            ToolErrorKind::PoolClosed,
            "POOL_CLOSED",
            "connection pool is closed",
        )
    }

    pub fn session_busy(key: impl fmt::Display) -> Self {
        Self::new(
            ToolErrorKind::SessionBusy,
            "SESSION_BUSY",
            format!("session {} is already in use", key),
        )
        .with_hint("Release the current lease for this host/port/username before acquiring again.")
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::NotFound, "NOT_FOUND", message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::AlreadyExists, "ALREADY_EXISTS", message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Io, "IO_ERROR", message)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Parse, "PARSE_ERROR", message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Timeout, "TIMEOUT", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Internal, "INTERNAL", message)
    }
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for ToolError {}

impl From<std::io::Error> for ToolError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => ToolError::not_found(err.to_string()),
            std::io::ErrorKind::AlreadyExists => ToolError::already_exists(err.to_string()),
            std::io::ErrorKind::TimedOut => ToolError::timeout(err.to_string()),
            _ => ToolError::io(err.to_string()),
        }
    }
}
