use crate::constants::network;
use crate::errors::ToolError;
use crate::services::validation::Validation;
use crate::utils::user_paths::expand_home_path;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;

/// Pool identity of a connection. Secrets are not part of the key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub host: String,
    pub port: u16,
    pub username: String,
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Accept any host key. Insecure; must be requested explicitly.
    Accept,
    /// Require the SHA-256 host key fingerprint to match.
    Pin { fingerprint: String },
    /// Check the host key against an OpenSSH known_hosts file.
    KnownHosts { path: PathBuf },
}

#[derive(Clone)]
pub struct SshConnection {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub private_key: Option<String>,
    pub passphrase: Option<String>,
    pub host_key_policy: HostKeyPolicy,
    pub ready_timeout_ms: u64,
    pub operation_timeout_ms: u64,
    pub keepalive_interval_ms: u64,
}

impl fmt::Debug for SshConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "***");
        f.debug_struct("SshConnection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &redact(&self.password))
            .field("private_key", &redact(&self.private_key))
            .field("passphrase", &redact(&self.passphrase))
            .field("host_key_policy", &self.host_key_policy)
            .finish()
    }
}

impl SshConnection {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        host_key_policy: HostKeyPolicy,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: None,
            private_key: None,
            passphrase: None,
            host_key_policy,
            ready_timeout_ms: network::TIMEOUT_SSH_READY_MS,
            operation_timeout_ms: network::TIMEOUT_SSH_OPERATION_MS,
            keepalive_interval_ms: network::KEEPALIVE_INTERVAL_MS,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_private_key(mut self, key: impl Into<String>, passphrase: Option<String>) -> Self {
        self.private_key = Some(key.into());
        self.passphrase = passphrase;
        self
    }

    pub fn session_key(&self) -> SessionKey {
        SessionKey {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.password.as_deref().is_some_and(|p| !p.is_empty())
            || self.private_key.as_deref().is_some_and(|k| !k.is_empty())
    }

    /// Hex SHA-256 over the secret material, used to refuse reuse of a pooled
    /// session that was authenticated with different credentials.
    pub fn credential_fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for (label, secret) in [
            ("password", &self.password),
            ("private_key", &self.private_key),
            ("passphrase", &self.passphrase),
        ] {
            hasher.update(label.as_bytes());
            hasher.update([0u8]);
            if let Some(secret) = secret {
                hasher.update([1u8]);
                hasher.update(secret.as_bytes());
            }
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }

    /// Builds a connection from a JSON object such as
    /// `{"host": "...", "port": 22, "username": "...", "password": "...",
    ///   "host_key_policy": "pin", "host_key_fingerprint_sha256": "SHA256:..."}`.
    pub fn from_value(value: &Value, validation: &Validation) -> Result<Self, ToolError> {
        let obj = value
            .as_object()
            .ok_or_else(|| ToolError::invalid_params("connection must be an object"))?;

        let host = validation.ensure_string(
            obj.get("host").unwrap_or(&Value::Null),
            "connection.host",
            true,
        )?;
        let username = validation.ensure_string(
            obj.get("username")
                .or_else(|| obj.get("user"))
                .unwrap_or(&Value::Null),
            "connection.username",
            true,
        )?;
        let port = validation.ensure_port(obj.get("port"), network::SSH_DEFAULT_PORT)?;

        let password =
            validation.ensure_optional_string(obj.get("password"), "connection.password", false)?;
        let mut private_key = validation.ensure_optional_string(
            obj.get("private_key"),
            "connection.private_key",
            false,
        )?;
        if private_key.is_none() {
            if let Some(path) = validation.ensure_optional_string(
                obj.get("private_key_path"),
                "connection.private_key_path",
                true,
            )? {
                let path = expand_home_path(&path);
                let key = std::fs::read_to_string(&path).map_err(|err| {
                    ToolError::auth_failed(format!(
                        "failed to read private key {}: {}",
                        path.display(),
                        err
                    ))
                })?;
                private_key = Some(key);
            }
        }
        let passphrase = validation.ensure_optional_string(
            obj.get("passphrase"),
            "connection.passphrase",
            false,
        )?;

        if password.is_none() && private_key.is_none() {
            return Err(ToolError::auth_failed("no authentication method provided")
                .with_hint("Set connection.password, or connection.private_key/private_key_path (optionally passphrase)."));
        }

        let host_key_policy = parse_host_key_policy(obj)?;

        let read_ms = |keys: &[&str], fallback: u64| {
            keys.iter()
                .find_map(|key| obj.get(*key).and_then(|v| v.as_u64()))
                .filter(|v| *v > 0)
                .unwrap_or(fallback)
        };

        Ok(Self {
            host,
            port,
            username,
            password,
            private_key,
            passphrase,
            host_key_policy,
            ready_timeout_ms: read_ms(
                &["ready_timeout_ms", "ready_timeout"],
                network::TIMEOUT_SSH_READY_MS,
            ),
            operation_timeout_ms: read_ms(
                &["operation_timeout_ms", "timeout_ms"],
                network::TIMEOUT_SSH_OPERATION_MS,
            ),
            keepalive_interval_ms: read_ms(
                &["keepalive_interval_ms", "keepalive_interval"],
                network::KEEPALIVE_INTERVAL_MS,
            ),
        })
    }
}

fn parse_host_key_policy(obj: &serde_json::Map<String, Value>) -> Result<HostKeyPolicy, ToolError> {
    let policy = obj
        .get("host_key_policy")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty());
    let fingerprint = normalize_fingerprint_sha256(obj.get("host_key_fingerprint_sha256"));

    match (policy.as_deref(), fingerprint) {
        (Some("accept"), _) => Ok(HostKeyPolicy::Accept),
        (Some("pin"), Some(fingerprint)) | (None, Some(fingerprint)) => {
            Ok(HostKeyPolicy::Pin { fingerprint })
        }
        (Some("pin"), None) => Err(ToolError::invalid_params(
            "host_key_fingerprint_sha256 is required for host_key_policy=pin",
        )
        .with_hint("Provide host_key_fingerprint_sha256, or choose host_key_policy=known_hosts.")),
        (Some("known_hosts"), _) => {
            let path = obj
                .get("known_hosts_path")
                .and_then(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or("~/.ssh/known_hosts");
            Ok(HostKeyPolicy::KnownHosts {
                path: expand_home_path(path),
            })
        }
        (Some(other), _) => Err(ToolError::invalid_params(format!(
            "Unknown host_key_policy: {}",
            other
        ))
        .with_hint("Use one of: accept, pin, known_hosts.")),
        (None, None) => Err(ToolError::invalid_params(
            "host key verification must be configured explicitly",
        )
        .with_hint(
            "Set host_key_policy=known_hosts, pin (with host_key_fingerprint_sha256), or accept (insecure).",
        )),
    }
}

pub fn normalize_fingerprint_sha256(value: Option<&Value>) -> Option<String> {
    let trimmed = value.and_then(|v| v.as_str()).unwrap_or("").trim();
    if trimmed.is_empty() {
        return None;
    }
    let cleaned = trimmed.trim_end_matches('=');
    let body = match cleaned.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("sha256:") => cleaned[7..].trim(),
        _ => cleaned,
    };
    Some(format!("SHA256:{}", body))
}
