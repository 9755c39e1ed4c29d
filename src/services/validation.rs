use crate::constants::limits::{MAX_PORT, MIN_PORT};
use crate::errors::ToolError;
use serde_json::Value;

#[derive(Clone, Default)]
pub struct Validation;

impl Validation {
    pub fn new() -> Self {
        Self
    }

    pub fn ensure_string(
        &self,
        value: &Value,
        label: &str,
        trim: bool,
    ) -> Result<String, ToolError> {
        let text = value.as_str().ok_or_else(|| {
            ToolError::invalid_params(format!("{} must be a non-empty string", label))
        })?;
        let normalized = text.trim();
        if normalized.is_empty() {
            return Err(ToolError::invalid_params(format!(
                "{} must be a non-empty string",
                label
            )));
        }
        Ok(if trim {
            normalized.to_string()
        } else {
            text.to_string()
        })
    }

    pub fn ensure_optional_string(
        &self,
        value: Option<&Value>,
        label: &str,
        trim: bool,
    ) -> Result<Option<String>, ToolError> {
        match value {
            None => Ok(None),
            Some(val) if val.is_null() => Ok(None),
            Some(val) if val.as_str().map(|s| s.trim().is_empty()) == Some(true) => Ok(None),
            Some(val) => self.ensure_string(val, label, trim).map(Some),
        }
    }

    pub fn ensure_port(&self, value: Option<&Value>, fallback: u16) -> Result<u16, ToolError> {
        let Some(value) = value.filter(|v| !v.is_null()) else {
            return Ok(fallback);
        };
        let numeric = value
            .as_i64()
            .or_else(|| value.as_str().and_then(|s| s.trim().parse::<i64>().ok()))
            .ok_or_else(port_error)?;
        // Port 0 means "unset", as in the connection blocks this crate is fed from.
        if numeric == 0 {
            return Ok(fallback);
        }
        if numeric < MIN_PORT as i64 || numeric > MAX_PORT as i64 {
            return Err(port_error());
        }
        Ok(numeric as u16)
    }

    pub fn ensure_identifier(&self, value: &str, label: &str) -> Result<String, ToolError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(ToolError::invalid_params(format!(
                "{} must be a non-empty string",
                label
            )));
        }
        if trimmed.contains('\0') {
            return Err(ToolError::invalid_params(format!(
                "{} must not contain null bytes",
                label
            )));
        }
        Ok(trimmed.to_string())
    }

    /// Remote paths must be absolute and free of NUL bytes.
    pub fn ensure_remote_path(&self, value: Option<&Value>, label: &str) -> Result<String, ToolError> {
        let path = self.ensure_string(value.unwrap_or(&Value::Null), label, false)?;
        if path.contains('\0') {
            return Err(ToolError::invalid_params(format!(
                "{} must not contain null bytes",
                label
            )));
        }
        if !path.starts_with('/') {
            return Err(
                ToolError::invalid_params(format!("{} must be an absolute path", label))
                    .with_hint("Remote paths are resolved on the server; pass e.g. /home/user/file.txt."),
            );
        }
        Ok(path)
    }

    /// User and group names end up on a command line, so only portable name
    /// characters are accepted.
    pub fn ensure_account_name(&self, value: &str, label: &str) -> Result<String, ToolError> {
        let name = self.ensure_identifier(value, label)?;
        let valid = name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '$'));
        if !valid {
            return Err(ToolError::invalid_params(format!(
                "{} contains unsupported characters: {}",
                label, name
            )));
        }
        Ok(name)
    }
}

fn port_error() -> ToolError {
    ToolError::invalid_params(format!(
        "Port must be an integer between {} and {}",
        MIN_PORT, MAX_PORT
    ))
}
