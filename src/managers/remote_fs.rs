use crate::errors::{ToolError, ToolErrorKind};
use crate::services::connection::SshConnection;
use crate::services::logger::Logger;
use crate::services::metadata::{FileAttributes, FileOwnership};
use crate::services::remote_session::RemoteSession;
use crate::services::session_pool::ConnectionPool;
use crate::services::validation::Validation;
use crate::utils::permissions::{format_permissions, parse_permissions};
use crate::utils::tool_errors::unknown_action_error;
use serde_json::Value;

const FS_ACTIONS: &[&str] = &[
    "file_apply",
    "file_read",
    "file_delete",
    "directory_apply",
    "directory_read",
    "directory_delete",
    "exists",
    "pool_stats",
];

/// JSON action surface over the connection pool. Every action acquires one
/// session, runs a fixed sequence of primitives and releases it.
#[derive(Clone)]
pub struct RemoteFsManager {
    logger: Logger,
    validation: Validation,
    pool: ConnectionPool,
}

struct ReadOptions {
    ownership: bool,
    attributes: bool,
}

impl RemoteFsManager {
    pub fn new(logger: Logger, validation: Validation, pool: ConnectionPool) -> Self {
        Self {
            logger: logger.child("fs"),
            validation,
            pool,
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub async fn handle_action(&self, args: Value) -> Result<Value, ToolError> {
        let action = args.get("action").and_then(|v| v.as_str()).unwrap_or("");
        match action {
            "file_apply" => self.file_apply(&args).await,
            "file_read" => self.file_read(&args).await,
            "file_delete" => self.file_delete(&args).await,
            "directory_apply" => self.directory_apply(&args).await,
            "directory_read" => self.directory_read(&args).await,
            "directory_delete" => self.directory_delete(&args).await,
            "exists" => self.exists(&args).await,
            "pool_stats" => Ok(serde_json::json!({"success": true, "pool": self.pool.stats()})),
            _ => Err(unknown_action_error("fs", args.get("action"), FS_ACTIONS)),
        }
    }

    async fn file_apply(&self, args: &Value) -> Result<Value, ToolError> {
        let connection = self.connection(args)?;
        let path = self.path(args)?;
        let content = match args.get("content") {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(text)) => text.clone(),
            Some(_) => return Err(ToolError::invalid_params("content must be a string")),
        };
        let mode = self.mode(args);
        let ownership = self.ownership(args)?;
        let attributes = self.attributes(args)?;

        let result = self
            .pool
            .with_session(&connection, move |session| {
                session.create_file(&path, content.as_bytes(), mode)?;
                if let Some(ownership) = ownership.as_ref() {
                    session.set_ownership(&path, ownership)?;
                }
                if let Some(attributes) = attributes.as_ref() {
                    session.set_attributes(&path, attributes)?;
                }
                let mut state = describe(
                    session,
                    &path,
                    &ReadOptions {
                        ownership: ownership.is_some(),
                        attributes: attributes.is_some(),
                    },
                )?;
                state["size"] = Value::from(content.len());
                Ok(state)
            })
            .await?;
        self.logger.info(
            "file applied",
            Some(&serde_json::json!({ "path": result["path"], "host": connection.host })),
        );
        Ok(result)
    }

    async fn file_read(&self, args: &Value) -> Result<Value, ToolError> {
        let connection = self.connection(args)?;
        let path = self.path(args)?;
        let options = read_options(args);
        self.pool
            .with_session(&connection, move |session| {
                let content = session.read_file(&path)?;
                let mut state = describe(session, &path, &options)?;
                state["content"] = Value::String(content);
                Ok(state)
            })
            .await
    }

    async fn file_delete(&self, args: &Value) -> Result<Value, ToolError> {
        let connection = self.connection(args)?;
        let path = self.path(args)?;
        let path_clone = path.clone();
        let deleted = self
            .pool
            .with_session(&connection, move |session| {
                deleted_or_missing(session.delete_file(&path_clone))
            })
            .await?;
        Ok(serde_json::json!({"success": true, "path": path, "deleted": deleted}))
    }

    async fn directory_apply(&self, args: &Value) -> Result<Value, ToolError> {
        let connection = self.connection(args)?;
        let path = self.path(args)?;
        let mode = self.mode(args);
        let ownership = self.ownership(args)?;
        let attributes = self.attributes(args)?;

        self.pool
            .with_session(&connection, move |session| {
                let created = if session.exists(&path)? {
                    if !session.stat(&path)?.is_dir {
                        return Err(ToolError::already_exists(format!(
                            "{} exists and is not a directory",
                            path
                        )));
                    }
                    if session.get_mode(&path)? != mode {
                        session.set_mode(&path, mode)?;
                    }
                    false
                } else {
                    session.create_directory(&path, mode)?;
                    true
                };
                if let Some(ownership) = ownership.as_ref() {
                    session.set_ownership(&path, ownership)?;
                }
                if let Some(attributes) = attributes.as_ref() {
                    session.set_attributes(&path, attributes)?;
                }
                let mut state = describe(
                    session,
                    &path,
                    &ReadOptions {
                        ownership: ownership.is_some(),
                        attributes: attributes.is_some(),
                    },
                )?;
                state["created"] = Value::Bool(created);
                Ok(state)
            })
            .await
    }

    async fn directory_read(&self, args: &Value) -> Result<Value, ToolError> {
        let connection = self.connection(args)?;
        let path = self.path(args)?;
        let options = read_options(args);
        let entry_metadata = args
            .get("include_entry_metadata")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        self.pool
            .with_session(&connection, move |session| {
                if !session.exists(&path)? {
                    return Ok(serde_json::json!({"success": true, "path": path, "exists": false}));
                }
                if !session.stat(&path)?.is_dir {
                    return Err(ToolError::invalid_params(format!(
                        "The path {} exists but is not a directory",
                        path
                    )));
                }
                let mut state = describe(session, &path, &options)?;
                let mut entries = Vec::new();
                for entry in session.list_directory(&path)? {
                    let mut item = serde_json::to_value(&entry)
                        .map_err(|err| ToolError::internal(err.to_string()))?;
                    item["permissions"] = Value::String(format_permissions(entry.mode));
                    if entry_metadata {
                        item["ownership"] = to_json(&session.get_ownership(&entry.path)?)?;
                        item["attributes"] = to_json(&session.get_attributes(&entry.path)?)?;
                    }
                    entries.push(item);
                }
                state["exists"] = Value::Bool(true);
                state["entries"] = Value::Array(entries);
                Ok(state)
            })
            .await
    }

    async fn directory_delete(&self, args: &Value) -> Result<Value, ToolError> {
        let connection = self.connection(args)?;
        let path = self.path(args)?;
        let path_clone = path.clone();
        let deleted = self
            .pool
            .with_session(&connection, move |session| {
                deleted_or_missing(session.delete_directory(&path_clone))
            })
            .await?;
        Ok(serde_json::json!({"success": true, "path": path, "deleted": deleted}))
    }

    async fn exists(&self, args: &Value) -> Result<Value, ToolError> {
        let connection = self.connection(args)?;
        let path = self.path(args)?;
        let path_clone = path.clone();
        let (exists, is_dir) = self
            .pool
            .with_session(&connection, move |session| {
                if !session.exists(&path_clone)? {
                    return Ok((false, false));
                }
                Ok((true, session.stat(&path_clone)?.is_dir))
            })
            .await?;
        Ok(serde_json::json!({
            "success": true,
            "path": path,
            "exists": exists,
            "is_dir": is_dir,
        }))
    }

    fn connection(&self, args: &Value) -> Result<SshConnection, ToolError> {
        let value = args.get("connection").ok_or_else(|| {
            ToolError::invalid_params("connection is required")
                .with_hint("Pass args.connection with host, username and password or private_key.")
        })?;
        SshConnection::from_value(value, &self.validation)
    }

    fn path(&self, args: &Value) -> Result<String, ToolError> {
        self.validation.ensure_remote_path(args.get("path"), "path")
    }

    fn mode(&self, args: &Value) -> u32 {
        match args.get("permissions") {
            Some(Value::String(raw)) => parse_permissions(raw),
            Some(Value::Number(n)) => parse_permissions(&n.to_string()),
            _ => parse_permissions(""),
        }
    }

    fn ownership(&self, args: &Value) -> Result<Option<FileOwnership>, ToolError> {
        let user = self
            .validation
            .ensure_optional_string(args.get("owner"), "owner", true)?
            .map(|name| self.validation.ensure_account_name(&name, "owner"))
            .transpose()?;
        let group = self
            .validation
            .ensure_optional_string(args.get("group"), "group", true)?
            .map(|name| self.validation.ensure_account_name(&name, "group"))
            .transpose()?;
        if user.is_none() && group.is_none() {
            return Ok(None);
        }
        Ok(Some(FileOwnership::new(
            user.unwrap_or_default(),
            group.unwrap_or_default(),
        )))
    }

    fn attributes(&self, args: &Value) -> Result<Option<FileAttributes>, ToolError> {
        match args.get("attributes") {
            None | Some(Value::Null) => Ok(None),
            Some(value @ Value::Object(_)) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|err| ToolError::invalid_params(format!("invalid attributes: {}", err))),
            Some(_) => Err(ToolError::invalid_params("attributes must be an object")),
        }
    }
}

fn read_options(args: &Value) -> ReadOptions {
    let flag = |name: &str| args.get(name).and_then(|v| v.as_bool()).unwrap_or(false);
    ReadOptions {
        ownership: flag("include_ownership"),
        attributes: flag("include_attributes"),
    }
}

fn deleted_or_missing(result: Result<(), ToolError>) -> Result<bool, ToolError> {
    match result {
        Ok(()) => Ok(true),
        Err(err) if err.is(ToolErrorKind::NotFound) => Ok(false),
        Err(err) => Err(err),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, ToolError> {
    serde_json::to_value(value).map_err(|err| ToolError::internal(err.to_string()))
}

fn describe(session: &mut RemoteSession, path: &str, options: &ReadOptions) -> Result<Value, ToolError> {
    let mode = session.get_mode(path)?;
    let mut state = serde_json::json!({
        "success": true,
        "path": path,
        "permissions": format_permissions(mode),
    });
    if options.ownership {
        let ownership = session.get_ownership(path)?;
        state["owner"] = Value::String(ownership.user);
        state["group"] = Value::String(ownership.group);
    }
    if options.attributes {
        state["attributes"] = to_json(&session.get_attributes(path)?)?;
    }
    Ok(state)
}

#[async_trait::async_trait]
impl crate::services::tool_executor::ToolHandler for RemoteFsManager {
    async fn handle(&self, args: Value) -> Result<Value, ToolError> {
        self.logger.debug("handle_action", args.get("action"));
        self.handle_action(args).await
    }
}
