use crate::constants::limits::MAX_MODE;
use crate::constants::permissions::DEFAULT_DIR_MODE;
use crate::errors::{ToolError, ToolErrorKind};
use crate::services::logger::Logger;
use crate::services::metadata::{AttributeChange, FileAttributes, FileOwnership, MetadataDialect};
use crate::services::transport::{RemoteChannel, RemoteStat};
use serde::Serialize;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RemoteEntry {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
    pub mode: u32,
}

/// One authenticated SSH session and its SFTP sub-channel.
///
/// Every primitive reports its own error and nothing is rolled back: a
/// multi-step call that fails part way leaves whatever the completed steps
/// produced.
pub struct RemoteSession {
    channel: Box<dyn RemoteChannel>,
    dialect: Arc<dyn MetadataDialect>,
    logger: Logger,
    closed: bool,
}

impl RemoteSession {
    pub fn new(
        channel: Box<dyn RemoteChannel>,
        dialect: Arc<dyn MetadataDialect>,
        logger: Logger,
    ) -> Self {
        Self {
            channel,
            dialect,
            logger,
            closed: false,
        }
    }

    pub fn is_alive(&mut self) -> bool {
        !self.closed && self.channel.is_alive()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Idempotent; only the first call reaches the transport.
    pub fn close(&mut self) -> Result<(), ToolError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.channel.close()
    }

    fn ensure_open(&self) -> Result<(), ToolError> {
        if self.closed {
            return Err(ToolError::io("session is closed"));
        }
        Ok(())
    }

    pub fn create_file(
        &mut self,
        path: &str,
        content: impl AsRef<[u8]>,
        mode: u32,
    ) -> Result<(), ToolError> {
        self.ensure_open()?;
        if let Some(parent) = parent_of(path) {
            if !self.exists(parent)? {
                self.create_dir_all(parent)
                    .map_err(|err| err.context("failed to create parent directory"))?;
            }
        }
        self.channel
            .write_file(path, content.as_ref())
            .map_err(|err| err.context("failed to write file content"))?;
        self.channel
            .chmod(path, mode & MAX_MODE)
            .map_err(|err| err.context("failed to set file permissions"))
    }

    pub fn read_file_bytes(&mut self, path: &str) -> Result<Vec<u8>, ToolError> {
        self.ensure_open()?;
        self.channel
            .read_file(path)
            .map_err(|err| err.context("failed to read file"))
    }

    pub fn read_file(&mut self, path: &str) -> Result<String, ToolError> {
        let bytes = self.read_file_bytes(path)?;
        String::from_utf8(bytes)
            .map_err(|_| ToolError::io(format!("file {} is not valid UTF-8", path)))
    }

    /// A missing file surfaces as `NotFound`; callers deleting idempotently
    /// should treat that as success.
    pub fn delete_file(&mut self, path: &str) -> Result<(), ToolError> {
        self.ensure_open()?;
        self.channel
            .unlink(path)
            .map_err(|err| err.context("failed to delete file"))
    }

    /// Fails with `AlreadyExists` when anything exists at `path`.
    pub fn create_directory(&mut self, path: &str, mode: u32) -> Result<(), ToolError> {
        self.ensure_open()?;
        if self.exists(path)? {
            return Err(ToolError::already_exists(format!(
                "directory {} already exists",
                path
            )));
        }
        self.create_dir_all(path)
            .map_err(|err| err.context("failed to create directory"))?;
        self.channel
            .chmod(path, mode & MAX_MODE)
            .map_err(|err| err.context("failed to set directory permissions"))
    }

    pub fn delete_directory(&mut self, path: &str) -> Result<(), ToolError> {
        self.ensure_open()?;
        let stat = self
            .channel
            .stat(path)
            .map_err(|err| err.context("failed to delete directory"))?;
        if !stat.is_dir {
            return Err(ToolError::io(format!("{} is not a directory", path)));
        }
        self.remove_tree(path)
            .map_err(|err| err.context("failed to delete directory"))
    }

    fn remove_tree(&mut self, path: &str) -> Result<(), ToolError> {
        for entry in self.channel.read_dir(path)? {
            if entry.stat.is_dir {
                self.remove_tree(&entry.path)?;
            } else {
                self.channel.unlink(&entry.path)?;
            }
        }
        self.channel.rmdir(path)
    }

    /// Creates every missing component of `path` with the default directory
    /// mode. Relative paths stay relative to the login directory.
    fn create_dir_all(&mut self, path: &str) -> Result<(), ToolError> {
        let absolute = path.starts_with('/');
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            if absolute || !current.is_empty() {
                current.push('/');
            }
            current.push_str(part);
            match self.channel.stat(&current) {
                Ok(stat) if stat.is_dir => continue,
                Ok(_) => {
                    return Err(ToolError::io(format!("{} exists and is not a directory", current)))
                }
                Err(err) if err.is(ToolErrorKind::NotFound) => {}
                Err(err) => return Err(err),
            }
            match self.channel.mkdir(&current, DEFAULT_DIR_MODE) {
                Ok(()) => {}
                Err(err) if err.is(ToolErrorKind::AlreadyExists) => continue,
                Err(err) => return Err(err),
            }
            // mkdir is subject to the server umask.
            self.channel.chmod(&current, DEFAULT_DIR_MODE)?;
        }
        Ok(())
    }

    pub fn exists(&mut self, path: &str) -> Result<bool, ToolError> {
        self.ensure_open()?;
        match self.channel.stat(path) {
            Ok(_) => Ok(true),
            Err(err) if err.is(ToolErrorKind::NotFound) => Ok(false),
            Err(err) => Err(err.context("failed to check existence")),
        }
    }

    pub fn stat(&mut self, path: &str) -> Result<RemoteStat, ToolError> {
        self.ensure_open()?;
        self.channel.stat(path)
    }

    pub fn get_mode(&mut self, path: &str) -> Result<u32, ToolError> {
        let stat = self
            .stat(path)
            .map_err(|err| err.context("failed to get file mode"))?;
        stat.mode
            .map(|mode| mode & MAX_MODE)
            .ok_or_else(|| ToolError::io(format!("server reported no mode for {}", path)))
    }

    pub fn set_mode(&mut self, path: &str, mode: u32) -> Result<(), ToolError> {
        self.ensure_open()?;
        self.channel
            .chmod(path, mode & MAX_MODE)
            .map_err(|err| err.context("failed to set file mode"))
    }

    /// Entries of a directory, sorted by name.
    pub fn list_directory(&mut self, path: &str) -> Result<Vec<RemoteEntry>, ToolError> {
        self.ensure_open()?;
        let mut entries: Vec<RemoteEntry> = self
            .channel
            .read_dir(path)
            .map_err(|err| err.context("failed to read directory entries"))?
            .into_iter()
            .map(|entry| RemoteEntry {
                name: entry
                    .path
                    .rsplit('/')
                    .next()
                    .unwrap_or(entry.path.as_str())
                    .to_string(),
                size: entry.stat.size.unwrap_or(0),
                is_dir: entry.stat.is_dir,
                mode: entry.stat.mode.unwrap_or(0) & MAX_MODE,
                path: entry.path,
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn run(&mut self, command: &str) -> Result<String, ToolError> {
        self.ensure_open()?;
        self.logger
            .debug("exec", Some(&serde_json::json!({ "command": command })));
        let output = self.channel.exec(command)?;
        if !output.success() {
            let stderr = output.stderr.trim();
            return Err(ToolError::io(if stderr.is_empty() {
                format!("command exited with status {}", output.exit_code)
            } else {
                stderr.to_string()
            })
            .with_details(serde_json::json!({
                "command": command,
                "exit_code": output.exit_code,
            })));
        }
        Ok(output.stdout)
    }

    pub fn get_ownership(&mut self, path: &str) -> Result<FileOwnership, ToolError> {
        let dialect = self.dialect.clone();
        let listing = self
            .run(&dialect.owner_ids_command(path))
            .map_err(|err| err.context("failed to get file ownership"))?;
        let (uid, gid) = dialect.parse_owner_ids(&listing)?;

        let user = self
            .run(&dialect.user_name_command(uid))
            .map_err(|err| err.context("failed to get username"))?;
        let group = self
            .run(&dialect.group_name_command(gid))
            .map_err(|err| err.context("failed to get group name"))?;

        // Ids without a name-service entry stay numeric so chown still accepts them.
        Ok(FileOwnership {
            user: dialect.parse_name(&user).unwrap_or_else(|| uid.to_string()),
            group: dialect.parse_name(&group).unwrap_or_else(|| gid.to_string()),
        })
    }

    /// Applies `ownership`; an empty half keeps the current owner or group.
    pub fn set_ownership(&mut self, path: &str, ownership: &FileOwnership) -> Result<(), ToolError> {
        if ownership.is_empty() {
            return Ok(());
        }
        let (user, group) = if ownership.user.is_empty() || ownership.group.is_empty() {
            let current = self
                .get_ownership(path)
                .map_err(|err| err.context("failed to get current ownership"))?;
            let pick = |wanted: &str, current: String| {
                if wanted.is_empty() {
                    current
                } else {
                    wanted.to_string()
                }
            };
            (
                pick(&ownership.user, current.user),
                pick(&ownership.group, current.group),
            )
        } else {
            (ownership.user.clone(), ownership.group.clone())
        };
        let command = self.dialect.chown_command(path, &user, &group);
        self.run(&command)
            .map_err(|err| err.context("failed to set file ownership"))?;
        Ok(())
    }

    pub fn get_attributes(&mut self, path: &str) -> Result<FileAttributes, ToolError> {
        let dialect = self.dialect.clone();
        let output = self
            .run(&dialect.list_attributes_command(path))
            .map_err(|err| err.context("failed to get file attributes"))?;
        dialect.parse_attributes(&output)
    }

    /// Issues at most two change commands: one adding, one removing flags.
    pub fn set_attributes(&mut self, path: &str, desired: &FileAttributes) -> Result<(), ToolError> {
        let current = self.get_attributes(path)?;
        let (add, remove) = desired.diff(&current);
        if !add.is_empty() {
            let command = self
                .dialect
                .change_attributes_command(path, AttributeChange::Add, &add);
            self.run(&command)
                .map_err(|err| err.context("failed to add file attributes"))?;
        }
        if !remove.is_empty() {
            let command = self
                .dialect
                .change_attributes_command(path, AttributeChange::Remove, &remove);
            self.run(&command)
                .map_err(|err| err.context("failed to remove file attributes"))?;
        }
        Ok(())
    }
}

fn parent_of(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&trimmed[..idx]),
        None => None,
    }
}
