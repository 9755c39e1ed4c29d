//! Ownership and extended-attribute metadata, and the command dialect used to
//! read and change it on the remote host.
//!
//! SFTP cannot express user/group names or `chattr` flags, so these go through
//! shell commands. All command text and all parsing of command output lives in
//! a `MetadataDialect`, so hosts with different tooling only need another
//! dialect.

use crate::errors::ToolError;
use crate::utils::shell::shell_quote;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOwnership {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub group: String,
}

impl FileOwnership {
    pub fn new(user: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            group: group.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.user.is_empty() && self.group.is_empty()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileAttributes {
    pub immutable: bool,
    pub append_only: bool,
    pub no_dump: bool,
    pub synchronous: bool,
    pub no_atime: bool,
    pub compressed: bool,
    pub no_cow: bool,
    pub undeletable: bool,
}

/// Attribute flags in the order they are emitted in change commands.
pub const ATTRIBUTE_FLAGS: [char; 8] = ['i', 'a', 'd', 'S', 'A', 'c', 'C', 'u'];

impl FileAttributes {
    pub fn flag(&self, flag: char) -> bool {
        match flag {
            'i' => self.immutable,
            'a' => self.append_only,
            'd' => self.no_dump,
            'S' => self.synchronous,
            'A' => self.no_atime,
            'c' => self.compressed,
            'C' => self.no_cow,
            'u' => self.undeletable,
            _ => false,
        }
    }

    fn set_flag(&mut self, flag: char, value: bool) {
        match flag {
            'i' => self.immutable = value,
            'a' => self.append_only = value,
            'd' => self.no_dump = value,
            'S' => self.synchronous = value,
            'A' => self.no_atime = value,
            'c' => self.compressed = value,
            'C' => self.no_cow = value,
            'u' => self.undeletable = value,
            _ => {}
        }
    }

    pub fn from_flags(flags: &str) -> Self {
        let mut attrs = Self::default();
        for flag in ATTRIBUTE_FLAGS {
            if flags.contains(flag) {
                attrs.set_flag(flag, true);
            }
        }
        attrs
    }

    /// Flags to add and to remove to turn `current` into `self`.
    pub fn diff(&self, current: &FileAttributes) -> (String, String) {
        let mut add = String::new();
        let mut remove = String::new();
        for flag in ATTRIBUTE_FLAGS {
            match (self.flag(flag), current.flag(flag)) {
                (true, false) => add.push(flag),
                (false, true) => remove.push(flag),
                _ => {}
            }
        }
        (add, remove)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttributeChange {
    Add,
    Remove,
}

pub trait MetadataDialect: Send + Sync {
    /// Command printing numeric owner and group of `path`.
    fn owner_ids_command(&self, path: &str) -> String;

    fn parse_owner_ids(&self, output: &str) -> Result<(u32, u32), ToolError>;

    fn user_name_command(&self, uid: u32) -> String;

    fn group_name_command(&self, gid: u32) -> String;

    /// `None` when the lookup printed nothing.
    fn parse_name(&self, output: &str) -> Option<String>;

    fn chown_command(&self, path: &str, user: &str, group: &str) -> String;

    fn list_attributes_command(&self, path: &str) -> String;

    fn parse_attributes(&self, output: &str) -> Result<FileAttributes, ToolError>;

    fn change_attributes_command(&self, path: &str, change: AttributeChange, flags: &str) -> String;
}

/// GNU coreutils + glibc `getent` + e2fsprogs `lsattr`/`chattr`.
#[derive(Clone, Copy, Debug, Default)]
pub struct GnuDialect;

// "-rw-r--r-- 1 1000 1000 0 Feb 19 13:23 /path/to/file"
static LS_NUMERIC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\S+\s+\d+\s+(\d+)\s+(\d+)(?:\s|$)").unwrap());

// "----i-A------- /path/to/file"
static LSATTR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([A-Za-z-]+)\s+\S").unwrap());

impl MetadataDialect for GnuDialect {
    fn owner_ids_command(&self, path: &str) -> String {
        format!("ls -ldn -- {}", shell_quote(path))
    }

    fn parse_owner_ids(&self, output: &str) -> Result<(u32, u32), ToolError> {
        let line = output.lines().next().unwrap_or("").trim();
        let caps = LS_NUMERIC_RE
            .captures(line)
            .ok_or_else(|| ToolError::parse(format!("invalid ls output format: {}", line)))?;
        let uid = caps[1]
            .parse::<u32>()
            .map_err(|_| ToolError::parse(format!("invalid uid in ls output: {}", &caps[1])))?;
        let gid = caps[2]
            .parse::<u32>()
            .map_err(|_| ToolError::parse(format!("invalid gid in ls output: {}", &caps[2])))?;
        Ok((uid, gid))
    }

    fn user_name_command(&self, uid: u32) -> String {
        format!("getent passwd {} | cut -d: -f1", uid)
    }

    fn group_name_command(&self, gid: u32) -> String {
        format!("getent group {} | cut -d: -f1", gid)
    }

    fn parse_name(&self, output: &str) -> Option<String> {
        output
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
    }

    fn chown_command(&self, path: &str, user: &str, group: &str) -> String {
        format!(
            "chown {} -- {}",
            shell_quote(&format!("{}:{}", user, group)),
            shell_quote(path)
        )
    }

    fn list_attributes_command(&self, path: &str) -> String {
        format!("lsattr -d {}", shell_quote(path))
    }

    fn parse_attributes(&self, output: &str) -> Result<FileAttributes, ToolError> {
        let line = output.lines().next().unwrap_or("").trim_start();
        let caps = LSATTR_RE
            .captures(line)
            .ok_or_else(|| ToolError::parse(format!("invalid lsattr output format: {}", line)))?;
        Ok(FileAttributes::from_flags(&caps[1]))
    }

    fn change_attributes_command(&self, path: &str, change: AttributeChange, flags: &str) -> String {
        let sign = match change {
            AttributeChange::Add => '+',
            AttributeChange::Remove => '-',
        };
        format!("chattr {}{} {}", sign, flags, shell_quote(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numeric_ls_output() {
        let dialect = GnuDialect;
        let ids = dialect
            .parse_owner_ids("-rw-r--r-- 1 1000 50 0 Feb 19 13:23 /path/to/file\n")
            .unwrap();
        assert_eq!(ids, (1000, 50));
        let ids = dialect
            .parse_owner_ids("drwxr-xr-x. 12 0 0 4096 Jan  1  2024 /etc")
            .unwrap();
        assert_eq!(ids, (0, 0));
    }

    #[test]
    fn rejects_unexpected_ls_output() {
        let err = GnuDialect.parse_owner_ids("ls: cannot access").unwrap_err();
        assert_eq!(err.code, "PARSE_ERROR");
        assert!(GnuDialect.parse_owner_ids("").is_err());
    }

    #[test]
    fn parses_lsattr_flags() {
        let attrs = GnuDialect
            .parse_attributes("----i-A-----------e------- /srv/data\n")
            .unwrap();
        assert!(attrs.immutable);
        assert!(attrs.no_atime);
        assert!(!attrs.append_only);
        assert!(!attrs.no_cow);
    }

    #[test]
    fn flag_parsing_ignores_the_path() {
        // Paths containing flag letters must not leak into the result.
        let attrs = GnuDialect
            .parse_attributes("-------------------- /iaSAcCu-dir")
            .unwrap();
        assert_eq!(attrs, FileAttributes::default());
    }

    #[test]
    fn diff_splits_added_and_removed_flags() {
        let current = FileAttributes {
            append_only: true,
            no_dump: true,
            ..Default::default()
        };
        let desired = FileAttributes {
            immutable: true,
            no_dump: true,
            no_cow: true,
            ..Default::default()
        };
        assert_eq!(desired.diff(&current), ("iC".to_string(), "a".to_string()));
        assert_eq!(current.diff(&current), (String::new(), String::new()));
    }

    #[test]
    fn commands_quote_paths() {
        let dialect = GnuDialect;
        assert_eq!(
            dialect.chown_command("/tmp/a b", "alice", "staff"),
            "chown 'alice:staff' -- '/tmp/a b'"
        );
        assert_eq!(
            dialect.change_attributes_command("/x", AttributeChange::Remove, "ia"),
            "chattr -ia '/x'"
        );
        assert_eq!(dialect.parse_name("alice\n"), Some("alice".to_string()));
        assert_eq!(dialect.parse_name("\n"), None);
    }
}
