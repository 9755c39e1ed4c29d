//! Transport seam between the pool and a concrete SSH implementation.
//!
//! `Connector` opens authenticated sessions; `RemoteChannel` is one open
//! session with its SFTP sub-channel. Calls are blocking and must run off the
//! async executor.

use crate::errors::ToolError;
use crate::services::connection::SshConnection;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemoteStat {
    pub size: Option<u64>,
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub is_dir: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteDirEntry {
    pub path: String,
    pub stat: RemoteStat,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

pub trait RemoteChannel: Send {
    /// Cheap probe of the underlying transport; must not wait on the peer.
    fn is_alive(&mut self) -> bool;

    /// Missing paths surface as `ToolErrorKind::NotFound`.
    fn stat(&mut self, path: &str) -> Result<RemoteStat, ToolError>;

    fn mkdir(&mut self, path: &str, mode: u32) -> Result<(), ToolError>;

    fn rmdir(&mut self, path: &str) -> Result<(), ToolError>;

    fn unlink(&mut self, path: &str) -> Result<(), ToolError>;

    /// Entries of `path`, excluding `.` and `..`, with full paths.
    fn read_dir(&mut self, path: &str) -> Result<Vec<RemoteDirEntry>, ToolError>;

    /// Creates or truncates `path` and writes `content`.
    fn write_file(&mut self, path: &str, content: &[u8]) -> Result<(), ToolError>;

    fn read_file(&mut self, path: &str) -> Result<Vec<u8>, ToolError>;

    fn chmod(&mut self, path: &str, mode: u32) -> Result<(), ToolError>;

    /// Runs a one-shot command on its own exec channel.
    fn exec(&mut self, command: &str) -> Result<ExecOutput, ToolError>;

    fn close(&mut self) -> Result<(), ToolError>;
}

pub trait Connector: Send + Sync {
    fn connect(&self, connection: &SshConnection) -> Result<Box<dyn RemoteChannel>, ToolError>;
}
