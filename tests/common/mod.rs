#![allow(dead_code)]

use once_cell::sync::Lazy;
use ssh_fs::errors::ToolError;
use ssh_fs::services::connection::{HostKeyPolicy, SshConnection};
use ssh_fs::services::logger::Logger;
use ssh_fs::services::session_pool::{ConnectionPool, PoolConfig};
use ssh_fs::services::transport::{
    Connector, ExecOutput, RemoteChannel, RemoteDirEntry, RemoteStat,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub static ENV_LOCK: Lazy<tokio::sync::Mutex<()>> = Lazy::new(|| tokio::sync::Mutex::new(()));

const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;
const UMASK: u32 = 0o022;

// lsattr column order for the flags the fake host understands.
const LSATTR_ORDER: [char; 10] = ['s', 'u', 'S', 'D', 'i', 'a', 'd', 'A', 'c', 'C'];

#[derive(Clone, Debug)]
pub struct FakeNode {
    pub is_dir: bool,
    pub content: Vec<u8>,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub flags: String,
}

struct HostState {
    nodes: BTreeMap<String, FakeNode>,
    users: HashMap<u32, String>,
    groups: HashMap<u32, String>,
    generation: u64,
    connects: usize,
    closes: usize,
    refuse_connects: bool,
    commands: Vec<String>,
}

/// In-memory stand-in for a remote Linux host reachable over SSH.
#[derive(Clone)]
pub struct FakeHost {
    state: Arc<Mutex<HostState>>,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHost {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            FakeNode {
                is_dir: true,
                content: Vec::new(),
                mode: 0o755,
                uid: 0,
                gid: 0,
                flags: String::new(),
            },
        );
        let users = HashMap::from([
            (0, "root".to_string()),
            (1000, "app".to_string()),
            (1001, "alice".to_string()),
        ]);
        let groups = HashMap::from([
            (0, "root".to_string()),
            (50, "staff".to_string()),
            (1000, "app".to_string()),
        ]);
        Self {
            state: Arc::new(Mutex::new(HostState {
                nodes,
                users,
                groups,
                generation: 0,
                connects: 0,
                closes: 0,
                refuse_connects: false,
                commands: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HostState> {
        self.state.lock().unwrap()
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(FakeConnector { host: self.clone() })
    }

    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    pub fn closes(&self) -> usize {
        self.lock().closes
    }

    /// Breaks every session opened so far; later connects work again.
    pub fn drop_connections(&self) {
        self.lock().generation += 1;
    }

    pub fn refuse_connects(&self, refuse: bool) {
        self.lock().refuse_connects = refuse;
    }

    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    pub fn node(&self, path: &str) -> Option<FakeNode> {
        self.lock().nodes.get(path).cloned()
    }

    pub fn mkdir(&self, path: &str, mode: u32, uid: u32, gid: u32) {
        self.lock().nodes.insert(
            path.to_string(),
            FakeNode {
                is_dir: true,
                content: Vec::new(),
                mode,
                uid,
                gid,
                flags: String::new(),
            },
        );
    }

    pub fn put_file(&self, path: &str, content: &str, mode: u32, uid: u32, gid: u32) {
        self.lock().nodes.insert(
            path.to_string(),
            FakeNode {
                is_dir: false,
                content: content.as_bytes().to_vec(),
                mode,
                uid,
                gid,
                flags: String::new(),
            },
        );
    }

    pub fn set_flags(&self, path: &str, flags: &str) {
        if let Some(node) = self.lock().nodes.get_mut(path) {
            node.flags = flags.to_string();
        }
    }
}

pub struct FakeConnector {
    host: FakeHost,
}

impl Connector for FakeConnector {
    fn connect(&self, connection: &SshConnection) -> Result<Box<dyn RemoteChannel>, ToolError> {
        let mut state = self.host.lock();
        if state.refuse_connects {
            return Err(ToolError::connect_failed(format!(
                "connection refused by {}:{}",
                connection.host, connection.port
            )));
        }
        state.connects += 1;
        Ok(Box::new(FakeChannel {
            host: self.host.clone(),
            generation: state.generation,
            closed: false,
        }))
    }
}

pub struct FakeChannel {
    host: FakeHost,
    generation: u64,
    closed: bool,
}

fn parent(path: &str) -> String {
    match path.trim_end_matches('/').rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

fn not_found(path: &str) -> ToolError {
    ToolError::not_found(format!("no such file or directory: {}", path))
}

fn stat_of(node: &FakeNode) -> RemoteStat {
    RemoteStat {
        size: Some(node.content.len() as u64),
        mode: Some(node.mode | if node.is_dir { S_IFDIR } else { S_IFREG }),
        uid: Some(node.uid),
        gid: Some(node.gid),
        is_dir: node.is_dir,
    }
}

impl FakeChannel {
    fn state(&self) -> Result<std::sync::MutexGuard<'_, HostState>, ToolError> {
        let state = self.host.lock();
        if self.closed || state.generation != self.generation {
            return Err(ToolError::io("connection lost"));
        }
        Ok(state)
    }
}

impl RemoteChannel for FakeChannel {
    fn is_alive(&mut self) -> bool {
        !self.closed && self.host.lock().generation == self.generation
    }

    fn stat(&mut self, path: &str) -> Result<RemoteStat, ToolError> {
        let state = self.state()?;
        state.nodes.get(path).map(stat_of).ok_or_else(|| not_found(path))
    }

    fn mkdir(&mut self, path: &str, mode: u32) -> Result<(), ToolError> {
        let mut state = self.state()?;
        if state.nodes.contains_key(path) {
            return Err(ToolError::already_exists(format!("{} exists", path)));
        }
        match state.nodes.get(&parent(path)) {
            Some(node) if node.is_dir => {}
            _ => return Err(not_found(path)),
        }
        state.nodes.insert(
            path.to_string(),
            FakeNode {
                is_dir: true,
                content: Vec::new(),
                mode: mode & !UMASK,
                uid: 0,
                gid: 0,
                flags: String::new(),
            },
        );
        Ok(())
    }

    fn rmdir(&mut self, path: &str) -> Result<(), ToolError> {
        let mut state = self.state()?;
        match state.nodes.get(path) {
            Some(node) if node.is_dir => {}
            Some(_) => return Err(ToolError::io(format!("{} is not a directory", path))),
            None => return Err(not_found(path)),
        }
        let prefix = format!("{}/", path.trim_end_matches('/'));
        if state.nodes.keys().any(|key| key.starts_with(&prefix)) {
            return Err(ToolError::io(format!("{} is not empty", path)));
        }
        state.nodes.remove(path);
        Ok(())
    }

    fn unlink(&mut self, path: &str) -> Result<(), ToolError> {
        let mut state = self.state()?;
        match state.nodes.get(path) {
            Some(node) if !node.is_dir => {
                state.nodes.remove(path);
                Ok(())
            }
            Some(_) => Err(ToolError::io(format!("{} is a directory", path))),
            None => Err(not_found(path)),
        }
    }

    fn read_dir(&mut self, path: &str) -> Result<Vec<RemoteDirEntry>, ToolError> {
        let state = self.state()?;
        match state.nodes.get(path) {
            Some(node) if node.is_dir => {}
            Some(_) => return Err(ToolError::io(format!("{} is not a directory", path))),
            None => return Err(not_found(path)),
        }
        Ok(state
            .nodes
            .iter()
            .filter(|(key, _)| key.as_str() != "/" && key.as_str() != path && parent(key) == path)
            .map(|(key, node)| RemoteDirEntry {
                path: key.clone(),
                stat: stat_of(node),
            })
            .collect())
    }

    fn write_file(&mut self, path: &str, content: &[u8]) -> Result<(), ToolError> {
        let mut state = self.state()?;
        match state.nodes.get(&parent(path)) {
            Some(node) if node.is_dir => {}
            _ => return Err(not_found(path)),
        }
        match state.nodes.get_mut(path) {
            Some(node) if node.is_dir => Err(ToolError::io(format!("{} is a directory", path))),
            Some(node) if node.flags.contains('i') => {
                Err(ToolError::io(format!("permission denied: {}", path)))
            }
            Some(node) => {
                node.content = content.to_vec();
                Ok(())
            }
            None => {
                state.nodes.insert(
                    path.to_string(),
                    FakeNode {
                        is_dir: false,
                        content: content.to_vec(),
                        mode: 0o666 & !UMASK,
                        uid: 0,
                        gid: 0,
                        flags: String::new(),
                    },
                );
                Ok(())
            }
        }
    }

    fn read_file(&mut self, path: &str) -> Result<Vec<u8>, ToolError> {
        let state = self.state()?;
        match state.nodes.get(path) {
            Some(node) if !node.is_dir => Ok(node.content.clone()),
            Some(_) => Err(ToolError::io(format!("{} is a directory", path))),
            None => Err(not_found(path)),
        }
    }

    fn chmod(&mut self, path: &str, mode: u32) -> Result<(), ToolError> {
        let mut state = self.state()?;
        let node = state.nodes.get_mut(path).ok_or_else(|| not_found(path))?;
        node.mode = mode & 0o7777;
        Ok(())
    }

    fn exec(&mut self, command: &str) -> Result<ExecOutput, ToolError> {
        let mut state = self.state()?;
        state.commands.push(command.to_string());
        Ok(run_command(&mut state, &shell_words(command)))
    }

    fn close(&mut self) -> Result<(), ToolError> {
        self.closed = true;
        self.host.lock().closes += 1;
        Ok(())
    }
}

fn shell_words(command: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quoted = false;
    let mut chars = command.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                quoted = !quoted;
                in_word = true;
            }
            '\\' if !quoted => {
                if let Some(next) = chars.next() {
                    current.push(next);
                    in_word = true;
                }
            }
            c if c.is_whitespace() && !quoted => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

fn ok(stdout: String) -> ExecOutput {
    ExecOutput {
        exit_code: 0,
        stdout,
        stderr: String::new(),
    }
}

fn fail(exit_code: i32, stderr: String) -> ExecOutput {
    ExecOutput {
        exit_code,
        stdout: String::new(),
        stderr,
    }
}

fn resolve_id(names: &HashMap<u32, String>, wanted: &str) -> Option<u32> {
    if let Ok(id) = wanted.parse::<u32>() {
        return Some(id);
    }
    names
        .iter()
        .find(|(_, name)| name.as_str() == wanted)
        .map(|(id, _)| *id)
}

fn run_command(state: &mut HostState, words: &[String]) -> ExecOutput {
    let words: Vec<&str> = words.iter().map(String::as_str).collect();
    match words.as_slice() {
        ["ls", "-ldn", "--", path] => match state.nodes.get(*path) {
            Some(node) => {
                let kind = if node.is_dir { 'd' } else { '-' };
                ok(format!(
                    "{}rwxr-xr-x 1 {} {} {} Jan  1 00:00 {}\n",
                    kind,
                    node.uid,
                    node.gid,
                    node.content.len(),
                    path
                ))
            }
            None => fail(
                2,
                format!("ls: cannot access '{}': No such file or directory\n", path),
            ),
        },
        ["getent", table, id, "|", "cut", "-d:", "-f1"] => {
            let names = if *table == "passwd" {
                &state.users
            } else {
                &state.groups
            };
            // cut decides the pipeline status, so a miss is empty output.
            let name = id
                .parse::<u32>()
                .ok()
                .and_then(|id| names.get(&id).cloned())
                .map(|name| format!("{}\n", name))
                .unwrap_or_default();
            ok(name)
        }
        ["chown", spec, "--", path] => {
            let (user, group) = spec.split_once(':').unwrap_or((*spec, ""));
            let Some(uid) = resolve_id(&state.users, user) else {
                return fail(1, format!("chown: invalid user: '{}'\n", spec));
            };
            let Some(gid) = resolve_id(&state.groups, group) else {
                return fail(1, format!("chown: invalid group: '{}'\n", spec));
            };
            match state.nodes.get_mut(*path) {
                Some(node) => {
                    node.uid = uid;
                    node.gid = gid;
                    ok(String::new())
                }
                None => fail(
                    1,
                    format!("chown: cannot access '{}': No such file or directory\n", path),
                ),
            }
        }
        ["lsattr", "-d", path] => match state.nodes.get(*path) {
            Some(node) => {
                let columns: String = LSATTR_ORDER
                    .iter()
                    .map(|flag| if node.flags.contains(*flag) { *flag } else { '-' })
                    .collect();
                ok(format!("{}---------e----- {}\n", columns, path))
            }
            None => fail(
                1,
                format!("lsattr: No such file or directory while trying to stat {}\n", path),
            ),
        },
        ["chattr", change, path] => {
            let Some(node) = state.nodes.get_mut(*path) else {
                return fail(
                    1,
                    format!("chattr: No such file or directory while trying to stat {}\n", path),
                );
            };
            let (sign, flags) = change.split_at(1);
            for flag in flags.chars() {
                match sign {
                    "+" if !node.flags.contains(flag) => node.flags.push(flag),
                    "-" => node.flags.retain(|c| c != flag),
                    _ => {}
                }
            }
            ok(String::new())
        }
        _ => fail(127, format!("sh: command not found: {}\n", words.join(" "))),
    }
}

pub fn connection(host: &str) -> SshConnection {
    SshConnection::new(host, 22, "deploy", HostKeyPolicy::Accept).with_password("secret")
}

pub fn pool_with(host: &FakeHost, config: PoolConfig) -> ConnectionPool {
    ConnectionPool::new(config, host.connector(), Logger::new("test"))
}

pub fn pool(host: &FakeHost) -> ConnectionPool {
    pool_with(host, PoolConfig::default())
}

pub fn short_idle(max_connections: usize) -> PoolConfig {
    PoolConfig {
        max_idle: Duration::from_millis(20),
        max_connections,
        sweep_interval: Duration::from_millis(10),
    }
}
