use crate::errors::ToolError;
use crate::services::connection::{HostKeyPolicy, SshConnection};
use crate::services::logger::Logger;
use crate::services::transport::{Connector, ExecOutput, RemoteChannel, RemoteDirEntry, RemoteStat};
use base64::Engine;
use ssh2::{Channel, CheckResult, FileStat, KnownHostFileKind, OpenFlags, OpenType, Session, Sftp};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::{Duration, Instant};

/// Opens sessions with libssh2 over a plain TCP socket.
#[derive(Clone)]
pub struct Ssh2Connector {
    logger: Logger,
}

impl Ssh2Connector {
    pub fn new(logger: Logger) -> Self {
        Self {
            logger: logger.child("ssh2"),
        }
    }
}

impl Connector for Ssh2Connector {
    fn connect(&self, connection: &SshConnection) -> Result<Box<dyn RemoteChannel>, ToolError> {
        let session = connect_session(connection).map_err(|err| {
            self.logger.warn(
                "SSH connect failed",
                Some(&serde_json::json!({
                    "host": connection.host,
                    "port": connection.port,
                    "username": connection.username,
                    "code": err.code,
                    "error": err.message,
                })),
            );
            err
        })?;
        let sftp = session
            .sftp()
            .map_err(|err| map_ssh_error(err).context("failed to create SFTP client"))?;
        self.logger.debug(
            "SSH session opened",
            Some(&serde_json::json!({
                "host": connection.host,
                "port": connection.port,
                "username": connection.username,
            })),
        );
        Ok(Box::new(Ssh2Channel {
            session,
            sftp,
            operation_timeout: Duration::from_millis(connection.operation_timeout_ms),
        }))
    }
}

pub struct Ssh2Channel {
    session: Session,
    sftp: Sftp,
    operation_timeout: Duration,
}

#[derive(Debug)]
enum Drained {
    Data,
    Idle,
}

fn drain_stream(stream: &mut impl Read, buf: &mut [u8], out: &mut Vec<u8>) -> Result<Drained, ToolError> {
    match stream.read(buf) {
        Ok(0) => Ok(Drained::Idle),
        Ok(n) => {
            out.extend_from_slice(&buf[..n]);
            Ok(Drained::Data)
        }
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(Drained::Idle),
        Err(err) => Err(err.into()),
    }
}

/// Reads stdout and stderr together so neither stream can fill the channel
/// window while the other is being read. The session must be non-blocking.
fn drain_output(channel: &mut Channel, timeout: Duration) -> Result<(Vec<u8>, Vec<u8>), ToolError> {
    let started = Instant::now();
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let out = drain_stream(channel, &mut buf, &mut stdout)?;
        let err = drain_stream(&mut channel.stderr(), &mut buf, &mut stderr)?;
        if matches!((out, err), (Drained::Idle, Drained::Idle)) {
            if channel.eof() {
                return Ok((stdout, stderr));
            }
            if started.elapsed() > timeout {
                return Err(ToolError::timeout("remote command timed out"));
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

fn dial(connection: &SshConnection) -> Result<TcpStream, ToolError> {
    let timeout = Duration::from_millis(connection.ready_timeout_ms);
    let addrs = (connection.host.as_str(), connection.port)
        .to_socket_addrs()
        .map_err(|err| {
            ToolError::connect_failed(format!(
                "failed to resolve {}:{}: {}",
                connection.host, connection.port, err
            ))
        })?;
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(tcp) => {
                tcp.set_read_timeout(Some(timeout)).ok();
                tcp.set_write_timeout(Some(timeout)).ok();
                return Ok(tcp);
            }
            Err(err) => last_err = Some(err),
        }
    }
    Err(ToolError::connect_failed(format!(
        "failed to connect to SSH server {}:{}: {}",
        connection.host,
        connection.port,
        last_err
            .map(|err| err.to_string())
            .unwrap_or_else(|| "no addresses resolved".to_string())
    )))
}

fn connect_session(connection: &SshConnection) -> Result<Session, ToolError> {
    if !connection.has_credentials() {
        return Err(ToolError::auth_failed("no authentication method provided"));
    }
    let tcp = dial(connection)?;

    let mut session = Session::new()
        .map_err(|_| ToolError::internal("Failed to create SSH session"))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(u32::try_from(connection.ready_timeout_ms).unwrap_or(u32::MAX));
    session.handshake().map_err(|err| {
        ToolError::connect_failed(format!("SSH handshake failed: {}", err.message()))
    })?;

    verify_host_key(&session, connection)?;

    if let Some(key) = connection.private_key.as_deref().filter(|k| !k.is_empty()) {
        if let Err(err) = session.userauth_pubkey_memory(
            &connection.username,
            None,
            key,
            connection.passphrase.as_deref(),
        ) {
            if connection.password.is_none() {
                return Err(ToolError::auth_failed(format!(
                    "private key authentication failed: {}",
                    err.message()
                )));
            }
        }
    }
    if !session.authenticated() {
        if let Some(password) = connection.password.as_deref().filter(|p| !p.is_empty()) {
            session
                .userauth_password(&connection.username, password)
                .map_err(|err| {
                    ToolError::auth_failed(format!(
                        "password authentication failed: {}",
                        err.message()
                    ))
                })?;
        }
    }
    if !session.authenticated() {
        return Err(ToolError::auth_failed("SSH authentication failed"));
    }

    let interval = std::cmp::max(1, (connection.keepalive_interval_ms / 1000) as u32);
    session.set_keepalive(true, interval);
    session.set_timeout(u32::try_from(connection.operation_timeout_ms).unwrap_or(u32::MAX));
    Ok(session)
}

fn fingerprint_host_key_sha256(session: &Session) -> Option<String> {
    let hash = session.host_key_hash(ssh2::HashType::Sha256)?;
    let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    Some(format!("SHA256:{}", encoded))
}

fn verify_host_key(session: &Session, connection: &SshConnection) -> Result<(), ToolError> {
    match &connection.host_key_policy {
        HostKeyPolicy::Accept => Ok(()),
        HostKeyPolicy::Pin { fingerprint } => {
            let observed = fingerprint_host_key_sha256(session);
            if observed.as_deref() == Some(fingerprint.as_str()) {
                return Ok(());
            }
            Err(ToolError::host_key_rejected(format!(
                "SSH host key mismatch (expected {}, got {})",
                fingerprint,
                observed.unwrap_or_else(|| "unknown".to_string())
            )))
        }
        HostKeyPolicy::KnownHosts { path } => {
            let (key, _) = session
                .host_key()
                .ok_or_else(|| ToolError::host_key_rejected("server sent no host key"))?;
            let mut known = session.known_hosts().map_err(map_ssh_error)?;
            known
                .read_file(path, KnownHostFileKind::OpenSSH)
                .map_err(|err| {
                    ToolError::host_key_rejected(format!(
                        "failed to read known_hosts {}: {}",
                        path.display(),
                        err.message()
                    ))
                })?;
            match known.check_port(&connection.host, connection.port, key) {
                CheckResult::Match => Ok(()),
                CheckResult::Mismatch => Err(ToolError::host_key_rejected(format!(
                    "host key for {} does not match {}",
                    connection.host,
                    path.display()
                ))),
                CheckResult::NotFound => Err(ToolError::host_key_rejected(format!(
                    "host {} not present in {}",
                    connection.host,
                    path.display()
                ))),
                CheckResult::Failure => Err(ToolError::host_key_rejected(
                    "known_hosts check failed",
                )),
            }
        }
    }
}

fn map_ssh_error(err: ssh2::Error) -> ToolError {
    let io_err: std::io::Error = err.into();
    match io_err.kind() {
        std::io::ErrorKind::TimedOut => ToolError::timeout("SSH operation timed out"),
        _ => ToolError::from(io_err),
    }
}

fn to_remote_stat(stat: &FileStat) -> RemoteStat {
    RemoteStat {
        size: stat.size,
        mode: stat.perm,
        uid: stat.uid,
        gid: stat.gid,
        is_dir: stat.is_dir(),
    }
}

impl RemoteChannel for Ssh2Channel {
    fn is_alive(&mut self) -> bool {
        self.session.keepalive_send().is_ok()
    }

    fn stat(&mut self, path: &str) -> Result<RemoteStat, ToolError> {
        let stat = self.sftp.stat(Path::new(path)).map_err(map_ssh_error)?;
        Ok(to_remote_stat(&stat))
    }

    fn mkdir(&mut self, path: &str, mode: u32) -> Result<(), ToolError> {
        self.sftp
            .mkdir(Path::new(path), mode as i32)
            .map_err(map_ssh_error)
    }

    fn rmdir(&mut self, path: &str) -> Result<(), ToolError> {
        self.sftp.rmdir(Path::new(path)).map_err(map_ssh_error)
    }

    fn unlink(&mut self, path: &str) -> Result<(), ToolError> {
        self.sftp.unlink(Path::new(path)).map_err(map_ssh_error)
    }

    fn read_dir(&mut self, path: &str) -> Result<Vec<RemoteDirEntry>, ToolError> {
        let entries = self.sftp.readdir(Path::new(path)).map_err(map_ssh_error)?;
        Ok(entries
            .into_iter()
            .map(|(entry_path, stat)| RemoteDirEntry {
                path: entry_path.to_string_lossy().to_string(),
                stat: to_remote_stat(&stat),
            })
            .collect())
    }

    fn write_file(&mut self, path: &str, content: &[u8]) -> Result<(), ToolError> {
        let mut file = self
            .sftp
            .open_mode(
                Path::new(path),
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                0o644,
                OpenType::File,
            )
            .map_err(map_ssh_error)?;
        file.write_all(content)?;
        file.flush()?;
        Ok(())
    }

    fn read_file(&mut self, path: &str) -> Result<Vec<u8>, ToolError> {
        let mut file = self.sftp.open(Path::new(path)).map_err(map_ssh_error)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn chmod(&mut self, path: &str, mode: u32) -> Result<(), ToolError> {
        let stat = FileStat {
            size: None,
            uid: None,
            gid: None,
            perm: Some(mode),
            atime: None,
            mtime: None,
        };
        self.sftp
            .setstat(Path::new(path), stat)
            .map_err(map_ssh_error)
    }

    fn exec(&mut self, command: &str) -> Result<ExecOutput, ToolError> {
        let mut channel = self.session.channel_session().map_err(map_ssh_error)?;
        channel.exec(command).map_err(map_ssh_error)?;
        self.session.set_blocking(false);
        let drained = drain_output(&mut channel, self.operation_timeout);
        self.session.set_blocking(true);
        let (stdout, stderr) = drained?;
        channel.wait_close().map_err(map_ssh_error)?;
        let exit_code = channel.exit_status().map_err(map_ssh_error)?;
        Ok(ExecOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    fn close(&mut self) -> Result<(), ToolError> {
        self.session
            .disconnect(None, "session closed by pool", None)
            .map_err(map_ssh_error)
    }
}

#[cfg(test)]
mod tests {
    use super::{drain_stream, Drained};
    use std::collections::VecDeque;
    use std::io::{self, Read};

    /// Replays a scripted sequence of reads, like a non-blocking channel stream.
    struct Scripted(VecDeque<io::Result<Vec<u8>>>);

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.pop_front() {
                Some(Ok(chunk)) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                Some(Err(err)) => Err(err),
                None => Ok(0),
            }
        }
    }

    #[test]
    fn would_block_is_idle_not_an_error() {
        let mut stream = Scripted(VecDeque::from([
            Err(io::Error::from(io::ErrorKind::WouldBlock)),
            Ok(b"chown: invalid user\n".to_vec()),
        ]));
        let mut buf = [0u8; 64];
        let mut out = Vec::new();

        let first = drain_stream(&mut stream, &mut buf, &mut out).unwrap();
        assert!(matches!(first, Drained::Idle));
        assert!(out.is_empty());

        let second = drain_stream(&mut stream, &mut buf, &mut out).unwrap();
        assert!(matches!(second, Drained::Data));
        assert_eq!(out, b"chown: invalid user\n");

        let eof = drain_stream(&mut stream, &mut buf, &mut out).unwrap();
        assert!(matches!(eof, Drained::Idle));
    }

    #[test]
    fn read_failures_propagate() {
        let mut stream = Scripted(VecDeque::from([Err(io::Error::from(
            io::ErrorKind::ConnectionReset,
        ))]));
        let mut buf = [0u8; 16];
        let err = drain_stream(&mut stream, &mut buf, &mut Vec::new()).unwrap_err();
        assert_eq!(err.code, "IO_ERROR");
    }
}
