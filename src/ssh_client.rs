use std::fmt;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ssh2::{ErrorCode, OpenFlags, OpenType, Session};
use tracing::debug;

use crate::errors::{RecoveryError, Result};
use crate::hostkey;
use crate::models::Host;

pub const SSH_TIMEOUT_SECONDS: u64 = 20;
pub const DEFAULT_PORT: u16 = 22;

// SFTP status code for SSH_FX_PERMISSION_DENIED.
const SFTP_PERMISSION_DENIED: i32 = 3;

/// Combined output and exit status of one remote command.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub output: String,
    pub exit_code: i32,
}

/// An authenticated SSH session to one control-plane host.
pub struct SshClient {
    session: Session,
    username: String,
    host: String,
}

impl SshClient {
    /// Dials `host:22`, verifies the host key against the user's known-hosts
    /// file (prompting for unknown keys) and authenticates with the host's
    /// configured credentials. Fails before dialling when neither a password
    /// nor a private key is configured.
    pub fn connect(host: &Host) -> Result<SshClient> {
        host.validate()?;

        let socket_address = format!("{}:{}", host.host, DEFAULT_PORT);
        let resolved_socket = socket_address
            .to_socket_addrs()
            .map_err(|error| {
                RecoveryError::Transport(format!(
                    "failed to resolve host `{socket_address}`: {error}"
                ))
            })?
            .next()
            .ok_or_else(|| {
                RecoveryError::Transport(format!(
                    "no resolved socket address for `{socket_address}`"
                ))
            })?;

        let tcp_stream = TcpStream::connect_timeout(
            &resolved_socket,
            Duration::from_secs(SSH_TIMEOUT_SECONDS),
        )
        .map_err(|error| {
            RecoveryError::Transport(format!(
                "failed to establish TCP connection to `{socket_address}`: {error}"
            ))
        })?;

        let mut session = Session::new().map_err(|error| {
            RecoveryError::Transport(format!("failed to initialize SSH session: {error}"))
        })?;
        session.set_tcp_stream(tcp_stream);
        session.handshake().map_err(|error| {
            RecoveryError::Transport(format!(
                "SSH handshake failed for `{socket_address}`: {error}"
            ))
        })?;

        hostkey::verify_host_key(&session, &host.host, &resolved_socket)?;

        if let Some(password) = host.password() {
            session
                .userauth_password(&host.username, password)
                .map_err(|error| {
                    RecoveryError::Transport(format!(
                        "SSH password authentication failed for `{}`: {error}",
                        host.host
                    ))
                })?;
        } else if let Some(private_key) = host.private_key() {
            session
                .userauth_pubkey_file(
                    &host.username,
                    None,
                    Path::new(private_key),
                    host.passphrase(),
                )
                .map_err(|error| {
                    RecoveryError::Transport(format!(
                        "SSH private-key authentication failed for `{}`: {error}",
                        host.host
                    ))
                })?;
        }

        if !session.authenticated() {
            return Err(RecoveryError::Transport(format!(
                "SSH authentication was rejected by `{}`",
                host.host
            )));
        }

        Ok(SshClient {
            session,
            username: host.username.clone(),
            host: host.host.clone(),
        })
    }

    /// Runs a command in a fresh exec channel and returns its combined
    /// output and exit status.
    pub fn run(&self, command: &str) -> Result<CommandResult> {
        debug!(host = %self.host, %command, "running remote command");

        let mut channel = self.session.channel_session().map_err(|error| {
            RecoveryError::Transport(format!("failed to open SSH channel: {error}"))
        })?;
        channel.exec(command).map_err(|error| {
            RecoveryError::Transport(format!("failed to execute remote command: {error}"))
        })?;

        let mut output = String::new();
        channel.read_to_string(&mut output).map_err(|error| {
            RecoveryError::Transport(format!("failed to read SSH stdout: {error}"))
        })?;
        channel
            .stderr()
            .read_to_string(&mut output)
            .map_err(|error| {
                RecoveryError::Transport(format!("failed to read SSH stderr: {error}"))
            })?;

        channel.wait_close().map_err(|error| {
            RecoveryError::Transport(format!(
                "failed while waiting for SSH command close: {error}"
            ))
        })?;
        let exit_code = channel.exit_status().map_err(|error| {
            RecoveryError::Transport(format!("failed to obtain SSH exit status: {error}"))
        })?;

        Ok(CommandResult { output, exit_code })
    }

    /// Like [`SshClient::run`] but fails unless the command exits 0.
    pub fn run_checked(&self, command: &str) -> Result<String> {
        let result = self.run(command)?;
        if result.exit_code != 0 {
            return Err(RecoveryError::Transport(format!(
                "command `{command}` exited with status {}: {}",
                result.exit_code,
                result.output.trim()
            )));
        }
        Ok(result.output)
    }

    /// Uploads a local file, preserving its permission bits. On a
    /// permission-denied error the file goes through a `/tmp` staging path
    /// and is moved into place with sudo.
    pub fn upload(&self, local_path: &Path, remote_path: &str) -> Result<()> {
        let metadata = std::fs::metadata(local_path).map_err(|error| {
            RecoveryError::Transport(format!(
                "failed to stat local file `{}`: {error}",
                local_path.display()
            ))
        })?;
        let mode = metadata.permissions().mode() & 0o777;

        match self.sftp_upload(local_path, remote_path, mode) {
            Ok(()) => Ok(()),
            Err(error) if error.is_permission_denied() => {
                self.sudo_upload(local_path, remote_path, mode)
            }
            Err(error) => Err(RecoveryError::Transport(format!(
                "failed to upload `{remote_path}`: {error}"
            ))),
        }
    }

    fn sftp_upload(
        &self,
        local_path: &Path,
        remote_path: &str,
        mode: u32,
    ) -> std::result::Result<(), TransferError> {
        let data = std::fs::read(local_path)?;

        let sftp = self.session.sftp()?;
        let mut remote_file = sftp.open_mode(
            Path::new(remote_path),
            OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
            mode as i32,
            OpenType::File,
        )?;
        remote_file.write_all(&data)?;

        Ok(())
    }

    // Stage in /tmp, then sudo mv into place and restore the mode bits. The
    // staging file is removed on every exit path.
    fn sudo_upload(&self, local_path: &Path, remote_path: &str, mode: u32) -> Result<()> {
        let temp_path = make_temp_path(remote_path);

        self.sftp_upload(local_path, &temp_path, mode)
            .map_err(|error| {
                RecoveryError::Transport(format!(
                    "failed to upload to temp path {temp_path}: {error}"
                ))
            })?;

        let result = (|| {
            self.run_checked(&format!("sudo mv {temp_path} {remote_path}"))
                .map_err(|error| {
                    RecoveryError::Transport(format!(
                        "failed to sudo mv from {temp_path} to {remote_path}: {error}"
                    ))
                })?;
            self.run_checked(&format!("sudo chmod {mode:o} {remote_path}"))
                .map_err(|error| {
                    RecoveryError::Transport(format!(
                        "failed to sudo chmod on {remote_path}: {error}"
                    ))
                })?;
            Ok(())
        })();

        let _ = self.run(&format!("sudo rm -f {temp_path}"));

        result
    }

    /// Downloads a remote file, preserving its permission bits. On a
    /// permission-denied error the file is first copied to `/tmp` with sudo
    /// and chowned to the connection user.
    pub fn download(&self, remote_path: &str, local_path: &Path) -> Result<()> {
        match self.sftp_download(remote_path, local_path) {
            Ok(()) => Ok(()),
            Err(error) if error.is_permission_denied() => {
                self.sudo_download(remote_path, local_path)
            }
            Err(error) => Err(RecoveryError::Transport(format!(
                "failed to download `{remote_path}`: {error}"
            ))),
        }
    }

    fn sftp_download(
        &self,
        remote_path: &str,
        local_path: &Path,
    ) -> std::result::Result<(), TransferError> {
        let sftp = self.session.sftp()?;
        let mut remote_file = sftp.open(Path::new(remote_path))?;
        let stat = remote_file.stat()?;

        let mut data = Vec::new();
        remote_file.read_to_end(&mut data)?;
        std::fs::write(local_path, &data)?;

        if let Some(perm) = stat.perm {
            std::fs::set_permissions(
                local_path,
                std::fs::Permissions::from_mode(perm & 0o777),
            )?;
        }

        Ok(())
    }

    fn sudo_download(&self, remote_path: &str, local_path: &Path) -> Result<()> {
        let temp_path = make_temp_path(remote_path);

        self.run_checked(&format!("sudo cp -p {remote_path} {temp_path}"))
            .map_err(|error| {
                RecoveryError::Transport(format!(
                    "failed to sudo cp to {temp_path}: {error}"
                ))
            })?;

        let result = (|| {
            self.run_checked(&format!("sudo chown {} {temp_path}", self.username))
                .map_err(|error| {
                    RecoveryError::Transport(format!(
                        "failed to sudo chown on {temp_path}: {error}"
                    ))
                })?;
            self.sftp_download(&temp_path, local_path).map_err(|error| {
                RecoveryError::Transport(format!(
                    "failed to download `{temp_path}`: {error}"
                ))
            })
        })();

        let _ = self.run(&format!("sudo rm -f {temp_path}"));

        result
    }

    /// Closes the underlying session. Dropping the client has the same
    /// effect; this exists for call sites that want the disconnect to be
    /// explicit.
    pub fn close(self) {
        let _ = self.session.disconnect(None, "closing session", None);
    }
}

enum TransferError {
    Io(std::io::Error),
    Ssh(ssh2::Error),
}

impl TransferError {
    // Error-kind first, then the SFTP status code, then a case-insensitive
    // substring fallback.
    fn is_permission_denied(&self) -> bool {
        match self {
            TransferError::Io(error) if error.kind() == std::io::ErrorKind::PermissionDenied => {
                true
            }
            TransferError::Ssh(error)
                if error.code() == ErrorCode::SFTP(SFTP_PERMISSION_DENIED) =>
            {
                true
            }
            other => {
                let message = other.to_string().to_lowercase();
                message.contains("permission denied")
                    || message.contains("ssh_fx_permission_denied")
            }
        }
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::Io(error) => error.fmt(f),
            TransferError::Ssh(error) => error.fmt(f),
        }
    }
}

impl From<std::io::Error> for TransferError {
    fn from(error: std::io::Error) -> Self {
        TransferError::Io(error)
    }
}

impl From<ssh2::Error> for TransferError {
    fn from(error: ssh2::Error) -> Self {
        TransferError::Ssh(error)
    }
}

/// Builds a time-uniquified staging path under /tmp for the sudo fallbacks.
fn make_temp_path(base_path: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    let base_name = Path::new(base_path)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    format!("/tmp/etcd-recovery_{nanos}_{base_name}")
}

#[cfg(test)]
mod tests {
    use super::{make_temp_path, TransferError};

    #[test]
    fn temp_path_is_uniquified_and_keeps_base_name() {
        let path = make_temp_path("/etc/kubernetes/manifests/etcd.yaml");

        assert!(path.starts_with("/tmp/etcd-recovery_"));
        assert!(path.ends_with("_etcd.yaml"));
    }

    #[test]
    fn permission_denied_detected_by_error_kind() {
        let error = TransferError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "nope",
        ));
        assert!(error.is_permission_denied());
    }

    #[test]
    fn permission_denied_detected_by_substring_fallback() {
        let error = TransferError::Io(std::io::Error::other("server said Permission Denied"));
        assert!(error.is_permission_denied());

        let unrelated = TransferError::Io(std::io::Error::other("connection reset"));
        assert!(!unrelated.is_permission_denied());
    }
}
