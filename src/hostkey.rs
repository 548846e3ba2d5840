//! Host key verification against the user's OpenSSH known-hosts file.
//!
//! Unknown keys trigger an interactive prompt; accepted keys are appended so
//! later lookups succeed without prompting. A changed key is always fatal.

use std::fs::OpenOptions;
use std::io::Write;
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use sha2::{Digest, Sha256};
use ssh2::{CheckResult, HostKeyType, KnownHostFileKind, Session};
use tracing::warn;

use crate::errors::{RecoveryError, Result};

/// `~/.ssh/known_hosts`.
pub fn default_known_hosts_path() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| {
        RecoveryError::Config("could not determine the user home directory".to_string())
    })?;
    Ok(home.join(".ssh").join("known_hosts"))
}

/// Checks the session's host key against the known-hosts file, prompting the
/// operator for unknown hosts. The file is re-read on every connection so
/// appends made by earlier sessions are observed.
pub fn verify_host_key(session: &Session, hostname: &str, remote: &SocketAddr) -> Result<()> {
    let path = default_known_hosts_path()?;
    verify_host_key_with_file(session, hostname, remote, &path)
}

fn verify_host_key_with_file(
    session: &Session,
    hostname: &str,
    remote: &SocketAddr,
    known_hosts_path: &Path,
) -> Result<()> {
    ensure_known_hosts_file(known_hosts_path)?;

    let (key, key_type) = session.host_key().ok_or_else(|| {
        RecoveryError::Transport("SSH session did not provide host key bytes".to_string())
    })?;

    let mut known_hosts = session.known_hosts().map_err(|error| {
        RecoveryError::Transport(format!("failed to initialize known hosts: {error}"))
    })?;
    if let Err(error) = known_hosts.read_file(known_hosts_path, KnownHostFileKind::OpenSSH) {
        // An unreadable or partially invalid file is treated as unknown-host
        // territory so the operator can still accept the key.
        warn!(
            "failed to read known hosts file {}: {error}",
            known_hosts_path.display()
        );
    }

    match known_hosts.check_port(hostname, remote.port(), key) {
        CheckResult::Match => Ok(()),
        CheckResult::Mismatch => Err(RecoveryError::HostKey(format!(
            "remote host identification has changed for '{hostname}'; \
             refusing to connect (possible man-in-the-middle attack)"
        ))),
        CheckResult::NotFound | CheckResult::Failure => {
            prompt_and_add_host_key(hostname, remote, key, key_type, known_hosts_path)
        }
    }
}

fn prompt_and_add_host_key(
    hostname: &str,
    remote: &SocketAddr,
    key: &[u8],
    key_type: HostKeyType,
    known_hosts_path: &Path,
) -> Result<()> {
    let fingerprint = fingerprint(key);
    let type_name = key_type_name(key_type);

    println!("\nThe authenticity of host '{hostname} ({remote})' can't be established.");
    println!("{type_name} key fingerprint is {fingerprint}.");
    println!("This key is not known by any other names.");
    print!("Are you sure you want to continue connecting (yes/no/[fingerprint])? ");
    std::io::stdout().flush().map_err(|error| {
        RecoveryError::Transport(format!("failed to flush prompt: {error}"))
    })?;

    let mut response = String::new();
    std::io::stdin().read_line(&mut response).map_err(|error| {
        RecoveryError::Transport(format!("failed to read user input: {error}"))
    })?;

    if !is_accepted(&response, &fingerprint) {
        return Err(RecoveryError::HostKey(
            "host key verification cancelled by user".to_string(),
        ));
    }

    append_host_key(known_hosts_path, hostname, remote, type_name, key)?;

    println!("Warning: Permanently added '{hostname}' ({type_name}) to the list of known hosts.");
    Ok(())
}

/// OpenSSH-style SHA-256 fingerprint of a wire-format public key.
pub fn fingerprint(key: &[u8]) -> String {
    let digest = Sha256::digest(key);
    format!("SHA256:{}", STANDARD_NO_PAD.encode(digest))
}

/// `yes`, `y` or the exact fingerprint (case-insensitive) accept the key.
pub fn is_accepted(response: &str, fingerprint: &str) -> bool {
    let response = response.trim().to_lowercase();
    response == "yes" || response == "y" || response == fingerprint.to_lowercase()
}

pub fn key_type_name(key_type: HostKeyType) -> &'static str {
    match key_type {
        HostKeyType::Rsa => "ssh-rsa",
        HostKeyType::Dss => "ssh-dss",
        HostKeyType::Ecdsa256 => "ecdsa-sha2-nistp256",
        HostKeyType::Ecdsa384 => "ecdsa-sha2-nistp384",
        HostKeyType::Ecdsa521 => "ecdsa-sha2-nistp521",
        HostKeyType::Ed25519 => "ssh-ed25519",
        HostKeyType::Unknown => "unknown",
    }
}

/// Formats a known-hosts line carrying the logical hostname and the numeric
/// address when it differs, so lookups by either succeed.
pub fn known_hosts_line(hostname: &str, remote_ip: &str, type_name: &str, key: &[u8]) -> String {
    let names = if remote_ip.is_empty() || remote_ip == hostname {
        hostname.to_string()
    } else {
        format!("{hostname},{remote_ip}")
    };
    format!("{names} {type_name} {}", STANDARD.encode(key))
}

fn append_host_key(
    known_hosts_path: &Path,
    hostname: &str,
    remote: &SocketAddr,
    type_name: &str,
    key: &[u8],
) -> Result<()> {
    let line = known_hosts_line(hostname, &remote.ip().to_string(), type_name, key);

    let mut file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(known_hosts_path)
        .map_err(|error| {
            RecoveryError::Transport(format!(
                "failed to open known hosts file {}: {error}",
                known_hosts_path.display()
            ))
        })?;
    writeln!(file, "{line}").map_err(|error| {
        RecoveryError::Transport(format!(
            "failed to write to known hosts file {}: {error}",
            known_hosts_path.display()
        ))
    })?;

    Ok(())
}

fn ensure_known_hosts_file(known_hosts_path: &Path) -> Result<()> {
    if let Some(parent) = known_hosts_path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
            std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
        }
    }

    if !known_hosts_path.exists() {
        std::fs::File::create(known_hosts_path)?;
        std::fs::set_permissions(known_hosts_path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{fingerprint, is_accepted, key_type_name, known_hosts_line};
    use ssh2::HostKeyType;

    #[test]
    fn fingerprint_is_openssh_formatted() {
        let value = fingerprint(b"some wire format key");

        assert!(value.starts_with("SHA256:"));
        // OpenSSH fingerprints drop the base64 padding.
        assert!(!value.ends_with('='));
        assert_eq!(value, fingerprint(b"some wire format key"));
        assert_ne!(value, fingerprint(b"another key"));
    }

    #[test]
    fn acceptance_matches_yes_y_or_fingerprint() {
        let print = "SHA256:AbCdEf";

        assert!(is_accepted("yes\n", print));
        assert!(is_accepted(" y ", print));
        assert!(is_accepted("sha256:abcdef", print));
        assert!(!is_accepted("no", print));
        assert!(!is_accepted("", print));
        assert!(!is_accepted("SHA256:other", print));
    }

    #[test]
    fn line_contains_hostname_and_distinct_address() {
        let line = known_hosts_line("etcd-vm1", "10.0.0.7", "ssh-ed25519", b"key");
        let mut fields = line.split_whitespace();

        assert_eq!(fields.next(), Some("etcd-vm1,10.0.0.7"));
        assert_eq!(fields.next(), Some("ssh-ed25519"));
        assert!(fields.next().is_some());
        assert_eq!(fields.next(), None);
    }

    #[test]
    fn line_omits_duplicate_address() {
        let line = known_hosts_line("10.0.0.7", "10.0.0.7", "ssh-rsa", b"key");
        assert!(line.starts_with("10.0.0.7 ssh-rsa "));
    }

    #[test]
    fn key_type_names_match_openssh() {
        assert_eq!(key_type_name(HostKeyType::Ed25519), "ssh-ed25519");
        assert_eq!(key_type_name(HostKeyType::Rsa), "ssh-rsa");
        assert_eq!(key_type_name(HostKeyType::Ecdsa256), "ecdsa-sha2-nistp256");
    }
}
