use std::fmt;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::errors::{RecoveryError, Result};
use crate::ssh_client::SshClient;

pub const DEFAULT_CONFIG_FILENAME: &str = "hosts.json";

/// A control-plane target from the hosts file.
///
/// Exactly one of `password` / `private_key` must be set; `member_name` is
/// the etcd `--name` and falls back to the remote hostname when empty.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_name: Option<String>,
    pub host: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub backedup_manifest: String,
}

impl Host {
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref().filter(|value| !value.trim().is_empty())
    }

    pub fn private_key(&self) -> Option<&str> {
        self.private_key.as_deref().filter(|value| !value.trim().is_empty())
    }

    pub fn passphrase(&self) -> Option<&str> {
        self.passphrase.as_deref().filter(|value| !value.trim().is_empty())
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(RecoveryError::Config("host name cannot be empty".to_string()));
        }
        if self.host.trim().is_empty() {
            return Err(RecoveryError::Config(format!(
                "host `{}` address cannot be empty",
                self.name
            )));
        }
        if self.username.trim().is_empty() {
            return Err(RecoveryError::Config(format!(
                "host `{}` username cannot be empty",
                self.name
            )));
        }
        match (self.password(), self.private_key()) {
            (Some(_), Some(_)) => Err(RecoveryError::Config(format!(
                "host `{}`: password and private_key are mutually exclusive",
                self.name
            ))),
            (None, None) => Err(RecoveryError::Config(format!(
                "host `{}`: no private key/password found to configure SSH auth",
                self.name
            ))),
            _ => Ok(()),
        }
    }

    /// The backup manifest is required for any host that creates the
    /// single-member cluster or gets started as a learner.
    pub fn require_backup_manifest(&self) -> Result<()> {
        if self.backedup_manifest.trim().is_empty() {
            return Err(RecoveryError::Config(format!(
                "host `{}`: backup manifest path not provided in hosts.json",
                self.name
            )));
        }
        Ok(())
    }

    /// Returns the configured `member_name`, or resolves it at runtime by
    /// running `hostname` on the target.
    pub fn fetch_member_name(&self) -> Result<String> {
        if let Some(name) = self.member_name.as_deref().filter(|value| !value.is_empty()) {
            return Ok(name.to_string());
        }

        let client = SshClient::connect(self).map_err(|error| {
            RecoveryError::Transport(format!(
                "failed to connect to host {} to fetch hostname: {error}",
                self.host
            ))
        })?;
        let result = client.run("hostname").map_err(|error| {
            RecoveryError::Transport(format!(
                "failed to fetch hostname of remote machine: {error}"
            ))
        })?;
        if result.exit_code != 0 {
            return Err(RecoveryError::Validation(format!(
                "`hostname` on {} exited with status {}: {}",
                self.host, result.exit_code, result.output
            )));
        }
        Ok(result.output.trim().to_string())
    }
}

// Credentials must never leak into logs, so Debug masks them.
impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("name", &self.name)
            .field("member_name", &self.member_name)
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("private_key", &self.private_key)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "***"))
            .field("backedup_manifest", &self.backedup_manifest)
            .finish()
    }
}

/// Loads and validates the hosts file (a JSON array of [`Host`]).
pub fn load_hosts(path: &str) -> Result<Vec<Host>> {
    let data = std::fs::read_to_string(path).map_err(|error| {
        RecoveryError::Config(format!("failed to read hosts file `{path}`: {error}"))
    })?;

    let hosts: Vec<Host> = serde_json::from_str(&data).map_err(|error| {
        RecoveryError::Config(format!("failed to parse hosts file `{path}`: {error}"))
    })?;

    if hosts.is_empty() {
        return Err(RecoveryError::Config(format!(
            "hosts file `{path}` should contain at least one host"
        )));
    }
    for host in &hosts {
        host.validate()?;
    }

    Ok(hosts)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RepairMode {
    /// Add a new member to an existing cluster
    Add,
    /// Create a single-member etcd cluster
    Create,
    /// Run both create and add actions sequentially
    Both,
}

impl fmt::Display for RepairMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RepairMode::Add => "add",
            RepairMode::Create => "create",
            RepairMode::Both => "both",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::{load_hosts, Host};

    fn write_hosts_file(content: &str) -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("hosts.json");
        std::fs::write(&path, content).expect("write hosts file");
        let path = path.to_string_lossy().to_string();
        (dir, path)
    }

    #[test]
    fn parses_hosts_file() {
        let (_dir, path) = write_hosts_file(
            r#"[
                {
                    "name": "etcd-vm1",
                    "member_name": "4227fecd97945f54e50b8b5b21f88e62",
                    "host": "10.100.72.7",
                    "username": "root",
                    "password": "changeme",
                    "backedup_manifest": "/root/etcd.yaml"
                },
                {
                    "name": "etcd-vm2",
                    "host": "10.100.72.8",
                    "username": "capv",
                    "private_key": "/home/capv/.ssh/id_rsa",
                    "passphrase": "secret",
                    "backedup_manifest": "/root/etcd.yaml"
                }
            ]"#,
        );

        let hosts = load_hosts(&path).expect("load hosts");

        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[0].name, "etcd-vm1");
        assert_eq!(
            hosts[0].member_name.as_deref(),
            Some("4227fecd97945f54e50b8b5b21f88e62")
        );
        assert_eq!(hosts[0].password(), Some("changeme"));
        assert_eq!(hosts[0].private_key(), None);
        assert_eq!(hosts[1].private_key(), Some("/home/capv/.ssh/id_rsa"));
        assert_eq!(hosts[1].passphrase(), Some("secret"));
        assert_eq!(hosts[1].backedup_manifest, "/root/etcd.yaml");
    }

    #[test]
    fn serialisation_round_trip_preserves_fields() {
        let host = Host {
            name: "etcd-vm1".to_string(),
            member_name: None,
            host: "10.0.0.1".to_string(),
            username: "root".to_string(),
            password: Some("changeme".to_string()),
            private_key: None,
            passphrase: None,
            backedup_manifest: "/root/etcd.yaml".to_string(),
        };

        let json = serde_json::to_string(&host).expect("serialize");
        let parsed: Host = serde_json::from_str(&json).expect("parse");

        assert_eq!(parsed, host);
        // Unset optionals stay out of the serialised form.
        assert!(!json.contains("member_name"));
        assert!(!json.contains("private_key"));
    }

    #[test]
    fn empty_hosts_file_is_a_config_error() {
        let (_dir, path) = write_hosts_file("[]");

        let error = load_hosts(&path).expect_err("empty file must fail");
        assert!(error.to_string().contains("at least one host"));
    }

    #[test]
    fn both_credentials_are_rejected() {
        let (_dir, path) = write_hosts_file(
            r#"[{
                "name": "etcd-vm1",
                "host": "10.0.0.1",
                "username": "root",
                "password": "changeme",
                "private_key": "/root/.ssh/id_rsa"
            }]"#,
        );

        let error = load_hosts(&path).expect_err("conflicting credentials must fail");
        assert!(error.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn missing_credentials_are_rejected() {
        let (_dir, path) = write_hosts_file(
            r#"[{"name": "etcd-vm1", "host": "10.0.0.1", "username": "root"}]"#,
        );

        let error = load_hosts(&path).expect_err("credential-less host must fail");
        assert!(error.to_string().contains("no private key/password"));
    }

    #[test]
    fn backup_manifest_requirement() {
        let mut host = Host {
            name: "etcd-vm1".to_string(),
            member_name: None,
            host: "10.0.0.1".to_string(),
            username: "root".to_string(),
            password: Some("changeme".to_string()),
            private_key: None,
            passphrase: None,
            backedup_manifest: String::new(),
        };

        let error = host.require_backup_manifest().expect_err("must fail");
        assert!(error.to_string().contains("backup manifest path not provided"));

        host.backedup_manifest = "  ".to_string();
        assert!(host.require_backup_manifest().is_err());

        host.backedup_manifest = "/root/etcd.yaml".to_string();
        assert!(host.require_backup_manifest().is_ok());
    }

    #[test]
    fn debug_masks_secrets() {
        let host = Host {
            name: "etcd-vm1".to_string(),
            member_name: None,
            host: "10.0.0.1".to_string(),
            username: "root".to_string(),
            password: Some("changeme".to_string()),
            private_key: None,
            passphrase: Some("secret".to_string()),
            backedup_manifest: String::new(),
        };

        let printed = format!("{host:?}");
        assert!(!printed.contains("changeme"));
        assert!(!printed.contains("secret"));
        assert!(printed.contains("***"));
    }
}
