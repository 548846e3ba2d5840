//! `select`: picks the best member to recover the cluster from.
//!
//! Each host's commit index is read with the etcd-diagnosis sidecar binary,
//! which is uploaded on demand when it is not already present on the target.

use std::path::Path;

use colored::Colorize;
use tracing::{info, warn};

use crate::errors::{RecoveryError, Result};
use crate::models::{load_hosts, Host};
use crate::ssh_client::SshClient;
use crate::utils::{diagnosis_binary_path, DIAGNOSIS_LOCAL_PATH, ETCD_DATA_ROOT};

pub fn run(config_file: &str) -> Result<()> {
    let hosts = load_hosts(config_file)?;

    let mut tracker = BestIndexTracker::default();
    for host in &hosts {
        info!("connecting to host ({}: {})", host.name, host.host);

        let client = match SshClient::connect(host) {
            Ok(client) => client,
            Err(error) => {
                warn!(
                    "error creating ssh client to ({}: {}): {error}",
                    host.name, host.host
                );
                continue;
            }
        };

        let target_path = diagnosis_binary_path(&host.username);
        let probe = client.run(&format!("{target_path} version"));
        if !matches!(&probe, Ok(result) if result.exit_code == 0) {
            info!(
                "uploading etcd-diagnosis to {target_path} on host ({}: {})",
                host.name, host.host
            );
            client
                .upload(Path::new(DIAGNOSIS_LOCAL_PATH), &target_path)
                .map_err(|error| {
                    RecoveryError::Transport(format!(
                        "error uploading etcd-diagnosis to {target_path} on \
                         ({}: {}): {error}",
                        host.name, host.host
                    ))
                })?;
        }

        let commit_index_command = format!("sudo {target_path} commit-index {ETCD_DATA_ROOT}");
        let result = match client.run(&commit_index_command) {
            Ok(result) if result.exit_code == 0 => result,
            Ok(result) => {
                // The data directory might have already been removed.
                warn!(
                    "error running etcd-diagnosis on ({}: {}), output:\n {}",
                    host.name, host.host, result.output
                );
                continue;
            }
            Err(error) => {
                warn!(
                    "error running etcd-diagnosis on ({}: {}): {error}",
                    host.name, host.host
                );
                continue;
            }
        };

        let commit_index: i64 = result.output.trim().parse().map_err(|error| {
            RecoveryError::Protocol(format!(
                "error converting commit index to int ({}: {}): {error}",
                host.name, host.host
            ))
        })?;
        info!(
            "member ({}: {}), commit index: {commit_index}",
            host.name, host.host
        );

        tracker.observe(host, commit_index);
    }

    println!(
        "The following members have the highest commit index ({}):",
        tracker.max_commit_index.to_string().green().bold()
    );
    for host in &tracker.best_hosts {
        println!("- {}: {}", host.name, host.host);
    }

    Ok(())
}

/// Tracks the maximum observed commit index and every host tying for it.
#[derive(Default)]
struct BestIndexTracker {
    max_commit_index: i64,
    best_hosts: Vec<Host>,
}

impl BestIndexTracker {
    fn observe(&mut self, host: &Host, commit_index: i64) {
        if commit_index > self.max_commit_index {
            self.max_commit_index = commit_index;
            self.best_hosts = vec![host.clone()];
        } else if commit_index == self.max_commit_index {
            self.best_hosts.push(host.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::BestIndexTracker;
    use crate::models::Host;

    fn host(name: &str) -> Host {
        Host {
            name: name.to_string(),
            member_name: None,
            host: format!("10.0.0.{}", name.len()),
            username: "root".to_string(),
            password: Some("changeme".to_string()),
            private_key: None,
            passphrase: None,
            backedup_manifest: String::new(),
        }
    }

    #[test]
    fn tracks_the_single_highest_host() {
        let mut tracker = BestIndexTracker::default();
        tracker.observe(&host("h1"), 120);
        tracker.observe(&host("h2"), 118);
        tracker.observe(&host("h3"), 115);

        assert_eq!(tracker.max_commit_index, 120);
        let names: Vec<&str> = tracker.best_hosts.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, ["h1"]);
    }

    #[test]
    fn reports_every_tying_host_and_only_those() {
        let mut tracker = BestIndexTracker::default();
        tracker.observe(&host("h1"), 100);
        tracker.observe(&host("h2"), 120);
        tracker.observe(&host("h3"), 120);
        tracker.observe(&host("h4"), 90);

        assert_eq!(tracker.max_commit_index, 120);
        let names: Vec<&str> = tracker.best_hosts.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, ["h2", "h3"]);
    }

    #[test]
    fn later_higher_index_replaces_earlier_ties() {
        let mut tracker = BestIndexTracker::default();
        tracker.observe(&host("h1"), 50);
        tracker.observe(&host("h2"), 50);
        tracker.observe(&host("h3"), 60);

        assert_eq!(tracker.max_commit_index, 60);
        let names: Vec<&str> = tracker.best_hosts.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, ["h3"]);
    }
}
