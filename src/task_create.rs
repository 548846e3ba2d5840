use std::path::Path;

use tracing::{info, warn};

use crate::cluster;
use crate::errors::{RecoveryError, Result};
use crate::manifest;
use crate::ssh_client::SshClient;
use crate::task_command::WaitForEtcdRunningTask;
use crate::task_types::Task;
use crate::utils::MANIFEST_PATH;

/// Reconstitutes a healthy single-member etcd cluster on one host by forcing
/// a new cluster out of the surviving state.
///
/// Two branches, depending on whether etcd is currently running:
/// - running: strip any stale `--force-new-cluster` from the live manifest,
///   wait for the restart and verify health and a member count of one;
/// - not running: start etcd from the operator's backup manifest with
///   `--force-new-cluster`, then remove the flag again once healthy.
///
/// Either way the manifest left on disk carries no `--force-new-cluster`.
pub struct CreateSingleMemberClusterTask {
    pub description: String,
    pub backup_manifest: String,
}

impl Task for CreateSingleMemberClusterTask {
    fn name(&self) -> &'static str {
        "CreateSingleMemberCluster"
    }

    fn run(&self, client: &SshClient) -> Result<String> {
        let scratch = tempfile::tempdir()?;

        let probe = WaitForEtcdRunningTask {
            description: "Get etcd container ID".to_string(),
            old_container_id: String::new(),
            timeout_secs: 15,
            retry_interval_secs: 5,
        };
        let old_container_id = match probe.run(client) {
            Ok(container_id) => container_id,
            Err(error) => {
                info!("etcd container didn't start: {error}");
                String::new()
            }
        };

        if old_container_id.is_empty() {
            self.create_from_backup_manifest(client, scratch.path())
        } else {
            self.recover_running_instance(client, scratch.path(), &old_container_id)
        }
    }
}

impl CreateSingleMemberClusterTask {
    /// etcd is already running: make sure it is a lone, healthy member and
    /// that no `--force-new-cluster` is left in the live manifest.
    fn recover_running_instance(
        &self,
        client: &SshClient,
        scratch: &Path,
        old_container_id: &str,
    ) -> Result<String> {
        let (member_id, is_single_member) =
            cluster::is_single_member_cluster(client, old_container_id);
        if !is_single_member {
            warn!(
                "the etcd instance is part of a multi-member cluster; \
                 aborting single-member cluster creation"
            );
            return Ok(member_id);
        }

        let local_manifest = scratch.join("etcd.yaml");
        client.download(MANIFEST_PATH, &local_manifest)?;

        let manifest_yaml = std::fs::read_to_string(&local_manifest)?;
        let mut pod = manifest::parse(&manifest_yaml)?;
        let manifest_changed = manifest::toggle_force_new_cluster(&mut pod, false)
            .map_err(|error| {
                RecoveryError::Protocol(format!(
                    "failed to remove --force-new-cluster flag, err: {error}"
                ))
            })?;

        let container_id = if manifest_changed {
            let no_force = scratch.join("etcd-no-force.yaml");
            std::fs::write(&no_force, manifest::serialize(&pod)?)?;
            client.upload(&no_force, MANIFEST_PATH)?;

            let restart = WaitForEtcdRunningTask {
                description: "Wait for etcd to restart".to_string(),
                old_container_id: old_container_id.to_string(),
                timeout_secs: 600,
                retry_interval_secs: 5,
            };
            restart.run(client).map_err(|error| {
                RecoveryError::Protocol(format!("etcd did not restart: {error}"))
            })?
        } else {
            old_container_id.to_string()
        };

        cluster::wait_until_healthy(client, &container_id).map_err(|error| {
            RecoveryError::Protocol(format!("etcd health check failed: {error}"))
        })?;

        let (member_id, is_single_member) =
            cluster::is_single_member_cluster(client, &container_id);
        if !is_single_member {
            return Err(RecoveryError::Protocol(
                "failed to create a single-member cluster".to_string(),
            ));
        }
        Ok(member_id)
    }

    /// etcd is not running: boot it from the backup manifest with
    /// `--force-new-cluster`, then strip the flag and wait for the restart.
    fn create_from_backup_manifest(&self, client: &SshClient, scratch: &Path) -> Result<String> {
        if self.backup_manifest.trim().is_empty() {
            return Err(RecoveryError::Config(
                "backup manifest path not provided in hosts.json".to_string(),
            ));
        }

        info!("etcd container is not running, proceeding with single-member cluster creation");

        let local_manifest = scratch.join("etcd.yaml");
        client
            .download(&self.backup_manifest, &local_manifest)
            .map_err(|error| {
                RecoveryError::Transport(format!("failed to download backup manifest: {error}"))
            })?;

        let manifest_yaml = std::fs::read_to_string(&local_manifest)?;
        let mut pod = manifest::parse(&manifest_yaml)?;
        manifest::toggle_force_new_cluster(&mut pod, true).map_err(|error| {
            RecoveryError::Protocol(format!(
                "failed to add --force-new-cluster flag, err: {error}"
            ))
        })?;

        let with_force = scratch.join("etcd-force.yaml");
        std::fs::write(&with_force, manifest::serialize(&pod)?)?;
        client.upload(&with_force, MANIFEST_PATH)?;

        let startup = WaitForEtcdRunningTask {
            description: "Wait for etcd to start".to_string(),
            old_container_id: String::new(),
            timeout_secs: 600,
            retry_interval_secs: 5,
        };
        let container_id = startup.run(client).map_err(|error| {
            RecoveryError::Protocol(format!("etcd container didn't start in time: {error}"))
        })?;

        cluster::wait_until_healthy(client, &container_id).map_err(|error| {
            RecoveryError::Protocol(format!("etcd did not become healthy: {error}"))
        })?;

        manifest::toggle_force_new_cluster(&mut pod, false).map_err(|error| {
            RecoveryError::Protocol(format!(
                "failed to remove --force-new-cluster flag, err: {error}"
            ))
        })?;

        let no_force = scratch.join("etcd-no-force.yaml");
        std::fs::write(&no_force, manifest::serialize(&pod)?)?;
        client.upload(&no_force, MANIFEST_PATH)?;

        let restart = WaitForEtcdRunningTask {
            description: "Wait for etcd to restart".to_string(),
            old_container_id: container_id,
            timeout_secs: 600,
            retry_interval_secs: 5,
        };
        let new_container_id = restart.run(client).map_err(|error| {
            RecoveryError::Protocol(format!("etcd did not restart: {error}"))
        })?;

        cluster::wait_until_healthy(client, &new_container_id).map_err(|error| {
            RecoveryError::Protocol(format!("final etcd health check failed: {error}"))
        })?;

        let (member_id, is_single_member) =
            cluster::is_single_member_cluster(client, &new_container_id);
        if !is_single_member {
            return Err(RecoveryError::Protocol(
                "failed to create a single-member cluster".to_string(),
            ));
        }
        Ok(member_id)
    }
}
