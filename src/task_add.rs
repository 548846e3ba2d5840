use std::cell::OnceCell;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cliui::Prompt;
use crate::cluster::{self, Member};
use crate::errors::{RecoveryError, Result};
use crate::manifest;
use crate::models::Host;
use crate::ssh_client::SshClient;
use crate::task_command::WaitForEtcdRunningTask;
use crate::task_types::Task;
use crate::utils::{CRICTL_PS_ETCD_COMMAND, ETCD_DATA_DIR, MANIFEST_PATH};

const PROMOTE_MAX_RETRIES: usize = 50;
const PROMOTE_RETRY_INTERVAL: Duration = Duration::from_secs(5);

// Server-side messages the recipe keys its idempotence on.
const PEER_URLS_EXIST_MARKER: &str = "Peer URLs already exists";
const MEMBER_NOT_FOUND_MARKER: &str = "Member not found";
const NOT_IN_SYNC_MARKER: &str = "can only promote a learner member which is in sync with leader";

/// Brings a learner host into the cluster behind `master` and promotes it to
/// a voting member.
///
/// The recipe is resumable: rerunning it against the same pair converges no
/// matter where a previous run was interrupted (already a voter, learner not
/// yet started, learner not yet promoted).
pub struct AddMemberTask {
    pub description: String,
    pub master: Host,
    pub learner: Host,
    pub all_hosts: Vec<Host>,
    pub prompt: Box<dyn Prompt>,
    member_name: OnceCell<String>,
}

impl AddMemberTask {
    pub fn new(
        master: Host,
        learner: Host,
        all_hosts: Vec<Host>,
        prompt: Box<dyn Prompt>,
    ) -> Self {
        AddMemberTask {
            description: "Add member workflow".to_string(),
            master,
            learner,
            all_hosts,
            prompt,
            member_name: OnceCell::new(),
        }
    }
}

impl Task for AddMemberTask {
    fn name(&self) -> &'static str {
        "AddMemberTask"
    }

    fn run(&self, master_client: &SshClient) -> Result<String> {
        info!(
            "starting AddMemberTask for learner {} ({})",
            self.learner.name, self.learner.host
        );

        let promoted = self.add_or_promote_learner(master_client)?;
        if promoted {
            info!(
                "learner {} ({}) was already added and promoted successfully",
                self.learner.name, self.learner.host
            );
            return Ok("learner already promoted".to_string());
        }

        self.start_learner(master_client)?;

        let promoted = self.add_or_promote_learner(master_client)?;
        if !promoted {
            return Err(RecoveryError::Protocol(
                "learner was not promoted after starting".to_string(),
            ));
        }

        info!(
            "successfully added and promoted learner {} ({})",
            self.learner.name, self.learner.host
        );
        Ok("learner added and promoted successfully".to_string())
    }
}

impl AddMemberTask {
    /// One convergence step against the master: promote the learner when it
    /// already exists and is startable, otherwise add it. Returns `true`
    /// once the learner is a voting member.
    fn add_or_promote_learner(&self, master_client: &SshClient) -> Result<bool> {
        debug!("checking cluster health and member status");

        let container_id = etcd_container_id(master_client)?;
        cluster::wait_for_status_healthy(master_client, &container_id, true).map_err(|error| {
            RecoveryError::Protocol(format!("cluster health check failed: {error}"))
        })?;

        let members = cluster::member_list(master_client, &container_id)?;

        if let Some(member) = self.find_learner_member(&members.members) {
            info!(
                "member {} ({}) already exists in cluster (ID: {:x}, IsLearner: {})",
                self.learner.name, self.learner.host, member.id, member.is_learner
            );
            if member.is_learner {
                if member.name.is_empty() {
                    // A previous run was interrupted after the learner was
                    // added but before it actually started.
                    info!(
                        "the learner {:x} ({:?}) isn't started yet",
                        member.id, member.peer_urls
                    );
                    return Ok(false);
                }
                info!(
                    "attempting to promote learner {} ({})",
                    self.learner.name, self.learner.host
                );
                self.promote_learner(master_client, &container_id, member.id)?;
            }
            return Ok(true);
        }

        self.handle_other_learners(master_client, &container_id, &members.members)?;

        info!(
            "adding new member {} ({}) as learner",
            self.learner.name, self.learner.host
        );
        let member_id = self.add_member_to_cluster(master_client, &container_id)?;
        info!(
            "successfully added member {} with ID: {:x}",
            self.learner.name, member_id
        );
        Ok(false)
    }

    fn find_learner_member<'a>(&self, members: &'a [Member]) -> Option<&'a Member> {
        members.iter().find(|member| {
            member
                .peer_urls
                .iter()
                .any(|peer_url| cluster::peer_url_host(peer_url) == self.learner.host)
        })
    }

    /// Policy for learners other than ours: a stale learner at an address
    /// the hosts file does not know is removed; a known one means the
    /// operator has to finish adding that host first.
    fn handle_other_learners(
        &self,
        master_client: &SshClient,
        container_id: &str,
        members: &[Member],
    ) -> Result<()> {
        let other_learners: Vec<&Member> =
            members.iter().filter(|member| member.is_learner).collect();
        if other_learners.is_empty() {
            return Ok(());
        }
        if other_learners.len() > 1 {
            return Err(RecoveryError::Protocol(format!(
                "found {} learners, expected 0 or 1",
                other_learners.len()
            )));
        }

        let learner = other_learners[0];
        let peer_url = learner.peer_urls.first().map(String::as_str).unwrap_or_default();
        let learner_host = cluster::peer_url_host(peer_url);
        info!("found other learner ({learner_host}) in cluster, handling...");

        if self.is_known_host(&learner_host) {
            let message = format!(
                "Another learner vm ({learner_host}) has been added but not started yet. \
                 Please add it again first."
            );
            warn!("{message}");
            return Err(RecoveryError::Protocol(message));
        }

        info!("removing unknown learner {:x} at {learner_host}", learner.id);
        self.remove_member(master_client, container_id, learner.id)?;
        info!(
            "successfully removed unknown learner {:x} at {learner_host}",
            learner.id
        );
        Ok(())
    }

    fn is_known_host(&self, learner_host: &str) -> bool {
        self.all_hosts.iter().any(|host| host.host == learner_host)
    }

    fn remove_member(
        &self,
        master_client: &SshClient,
        container_id: &str,
        member_id: u64,
    ) -> Result<()> {
        let member_id_hex = format!("{member_id:x}");
        debug!("removing member {member_id_hex}");

        match cluster::exec_etcdctl(
            master_client,
            container_id,
            &["member", "remove", &member_id_hex],
        ) {
            Ok(_) => {
                debug!("member {member_id_hex} removed successfully");
                Ok(())
            }
            Err(error) => {
                if error
                    .command_output()
                    .is_some_and(|output| output.contains(MEMBER_NOT_FOUND_MARKER))
                {
                    info!("member {member_id_hex} already removed");
                    return Ok(());
                }
                Err(RecoveryError::Protocol(format!(
                    "failed to remove member {member_id_hex}: {error}"
                )))
            }
        }
    }

    /// `member add <name> --peer-urls=https://<host>:2380 --learner`.
    /// A `Peer URLs already exists` response counts as success; the member
    /// ID is then unknown (0) until the next member-list pass re-discovers
    /// it.
    fn add_member_to_cluster(&self, master_client: &SshClient, container_id: &str) -> Result<u64> {
        let peer_urls = format!("https://{}:2380", self.learner.host);
        let member_name = self.learner_member_name()?;
        let peer_urls_arg = format!("--peer-urls={peer_urls}");
        let args = [
            "member",
            "add",
            member_name.as_str(),
            peer_urls_arg.as_str(),
            "--learner",
            "-w",
            "json",
        ];

        let output = match cluster::exec_etcdctl(master_client, container_id, &args) {
            Ok(output) => output,
            Err(error) => {
                if error
                    .command_output()
                    .is_some_and(|output| output.contains(PEER_URLS_EXIST_MARKER))
                {
                    return Ok(0);
                }
                return Err(RecoveryError::Protocol(format!(
                    "failed to add member: {error}"
                )));
            }
        };

        let response: cluster::MemberAddResponse =
            serde_json::from_str(&output).map_err(|error| {
                RecoveryError::Protocol(format!(
                    "unmarshal adding learner ({member_name}) response failed: {error}, \
                     output: {output}"
                ))
            })?;
        Ok(response.member.id)
    }

    /// Retries `member promote` until the learner has caught up with the
    /// leader. Not-in-sync responses are the expected path; any other error
    /// is retried within the same budget.
    fn promote_learner(
        &self,
        master_client: &SshClient,
        container_id: &str,
        member_id: u64,
    ) -> Result<()> {
        let member_id_hex = format!("{member_id:x}");
        info!("attempting to promote member {member_id_hex}");

        let mut last_error = None;
        for attempt in 1..=PROMOTE_MAX_RETRIES {
            match cluster::exec_etcdctl(
                master_client,
                container_id,
                &["member", "promote", &member_id_hex],
            ) {
                Ok(_) => {
                    info!("member {member_id_hex} promoted successfully");
                    return Ok(());
                }
                Err(error) => {
                    if error
                        .command_output()
                        .is_some_and(|output| output.contains(NOT_IN_SYNC_MARKER))
                    {
                        info!(
                            "learner not in sync yet, retrying \
                             ({attempt}/{PROMOTE_MAX_RETRIES})..."
                        );
                    } else {
                        warn!(
                            "promotion failed: {error}, retrying \
                             ({attempt}/{PROMOTE_MAX_RETRIES})..."
                        );
                    }
                    last_error = Some(error);
                }
            }
            std::thread::sleep(PROMOTE_RETRY_INTERVAL);
        }

        let last_error = last_error.map(|error| error.to_string()).unwrap_or_default();
        Err(RecoveryError::Protocol(format!(
            "failed to promote member after {PROMOTE_MAX_RETRIES} attempts: {last_error}"
        )))
    }

    /// Boots etcd on the learner host as a member of the existing cluster:
    /// wipes stale data (with operator confirmation), rewrites the backup
    /// manifest's bootstrap flags and waits for the new member to report
    /// healthy on its own endpoint.
    fn start_learner(&self, master_client: &SshClient) -> Result<()> {
        // Checked before anything touches the learner: the data-directory
        // wipe below is destructive and must not run when the manifest that
        // would restart etcd afterwards cannot be produced.
        self.learner.require_backup_manifest()?;

        let learner_client = SshClient::connect(&self.learner).map_err(|error| {
            RecoveryError::Transport(format!("failed to connect to learner node: {error}"))
        })?;

        info!(
            "starting learner on {} ({})",
            self.learner.name, self.learner.host
        );

        if let Ok(result) = learner_client.run(CRICTL_PS_ETCD_COMMAND) {
            let container_id = result.output.trim();
            if result.exit_code == 0 && !container_id.is_empty() {
                return Err(RecoveryError::Validation(format!(
                    "etcd is already running on {} (container ID: {container_id}), \
                     please stop it before adding as learner",
                    self.learner.host
                )));
            }
        }
        info!(
            "confirmed etcd is not running on {} ({})",
            self.learner.name, self.learner.host
        );

        self.cleanup_local_data(&learner_client)?;
        info!(
            "successfully cleaned up etcd data directory on {} ({})",
            self.learner.name, self.learner.host
        );

        let container_id = etcd_container_id(master_client)?;
        let members = cluster::member_list(master_client, &container_id)?;
        let initial_cluster = cluster::build_initial_cluster(
            &members.members,
            &self.learner.host,
            &self.learner_member_name()?,
        )?;
        info!("built initial-cluster string: {initial_cluster}");

        self.upload_learner_manifest(&learner_client, &initial_cluster)?;
        info!(
            "successfully uploaded etcd manifest on {} ({})",
            self.learner.name, self.learner.host
        );

        let learner_container_id = etcd_container_id(&learner_client).map_err(|error| {
            RecoveryError::Protocol(format!("etcd container did not start: {error}"))
        })?;
        cluster::wait_for_status_healthy(&learner_client, &learner_container_id, false).map_err(
            |error| {
                RecoveryError::Protocol(format!("learner health status check failed: {error}"))
            },
        )?;
        info!(
            "etcd container {learner_container_id} is running on {} ({}), as learner",
            self.learner.name, self.learner.host
        );

        learner_client.close();
        Ok(())
    }

    /// etcd refuses to join an existing cluster when prior data is present,
    /// so the member directory has to go. The deletion is destructive and
    /// requires an explicit operator confirmation.
    fn cleanup_local_data(&self, learner_client: &SshClient) -> Result<()> {
        debug!("checking if etcd data directory exists: {ETCD_DATA_DIR}");
        let exists = matches!(
            learner_client.run(&format!("sudo test -d {ETCD_DATA_DIR}")),
            Ok(result) if result.exit_code == 0
        );
        if !exists {
            info!("directory {ETCD_DATA_DIR} does not exist, skipping cleanup");
            return Ok(());
        }

        let confirmed = self.prompt.confirm(&format!(
            "The data directory ({ETCD_DATA_DIR}) must be deleted before member {} can join. \
             Continue?",
            self.learner.name
        ))?;
        if !confirmed {
            return Err(RecoveryError::Aborted(
                "user did not confirm data cleanup".to_string(),
            ));
        }

        info!("removing {ETCD_DATA_DIR}");
        learner_client
            .run_checked(&format!("sudo -i rm -rf {ETCD_DATA_DIR}"))
            .map_err(|error| {
                RecoveryError::Transport(format!("failed to remove directory: {error}"))
            })?;

        info!("etcd local data cleaned successfully");
        Ok(())
    }

    fn upload_learner_manifest(
        &self,
        learner_client: &SshClient,
        initial_cluster: &str,
    ) -> Result<()> {
        let scratch = tempfile::tempdir()?;
        let local_manifest = scratch.path().join("etcd-learner.yaml");
        learner_client
            .download(&self.learner.backedup_manifest, &local_manifest)
            .map_err(|error| {
                RecoveryError::Transport(format!("failed to download manifest: {error}"))
            })?;

        let manifest_yaml = std::fs::read_to_string(&local_manifest)?;
        let mut pod = manifest::parse(&manifest_yaml)?;
        manifest::rewrite_initial_cluster(&mut pod, initial_cluster, "existing")?;

        let updated = scratch.path().join("etcd-updated.yaml");
        std::fs::write(&updated, manifest::serialize(&pod)?)?;
        learner_client.upload(&updated, MANIFEST_PATH).map_err(|error| {
            RecoveryError::Transport(format!(
                "failed to upload manifest: {error}, on learner {} ({})",
                self.learner.name, self.learner.host
            ))
        })
    }

    /// The learner's etcd member name: the configured `member_name` or the
    /// remote hostname, resolved once per task run.
    fn learner_member_name(&self) -> Result<String> {
        if let Some(name) = self.member_name.get() {
            return Ok(name.clone());
        }
        let name = self.learner.fetch_member_name()?;
        let _ = self.member_name.set(name.clone());
        Ok(name)
    }
}

fn etcd_container_id(client: &SshClient) -> Result<String> {
    let task = WaitForEtcdRunningTask {
        description: "Get etcd container ID".to_string(),
        old_container_id: String::new(),
        timeout_secs: 300,
        retry_interval_secs: 5,
    };
    Ok(task.run(client)?.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::AddMemberTask;
    use crate::cliui::testing::ScriptedPrompt;
    use crate::cluster::Member;
    use crate::models::Host;

    fn host(name: &str, address: &str) -> Host {
        Host {
            name: name.to_string(),
            member_name: Some(name.to_string()),
            host: address.to_string(),
            username: "root".to_string(),
            password: Some("changeme".to_string()),
            private_key: None,
            passphrase: None,
            backedup_manifest: "/root/etcd.yaml".to_string(),
        }
    }

    fn task() -> AddMemberTask {
        AddMemberTask::new(
            host("etcd-vm1", "10.0.0.7"),
            host("etcd-vm2", "10.0.0.8"),
            vec![host("etcd-vm1", "10.0.0.7"), host("etcd-vm2", "10.0.0.8")],
            Box::new(ScriptedPrompt::new(vec![], vec![true])),
        )
    }

    fn member(name: &str, peer_url: &str, is_learner: bool) -> Member {
        Member {
            id: 7,
            name: name.to_string(),
            peer_urls: vec![peer_url.to_string()],
            is_learner,
        }
    }

    #[test]
    fn finds_the_learner_by_peer_url_host() {
        let task = task();
        let members = vec![
            member("etcd-vm1", "https://10.0.0.7:2380", false),
            member("", "https://10.0.0.8:2380", true),
        ];

        let found = task.find_learner_member(&members).expect("member");
        assert!(found.is_learner);
        assert_eq!(found.peer_urls, ["https://10.0.0.8:2380"]);
    }

    #[test]
    fn ignores_members_on_other_hosts() {
        let task = task();
        let members = vec![member("etcd-vm1", "https://10.0.0.7:2380", false)];

        assert!(task.find_learner_member(&members).is_none());
    }

    #[test]
    fn known_host_lookup_uses_configured_addresses() {
        let task = task();

        assert!(task.is_known_host("10.0.0.7"));
        assert!(!task.is_known_host("10.0.0.99"));
    }

    #[test]
    fn member_name_prefers_the_configured_value() {
        let task = task();
        // member_name is set in the fixture, so no connection is attempted.
        assert_eq!(task.learner_member_name().expect("name"), "etcd-vm2");
    }
}
