//! Structured views over remote etcdctl output.
//!
//! All probes run etcdctl inside the running etcd container (via crictl) and
//! parse its `-w json` output into plain values; everything downstream is
//! ID- and host-centric.

use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::errors::{RecoveryError, Result};
use crate::ssh_client::SshClient;
use crate::task_command::CommandTask;
use crate::task_types::Check;
use crate::utils::etcdctl_command;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseHeader {
    #[serde(default)]
    pub member_id: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Member {
    #[serde(default, rename = "ID")]
    pub id: u64,
    /// Empty for a learner that has been added but never started.
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "peerURLs")]
    pub peer_urls: Vec<String>,
    #[serde(default, rename = "isLearner")]
    pub is_learner: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemberListResponse {
    #[serde(default)]
    pub header: ResponseHeader,
    #[serde(default)]
    pub members: Vec<Member>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemberAddResponse {
    #[serde(default)]
    pub header: ResponseHeader,
    #[serde(default)]
    pub member: Member,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointStatus {
    #[serde(rename = "Endpoint")]
    pub endpoint: String,
    #[serde(rename = "Status")]
    pub status: StatusResponse,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusResponse {
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Runs an etcdctl command inside the etcd container, retrying for up to
/// 30 s until it exits 0.
pub fn exec_etcdctl(client: &SshClient, container_id: &str, args: &[&str]) -> Result<String> {
    let task = CommandTask {
        description: "Execute etcdctl command".to_string(),
        command: etcdctl_command(container_id, args),
        check: Some(Check {
            expected_exit_code: 0,
            timeout_secs: 30,
            retry_interval_secs: 5,
            ..Check::default()
        }),
    };
    task.run(client)
}

pub fn member_list(client: &SshClient, container_id: &str) -> Result<MemberListResponse> {
    let output = exec_etcdctl(client, container_id, &["member", "list", "-w", "json"])
        .map_err(|error| {
            RecoveryError::Protocol(format!("failed to list members: {error}"))
        })?;

    let response: MemberListResponse = serde_json::from_str(&output).map_err(|error| {
        RecoveryError::Protocol(format!("failed to parse member list: {error}"))
    })?;
    debug!("current cluster has {} members", response.members.len());
    Ok(response)
}

/// Single-member predicate: returns the sole member's decimal ID and `true`,
/// or the response header's member ID and `false`. Probe failures degrade to
/// an empty ID and `false`.
pub fn is_single_member_cluster(client: &SshClient, container_id: &str) -> (String, bool) {
    let task = CommandTask {
        description: "check if single-member cluster".to_string(),
        command: etcdctl_command(container_id, &["member", "list", "-w", "json"]),
        check: Some(Check {
            expected_exit_code: 0,
            timeout_secs: 60,
            retry_interval_secs: 5,
            ..Check::default()
        }),
    };

    let output = match task.run(client) {
        Ok(output) => output,
        Err(error) => {
            warn!("member list failed: {error}");
            return (String::new(), false);
        }
    };

    let response: MemberListResponse = match serde_json::from_str(&output) {
        Ok(response) => response,
        Err(error) => {
            warn!("failed to parse member list: {error}");
            return (String::new(), false);
        }
    };

    if response.members.len() == 1 {
        (response.members[0].id.to_string(), true)
    } else {
        (response.header.member_id.to_string(), false)
    }
}

/// Blocks until `etcdctl endpoint health --cluster` reports every endpoint
/// healthy (exit 0 and the `is healthy` marker), up to 600 s.
pub fn wait_until_healthy(client: &SshClient, container_id: &str) -> Result<()> {
    let task = CommandTask {
        description: "Wait for etcd to be healthy".to_string(),
        command: etcdctl_command(container_id, &["endpoint", "health", "--cluster"]),
        check: Some(Check {
            expected_exit_code: 0,
            expected_output: "is healthy".to_string(),
            timeout_secs: 600,
            retry_interval_secs: 10,
            ..Check::default()
        }),
    };
    task.run(client).map(|_| ())
}

/// Polls `etcdctl endpoint status -w json` (optionally `--cluster`-wide)
/// until every reported endpoint carries an empty error list, up to
/// 20 attempts at 5 s intervals.
pub fn wait_for_status_healthy(
    client: &SshClient,
    container_id: &str,
    cluster: bool,
) -> Result<()> {
    let subject = if cluster { "cluster" } else { "current member" };
    let mut args = vec!["endpoint", "status", "-w", "json"];
    if cluster {
        args.push("--cluster");
    }
    info!("waiting for {subject} to be healthy");

    const MAX_RETRIES: usize = 20;
    let retry_interval = std::time::Duration::from_secs(5);

    for attempt in 1..=MAX_RETRIES {
        match exec_etcdctl(client, container_id, &args) {
            Ok(output) => {
                if validate_cluster_status(&output) {
                    info!("{subject} is healthy");
                    return Ok(());
                }
                debug!("{subject} is not healthy: {output}, attempt {attempt}/{MAX_RETRIES}");
            }
            Err(error) => {
                debug!("{subject} health check failed: {error}, attempt {attempt}/{MAX_RETRIES}");
            }
        }
        std::thread::sleep(retry_interval);
    }

    Err(RecoveryError::Protocol(format!(
        "{subject} did not become healthy after {MAX_RETRIES} attempts"
    )))
}

/// Healthy iff the status array is non-empty and every endpoint reports an
/// empty error list.
pub fn validate_cluster_status(output: &str) -> bool {
    let statuses: Vec<EndpointStatus> = match serde_json::from_str(output) {
        Ok(statuses) => statuses,
        Err(error) => {
            debug!("failed to parse endpoint status JSON: {error}");
            return false;
        }
    };

    !statuses.is_empty() && statuses.iter().all(|status| status.status.errors.is_empty())
}

/// Extracts the host portion of a peer URL (`https://10.0.0.7:2380` →
/// `10.0.0.7`); parse failures degrade to an empty string.
pub fn peer_url_host(raw_url: &str) -> String {
    match Url::parse(raw_url) {
        Ok(url) => url.host_str().unwrap_or_default().to_string(),
        Err(error) => {
            warn!("error parsing peer URL {raw_url}: {error}");
            String::new()
        }
    }
}

/// Builds the `--initial-cluster` bootstrap string from a member list: one
/// `name=peer-url` entry per member with a peer URL. A learner entry whose
/// name is still empty gets the joining learner's member name when its peer
/// URL points at the learner host.
pub fn build_initial_cluster(
    members: &[Member],
    learner_host: &str,
    learner_member_name: &str,
) -> Result<String> {
    let mut parts = Vec::new();
    for member in members {
        let Some(peer_url) = member.peer_urls.first() else {
            continue;
        };
        let mut name = member.name.as_str();
        if name.is_empty() && peer_url.contains(learner_host) {
            name = learner_member_name;
        }
        if !name.is_empty() {
            parts.push(format!("{name}={peer_url}"));
        }
    }

    if parts.is_empty() {
        return Err(RecoveryError::Protocol(
            "no members found in cluster".to_string(),
        ));
    }

    Ok(parts.join(","))
}

#[cfg(test)]
mod tests {
    use super::{
        build_initial_cluster, peer_url_host, validate_cluster_status, Member,
        MemberAddResponse, MemberListResponse,
    };

    #[test]
    fn member_list_json_decodes_ids_names_and_learner_flags() {
        let json = r#"{
            "header": {"cluster_id": 17237436991929493444, "member_id": 9372538179322589801},
            "members": [
                {"ID": 9372538179322589801, "name": "etcd-vm1",
                 "peerURLs": ["https://10.0.0.7:2380"],
                 "clientURLs": ["https://10.0.0.7:2379"]},
                {"ID": 10501334649042878790,
                 "peerURLs": ["https://10.0.0.8:2380"], "isLearner": true}
            ]
        }"#;

        let response: MemberListResponse = serde_json::from_str(json).expect("decode");

        assert_eq!(response.header.member_id, 9372538179322589801);
        assert_eq!(response.members.len(), 2);
        assert_eq!(response.members[0].name, "etcd-vm1");
        assert!(!response.members[0].is_learner);
        // Added-but-not-started learners carry no name.
        assert_eq!(response.members[1].name, "");
        assert!(response.members[1].is_learner);
        assert_eq!(response.members[1].peer_urls, ["https://10.0.0.8:2380"]);
    }

    #[test]
    fn member_add_json_decodes_the_new_member_id() {
        let json = r#"{
            "header": {"member_id": 9372538179322589801},
            "member": {"ID": 10501334649042878790, "peerURLs": ["https://10.0.0.8:2380"]}
        }"#;

        let response: MemberAddResponse = serde_json::from_str(json).expect("decode");
        assert_eq!(response.member.id, 10501334649042878790);
    }

    #[test]
    fn status_is_healthy_only_without_errors() {
        let healthy = r#"[
            {"Endpoint": "https://10.0.0.7:2379", "Status": {"header": {"member_id": 1}}},
            {"Endpoint": "https://10.0.0.8:2379", "Status": {"errors": []}}
        ]"#;
        let degraded = r#"[
            {"Endpoint": "https://10.0.0.7:2379", "Status": {"errors": ["etcdserver: no leader"]}}
        ]"#;

        assert!(validate_cluster_status(healthy));
        assert!(!validate_cluster_status(degraded));
        assert!(!validate_cluster_status("[]"));
        assert!(!validate_cluster_status("not json"));
    }

    #[test]
    fn peer_url_host_extraction() {
        assert_eq!(peer_url_host("https://10.0.0.7:2380"), "10.0.0.7");
        assert_eq!(peer_url_host("https://etcd-vm1.local:2380"), "etcd-vm1.local");
        assert_eq!(peer_url_host("not a url"), "");
    }

    fn member(name: &str, peer_url: &str, is_learner: bool) -> Member {
        Member {
            id: 1,
            name: name.to_string(),
            peer_urls: vec![peer_url.to_string()],
            is_learner,
        }
    }

    #[test]
    fn initial_cluster_joins_named_members() {
        let members = vec![
            member("etcd-vm1", "https://10.0.0.7:2380", false),
            member("etcd-vm2", "https://10.0.0.8:2380", false),
        ];

        let value = build_initial_cluster(&members, "10.0.0.9", "etcd-vm3").expect("build");
        assert_eq!(
            value,
            "etcd-vm1=https://10.0.0.7:2380,etcd-vm2=https://10.0.0.8:2380"
        );
    }

    #[test]
    fn initial_cluster_substitutes_the_unstarted_learner_name() {
        let members = vec![
            member("etcd-vm1", "https://10.0.0.7:2380", false),
            member("", "https://10.0.0.9:2380", true),
        ];

        let value = build_initial_cluster(&members, "10.0.0.9", "etcd-vm3").expect("build");
        assert_eq!(
            value,
            "etcd-vm1=https://10.0.0.7:2380,etcd-vm3=https://10.0.0.9:2380"
        );
    }

    #[test]
    fn initial_cluster_skips_unrelated_anonymous_members() {
        let members = vec![
            member("etcd-vm1", "https://10.0.0.7:2380", false),
            member("", "https://10.0.0.99:2380", true),
        ];

        let value = build_initial_cluster(&members, "10.0.0.9", "etcd-vm3").expect("build");
        assert_eq!(value, "etcd-vm1=https://10.0.0.7:2380");
    }

    #[test]
    fn initial_cluster_with_no_entries_fails() {
        let error = build_initial_cluster(&[], "10.0.0.9", "etcd-vm3").expect_err("must fail");
        assert!(error.to_string().contains("no members found"));

        let anonymous = vec![member("", "https://10.0.0.99:2380", true)];
        assert!(build_initial_cluster(&anonymous, "10.0.0.9", "etcd-vm3").is_err());
    }
}
