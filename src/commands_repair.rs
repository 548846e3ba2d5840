//! `repair`: the orchestrator front-end.
//!
//! Builds execution plans for the three repair modes and drives them
//! sequentially. Host choices come from interactive menus; the plan itself
//! never fans out across hosts.

use tracing::info;

use crate::cliui::{MenuPrompt, Prompt};
use crate::errors::{RecoveryError, Result};
use crate::models::{load_hosts, Host, RepairMode};
use crate::plan::{ExecutionPlan, RemoteSession};
use crate::task_add::AddMemberTask;
use crate::task_create::CreateSingleMemberClusterTask;

pub fn run(config_file: &str, mode: RepairMode, prompt: &dyn Prompt) -> Result<()> {
    let hosts = load_hosts(config_file)?;
    validate_params(&hosts, mode)?;

    info!("repair with mode {mode}, all hosts: {:?}", host_options(&hosts));
    match mode {
        RepairMode::Add => {
            let master = select_member(
                prompt,
                &hosts,
                "Select the initial member used to create the single-member cluster:",
            )?;
            let remaining = remaining_members(&hosts, &master);
            let learner = select_member(
                prompt,
                &remaining,
                "Select a learner member to add to the cluster:",
            )?;
            learner.require_backup_manifest()?;
            add_member_to_cluster(&hosts, &master, &learner)?;
        }
        RepairMode::Create => {
            let master = select_member(
                prompt,
                &hosts,
                "Select the member with the highest commit index to recover the cluster:",
            )?;
            master.require_backup_manifest()?;
            create_single_member_cluster(&master)?;
        }
        RepairMode::Both => {
            let master = select_member(
                prompt,
                &hosts,
                "Select the member with the highest commit index to recover the cluster:",
            )?;
            // Every host takes part (the master creates, the rest get
            // started as learners), so all manifests are checked before any
            // remote work starts.
            master.require_backup_manifest()?;
            let remaining = remaining_members(&hosts, &master);
            for host in &remaining {
                host.require_backup_manifest()?;
            }

            create_single_member_cluster(&master)?;

            for (index, host) in remaining.iter().enumerate() {
                info!(
                    "adding member {}/{}: {} ({})",
                    index + 1,
                    remaining.len(),
                    host.name,
                    host.host
                );
                add_member_to_cluster(&hosts, &master, host)?;
            }
        }
    }

    Ok(())
}

pub fn validate_params(hosts: &[Host], mode: RepairMode) -> Result<()> {
    if hosts.is_empty() {
        return Err(RecoveryError::Config(format!(
            "hosts.json should contain at least one host, got: {}",
            hosts.len()
        )));
    }
    if mode == RepairMode::Add && hosts.len() == 1 {
        return Err(RecoveryError::Config(format!(
            "hosts.json should contain at least two hosts in 'add' mode, got: {}",
            hosts.len()
        )));
    }
    Ok(())
}

fn create_single_member_cluster(selected_host: &Host) -> Result<()> {
    info!(
        "creating a single-member cluster from {} ({})",
        selected_host.name, selected_host.host
    );

    let plan = ExecutionPlan {
        name: "CreateSingleMemberCluster".to_string(),
        sessions: vec![RemoteSession {
            host: selected_host.clone(),
            tasks: vec![Box::new(CreateSingleMemberClusterTask {
                description: "CreateSingleMemberCluster".to_string(),
                backup_manifest: selected_host.backedup_manifest.clone(),
            })],
        }],
    };
    plan.execute()?;

    info!("single-member cluster created successfully");
    Ok(())
}

fn add_member_to_cluster(all_hosts: &[Host], master: &Host, learner: &Host) -> Result<()> {
    info!(
        "adding learner member {} ({}) to cluster via {} ({})",
        learner.name, learner.host, master.name, master.host
    );

    // The workflow runs against the master host; the task opens its own
    // session to the learner when it starts it.
    let plan = ExecutionPlan {
        name: "AddMember".to_string(),
        sessions: vec![RemoteSession {
            host: master.clone(),
            tasks: vec![Box::new(AddMemberTask::new(
                master.clone(),
                learner.clone(),
                all_hosts.to_vec(),
                Box::new(MenuPrompt),
            ))],
        }],
    };
    plan.execute()?;

    info!("member added to cluster successfully");
    Ok(())
}

pub fn host_options(hosts: &[Host]) -> Vec<String> {
    hosts
        .iter()
        .map(|host| format!("{} ({})", host.name, host.host))
        .collect()
}

fn select_member(prompt: &dyn Prompt, hosts: &[Host], message: &str) -> Result<Host> {
    let options = host_options(hosts);
    if options.is_empty() {
        return Err(RecoveryError::Config("no hosts to select from".to_string()));
    }

    let index = prompt.select(message, &options)?;
    Ok(hosts[index].clone())
}

pub fn remaining_members(hosts: &[Host], master: &Host) -> Vec<Host> {
    hosts
        .iter()
        .filter(|host| host.name != master.name)
        .cloned()
        .collect()
}
