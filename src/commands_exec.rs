//! `exec`: runs an ad-hoc command against one configured host or all of
//! them, selected interactively.

use tracing::{info, warn};

use crate::cliui::Prompt;
use crate::commands_repair::host_options;
use crate::errors::{RecoveryError, Result};
use crate::models::{load_hosts, Host};
use crate::ssh_client::SshClient;

pub fn run(config_file: &str, command: &str, prompt: &dyn Prompt) -> Result<()> {
    if command.trim().is_empty() {
        return Err(RecoveryError::Config(
            "no command provided, pass one with -e/--command".to_string(),
        ));
    }

    let hosts = load_hosts(config_file)?;

    let mut options = host_options(&hosts);
    options.push("all".to_string());

    let index = prompt.select("Select the member to execute command against with:", &options)?;

    if index == hosts.len() {
        for host in &hosts {
            match execute_user_command(host, command) {
                Ok(output) => println!("{output}"),
                Err(error) => warn!(
                    "error executing command {command:?} on host ({}: {}): {error}",
                    host.name, host.host
                ),
            }
        }
        return Ok(());
    }

    let host = &hosts[index];
    let output = execute_user_command(host, command).map_err(|error| {
        RecoveryError::Transport(format!(
            "error executing command {command:?} on host ({}: {}): {error}",
            host.name, host.host
        ))
    })?;
    println!("{output}");

    Ok(())
}

fn execute_user_command(host: &Host, command: &str) -> Result<String> {
    info!("connecting to host ({}: {})", host.name, host.host);
    let client = SshClient::connect(host)?;

    info!(
        "executing command {command:?} on host ({}: {})",
        host.name, host.host
    );
    let result = client.run(command)?;
    if result.exit_code != 0 {
        return Err(RecoveryError::Validation(format!(
            "command exited with status {}, output:\n {}",
            result.exit_code, result.output
        )));
    }
    Ok(result.output)
}
