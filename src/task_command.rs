use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::errors::{RecoveryError, Result};
use crate::ssh_client::{CommandResult, SshClient};
use crate::task_types::{Check, Task};
use crate::utils::CRICTL_PS_ETCD_COMMAND;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Runs one remote command under a polling policy: the command is retried at
/// the check's interval until its exit code and output predicates are
/// satisfied or the deadline passes.
pub struct CommandTask {
    pub description: String,
    pub command: String,
    pub check: Option<Check>,
}

impl CommandTask {
    pub fn run(&self, client: &SshClient) -> Result<String> {
        let start = Instant::now();
        let (timeout, interval) = effective_deadlines(self.check.as_ref());

        let mut last_reason: Option<String> = None;
        let mut last_output = String::new();

        while start.elapsed() < timeout {
            let result = match client.run(&self.command) {
                Ok(result) => result,
                Err(error) => {
                    // Transient execution failure, retry within the deadline.
                    debug!("command '{}' execution failed: {error}", self.command);
                    last_reason = Some(error.to_string());
                    std::thread::sleep(interval);
                    continue;
                }
            };

            match evaluate_check(&result, self.check.as_ref()) {
                None => return Ok(result.output),
                Some(reason) => {
                    debug!("command '{}' {reason}", self.command);
                    last_reason = Some(format!("command '{}' {reason}", self.command));
                    last_output = result.output;
                    std::thread::sleep(interval);
                }
            }
        }

        Err(RecoveryError::CommandFailed {
            command: self.command.clone(),
            reason: last_reason.unwrap_or_else(|| "timed out".to_string()),
            output: last_output,
        })
    }
}

impl Task for CommandTask {
    fn name(&self) -> &'static str {
        "CommandTask"
    }

    fn run(&self, client: &SshClient) -> Result<String> {
        CommandTask::run(self, client)
    }
}

fn effective_deadlines(check: Option<&Check>) -> (Duration, Duration) {
    let mut timeout = DEFAULT_TIMEOUT;
    let mut interval = DEFAULT_RETRY_INTERVAL;
    if let Some(check) = check {
        if check.timeout_secs > 0 {
            timeout = Duration::from_secs(check.timeout_secs);
        }
        if check.retry_interval_secs > 0 {
            interval = Duration::from_secs(check.retry_interval_secs);
        }
    }
    (timeout, interval)
}

/// Returns the failure reason for one attempt, or `None` when the attempt
/// satisfies the check: exit code matches (0 when no check is supplied), the
/// expected substring is present, the forbidden substring is absent, and the
/// output is non-empty.
fn evaluate_check(result: &CommandResult, check: Option<&Check>) -> Option<String> {
    let expected_exit_code = check.map_or(0, |check| check.expected_exit_code);
    if result.exit_code != expected_exit_code {
        return Some(format!(
            "validation failed: expected exit code {expected_exit_code} but got {}",
            result.exit_code
        ));
    }

    if let Some(check) = check {
        if !check.expected_output.is_empty() && !result.output.contains(&check.expected_output) {
            return Some(format!(
                "validation failed: expected output : {} not found",
                check.expected_output
            ));
        }
        if !check.not_expected_output.is_empty()
            && result.output.contains(&check.not_expected_output)
        {
            return Some(format!(
                "validation failed: not expected output : {} found",
                check.not_expected_output
            ));
        }
    }

    if result.output.is_empty() {
        return Some("produced no output".to_string());
    }

    None
}

/// Waits until a running etcd container with an identifier different from
/// `old_container_id` is observed, and returns the new identifier.
pub struct WaitForEtcdRunningTask {
    pub description: String,
    pub old_container_id: String,
    pub timeout_secs: u64,
    pub retry_interval_secs: u64,
}

impl WaitForEtcdRunningTask {
    pub fn run(&self, client: &SshClient) -> Result<String> {
        let task = CommandTask {
            description: "Wait for etcd container to be running".to_string(),
            command: CRICTL_PS_ETCD_COMMAND.to_string(),
            check: Some(Check {
                expected_exit_code: 0,
                not_expected_output: self.old_container_id.clone(),
                timeout_secs: if self.timeout_secs == 0 { 120 } else { self.timeout_secs },
                retry_interval_secs: if self.retry_interval_secs == 0 {
                    5
                } else {
                    self.retry_interval_secs
                },
                ..Check::default()
            }),
        };

        let output = task.run(client)?;
        let container_id = output.trim();
        if container_id.is_empty() {
            return Err(RecoveryError::Validation(
                "etcd container not running".to_string(),
            ));
        }

        info!("etcd container {container_id} is running");
        Ok(container_id.to_string())
    }
}

impl Task for WaitForEtcdRunningTask {
    fn name(&self) -> &'static str {
        "WaitForEtcdRunningTask"
    }

    fn run(&self, client: &SshClient) -> Result<String> {
        WaitForEtcdRunningTask::run(self, client)
    }
}

#[cfg(test)]
mod tests {
    use super::{effective_deadlines, evaluate_check};
    use crate::ssh_client::CommandResult;
    use crate::task_types::Check;
    use std::time::Duration;

    fn result(output: &str, exit_code: i32) -> CommandResult {
        CommandResult {
            output: output.to_string(),
            exit_code,
        }
    }

    #[test]
    fn defaults_apply_when_check_fields_are_zero() {
        assert_eq!(
            effective_deadlines(None),
            (Duration::from_secs(10), Duration::from_secs(1))
        );
        assert_eq!(
            effective_deadlines(Some(&Check::default())),
            (Duration::from_secs(10), Duration::from_secs(1))
        );
        let check = Check {
            timeout_secs: 600,
            retry_interval_secs: 10,
            ..Check::default()
        };
        assert_eq!(
            effective_deadlines(Some(&check)),
            (Duration::from_secs(600), Duration::from_secs(10))
        );
    }

    #[test]
    fn attempt_without_check_needs_exit_zero_and_output() {
        assert_eq!(evaluate_check(&result("ok", 0), None), None);
        assert!(evaluate_check(&result("boom", 1), None)
            .is_some_and(|reason| reason.contains("expected exit code 0 but got 1")));
        assert!(evaluate_check(&result("", 0), None)
            .is_some_and(|reason| reason.contains("no output")));
    }

    #[test]
    fn expected_substring_must_be_present() {
        let check = Check {
            expected_output: "is healthy".to_string(),
            ..Check::default()
        };

        assert_eq!(
            evaluate_check(&result("127.0.0.1:2379 is healthy", 0), Some(&check)),
            None
        );
        assert!(evaluate_check(&result("unhappy", 0), Some(&check))
            .is_some_and(|reason| reason.contains("is healthy")));
    }

    #[test]
    fn forbidden_substring_must_be_absent() {
        let check = Check {
            not_expected_output: "abc123".to_string(),
            ..Check::default()
        };

        assert!(evaluate_check(&result("abc123", 0), Some(&check))
            .is_some_and(|reason| reason.contains("not expected output")));
        assert_eq!(evaluate_check(&result("def456", 0), Some(&check)), None);
    }

    #[test]
    fn empty_forbidden_substring_is_vacuous() {
        // An unset old-container-id must not reject every output.
        let check = Check {
            not_expected_output: String::new(),
            ..Check::default()
        };
        assert_eq!(evaluate_check(&result("abc123", 0), Some(&check)), None);
    }

    #[test]
    fn non_zero_expected_exit_code_is_honoured() {
        let check = Check {
            expected_exit_code: 2,
            ..Check::default()
        };

        assert_eq!(evaluate_check(&result("missing", 2), Some(&check)), None);
        assert!(evaluate_check(&result("present", 0), Some(&check)).is_some());
    }
}
