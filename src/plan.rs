use tracing::debug;

use crate::errors::Result;
use crate::models::Host;
use crate::ssh_client::SshClient;
use crate::task_types::Task;

/// One remote host and the tasks to run against it, in order.
pub struct RemoteSession {
    pub host: Host,
    pub tasks: Vec<Box<dyn Task>>,
}

/// An ordered sequence of remote sessions. Execution is fully sequential
/// and aborts on the first error; recovery safety comes from task
/// idempotence, not from compensation.
pub struct ExecutionPlan {
    pub name: String,
    pub sessions: Vec<RemoteSession>,
}

impl ExecutionPlan {
    pub fn execute(&self) -> Result<()> {
        for session in &self.sessions {
            let client = SshClient::connect(&session.host)?;

            for task in &session.tasks {
                debug!(
                    plan = %self.name,
                    task = task.name(),
                    host = %session.host.host,
                    "running task"
                );
                task.run(&client)?;
            }

            client.close();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{ExecutionPlan, RemoteSession};
    use crate::errors::{RecoveryError, Result};
    use crate::models::Host;
    use crate::ssh_client::SshClient;
    use crate::task_types::Task;

    struct MockTask {
        should_fail: bool,
    }

    impl Task for MockTask {
        fn name(&self) -> &'static str {
            "MockTask"
        }

        fn run(&self, _client: &SshClient) -> Result<String> {
            if self.should_fail {
                return Err(RecoveryError::Validation("mock task failure".to_string()));
            }
            Ok("mocked_output".to_string())
        }
    }

    #[test]
    fn execute_fails_before_dialling_without_credentials() {
        let host = Host {
            name: "test".to_string(),
            member_name: None,
            host: "localhost".to_string(),
            username: "root".to_string(),
            password: None,
            private_key: None,
            passphrase: None,
            backedup_manifest: String::new(),
        };
        let plan = ExecutionPlan {
            name: "TestPlan".to_string(),
            sessions: vec![RemoteSession {
                host,
                tasks: vec![Box::new(MockTask { should_fail: false })],
            }],
        };

        let error = plan.execute().expect_err("connect must fail");
        assert!(error.to_string().contains("no private key/password"));
    }

    #[test]
    fn empty_plan_succeeds() {
        let plan = ExecutionPlan {
            name: "TestPlan".to_string(),
            sessions: Vec::new(),
        };

        assert!(plan.execute().is_ok());
    }
}
