use crate::errors::Result;
use crate::ssh_client::SshClient;

/// A unit of remote work with a human name. Tasks run against a live shell
/// and yield a textual result or an error; the plan executor aborts on the
/// first error.
pub trait Task {
    fn name(&self) -> &'static str;
    fn run(&self, client: &SshClient) -> Result<String>;
}

/// Polling policy for a [`crate::task_command::CommandTask`].
///
/// Zero-valued timeout/interval fall back to 10 s / 1 s. Empty output
/// expectations are vacuously satisfied.
#[derive(Debug, Clone, Default)]
pub struct Check {
    pub expected_exit_code: i32,
    pub expected_output: String,
    pub not_expected_output: String,
    pub timeout_secs: u64,
    pub retry_interval_secs: u64,
}
