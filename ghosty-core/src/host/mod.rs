//! Host abstraction
//!
//! Every manager talks to the operating system through [`SystemHost`]: tool
//! presence checks, one-shot commands, long-running children and interface
//! inspection. [`LocalHost`] is the real implementation; [`SimulatedHost`]
//! is an in-memory host used for dry runs and tests.

use async_trait::async_trait;
use std::fmt;
use std::io;
use tokio::sync::mpsc;

pub mod local;
pub mod simulated;

pub use local::LocalHost;
pub use simulated::{ChildScript, SimulatedHost};

/// Result of a command run to completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status was zero
    pub success: bool,
    /// Exit code, if the process exited normally
    pub code: Option<i32>,
    /// Trimmed standard output
    pub stdout: String,
    /// Trimmed standard error
    pub stderr: String,
}

impl CommandOutput {
    /// A command that could not be started at all
    pub fn spawn_failure(error: &io::Error) -> Self {
        Self {
            success: false,
            code: None,
            stdout: String::new(),
            stderr: error.to_string(),
        }
    }

    /// Best available explanation for a failed command
    pub fn failure_reason(&self) -> String {
        if !self.stderr.is_empty() {
            self.stderr.clone()
        } else if !self.stdout.is_empty() {
            self.stdout.clone()
        } else {
            match self.code {
                Some(code) => format!("exit status {}", code),
                None => "terminated by signal".to_string(),
            }
        }
    }
}

/// Which stream a child output line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

/// One line of child process output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    /// Originating stream
    pub stream: OutputStream,
    /// Line content without the trailing newline
    pub text: String,
}

/// Exit status of a child process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code; `None` when the process was ended by a signal
    pub code: Option<i32>,
}

impl ProcessExit {
    /// Exited with status zero
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit status {}", code),
            None => f.write_str("terminated by signal"),
        }
    }
}

/// A spawned long-running child process
#[async_trait]
pub trait ChildProcess: Send {
    /// OS process id, if still known
    fn id(&self) -> Option<u32>;

    /// Merged stdout/stderr line stream; yields `None` after the first call
    fn take_output(&mut self) -> Option<mpsc::UnboundedReceiver<OutputLine>>;

    /// Wait for the process to exit. Must be cancel safe.
    async fn wait(&mut self) -> io::Result<ProcessExit>;

    /// Request graceful termination (SIGTERM)
    fn terminate(&mut self) -> io::Result<()>;

    /// Force the process to end
    async fn kill(&mut self) -> io::Result<()>;
}

/// Operating system services used by the managers
#[async_trait]
pub trait SystemHost: Send + Sync {
    /// Whether an executable is installed
    async fn tool_available(&self, program: &str) -> bool;

    /// Run a command to completion. Failure to start is reported as an
    /// unsuccessful [`CommandOutput`].
    async fn run(&self, program: &str, args: &[&str]) -> CommandOutput;

    /// Start a long-running child with piped output
    async fn spawn(&self, program: &str, args: &[&str]) -> io::Result<Box<dyn ChildProcess>>;

    /// Live hardware address of an interface
    async fn hardware_address(&self, interface: &str) -> io::Result<String>;

    /// Interface names, excluding loopback
    async fn list_interfaces(&self) -> io::Result<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reason_prefers_stderr() {
        let output = CommandOutput {
            success: false,
            code: Some(1),
            stdout: "partial".to_string(),
            stderr: "Cannot find device".to_string(),
        };
        assert_eq!(output.failure_reason(), "Cannot find device");

        let output = CommandOutput {
            success: false,
            code: Some(3),
            stdout: String::new(),
            stderr: String::new(),
        };
        assert_eq!(output.failure_reason(), "exit status 3");
    }

    #[test]
    fn test_process_exit() {
        assert!(ProcessExit { code: Some(0) }.success());
        assert!(!ProcessExit { code: Some(1) }.success());
        assert!(!ProcessExit { code: None }.success());
        assert_eq!(ProcessExit { code: None }.to_string(), "terminated by signal");
    }
}
