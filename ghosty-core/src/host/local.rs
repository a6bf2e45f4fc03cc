//! Host implementation backed by the local operating system

use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use super::{ChildProcess, CommandOutput, OutputLine, OutputStream, ProcessExit, SystemHost};

/// The real host: `tokio::process` for commands, sysfs for interfaces
#[derive(Debug, Clone)]
pub struct LocalHost {
    sysfs_net_dir: PathBuf,
}

impl Default for LocalHost {
    fn default() -> Self {
        Self::new("/sys/class/net")
    }
}

impl LocalHost {
    /// Create a host reading interfaces from `sysfs_net_dir`
    pub fn new(sysfs_net_dir: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_net_dir: sysfs_net_dir.into(),
        }
    }
}

#[async_trait]
impl SystemHost for LocalHost {
    async fn tool_available(&self, program: &str) -> bool {
        Command::new("which")
            .arg(program)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }

    async fn run(&self, program: &str, args: &[&str]) -> CommandOutput {
        tracing::debug!("exec: {} {}", program, args.join(" "));

        match Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
        {
            Ok(output) => CommandOutput {
                success: output.status.success(),
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            },
            Err(e) => CommandOutput::spawn_failure(&e),
        }
    }

    async fn spawn(&self, program: &str, args: &[&str]) -> io::Result<Box<dyn ChildProcess>> {
        tracing::debug!("spawn: {} {}", program, args.join(" "));

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, OutputStream::Stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, OutputStream::Stderr, tx);
        }

        Ok(Box::new(LocalChild {
            child,
            output: Some(rx),
        }))
    }

    async fn hardware_address(&self, interface: &str) -> io::Result<String> {
        if interface.is_empty() || interface.contains('/') {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("invalid interface name: {:?}", interface),
            ));
        }

        let path = self.sysfs_net_dir.join(interface).join("address");
        let content = tokio::fs::read_to_string(path).await?;
        Ok(content.trim().to_string())
    }

    async fn list_interfaces(&self) -> io::Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.sysfs_net_dir).await?;
        let mut interfaces = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name != "lo" {
                interfaces.push(name);
            }
        }

        interfaces.sort();
        Ok(interfaces)
    }
}

fn forward_lines<R>(reader: R, stream: OutputStream, tx: mpsc::UnboundedSender<OutputLine>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(text)) = lines.next_line().await {
            if tx.send(OutputLine { stream, text }).is_err() {
                break;
            }
        }
    });
}

struct LocalChild {
    child: Child,
    output: Option<mpsc::UnboundedReceiver<OutputLine>>,
}

#[async_trait]
impl ChildProcess for LocalChild {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn take_output(&mut self) -> Option<mpsc::UnboundedReceiver<OutputLine>> {
        self.output.take()
    }

    async fn wait(&mut self) -> io::Result<ProcessExit> {
        let status = self.child.wait().await?;
        Ok(ProcessExit {
            code: status.code(),
        })
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        let pid = self
            .child
            .id()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "process already exited"))?;
        let pid = i32::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;

        signal::kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(io::Error::from)
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_sysfs() -> TempDir {
        let dir = TempDir::new().unwrap();
        for (name, address) in [("lo", "00:00:00:00:00:00"), ("eth0", "aa:bb:cc:dd:ee:01"), ("wlan0", "aa:bb:cc:dd:ee:02")] {
            let iface = dir.path().join(name);
            std::fs::create_dir(&iface).unwrap();
            std::fs::write(iface.join("address"), format!("{}\n", address)).unwrap();
        }
        dir
    }

    #[tokio::test]
    async fn test_hardware_address_from_sysfs() {
        let dir = fake_sysfs();
        let host = LocalHost::new(dir.path());

        assert_eq!(host.hardware_address("eth0").await.unwrap(), "aa:bb:cc:dd:ee:01");
        let missing = host.hardware_address("eth9").await.unwrap_err();
        assert_eq!(missing.kind(), io::ErrorKind::NotFound);
        assert!(host.hardware_address("../eth0").await.is_err());
    }

    #[tokio::test]
    async fn test_list_interfaces_skips_loopback() {
        let dir = fake_sysfs();
        let host = LocalHost::new(dir.path());

        let interfaces = host.list_interfaces().await.unwrap();
        assert_eq!(interfaces, vec!["eth0".to_string(), "wlan0".to_string()]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_reports_missing_program() {
        let host = LocalHost::default();
        let output = host.run("ghosty-no-such-program", &["--version"]).await;
        assert!(!output.success);
        assert!(output.code.is_none());
        assert!(!output.stderr.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_streams_output() {
        let host = LocalHost::default();
        let mut child = host.spawn("sh", &["-c", "echo hello; echo oops >&2; exit 3"]).await.unwrap();
        let mut output = child.take_output().unwrap();

        let exit = child.wait().await.unwrap();
        assert_eq!(exit.code, Some(3));

        let mut lines = Vec::new();
        while let Some(line) = output.recv().await {
            lines.push(line);
        }
        assert!(lines.iter().any(|l| l.stream == OutputStream::Stdout && l.text == "hello"));
        assert!(lines.iter().any(|l| l.stream == OutputStream::Stderr && l.text == "oops"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_running_child() {
        let host = LocalHost::default();
        let mut child = host.spawn("sleep", &["30"]).await.unwrap();
        assert!(child.id().is_some());

        child.terminate().unwrap();
        let exit = child.wait().await.unwrap();
        assert!(!exit.success());
    }
}
