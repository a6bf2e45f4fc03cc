//! Supervision of long-running child processes
//!
//! [`SupervisedProcess::start`] moves a [`ChildProcess`] into a dedicated
//! task. The task consumes the child's output, publishes liveness through a
//! `watch` cell and handles stop requests (SIGTERM, bounded wait, then kill).
//! Owners never touch the child directly.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::events::{Component, EventBus};
use crate::host::{ChildProcess, OutputLine, OutputStream, ProcessExit};

const TAIL_LINES: usize = 20;
const DRAIN_TIMEOUT: Duration = Duration::from_millis(250);
const KILL_WAIT: Duration = Duration::from_secs(5);
const JOIN_GRACE: Duration = Duration::from_secs(5);

/// What to do with each output line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineHandling {
    /// Publish every line on the event bus
    Publish,
    /// Only trace lines at debug level
    Trace,
}

/// How a supervised process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    /// Exit status; `None` if it could not be collected
    pub exit: Option<ProcessExit>,
    /// The owner asked the process to stop
    pub stop_requested: bool,
    /// Graceful termination timed out and the process was killed
    pub forced: bool,
    /// Most recent stderr lines
    pub stderr_tail: Vec<String>,
    /// Most recent lines from either stream
    pub output_tail: Vec<String>,
    /// Error raised while waiting on or signalling the process
    pub error: Option<String>,
}

impl ExitReport {
    fn unknown(reason: &str) -> Self {
        Self {
            exit: None,
            stop_requested: false,
            forced: false,
            stderr_tail: Vec::new(),
            output_tail: Vec::new(),
            error: Some(reason.to_string()),
        }
    }

    /// Exited with status zero
    pub fn success(&self) -> bool {
        self.exit.map(|e| e.success()).unwrap_or(false)
    }

    /// Best available explanation of the exit, for error messages
    pub fn diagnostic(&self) -> String {
        if !self.stderr_tail.is_empty() {
            self.stderr_tail.join("\n")
        } else if !self.output_tail.is_empty() {
            self.output_tail.join("\n")
        } else if let Some(error) = &self.error {
            error.clone()
        } else {
            match self.exit {
                Some(exit) => exit.to_string(),
                None => "unknown exit status".to_string(),
            }
        }
    }
}

/// Liveness of a supervised process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    /// Still running
    Running,
    /// Ended, with how
    Exited(ExitReport),
}

/// Handle to a child running under a supervision task
#[derive(Debug)]
pub struct SupervisedProcess {
    label: String,
    pid: Option<u32>,
    state: watch::Receiver<ProcessState>,
    stop_tx: Option<oneshot::Sender<Duration>>,
    task: Option<JoinHandle<()>>,
}

impl SupervisedProcess {
    /// Start supervising `child`. Must be called within a tokio runtime.
    pub fn start(
        label: impl Into<String>,
        mut child: Box<dyn ChildProcess>,
        events: EventBus,
        component: Component,
        lines: LineHandling,
    ) -> Self {
        let label = label.into();
        let pid = child.id();
        let output = child.take_output();
        let (state_tx, state) = watch::channel(ProcessState::Running);
        let (stop_tx, stop_rx) = oneshot::channel();

        let task = tokio::spawn(supervise(Supervision {
            child,
            output,
            stop_rx,
            state_tx,
            sink: LineSink {
                label: label.clone(),
                events,
                component,
                lines,
            },
        }));

        Self {
            label,
            pid,
            state,
            stop_tx: Some(stop_tx),
            task: Some(task),
        }
    }

    /// Name used in events
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Process id at spawn time
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the child is still running
    pub fn is_running(&self) -> bool {
        matches!(*self.state.borrow(), ProcessState::Running)
    }

    /// Exit report, once the child has ended
    pub fn exit_report(&self) -> Option<ExitReport> {
        match &*self.state.borrow() {
            ProcessState::Running => None,
            ProcessState::Exited(report) => Some(report.clone()),
        }
    }

    /// Liveness cell, for observers
    pub fn watch_state(&self) -> watch::Receiver<ProcessState> {
        self.state.clone()
    }

    /// Wait until the child has exited on its own and its output is drained
    pub async fn wait_exit(&self) -> ExitReport {
        let mut state = self.state.clone();
        loop {
            if let ProcessState::Exited(report) = &*state.borrow_and_update() {
                return report.clone();
            }
            if state.changed().await.is_err() {
                return ExitReport::unknown("supervision task ended unexpectedly");
            }
        }
    }

    /// Stop the child: SIGTERM, wait up to `timeout`, then kill. Joins the
    /// supervision task (bounded) and returns how the child ended.
    pub async fn shutdown(mut self, timeout: Duration) -> ExitReport {
        if let Some(stop_tx) = self.stop_tx.take() {
            // Fails only if the task already finished.
            let _ = stop_tx.send(timeout);
        }

        if let Some(task) = self.task.take() {
            match tokio::time::timeout(timeout + KILL_WAIT + JOIN_GRACE, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("{} supervision task failed: {}", self.label, e),
                Err(_) => tracing::warn!("{} supervision task did not finish in time", self.label),
            }
        }

        self.exit_report()
            .unwrap_or_else(|| ExitReport::unknown("process state unavailable after shutdown"))
    }
}

struct Supervision {
    child: Box<dyn ChildProcess>,
    output: Option<mpsc::UnboundedReceiver<OutputLine>>,
    stop_rx: oneshot::Receiver<Duration>,
    state_tx: watch::Sender<ProcessState>,
    sink: LineSink,
}

/// Where output lines and lifecycle events go. Kept apart from the child so
/// it can be borrowed across awaits without requiring the child to be `Sync`.
struct LineSink {
    label: String,
    events: EventBus,
    component: Component,
    lines: LineHandling,
}

impl LineSink {
    fn handle(&self, tail: &mut Tail, line: OutputLine) {
        match self.lines {
            LineHandling::Publish => self
                .events
                .info(self.component, format!("{}: {}", self.label, line.text)),
            LineHandling::Trace => tracing::debug!("{}: {}", self.label, line.text),
        }
        tail.push(&line);
    }
}

#[derive(Default)]
struct Tail {
    stderr: VecDeque<String>,
    all: VecDeque<String>,
}

impl Tail {
    fn push(&mut self, line: &OutputLine) {
        if line.stream == OutputStream::Stderr {
            push_bounded(&mut self.stderr, &line.text);
        }
        push_bounded(&mut self.all, &line.text);
    }
}

fn push_bounded(buffer: &mut VecDeque<String>, line: &str) {
    if buffer.len() == TAIL_LINES {
        buffer.pop_front();
    }
    buffer.push_back(line.to_string());
}

async fn next_line(output: &mut Option<mpsc::UnboundedReceiver<OutputLine>>) -> Option<OutputLine> {
    match output {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn supervise(mut s: Supervision) {
    let mut tail = Tail::default();
    let mut stop_open = true;

    let (exit, stop_requested, forced, error) = loop {
        tokio::select! {
            line = next_line(&mut s.output) => match line {
                Some(line) => s.sink.handle(&mut tail, line),
                None => s.output = None,
            },
            request = &mut s.stop_rx, if stop_open => match request {
                Ok(timeout) => {
                    let (exit, forced, error) = stop_child(&s.sink.label, s.child.as_mut(), timeout).await;
                    break (exit, true, forced, error);
                }
                // Owner dropped its handle without stopping; keep watching.
                Err(_) => stop_open = false,
            },
            status = s.child.wait() => match status {
                Ok(exit) => break (Some(exit), false, false, None),
                Err(e) => break (None, false, false, Some(e.to_string())),
            },
        }
    };

    // The child has exited; only its buffered output remains.
    drop(s.child);
    let sink = s.sink;

    if let Some(mut rx) = s.output.take() {
        let drain = async {
            while let Some(line) = rx.recv().await {
                sink.handle(&mut tail, line);
            }
        };
        let _ = tokio::time::timeout(DRAIN_TIMEOUT, drain).await;
    }

    let report = ExitReport {
        exit,
        stop_requested,
        forced,
        stderr_tail: tail.stderr.into_iter().collect(),
        output_tail: tail.all.into_iter().collect(),
        error,
    };

    if report.stop_requested {
        let how = if report.forced { "killed" } else { "stopped" };
        sink.events.info(sink.component, format!("{} {}", sink.label, how));
    } else if report.success() {
        sink.events
            .info(sink.component, format!("{} process ended normally", sink.label));
    } else {
        sink.events.error(
            sink.component,
            format!("{} process ended with error: {}", sink.label, report.diagnostic()),
        );
    }

    s.state_tx.send_replace(ProcessState::Exited(report));
}

async fn stop_child(
    label: &str,
    child: &mut dyn ChildProcess,
    timeout: Duration,
) -> (Option<ProcessExit>, bool, Option<String>) {
    if let Err(e) = child.terminate() {
        tracing::debug!("{}: terminate failed: {}", label, e);
    }

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(exit)) => (Some(exit), false, None),
        Ok(Err(e)) => (None, false, Some(e.to_string())),
        Err(_) => {
            tracing::warn!("{} did not exit within {:?}, killing", label, timeout);
            if let Err(e) = child.kill().await {
                tracing::warn!("{}: kill failed: {}", label, e);
            }
            match tokio::time::timeout(KILL_WAIT, child.wait()).await {
                Ok(Ok(exit)) => (Some(exit), true, None),
                Ok(Err(e)) => (None, true, Some(e.to_string())),
                Err(_) => (None, true, Some("process did not exit after kill".to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventLevel;
    use crate::host::{ChildScript, SimulatedHost, SystemHost};

    async fn start(host: &SimulatedHost, program: &str, events: &EventBus, lines: LineHandling) -> SupervisedProcess {
        let child = host.spawn(program, &[]).await.unwrap();
        SupervisedProcess::start(program, child, events.clone(), Component::Rotation, lines)
    }

    #[tokio::test]
    async fn test_shutdown_terminates_gracefully() {
        let host = SimulatedHost::with_defaults();
        let events = EventBus::new();
        let process = start(&host, "tornet", &events, LineHandling::Trace).await;
        assert!(process.is_running());
        assert!(process.pid().is_some());

        let report = process.shutdown(Duration::from_millis(200)).await;
        assert!(report.stop_requested);
        assert!(!report.forced);
        assert_eq!(host.running_children("tornet"), 0);
        assert!(host.journal().contains(&"terminate tornet".to_string()));
    }

    #[tokio::test]
    async fn test_shutdown_escalates_to_kill() {
        let host = SimulatedHost::with_defaults();
        host.set_child_script("tornet", ChildScript::IgnoresTerminate { lines: vec![] });
        let events = EventBus::new();
        let process = start(&host, "tornet", &events, LineHandling::Trace).await;

        let report = process.shutdown(Duration::from_millis(50)).await;
        assert!(report.forced);
        let journal = host.journal();
        let term = journal.iter().position(|e| e == "terminate tornet").unwrap();
        let kill = journal.iter().position(|e| e == "kill tornet").unwrap();
        assert!(term < kill);
    }

    #[tokio::test]
    async fn test_unexpected_exit_is_reported() {
        let host = SimulatedHost::with_defaults();
        host.set_child_script(
            "openvpn",
            ChildScript::Exits {
                code: 1,
                stderr: vec!["Cannot load certificate".to_string()],
            },
        );
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let process = start(&host, "openvpn", &events, LineHandling::Trace).await;

        let report = process.wait_exit().await;
        assert!(!process.is_running());
        assert!(!report.stop_requested);
        assert_eq!(report.exit, Some(ProcessExit { code: Some(1) }));
        assert_eq!(report.diagnostic(), "Cannot load certificate");

        let event = rx.recv().await.unwrap();
        assert_eq!(event.level, EventLevel::Error);
        assert!(event.message.contains("Cannot load certificate"));
    }

    #[tokio::test]
    async fn test_published_lines_and_normal_end() {
        let host = SimulatedHost::with_defaults();
        host.set_child_script(
            "tornet",
            ChildScript::Runs {
                lines: vec!["Your IP has been changed to 10.0.0.1".to_string()],
            },
        );
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let process = start(&host, "tornet", &events, LineHandling::Publish).await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.message, "tornet: Your IP has been changed to 10.0.0.1");

        host.exit_children("tornet", 0);
        let report = process.wait_exit().await;
        assert!(report.success());

        let event = rx.recv().await.unwrap();
        assert_eq!(event.level, EventLevel::Info);
        assert!(event.message.contains("ended normally"));
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_supervision_task_is_send_with_non_sync_child() {
        let host = SimulatedHost::with_defaults();
        let mut child = host.spawn("tornet", &[]).await.unwrap();
        let output = child.take_output();
        let (state_tx, _state) = watch::channel(ProcessState::Running);
        let (_stop_tx, stop_rx) = oneshot::channel();

        let task = supervise(Supervision {
            child,
            output,
            stop_rx,
            state_tx,
            sink: LineSink {
                label: "tornet".to_string(),
                events: EventBus::new(),
                component: Component::Rotation,
                lines: LineHandling::Trace,
            },
        });
        assert_send(&task);
    }

    #[tokio::test]
    async fn test_shutdown_after_exit_is_harmless() {
        let host = SimulatedHost::with_defaults();
        let events = EventBus::new();
        let process = start(&host, "tornet", &events, LineHandling::Trace).await;

        host.exit_children("tornet", 2);
        process.wait_exit().await;

        let report = process.shutdown(Duration::from_millis(50)).await;
        assert!(!report.stop_requested);
        assert_eq!(report.exit, Some(ProcessExit { code: Some(2) }));
    }
}
