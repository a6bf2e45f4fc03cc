//! In-memory host for dry runs and tests
//!
//! [`SimulatedHost`] models just enough of a Linux box to drive every
//! manager: interfaces with link state and hardware addresses, installed
//! tools, system services, scripted long-running children and injected
//! command failures. Every command, spawn, terminate and kill is appended
//! to an ordered journal.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};

use super::{ChildProcess, CommandOutput, OutputLine, OutputStream, ProcessExit, SystemHost};

/// How a spawned simulated child behaves
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildScript {
    /// Keeps running after printing `lines`; exits when terminated
    Runs { lines: Vec<String> },
    /// Keeps running and ignores SIGTERM; only a kill ends it
    IgnoresTerminate { lines: Vec<String> },
    /// Prints `stderr` and exits right away with `code`
    Exits { code: i32, stderr: Vec<String> },
}

impl Default for ChildScript {
    fn default() -> Self {
        ChildScript::Runs { lines: Vec::new() }
    }
}

#[derive(Debug, Clone)]
struct SimInterface {
    address: String,
    up: bool,
}

#[derive(Debug, Clone, Default)]
struct SimService {
    enabled: bool,
    active: bool,
    /// What `is-enabled` prints for an enabled unit
    enabled_label: Option<String>,
}

#[derive(Debug, Clone)]
struct InjectedFailure {
    program: String,
    needles: Vec<String>,
    stderr: String,
}

impl InjectedFailure {
    fn matches(&self, program: &str, args: &[&str]) -> bool {
        self.program == program && self.needles.iter().all(|n| args.contains(&n.as_str()))
    }
}

struct ChildShared {
    exit: watch::Sender<Option<ProcessExit>>,
    output: Mutex<Option<mpsc::UnboundedSender<OutputLine>>>,
}

impl ChildShared {
    fn finish(&self, code: Option<i32>) {
        self.exit.send_if_modified(|exit| {
            if exit.is_none() {
                *exit = Some(ProcessExit { code });
                true
            } else {
                false
            }
        });
        lock(&self.output).take();
    }

    fn push_line(&self, stream: OutputStream, text: &str) {
        if let Some(tx) = lock(&self.output).as_ref() {
            let _ = tx.send(OutputLine {
                stream,
                text: text.to_string(),
            });
        }
    }

    fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }
}

#[derive(Default)]
struct SimState {
    interfaces: BTreeMap<String, SimInterface>,
    tools: HashSet<String>,
    services: HashMap<String, SimService>,
    stuck_services: HashSet<String>,
    failures: Vec<InjectedFailure>,
    scripts: HashMap<String, ChildScript>,
    children: Vec<(String, Arc<ChildShared>)>,
    journal: Vec<String>,
    next_pid: u32,
    generated: u32,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Simulated host. Clones share state.
#[derive(Clone, Default)]
pub struct SimulatedHost {
    state: Arc<Mutex<SimState>>,
}

impl std::fmt::Debug for SimulatedHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("SimulatedHost")
            .field("interfaces", &state.interfaces.keys().collect::<Vec<_>>())
            .field("journal_len", &state.journal.len())
            .finish()
    }
}

impl SimulatedHost {
    /// An empty host: no interfaces, no tools, no services
    pub fn new() -> Self {
        Self::default()
    }

    /// A typical workstation: `lo` and `eth0` (`aa:bb:cc:dd:ee:01`), all
    /// default tools installed, `tor` service installed but stopped
    pub fn with_defaults() -> Self {
        let host = Self::new();
        host.add_interface("lo", "00:00:00:00:00:00");
        host.add_interface("eth0", "aa:bb:cc:dd:ee:01");
        for tool in ["macchanger", "ip", "openvpn", "tor", "systemctl", "service", "tornet"] {
            host.install_tool(tool);
        }
        host.add_service("tor", false, false);
        host
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        lock(&self.state)
    }

    /// Add (or replace) an interface, administratively up
    pub fn add_interface(&self, name: &str, address: &str) {
        self.state().interfaces.insert(
            name.to_string(),
            SimInterface {
                address: address.to_string(),
                up: true,
            },
        );
    }

    /// Mark an executable as installed
    pub fn install_tool(&self, program: &str) {
        self.state().tools.insert(program.to_string());
    }

    /// Mark an executable as missing
    pub fn remove_tool(&self, program: &str) {
        self.state().tools.remove(program);
    }

    /// Add a system service
    pub fn add_service(&self, name: &str, enabled: bool, active: bool) {
        self.state()
            .services
            .insert(
                name.to_string(),
                SimService {
                    enabled,
                    active,
                    enabled_label: None,
                },
            );
    }

    /// Mark a service enabled, reported by `is-enabled` as `label`
    /// (`enabled-runtime`, `static`, ...)
    pub fn set_enabled_label(&self, name: &str, label: &str) {
        if let Some(service) = self.state().services.get_mut(name) {
            service.enabled = true;
            service.enabled_label = Some(label.to_string());
        }
    }

    /// Start commands for `name` succeed but the service never becomes active
    pub fn make_service_stuck(&self, name: &str) {
        self.state().stuck_services.insert(name.to_string());
    }

    /// Fail every `program` invocation whose arguments contain all `needles`
    pub fn fail_command(&self, program: &str, needles: &[&str], stderr: &str) {
        self.state().failures.push(InjectedFailure {
            program: program.to_string(),
            needles: needles.iter().map(|n| n.to_string()).collect(),
            stderr: stderr.to_string(),
        });
    }

    /// Remove every injected failure
    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    /// Script the behaviour of children spawned from `program`
    pub fn set_child_script(&self, program: &str, script: ChildScript) {
        self.state().scripts.insert(program.to_string(), script);
    }

    /// Ordered record of every action taken against the host
    pub fn journal(&self) -> Vec<String> {
        self.state().journal.clone()
    }

    /// Current hardware address of an interface
    pub fn address_of(&self, interface: &str) -> Option<String> {
        self.state().interfaces.get(interface).map(|i| i.address.clone())
    }

    /// Whether an interface is administratively up
    pub fn is_link_up(&self, interface: &str) -> Option<bool> {
        self.state().interfaces.get(interface).map(|i| i.up)
    }

    /// `(enabled, active)` of a service
    pub fn service_state(&self, name: &str) -> Option<(bool, bool)> {
        self.state().services.get(name).map(|s| (s.enabled, s.active))
    }

    /// Number of still-running children spawned from `program`
    pub fn running_children(&self, program: &str) -> usize {
        self.state()
            .children
            .iter()
            .filter(|(p, c)| p == program && !c.has_exited())
            .count()
    }

    /// Make every running child of `program` exit on its own with `code`
    pub fn exit_children(&self, program: &str, code: i32) {
        let children: Vec<_> = self
            .state()
            .children
            .iter()
            .filter(|(p, _)| p == program)
            .map(|(_, c)| c.clone())
            .collect();
        for child in children {
            child.finish(Some(code));
        }
    }

    /// Emit an output line from every running child of `program`
    pub fn child_output(&self, program: &str, stream: OutputStream, text: &str) {
        let children: Vec<_> = self
            .state()
            .children
            .iter()
            .filter(|(p, c)| p == program && !c.has_exited())
            .map(|(_, c)| c.clone())
            .collect();
        for child in children {
            child.push_line(stream, text);
        }
    }

    fn record(&self, entry: String) {
        self.state().journal.push(entry);
    }

    fn link(&self, args: &[&str]) -> CommandOutput {
        match args {
            ["link", "set", interface, state @ ("up" | "down")] => {
                let mut sim = self.state();
                match sim.interfaces.get_mut(*interface) {
                    Some(iface) => {
                        iface.up = *state == "up";
                        ok("")
                    }
                    None => failed(
                        1,
                        &format!("Cannot find device \"{}\"", interface),
                    ),
                }
            }
            _ => failed(1, "unsupported ip invocation"),
        }
    }

    fn macchanger(&self, args: &[&str]) -> CommandOutput {
        let (interface, requested) = match args {
            ["-r", interface] => (*interface, None),
            ["-m", address, interface] => (*interface, Some(address.to_lowercase())),
            _ => return failed(1, "unsupported macchanger invocation"),
        };

        let mut sim = self.state();
        sim.generated += 1;
        let generated = sim.generated;
        let Some(iface) = sim.interfaces.get_mut(interface) else {
            return failed(1, &format!("[ERROR] Could not change MAC: no such interface {}", interface));
        };

        let previous = iface.address.clone();
        let new_address = requested.unwrap_or_else(|| {
            format!(
                "02:00:00:{:02x}:{:02x}:{:02x}",
                (generated >> 16) & 0xff,
                (generated >> 8) & 0xff,
                generated & 0xff
            )
        });
        iface.address = new_address.clone();

        ok(&format!(
            "Current MAC:   {} (unknown)\nPermanent MAC: {} (unknown)\nNew MAC:       {} (unknown)",
            previous, previous, new_address
        ))
    }

    fn service_command(&self, name: &str, action: &str) -> CommandOutput {
        let mut sim = self.state();
        let stuck = sim.stuck_services.contains(name);
        let Some(service) = sim.services.get_mut(name) else {
            return failed(5, &format!("Unit {}.service not found.", name));
        };

        match action {
            "is-enabled" => {
                if service.enabled {
                    ok(service.enabled_label.as_deref().unwrap_or("enabled"))
                } else {
                    CommandOutput {
                        success: false,
                        code: Some(1),
                        stdout: "disabled".to_string(),
                        stderr: String::new(),
                    }
                }
            }
            "is-active" => {
                if service.active {
                    ok("active")
                } else {
                    CommandOutput {
                        success: false,
                        code: Some(3),
                        stdout: "inactive".to_string(),
                        stderr: String::new(),
                    }
                }
            }
            "enable" => {
                service.enabled = true;
                ok("")
            }
            "start" => {
                if !stuck {
                    service.active = true;
                }
                ok("")
            }
            "stop" => {
                service.active = false;
                ok("")
            }
            other => failed(1, &format!("unknown action {}", other)),
        }
    }
}

fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        success: true,
        code: Some(0),
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

fn failed(code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        success: false,
        code: Some(code),
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

#[async_trait]
impl SystemHost for SimulatedHost {
    async fn tool_available(&self, program: &str) -> bool {
        self.state().tools.contains(program)
    }

    async fn run(&self, program: &str, args: &[&str]) -> CommandOutput {
        self.record(format!("{} {}", program, args.join(" ")));

        let injected = {
            let sim = self.state();
            if !sim.tools.contains(program) {
                return CommandOutput::spawn_failure(&io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{}: command not found", program),
                ));
            }
            sim.failures
                .iter()
                .find(|f| f.matches(program, args))
                .map(|f| f.stderr.clone())
        };
        if let Some(stderr) = injected {
            return failed(1, &stderr);
        }

        match program {
            "ip" => self.link(args),
            "macchanger" => self.macchanger(args),
            "systemctl" => match args {
                [action, name] => self.service_command(name, action),
                _ => failed(1, "unsupported systemctl invocation"),
            },
            "service" => match args {
                [name, action @ ("start" | "stop")] => self.service_command(name, action),
                _ => failed(1, "unsupported service invocation"),
            },
            _ => ok(""),
        }
    }

    async fn spawn(&self, program: &str, args: &[&str]) -> io::Result<Box<dyn ChildProcess>> {
        self.record(format!("spawn {} {}", program, args.join(" ")));

        let mut sim = self.state();
        if !sim.tools.contains(program) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{}: command not found", program),
            ));
        }

        sim.next_pid += 1;
        let pid = 1000 + sim.next_pid;
        let script = sim.scripts.get(program).cloned().unwrap_or_default();

        let (exit, _) = watch::channel(None);
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ChildShared {
            exit,
            output: Mutex::new(Some(tx)),
        });

        let ignores_terminate = matches!(script, ChildScript::IgnoresTerminate { .. });
        match &script {
            ChildScript::Runs { lines } | ChildScript::IgnoresTerminate { lines } => {
                for line in lines {
                    shared.push_line(OutputStream::Stdout, line);
                }
            }
            ChildScript::Exits { code, stderr } => {
                for line in stderr {
                    shared.push_line(OutputStream::Stderr, line);
                }
                shared.finish(Some(*code));
            }
        }

        sim.children.push((program.to_string(), shared.clone()));

        Ok(Box::new(SimChild {
            program: program.to_string(),
            pid,
            host: self.clone(),
            shared,
            output: Some(rx),
            ignores_terminate,
        }))
    }

    async fn hardware_address(&self, interface: &str) -> io::Result<String> {
        self.address_of(interface).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such interface: {}", interface),
            )
        })
    }

    async fn list_interfaces(&self) -> io::Result<Vec<String>> {
        Ok(self
            .state()
            .interfaces
            .keys()
            .filter(|name| name.as_str() != "lo")
            .cloned()
            .collect())
    }
}

struct SimChild {
    program: String,
    pid: u32,
    host: SimulatedHost,
    shared: Arc<ChildShared>,
    output: Option<mpsc::UnboundedReceiver<OutputLine>>,
    ignores_terminate: bool,
}

#[async_trait]
impl ChildProcess for SimChild {
    fn id(&self) -> Option<u32> {
        if self.shared.has_exited() {
            None
        } else {
            Some(self.pid)
        }
    }

    fn take_output(&mut self) -> Option<mpsc::UnboundedReceiver<OutputLine>> {
        self.output.take()
    }

    async fn wait(&mut self) -> io::Result<ProcessExit> {
        let mut exit = self.shared.exit.subscribe();
        loop {
            if let Some(status) = *exit.borrow_and_update() {
                return Ok(status);
            }
            if exit.changed().await.is_err() {
                return Err(io::Error::new(io::ErrorKind::Other, "child state lost"));
            }
        }
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.host.record(format!("terminate {}", self.program));
        if self.shared.has_exited() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "process already exited"));
        }
        if !self.ignores_terminate {
            self.shared.finish(None);
        }
        Ok(())
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.host.record(format!("kill {}", self.program));
        self.shared.finish(None);
        Ok(())
    }
}
