use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;

use crate::config::{ConfigValue, Settings};
use crate::error::{Error, Result};

use super::brick::{Brick, BrickKind, CommandContext};
use super::diagnostics::Severity;
use super::events::{Event, ScheduleId};
use super::notify::{Notification, Reporter};
use super::probe;
use super::resolver::Resolver;
use super::supervisor::{self, ExitNotice, ProcessHandle, SpawnRequest};

/// Message delivered to the factory's control thread from reaper and timer
/// threads. All factory mutation happens while draining these on the control
/// thread; worker threads never touch the graph.
#[derive(Debug)]
pub enum ControlMsg {
    /// A brick process exited; `notice.label` is the brick name.
    ProcessExited(ExitNotice),
    /// A fire-and-forget shell command finished.
    ShellExited(ExitNotice),
    /// An event timer elapsed.
    EventFired { event: String, schedule: ScheduleId },
}

/// How far shutdown of one brick has escalated. Each `poweroff` call moves
/// one step: QMP powerdown, then SIGTERM, then SIGKILL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopPhase {
    Graceful,
    Term,
}

/// Owns the brick graph, the events, and the name → process-handle mapping.
///
/// Callers never hold a [`ProcessHandle`]; bricks are addressed by name and
/// the factory looks the handle up on every operation.
pub struct BrickFactory {
    settings: Settings,
    reporter: Box<dyn Reporter>,
    bricks: Vec<Brick>,
    events: Vec<Event>,
    handles: Vec<(String, ProcessHandle)>,
    requested_stops: HashSet<String>,
    stop_phases: HashMap<String, StopPhase>,
    control_tx: Sender<ControlMsg>,
    control_rx: Receiver<ControlMsg>,
}

impl BrickFactory {
    pub fn new(settings: Settings, reporter: Box<dyn Reporter>) -> Self {
        let (control_tx, control_rx) = mpsc::channel();
        Self {
            settings,
            reporter,
            bricks: Vec::new(),
            events: Vec::new(),
            handles: Vec::new(),
            requested_stops: HashSet::new(),
            stop_phases: HashMap::new(),
            control_tx,
            control_rx,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn bricks(&self) -> impl Iterator<Item = &Brick> {
        self.bricks.iter()
    }

    pub fn events(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.handles.iter().any(|(brick, _)| brick == name)
    }

    fn name_taken(&self, name: &str) -> bool {
        self.bricks.iter().any(|brick| brick.name() == name)
            || self.events.iter().any(|event| event.name() == name)
    }

    fn brick(&self, name: &str) -> Result<&Brick> {
        self.bricks
            .iter()
            .find(|brick| brick.name() == name)
            .ok_or_else(|| Error::UnknownBrick {
                name: name.to_string(),
            })
    }

    fn brick_mut(&mut self, name: &str) -> Result<&mut Brick> {
        self.bricks
            .iter_mut()
            .find(|brick| brick.name() == name)
            .ok_or_else(|| Error::UnknownBrick {
                name: name.to_string(),
            })
    }

    fn event_mut(&mut self, name: &str) -> Result<&mut Event> {
        self.events
            .iter_mut()
            .find(|event| event.name() == name)
            .ok_or_else(|| Error::UnknownBrick {
                name: name.to_string(),
            })
    }

    // --- brick and event CRUD -------------------------------------------------

    pub fn new_brick(&mut self, kind: BrickKind, name: &str) -> Result<()> {
        validate_name(name)?;
        if self.name_taken(name) {
            return Err(Error::DuplicateName {
                name: name.to_string(),
            });
        }
        self.bricks.push(Brick::new(name, kind));
        Ok(())
    }

    pub fn new_event(&mut self, name: &str) -> Result<()> {
        validate_name(name)?;
        if self.name_taken(name) {
            return Err(Error::DuplicateName {
                name: name.to_string(),
            });
        }
        self.events.push(Event::new(name));
        Ok(())
    }

    pub fn remove_brick(&mut self, name: &str) -> Result<()> {
        if self.is_running(name) {
            return Err(Error::BrickRunning {
                brick: name.to_string(),
            });
        }
        let index = self
            .bricks
            .iter()
            .position(|brick| brick.name() == name)
            .ok_or_else(|| Error::UnknownBrick {
                name: name.to_string(),
            })?;
        self.bricks.remove(index);
        Ok(())
    }

    pub fn remove_event(&mut self, name: &str) -> Result<()> {
        let index = self
            .events
            .iter()
            .position(|event| event.name() == name)
            .ok_or_else(|| Error::UnknownBrick {
                name: name.to_string(),
            })?;
        // Dropping the event cancels any pending schedule.
        self.events.remove(index);
        Ok(())
    }

    pub fn rename_brick(&mut self, old: &str, new: &str) -> Result<()> {
        validate_name(new)?;
        if self.is_running(old) {
            return Err(Error::BrickRunning {
                brick: old.to_string(),
            });
        }
        if self.name_taken(new) {
            return Err(Error::DuplicateName {
                name: new.to_string(),
            });
        }
        self.brick_mut(old)?.set_name(new.to_string());
        Ok(())
    }

    // --- configuration and wiring --------------------------------------------

    /// Apply one typed configuration value, validated against the brick
    /// kind's parameter set. Rejected while the brick runs.
    pub fn configure(&mut self, name: &str, key: &str, value: ConfigValue) -> Result<()> {
        if self.is_running(name) {
            return Err(Error::BrickRunning {
                brick: name.to_string(),
            });
        }
        let brick = self.brick_mut(name)?;
        let Some(current) = brick.config().get(key) else {
            return Err(Error::BadConfig {
                brick: name.to_string(),
                message: format!(
                    "`{key}` is not a parameter of {} bricks",
                    brick.kind().as_str()
                ),
            });
        };
        if std::mem::discriminant(current) != std::mem::discriminant(&value) {
            return Err(Error::BadConfig {
                brick: name.to_string(),
                message: format!("`{key}` has the wrong type"),
            });
        }
        brick.config_mut().set(key, value);
        Ok(())
    }

    /// Parse and apply `key=value` given as raw console text.
    pub fn configure_from_str(&mut self, name: &str, key: &str, raw: &str) -> Result<()> {
        let current = self
            .brick(name)?
            .config()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::BadConfig {
                brick: name.to_string(),
                message: format!("`{key}` is not a known parameter"),
            })?;
        let value = coerce_value(&current, raw).map_err(|message| Error::BadConfig {
            brick: name.to_string(),
            message,
        })?;
        self.configure(name, key, value)
    }

    pub fn add_plug(&mut self, name: &str) -> Result<usize> {
        if self.is_running(name) {
            return Err(Error::BrickRunning {
                brick: name.to_string(),
            });
        }
        let brick = self.brick_mut(name)?;
        brick.add_plug();
        Ok(brick.plugs().len() - 1)
    }

    pub fn connect(&mut self, name: &str, plug: usize, peer: &str) -> Result<()> {
        if self.is_running(name) {
            return Err(Error::LinkInUse {
                brick: name.to_string(),
                plug: format!("port{plug}"),
            });
        }
        self.brick(peer)?;
        self.brick_mut(name)?.connect_plug(plug, peer.to_string())
    }

    pub fn disconnect(&mut self, name: &str, plug: usize) -> Result<()> {
        if self.is_running(name) {
            return Err(Error::LinkInUse {
                brick: name.to_string(),
                plug: format!("port{plug}"),
            });
        }
        self.brick_mut(name)?.disconnect_plug(plug)
    }

    // --- lifecycle ------------------------------------------------------------

    /// Power a brick on: validate, resolve the binary, run capability checks,
    /// spawn, and record the handle. A second poweron while running is a
    /// no-op. Failure leaves the brick stopped with the error surfaced to the
    /// caller; other bricks are unaffected.
    pub fn poweron(&mut self, name: &str) -> Result<()> {
        if self.is_running(name) {
            return Ok(());
        }

        let brick = self.brick(name)?;
        brick.validate()?;
        let kind = brick.kind();

        if kind == BrickKind::SwitchWrapper {
            let path = brick
                .socket_path(&self.settings.workspace)
                .unwrap_or_default();
            if !path.exists() {
                return Err(Error::SocketMissing {
                    brick: name.to_string(),
                    path,
                });
            }
            self.reporter.report(Notification::Message {
                severity: Severity::Info,
                text: format!("{name}: wrapping external switch at {}", path.display()),
            });
            return Ok(());
        }

        if kind == BrickKind::Qemu {
            self.check_qemu_host(name)?;
        }

        let resolver = if kind.uses_qemu_tools() {
            Resolver::qemu(&self.settings)
        } else {
            Resolver::vde(&self.settings)
        };
        let binary = self.brick(name)?.binary_name().ok_or_else(|| Error::BadConfig {
            brick: name.to_string(),
            message: "brick kind does not own a process".into(),
        })?;
        let executable = resolver.resolve(&binary)?;

        let vde_resolver = Resolver::vde(&self.settings);
        let ctx = CommandContext {
            workspace: &self.settings.workspace,
            peer_sockets: self.peer_sockets(name)?,
            vde_plug: match kind {
                BrickKind::Wire | BrickKind::Wirefilter => {
                    Some(vde_resolver.resolve("vde_plug")?)
                }
                _ => None,
            },
            wirefilter: match kind {
                BrickKind::Wirefilter => Some(vde_resolver.resolve("wirefilter")?),
                _ => None,
            },
        };
        let args = self.brick(name)?.build_args(&ctx)?;

        fs::create_dir_all(&self.settings.workspace).map_err(|source| Error::Io {
            path: self.settings.workspace.clone(),
            source,
        })?;

        let request = SpawnRequest::new(name, executable)
            .args(args)
            .capture_output();
        let control_tx = self.control_tx.clone();
        let handle = supervisor::spawn(request, move |notice| {
            let _ = control_tx.send(ControlMsg::ProcessExited(notice));
        })?;

        self.reporter.report(Notification::BrickStarted {
            brick: name.to_string(),
            pid: handle.pid(),
        });
        self.handles.push((name.to_string(), handle));
        Ok(())
    }

    /// Power a brick off. Not running is a no-op. QEMU bricks get a
    /// cooperative QMP powerdown attempt first; a repeated `poweroff` on a
    /// guest that acknowledged QMP but stayed up escalates to SIGTERM, then
    /// SIGKILL. No path blocks for the exit, which arrives later as a
    /// control message.
    pub fn poweroff(&mut self, name: &str) -> Result<()> {
        let Some((_, handle)) = self
            .handles
            .iter()
            .find(|(brick, _)| brick == name)
        else {
            return Ok(());
        };
        let handle = handle.clone();
        self.requested_stops.insert(name.to_string());
        let phase = self.stop_phases.get(name).copied();

        let is_qemu = self
            .brick(name)
            .map(|brick| brick.kind() == BrickKind::Qemu)
            .unwrap_or(false);
        if is_qemu && phase.is_none() {
            let socket = self.settings.workspace.join(format!("{name}.qmp"));
            if qmp::powerdown(&socket).is_ok() {
                self.stop_phases.insert(name.to_string(), StopPhase::Graceful);
                self.reporter.report(Notification::Message {
                    severity: Severity::Info,
                    text: format!("{name}: requested cooperative powerdown via QMP"),
                });
                return Ok(());
            }
        }

        match phase {
            Some(StopPhase::Term) => {
                self.reporter.report(Notification::Message {
                    severity: Severity::Warning,
                    text: format!("{name}: still up after SIGTERM, sending SIGKILL"),
                });
                handle.terminate(libc::SIGKILL)
            }
            _ => {
                self.stop_phases.insert(name.to_string(), StopPhase::Term);
                handle.terminate(libc::SIGTERM)
            }
        }
    }

    // --- event scheduling -----------------------------------------------------

    pub fn event_power_on(&mut self, name: &str) -> Result<ScheduleId> {
        let control_tx = self.control_tx.clone();
        let event_name = name.to_string();
        self.event_mut(name)?.power_on(move |schedule| {
            let _ = control_tx.send(ControlMsg::EventFired {
                event: event_name,
                schedule,
            });
        })
    }

    pub fn event_power_off(&mut self, name: &str) -> Result<()> {
        self.event_mut(name)?.power_off();
        Ok(())
    }

    pub fn event_toggle(&mut self, name: &str) -> Result<()> {
        let control_tx = self.control_tx.clone();
        let event_name = name.to_string();
        self.event_mut(name)?.toggle(move |schedule| {
            let _ = control_tx.send(ControlMsg::EventFired {
                event: event_name,
                schedule,
            });
        })
    }

    // --- host policy ----------------------------------------------------------

    /// Align the host KSM state with the configured preference. Failures of
    /// the underlying shell command surface only as notifications.
    pub fn apply_ksm_policy(&mut self) -> Result<()> {
        let control_tx = self.control_tx.clone();
        probe::enable_ksm(self.settings.ksm, self.settings.sudo.as_deref(), move |notice| {
            let _ = control_tx.send(ControlMsg::ShellExited(notice));
        })?;
        Ok(())
    }

    // --- control channel ------------------------------------------------------

    /// Drain every pending control message. Called from the control thread.
    pub fn process_pending(&mut self) {
        while let Ok(msg) = self.control_rx.try_recv() {
            self.handle_control(msg);
        }
    }

    /// Wait up to `timeout` for one control message and handle it.
    pub fn pump_one(&mut self, timeout: Duration) -> bool {
        match self.control_rx.recv_timeout(timeout) {
            Ok(msg) => {
                self.handle_control(msg);
                true
            }
            Err(_) => false,
        }
    }

    fn handle_control(&mut self, msg: ControlMsg) {
        match msg {
            ControlMsg::ProcessExited(notice) => {
                let brick = notice.label.clone();
                self.handles.retain(|(name, _)| name != &brick);
                self.stop_phases.remove(&brick);
                let requested = self.requested_stops.remove(&brick);
                if !notice.status.success() && !requested && !notice.stderr.is_empty() {
                    self.reporter.report(Notification::BrickOutput {
                        brick: brick.clone(),
                        stderr: notice.stderr.clone(),
                    });
                }
                self.reporter.report(Notification::BrickStopped {
                    brick,
                    status: notice.status,
                    requested,
                });
            }
            ControlMsg::ShellExited(notice) => {
                if !notice.status.success() {
                    self.reporter.report(Notification::ShellCommandFailed {
                        command: notice.label,
                        status: notice.status,
                    });
                }
            }
            ControlMsg::EventFired { event, schedule } => {
                let actions = match self.event_mut(&event) {
                    Ok(ev) => {
                        // Stale fires from cancelled schedules are dropped here.
                        if !ev.acknowledge_fire(schedule) {
                            return;
                        }
                        ev.actions().to_vec()
                    }
                    Err(_) => return,
                };
                self.reporter.report(Notification::EventTriggered {
                    event: event.clone(),
                });
                for action in actions {
                    if let Err(err) = self.run_command(&action) {
                        self.reporter.report(Notification::ActionFailed {
                            event: event.clone(),
                            action,
                            reason: err.to_string(),
                        });
                    }
                }
            }
        }
    }

    // --- command interpreter --------------------------------------------------

    /// Dispatch one console command line. Event action strings funnel
    /// through here when their timer fires.
    pub fn run_command(&mut self, line: &str) -> Result<()> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let unknown = || Error::UnknownCommand {
            line: line.to_string(),
        };

        match tokens.as_slice() {
            ["add", "event", name] => self.new_event(name),
            ["add", kind, name] => {
                let kind = BrickKind::parse(kind).ok_or_else(unknown)?;
                self.new_brick(kind, name)
            }
            ["del", name] => {
                if self.events.iter().any(|event| event.name() == *name) {
                    self.remove_event(name)
                } else {
                    self.remove_brick(name)
                }
            }
            ["rename", old, new] => self.rename_brick(old, new),
            ["on", name] => {
                if self.events.iter().any(|event| event.name() == *name) {
                    self.event_power_on(name).map(|_| ())
                } else {
                    self.poweron(name)
                }
            }
            ["off", name] => {
                if self.events.iter().any(|event| event.name() == *name) {
                    self.event_power_off(name)
                } else {
                    self.poweroff(name)
                }
            }
            ["toggle", name] => self.event_toggle(name),
            ["config", name, assignments @ ..] if !assignments.is_empty() => {
                for assignment in assignments {
                    let (key, raw) = assignment.split_once('=').ok_or_else(unknown)?;
                    self.configure_from_str(name, key, raw)?;
                }
                Ok(())
            }
            ["connect", name, plug, peer] => {
                let plug: usize = plug.parse().map_err(|_| unknown())?;
                self.connect(name, plug, peer)
            }
            ["disconnect", name, plug] => {
                let plug: usize = plug.parse().map_err(|_| unknown())?;
                self.disconnect(name, plug)
            }
            ["plug", name] => self.add_plug(name).map(|_| ()),
            ["delay", name, secs] => {
                let secs: u32 = secs.parse().map_err(|_| unknown())?;
                self.event_mut(name)?.set_delay(secs);
                Ok(())
            }
            ["action", name, rest @ ..] if !rest.is_empty() => {
                let action = rest.join(" ");
                self.event_mut(name)?.add_action(action);
                Ok(())
            }
            _ => Err(unknown()),
        }
    }

    // --- helpers --------------------------------------------------------------

    fn peer_sockets(&self, name: &str) -> Result<Vec<PathBuf>> {
        let brick = self.brick(name)?;
        let mut sockets = Vec::new();
        for plug in brick.plugs() {
            let Some(peer_name) = plug.peer.as_deref() else {
                continue;
            };
            let peer = self.brick(peer_name)?;
            let socket = peer
                .socket_path(&self.settings.workspace)
                .ok_or_else(|| Error::BadConfig {
                    brick: name.to_string(),
                    message: format!(
                        "plug `{}` is connected to `{peer_name}`, which exposes no socket",
                        plug.name
                    ),
                })?;
            sockets.push(socket);
        }
        Ok(sockets)
    }

    fn check_qemu_host(&mut self, name: &str) -> Result<()> {
        let brick = self.brick(name)?;
        let wants_kvm = brick.config().flag("kvm");
        let ram_bytes = brick.config().number("ram").unwrap_or(0).max(0) as u64 * 1024 * 1024;
        let hda = brick
            .config()
            .text("hda")
            .filter(|hda| !hda.is_empty())
            .map(PathBuf::from);

        if wants_kvm {
            let available = match &self.settings.qemupath {
                Some(path) => probe::check_kvm(path),
                None => {
                    Resolver::new(None, false).resolve("kvm").is_ok()
                        && probe::kvm_device_present()
                }
            };
            if !available {
                return Err(Error::KvmUnavailable {
                    brick: name.to_string(),
                });
            }
        }

        if let Some(diagnostic) = probe::check_memory(ram_bytes) {
            self.reporter.report(Notification::Message {
                severity: diagnostic.severity,
                text: diagnostic.message,
            });
        }

        // Best-effort overlay chain sanity check, without invoking qemu-img.
        if let Some(hda) = hda {
            if hda.is_file() {
                for backing in super::image::backing_files_for(vec![hda]) {
                    match backing {
                        Ok(path) if !path.is_empty() && !PathBuf::from(&path).is_file() => {
                            self.reporter.report(Notification::Message {
                                severity: Severity::Warning,
                                text: format!(
                                    "{name}: backing file {path} of the boot disk is missing"
                                ),
                            });
                        }
                        _ => {}
                    }
                }
            }
        }

        Ok(())
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name
            .chars()
            .any(|c| c.is_whitespace() || c == '=' || c == '/')
    {
        return Err(Error::BadConfig {
            brick: name.to_string(),
            message: "names must be non-empty and free of whitespace, `=` and `/`".into(),
        });
    }
    Ok(())
}

fn coerce_value(current: &ConfigValue, raw: &str) -> std::result::Result<ConfigValue, String> {
    match current {
        ConfigValue::Text(_) => Ok(ConfigValue::Text(raw.to_string())),
        ConfigValue::Number(_) => raw
            .parse::<i64>()
            .map(ConfigValue::Number)
            .map_err(|_| format!("`{raw}` is not a number")),
        ConfigValue::Flag(_) => match raw {
            "1" | "true" | "*" | "on" => Ok(ConfigValue::Flag(true)),
            "0" | "false" | "" | "off" => Ok(ConfigValue::Flag(false)),
            other => Err(format!("`{other}` is not a boolean flag")),
        },
    }
}

/// Minimal QMP client used for cooperative QEMU powerdown.
mod qmp {
    use std::io::{self, BufRead, BufReader, Write};
    #[cfg(unix)]
    use std::os::unix::net::UnixStream;
    use std::path::Path;
    use std::time::Duration;

    use serde_json::{Value, json};

    #[cfg(unix)]
    pub fn powerdown(socket: &Path) -> io::Result<()> {
        if !socket.exists() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no QMP socket"));
        }
        let mut stream = UnixStream::connect(socket)?;
        stream.set_read_timeout(Some(Duration::from_secs(2)))?;
        stream.set_write_timeout(Some(Duration::from_secs(2)))?;
        let mut reader = BufReader::new(stream.try_clone()?);

        let greeting = read_message(&mut reader)?;
        if greeting.get("QMP").is_none() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unexpected QMP greeting",
            ));
        }

        send_command(&mut stream, "qmp_capabilities")?;
        wait_for_ok(&mut reader)?;
        send_command(&mut stream, "system_powerdown")?;
        wait_for_ok(&mut reader)?;
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn powerdown(_socket: &Path) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "QMP powerdown requires unix sockets",
        ))
    }

    #[cfg(unix)]
    fn send_command(stream: &mut UnixStream, command: &str) -> io::Result<()> {
        let mut data = json!({ "execute": command }).to_string();
        data.push('\n');
        stream.write_all(data.as_bytes())
    }

    #[cfg(unix)]
    fn read_message(reader: &mut BufReader<UnixStream>) -> io::Result<Value> {
        let mut line = String::new();
        let bytes = reader.read_line(&mut line)?;
        if bytes == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "QMP connection closed",
            ));
        }
        serde_json::from_str(&line)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }

    #[cfg(unix)]
    fn wait_for_ok(reader: &mut BufReader<UnixStream>) -> io::Result<()> {
        loop {
            let message = read_message(reader)?;
            if message.get("return").is_some() {
                return Ok(());
            }
            if let Some(err) = message.get("error") {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("QMP error response: {err}"),
                ));
            }
            // Ignore asynchronous events.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::notify::RecordingReporter;

    fn factory() -> BrickFactory {
        BrickFactory::new(Settings::default(), Box::new(()))
    }

    #[test]
    fn brick_names_are_unique_across_bricks_and_events() {
        let mut factory = factory();
        factory.new_brick(BrickKind::Switch, "sw0").unwrap();
        assert!(matches!(
            factory.new_brick(BrickKind::Tap, "sw0"),
            Err(Error::DuplicateName { .. })
        ));
        assert!(matches!(
            factory.new_event("sw0"),
            Err(Error::DuplicateName { .. })
        ));
        factory.new_event("ev0").unwrap();
        assert!(matches!(
            factory.new_brick(BrickKind::Switch, "ev0"),
            Err(Error::DuplicateName { .. })
        ));
    }

    #[test]
    fn invalid_names_are_rejected() {
        let mut factory = factory();
        assert!(factory.new_brick(BrickKind::Switch, "").is_err());
        assert!(factory.new_brick(BrickKind::Switch, "has space").is_err());
        assert!(factory.new_brick(BrickKind::Switch, "a=b").is_err());
    }

    #[test]
    fn configure_validates_keys_and_types() {
        let mut factory = factory();
        factory.new_brick(BrickKind::Switch, "sw0").unwrap();

        factory
            .configure("sw0", "numports", ConfigValue::Number(64))
            .unwrap();
        assert!(matches!(
            factory.configure("sw0", "bogus", ConfigValue::Number(1)),
            Err(Error::BadConfig { .. })
        ));
        assert!(matches!(
            factory.configure("sw0", "numports", ConfigValue::Text("many".into())),
            Err(Error::BadConfig { .. })
        ));
    }

    #[test]
    fn configure_from_str_coerces_to_declared_types() {
        let mut factory = factory();
        factory.new_brick(BrickKind::Switch, "sw0").unwrap();

        factory.configure_from_str("sw0", "numports", "8").unwrap();
        factory.configure_from_str("sw0", "hub", "1").unwrap();
        let brick = factory.brick("sw0").unwrap();
        assert_eq!(brick.config().number("numports"), Some(8));
        assert!(brick.config().flag("hub"));

        assert!(matches!(
            factory.configure_from_str("sw0", "numports", "lots"),
            Err(Error::BadConfig { .. })
        ));
    }

    #[test]
    fn poweron_unknown_brick_fails() {
        let mut factory = factory();
        assert!(matches!(
            factory.poweron("ghost"),
            Err(Error::UnknownBrick { .. })
        ));
    }

    #[test]
    fn poweroff_when_not_running_is_a_noop() {
        let mut factory = factory();
        factory.new_brick(BrickKind::Switch, "sw0").unwrap();
        factory.poweroff("sw0").unwrap();
    }

    #[test]
    fn switch_wrapper_poweron_requires_the_socket() {
        let dir = tempfile::tempdir().unwrap();
        let mut factory = factory();
        factory.new_brick(BrickKind::SwitchWrapper, "ext0").unwrap();
        let missing = dir.path().join("vde.ctl");
        factory
            .configure(
                "ext0",
                "path",
                ConfigValue::Text(missing.display().to_string()),
            )
            .unwrap();
        assert!(matches!(
            factory.poweron("ext0"),
            Err(Error::SocketMissing { .. })
        ));

        std::fs::write(&missing, b"").unwrap();
        factory.poweron("ext0").unwrap();
        assert!(!factory.is_running("ext0"));
    }

    #[test]
    fn command_interpreter_builds_and_tears_down_the_graph() {
        let mut factory = factory();
        factory.run_command("add switch sw0").unwrap();
        factory.run_command("add qemu vm0").unwrap();
        factory.run_command("config sw0 numports=16 hub=1").unwrap();
        factory.run_command("plug vm0").unwrap();
        factory.run_command("connect vm0 0 sw0").unwrap();

        let sw0 = factory.brick("sw0").unwrap();
        assert_eq!(sw0.config().number("numports"), Some(16));
        let vm0 = factory.brick("vm0").unwrap();
        assert_eq!(vm0.plugs()[0].peer.as_deref(), Some("sw0"));

        factory.run_command("disconnect vm0 0").unwrap();
        factory.run_command("del vm0").unwrap();
        factory.run_command("del sw0").unwrap();
        assert!(factory.bricks().next().is_none());

        assert!(matches!(
            factory.run_command("frobnicate sw0"),
            Err(Error::UnknownCommand { .. })
        ));
    }

    #[test]
    fn event_commands_configure_and_schedule() {
        let mut factory = factory();
        factory.run_command("add event ev0").unwrap();
        assert!(matches!(
            factory.run_command("toggle ev0"),
            Err(Error::EventNotConfigured { .. })
        ));

        factory.run_command("action ev0 add switch sw1").unwrap();
        factory.run_command("delay ev0 120").unwrap();
        factory.run_command("on ev0").unwrap();
        let first = factory
            .events()
            .next()
            .and_then(|event| event.schedule_id())
            .unwrap();
        // Idempotent: a second poweron keeps the schedule.
        factory.event_power_on("ev0").unwrap();
        assert_eq!(
            factory.events().next().and_then(|e| e.schedule_id()),
            Some(first)
        );
        factory.run_command("off ev0").unwrap();
        assert!(factory.events().next().unwrap().schedule_id().is_none());
    }

    #[test]
    fn stale_event_fire_is_dropped_by_the_pump() {
        let mut factory = factory();
        factory.new_event("ev0").unwrap();
        factory.event_mut("ev0").unwrap().add_action("add switch sw9");
        factory.event_mut("ev0").unwrap().set_delay(600);

        let stale = factory.event_power_on("ev0").unwrap();
        factory.event_power_off("ev0").unwrap();
        factory.event_power_on("ev0").unwrap();

        factory.handle_control(ControlMsg::EventFired {
            event: "ev0".into(),
            schedule: stale,
        });
        assert!(factory.brick("sw9").is_err());
    }

    #[test]
    fn fired_event_dispatches_actions_in_order() {
        let mut factory =
            BrickFactory::new(Settings::default(), Box::new(RecordingReporter::default()));
        factory.new_event("ev0").unwrap();
        factory.event_mut("ev0").unwrap().add_action("add switch sw1");
        factory.event_mut("ev0").unwrap().add_action("config sw1 numports=4");
        factory.event_mut("ev0").unwrap().add_action("definitely bogus");
        factory.event_mut("ev0").unwrap().set_delay(600);

        let schedule = factory.event_power_on("ev0").unwrap();
        factory.handle_control(ControlMsg::EventFired {
            event: "ev0".into(),
            schedule,
        });

        let brick = factory.brick("sw1").unwrap();
        assert_eq!(brick.config().number("numports"), Some(4));
        // Event returned to off after the one-shot fire.
        assert!(factory.events().next().unwrap().schedule_id().is_none());
    }
}
