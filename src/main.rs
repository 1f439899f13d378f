use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use clap::{CommandFactory, Parser, error::ErrorKind};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use brickyard::cli::{BackingArgs, CheckArgs, Cli, Commands, ConsoleArgs};
use brickyard::core::{BrickFactory, Notification, Reporter, Severity, image, probe};
use brickyard::{Error, Result, Settings, user_home_dir};

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(64),
            };
        }
    };

    let Cli { config, command } = cli;

    let command = match command {
        Some(cmd) => cmd,
        None => {
            let mut command = Cli::command();
            let _ = command.print_help();
            println!();
            return ExitCode::from(64);
        }
    };

    let exit = match command {
        Commands::Console(args) => handle_console(args, config.as_deref()),
        Commands::Check(args) => handle_check(args, config.as_deref()),
        Commands::Backing(args) => handle_backing(args),
    };

    match exit {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err}");
            err.exit_code()
        }
    }
}

/// Reporter that prints factory notifications to stderr with timestamps.
struct ConsoleReporter;

impl ConsoleReporter {
    fn stamp() -> String {
        OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| "-".to_string())
    }
}

impl Reporter for ConsoleReporter {
    fn report(&mut self, notification: Notification) {
        let stamp = Self::stamp();
        match notification {
            Notification::Message { severity, text } => {
                let tag = match severity {
                    Severity::Info => "info",
                    Severity::Warning => "warning",
                    Severity::Error => "error",
                };
                eprintln!("[{stamp}] {tag}: {text}");
            }
            Notification::BrickStarted { brick, pid } => {
                eprintln!("[{stamp}] {brick}: started (pid {pid})");
            }
            Notification::BrickStopped {
                brick,
                status,
                requested,
            } => {
                let how = if requested { "stopped" } else { "exited" };
                eprintln!("[{stamp}] {brick}: {how} ({status:?})");
            }
            Notification::BrickOutput { brick, stderr } => {
                for line in stderr.lines() {
                    eprintln!("[{stamp}] {brick}! {line}");
                }
            }
            Notification::EventTriggered { event } => {
                eprintln!("[{stamp}] {event}: triggered");
            }
            Notification::ActionFailed {
                event,
                action,
                reason,
            } => {
                eprintln!("[{stamp}] {event}: action `{action}` failed: {reason}");
            }
            Notification::ShellCommandFailed { command, status } => {
                eprintln!("[{stamp}] host command `{command}` failed ({status:?})");
            }
        }
    }
}

fn load_settings(config_override: Option<&Path>) -> Result<Settings> {
    if let Some(path) = config_override {
        return Settings::load(path);
    }
    let default = user_home_dir()
        .map(|home| home.join(".brickyard").join("brickyard.toml"));
    match default {
        Some(path) if path.is_file() => Settings::load(&path),
        _ => Ok(Settings::default()),
    }
}

fn handle_console(args: ConsoleArgs, config_override: Option<&Path>) -> Result<ExitCode> {
    let settings = load_settings(config_override)?;
    for warning in &settings.warnings {
        eprintln!("Warning: {warning}");
    }

    let mut factory = BrickFactory::new(settings, Box::new(ConsoleReporter));
    factory.apply_ksm_policy()?;

    for command in &args.exec {
        if let Err(err) = factory.run_command(command) {
            eprintln!("Error: {err}");
        }
    }

    if args.batch {
        factory.process_pending();
        return Ok(ExitCode::SUCCESS);
    }

    // Stdin is read on its own thread so the control loop can keep pumping
    // exit notices and event fires while the console sits idle.
    let (line_tx, line_rx) = mpsc::channel::<String>();
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if line_tx.send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    loop {
        match line_rx.try_recv() {
            Ok(line) => {
                let line = line.trim();
                match line {
                    "" => {}
                    "quit" | "exit" => break,
                    "list" => {
                        for brick in factory.bricks() {
                            let state = if factory.is_running(brick.name()) {
                                "on"
                            } else {
                                "off"
                            };
                            println!("{} [{}] {}", brick.name(), brick.kind().as_str(), state);
                        }
                        for event in factory.events() {
                            println!(
                                "{} [event] {} ({})",
                                event.name(),
                                event.state().as_str(),
                                event.get_parameters()
                            );
                        }
                    }
                    command => {
                        if let Err(err) = factory.run_command(command) {
                            eprintln!("Error: {err}");
                        }
                    }
                }
            }
            Err(mpsc::TryRecvError::Empty) => {
                factory.pump_one(Duration::from_millis(100));
            }
            Err(mpsc::TryRecvError::Disconnected) => break,
        }
    }

    factory.process_pending();
    Ok(ExitCode::SUCCESS)
}

fn handle_check(args: CheckArgs, config_override: Option<&Path>) -> Result<ExitCode> {
    let settings = load_settings(config_override)?;
    for warning in &settings.warnings {
        eprintln!("Warning: {warning}");
    }
    let mut degraded = false;

    match &settings.vdepath {
        Some(path) => {
            let missing = probe::check_missing_vde(path);
            if missing.is_empty() {
                println!("vde tools: all present in {}", path.display());
            } else {
                degraded = true;
                println!("vde tools: missing from {}: {}", path.display(), missing.join(", "));
            }
        }
        None => println!("vde tools: no vdepath configured, relying on PATH"),
    }

    match &settings.qemupath {
        Some(path) => {
            let missing = probe::check_missing_qemu(path);
            if missing.is_empty() {
                println!("qemu tools: all present in {}", path.display());
            } else {
                degraded = true;
                println!(
                    "qemu tools: missing from {}: {}",
                    path.display(),
                    missing.join(", ")
                );
            }
            if probe::check_kvm(path) {
                println!("kvm: available");
            } else {
                degraded = true;
                println!("kvm: unavailable");
            }
        }
        None => {
            println!("qemu tools: no qemupath configured, relying on PATH");
            if probe::kvm_device_present() {
                println!("kvm: device present");
            } else {
                degraded = true;
                println!("kvm: device missing");
            }
        }
    }

    println!("ksm: {}", if probe::check_ksm() { "enabled" } else { "disabled" });

    if let Some(diagnostic) = probe::check_memory(0) {
        println!("memory: {}", diagnostic.message);
    } else {
        println!("memory: ok");
    }

    if args.strict && degraded {
        return Ok(ExitCode::from(69));
    }
    Ok(ExitCode::SUCCESS)
}

fn handle_backing(args: BackingArgs) -> Result<ExitCode> {
    for path in &args.images {
        let mut current = path.clone();
        loop {
            let size = std::fs::metadata(&current)
                .map(|meta| image::fmtsize(meta.len()))
                .unwrap_or_else(|_| "?".to_string());
            let backing = match image::backing_file_of(&current) {
                Ok(backing) => backing,
                Err(Error::UnknownImageFormat { .. }) => {
                    println!("{} ({size}): not a COW/QCOW image", current.display());
                    break;
                }
                Err(err) => return Err(err),
            };
            if backing.is_empty() {
                println!("{} ({size}): no backing file", current.display());
                break;
            }
            println!("{} ({size}) -> {backing}", current.display());
            if !args.chain {
                break;
            }
            current = PathBuf::from(backing);
        }
    }
    Ok(ExitCode::SUCCESS)
}
