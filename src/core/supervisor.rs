use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use crate::error::{Error, Result};

use super::notify::ExitSummary;

/// How long the reaper waits for the output readers after the child exits.
/// A grandchild that inherited the pipes keeps them open past this point;
/// the notice must not wait for it.
const PIPE_DRAIN_GRACE: Duration = Duration::from_millis(250);

/// What to do with a spawned process's stdout/stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Fire-and-forget: output goes to the void.
    Discard,
    /// Capture both streams and hand them to the exit callback.
    Capture,
}

/// Parameters for spawning one external process.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Label used in errors and notices; the brick name for brick processes,
    /// the command line for diagnostic shell commands.
    pub label: String,
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
    pub output: OutputMode,
}

impl SpawnRequest {
    pub fn new(label: impl Into<String>, executable: PathBuf) -> Self {
        Self {
            label: label.into(),
            executable,
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
            output: OutputMode::Discard,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn capture_output(mut self) -> Self {
        self.output = OutputMode::Capture;
        self
    }
}

/// Exactly-once exit notice for a spawned process, delivered after all
/// buffered output has been read.
#[derive(Debug, Clone)]
pub struct ExitNotice {
    pub label: String,
    pub pid: u32,
    pub status: ExitSummary,
    pub stdout: String,
    pub stderr: String,
}

/// Handle to one live external process bound to a brick.
///
/// The handle never owns the `Child` directly; the reaper thread does. It
/// only carries what termination and liveness checks need.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    label: String,
    pid: u32,
    exited: Arc<AtomicBool>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Send `signal` to the process without waiting for it to exit.
    ///
    /// Signalling an already-exited process is a no-op, including the ESRCH
    /// race where the reaper has not yet observed the exit.
    pub fn terminate(&self, signal: i32) -> Result<()> {
        if self.has_exited() {
            return Ok(());
        }
        let res = unsafe { libc::kill(self.pid as libc::pid_t, signal) };
        if res == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        Err(Error::SignalFailed {
            brick: self.label.clone(),
            pid: self.pid,
            source: err,
        })
    }
}

/// Spawn an external process and deliver its exit notice asynchronously.
///
/// `on_exit` runs on the reaper thread, exactly once, after the process has
/// exited and (in capture mode) both streams have reached EOF. Callers that
/// need the notice on their own control thread should forward it over a
/// channel from the callback.
pub fn spawn<F>(request: SpawnRequest, on_exit: F) -> Result<ProcessHandle>
where
    F: FnOnce(ExitNotice) + Send + 'static,
{
    let mut command = Command::new(&request.executable);
    command.args(&request.args);
    for (key, value) in &request.env {
        command.env(key, value);
    }
    if let Some(dir) = &request.working_dir {
        command.current_dir(dir);
    }
    command.stdin(Stdio::null());
    match request.output {
        OutputMode::Discard => {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }
        OutputMode::Capture => {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
    }

    let mut child = command.spawn().map_err(|source| Error::Spawn {
        brick: request.label.clone(),
        executable: request.executable.clone(),
        source,
    })?;

    let pid = child.id();
    let exited = Arc::new(AtomicBool::new(false));
    let handle = ProcessHandle {
        label: request.label.clone(),
        pid,
        exited: Arc::clone(&exited),
    };

    let label = request.label;
    let output_mode = request.output;
    thread::spawn(move || {
        // The notice is gated on the child's own exit, never on pipe EOF: a
        // grandchild that inherited the pipes must not delay or withhold it.
        let (done_tx, done_rx) = mpsc::channel();
        let (stdout_buf, stderr_buf) = match output_mode {
            OutputMode::Capture => (
                drain_stream(child.stdout.take(), done_tx.clone()),
                drain_stream(child.stderr.take(), done_tx),
            ),
            OutputMode::Discard => {
                drop(done_tx);
                (Arc::default(), Arc::default())
            }
        };

        let status = match child.wait() {
            Ok(status) => summarize(status),
            Err(_) => ExitSummary::Unknown,
        };

        if output_mode == OutputMode::Capture {
            for _ in 0..2 {
                if done_rx.recv_timeout(PIPE_DRAIN_GRACE).is_err() {
                    break;
                }
            }
        }

        exited.store(true, Ordering::SeqCst);
        on_exit(ExitNotice {
            label,
            pid,
            status,
            stdout: take_captured(&stdout_buf),
            stderr: take_captured(&stderr_buf),
        });
    });

    Ok(handle)
}

/// Copy a child stream into a shared buffer on its own thread, signalling
/// `done_tx` at EOF. The thread outlives the reaper when a grandchild keeps
/// the pipe open; late appends land after the notice and are dropped with
/// the buffer.
fn drain_stream<R>(stream: Option<R>, done_tx: mpsc::Sender<()>) -> Arc<Mutex<Vec<u8>>>
where
    R: Read + Send + 'static,
{
    let buffer: Arc<Mutex<Vec<u8>>> = Arc::default();
    let Some(mut stream) = stream else {
        let _ = done_tx.send(());
        return buffer;
    };
    let sink = Arc::clone(&buffer);
    thread::spawn(move || {
        let mut chunk = [0u8; 4096];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(count) => {
                    if let Ok(mut data) = sink.lock() {
                        data.extend_from_slice(&chunk[..count]);
                    }
                }
            }
        }
        let _ = done_tx.send(());
    });
    buffer
}

fn take_captured(buffer: &Arc<Mutex<Vec<u8>>>) -> String {
    buffer
        .lock()
        .map(|data| String::from_utf8_lossy(&data).into_owned())
        .unwrap_or_default()
}

/// Run a shell command fire-and-forget, optionally through an elevation
/// helper, reporting only the exit status through `on_exit`.
///
/// Used for host diagnostic toggles such as KSM where the caller does not
/// consume a return value.
pub fn run_shell<F>(command_line: &str, sudo: Option<&str>, on_exit: F) -> Result<()>
where
    F: FnOnce(ExitNotice) + Send + 'static,
{
    let request = match sudo {
        Some(helper) => SpawnRequest::new(command_line, PathBuf::from(helper))
            .args(["--", "su", "-c", command_line]),
        None => {
            let shell =
                std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
            SpawnRequest::new(command_line, PathBuf::from(shell)).args(["-c", command_line])
        }
    };
    spawn(request, on_exit)?;
    Ok(())
}

fn summarize(status: ExitStatus) -> ExitSummary {
    if let Some(code) = status.code() {
        return ExitSummary::Code(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ExitSummary::Signal(signal);
        }
    }
    ExitSummary::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn sh(label: &str, script: &str) -> SpawnRequest {
        SpawnRequest::new(label, PathBuf::from("/bin/sh")).args(["-c", script])
    }

    #[test]
    fn capture_mode_delivers_output_and_code_once() {
        let (tx, rx) = mpsc::channel();
        let request = sh("probe", "echo out; echo err >&2; exit 3").capture_output();
        let handle = spawn(request, move |notice| {
            tx.send(notice).unwrap();
        })
        .unwrap();

        let notice = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(notice.label, "probe");
        assert_eq!(notice.pid, handle.pid());
        assert_eq!(notice.status, ExitSummary::Code(3));
        assert_eq!(notice.stdout, "out\n");
        assert_eq!(notice.stderr, "err\n");
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn exit_notice_is_not_withheld_by_pipe_holding_grandchildren() {
        let (tx, rx) = mpsc::channel();
        let request = sh("nested", "echo partial >&2; sleep 30 & exit 5").capture_output();
        spawn(request, move |notice| {
            tx.send(notice).unwrap();
        })
        .unwrap();

        // The backgrounded sleep inherits the pipes; the notice must arrive
        // on the shell's exit regardless.
        let notice = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(notice.status, ExitSummary::Code(5));
        assert!(notice.stderr.contains("partial"));
    }

    #[test]
    fn terminate_after_exit_is_a_noop() {
        let (tx, rx) = mpsc::channel();
        let handle = spawn(sh("short", "exit 0"), move |notice| {
            tx.send(notice).unwrap();
        })
        .unwrap();

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.terminate(libc::SIGTERM).unwrap();
        handle.terminate(libc::SIGTERM).unwrap();
    }

    #[test]
    fn terminate_stops_a_long_running_process() {
        let (tx, rx) = mpsc::channel();
        let handle = spawn(sh("sleeper", "sleep 30"), move |notice| {
            tx.send(notice).unwrap();
        })
        .unwrap();

        assert!(!handle.has_exited());
        handle.terminate(libc::SIGTERM).unwrap();
        let notice = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(notice.status, ExitSummary::Signal(libc::SIGTERM));
        assert!(handle.has_exited());
    }

    #[test]
    fn missing_executable_is_a_spawn_error() {
        let request = SpawnRequest::new("ghost", PathBuf::from("/nonexistent/vde_switch"));
        match spawn(request, |_notice| {}) {
            Err(Error::Spawn { brick, .. }) => assert_eq!(brick, "ghost"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn run_shell_reports_nonzero_exit() {
        let (tx, rx) = mpsc::channel();
        run_shell("exit 7", None, move |notice| {
            tx.send(notice).unwrap();
        })
        .unwrap();

        let notice = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(notice.status, ExitSummary::Code(7));
        assert_eq!(notice.label, "exit 7");
    }
}
