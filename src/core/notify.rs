use super::diagnostics::Severity;

/// Final status of an external process, as observed by the reaper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitSummary {
    /// Process exited on its own with the given code.
    Code(i32),
    /// Process was terminated by the given signal.
    Signal(i32),
    /// The platform reported neither a code nor a signal.
    Unknown,
}

impl ExitSummary {
    pub fn success(&self) -> bool {
        matches!(self, ExitSummary::Code(0))
    }
}

/// Structured notification emitted while the factory runs.
///
/// Observers (CLI console, tests, a GUI shell) receive these through a
/// [`Reporter`]; the factory never writes to a global logger.
#[derive(Debug, Clone)]
pub enum Notification {
    /// A textual progress update with a severity level.
    Message { severity: Severity, text: String },
    /// A brick's external process was spawned.
    BrickStarted { brick: String, pid: u32 },
    /// A brick's external process exited and its handle was retired.
    BrickStopped {
        brick: String,
        status: ExitSummary,
        /// True when the factory itself requested the termination.
        requested: bool,
    },
    /// Stderr captured from a brick process that exited with a failure.
    BrickOutput { brick: String, stderr: String },
    /// A scheduled event fired and its actions are about to run.
    EventTriggered { event: String },
    /// One action string of an event could not be dispatched.
    ActionFailed {
        event: String,
        action: String,
        reason: String,
    },
    /// A fire-and-forget host command (e.g. the KSM toggle) exited nonzero.
    ShellCommandFailed { command: String, status: ExitSummary },
}

/// Trait implemented by callers that wish to observe factory notifications.
pub trait Reporter {
    fn report(&mut self, notification: Notification);
}

impl Reporter for () {
    fn report(&mut self, _notification: Notification) {}
}

/// Reporter that buffers notifications, useful for tests and batch callers.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    pub notifications: Vec<Notification>,
}

impl Reporter for RecordingReporter {
    fn report(&mut self, notification: Notification) {
        self.notifications.push(notification);
    }
}
