use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use crate::error::{Error, Result};

/// Identity of one armed timer. A new schedule gets a fresh id, so stale
/// fire messages from a cancelled timer can be told apart at dispatch time.
pub type ScheduleId = u64;

static NEXT_SCHEDULE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventState {
    Unconfigured,
    Off,
    Running,
}

impl EventState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventState::Unconfigured => "unconfigured",
            EventState::Off => "off",
            EventState::Running => "running",
        }
    }
}

/// Configuration of a scheduled event: an ordered list of command strings and
/// a delay in seconds.
#[derive(Debug, Clone, Default)]
pub struct EventConfig {
    pub actions: Vec<String>,
    pub delay: u32,
}

#[derive(Debug)]
struct Schedule {
    id: ScheduleId,
    // Dropping the sender wakes the timer thread, which then exits without
    // firing.
    _cancel: mpsc::Sender<()>,
}

/// A delay-driven trigger owned by the factory.
///
/// Action strings are opaque until the timer fires; they are dispatched in
/// order to the factory's command interpreter, which reports malformed ones
/// at execution time.
#[derive(Debug)]
pub struct Event {
    name: String,
    config: EventConfig,
    scheduled: Option<Schedule>,
}

impl Event {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: EventConfig::default(),
            scheduled: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn actions(&self) -> &[String] {
        &self.config.actions
    }

    pub fn delay(&self) -> u32 {
        self.config.delay
    }

    pub fn set_actions(&mut self, actions: Vec<String>) {
        self.config.actions = actions;
    }

    pub fn add_action(&mut self, action: impl Into<String>) {
        self.config.actions.push(action.into());
    }

    pub fn set_delay(&mut self, delay: u32) {
        self.config.delay = delay;
    }

    /// True iff the event has at least one action and a positive delay.
    pub fn configured(&self) -> bool {
        !self.config.actions.is_empty() && self.config.delay > 0
    }

    pub fn state(&self) -> EventState {
        if self.scheduled.is_some() {
            EventState::Running
        } else if self.configured() {
            EventState::Off
        } else {
            EventState::Unconfigured
        }
    }

    pub fn schedule_id(&self) -> Option<ScheduleId> {
        self.scheduled.as_ref().map(|schedule| schedule.id)
    }

    /// Flip between `off` and `running`. Fails on an unconfigured event and
    /// leaves its state untouched.
    pub fn toggle<F>(&mut self, on_fire: F) -> Result<()>
    where
        F: FnOnce(ScheduleId) + Send + 'static,
    {
        if !self.configured() {
            return Err(Error::EventNotConfigured {
                event: self.name.clone(),
            });
        }
        if self.scheduled.is_some() {
            self.power_off();
        } else {
            self.power_on(on_fire)?;
        }
        Ok(())
    }

    /// Arm the one-shot timer. Idempotent: when already scheduled the
    /// existing handle is returned unchanged and no new timer starts.
    ///
    /// `on_fire` runs on the timer thread with the schedule id; callers
    /// forward it to their control channel and must confirm the id against
    /// [`Event::acknowledge_fire`] before dispatching actions.
    pub fn power_on<F>(&mut self, on_fire: F) -> Result<ScheduleId>
    where
        F: FnOnce(ScheduleId) + Send + 'static,
    {
        if !self.configured() {
            return Err(Error::EventNotConfigured {
                event: self.name.clone(),
            });
        }
        if let Some(schedule) = &self.scheduled {
            return Ok(schedule.id);
        }

        let id = NEXT_SCHEDULE_ID.fetch_add(1, Ordering::Relaxed);
        let delay = Duration::from_secs(u64::from(self.config.delay));
        let (cancel_tx, cancel_rx) = mpsc::channel::<()>();
        thread::spawn(move || match cancel_rx.recv_timeout(delay) {
            Err(RecvTimeoutError::Timeout) => on_fire(id),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
        });

        self.scheduled = Some(Schedule {
            id,
            _cancel: cancel_tx,
        });
        Ok(id)
    }

    /// Cancel any pending timer. Safe to call when already off.
    pub fn power_off(&mut self) {
        self.scheduled = None;
    }

    /// Confirm a fire message against the current schedule.
    ///
    /// Returns true and transitions to `off` when `id` is still the live
    /// schedule; returns false for stale messages from cancelled timers,
    /// which the caller must drop without dispatching actions.
    pub fn acknowledge_fire(&mut self, id: ScheduleId) -> bool {
        match &self.scheduled {
            Some(schedule) if schedule.id == id => {
                self.scheduled = None;
                true
            }
            _ => false,
        }
    }

    /// Human-readable parameter summary used by display surfaces.
    pub fn get_parameters(&self) -> String {
        let actions = self
            .config
            .actions
            .iter()
            .map(|action| format!("\"{action}\""))
            .collect::<Vec<_>>()
            .join(", ");
        format!("Delay: {}; Actions: {}", self.config.delay, actions)
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        self.power_off();
    }
}
