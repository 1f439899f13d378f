//! Core Brickyard library API surface.

pub mod diagnostics;
pub mod notify;

pub mod brick;
pub mod events;
pub mod factory;
pub mod image;
pub mod probe;
pub mod resolver;
pub mod supervisor;

pub use brick::{Brick, BrickKind, CommandContext, Plug};
pub use diagnostics::{Diagnostic, Severity};
pub use events::{Event, EventState, ScheduleId};
pub use factory::{BrickFactory, ControlMsg};
pub use notify::{ExitSummary, Notification, RecordingReporter, Reporter};
pub use resolver::Resolver;
pub use supervisor::{ExitNotice, ProcessHandle, SpawnRequest};
