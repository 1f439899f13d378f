use std::path::PathBuf;
use std::process::ExitCode;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Brick `{brick}` is not properly configured: {message}")]
    BadConfig { brick: String, message: String },
    #[error("Event `{event}` has no actions or a zero delay and cannot be scheduled.")]
    EventNotConfigured { event: String },
    #[error("No brick or event named `{name}` exists in this factory.")]
    UnknownBrick { name: String },
    #[error("A brick or event named `{name}` already exists in this factory.")]
    DuplicateName { name: String },
    #[error(
        "Plug `{plug}` of brick `{brick}` is attached to a running process. \
         Power the brick off before rewiring it."
    )]
    LinkInUse { brick: String, plug: String },
    #[error("Brick `{brick}` is running; stop it before renaming or removing it.")]
    BrickRunning { brick: String },
    #[error("Executable `{name}` could not be located.")]
    BinaryNotFound { name: String },
    #[error("KVM acceleration requested for `{brick}` but the host has no usable KVM device.")]
    KvmUnavailable { brick: String },
    #[error("Socket `{path}` for brick `{brick}` does not exist.")]
    SocketMissing { brick: String, path: PathBuf },
    #[error("Failed to spawn `{executable}` for `{brick}`: {source}")]
    Spawn {
        brick: String,
        executable: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to signal pid {pid} of `{brick}`: {source}")]
    SignalFailed {
        brick: String,
        pid: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("`{path}` does not start with a recognized COW or QCOW header.")]
    UnknownImageFormat { path: PathBuf },
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to read settings file at {path}: {source}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Settings file at {path} could not be parsed: {source}")]
    ParseConfig {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Failed to write settings file at {path}: {source}")]
    WriteConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Unrecognized console command: {line}")]
    UnknownCommand { line: String },
}

impl Error {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::BadConfig { .. } => ExitCode::from(65),
            Self::EventNotConfigured { .. } => ExitCode::from(65),
            Self::UnknownBrick { .. } => ExitCode::from(65),
            Self::DuplicateName { .. } => ExitCode::from(65),
            Self::LinkInUse { .. } => ExitCode::from(65),
            Self::BrickRunning { .. } => ExitCode::from(65),
            Self::BinaryNotFound { .. } => ExitCode::from(69),
            Self::KvmUnavailable { .. } => ExitCode::from(69),
            Self::SocketMissing { .. } => ExitCode::from(69),
            Self::Spawn { .. } => ExitCode::from(71),
            Self::SignalFailed { .. } => ExitCode::from(71),
            Self::UnknownImageFormat { .. } => ExitCode::from(65),
            Self::Io { .. } => ExitCode::from(74),
            Self::ReadConfig { .. } => ExitCode::from(74),
            Self::ParseConfig { .. } => ExitCode::from(65),
            Self::WriteConfig { .. } => ExitCode::from(74),
            Self::UnknownCommand { .. } => ExitCode::from(64),
        }
    }
}
