use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

const VERSION: &str = env!("BRICKYARD_VERSION");

/// Top-level CLI definition for the `brickyard` tool.
#[derive(Debug, Parser)]
#[command(
    name = "brickyard",
    version = VERSION,
    about = "Supervise VDE/QEMU virtual network bricks from the command line.",
    long_about = "Brickyard wires VDE switches, taps, wires and QEMU machines into a \n\
                  supervised process graph. Bricks are created, configured and powered \n\
                  through a small console command language; scheduled events replay the \n\
                  same commands after a delay."
)]
pub struct Cli {
    /// Path to an explicit settings file. Defaults to `~/.brickyard/brickyard.toml`.
    #[arg(
        global = true,
        short,
        long = "config",
        value_name = "PATH",
        help = "Load settings from PATH instead of the default location"
    )]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the interactive brick console on stdin.
    Console(ConsoleArgs),
    /// Probe the host: tool sets, KVM device, KSM state, memory headroom.
    Check(CheckArgs),
    /// Print the backing-file chain of COW/QCOW disk images.
    Backing(BackingArgs),
}

#[derive(Debug, Args, Default)]
pub struct ConsoleArgs {
    /// Commands to run before reading stdin (may be given multiple times).
    #[arg(
        short = 'e',
        long = "exec",
        value_name = "COMMAND",
        help = "Run COMMAND before entering the interactive loop"
    )]
    pub exec: Vec<String>,

    /// Exit after running --exec commands instead of reading stdin.
    #[arg(long, help = "Run the --exec commands, drain notifications, and exit")]
    pub batch: bool,
}

#[derive(Debug, Args, Default)]
pub struct CheckArgs {
    /// Exit nonzero when any probe reports a missing capability.
    #[arg(long, help = "Treat missing tools or capabilities as a failure")]
    pub strict: bool,
}

#[derive(Debug, Args)]
pub struct BackingArgs {
    /// Disk images to inspect, innermost overlay first.
    #[arg(value_name = "IMAGE", required = true)]
    pub images: Vec<PathBuf>,

    /// Follow the chain through every ancestor instead of one level.
    #[arg(long, help = "Recurse through the whole backing chain")]
    pub chain: bool,
}
