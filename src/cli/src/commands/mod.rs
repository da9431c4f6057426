//! CLI command definitions and dispatch.

mod build;
mod inspect;
mod unpack;
mod version;

use clap::{Parser, Subcommand};

/// Smith — build microcontainers from packages or OCI images.
#[derive(Parser)]
#[command(name = "smith", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Build an image from a build specification
    Build(build::BuildArgs),
    /// Unpack an image's rootfs into a directory
    Unpack(unpack::UnpackArgs),
    /// Print an image's config and layer digests
    Inspect(inspect::InspectArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Build(args) => build::execute(args),
        Command::Unpack(args) => unpack::execute(args),
        Command::Inspect(args) => inspect::execute(args),
        Command::Version(args) => version::execute(args),
    }
}
