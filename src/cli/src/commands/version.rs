//! `smith version` command.

use clap::Args;

#[derive(Args)]
pub struct VersionArgs;

pub fn execute(_args: VersionArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!("smith version {} ({})", smith_core::VERSION, smith_core::SHA);
    Ok(())
}
