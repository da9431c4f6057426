//! `smith unpack` command — Materialize an image's rootfs on disk.

use std::path::PathBuf;

use clap::Args;

use smith_builder::unpack::{extract_oci, image_from_file};

#[derive(Args)]
pub struct UnpackArgs {
    /// Image file, optionally suffixed `:tag`
    pub image: String,

    /// Directory to unpack into
    pub output: PathBuf,
}

pub fn execute(args: UnpackArgs) -> Result<(), Box<dyn std::error::Error>> {
    let image = image_from_file(&args.image)?;
    std::fs::create_dir_all(&args.output)?;
    extract_oci(&image, &args.output)?;
    println!("{}", args.output.display());
    Ok(())
}
