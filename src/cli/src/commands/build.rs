//! `smith build` command — Build an image from a build specification.
//!
//! Reads the YAML spec, stages and assembles the image, and writes the
//! OCI tar.gz to the given output path.

use std::path::PathBuf;

use clap::Args;

use smith_builder::build::{build_image, BuildOptions};
use smith_core::ImageSpec;

#[derive(Args)]
pub struct BuildArgs {
    /// Output image file (tar.gz)
    pub output: String,

    /// Path to the build specification
    #[arg(short = 'c', long = "conf", default_value = "smith.yaml")]
    pub conf: String,

    /// Build context directory (spec paths resolve against it)
    #[arg(short = 'd', long = "dir")]
    pub dir: Option<String>,

    /// Reuse the unpack cache from a previous build
    #[arg(long)]
    pub fast: bool,

    /// Build number recorded in the image annotations
    #[arg(long = "build-no")]
    pub build_no: Option<String>,

    /// Emit Docker media types instead of OCI ones
    #[arg(long)]
    pub docker: bool,
}

pub fn execute(args: BuildArgs) -> Result<(), Box<dyn std::error::Error>> {
    let context_dir = match &args.dir {
        Some(dir) => PathBuf::from(dir),
        None => std::env::current_dir()?,
    };
    let context_dir = context_dir
        .canonicalize()
        .map_err(|e| format!("invalid build context '{}': {}", context_dir.display(), e))?;

    let conf = {
        let p = PathBuf::from(&args.conf);
        if p.is_absolute() {
            p
        } else {
            context_dir.join(p)
        }
    };
    let mut spec = ImageSpec::from_file(&conf)?;

    // resolve the output before any directory changes hands
    let output = PathBuf::from(&args.output);
    let output = if output.is_absolute() {
        output
    } else {
        std::env::current_dir()?.join(output)
    };

    let opts = BuildOptions {
        context_dir,
        fast: args.fast,
        build_no: args.build_no.unwrap_or_default(),
        docker: args.docker,
    };
    build_image(&mut spec, &output, &opts)?;
    println!("{}", output.display());
    Ok(())
}
