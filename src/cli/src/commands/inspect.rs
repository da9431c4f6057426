//! `smith inspect` command — Show an image's config and layers.

use clap::Args;

use smith_builder::unpack::image_from_file;

#[derive(Args)]
pub struct InspectArgs {
    /// Image file, optionally suffixed `:tag`
    pub image: String,
}

pub fn execute(args: InspectArgs) -> Result<(), Box<dyn std::error::Error>> {
    let image = image_from_file(&args.image)?;

    println!("{}", serde_json::to_string_pretty(&image.config)?);
    for layer in &image.layers {
        println!(
            "layer {} diff-id {} ({} bytes)",
            layer.desc.digest, layer.diff_id, layer.desc.size
        );
    }
    for blob in &image.additional_blobs {
        println!("blob {} ({} bytes)", blob.media_type, blob.content.len());
    }
    Ok(())
}
