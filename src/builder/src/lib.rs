//! Image-assembly engine for smith.
//!
//! Smith builds minimal OCI images: given a source root filesystem (an
//! unpacked parent image) and a list of executables to keep, it copies
//! those executables plus every shared library they transitively need,
//! and packages the result as a content-addressed OCI tar.gz.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         build driver                          │
//! │                                                               │
//! │  unpack ──▶ ldcache ──▶ copy ──▶ nss ──▶ pack                 │
//! │               │           │                                   │
//! │               │           ├──▶ symlink  (mirror link chains)  │
//! │               │           └──▶ deps ──▶ elf  (closure walk)   │
//! │               └──────────────────┘                            │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The `image` module holds the in-memory model (config, layers,
//! descriptors); `pack` serializes it to an OCI layout tar.gz and
//! `unpack` parses one back and materializes layers on disk.

pub mod build;
pub mod copy;
pub mod deps;
pub mod elf;
pub mod image;
pub mod ldcache;
pub mod nss;
pub mod pack;
pub mod symlink;
pub mod unpack;

pub use build::{build_image, BuildOptions};
pub use copy::{copy_tree, CopyOptions};
pub use deps::deps;
pub use elf::{inspect, ElfInfo};
pub use image::{Descriptor, Image, ImageConfig, ImageMetadata, Layer, OpaqueBlob};
pub use ldcache::LdCache;
pub use nss::{parse_user, populate_nss, UserIdentity};
pub use pack::{layer_from_path, write_oci_targz};
pub use unpack::{extract_layer, extract_oci, image_from_file};
