//! A content-addressed, crash-safe store for container image layer graphs.
//!
//! The store keeps immutable image metadata under one root directory and
//! delegates the actual layer bytes to a pluggable [`Driver`]. Two image
//! formats share the namespace and the prefix-lookup index: layered images
//! with random 64-hex ids, and bundles whose id is the SHA-256 of their
//! decompressed archive. Every mutation commits through a same-filesystem
//! rename from a scratch directory, so readers never see partial state.

pub mod archive;
pub mod bundle;
pub mod cmd;
pub mod driver;
pub mod error;
pub mod graph;
pub mod image;
pub mod index;
pub mod initlayer;
pub mod vfs;

pub use bundle::{Bundle, BundleDependency, BundleManifest};
pub use driver::Driver;
pub use error::{GraphError, is_already_exists, is_ambiguous, is_not_found};
pub use graph::{Graph, LayeredImage, StoredImage, TempArchive};
pub use image::{Image, RunConfig};
pub use index::TruncIndex;
pub use initlayer::setup_init_layer;
pub use vfs::VfsDriver;
