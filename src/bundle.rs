use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std::ambient_authority;
use cap_std::fs::Dir;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::archive;
use crate::error::GraphError;
use crate::graph::{Graph, LAYERSIZE_FILE, read_size};

/// Manifest file at the root of a bundle and of its image directory.
pub(crate) const MANIFEST_FILE: &str = "manifest";
/// Canonical layer tar kept next to the manifest.
pub(crate) const LAYER_TAR_FILE: &str = "layer.tar";
/// Dependency ids resolved at ingest, one JSON list.
pub(crate) const PARENTS_FILE: &str = "parents";
/// Scratch name of the decompressed ingest stream; never committed.
const INGEST_TAR_FILE: &str = "ingest.tar";
/// Rootfs directory inside the bundle archive.
const ROOTFS_DIR: &str = "rootfs";

/// Self-describing manifest carried inside a bundle archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleManifest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<BundleDependency>,
}

/// A dependency a bundle declares, by image name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleDependency {
    pub name: String,
}

/// A registered bundle-format image. Its id is intrinsic: the SHA-256 of
/// the decompressed archive it was ingested from.
#[derive(Debug, Clone)]
pub struct Bundle {
    pub id: String,
    pub manifest: BundleManifest,
    /// Dependency ids resolved when the bundle was ingested; dependencies
    /// that did not resolve are absent.
    pub parents: Vec<String>,
    /// Bytes the layer applied into the driver at ingest.
    pub size: u64,
}

fn parse_manifest(data: &[u8]) -> Result<BundleManifest> {
    serde_json::from_slice(data)
        .map_err(|err| anyhow::Error::new(GraphError::Malformed(format!("bundle manifest: {err}"))))
}

impl Bundle {
    pub(crate) fn load(dir: &Utf8Path, id: &str) -> Result<Self> {
        let data = match fs::read(dir.join(MANIFEST_FILE)) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                anyhow::bail!(GraphError::NotFound(id.to_string()))
            }
            Err(err) => {
                return Err(anyhow::Error::new(err))
                    .with_context(|| format!("reading manifest of bundle {id}"));
            }
        };
        let manifest = parse_manifest(&data).with_context(|| format!("loading bundle {id}"))?;

        let parents = match fs::read(dir.join(PARENTS_FILE)) {
            Ok(data) => serde_json::from_slice(&data).map_err(|err| {
                anyhow::Error::new(GraphError::Malformed(format!(
                    "bundle {id} parents: {err}"
                )))
            })?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                return Err(anyhow::Error::new(err))
                    .with_context(|| format!("reading parents of bundle {id}"));
            }
        };

        let size = read_size(dir)?.unwrap_or(0);

        Ok(Self {
            id: id.to_string(),
            manifest,
            parents,
            size,
        })
    }
}

impl Graph {
    /// Ingest a self-describing bundle stream.
    ///
    /// The stream is decompressed while a SHA-256 runs over the
    /// decompressed bytes; the hex digest is the bundle's identity, so a
    /// bundle already in the store is returned as-is without touching the
    /// driver. The unpacked rootfs is repacked into the canonical
    /// `layer.tar` the image directory keeps.
    pub fn register_bundle(&self, reader: &mut dyn Read) -> Result<(BundleManifest, String)> {
        let tmp = self.mktemp()?;
        let tmp_path = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
            .map_err(|path| anyhow::anyhow!("scratch path {} is not UTF-8", path.display()))?;

        // The id is unknown until the stream is fully consumed, so spool
        // the decompressed bytes to scratch while hashing them.
        let ingest_tar = tmp_path.join(INGEST_TAR_FILE);
        let digest = {
            let decompressed = archive::decompress(reader)?;
            let mut hashing = archive::HashingReader::new(decompressed);
            let mut out = File::create(&ingest_tar)
                .with_context(|| format!("creating {ingest_tar}"))?;
            io::copy(&mut hashing, &mut out).context("spooling bundle to scratch")?;
            hashing.digest()
        };

        let scratch = Dir::open_ambient_dir(&tmp_path, ambient_authority())
            .context("opening scratch directory")?;
        archive::unpack(
            File::open(&ingest_tar).with_context(|| format!("reopening {ingest_tar}"))?,
            &scratch,
        )
        .context("unpacking bundle")?;

        let manifest_bytes = match fs::read(tmp_path.join(MANIFEST_FILE)) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                anyhow::bail!(GraphError::Malformed("bundle carries no manifest".into()))
            }
            Err(err) => {
                return Err(anyhow::Error::new(err)).context("reading bundle manifest");
            }
        };
        let manifest = parse_manifest(&manifest_bytes)?;
        let rootfs = tmp_path.join(ROOTFS_DIR);
        if !rootfs.is_dir() {
            anyhow::bail!(GraphError::Malformed(format!(
                "bundle {} carries no rootfs directory",
                manifest.name
            )));
        }

        // Identity is content: an already-stored bundle is immutable and
        // this ingest is a no-op.
        if self.image_dir(&digest).exists() {
            debug!(id = %digest, name = %manifest.name, "bundle already stored");
            return Ok((manifest, digest));
        }

        let _claim = self.claim_id(&digest)?;
        let parents = self.resolve_dependencies(&manifest);
        let parent = parents.first().cloned();

        let layer_tar = tmp_path.join(LAYER_TAR_FILE);
        {
            let rootfs_dir = Dir::open_ambient_dir(&rootfs, ambient_authority())
                .context("opening bundle rootfs")?;
            let out =
                File::create(&layer_tar).with_context(|| format!("creating {layer_tar}"))?;
            archive::pack(&rootfs_dir, out).context("packing bundle rootfs")?;
        }
        fs::remove_dir_all(&rootfs).context("dropping unpacked rootfs")?;
        fs::remove_file(&ingest_tar).context("dropping ingest tar")?;

        self.driver
            .create(&digest, parent.as_deref())
            .with_context(|| format!("creating driver layer {digest}"))?;
        let populated = (|| -> Result<()> {
            let mut diff =
                File::open(&layer_tar).with_context(|| format!("reopening {layer_tar}"))?;
            let size = self
                .driver
                .apply_diff(&digest, parent.as_deref(), &mut diff)
                .context("applying bundle layer")?;
            fs::write(tmp_path.join(LAYERSIZE_FILE), size.to_string())
                .context("writing layer size")?;
            let parents_json =
                serde_json::to_vec(&parents).context("serializing resolved parents")?;
            fs::write(tmp_path.join(PARENTS_FILE), parents_json)
                .context("writing resolved parents")?;
            Ok(())
        })();
        if let Err(err) = populated {
            let _ = self.driver.remove(&digest);
            return Err(err);
        }

        let dir = self.image_dir(&digest);
        let staged = tmp.keep();
        if let Err(err) = fs::rename(&staged, &dir) {
            let _ = fs::remove_dir_all(&staged);
            let _ = self.driver.remove(&digest);
            return Err(anyhow::Error::new(err))
                .with_context(|| format!("committing bundle directory {dir}"));
        }

        self.index.lock().unwrap().add(&digest);
        info!(id = %digest, name = %manifest.name, "registered bundle");
        Ok((manifest, digest))
    }

    /// Resolve manifest dependencies to ids of bundles already stored.
    ///
    /// A dependency names an image, and whichever stored bundle currently
    /// carries that name wins. Names resolving to nothing, or to several
    /// bundles, are dropped: the new bundle is flattened past them.
    fn resolve_dependencies(&self, manifest: &BundleManifest) -> Vec<String> {
        let stored = self.map_bundles();
        let mut parents = Vec::new();
        for dep in &manifest.dependencies {
            let mut matches = stored.values().filter(|b| b.manifest.name == dep.name);
            match (matches.next(), matches.next()) {
                (Some(found), None) => parents.push(found.id.clone()),
                (Some(_), Some(_)) => {
                    warn!(name = %dep.name, "dependency name matches several bundles, dropping")
                }
                (None, _) => {
                    warn!(name = %dep.name, "dependency not in store, flattening past it")
                }
            }
        }
        parents
    }
}
