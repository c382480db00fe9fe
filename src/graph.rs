use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::archive;
use crate::bundle::{self, Bundle};
use crate::driver::Driver;
use crate::error::GraphError;
use crate::image::{Image, validate_id};
use crate::index::TruncIndex;

/// Reserved scratch directory name directly under the store root.
const TMP_DIR: &str = "_tmp";
/// Metadata document of a layered-format image.
const METADATA_FILE: &str = "json";
/// Cached layer size, shared by both formats.
pub(crate) const LAYERSIZE_FILE: &str = "layersize";

/// A registered image of either format.
///
/// Most read-side operations are format-agnostic; the variants only matter
/// to callers that care about provenance (random-id layered images vs.
/// content-addressed bundles).
#[derive(Debug, Clone)]
pub enum StoredImage {
    Layered(LayeredImage),
    Bundle(Bundle),
}

/// A layered-format image together with its (possibly lazily computed) size.
#[derive(Debug, Clone)]
pub struct LayeredImage {
    pub image: Image,
    /// Bytes this layer adds over its parent.
    pub size: u64,
}

impl StoredImage {
    pub fn id(&self) -> &str {
        match self {
            StoredImage::Layered(layered) => &layered.image.id,
            StoredImage::Bundle(b) => &b.id,
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            StoredImage::Layered(layered) => layered.size,
            StoredImage::Bundle(b) => b.size,
        }
    }

    /// Parent ids: at most one for layered images, the dependency ids
    /// recorded at ingest for bundles.
    pub fn parent_ids(&self) -> Vec<String> {
        match self {
            StoredImage::Layered(layered) => layered.image.parent.iter().cloned().collect(),
            StoredImage::Bundle(b) => b.parents.clone(),
        }
    }
}

/// The graph store: one directory of immutable image metadata plus the
/// index and the driver that owns the actual layer bytes.
///
/// Single-process, multi-reader / single-writer-per-id. All I/O is
/// synchronous and caller-driven; there are no background tasks. The sole
/// commit point for every mutation is a same-filesystem rename, so readers
/// see either the old state or the new, never a half-built directory.
pub struct Graph {
    pub(crate) root: Utf8PathBuf,
    pub(crate) driver: Box<dyn Driver>,
    pub(crate) index: Mutex<TruncIndex>,
    /// Ids with a registration in flight. Held for the whole operation,
    /// cleanup included, so a failed register cannot race a retry.
    in_flight: Mutex<HashSet<String>>,
}

/// Releases an in-flight id claim when dropped.
pub(crate) struct IdClaim<'a> {
    graph: &'a Graph,
    id: String,
}

impl Drop for IdClaim<'_> {
    fn drop(&mut self) {
        self.graph.in_flight.lock().unwrap().remove(&self.id);
    }
}

impl Graph {
    /// Open (or initialize) a store rooted at `root`.
    ///
    /// The index is rebuilt by scanning the root: every child directory the
    /// driver also knows becomes an entry. Metadata the driver does not
    /// know is orphaned (e.g. by a crash mid-delete) and left in place.
    pub fn open(root: impl Into<Utf8PathBuf>, driver: Box<dyn Driver>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(TMP_DIR))
            .with_context(|| format!("initializing graph root {root}"))?;

        let mut index = TruncIndex::new();
        for entry in root
            .read_dir_utf8()
            .with_context(|| format!("scanning graph root {root}"))?
        {
            let entry = entry.context("reading graph root entry")?;
            if entry.file_name() == TMP_DIR
                || !entry.file_type().context("reading entry type")?.is_dir()
            {
                continue;
            }
            let name = entry.file_name();
            if driver.exists(name) {
                index.add(name);
            } else {
                warn!(
                    id = name,
                    driver = driver.name(),
                    "skipping image metadata unknown to the driver"
                );
            }
        }
        debug!(images = index.len(), root = %root, "opened graph store");

        Ok(Self {
            root,
            driver,
            index: Mutex::new(index),
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    /// Directory that holds (or would hold) the metadata of `id`.
    pub(crate) fn image_dir(&self, id: &str) -> Utf8PathBuf {
        self.root.join(id)
    }

    /// Create a fresh scratch directory under the reserved `_tmp` root.
    ///
    /// All non-atomic work stages here. The commit path takes ownership of
    /// the path and renames it into final position; every other path drops
    /// the handle and the directory is removed recursively.
    pub(crate) fn mktemp(&self) -> Result<TempDir> {
        let tmp_root = self.root.join(TMP_DIR);
        fs::create_dir_all(&tmp_root)
            .with_context(|| format!("creating scratch root {tmp_root}"))?;
        tempfile::Builder::new()
            .prefix("scratch-")
            .permissions(fs::Permissions::from_mode(0o700))
            .tempdir_in(&tmp_root)
            .context("creating scratch directory")
    }

    /// Claim `id` for a registration, failing if it is stored or in flight.
    pub(crate) fn claim_id(&self, id: &str) -> Result<IdClaim<'_>> {
        let mut in_flight = self.in_flight.lock().unwrap();
        if in_flight.contains(id) || self.index.lock().unwrap().contains(id) {
            anyhow::bail!(GraphError::AlreadyExists(id.to_string()));
        }
        in_flight.insert(id.to_string());
        Ok(IdClaim {
            graph: self,
            id: id.to_string(),
        })
    }

    /// Register a layered-format image from its metadata and layer tar.
    ///
    /// The driver layer is created first and the metadata directory is
    /// renamed into place last; a failure anywhere in between removes the
    /// driver layer again, so a failed register leaves the store exactly
    /// as it was.
    pub fn register(&self, image: &Image, layer: &mut dyn Read) -> Result<()> {
        validate_id(&image.id)?;
        let _claim = self.claim_id(&image.id)?;
        let dir = self.image_dir(&image.id);

        // A crash can leave a directory that never made it into the index;
        // it is stale by definition, as is any driver state for this id.
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("clearing stale image directory {dir}"))?;
        }
        if let Err(err) = self.driver.remove(&image.id) {
            debug!(id = %image.id, "pre-register driver remove: {err:#}");
        }

        let tmp = self.mktemp()?;
        self.driver
            .create(&image.id, image.parent.as_deref())
            .with_context(|| format!("creating driver layer {}", image.id))?;

        if let Err(err) = self.populate_layered(image, layer, tmp.path()) {
            let _ = self.driver.remove(&image.id);
            return Err(err);
        }

        let staged = tmp.keep();
        if let Err(err) = fs::rename(&staged, &dir) {
            let _ = fs::remove_dir_all(&staged);
            let _ = self.driver.remove(&image.id);
            return Err(anyhow::Error::new(err))
                .with_context(|| format!("committing image directory {dir}"));
        }

        self.index.lock().unwrap().add(&image.id);
        info!(id = %image.id, "registered image");
        Ok(())
    }

    /// Apply the layer through the driver and stage metadata into `tmp`.
    fn populate_layered(&self, image: &Image, layer: &mut dyn Read, tmp: &Path) -> Result<()> {
        let size = self
            .driver
            .apply_diff(&image.id, image.parent.as_deref(), layer)
            .with_context(|| format!("applying layer diff for {}", image.id))?;
        fs::write(tmp.join(LAYERSIZE_FILE), size.to_string()).context("writing layer size")?;
        let json = serde_json::to_vec(image).context("serializing image metadata")?;
        fs::write(tmp.join(METADATA_FILE), json).context("writing image metadata")?;
        Ok(())
    }

    /// Resolve a full id or unambiguous prefix and load the image.
    pub fn get(&self, name: &str) -> Result<StoredImage> {
        let id = self.index.lock().unwrap().get(name)?;
        self.load(&id)
    }

    /// True when `name` resolves to a loadable image.
    pub fn exists(&self, name: &str) -> bool {
        self.get(name).is_ok()
    }

    fn load(&self, id: &str) -> Result<StoredImage> {
        let dir = self.image_dir(id);
        if dir.join(bundle::MANIFEST_FILE).exists() {
            return Ok(StoredImage::Bundle(Bundle::load(&dir, id)?));
        }

        let data = match fs::read(dir.join(METADATA_FILE)) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                anyhow::bail!(GraphError::NotFound(id.to_string()))
            }
            Err(err) => {
                return Err(anyhow::Error::new(err))
                    .with_context(|| format!("reading metadata of image {id}"));
            }
        };
        let image: Image = serde_json::from_slice(&data).map_err(|err| {
            anyhow::Error::new(GraphError::Malformed(format!("image {id}: {err}")))
        })?;
        if image.id != id {
            anyhow::bail!(GraphError::IdMismatch {
                dir: id.to_string(),
                embedded: image.id,
            });
        }

        let size = match read_size(&dir)? {
            Some(size) => size,
            None => {
                // Older entries may predate the size cache; compute once
                // and persist. The write is idempotent and only touches a
                // file nothing else reads.
                let size = self
                    .driver
                    .diff_size(id, image.parent.as_deref())
                    .with_context(|| format!("computing size of layer {id}"))?;
                fs::write(dir.join(LAYERSIZE_FILE), size.to_string())
                    .with_context(|| format!("caching size of layer {id}"))?;
                size
            }
        };

        Ok(StoredImage::Layered(LayeredImage { image, size }))
    }

    /// Delete an image: metadata, index entry and driver layer.
    ///
    /// The id leaves the index before any filesystem work and the
    /// directory is renamed into scratch before removal, so the deletion
    /// is externally atomic: lookups stop resolving the id immediately,
    /// and readers already holding the old path may still finish.
    pub fn delete(&self, name: &str) -> Result<()> {
        let id = self.index.lock().unwrap().get(name)?;
        let dir = self.image_dir(&id);
        let tmp = self.mktemp().context("creating scratch for delete")?;

        self.index.lock().unwrap().delete(&id);

        let doomed = tmp.path().join(&id);
        let cleanup = match fs::rename(&dir, &doomed) {
            Ok(()) => doomed,
            Err(err) => {
                warn!(id = %id, "renaming into scratch failed, deleting in place: {err}");
                dir.clone().into_std_path_buf()
            }
        };

        self.driver
            .remove(&id)
            .with_context(|| format!("removing driver layer {id}"))?;
        fs::remove_dir_all(&cleanup)
            .with_context(|| format!("deleting image directory of {id}"))?;

        info!(id = %id, "deleted image");
        Ok(())
    }

    /// Ids of every image directory currently under the root, sorted.
    fn stored_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        if let Ok(entries) = self.root.read_dir_utf8() {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
                if is_dir && name != TMP_DIR {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        ids
    }

    /// All loadable layered-format images, keyed by id.
    ///
    /// Entries that fail to load are skipped, never block the walk.
    pub fn map(&self) -> IndexMap<String, LayeredImage> {
        let mut images = IndexMap::new();
        for id in self.stored_ids() {
            match self.get(&id) {
                Ok(StoredImage::Layered(layered)) => {
                    images.insert(id, layered);
                }
                Ok(StoredImage::Bundle(_)) => {}
                Err(err) => debug!(id = %id, "skipping unloadable image: {err:#}"),
            }
        }
        images
    }

    /// All loadable bundle-format images, keyed by id.
    pub fn map_bundles(&self) -> IndexMap<String, Bundle> {
        let mut bundles = IndexMap::new();
        for id in self.stored_ids() {
            match self.get(&id) {
                Ok(StoredImage::Bundle(b)) => {
                    bundles.insert(id, b);
                }
                Ok(StoredImage::Layered(_)) => {}
                Err(err) => debug!(id = %id, "skipping unloadable image: {err:#}"),
            }
        }
        bundles
    }

    /// Children of every image, keyed by parent id.
    ///
    /// Edges whose parent does not resolve are dropped; the child itself
    /// still appears under its other parents, if any.
    pub fn by_parent(&self) -> IndexMap<String, Vec<StoredImage>> {
        let mut children: IndexMap<String, Vec<StoredImage>> = IndexMap::new();
        for id in self.stored_ids() {
            let Ok(image) = self.get(&id) else { continue };
            for parent in image.parent_ids() {
                if !self.exists(&parent) {
                    continue;
                }
                children.entry(parent).or_default().push(image.clone());
            }
        }
        children
    }

    /// Images that are nobody's parent.
    pub fn heads(&self) -> IndexMap<String, StoredImage> {
        let children = self.by_parent();
        let mut heads = IndexMap::new();
        for id in self.stored_ids() {
            if children.contains_key(&id) {
                continue;
            }
            if let Ok(image) = self.get(&id) {
                heads.insert(id, image);
            }
        }
        heads
    }

    /// Export an image's layer tar, fully buffered to an unlinked scratch
    /// file that the OS reclaims when the handle is dropped.
    ///
    /// Buffering releases driver-side resources promptly and gives the
    /// caller seek semantics over the stream. `progress` is called with
    /// the cumulative byte count as the driver stream is drained.
    pub fn temp_layer_archive(
        &self,
        name: &str,
        progress: Option<&mut dyn FnMut(u64)>,
    ) -> Result<TempArchive> {
        let image = self.get(name)?;
        let id = image.id().to_string();
        let mut stream = self
            .driver
            .tar_layer(&id)
            .with_context(|| format!("exporting layer {id}"))?;

        let tmp_root = self.root.join(TMP_DIR);
        fs::create_dir_all(&tmp_root)
            .with_context(|| format!("creating scratch root {tmp_root}"))?;
        let mut file =
            tempfile::tempfile_in(&tmp_root).context("creating layer archive buffer")?;

        let size = match progress {
            Some(callback) => {
                let mut reader = archive::ProgressReader::new(stream, callback);
                io::copy(&mut reader, &mut file).context("buffering layer archive")?
            }
            None => io::copy(&mut stream, &mut file).context("buffering layer archive")?,
        };
        file.seek(SeekFrom::Start(0)).context("rewinding layer archive")?;

        Ok(TempArchive { file, size })
    }
}

/// Read the cached layer size, if one has been written.
pub(crate) fn read_size(dir: &Utf8Path) -> Result<Option<u64>> {
    match fs::read_to_string(dir.join(LAYERSIZE_FILE)) {
        Ok(s) => {
            let size = s
                .trim()
                .parse()
                .with_context(|| format!("parsing layer size in {dir}"))?;
            Ok(Some(size))
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => {
            Err(anyhow::Error::new(err)).with_context(|| format!("reading layer size in {dir}"))
        }
    }
}

/// A fully buffered layer tar in an unlinked scratch file.
///
/// The backing file has no name on disk anymore; dropping the handle is
/// all the cleanup there is.
pub struct TempArchive {
    file: File,
    size: u64,
}

impl TempArchive {
    /// Size of the buffered tar in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Read for TempArchive {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Seek for TempArchive {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::{is_already_exists, is_ambiguous, is_not_found};
    use std::sync::Arc;

    /// Driver calls a test can assert on.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Call {
        Create(String, Option<String>),
        ApplyDiff(String, Option<String>),
        Remove(String),
        TarLayer(String),
    }

    /// In-memory driver that records every call.
    #[derive(Default)]
    pub(crate) struct MockDriver {
        pub(crate) layers: Mutex<HashSet<String>>,
        pub(crate) calls: Mutex<Vec<Call>>,
    }

    impl MockDriver {
        pub(crate) fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        pub(crate) fn has_layer(&self, id: &str) -> bool {
            self.layers.lock().unwrap().contains(id)
        }
    }

    impl Driver for Arc<MockDriver> {
        fn name(&self) -> &'static str {
            "mock"
        }

        fn exists(&self, id: &str) -> bool {
            self.layers.lock().unwrap().contains(id)
        }

        fn create(&self, id: &str, parent: Option<&str>) -> Result<()> {
            let mut layers = self.layers.lock().unwrap();
            if layers.contains(id) {
                anyhow::bail!(GraphError::AlreadyExists(id.to_string()));
            }
            layers.insert(id.to_string());
            self.calls
                .lock()
                .unwrap()
                .push(Call::Create(id.to_string(), parent.map(String::from)));
            Ok(())
        }

        fn apply_diff(&self, id: &str, parent: Option<&str>, diff: &mut dyn Read) -> Result<u64> {
            if !self.exists(id) {
                anyhow::bail!(GraphError::NotFound(id.to_string()));
            }
            self.calls
                .lock()
                .unwrap()
                .push(Call::ApplyDiff(id.to_string(), parent.map(String::from)));
            Ok(io::copy(diff, &mut io::sink())?)
        }

        fn diff_size(&self, id: &str, _parent: Option<&str>) -> Result<u64> {
            if !self.exists(id) {
                anyhow::bail!(GraphError::NotFound(id.to_string()));
            }
            Ok(4242)
        }

        fn remove(&self, id: &str) -> Result<()> {
            self.layers.lock().unwrap().remove(id);
            self.calls.lock().unwrap().push(Call::Remove(id.to_string()));
            Ok(())
        }

        fn tar_layer(&self, id: &str) -> Result<Box<dyn Read + Send>> {
            if !self.exists(id) {
                anyhow::bail!(GraphError::NotFound(id.to_string()));
            }
            self.calls
                .lock()
                .unwrap()
                .push(Call::TarLayer(id.to_string()));
            Ok(Box::new(io::Cursor::new(layer_tar(&[(
                "hello", "hi",
            )]))))
        }
    }

    pub(crate) fn layer_tar(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(0o644);
            header.set_size(content.len() as u64);
            builder
                .append_data(&mut header, path, content.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap()
    }

    pub(crate) fn hex_id(c: char) -> String {
        c.to_string().repeat(64)
    }

    pub(crate) fn test_graph() -> (tempfile::TempDir, Graph, Arc<MockDriver>) {
        let tmp = tempfile::tempdir().unwrap();
        let driver = Arc::new(MockDriver::default());
        let root = Utf8PathBuf::from_path_buf(tmp.path().join("graph")).unwrap();
        let graph = Graph::open(root, Box::new(driver.clone())).unwrap();
        (tmp, graph, driver)
    }

    fn register_simple(graph: &Graph, id: &str, parent: Option<&str>) -> Image {
        let image = Image::new(id, parent.map(String::from));
        let tar = layer_tar(&[("hello", "hi")]);
        graph.register(&image, &mut tar.as_slice()).unwrap();
        image
    }

    #[test]
    fn test_register_and_get() {
        let (_tmp, graph, driver) = test_graph();
        let id = hex_id('a');
        let image = register_simple(&graph, &id, None);

        // The driver saw remove-then-create-then-apply, in that order.
        assert_eq!(
            driver.calls(),
            vec![
                Call::Remove(id.clone()),
                Call::Create(id.clone(), None),
                Call::ApplyDiff(id.clone(), None),
            ]
        );
        assert!(graph.image_dir(&id).is_dir());

        let loaded = graph.get(&id).unwrap();
        match loaded {
            StoredImage::Layered(layered) => {
                assert_eq!(layered.image, image);
                assert_eq!(layered.size, layer_tar(&[("hello", "hi")]).len() as u64);
            }
            StoredImage::Bundle(_) => panic!("layered image loaded as bundle"),
        }
    }

    #[test]
    fn test_truncated_lookup() {
        let (_tmp, graph, _driver) = test_graph();
        let a = hex_id('a');
        register_simple(&graph, &a, None);

        match graph.get("aa").unwrap() {
            StoredImage::Layered(layered) => assert_eq!(layered.image.id, a),
            StoredImage::Bundle(_) => panic!("unexpected bundle"),
        }

        let ab = format!("ab{}", "c".repeat(62));
        register_simple(&graph, &ab, None);
        let err = graph.get("a").unwrap_err();
        assert!(is_ambiguous(&err), "expected Ambiguous, got: {err:#}");
    }

    #[test]
    fn test_register_rejects_duplicates_and_bad_ids() {
        let (_tmp, graph, _driver) = test_graph();
        let id = hex_id('a');
        register_simple(&graph, &id, None);

        let image = Image::new(&id, None);
        let err = graph
            .register(&image, &mut layer_tar(&[]).as_slice())
            .unwrap_err();
        assert!(is_already_exists(&err), "expected AlreadyExists: {err:#}");

        let image = Image::new("not-an-id", None);
        assert!(graph.register(&image, &mut io::empty()).is_err());
    }

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::other("stream aborted"))
        }
    }

    #[test]
    fn test_failed_register_leaves_no_trace() {
        let (_tmp, graph, driver) = test_graph();
        let id = hex_id('a');
        let image = Image::new(&id, None);

        let err = graph.register(&image, &mut FailingReader).unwrap_err();
        assert!(format!("{err:#}").contains("stream aborted"));

        assert!(!graph.image_dir(&id).exists());
        assert!(!driver.has_layer(&id));
        let err = graph.get(&id).unwrap_err();
        assert!(is_not_found(&err));
        // The driver layer was rolled back after the failed apply.
        let calls = driver.calls();
        assert_eq!(calls.last(), Some(&Call::Remove(id.clone())));
        // The scratch directory is gone too.
        let tmp_entries: Vec<_> = graph
            .root
            .join(TMP_DIR)
            .read_dir_utf8()
            .unwrap()
            .collect();
        assert!(tmp_entries.is_empty(), "scratch left behind");

        // And the id is free for a retry.
        register_simple(&graph, &id, None);
    }

    #[test]
    fn test_delete_isolates_siblings() {
        let (_tmp, graph, driver) = test_graph();
        let p = hex_id('a');
        let c1 = hex_id('b');
        let c2 = hex_id('c');
        register_simple(&graph, &p, None);
        register_simple(&graph, &c1, Some(&p));
        register_simple(&graph, &c2, Some(&p));

        graph.delete(&c1).unwrap();

        let err = graph.get(&c1).unwrap_err();
        assert!(is_not_found(&err));
        assert!(!driver.has_layer(&c1));
        assert!(!graph.image_dir(&c1).exists());

        let heads = graph.heads();
        assert!(heads.contains_key(&c2));
        assert!(!heads.contains_key(&p));

        let children = graph.by_parent();
        let under_p: Vec<_> = children[&p].iter().map(|i| i.id().to_string()).collect();
        assert_eq!(under_p, vec![c2.clone()]);
    }

    #[test]
    fn test_heads_and_children_partition_all_ids() {
        let (_tmp, graph, _driver) = test_graph();
        let p = hex_id('a');
        let c1 = hex_id('b');
        let c2 = hex_id('c');
        register_simple(&graph, &p, None);
        register_simple(&graph, &c1, Some(&p));
        register_simple(&graph, &c2, Some(&c1));

        let heads = graph.heads();
        let with_children = graph.by_parent();

        let mut all: Vec<_> = heads.keys().chain(with_children.keys()).cloned().collect();
        all.sort();
        assert_eq!(all, vec![p.clone(), c1.clone(), c2.clone()]);
        for head in heads.keys() {
            assert!(!with_children.contains_key(head));
        }
    }

    #[test]
    fn test_restart_reindexes_from_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(tmp.path().join("graph")).unwrap();
        let driver = Arc::new(MockDriver::default());

        let id = {
            let graph = Graph::open(root.clone(), Box::new(driver.clone())).unwrap();
            let id = hex_id('a');
            register_simple(&graph, &id, None);
            id
        };

        let graph = Graph::open(root, Box::new(driver.clone())).unwrap();
        assert!(graph.exists(&id));
    }

    #[test]
    fn test_restart_skips_orphaned_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(tmp.path().join("graph")).unwrap();
        let driver = Arc::new(MockDriver::default());

        // Metadata directory for an id the driver has never heard of.
        let orphan = hex_id('f');
        fs::create_dir_all(root.join(&orphan)).unwrap();
        let image = Image::new(&orphan, None);
        fs::write(
            root.join(&orphan).join(METADATA_FILE),
            serde_json::to_vec(&image).unwrap(),
        )
        .unwrap();

        let graph = Graph::open(root, Box::new(driver)).unwrap();
        let err = graph.get(&orphan).unwrap_err();
        assert!(is_not_found(&err), "orphan must not be indexed: {err:#}");
    }

    #[test]
    fn test_aborted_register_is_retryable_after_restart() {
        // Crash after driver.create but before the commit rename: the
        // driver holds a layer, the graph directory does not exist.
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(tmp.path().join("graph")).unwrap();
        let driver = Arc::new(MockDriver::default());
        let id = hex_id('a');
        driver.layers.lock().unwrap().insert(id.clone());

        let graph = Graph::open(root, Box::new(driver.clone())).unwrap();
        let err = graph.get(&id).unwrap_err();
        assert!(is_not_found(&err));

        // Re-registering clears the stale driver layer first.
        register_simple(&graph, &id, None);
        assert_eq!(
            driver.calls().first(),
            Some(&Call::Remove(id.clone())),
            "stale driver state must be cleared before create"
        );
        assert!(graph.exists(&id));
    }

    #[test]
    fn test_id_mismatch_is_rejected() {
        let (_tmp, graph, driver) = test_graph();
        let id = hex_id('a');
        register_simple(&graph, &id, None);

        // Corrupt the stored document so it names a different id.
        let other = Image::new(hex_id('b'), None);
        fs::write(
            graph.image_dir(&id).join(METADATA_FILE),
            serde_json::to_vec(&other).unwrap(),
        )
        .unwrap();
        drop(driver);

        let err = graph.get(&id).unwrap_err();
        assert!(
            matches!(
                err.downcast_ref::<GraphError>(),
                Some(GraphError::IdMismatch { .. })
            ),
            "expected IdMismatch, got: {err:#}"
        );
    }

    #[test]
    fn test_size_is_computed_lazily_and_cached() {
        let (_tmp, graph, _driver) = test_graph();
        let id = hex_id('a');
        register_simple(&graph, &id, None);

        let size_file = graph.image_dir(&id).join(LAYERSIZE_FILE);
        fs::remove_file(&size_file).unwrap();

        match graph.get(&id).unwrap() {
            StoredImage::Layered(layered) => assert_eq!(layered.size, 4242),
            StoredImage::Bundle(_) => panic!("unexpected bundle"),
        }
        assert_eq!(fs::read_to_string(&size_file).unwrap(), "4242");
    }

    #[test]
    fn test_enumeration_agrees_with_index() {
        let (_tmp, graph, _driver) = test_graph();
        register_simple(&graph, &hex_id('a'), None);
        register_simple(&graph, &hex_id('b'), None);

        let map = graph.map();
        assert_eq!(map.len(), 2);
        for id in map.keys() {
            assert!(graph.exists(id));
        }
    }

    #[test]
    fn test_temp_layer_archive_buffers_and_reports_progress() {
        let (_tmp, graph, driver) = test_graph();
        let id = hex_id('a');
        register_simple(&graph, &id, None);

        let mut last = 0;
        let mut progress = |total| last = total;
        let mut archive = graph
            .temp_layer_archive(&id, Some(&mut progress))
            .unwrap();

        let mut bytes = Vec::new();
        archive.read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes, layer_tar(&[("hello", "hi")]));
        assert_eq!(archive.size(), bytes.len() as u64);
        assert_eq!(last, bytes.len() as u64);
        assert!(driver.calls().contains(&Call::TarLayer(id)));

        // Seekable: rewind and read again.
        archive.seek(SeekFrom::Start(0)).unwrap();
        let mut again = Vec::new();
        archive.read_to_end(&mut again).unwrap();
        assert_eq!(again, bytes);
    }

    #[test]
    fn test_end_to_end_with_vfs_driver() {
        let tmp = tempfile::tempdir().unwrap();
        let home = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        let driver = crate::vfs::VfsDriver::new(home.join("layers")).unwrap();
        let graph = Graph::open(home.join("graph"), Box::new(driver)).unwrap();

        let id = hex_id('a');
        let image = Image::new(&id, None);
        let tar = layer_tar(&[("etc/hostname", "box\n")]);
        graph.register(&image, &mut tar.as_slice()).unwrap();
        assert!(home.join("layers").join(&id).join("etc/hostname").is_file());

        // Export the materialized layer and unpack it elsewhere.
        let mut exported = graph.temp_layer_archive(&id, None).unwrap();
        let mut bytes = Vec::new();
        exported.read_to_end(&mut bytes).unwrap();
        let out = tempfile::tempdir().unwrap();
        let out_dir =
            cap_std::fs::Dir::open_ambient_dir(out.path(), cap_std::ambient_authority()).unwrap();
        archive::unpack(bytes.as_slice(), &out_dir).unwrap();
        assert_eq!(out_dir.read("etc/hostname").unwrap(), b"box\n");

        graph.delete(&id).unwrap();
        assert!(!graph.exists(&id));
        assert!(!home.join("layers").join(&id).exists());
        assert!(!graph.image_dir(&id).exists());
    }
}
