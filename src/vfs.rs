use std::fs;
use std::io::{self, Read, Seek, SeekFrom};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std::ambient_authority;
use cap_std::fs::Dir;

use crate::archive;
use crate::driver::Driver;
use crate::error::GraphError;

/// Plain-directory reference backend.
///
/// Every layer is a complete copy of its parent's tree; there is no
/// copy-on-write and no diffing, so `tar_layer` emits the full rootfs.
/// Slow and simple, which is what the CLI and the end-to-end tests want.
pub struct VfsDriver {
    home: Utf8PathBuf,
}

impl VfsDriver {
    pub fn new(home: impl Into<Utf8PathBuf>) -> Result<Self> {
        let home = home.into();
        fs::create_dir_all(&home).with_context(|| format!("creating driver home {home}"))?;
        Ok(Self { home })
    }

    fn layer_dir(&self, id: &str) -> Utf8PathBuf {
        self.home.join(id)
    }

    fn existing_layer_dir(&self, id: &str) -> Result<Utf8PathBuf> {
        let dir = self.layer_dir(id);
        if !dir.is_dir() {
            anyhow::bail!(GraphError::NotFound(id.to_string()));
        }
        Ok(dir)
    }
}

/// Copy a tree: directories (with modes), regular files, symlinks.
fn copy_tree(src: &Utf8Path, dst: &Utf8Path) -> Result<()> {
    fs::create_dir(dst).with_context(|| format!("creating {dst}"))?;
    let perms = src
        .metadata()
        .with_context(|| format!("getting metadata for {src}"))?
        .permissions();
    fs::set_permissions(dst, perms).with_context(|| format!("setting mode on {dst}"))?;
    for entry in src
        .read_dir_utf8()
        .with_context(|| format!("reading {src}"))?
    {
        let entry = entry.with_context(|| format!("reading entry of {src}"))?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry.file_type().context("reading entry type")?;
        if file_type.is_dir() {
            copy_tree(from, &to)?;
        } else if file_type.is_symlink() {
            let target = from
                .read_link_utf8()
                .with_context(|| format!("reading symlink {from}"))?;
            std::os::unix::fs::symlink(&target, &to)
                .with_context(|| format!("creating symlink {to}"))?;
        } else {
            fs::copy(from, &to).with_context(|| format!("copying {from}"))?;
        }
    }
    Ok(())
}

/// Total bytes of regular files under `path`.
fn tree_size(path: &Utf8Path) -> Result<u64> {
    let mut total = 0;
    for entry in path
        .read_dir_utf8()
        .with_context(|| format!("reading {path}"))?
    {
        let entry = entry.with_context(|| format!("reading entry of {path}"))?;
        let meta = entry
            .path()
            .symlink_metadata()
            .with_context(|| format!("getting metadata for {}", entry.path()))?;
        if meta.is_dir() {
            total += tree_size(entry.path())?;
        } else if meta.is_file() {
            total += meta.len();
        }
    }
    Ok(total)
}

impl Driver for VfsDriver {
    fn name(&self) -> &'static str {
        "vfs"
    }

    fn exists(&self, id: &str) -> bool {
        self.layer_dir(id).is_dir()
    }

    fn create(&self, id: &str, parent: Option<&str>) -> Result<()> {
        let dir = self.layer_dir(id);
        if dir.exists() {
            anyhow::bail!(GraphError::AlreadyExists(id.to_string()));
        }
        match parent {
            Some(parent_id) => {
                let parent_dir = self.existing_layer_dir(parent_id)?;
                copy_tree(&parent_dir, &dir)
                    .with_context(|| format!("copying parent layer {parent_id}"))?;
            }
            None => {
                fs::create_dir_all(&dir).with_context(|| format!("creating layer {id}"))?;
            }
        }
        Ok(())
    }

    fn apply_diff(&self, id: &str, _parent: Option<&str>, diff: &mut dyn Read) -> Result<u64> {
        let dir = self.existing_layer_dir(id)?;
        let target = Dir::open_ambient_dir(dir.as_std_path(), ambient_authority())
            .with_context(|| format!("opening layer {id}"))?;
        let mut counting = archive::CountingReader::new(diff);
        archive::unpack(&mut counting, &target)
            .with_context(|| format!("applying diff to layer {id}"))?;
        // Consume whatever trails the end-of-archive marker so the count
        // covers the full stream.
        io::copy(&mut counting, &mut io::sink()).context("draining diff stream")?;
        Ok(counting.count())
    }

    fn diff_size(&self, id: &str, parent: Option<&str>) -> Result<u64> {
        let size = tree_size(&self.existing_layer_dir(id)?)?;
        let parent_size = match parent {
            Some(parent_id) => tree_size(&self.existing_layer_dir(parent_id)?)?,
            None => 0,
        };
        // A full-copy backend cannot tell a removal from an addition, so
        // this is the best approximation it has.
        Ok(size.saturating_sub(parent_size))
    }

    fn remove(&self, id: &str) -> Result<()> {
        let dir = self.layer_dir(id);
        if dir.exists() {
            fs::remove_dir_all(&dir).with_context(|| format!("removing layer {id}"))?;
        }
        Ok(())
    }

    fn tar_layer(&self, id: &str) -> Result<Box<dyn Read + Send>> {
        let dir = self.existing_layer_dir(id)?;
        let layer = Dir::open_ambient_dir(dir.as_std_path(), ambient_authority())
            .with_context(|| format!("opening layer {id}"))?;
        // Spool to an unlinked scratch file so the caller gets a plain
        // reader without holding the layer directory open.
        let mut buf = tempfile::tempfile_in(&self.home).context("creating layer tar buffer")?;
        archive::pack(&layer, &mut buf).with_context(|| format!("packing layer {id}"))?;
        buf.seek(SeekFrom::Start(0)).context("rewinding layer tar")?;
        Ok(Box::new(buf))
    }
}
