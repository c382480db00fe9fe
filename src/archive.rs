use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use cap_std::fs::{Dir, MetadataExt, OpenOptions, Permissions, PermissionsExt};
use sha2::{Digest, Sha256};
use tracing::debug;

/// Compression formats recognized on ingress. Egress is always raw tar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Uncompressed,
    Gzip,
    Bzip2,
    Xz,
}

/// Longest magic prefix the sniffer needs (the xz header).
const MAGIC_LEN: usize = 6;

impl Compression {
    /// Detect the compression format from the first bytes of a stream.
    pub fn detect(magic: &[u8]) -> Self {
        if magic.starts_with(&[0x1f, 0x8b]) {
            Compression::Gzip
        } else if magic.starts_with(b"BZh") {
            Compression::Bzip2
        } else if magic.starts_with(&[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00]) {
            Compression::Xz
        } else {
            Compression::Uncompressed
        }
    }
}

/// Wrap a stream in whatever decompressor its magic bytes call for.
///
/// At most [`MAGIC_LEN`] bytes are read ahead; the consumed prefix is
/// chained back in front of the remaining stream.
pub fn decompress<'a, R: Read + 'a>(mut reader: R) -> Result<Box<dyn Read + 'a>> {
    let mut magic = [0u8; MAGIC_LEN];
    let mut filled = 0;
    while filled < MAGIC_LEN {
        let n = reader
            .read(&mut magic[filled..])
            .context("sniffing stream magic")?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    let stream = io::Cursor::new(magic[..filled].to_vec()).chain(reader);
    Ok(match Compression::detect(&magic[..filled]) {
        Compression::Gzip => Box::new(flate2::read::GzDecoder::new(stream)),
        Compression::Bzip2 => Box::new(bzip2::read::BzDecoder::new(stream)),
        Compression::Xz => Box::new(xz2::read::XzDecoder::new(stream)),
        Compression::Uncompressed => Box::new(stream),
    })
}

/// Reduce a tar entry path to a safe path relative to the unpack target.
///
/// Leading `/` and `.` components are dropped. Entries that try to climb
/// out with `..` are rejected entirely; the capability-scoped target dir
/// would refuse them anyway, this just skips them without erroring.
fn entry_rel_path(path: &Path) -> Option<PathBuf> {
    let mut rel = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::Normal(c) => rel.push(c),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => return None,
        }
    }
    if rel.as_os_str().is_empty() { None } else { Some(rel) }
}

/// Unpack a tar stream into `target`.
///
/// The stream may be gzip-, bzip2- or xz-compressed; the format is
/// auto-detected. Regular files, directories and symlinks are
/// materialized with the modes from their headers; every other entry kind
/// (hardlinks, devices, fifos) is skipped. Writes go through the
/// capability-scoped `target`, so no entry can escape it.
pub fn unpack(reader: impl Read, target: &Dir) -> Result<()> {
    let stream = decompress(reader)?;
    let mut archive = tar::Archive::new(stream);
    for entry in archive.entries().context("reading tar entries")? {
        let mut entry = entry.context("reading tar entry")?;
        let path = entry.path().context("reading tar entry path")?.into_owned();
        let Some(rel) = entry_rel_path(&path) else {
            debug!(path = %path.display(), "skipping unsafe tar entry path");
            continue;
        };
        let kind = entry.header().entry_type();
        match kind {
            tar::EntryType::Directory => {
                target
                    .create_dir_all(&rel)
                    .with_context(|| format!("creating directory {}", rel.display()))?;
                if let Ok(mode) = entry.header().mode() {
                    target
                        .set_permissions(&rel, Permissions::from_mode(mode & 0o7777))
                        .with_context(|| format!("setting mode on {}", rel.display()))?;
                }
            }
            tar::EntryType::Regular => {
                if let Some(parent) = rel.parent()
                    && !parent.as_os_str().is_empty()
                {
                    target
                        .create_dir_all(parent)
                        .with_context(|| format!("creating parents of {}", rel.display()))?;
                }
                let mut opts = OpenOptions::new();
                opts.write(true).create(true).truncate(true);
                let mut file = target
                    .open_with(&rel, &opts)
                    .with_context(|| format!("creating file {}", rel.display()))?;
                io::copy(&mut entry, &mut file)
                    .with_context(|| format!("writing file {}", rel.display()))?;
                if let Ok(mode) = entry.header().mode() {
                    target
                        .set_permissions(&rel, Permissions::from_mode(mode & 0o7777))
                        .with_context(|| format!("setting mode on {}", rel.display()))?;
                }
            }
            tar::EntryType::Symlink => {
                let link = entry
                    .header()
                    .link_name()
                    .context("reading symlink target")?
                    .with_context(|| format!("symlink {} has no target", rel.display()))?
                    .into_owned();
                if let Some(parent) = rel.parent()
                    && !parent.as_os_str().is_empty()
                {
                    target
                        .create_dir_all(parent)
                        .with_context(|| format!("creating parents of {}", rel.display()))?;
                }
                // Re-applying a layer may hit an existing link.
                let _ = target.remove_file(&rel);
                target
                    .symlink(&link, &rel)
                    .with_context(|| format!("creating symlink {}", rel.display()))?;
            }
            other => {
                debug!(path = %rel.display(), kind = ?other, "skipping unsupported tar entry kind");
            }
        }
    }
    Ok(())
}

/// Pack the tree under `root` into a tar stream on `writer`.
///
/// Emits regular files and symlinks with their metadata, paths relative to
/// `root`. Directory entries are not emitted; they materialize implicitly
/// when their children are unpacked. Special files are skipped. The first
/// walk error aborts the pack. Contents are streamed, never buffered whole.
pub fn pack<W: Write>(root: &Dir, writer: W) -> Result<()> {
    use cap_std_ext::dirext::CapStdExtDirExt;
    use std::ops::ControlFlow;

    let mut tar = tar::Builder::new(writer);
    let config = cap_std_ext::dirext::WalkConfiguration::default().sort_by_file_name();

    root.walk(&config, |component| {
        let path = component.path;
        if component.file_type.is_file() {
            let meta = component
                .dir
                .symlink_metadata(component.filename)
                .with_context(|| format!("getting metadata for {}", path.display()))?;
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(meta.len());
            header.set_mode(meta.mode());
            header.set_mtime(meta.mtime() as u64);
            header.set_uid(meta.uid() as u64);
            header.set_gid(meta.gid() as u64);
            let file = component
                .dir
                .open(component.filename)
                .with_context(|| format!("opening {}", path.display()))?;
            tar.append_data(&mut header, path, file)
                .with_context(|| format!("appending file {}", path.display()))?;
        } else if component.file_type.is_symlink() {
            let meta = component
                .dir
                .symlink_metadata(component.filename)
                .with_context(|| format!("getting metadata for {}", path.display()))?;
            let link = component
                .dir
                .read_link_contents(component.filename)
                .with_context(|| format!("reading symlink {}", path.display()))?;
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header.set_mode(meta.mode());
            header.set_mtime(meta.mtime() as u64);
            header.set_uid(meta.uid() as u64);
            header.set_gid(meta.gid() as u64);
            tar.append_link(&mut header, path, link)
                .with_context(|| format!("appending symlink {}", path.display()))?;
        } else if !component.file_type.is_dir() {
            debug!(path = %path.display(), "skipping special file");
        }
        Ok::<_, anyhow::Error>(ControlFlow::Continue(()))
    })
    .context("walking layer root")?;

    tar.finish().context("finishing tar stream")?;
    Ok(())
}

/// Count the bytes flowing through a reader.
pub struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, count: 0 }
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

/// Report the running byte total to a callback as a stream is consumed.
pub struct ProgressReader<'a, R> {
    inner: R,
    total: u64,
    progress: &'a mut dyn FnMut(u64),
}

impl<'a, R: Read> ProgressReader<'a, R> {
    pub fn new(inner: R, progress: &'a mut dyn FnMut(u64)) -> Self {
        Self {
            inner,
            total: 0,
            progress,
        }
    }
}

impl<R: Read> Read for ProgressReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.total += n as u64;
        (self.progress)(self.total);
        Ok(n)
    }
}

/// Feed a SHA-256 hasher with every byte read through this adapter.
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    /// Hex digest of everything read so far.
    pub fn digest(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}
