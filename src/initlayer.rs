use std::fs::{self, DirBuilder, File};
use std::os::unix::fs::{DirBuilderExt, symlink};

use anyhow::{Context, Result};
use camino::Utf8Path;
use tracing::debug;

/// What a bootstrap entry materializes as.
enum MountKind {
    Dir,
    File,
    Symlink(&'static str),
}

/// Mountpoints every running container gets as its top-most read-only
/// layer. The runtime bind-mounts over these; they only have to exist.
const INIT_LAYER: &[(&str, MountKind)] = &[
    ("/dev/pts", MountKind::Dir),
    ("/dev/shm", MountKind::Dir),
    ("/proc", MountKind::Dir),
    ("/sys", MountKind::Dir),
    ("/.dockerinit", MountKind::File),
    ("/.dockerenv", MountKind::File),
    ("/etc/resolv.conf", MountKind::File),
    ("/etc/hosts", MountKind::File),
    ("/etc/hostname", MountKind::File),
    ("/dev/console", MountKind::File),
    ("/etc/mtab", MountKind::Symlink("/proc/mounts")),
];

/// Populate `root` with the fixed mountpoint set.
///
/// Conflicting path segments are unlinked, parents are created 0755, and
/// entries that already exist with the right kind are left alone, so the
/// call is idempotent.
pub fn setup_init_layer(root: &Utf8Path) -> Result<()> {
    for (path, kind) in INIT_LAYER {
        let rel = Utf8Path::new(path.trim_start_matches('/'));
        let dest = root.join(rel);

        if let Some(parent) = rel.parent()
            && !parent.as_str().is_empty()
        {
            // A non-directory squatting on a parent segment blocks the
            // whole subtree; clear such segments before creating parents.
            let mut prefix = root.to_path_buf();
            for comp in parent.components() {
                prefix.push(comp.as_str());
                if let Ok(meta) = prefix.symlink_metadata()
                    && !meta.is_dir()
                {
                    fs::remove_file(&prefix)
                        .with_context(|| format!("clearing conflicting entry {prefix}"))?;
                }
            }
            DirBuilder::new()
                .recursive(true)
                .mode(0o755)
                .create(root.join(parent).as_std_path())
                .with_context(|| format!("creating parent directories of {dest}"))?;
        }

        if let Ok(meta) = dest.symlink_metadata() {
            let correct_kind = match kind {
                MountKind::Dir => meta.is_dir(),
                MountKind::File => meta.is_file(),
                MountKind::Symlink(target) => {
                    meta.file_type().is_symlink()
                        && dest
                            .read_link_utf8()
                            .map(|t| t == *target)
                            .unwrap_or(false)
                }
            };
            if correct_kind {
                continue;
            }
            if meta.is_dir() {
                fs::remove_dir_all(&dest)
                    .with_context(|| format!("clearing conflicting directory {dest}"))?;
            } else {
                fs::remove_file(&dest)
                    .with_context(|| format!("clearing conflicting entry {dest}"))?;
            }
        }

        match kind {
            MountKind::Dir => {
                DirBuilder::new()
                    .recursive(true)
                    .mode(0o755)
                    .create(dest.as_std_path())
                    .with_context(|| format!("creating directory {dest}"))?;
            }
            MountKind::File => {
                File::create(&dest).with_context(|| format!("creating file {dest}"))?;
            }
            MountKind::Symlink(target) => {
                symlink(target, &dest).with_context(|| format!("creating symlink {dest}"))?;
            }
        }
        debug!(path = %dest, "created init layer entry");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    fn init_root() -> (tempfile::TempDir, Utf8PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        (tmp, root)
    }

    #[test]
    fn test_creates_all_entries() {
        let (_tmp, root) = init_root();
        setup_init_layer(&root).unwrap();

        for dir in ["dev/pts", "dev/shm", "proc", "sys"] {
            assert!(root.join(dir).is_dir(), "missing directory {dir}");
        }
        for file in [
            ".dockerinit",
            ".dockerenv",
            "etc/resolv.conf",
            "etc/hosts",
            "etc/hostname",
            "dev/console",
        ] {
            let meta = root.join(file).symlink_metadata().unwrap();
            assert!(meta.is_file(), "missing file {file}");
            assert_eq!(meta.len(), 0, "{file} is not empty");
        }
        let mtab = root.join("etc/mtab");
        assert!(mtab.symlink_metadata().unwrap().file_type().is_symlink());
        assert_eq!(mtab.read_link_utf8().unwrap(), "/proc/mounts");
    }

    #[test]
    fn test_idempotent() {
        let (_tmp, root) = init_root();
        setup_init_layer(&root).unwrap();
        setup_init_layer(&root).unwrap();
        assert!(root.join("dev/pts").is_dir());
        assert_eq!(root.join("etc/mtab").read_link_utf8().unwrap(), "/proc/mounts");
    }

    #[test]
    fn test_conflicting_entries_are_replaced() {
        let (_tmp, root) = init_root();
        // A file where the `dev` directory belongs, and a directory where
        // the `hosts` file belongs.
        fs::write(root.join("dev"), "not a directory").unwrap();
        fs::create_dir_all(root.join("etc/hosts")).unwrap();

        setup_init_layer(&root).unwrap();

        assert!(root.join("dev/pts").is_dir());
        assert!(root.join("etc/hosts").is_file());
    }
}
