//! Archive primitives: copying, packing, hashing and removing data trees

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use fs_extra::dir::{self, CopyOptions};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Builder};
use walkdir::{DirEntry, WalkDir};

use super::error::{EngineError, InternalContext, Result};

/// Top-level directory inside .tar.gz archives
const TAR_PREFIX: &str = "data";

/// Summary of a data tree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub size_bytes: u64,
    pub file_count: u64,
}

/// Selects the entries of a data tree that go into an archive
#[derive(Debug, Clone, Default)]
pub struct TreeFilter {
    /// Relative paths the archive is limited to; empty means everything
    items: Vec<PathBuf>,
    /// Matched against each entry's file name
    excludes: Vec<glob::Pattern>,
}

impl TreeFilter {
    /// Everything under the root
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new(items: &[String], excludes: &[String]) -> Result<Self> {
        let excludes = excludes
            .iter()
            .map(|p| glob::Pattern::new(p).internal(|| format!("Invalid exclude pattern: {}", p)))
            .collect::<Result<Vec<_>>>()?;
        let items = items
            .iter()
            .map(|item| {
                Path::new(item)
                    .components()
                    .filter(|c| matches!(c, Component::Normal(_)))
                    .collect::<PathBuf>()
            })
            .filter(|item| !item.as_os_str().is_empty())
            .collect();
        Ok(Self { items, excludes })
    }

    pub fn is_all(&self) -> bool {
        self.items.is_empty() && self.excludes.is_empty()
    }

    /// Whether the entry at `relative` (to the tree root) is kept
    ///
    /// Directories leading to a listed item are kept so the item can be
    /// reached; an excluded directory drops everything below it.
    pub fn includes(&self, relative: &Path, is_dir: bool) -> bool {
        if relative.as_os_str().is_empty() {
            return true;
        }

        let options = glob::MatchOptions {
            case_sensitive: false,
            ..glob::MatchOptions::default()
        };
        if let Some(name) = relative.file_name().and_then(|n| n.to_str()) {
            if self.excludes.iter().any(|p| p.matches_with(name, options)) {
                return false;
            }
        }

        self.items.is_empty()
            || self
                .items
                .iter()
                .any(|item| relative.starts_with(item) || (is_dir && item.starts_with(relative)))
    }

    /// Walk `root` in sorted order, pruning excluded entries
    fn walk<'a>(&'a self, root: &'a Path) -> impl Iterator<Item = walkdir::Result<DirEntry>> + 'a {
        WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |entry| {
                let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
                self.includes(relative, entry.file_type().is_dir())
            })
    }
}

/// Copy the entries of `src` selected by `filter` to a new directory `dst`
/// (which must not exist)
pub fn copy_dir(src: &Path, dst: &Path, filter: &TreeFilter) -> Result<()> {
    if filter.is_all() {
        let options = CopyOptions::new().copy_inside(true);
        dir::copy(src, dst, &options)
            .internal(|| format!("Failed to copy {} to {}", src.display(), dst.display()))?;
        return Ok(());
    }

    for entry in filter.walk(src) {
        let entry = entry.internal(|| format!("Failed to walk: {}", src.display()))?;
        let path = entry.path();
        let relative = path
            .strip_prefix(src)
            .internal(|| format!("Failed to strip prefix from: {}", path.display()))?;
        let target = dst.join(relative);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)
                .internal(|| format!("Failed to create: {}", target.display()))?;
        } else if file_type.is_symlink() {
            copy_symlink(path, &target)?;
        } else {
            fs::copy(path, &target)
                .internal(|| format!("Failed to copy {} to {}", path.display(), target.display()))?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(link: &Path, target: &Path) -> Result<()> {
    let points_to =
        fs::read_link(link).internal(|| format!("Failed to read link: {}", link.display()))?;
    std::os::unix::fs::symlink(&points_to, target)
        .internal(|| format!("Failed to create link: {}", target.display()))
}

#[cfg(not(unix))]
fn copy_symlink(link: &Path, target: &Path) -> Result<()> {
    fs::copy(link, target)
        .internal(|| format!("Failed to copy {} to {}", link.display(), target.display()))?;
    Ok(())
}

/// Pack the entries of `source` selected by `filter` into a new .tar.gz file
/// at `dest`
pub fn write_tar_gz(source: &Path, dest: &Path, filter: &TreeFilter) -> Result<()> {
    let file = File::create(dest).internal(|| format!("Failed to create: {}", dest.display()))?;

    let encoder = GzEncoder::new(file, Compression::default());
    let mut archive = Builder::new(encoder);
    archive.follow_symlinks(false);

    add_dir_to_archive(&mut archive, source, TAR_PREFIX, filter)?;

    let encoder = archive
        .into_inner()
        .internal(|| format!("Failed to finish: {}", dest.display()))?;
    let file = encoder
        .finish()
        .internal(|| format!("Failed to finish: {}", dest.display()))?;
    file.sync_all()
        .internal(|| format!("Failed to flush: {}", dest.display()))?;
    Ok(())
}

/// Add a directory recursively to the archive
fn add_dir_to_archive<W: Write>(
    archive: &mut Builder<W>,
    source: &Path,
    prefix: &str,
    filter: &TreeFilter,
) -> Result<()> {
    for entry in filter.walk(source) {
        let entry = entry.internal(|| format!("Failed to walk: {}", source.display()))?;
        let path = entry.path();
        let relative = path
            .strip_prefix(source)
            .internal(|| format!("Failed to strip prefix from: {}", path.display()))?;

        let archive_path = if relative.as_os_str().is_empty() {
            PathBuf::from(prefix)
        } else {
            PathBuf::from(prefix).join(relative)
        };

        let file_type = entry.file_type();
        if file_type.is_dir() {
            archive
                .append_dir(&archive_path, path)
                .internal(|| format!("Failed to archive: {}", path.display()))?;
        } else if file_type.is_file() || file_type.is_symlink() {
            archive
                .append_path_with_name(path, &archive_path)
                .internal(|| format!("Failed to archive: {}", path.display()))?;
        }
    }
    Ok(())
}

/// Unpack a .tar.gz written by [`write_tar_gz`] into the new directory `dest`
pub fn extract_tar_gz(archive_path: &Path, dest: &Path) -> Result<()> {
    let parent = dest
        .parent()
        .ok_or_else(|| EngineError::Internal(format!("No parent: {}", dest.display())))?;

    // Unpack next to `dest` so the final move is a same-filesystem rename
    let unpack_dir = tempfile::Builder::new()
        .prefix(".unpack-")
        .tempdir_in(parent)
        .internal(|| "Failed to create temp directory")?;

    let file = File::open(archive_path)
        .internal(|| format!("Failed to open: {}", archive_path.display()))?;
    let mut archive = Archive::new(GzDecoder::new(file));
    archive
        .unpack(unpack_dir.path())
        .internal(|| format!("Failed to extract: {}", archive_path.display()))?;

    let extracted = unpack_dir.path().join(TAR_PREFIX);
    if !extracted.is_dir() {
        return Err(EngineError::Internal(format!(
            "Archive has no {}/ directory: {}",
            TAR_PREFIX,
            archive_path.display()
        )));
    }
    fs::rename(&extracted, dest)
        .internal(|| format!("Failed to move extracted data to {}", dest.display()))?;
    Ok(())
}

/// SHA-256 over the entries of a directory tree selected by `filter`:
/// relative paths, entry kinds and contents, visited in sorted order so the
/// result is stable across platforms
pub fn hash_tree(root: &Path, filter: &TreeFilter) -> Result<(String, TreeStats)> {
    if !root.is_dir() {
        return Err(EngineError::Internal(format!(
            "Not a directory: {}",
            root.display()
        )));
    }

    let mut hasher = Sha256::new();
    let mut stats = TreeStats::default();

    for entry in filter.walk(root).skip(1) {
        let entry = entry.internal(|| format!("Failed to walk: {}", root.display()))?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .internal(|| format!("Failed to strip prefix from: {}", entry.path().display()))?;
        let relative = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        let file_type = entry.file_type();
        if file_type.is_dir() {
            hasher.update(b"D\0");
            hasher.update(relative.as_bytes());
            hasher.update(b"\0");
        } else if file_type.is_symlink() {
            let target = fs::read_link(entry.path())
                .internal(|| format!("Failed to read link: {}", entry.path().display()))?;
            hasher.update(b"L\0");
            hasher.update(relative.as_bytes());
            hasher.update(b"\0");
            hasher.update(target.to_string_lossy().as_bytes());
            hasher.update(b"\0");
        } else {
            let mut file = File::open(entry.path())
                .internal(|| format!("Failed to open: {}", entry.path().display()))?;
            hasher.update(b"F\0");
            hasher.update(relative.as_bytes());
            hasher.update(b"\0");
            let len = io::copy(&mut file, &mut hasher)
                .internal(|| format!("Failed to read: {}", entry.path().display()))?;
            hasher.update(len.to_le_bytes());
            stats.size_bytes += len;
            stats.file_count += 1;
        }
    }

    Ok((format!("{:x}", hasher.finalize()), stats))
}

/// SHA-256 of a single file
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).internal(|| format!("Failed to open: {}", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).internal(|| format!("Failed to read: {}", path.display()))?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Calculate total size of the files of a directory selected by `filter`
///
/// Unreadable entries are skipped.
pub fn dir_size(path: &Path, filter: &TreeFilter) -> Result<u64> {
    if !path.is_dir() {
        return Err(EngineError::Internal(format!(
            "Not a directory: {}",
            path.display()
        )));
    }

    Ok(filter
        .walk(path)
        .flatten()
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|metadata| metadata.len())
        .sum())
}

/// Remove a file or directory tree
pub fn remove_path(path: &Path) -> io::Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree(root: &Path) {
        fs::create_dir_all(root.join("User").join("globalStorage")).unwrap();
        fs::create_dir_all(root.join("empty")).unwrap();
        fs::write(root.join("a.txt"), "hello").unwrap();
        fs::write(
            root.join("User").join("globalStorage").join("storage.json"),
            "{}",
        )
        .unwrap();
    }

    #[test]
    fn test_hash_tree_stable_and_sensitive() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("src");
        sample_tree(&root);

        let (first, stats) = hash_tree(&root, &TreeFilter::all()).unwrap();
        let (second, _) = hash_tree(&root, &TreeFilter::all()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert_eq!(stats.file_count, 2);
        assert_eq!(stats.size_bytes, 7);

        fs::write(root.join("a.txt"), "hellO").unwrap();
        let (changed, _) = hash_tree(&root, &TreeFilter::all()).unwrap();
        assert_ne!(first, changed);
    }

    #[test]
    fn test_hash_tree_includes_names() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::create_dir_all(&a).unwrap();
        fs::create_dir_all(&b).unwrap();
        fs::write(a.join("x.txt"), "same").unwrap();
        fs::write(b.join("y.txt"), "same").unwrap();

        assert_ne!(hash_tree(&a, &TreeFilter::all()).unwrap().0, hash_tree(&b, &TreeFilter::all()).unwrap().0);
    }

    #[test]
    fn test_copy_dir_preserves_hash() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        sample_tree(&src);

        copy_dir(&src, &dst, &TreeFilter::all()).unwrap();
        assert_eq!(hash_tree(&src, &TreeFilter::all()).unwrap().0, hash_tree(&dst, &TreeFilter::all()).unwrap().0);
    }

    #[test]
    fn test_tar_gz_preserves_tree() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let packed = dir.path().join("backup.tar.gz");
        let out = dir.path().join("out");
        sample_tree(&src);

        write_tar_gz(&src, &packed, &TreeFilter::all()).unwrap();
        assert_eq!(hash_file(&packed).unwrap().len(), 64);

        extract_tar_gz(&packed, &out).unwrap();
        assert_eq!(fs::read_to_string(out.join("a.txt")).unwrap(), "hello");
        assert!(out.join("empty").is_dir());
        assert_eq!(hash_tree(&src, &TreeFilter::all()).unwrap().0, hash_tree(&out, &TreeFilter::all()).unwrap().0);
        // No unpack directories left behind
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with(".unpack-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_dir_size() {
        let dir = tempfile::tempdir().unwrap();
        sample_tree(dir.path());
        assert_eq!(dir_size(dir.path(), &TreeFilter::all()).unwrap(), 7);
    }

    fn cache_heavy_tree(root: &Path) {
        sample_tree(root);
        fs::create_dir_all(root.join("Cache").join("Cache_Data")).unwrap();
        fs::write(root.join("Cache").join("Cache_Data").join("f_0001"), "cached").unwrap();
        fs::create_dir_all(root.join("logs")).unwrap();
        fs::write(root.join("logs").join("main.LOG"), "log line").unwrap();
        fs::write(root.join("User").join("state.tmp"), "scratch").unwrap();
    }

    fn cache_filter() -> TreeFilter {
        let excludes: Vec<String> = ["Cache", "*.log", "*.tmp"].iter().map(|s| s.to_string()).collect();
        TreeFilter::new(&[], &excludes).unwrap()
    }

    #[test]
    fn test_filter_matches_names_case_insensitively() {
        let filter = cache_filter();
        assert!(filter.includes(Path::new(""), true));
        assert!(filter.includes(Path::new("User/globalStorage"), true));
        assert!(!filter.includes(Path::new("cache"), true));
        assert!(!filter.includes(Path::new("logs/main.LOG"), false));
        assert!(filter.includes(Path::new("logs"), true));

        let items = TreeFilter::new(&["User/globalStorage".to_string()], &[]).unwrap();
        assert!(items.includes(Path::new("User"), true));
        assert!(items.includes(Path::new("User/globalStorage/storage.json"), false));
        assert!(!items.includes(Path::new("User/settings.json"), false));
        assert!(!items.includes(Path::new("a.txt"), false));
    }

    #[test]
    fn test_filter_applies_to_copy_pack_hash_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let plain = dir.path().join("plain");
        let copied = dir.path().join("copied");
        let packed = dir.path().join("backup.tar.gz");
        let unpacked = dir.path().join("unpacked");
        sample_tree(&plain);
        cache_heavy_tree(&src);
        fs::create_dir_all(plain.join("logs")).unwrap();
        let filter = cache_filter();

        copy_dir(&src, &copied, &filter).unwrap();
        write_tar_gz(&src, &packed, &filter).unwrap();
        extract_tar_gz(&packed, &unpacked).unwrap();

        let (expected, expected_stats) = hash_tree(&plain, &TreeFilter::all()).unwrap();
        let (filtered, stats) = hash_tree(&src, &filter).unwrap();
        assert_eq!(filtered, expected);
        assert_eq!(stats, expected_stats);
        assert_eq!(hash_tree(&copied, &TreeFilter::all()).unwrap().0, expected);
        assert_eq!(hash_tree(&unpacked, &TreeFilter::all()).unwrap().0, expected);
        assert!(!copied.join("Cache").exists());
        assert!(!unpacked.join("User").join("state.tmp").exists());

        assert_eq!(dir_size(&src, &filter).unwrap(), 7);
        assert!(dir_size(&src, &TreeFilter::all()).unwrap() > 7);
    }

    #[test]
    fn test_backup_items_limit_the_copy() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        cache_heavy_tree(&src);

        let filter = TreeFilter::new(&["User/globalStorage".to_string(), "missing".to_string()], &[])
            .unwrap();
        copy_dir(&src, &dst, &filter).unwrap();

        assert!(dst.join("User").join("globalStorage").join("storage.json").is_file());
        assert!(!dst.join("User").join("state.tmp").exists());
        assert!(!dst.join("a.txt").exists());
        assert!(!dst.join("Cache").exists());
    }

    #[test]
    fn test_remove_path_file_and_dir() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        let tree = dir.path().join("t");
        fs::write(&file, "x").unwrap();
        sample_tree(&tree);

        remove_path(&file).unwrap();
        remove_path(&tree).unwrap();
        assert!(!file.exists());
        assert!(!tree.exists());
        assert!(remove_path(&file).is_err());
    }
}
