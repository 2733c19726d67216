//! Filesystem helpers shared by workspaces, backups and conflict scans.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;
use walkdir::WalkDir;

/// Copy the tree at `src` into `dst`, skipping every entry whose path
/// relative to `src` satisfies `skip`. Skipped directories are not entered.
/// Returns the number of files copied.
pub fn copy_tree<F>(src: &Path, dst: &Path, skip: F) -> io::Result<usize>
where
    F: Fn(&Path) -> bool,
{
    fs::create_dir_all(dst)?;
    let mut copied = 0;
    let walker = WalkDir::new(src).min_depth(1).into_iter().filter_entry(|entry| {
        entry
            .path()
            .strip_prefix(src)
            .map(|rel| !skip(rel))
            .unwrap_or(true)
    });
    for entry in walker {
        let entry = entry.map_err(walk_error)?;
        let rel = match entry.path().strip_prefix(src) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    debug!(src = %src.display(), dst = %dst.display(), copied, "copied tree");
    Ok(copied)
}

/// Make `dst` an exact copy of `src`, deleting anything in `dst` that `src`
/// lacks. Paths listed in `protected` (absolute, inside `dst`) are neither
/// deleted nor overwritten. Running it twice gives the same tree.
pub fn mirror_tree(src: &Path, dst: &Path, protected: &[PathBuf]) -> io::Result<()> {
    let is_protected = |p: &Path| protected.iter().any(|q| p.starts_with(q));
    fs::create_dir_all(dst)?;

    // Remove extras first, deepest entries before their parents.
    let mut extras = Vec::new();
    for entry in WalkDir::new(dst)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| !is_protected(e.path()))
    {
        let entry = entry.map_err(walk_error)?;
        let rel = match entry.path().strip_prefix(dst) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => continue,
        };
        let counterpart = src.join(&rel);
        let keep = if entry.file_type().is_dir() {
            counterpart.is_dir()
        } else {
            counterpart.is_file()
        };
        if !keep {
            extras.push((entry.path().to_path_buf(), entry.file_type().is_dir()));
        }
    }
    for (path, is_dir) in extras.into_iter().rev() {
        if !path.exists() {
            continue;
        }
        if is_dir {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }

    copy_tree(src, dst, |rel| is_protected(&dst.join(rel)))?;
    Ok(())
}

/// Hex SHA-256 of a file's bytes.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let bytes = fs::read(path)?;
    Ok(hash_bytes(&bytes))
}

/// Hex SHA-256 of a byte slice.
pub fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Write `contents` to `path` atomically (temp file in the same directory,
/// then rename).
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Append one line to a newline-delimited log, creating it if needed.
pub fn append_line(path: &Path, line: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    Ok(())
}

/// Move a directory, falling back to copy-and-delete across filesystems.
pub fn move_dir(src: &Path, dst: &Path) -> io::Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if src.is_dir() && !dst.exists() => {
            debug!(error = %e, "rename failed, copying instead");
            copy_tree(src, dst, |_| false)?;
            fs::remove_dir_all(src)
        }
        Err(e) => Err(e),
    }
}

/// Regular files under `dir`, recursively.
pub fn count_files(dir: &Path) -> usize {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .count()
}

/// Regular files directly inside `dir` whose name ends with `extension`,
/// as (file name, path) pairs sorted by name. A missing directory is empty.
pub fn list_files(dir: &Path, extension: &str) -> io::Result<Vec<(String, PathBuf)>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.ends_with(extension) {
            files.push((name, entry.path()));
        }
    }
    files.sort();
    Ok(files)
}

fn walk_error(e: walkdir::Error) -> io::Error {
    let msg = e.to_string();
    e.into_io_error()
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, msg))
}
