use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::KiraError;

/// Prefix of per-run scratch folders; anything carrying it is disposable.
pub const TEMP_PREFIX: &str = ".kira-tmp";

const READ_SUFFIXES: [&str; 4] = [".fastq.gz", ".fq.gz", ".fastq", ".fq"];

pub fn fs_err(err: io::Error) -> KiraError {
    KiraError::Filesystem(err.to_string())
}

pub fn is_read_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| {
            !name.starts_with('.') && READ_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
        })
        .unwrap_or(false)
}

pub fn is_gzip_name(path: &Path) -> bool {
    path.extension()
        .and_then(|value| value.to_str())
        .map(|value| value.eq_ignore_ascii_case("gz"))
        .unwrap_or(false)
}

/// Read files directly inside `dir`, sorted by file name. A missing
/// directory yields an empty list.
pub fn list_read_files(dir: &Path) -> Result<Vec<PathBuf>, KiraError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(fs_err)? {
        let path = entry.map_err(fs_err)?.path();
        if path.is_file() && is_read_file(&path) {
            files.push(path);
        }
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

/// All read files below `root`, skipping any directory named in `exclude`.
pub fn walk_read_files(root: &Path, exclude: &[&Path]) -> Result<Vec<PathBuf>, KiraError> {
    let mut out = Vec::new();
    if !root.is_dir() {
        return Ok(out);
    }
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        for entry in fs::read_dir(&path).map_err(fs_err)? {
            let path = entry.map_err(fs_err)?.path();
            if path.is_dir() {
                if !exclude.iter().any(|skip| *skip == path.as_path()) {
                    stack.push(path);
                }
            } else if is_read_file(&path) {
                out.push(path);
            }
        }
    }
    out.sort();
    Ok(out)
}

/// Rename, falling back to copy + remove when source and target sit on
/// different filesystems.
pub fn move_file(from: &Path, to: &Path) -> Result<(), KiraError> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(fs_err)?;
    }
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(from, to).map_err(fs_err)?;
            fs::remove_file(from).map_err(fs_err)
        }
    }
}

/// Remove scratch folders and half-written files an interrupted invocation
/// left behind in `dir`.
/// Returns how many were removed.
pub fn sweep_temp_dirs(dir: &Path) -> Result<usize, KiraError> {
    sweep_prefixed(dir, TEMP_PREFIX)
}

/// Like [`sweep_temp_dirs`], limited to entries whose name starts with
/// `prefix`.
pub fn sweep_prefixed(dir: &Path, prefix: &str) -> Result<usize, KiraError> {
    if !dir.is_dir() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in fs::read_dir(dir).map_err(fs_err)? {
        let path = entry.map_err(fs_err)?.path();
        let is_temp = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.starts_with(prefix))
            .unwrap_or(false);
        if !is_temp {
            continue;
        }
        if path.is_dir() {
            fs::remove_dir_all(&path).map_err(fs_err)?;
        } else {
            fs::remove_file(&path).map_err(fs_err)?;
        }
        removed += 1;
    }
    Ok(removed)
}

pub fn write_bytes_atomic(path: &Path, content: &[u8]) -> Result<(), KiraError> {
    let parent = path
        .parent()
        .ok_or_else(|| KiraError::Filesystem("invalid destination path".to_string()))?;
    fs::create_dir_all(parent).map_err(fs_err)?;
    let temp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(parent)
        .map_err(fs_err)?;
    fs::write(temp.path(), content).map_err(fs_err)?;
    temp.persist(path)
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    Ok(())
}

/// Put the directory `from` in place at `to` with a single rename.
///
/// An existing `to` must be empty; one that still holds entries is an error
/// and `from` is left where it is.
pub fn install_dir(from: &Path, to: &Path) -> Result<(), KiraError> {
    remove_dir_if_empty(to)?;
    if to.exists() {
        return Err(KiraError::Filesystem(format!(
            "{} already holds entries; not replacing it",
            to.display()
        )));
    }
    fs::rename(from, to).map_err(fs_err)
}

/// Remove `dir` if it exists and holds nothing.
pub fn remove_dir_if_empty(dir: &Path) -> Result<bool, KiraError> {
    if !dir.is_dir() {
        return Ok(false);
    }
    let empty = fs::read_dir(dir).map_err(fs_err)?.next().is_none();
    if empty {
        fs::remove_dir(dir).map_err(fs_err)?;
    }
    Ok(empty)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_respects_prefix() {
        let temp = tempfile::tempdir().unwrap();
        fs::create_dir(temp.path().join(".kira-tmp-RUN1-abc")).unwrap();
        fs::create_dir(temp.path().join(".kira-tmp-RUN12-abc")).unwrap();

        assert_eq!(sweep_prefixed(temp.path(), ".kira-tmp-RUN1-").unwrap(), 1);
        assert!(temp.path().join(".kira-tmp-RUN12-abc").is_dir());
    }

    #[test]
    fn install_dir_refuses_occupied_target() {
        let temp = tempfile::tempdir().unwrap();
        let from = temp.path().join("staged");
        let to = temp.path().join("RUN1");
        fs::create_dir(&from).unwrap();
        fs::write(from.join("RUN1_1.fastq.gz"), b"x").unwrap();
        fs::create_dir(&to).unwrap();

        install_dir(&from, &to).unwrap();
        assert!(to.join("RUN1_1.fastq.gz").is_file());
        assert!(!from.exists());

        fs::create_dir(&from).unwrap();
        assert!(install_dir(&from, &to).is_err());
        assert!(from.is_dir());
    }

    #[test]
    fn read_file_suffixes() {
        assert!(is_read_file(Path::new("/x/SRR1_1.fastq.gz")));
        assert!(is_read_file(Path::new("a.fq")));
        assert!(!is_read_file(Path::new("a.fastq.gz.tmp")));
        assert!(!is_read_file(Path::new(".hidden.fastq.gz")));
        assert!(!is_read_file(Path::new("matrix.mtx.gz")));
    }

    #[test]
    fn sweep_removes_only_scratch_entries() {
        let temp = tempfile::tempdir().unwrap();
        fs::create_dir(temp.path().join(".kira-tmpABC")).unwrap();
        fs::create_dir(temp.path().join("keep")).unwrap();
        fs::write(temp.path().join(".kira-tmp-file"), b"x").unwrap();
        fs::write(temp.path().join("SRR1_1.fastq.gz"), b"x").unwrap();

        assert_eq!(sweep_temp_dirs(temp.path()).unwrap(), 2);
        assert!(temp.path().join("keep").exists());
        assert!(temp.path().join("SRR1_1.fastq.gz").exists());
    }

    #[test]
    fn listing_is_sorted_and_flat() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("b_2.fastq.gz"), b"").unwrap();
        fs::write(temp.path().join("a_1.fastq.gz"), b"").unwrap();
        fs::create_dir(temp.path().join("nested")).unwrap();
        fs::write(temp.path().join("nested").join("c.fastq.gz"), b"").unwrap();

        let names: Vec<_> = list_read_files(temp.path())
            .unwrap()
            .into_iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a_1.fastq.gz", "b_2.fastq.gz"]);
        assert_eq!(walk_read_files(temp.path(), &[]).unwrap().len(), 3);
    }
}
