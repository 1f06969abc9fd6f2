use anyhow::{bail, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

/// Result of walking a dataset directory.
#[derive(Debug, Default)]
pub struct Discovery {
    /// Matching spreadsheets, in file-name order per directory.
    pub files: Vec<PathBuf>,
    /// Entries the walk could not read. The walk carries on past them.
    pub errors: Vec<String>,
}

/// Walk `root` fully and collect every file whose extension is in `extensions`
/// (compared case-insensitively). Excel lock files (`~$name.xlsx`) are skipped.
#[instrument(level = "debug", skip(extensions), fields(root = %root.display()))]
pub fn discover_files(root: &Path, extensions: &[String]) -> Result<Discovery> {
    if !root.is_dir() {
        bail!("dataset directory {} does not exist", root.display());
    }

    let mut out = Discovery::default();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "skipping unreadable entry");
                out.errors.push(e.to_string());
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let matches = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| extensions.iter().any(|want| want.eq_ignore_ascii_case(e)))
            .unwrap_or(false);
        if !matches {
            continue;
        }
        let is_lock_file = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with("~$"))
            .unwrap_or(false);
        if is_lock_file {
            debug!(path = %path.display(), "skipping lock file");
            continue;
        }
        out.files.push(path.to_path_buf());
    }

    debug!(files = out.files.len(), errors = out.errors.len(), "discovery done");
    Ok(out)
}

/// File name shown in logs and the validation report.
pub fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn xlsx() -> Vec<String> {
        vec!["xlsx".to_string()]
    }

    #[test]
    fn walks_subdirectories_and_filters_extensions() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("2022/jan")).unwrap();
        fs::write(root.join("b.xlsx"), b"").unwrap();
        fs::write(root.join("a.XLSX"), b"").unwrap();
        fs::write(root.join("notes.txt"), b"").unwrap();
        fs::write(root.join("~$b.xlsx"), b"").unwrap();
        fs::write(root.join("2022/jan/c.xlsx"), b"").unwrap();
        fs::create_dir_all(root.join("folder.xlsx")).unwrap();

        let found = discover_files(root, &xlsx()).unwrap();
        let names: Vec<String> = found.files.iter().map(|p| display_name(p)).collect();
        // depth-first, siblings sorted by name
        assert_eq!(names, vec!["c.xlsx", "a.XLSX", "b.xlsx"]);
        assert!(found.errors.is_empty());
    }

    #[test]
    fn missing_root_is_an_error() {
        let dir = tempdir().unwrap();
        let err = discover_files(&dir.path().join("nope"), &xlsx()).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn empty_directory_finds_nothing() {
        let dir = tempdir().unwrap();
        let found = discover_files(dir.path(), &xlsx()).unwrap();
        assert!(found.files.is_empty());
    }
}
