use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// Lists plugin executable candidates under `dir`.
///
/// Any regular file with executable permission bits (or an `exe` extension
/// on Windows) is a candidate; richer metadata only exists after the
/// process is started and asked for its details. Unreadable entries are
/// skipped, a missing directory yields an empty list, and the result is
/// sorted so bootstrap registers plugins in a stable order.
pub fn discover_plugins(dir: impl AsRef<Path>) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for entry in WalkDir::new(dir.as_ref())
        .follow_links(false)
        .max_depth(2)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        if is_executable(entry.path()) {
            out.push(entry.path().to_path_buf());
        }
    }
    out.sort();
    out
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("exe"))
        .unwrap_or(false)
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    fn touch(path: &Path, mode: u32) {
        std::fs::write(path, b"#!/bin/sh\n").expect("write file");
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .expect("set permissions");
    }

    #[test]
    fn finds_only_executable_regular_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        touch(&dir.path().join("b-plugin"), 0o755);
        touch(&dir.path().join("a-plugin"), 0o755);
        touch(&dir.path().join("notes.txt"), 0o644);
        std::fs::create_dir(dir.path().join("sub")).expect("mkdir");
        touch(&dir.path().join("sub/c-plugin"), 0o700);

        let found = discover_plugins(dir.path());
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a-plugin", "b-plugin", "c-plugin"]);
    }

    #[test]
    fn missing_directory_yields_empty_list() {
        let dir = tempfile::tempdir().expect("tempdir");
        let gone = dir.path().join("no-such-dir");
        assert!(discover_plugins(&gone).is_empty());
    }
}
