//! Repository file listings for the mention picker and the cwd chooser.
//!
//! Uses the same tree walker as ripgrep (`ignore`), so `.gitignore`,
//! `.ignore` and global excludes are honored without extra configuration.

use std::num::NonZero;
use std::path::Path;

use ignore::WalkBuilder;
use serde::Serialize;

use fws_protocol::Result;

#[derive(Debug, Clone, Serialize)]
pub struct FileSearchResults {
    pub matches: Vec<String>,
    pub total_match_count: usize,
    pub truncated: bool,
}

/// Case-insensitive substring search over repository-relative paths.
/// The walk stops early once `limit` matches are collected beyond the point
/// of counting the remainder.
pub fn search(root: &Path, query: &str, limit: NonZero<usize>) -> Result<FileSearchResults> {
    let needle = query.to_lowercase();
    let mut matches = Vec::new();
    let mut total_match_count = 0usize;

    for entry in WalkBuilder::new(root).build() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        if entry.file_type().is_some_and(|ft| ft.is_dir()) {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        let Some(rel) = rel.to_str() else {
            continue;
        };
        if needle.is_empty() || rel.to_lowercase().contains(&needle) {
            total_match_count += 1;
            if matches.len() < limit.get() {
                matches.push(rel.to_string());
            }
        }
    }

    matches.sort();
    let truncated = total_match_count > matches.len();
    Ok(FileSearchResults {
        matches,
        total_match_count,
        truncated,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct DirListing {
    pub path: String,
    pub entries: Vec<DirEntryInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DirEntryInfo {
    pub name: String,
    pub is_dir: bool,
}

/// One-level directory listing for the cwd picker; directories first, each
/// group sorted by name.
pub fn list_dir(path: &Path) -> Result<DirListing> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let is_dir = entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false);
        entries.push(DirEntryInfo { name, is_dir });
    }
    entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then(a.name.cmp(&b.name)));
    Ok(DirListing {
        path: path.to_string_lossy().into_owned(),
        entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn limit(n: usize) -> NonZero<usize> {
        NonZero::new(n).unwrap()
    }

    #[test]
    fn search_honors_gitignore() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::create_dir_all(root.join("target")).unwrap();
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::write(root.join(".gitignore"), "target/\n").unwrap();
        std::fs::write(root.join("src/main.rs"), "fn main() {}\n").unwrap();
        std::fs::write(root.join("target/main.rs"), "ignored\n").unwrap();

        let results = search(root, "main", limit(10)).unwrap();
        assert_eq!(results.matches, vec!["src/main.rs".to_string()]);
        assert!(!results.truncated);
    }

    #[test]
    fn search_caps_and_reports_truncation() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            std::fs::write(dir.path().join(format!("note{i}.txt")), "x").unwrap();
        }
        let results = search(dir.path(), "note", limit(2)).unwrap();
        assert_eq!(results.matches.len(), 2);
        assert_eq!(results.total_match_count, 5);
        assert!(results.truncated);
    }

    #[test]
    fn list_dir_orders_directories_first() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("zdir")).unwrap();
        std::fs::write(dir.path().join("afile"), "x").unwrap();
        let listing = list_dir(dir.path()).unwrap();
        assert_eq!(listing.entries[0].name, "zdir");
        assert!(listing.entries[0].is_dir);
        assert_eq!(listing.entries[1].name, "afile");
    }
}
