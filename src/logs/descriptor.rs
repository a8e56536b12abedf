//! Mapping of a collected log tree into per-file descriptors.
//!
//! Layout: `<root>/<host>/<component>-<port>/<filename>`.

#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};

use crate::core::errors::{DiagError, Result};

/// One log file inside a collected tree.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct FileDescriptor {
    pub root: PathBuf,
    pub host: String,
    pub folder: String,
    pub filename: String,
}

impl FileDescriptor {
    pub fn new(
        root: impl Into<PathBuf>,
        host: impl Into<String>,
        folder: impl Into<String>,
        filename: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            host: host.into(),
            folder: folder.into(),
            filename: filename.into(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.root
            .join(&self.host)
            .join(&self.folder)
            .join(&self.filename)
    }

    /// Split `{component}-{port}`.
    pub fn parse_folder_name(&self) -> Result<(String, String)> {
        let mut parts = self.folder.split('-');
        match (parts.next(), parts.next()) {
            (Some(component), Some(port)) => Ok((component.to_string(), port.to_string())),
            _ => Err(DiagError::malformed(
                "folder name",
                format!("{:?} is not {{component}}-{{port}}", self.folder),
            )),
        }
    }
}

fn sorted_entries(dir: &Path) -> Result<Vec<fs::DirEntry>> {
    let mut entries = fs::read_dir(dir)
        .map_err(|e| DiagError::io(dir, e))?
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| DiagError::io(dir, e))?;
    entries.sort_by_key(fs::DirEntry::file_name);
    Ok(entries)
}

fn is_dir(entry: &fs::DirEntry) -> bool {
    entry.file_type().is_ok_and(|t| t.is_dir())
}

/// Depth-3 walk. Non-directories at depth 1-2 and directories at depth 3 are
/// ignored. Entries come back in name order.
pub fn resolve_dir(root: &Path) -> Result<Vec<FileDescriptor>> {
    let mut out = Vec::new();
    for host in sorted_entries(root)? {
        if !is_dir(&host) {
            continue;
        }
        let host_name = host.file_name().to_string_lossy().into_owned();
        for folder in sorted_entries(&host.path())? {
            if !is_dir(&folder) {
                continue;
            }
            let folder_name = folder.file_name().to_string_lossy().into_owned();
            for file in sorted_entries(&folder.path())? {
                if is_dir(&file) {
                    continue;
                }
                out.push(FileDescriptor::new(
                    root,
                    host_name.clone(),
                    folder_name.clone(),
                    file.file_name().to_string_lossy().into_owned(),
                ));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn folder_name_splits_component_and_port() {
        let fd = FileDescriptor::new("/r", "10.0.0.1", "tikv-20160", "tikv.log");
        assert_eq!(
            fd.parse_folder_name().unwrap(),
            ("tikv".to_string(), "20160".to_string())
        );
        assert_eq!(fd.path(), PathBuf::from("/r/10.0.0.1/tikv-20160/tikv.log"));
    }

    #[test]
    fn folder_without_dash_is_malformed() {
        let fd = FileDescriptor::new("/r", "h", "tidb", "tidb.log");
        assert_eq!(fd.parse_folder_name().unwrap_err().code(), "DIAG-2001");
    }

    #[test]
    fn resolve_walks_exactly_three_levels() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("h1/tidb-4000/nested")).unwrap();
        fs::create_dir_all(root.join("h2/pd-2379")).unwrap();
        fs::write(root.join("stray.txt"), "x").unwrap();
        fs::write(root.join("h1/stray.txt"), "x").unwrap();
        fs::write(root.join("h1/tidb-4000/tidb.log"), "x").unwrap();
        fs::write(root.join("h1/tidb-4000/tidb_slow_query.log"), "x").unwrap();
        fs::write(root.join("h2/pd-2379/pd.log"), "x").unwrap();

        let found = resolve_dir(root).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|d| format!("{}/{}/{}", d.host, d.folder, d.filename))
            .collect();
        assert_eq!(
            names,
            vec![
                "h1/tidb-4000/tidb.log",
                "h1/tidb-4000/tidb_slow_query.log",
                "h2/pd-2379/pd.log",
            ]
        );
    }

    #[test]
    fn resolve_missing_root_is_io_error() {
        let tmp = TempDir::new().unwrap();
        let err = resolve_dir(&tmp.path().join("absent")).unwrap_err();
        assert_eq!(err.code(), "DIAG-3002");
    }
}
