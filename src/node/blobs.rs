//! Node-local partition blob storage.

use std::io::ErrorKind;
use std::path::PathBuf;

use crate::utils::SplitfsError;

use tokio::fs;

/// Checks that a file name can be used both as a blob name prefix and as a
/// key of the metadata text format.
pub fn validate_file_name(file: &str) -> Result<(), SplitfsError> {
    if file.is_empty() {
        return Err(SplitfsError::MalformedCommand("empty file name".into()));
    }
    if file == "." || file == ".." {
        return Err(SplitfsError::MalformedCommand(format!(
            "illegal file name '{}'",
            file
        )));
    }
    if let Some(c) = file.chars().find(|&c| {
        c.is_whitespace()
            || c.is_control()
            || matches!(c, '/' | '\\' | '=' | '[' | ']' | '{' | '}' | ',')
    }) {
        return Err(SplitfsError::MalformedCommand(format!(
            "illegal character {:?} in file name '{}'",
            c, file
        )));
    }
    Ok(())
}

/// Directory of partition blobs, one plain text file per partition copy
/// named `<file>_part<index>.txt`.
#[derive(Debug)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        BlobStore { root: root.into() }
    }

    /// Blob file name of the given partition.
    pub fn blob_name(file: &str, index: usize) -> String {
        format!("{}_part{}.txt", file, index)
    }

    /// Whether a directory entry name is a blob of `file` (any index).
    fn is_blob_of(name: &str, file: &str) -> bool {
        name.strip_prefix(file)
            .and_then(|rest| rest.strip_prefix("_part"))
            .and_then(|rest| rest.strip_suffix(".txt"))
            .is_some_and(|idx| {
                !idx.is_empty() && idx.chars().all(|c| c.is_ascii_digit())
            })
    }

    /// Writes a partition blob, overwriting any previous one of the same
    /// name. Creates the root directory if absent.
    pub async fn store(
        &self,
        file: &str,
        index: usize,
        content: &str,
    ) -> Result<(), SplitfsError> {
        validate_file_name(file)?;
        fs::create_dir_all(&self.root).await?;
        fs::write(self.root.join(Self::blob_name(file, index)), content)
            .await?;
        Ok(())
    }

    /// Reads a partition blob back. Returns `Ok(None)` if absent.
    pub async fn fetch(
        &self,
        file: &str,
        index: usize,
    ) -> Result<Option<String>, SplitfsError> {
        validate_file_name(file)?;
        match fs::read_to_string(self.root.join(Self::blob_name(file, index)))
            .await
        {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes every blob of `file` held here. Returns the number of blobs
    /// removed; a missing root directory counts as nothing to remove.
    pub async fn delete_file(&self, file: &str) -> Result<usize, SplitfsError> {
        validate_file_name(file)?;
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !Self::is_blob_of(name, file) {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => {
                    pf_debug!("deleted blob '{}'", name);
                    removed += 1;
                }
                Err(e) => pf_warn!("failed to delete blob '{}': {}", name, e),
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fresh_store(dir: &str) -> Result<BlobStore, SplitfsError> {
        if fs::try_exists(dir).await? {
            fs::remove_dir_all(dir).await?;
        }
        Ok(BlobStore::new(dir))
    }

    #[test]
    fn file_name_rules() {
        assert!(validate_file_name("notes.txt").is_ok());
        assert!(validate_file_name("data_2024-01.csv").is_ok());
        assert!(validate_file_name("").is_err());
        assert!(validate_file_name("..").is_err());
        assert!(validate_file_name("a/b").is_err());
        assert!(validate_file_name("a b").is_err());
        assert!(validate_file_name("x=y").is_err());
        assert!(validate_file_name("[0]").is_err());
    }

    #[test]
    fn blob_matching() {
        assert!(BlobStore::is_blob_of("a_part0.txt", "a"));
        assert!(BlobStore::is_blob_of("a_part12.txt", "a"));
        assert!(!BlobStore::is_blob_of("a_partX_part0.txt", "a"));
        assert!(!BlobStore::is_blob_of("ab_part0.txt", "a"));
        assert!(!BlobStore::is_blob_of("a_part.txt", "a"));
        assert!(BlobStore::is_blob_of("a_partX_part0.txt", "a_partX"));
    }

    #[tokio::test]
    async fn store_fetch_overwrite() -> Result<(), SplitfsError> {
        let store = fresh_store("/tmp/splitfs-test-blobs-1").await?;
        assert_eq!(store.fetch("f.txt", 0).await?, None);
        store.store("f.txt", 0, "one\ntwo\n").await?;
        assert_eq!(store.fetch("f.txt", 0).await?, Some("one\ntwo\n".into()));
        store.store("f.txt", 0, "three\n").await?;
        assert_eq!(store.fetch("f.txt", 0).await?, Some("three\n".into()));
        store.store("f.txt", 1, "").await?;
        assert_eq!(store.fetch("f.txt", 1).await?, Some(String::new()));
        Ok(())
    }

    #[tokio::test]
    async fn delete_by_file_name() -> Result<(), SplitfsError> {
        let store = fresh_store("/tmp/splitfs-test-blobs-2").await?;
        assert_eq!(store.delete_file("f").await?, 0);
        store.store("f", 0, "a\n").await?;
        store.store("f", 3, "b\n").await?;
        store.store("f_partX", 0, "c\n").await?;
        store.store("g", 0, "d\n").await?;
        assert_eq!(store.delete_file("f").await?, 2);
        assert_eq!(store.fetch("f", 0).await?, None);
        assert_eq!(store.fetch("f", 3).await?, None);
        assert_eq!(store.fetch("f_partX", 0).await?, Some("c\n".into()));
        assert_eq!(store.fetch("g", 0).await?, Some("d\n".into()));
        assert_eq!(store.delete_file("f").await?, 0);
        Ok(())
    }
}
