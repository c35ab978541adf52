//! Master-side metadata store: file name -> partition placements, persisted
//! as a flat text file rewritten after every mutation.
//!
//! File format, one line per file:
//! ```text
//! notes.txt={[0,127.0.0.1,7001], [0,127.0.0.1,7002], [1,127.0.0.1,7002]}
//! ```

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::node::NodeAddr;
use crate::utils::SplitfsError;

use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Upload generation a record belongs to. Records reloaded from disk carry
/// generation 0; live uploads are numbered from 1.
pub type UploadId = u64;

/// One physical copy of a partition.
#[derive(Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Clone)]
pub struct Placement {
    pub index: usize,
    pub node: NodeAddr,
}

/// Metadata of one stored file.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct FileRecord {
    /// Number of partitions the upload was split into.
    pub partitions: usize,

    /// Upload generation that produced the placements.
    pub upload: UploadId,

    /// Placements in confirmation order; several may share an index.
    pub placements: Vec<Placement>,
}

impl FileRecord {
    /// Placements holding the given partition index, in confirmation order.
    pub fn placements_of(&self, index: usize) -> Vec<&Placement> {
        self.placements.iter().filter(|p| p.index == index).collect()
    }
}

/// In-memory metadata map together with its backing file.
#[derive(Debug)]
pub struct MetadataStore {
    /// Path of the persistence file.
    path: PathBuf,

    /// Map from file name -> record.
    files: BTreeMap<String, FileRecord>,
}

impl MetadataStore {
    /// Loads the store from its persistence file; an absent file means an
    /// empty store.
    pub async fn load(path: &Path) -> Result<Self, SplitfsError> {
        let files = match fs::read_to_string(path).await {
            Ok(text) => {
                let files = Self::parse(&text)?;
                pf_info!(
                    "loaded metadata of {} file(s) from '{}'",
                    files.len(),
                    path.display()
                );
                files
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                pf_info!(
                    "no metadata file '{}' found, starting fresh",
                    path.display()
                );
                BTreeMap::new()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(MetadataStore {
            path: path.into(),
            files,
        })
    }

    pub fn get(&self, file: &str) -> Option<&FileRecord> {
        self.files.get(file)
    }

    /// All records ordered by file name.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &FileRecord)> {
        self.files.iter()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Records a confirmed placement and persists. A placement of a newer
    /// upload generation replaces the previous record of the same file;
    /// one of an older generation is dropped. Returns whether the placement
    /// was recorded. On persistence failure the in-memory state is rolled
    /// back.
    pub async fn add_placement(
        &mut self,
        file: &str,
        upload: UploadId,
        partitions: usize,
        placement: Placement,
    ) -> Result<bool, SplitfsError> {
        if placement.index >= partitions {
            return Err(SplitfsError::MalformedCommand(format!(
                "partition {} out of {} for '{}'",
                placement.index, partitions, file
            )));
        }

        let prev = self.files.get(file).cloned();
        match prev.as_ref() {
            Some(record) if upload < record.upload => {
                pf_debug!(
                    "dropping stale placement of '{}' partition {} \
                     (upload {} < {})",
                    file,
                    placement.index,
                    upload,
                    record.upload
                );
                return Ok(false);
            }
            Some(record) if record.upload == upload => {
                if record.placements.contains(&placement) {
                    return Ok(false);
                }
                if let Some(record) = self.files.get_mut(file) {
                    record.placements.push(placement);
                }
            }
            _ => {
                self.files.insert(
                    file.into(),
                    FileRecord {
                        partitions,
                        upload,
                        placements: vec![placement],
                    },
                );
            }
        }

        if let Err(e) = self.persist().await {
            self.restore(file, prev);
            return Err(e);
        }
        Ok(true)
    }

    /// Drops a file's record and persists. Returns the dropped record, or
    /// `None` if there was none.
    pub async fn remove(
        &mut self,
        file: &str,
    ) -> Result<Option<FileRecord>, SplitfsError> {
        let Some(prev) = self.files.remove(file) else {
            return Ok(None);
        };
        if let Err(e) = self.persist().await {
            self.restore(file, Some(prev));
            return Err(e);
        }
        Ok(Some(prev))
    }

    fn restore(&mut self, file: &str, prev: Option<FileRecord>) {
        match prev {
            Some(record) => {
                self.files.insert(file.into(), record);
            }
            None => {
                self.files.remove(file);
            }
        }
    }

    /// Rewrites the persistence file: write a sibling temp file, sync it,
    /// then rename it over the real one.
    pub async fn persist(&self) -> Result<(), SplitfsError> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir).await?;
            }
        }

        let mut tmp_path = self.path.clone().into_os_string();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);

        let mut tmp = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .await?;
        tmp.write_all(self.render().as_bytes()).await?;
        tmp.sync_all().await?;
        drop(tmp);

        fs::rename(&tmp_path, &self.path).await?;
        pf_trace!("persisted metadata to '{}'", self.path.display());
        Ok(())
    }

    /// Renders the whole map in the persistence text format.
    pub fn render(&self) -> String {
        let mut text = String::new();
        for (file, record) in &self.files {
            let entries: Vec<String> = record
                .placements
                .iter()
                .map(|p| {
                    format!("[{},{},{}]", p.index, p.node.host, p.node.port)
                })
                .collect();
            text.push_str(file);
            text.push_str("={");
            text.push_str(&entries.join(", "));
            text.push_str("}\n");
        }
        text
    }

    /// Parses the persistence text format. Partition counts are derived per
    /// file as its highest index plus one.
    pub fn parse(
        text: &str,
    ) -> Result<BTreeMap<String, FileRecord>, SplitfsError> {
        let mut files = BTreeMap::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let corrupt = |what: &str| {
                SplitfsError::msg(format!(
                    "corrupt metadata line {}: {} in '{}'",
                    lineno + 1,
                    what,
                    line
                ))
            };

            let (file, body) =
                line.split_once('=').ok_or_else(|| corrupt("missing '='"))?;
            let file = file.trim();
            if file.is_empty() {
                return Err(corrupt("empty file name"));
            }
            let body = body
                .trim()
                .strip_prefix('{')
                .and_then(|b| b.strip_suffix('}'))
                .ok_or_else(|| corrupt("missing braces"))?;

            let mut placements = Vec::new();
            let mut rest = body;
            while let Some(open) = rest.find('[') {
                let close = rest[open..]
                    .find(']')
                    .ok_or_else(|| corrupt("unclosed '['"))?
                    + open;
                let fields: Vec<&str> =
                    rest[open + 1..close].split(',').map(str::trim).collect();
                if fields.len() != 3 {
                    return Err(corrupt("placement without 3 fields"));
                }
                placements.push(Placement {
                    index: fields[0]
                        .parse()
                        .map_err(|_| corrupt("bad partition index"))?,
                    node: NodeAddr::new(
                        fields[1],
                        fields[2].parse().map_err(|_| corrupt("bad port"))?,
                    ),
                });
                rest = &rest[close + 1..];
            }
            if placements.is_empty() {
                return Err(corrupt("no placements"));
            }

            let partitions =
                placements.iter().map(|p| p.index).max().unwrap_or(0) + 1;
            files.insert(
                file.to_string(),
                FileRecord {
                    partitions,
                    upload: 0,
                    placements,
                },
            );
        }
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    async fn fresh_path(path: &str) -> Result<PathBuf, SplitfsError> {
        if fs::try_exists(path).await? {
            fs::remove_file(path).await?;
        }
        Ok(PathBuf::from(path))
    }

    fn placement(index: usize, port: u16) -> Placement {
        Placement {
            index,
            node: NodeAddr::new("127.0.0.1", port),
        }
    }

    #[tokio::test]
    async fn load_absent_is_empty() -> Result<(), SplitfsError> {
        let path = fresh_path("/tmp/splitfs-test-meta-0.dat").await?;
        let store = MetadataStore::load(&path).await?;
        assert!(store.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn persist_and_reload() -> Result<(), SplitfsError> {
        let path =
            fresh_path("/tmp/splitfs-test-meta-1/master_data.dat").await?;
        let mut store = MetadataStore::load(&path).await?;
        assert!(store.add_placement("a.txt", 1, 2, placement(0, 7001)).await?);
        assert!(store.add_placement("a.txt", 1, 2, placement(0, 7002)).await?);
        assert!(store.add_placement("a.txt", 1, 2, placement(1, 7002)).await?);
        assert!(!store.add_placement("a.txt", 1, 2, placement(1, 7002)).await?);
        assert!(store.add_placement("b.log", 2, 1, placement(0, 7003)).await?);

        let text = fs::read_to_string(&path).await?;
        assert_eq!(
            text,
            "a.txt={[0,127.0.0.1,7001], [0,127.0.0.1,7002], [1,127.0.0.1,7002]}\n\
             b.log={[0,127.0.0.1,7003]}\n"
        );

        let reloaded = MetadataStore::load(&path).await?;
        assert_eq!(reloaded.len(), 2);
        for (file, record) in store.iter() {
            let other = reloaded.get(file).ok_or(SplitfsError::NotFound(
                file.clone(),
            ))?;
            assert_eq!(other.partitions, record.partitions);
            let a: BTreeSet<_> = record.placements.iter().collect();
            let b: BTreeSet<_> = other.placements.iter().collect();
            assert_eq!(a, b);
        }
        Ok(())
    }

    #[tokio::test]
    async fn newer_upload_replaces() -> Result<(), SplitfsError> {
        let path = fresh_path("/tmp/splitfs-test-meta-2.dat").await?;
        let mut store = MetadataStore::load(&path).await?;
        store.add_placement("a.txt", 1, 2, placement(0, 7001)).await?;
        store.add_placement("a.txt", 1, 2, placement(1, 7002)).await?;
        store.add_placement("a.txt", 5, 1, placement(0, 7003)).await?;
        let record = store.get("a.txt").cloned();
        assert_eq!(
            record,
            Some(FileRecord {
                partitions: 1,
                upload: 5,
                placements: vec![placement(0, 7003)],
            })
        );
        assert!(store
            .add_placement("a.txt", 5, 1, placement(3, 7003))
            .await
            .is_err());
        Ok(())
    }

    #[tokio::test]
    async fn interleaved_uploads_keep_newest() -> Result<(), SplitfsError> {
        let path = fresh_path("/tmp/splitfs-test-meta-5.dat").await?;
        let mut store = MetadataStore::load(&path).await?;
        assert!(store.add_placement("f", 1, 2, placement(0, 1)).await?);
        assert!(store.add_placement("f", 2, 2, placement(0, 2)).await?);
        assert!(!store.add_placement("f", 1, 2, placement(1, 1)).await?);
        assert!(store.add_placement("f", 2, 2, placement(1, 2)).await?);
        assert_eq!(
            store.get("f").cloned(),
            Some(FileRecord {
                partitions: 2,
                upload: 2,
                placements: vec![placement(0, 2), placement(1, 2)],
            })
        );
        let reloaded = MetadataStore::load(&path).await?;
        assert_eq!(reloaded.get("f").map(|r| r.placements.len()), Some(2));
        Ok(())
    }

    #[tokio::test]
    async fn remove_record() -> Result<(), SplitfsError> {
        let path = fresh_path("/tmp/splitfs-test-meta-3.dat").await?;
        let mut store = MetadataStore::load(&path).await?;
        store.add_placement("a.txt", 1, 1, placement(0, 7001)).await?;
        assert!(store.remove("a.txt").await?.is_some());
        assert!(store.remove("a.txt").await?.is_none());
        assert_eq!(fs::read_to_string(&path).await?, "");
        assert!(MetadataStore::load(&path).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn failed_persist_rolls_back() -> Result<(), SplitfsError> {
        // parent "directory" is a regular file, so persisting must fail
        let blocker = fresh_path("/tmp/splitfs-test-meta-4.blocker").await?;
        fs::write(&blocker, "x").await?;
        let mut store = MetadataStore {
            path: blocker.join("master_data.dat"),
            files: BTreeMap::new(),
        };
        assert!(store
            .add_placement("a.txt", 1, 1, placement(0, 7001))
            .await
            .is_err());
        assert!(store.get("a.txt").is_none());
        Ok(())
    }

    #[test]
    fn parse_derives_partitions_per_file() -> Result<(), SplitfsError> {
        let files = MetadataStore::parse(
            "big={[0,h,1], [4,h,2]}\n\nsmall={[0,h,1],[1, h ,2]}\n",
        )?;
        assert_eq!(files["big"].partitions, 5);
        assert_eq!(files["small"].partitions, 2);
        assert_eq!(
            files["small"].placements_of(1),
            vec![&Placement {
                index: 1,
                node: NodeAddr::new("h", 2)
            }]
        );
        Ok(())
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(MetadataStore::parse("nobraces").is_err());
        assert!(MetadataStore::parse("a={[0,h]}").is_err());
        assert!(MetadataStore::parse("a={[x,h,1]}").is_err());
        assert!(MetadataStore::parse("a={[0,h,1}").is_err());
        assert!(MetadataStore::parse("a={}").is_err());
    }
}
