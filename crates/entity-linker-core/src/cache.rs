//! Append-only linking cache.
//!
//! The durable form is a CSV log:
//!
//! ```text
//! entity,linked_entity,description
//! Car,Q1420,motor vehicle
//! Fridolin123xyz,,
//! ```
//!
//! An empty `linked_entity` records a name that was looked up and has no link.
//! Rows are only ever appended; on open the whole log is replayed and the last
//! row for a name wins. A final row cut short by a crash (no terminator, or an
//! unclosed quote) is truncated away before the next append.
//!
//! The in-memory index and the log writer sit behind one `RwLock`. Writers
//! append and update the index inside the same exclusive section, so readers
//! never see an index entry whose row is not yet written.

use crate::error::CacheError;
use crate::model::{CacheLookup, LinkedEntity};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const CACHE_HEADER: [&str; 3] = ["entity", "linked_entity", "description"];

struct CacheState {
    index: HashMap<String, LinkedEntity>,
    log: csv::Writer<File>,
    appended: usize,
}

pub struct PersistentCache {
    path: PathBuf,
    state: RwLock<CacheState>,
}

impl PersistentCache {
    /// Open (or create) the cache log at `path` and replay it into memory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        let io_err = |source| CacheError::Io {
            path: path.clone(),
            source,
        };

        let existing_len = match std::fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(io_err(e)),
        };

        let (index, valid_len) = if existing_len > 0 {
            Self::replay(&path)?
        } else {
            (HashMap::new(), 0)
        };

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;

        if valid_len < existing_len {
            warn!(
                path = %path.display(),
                dropped_bytes = existing_len - valid_len,
                "truncating torn final cache row"
            );
            file.set_len(valid_len).map_err(io_err)?;
        }
        // Header written without its terminator.
        if existing_len > 0 && !ends_with_newline(&mut file).map_err(io_err)? {
            file.write_all(b"\n").map_err(io_err)?;
        }

        let mut log = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if existing_len == 0 {
            log.write_record(CACHE_HEADER).map_err(|source| CacheError::Csv {
                path: path.clone(),
                source,
            })?;
            log.flush().map_err(io_err)?;
        }

        info!(path = %path.display(), entries = index.len(), "opened linking cache");

        Ok(Self {
            path,
            state: RwLock::new(CacheState {
                index,
                log,
                appended: 0,
            }),
        })
    }

    /// Replay the log into an index. Also returns the byte length of the log
    /// up to the last complete row.
    fn replay(path: &Path) -> Result<(HashMap<String, LinkedEntity>, u64), CacheError> {
        let csv_err = |source| CacheError::Csv {
            path: path.to_path_buf(),
            source,
        };

        let bytes = std::fs::read(path).map_err(|source| CacheError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(bytes.as_slice());

        let headers = reader.headers().map_err(csv_err)?.clone();
        if headers.iter().ne(CACHE_HEADER.iter().copied()) {
            return Err(CacheError::Header {
                path: path.to_path_buf(),
                found: headers.iter().collect::<Vec<_>>().join(","),
            });
        }

        let mut index = HashMap::new();
        let mut rows = 0usize;
        let mut record = csv::StringRecord::new();
        let mut valid_len = reader.position().byte();
        loop {
            let start = reader.position().byte();
            if !reader.read_record(&mut record).map_err(csv_err)? {
                break;
            }
            let end = reader.position().byte();
            if end >= bytes.len() as u64 && is_torn(&bytes[start as usize..]) {
                break;
            }
            valid_len = end;

            let Some(name) = record.get(0).filter(|n| !n.is_empty()) else {
                continue;
            };
            let id = record.get(1).unwrap_or_default();
            let description = record
                .get(2)
                .filter(|d| !d.is_empty())
                .map(str::to_string);
            index.insert(name.to_string(), LinkedEntity::new(name, id, description));
            rows += 1;
        }

        debug!(rows, distinct = index.len(), "replayed cache log");
        Ok((index, valid_len))
    }

    /// Distinct names with a record (linked or not).
    pub fn len(&self) -> usize {
        self.state.read().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rows appended since this instance was opened.
    pub fn appended(&self) -> usize {
        self.state.read().appended
    }

    pub fn get(&self, name: &str) -> CacheLookup {
        classify(self.state.read().index.get(name))
    }

    /// Return cached links for `names`; every other name goes to `misses`.
    pub fn get_many(
        &self,
        names: &[String],
        misses: &mut BTreeSet<String>,
    ) -> HashMap<String, LinkedEntity> {
        let state = self.state.read();
        let mut found = HashMap::new();
        for name in names {
            match classify(state.index.get(name)) {
                CacheLookup::Success(entity) => {
                    found.insert(name.clone(), entity);
                }
                CacheLookup::NoLinkingFound | CacheLookup::NotFound => {
                    misses.insert(name.clone());
                }
            }
        }
        found
    }

    pub fn persist(&self, entity: &LinkedEntity) -> Result<(), CacheError> {
        self.persist_all(std::slice::from_ref(entity))
    }

    /// Append all records and publish them to the index in one critical section.
    pub fn persist_all(&self, entities: &[LinkedEntity]) -> Result<(), CacheError> {
        if entities.is_empty() {
            return Ok(());
        }
        if entities.iter().any(|e| e.source_name.is_empty()) {
            return Err(CacheError::EmptyName);
        }

        let mut state = self.state.write();
        for entity in entities {
            state
                .log
                .write_record([
                    entity.source_name.as_str(),
                    entity.knowledge_base_id.as_str(),
                    entity.description.as_deref().unwrap_or_default(),
                ])
                .map_err(|source| CacheError::Csv {
                    path: self.path.clone(),
                    source,
                })?;
        }
        state.log.flush().map_err(|source| CacheError::Io {
            path: self.path.clone(),
            source,
        })?;

        for entity in entities {
            state
                .index
                .insert(entity.source_name.clone(), entity.clone());
        }
        state.appended += entities.len();
        Ok(())
    }

    /// Copy of the current index.
    pub fn snapshot(&self) -> HashMap<String, LinkedEntity> {
        self.state.read().index.clone()
    }

    /// Flush and sync the log, then release it.
    pub fn close(self) -> Result<(), CacheError> {
        let mut state = self.state.into_inner();
        let io_err = |source| CacheError::Io {
            path: self.path.clone(),
            source,
        };
        state.log.flush().map_err(io_err)?;
        state.log.get_ref().sync_data().map_err(io_err)
    }
}

fn classify(entry: Option<&LinkedEntity>) -> CacheLookup {
    match entry {
        Some(entity) if entity.is_linked() => CacheLookup::Success(entity.clone()),
        Some(_) => CacheLookup::NoLinkingFound,
        None => CacheLookup::NotFound,
    }
}

/// The writer terminates every row, and quotes inside fields are doubled.
fn is_torn(row: &[u8]) -> bool {
    !row.ends_with(b"\n") || row.iter().filter(|&&b| b == b'"').count() % 2 == 1
}

fn ends_with_newline(file: &mut File) -> std::io::Result<bool> {
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LookupOutcome;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn new_log_gets_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.csv");
        let cache = PersistentCache::open(&path).unwrap();
        assert!(cache.is_empty());
        drop(cache);

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "entity,linked_entity,description\n");
    }

    #[test]
    fn persist_then_get_same_thread() {
        let dir = tempdir().unwrap();
        let cache = PersistentCache::open(dir.path().join("cache.csv")).unwrap();

        let car = LinkedEntity::new("Car", "Q1420", Some("motor vehicle".to_string()));
        cache.persist(&car).unwrap();
        cache.persist(&LinkedEntity::unlinkable("Fridolin123xyz")).unwrap();

        assert_eq!(cache.get("Car"), CacheLookup::Success(car));
        assert_eq!(cache.get("Fridolin123xyz"), CacheLookup::NoLinkingFound);
        assert_eq!(cache.get("Dog").outcome(), LookupOutcome::NotFound);
    }

    #[test]
    fn get_many_collects_misses() {
        let dir = tempdir().unwrap();
        let cache = PersistentCache::open(dir.path().join("cache.csv")).unwrap();
        cache.persist(&LinkedEntity::new("Car", "Q1420", None)).unwrap();
        cache.persist(&LinkedEntity::unlinkable("Zzz")).unwrap();

        let mut misses = BTreeSet::new();
        let names = vec!["Car".to_string(), "Zzz".to_string(), "Dog".to_string()];
        let found = cache.get_many(&names, &mut misses);

        assert_eq!(found.len(), 1);
        assert!(found.contains_key("Car"));
        assert_eq!(
            misses,
            BTreeSet::from(["Zzz".to_string(), "Dog".to_string()])
        );
    }

    #[test]
    fn reopen_replays_last_write_wins() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.csv");
        {
            let cache = PersistentCache::open(&path).unwrap();
            cache.persist(&LinkedEntity::unlinkable("Car")).unwrap();
            cache
                .persist(&LinkedEntity::new("Car", "Q1420", Some("motor vehicle".into())))
                .unwrap();
            cache
                .persist(&LinkedEntity::new("Comma, Inc.", "Q42", Some("a \"quoted\" thing".into())))
                .unwrap();
            cache.close().unwrap();
        }

        let cache = PersistentCache::open(&path).unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("Car").into_entity().unwrap().knowledge_base_id, "Q1420");
        let comma = cache.get("Comma, Inc.").into_entity().unwrap();
        assert_eq!(comma.description.as_deref(), Some("a \"quoted\" thing"));

        let rows = std::fs::read_to_string(&path).unwrap().lines().count();
        assert_eq!(rows, 4, "log is append-only");
    }

    #[test]
    fn torn_final_row_is_discarded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.csv");
        std::fs::write(&path, "entity,linked_entity,description\nTree,Q10884,\nCar,Q14").unwrap();

        let cache = PersistentCache::open(&path).unwrap();
        assert_eq!(cache.get("Car"), CacheLookup::NotFound);
        cache.persist(&LinkedEntity::new("Dog", "Q144", None)).unwrap();
        drop(cache);

        let cache = PersistentCache::open(&path).unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("Car"), CacheLookup::NotFound);
        assert_eq!(cache.get("Tree").into_entity().unwrap().knowledge_base_id, "Q10884");
        assert_eq!(cache.get("Dog").into_entity().unwrap().knowledge_base_id, "Q144");
    }

    #[test]
    fn torn_quoted_row_does_not_swallow_later_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.csv");
        std::fs::write(
            &path,
            "entity,linked_entity,description\nCar,Q1420,\"motor, veh",
        )
        .unwrap();

        let cache = PersistentCache::open(&path).unwrap();
        assert!(cache.is_empty());
        cache.persist(&LinkedEntity::new("Dog", "Q144", None)).unwrap();
        cache.persist(&LinkedEntity::unlinkable("Zzz")).unwrap();
        cache.close().unwrap();

        let cache = PersistentCache::open(&path).unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("Dog").into_entity().unwrap().knowledge_base_id, "Q144");
        assert_eq!(cache.get("Zzz"), CacheLookup::NoLinkingFound);
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "entity,linked_entity,description\nDog,Q144,\nZzz,,\n"
        );
    }

    #[test]
    fn foreign_header_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.csv");
        std::fs::write(&path, "embedding_label,knowledgebase_id\nCar,Q1420\n").unwrap();

        let err = PersistentCache::open(&path).err().unwrap();
        assert!(matches!(err, CacheError::Header { .. }));
    }

    #[test]
    fn empty_name_rejected() {
        let dir = tempdir().unwrap();
        let cache = PersistentCache::open(dir.path().join("cache.csv")).unwrap();
        let err = cache.persist(&LinkedEntity::unlinkable("")).unwrap_err();
        assert!(matches!(err, CacheError::EmptyName));
        assert_eq!(cache.appended(), 0);
    }

    #[test]
    fn concurrent_disjoint_writes_are_not_lost() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.csv");
        let cache = Arc::new(PersistentCache::open(&path).unwrap());

        let threads = 16;
        let per_thread = 25;
        std::thread::scope(|scope| {
            for t in 0..threads {
                let cache = Arc::clone(&cache);
                scope.spawn(move || {
                    for i in 0..per_thread {
                        let name = format!("entity-{t}-{i}");
                        cache
                            .persist(&LinkedEntity::new(name.clone(), format!("Q{t}{i}"), None))
                            .unwrap();
                        assert!(cache.get(&name).into_entity().is_some());
                    }
                });
            }
        });

        assert_eq!(cache.appended(), threads * per_thread);
        drop(cache);

        let reopened = PersistentCache::open(&path).unwrap();
        assert_eq!(reopened.len(), threads * per_thread);
        let rows = std::fs::read_to_string(&path).unwrap().lines().count();
        assert_eq!(rows, threads * per_thread + 1);
    }
}
