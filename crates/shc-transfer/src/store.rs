//! Durable task and chunk storage
//!
//! Two logical tables: tasks keyed by id, and chunk blobs keyed by
//! (task id, index). They are written independently so chunk bytes can be
//! released while the task record stays for the retention sweep.
//!
//! Backends:
//!   - [`FileTransferStore`] (default): `tasks.json` plus `chunks/<task>/<index>.bin`
//!   - `RocksTransferStore` (feature `rocksdb`): prefixed keys in one database
//!
//! [`StoreBackend`] picks one at runtime from the configured path.

use bytes::Bytes;
use shc_core::{ChatId, ShcError, ShcResult};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::task::{TransferTask, UploadStatus};

/// Mutation applied by [`TransferStore::update_task`]
pub type TaskUpdate<'a> = &'a mut dyn FnMut(&mut TransferTask) -> ShcResult<()>;

pub trait TransferStore: Send + Sync {
    fn put_task(&self, task: &TransferTask) -> ShcResult<()>;
    fn get_task(&self, id: &str) -> ShcResult<Option<TransferTask>>;
    /// Read the latest persisted task, apply `update`, write it back, and
    /// return the result. Nothing is written if `update` fails.
    fn update_task(&self, id: &str, update: TaskUpdate<'_>) -> ShcResult<TransferTask>;
    /// Delete the task record and all of its chunks.
    fn delete_task(&self, id: &str) -> ShcResult<()>;
    fn list_tasks(&self) -> ShcResult<Vec<TransferTask>>;

    fn put_chunk(&self, task_id: &str, index: u32, data: &[u8]) -> ShcResult<()>;
    fn get_chunk(&self, task_id: &str, index: u32) -> ShcResult<Option<Bytes>>;
    /// Returns how many chunk records were removed.
    fn delete_chunks(&self, task_id: &str) -> ShcResult<usize>;
    /// Stored chunk indices for a task, ascending.
    fn chunk_indexes(&self, task_id: &str) -> ShcResult<Vec<u32>>;

    fn tasks_for_chat(&self, chat_id: ChatId) -> ShcResult<Vec<TransferTask>> {
        Ok(self
            .list_tasks()?
            .into_iter()
            .filter(|t| t.chat_id == chat_id)
            .collect())
    }

    fn tasks_with_status(&self, status: UploadStatus) -> ShcResult<Vec<TransferTask>> {
        Ok(self
            .list_tasks()?
            .into_iter()
            .filter(|t| t.status == status)
            .collect())
    }
}

fn not_found(id: &str) -> ShcError {
    ShcError::NotFound(format!("transfer task {id}"))
}

/// Task ids become path components; only plain ids are accepted.
fn check_id(id: &str) -> ShcResult<()> {
    let ok = !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(ShcError::Contract(format!("invalid task id: {id:?}")))
    }
}

// ── File backend ─────────────────────────────────────────────────────────────

/// Tasks held in memory and mirrored to `tasks.json`; every mutation is
/// flushed before it returns.
pub struct FileTransferStore {
    root: PathBuf,
    tasks: Mutex<BTreeMap<String, TransferTask>>,
}

impl FileTransferStore {
    /// Open or create a store rooted at `root`.
    pub fn open(root: &Path) -> ShcResult<Self> {
        std::fs::create_dir_all(root.join("chunks"))
            .map_err(|e| ShcError::persistence(&format!("creating {}", root.display()), e))?;

        let index = root.join("tasks.json");
        let tasks = if index.exists() {
            let raw = std::fs::read(&index)
                .map_err(|e| ShcError::persistence(&format!("reading {}", index.display()), e))?;
            serde_json::from_slice(&raw)
                .map_err(|e| ShcError::persistence(&format!("parsing {}", index.display()), e))?
        } else {
            BTreeMap::new()
        };

        debug!(path = %root.display(), tasks = tasks.len(), "opened transfer store");
        Ok(Self {
            root: root.to_path_buf(),
            tasks: Mutex::new(tasks),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, TransferTask>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn chunk_dir(&self, task_id: &str) -> PathBuf {
        self.root.join("chunks").join(task_id)
    }

    fn chunk_path(&self, task_id: &str, index: u32) -> PathBuf {
        self.chunk_dir(task_id).join(format!("{index:08}.bin"))
    }

    /// Atomic write: temp file, then rename over the index.
    fn flush(&self, tasks: &BTreeMap<String, TransferTask>) -> ShcResult<()> {
        let json = serde_json::to_vec_pretty(tasks)
            .map_err(|e| ShcError::persistence("serializing transfer tasks", e))?;
        let path = self.root.join("tasks.json");
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &json)
            .map_err(|e| ShcError::persistence(&format!("writing {}", tmp.display()), e))?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| ShcError::persistence(&format!("renaming {}", path.display()), e))
    }

    /// Write a copy, and only adopt it in memory once it is on disk.
    fn commit(
        &self,
        tasks: &mut BTreeMap<String, TransferTask>,
        change: impl FnOnce(&mut BTreeMap<String, TransferTask>),
    ) -> ShcResult<()> {
        let mut next = tasks.clone();
        change(&mut next);
        self.flush(&next)?;
        *tasks = next;
        Ok(())
    }
}

impl TransferStore for FileTransferStore {
    fn put_task(&self, task: &TransferTask) -> ShcResult<()> {
        check_id(&task.id)?;
        let mut tasks = self.lock();
        self.commit(&mut tasks, |m| {
            m.insert(task.id.clone(), task.clone());
        })
    }

    fn get_task(&self, id: &str) -> ShcResult<Option<TransferTask>> {
        Ok(self.lock().get(id).cloned())
    }

    fn update_task(&self, id: &str, update: TaskUpdate<'_>) -> ShcResult<TransferTask> {
        let mut tasks = self.lock();
        let mut task = tasks.get(id).cloned().ok_or_else(|| not_found(id))?;
        update(&mut task)?;
        let updated = task.clone();
        self.commit(&mut tasks, |m| {
            m.insert(id.to_owned(), task);
        })?;
        Ok(updated)
    }

    fn delete_task(&self, id: &str) -> ShcResult<()> {
        check_id(id)?;
        {
            let mut tasks = self.lock();
            if tasks.contains_key(id) {
                self.commit(&mut tasks, |m| {
                    m.remove(id);
                })?;
            }
        }
        self.delete_chunks(id)?;
        Ok(())
    }

    fn list_tasks(&self) -> ShcResult<Vec<TransferTask>> {
        Ok(self.lock().values().cloned().collect())
    }

    fn put_chunk(&self, task_id: &str, index: u32, data: &[u8]) -> ShcResult<()> {
        check_id(task_id)?;
        let dir = self.chunk_dir(task_id);
        std::fs::create_dir_all(&dir)
            .map_err(|e| ShcError::persistence(&format!("creating {}", dir.display()), e))?;
        let path = self.chunk_path(task_id, index);
        let tmp = path.with_extension("bin.tmp");
        std::fs::write(&tmp, data)
            .map_err(|e| ShcError::persistence(&format!("writing {}", tmp.display()), e))?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| ShcError::persistence(&format!("renaming {}", path.display()), e))
    }

    fn get_chunk(&self, task_id: &str, index: u32) -> ShcResult<Option<Bytes>> {
        check_id(task_id)?;
        let path = self.chunk_path(task_id, index);
        match std::fs::read(&path) {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ShcError::persistence(
                &format!("reading {}", path.display()),
                e,
            )),
        }
    }

    fn delete_chunks(&self, task_id: &str) -> ShcResult<usize> {
        check_id(task_id)?;
        let count = self.chunk_indexes(task_id)?.len();
        let dir = self.chunk_dir(task_id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(count),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(ShcError::persistence(
                &format!("removing {}", dir.display()),
                e,
            )),
        }
    }

    fn chunk_indexes(&self, task_id: &str) -> ShcResult<Vec<u32>> {
        check_id(task_id)?;
        let dir = self.chunk_dir(task_id);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(ShcError::persistence(
                    &format!("listing {}", dir.display()),
                    e,
                ))
            }
        };

        let mut indexes = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| ShcError::persistence("listing chunk dir", e))?;
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".bin")) else {
                continue;
            };
            match stem.parse::<u32>() {
                Ok(i) => indexes.push(i),
                Err(_) => warn!(file = ?name, "ignoring stray file in chunk dir"),
            }
        }
        indexes.sort_unstable();
        Ok(indexes)
    }
}

// ── RocksDB backend ──────────────────────────────────────────────────────────

#[cfg(feature = "rocksdb")]
mod rocksdb_backend {
    use super::*;
    use rocksdb::{Direction, IteratorMode, WriteBatch, DB};

    const TASK_PREFIX: &str = "task/";
    const CHUNK_PREFIX: &str = "chunk/";

    fn task_key(id: &str) -> String {
        format!("{TASK_PREFIX}{id}")
    }

    fn chunk_prefix(task_id: &str) -> String {
        format!("{CHUNK_PREFIX}{task_id}/")
    }

    fn chunk_key(task_id: &str, index: u32) -> String {
        format!("{CHUNK_PREFIX}{task_id}/{index:08}")
    }

    fn db_err(context: &str) -> impl FnOnce(rocksdb::Error) -> ShcError + '_ {
        move |e| ShcError::persistence(context, e)
    }

    /// Tasks and chunks in one RocksDB instance. Writes go straight to the
    /// database; the WAL provides durability.
    pub struct RocksTransferStore {
        db: DB,
        /// Serializes read-modify-write on task records
        write_lock: Mutex<()>,
    }

    impl RocksTransferStore {
        pub fn open(path: &Path) -> ShcResult<Self> {
            let mut opts = rocksdb::Options::default();
            opts.create_if_missing(true);
            let db = DB::open(&opts, path).map_err(|e| {
                ShcError::persistence(&format!("opening RocksDB {}", path.display()), e)
            })?;
            debug!(path = %path.display(), "opened RocksDB transfer store");
            Ok(Self {
                db,
                write_lock: Mutex::new(()),
            })
        }

        fn scan(&self, prefix: &str) -> ShcResult<Vec<(Box<[u8]>, Box<[u8]>)>> {
            let mut out = Vec::new();
            let iter = self
                .db
                .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward));
            for item in iter {
                let (key, value) = item.map_err(db_err("iterating RocksDB"))?;
                if !key.starts_with(prefix.as_bytes()) {
                    break;
                }
                out.push((key, value));
            }
            Ok(out)
        }

        fn read_task(&self, id: &str) -> ShcResult<Option<TransferTask>> {
            match self.db.get(task_key(id)).map_err(db_err("reading task"))? {
                Some(raw) => serde_json::from_slice(&raw)
                    .map(Some)
                    .map_err(|e| ShcError::persistence(&format!("decoding task {id}"), e)),
                None => Ok(None),
            }
        }

        fn write_task(&self, task: &TransferTask) -> ShcResult<()> {
            let json = serde_json::to_vec(task)
                .map_err(|e| ShcError::persistence("encoding task", e))?;
            self.db
                .put(task_key(&task.id), json)
                .map_err(db_err("writing task"))
        }
    }

    impl TransferStore for RocksTransferStore {
        fn put_task(&self, task: &TransferTask) -> ShcResult<()> {
            check_id(&task.id)?;
            let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
            self.write_task(task)
        }

        fn get_task(&self, id: &str) -> ShcResult<Option<TransferTask>> {
            self.read_task(id)
        }

        fn update_task(&self, id: &str, update: TaskUpdate<'_>) -> ShcResult<TransferTask> {
            let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
            let mut task = self.read_task(id)?.ok_or_else(|| not_found(id))?;
            update(&mut task)?;
            self.write_task(&task)?;
            Ok(task)
        }

        fn delete_task(&self, id: &str) -> ShcResult<()> {
            check_id(id)?;
            let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
            let mut batch = WriteBatch::default();
            batch.delete(task_key(id));
            for (key, _) in self.scan(&chunk_prefix(id))? {
                batch.delete(key);
            }
            self.db.write(batch).map_err(db_err("deleting task"))
        }

        fn list_tasks(&self) -> ShcResult<Vec<TransferTask>> {
            self.scan(TASK_PREFIX)?
                .into_iter()
                .map(|(key, value)| {
                    serde_json::from_slice(&value).map_err(|e| {
                        ShcError::persistence(
                            &format!("decoding {}", String::from_utf8_lossy(&key)),
                            e,
                        )
                    })
                })
                .collect()
        }

        fn put_chunk(&self, task_id: &str, index: u32, data: &[u8]) -> ShcResult<()> {
            check_id(task_id)?;
            self.db
                .put(chunk_key(task_id, index), data)
                .map_err(db_err("writing chunk"))
        }

        fn get_chunk(&self, task_id: &str, index: u32) -> ShcResult<Option<Bytes>> {
            Ok(self
                .db
                .get(chunk_key(task_id, index))
                .map_err(db_err("reading chunk"))?
                .map(Bytes::from))
        }

        fn delete_chunks(&self, task_id: &str) -> ShcResult<usize> {
            check_id(task_id)?;
            let keys = self.scan(&chunk_prefix(task_id))?;
            let mut batch = WriteBatch::default();
            for (key, _) in &keys {
                batch.delete(key);
            }
            self.db.write(batch).map_err(db_err("deleting chunks"))?;
            Ok(keys.len())
        }

        fn chunk_indexes(&self, task_id: &str) -> ShcResult<Vec<u32>> {
            let prefix = chunk_prefix(task_id);
            Ok(self
                .scan(&prefix)?
                .into_iter()
                .filter_map(|(key, _)| {
                    std::str::from_utf8(&key[prefix.len()..])
                        .ok()
                        .and_then(|s| s.parse().ok())
                })
                .collect())
        }
    }
}

#[cfg(feature = "rocksdb")]
pub use rocksdb_backend::RocksTransferStore;

// ── Backend selection ────────────────────────────────────────────────────────

/// Runtime choice of store.
pub enum StoreBackend {
    File(FileTransferStore),
    #[cfg(feature = "rocksdb")]
    Rocks(RocksTransferStore),
}

impl StoreBackend {
    /// Paths ending in `.rocksdb` use RocksDB (if compiled in); anything
    /// else is a file-store directory.
    pub fn open(path: &Path) -> ShcResult<Self> {
        let wants_rocks = path.extension().is_some_and(|ext| ext == "rocksdb");

        #[cfg(feature = "rocksdb")]
        if wants_rocks {
            return Ok(StoreBackend::Rocks(RocksTransferStore::open(path)?));
        }

        #[cfg(not(feature = "rocksdb"))]
        if wants_rocks {
            warn!("RocksDB not compiled in (missing 'rocksdb' feature), falling back to file store");
        }

        Ok(StoreBackend::File(FileTransferStore::open(path)?))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StoreBackend::File(_) => "file",
            #[cfg(feature = "rocksdb")]
            StoreBackend::Rocks(_) => "rocksdb",
        }
    }

    fn inner(&self) -> &dyn TransferStore {
        match self {
            StoreBackend::File(s) => s,
            #[cfg(feature = "rocksdb")]
            StoreBackend::Rocks(s) => s,
        }
    }
}

impl TransferStore for StoreBackend {
    fn put_task(&self, task: &TransferTask) -> ShcResult<()> {
        self.inner().put_task(task)
    }
    fn get_task(&self, id: &str) -> ShcResult<Option<TransferTask>> {
        self.inner().get_task(id)
    }
    fn update_task(&self, id: &str, update: TaskUpdate<'_>) -> ShcResult<TransferTask> {
        self.inner().update_task(id, update)
    }
    fn delete_task(&self, id: &str) -> ShcResult<()> {
        self.inner().delete_task(id)
    }
    fn list_tasks(&self) -> ShcResult<Vec<TransferTask>> {
        self.inner().list_tasks()
    }
    fn put_chunk(&self, task_id: &str, index: u32, data: &[u8]) -> ShcResult<()> {
        self.inner().put_chunk(task_id, index, data)
    }
    fn get_chunk(&self, task_id: &str, index: u32) -> ShcResult<Option<Bytes>> {
        self.inner().get_chunk(task_id, index)
    }
    fn delete_chunks(&self, task_id: &str) -> ShcResult<usize> {
        self.inner().delete_chunks(task_id)
    }
    fn chunk_indexes(&self, task_id: &str) -> ShcResult<Vec<u32>> {
        self.inner().chunk_indexes(task_id)
    }
}
