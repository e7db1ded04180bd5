//! # Engine
//!
//! A compact multi-partition LSM engine: one [`PartitionStore`] per
//! [`Partition`], all sharing one sequence counter and one directory.
//!
//! ```text
//! <dir>/LOCK               flock held while open read-write
//! <dir>/data/MANIFEST      per-partition manifest + segment files
//! <dir>/meta/...
//! <dir>/score/...
//! ```
//!
//! There is no write-ahead log. Buffered writes reach disk when memtables are
//! flushed: by the background worker, by [`Engine::flush`], or on
//! [`Engine::close`].

pub mod manifest;
pub mod memtable;
pub mod partition;
pub mod segment;
pub mod snapshot;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use swapdb_core::config::{EngineConfig, PartitionConfigs};
use swapdb_core::error::{Error, IoResultExt, Result};
use swapdb_core::Partition;

use crate::keys::KeyRange;
use crate::lock::DirLock;

pub use partition::{PartitionStore, PartitionView};
pub use snapshot::{Checkpoint, Snapshot};

/// Options fixed for the lifetime of an open engine
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub partitions: PartitionConfigs,
    pub create_if_missing: bool,
    /// How often the background worker looks for memtables to flush
    pub flush_poll_interval: Duration,
    /// Bound on waiting for the background worker in `close`
    pub cancel_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            partitions: PartitionConfigs::default(),
            create_if_missing: true,
            flush_poll_interval: Duration::from_millis(100),
            cancel_timeout: Duration::from_secs(5),
        }
    }
}

impl EngineOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            partitions: config.partitions.clone(),
            cancel_timeout: config.cancel_timeout,
            ..Self::default()
        }
    }
}

/// Read options. With a snapshot, reads see the state pinned by it.
#[derive(Clone, Default)]
pub struct ReadOptions {
    pub snapshot: Option<Arc<Snapshot>>,
}

/// Write options
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Flush the partition after the write so it is on disk when the call returns
    pub sync: bool,
}

/// Names accepted by [`Engine::property_int`]
pub const INT_PROPERTIES: &[&str] = &[
    "num-entries-active-mem-table",
    "num-deletes-active-mem-table",
    "num-entries-imm-mem-tables",
    "num-deletes-imm-mem-tables",
    "num-immutable-mem-table",
    "cur-size-active-mem-table",
    "size-all-mem-tables",
    "total-segment-files-size",
    "num-segment-files",
    "estimate-num-keys",
    "last-sequence",
];

struct WorkerSignal {
    stop: Mutex<bool>,
    wake: Condvar,
}

struct BackgroundWorker {
    signal: Arc<WorkerSignal>,
    done: mpsc::Receiver<()>,
    handle: thread::JoinHandle<()>,
}

pub struct Engine {
    dir: PathBuf,
    read_only: bool,
    options: EngineOptions,
    partitions: Vec<Arc<PartitionStore>>,
    sequence: Arc<AtomicU64>,
    periodic_flush_secs: Arc<AtomicU64>,
    background: Mutex<Option<BackgroundWorker>>,
    closed: AtomicBool,
    _lock: Option<DirLock>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("dir", &self.dir)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Open every partition under `dir` read-write. Fails as a whole if any partition fails.
    pub fn open(dir: impl AsRef<Path>, options: &EngineOptions) -> Result<Self> {
        Self::open_inner(dir.as_ref(), options, false)
    }

    /// Open an existing engine directory (e.g. a checkpoint) for reads only.
    /// No lock is taken and no background work is started.
    pub fn open_read_only(dir: impl AsRef<Path>, options: &EngineOptions) -> Result<Self> {
        Self::open_inner(dir.as_ref(), options, true)
    }

    fn open_inner(dir: &Path, options: &EngineOptions, read_only: bool) -> Result<Self> {
        let open_error = |partition: &str, path: &Path, message: String| Error::Open {
            partition: partition.to_string(),
            path: path.to_path_buf(),
            message,
        };

        if !dir.is_dir() {
            if read_only || !options.create_if_missing {
                return Err(open_error("*", dir, "directory does not exist".to_string()));
            }
            std::fs::create_dir_all(dir)
                .map_err(|e| open_error("*", dir, e.to_string()))?;
        }

        let lock = if read_only {
            None
        } else {
            Some(DirLock::acquire(dir).map_err(|e| open_error("*", dir, format!("lock: {}", e)))?)
        };

        let sequence = Arc::new(AtomicU64::new(0));
        let mut partitions = Vec::with_capacity(Partition::COUNT);
        for partition in Partition::ALL {
            let path = dir.join(partition.name());
            let store = PartitionStore::open(
                partition,
                &path,
                options.partitions.get(partition).clone(),
                sequence.clone(),
                read_only,
            )
            .map_err(|e| open_error(partition.name(), &path, e.to_string()))?;
            partitions.push(Arc::new(store));
        }

        let engine = Self {
            dir: dir.to_path_buf(),
            read_only,
            options: options.clone(),
            partitions,
            sequence,
            periodic_flush_secs: Arc::new(AtomicU64::new(0)),
            background: Mutex::new(None),
            closed: AtomicBool::new(false),
            _lock: lock,
        };

        if !read_only {
            engine.start_background_work()?;
        }

        info!(
            dir = %engine.dir.display(),
            read_only,
            last_sequence = engine.last_sequence(),
            "Engine opened"
        );
        Ok(engine)
    }

    fn start_background_work(&self) -> Result<()> {
        let signal = Arc::new(WorkerSignal {
            stop: Mutex::new(false),
            wake: Condvar::new(),
        });
        let (done_tx, done_rx) = mpsc::channel();

        let partitions = self.partitions.clone();
        let periodic = Arc::clone(&self.periodic_flush_secs);
        let poll = self.options.flush_poll_interval;
        let worker_signal = Arc::clone(&signal);

        let handle = thread::Builder::new()
            .name("swapdb-flush".into())
            .spawn(move || {
                loop {
                    {
                        let mut stop = worker_signal.stop.lock();
                        if !*stop {
                            worker_signal.wake.wait_for(&mut stop, poll);
                        }
                        if *stop {
                            break;
                        }
                    }

                    let max_age = periodic.load(Ordering::Relaxed);
                    for store in &partitions {
                        if let Err(e) = store.flush_immutable() {
                            warn!(partition = %store.partition(), error = %e, "Background flush failed");
                        }
                        if max_age > 0 {
                            if let Err(e) = store.flush_if_older(Duration::from_secs(max_age)) {
                                warn!(partition = %store.partition(), error = %e, "Periodic flush failed");
                            }
                        }
                    }
                }
                let _ = done_tx.send(());
            })
            .map_err(|e| Error::Internal {
                message: format!("spawn flush worker: {}", e),
            })?;

        *self.background.lock() = Some(BackgroundWorker {
            signal,
            done: done_rx,
            handle,
        });
        Ok(())
    }

    /// Stop the background worker, waiting at most `timeout` for it to finish its
    /// current pass. Returns false if it did not finish in time (it is then detached).
    pub fn cancel_background_work(&self, timeout: Duration) -> bool {
        let Some(worker) = self.background.lock().take() else {
            return true;
        };

        *worker.signal.stop.lock() = true;
        worker.signal.wake.notify_all();

        match worker.done.recv_timeout(timeout) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                if worker.handle.join().is_err() {
                    error!("Flush worker panicked");
                }
                true
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Flush worker did not stop in time");
                false
            }
        }
    }

    /// Cancel background work and persist every memtable. Later calls are no-ops.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if !self.cancel_background_work(self.options.cancel_timeout) {
            warn!(dir = %self.dir.display(), "Closing with background work still running");
        }
        if self.read_only {
            debug!(dir = %self.dir.display(), "Read-only engine closed");
            return Ok(());
        }

        let mut first_error = None;
        for store in &self.partitions {
            if let Err(e) = store.close() {
                error!(partition = %store.partition(), error = %e, "Failed to persist partition on close");
                first_error.get_or_insert(e);
            }
        }

        info!(dir = %self.dir.display(), last_sequence = self.last_sequence(), "Engine closed");
        first_error.map_or(Ok(()), Err)
    }

    fn partition(&self, partition: Partition) -> Result<&PartitionStore> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(self.partitions[partition.index()].as_ref())
    }

    pub fn put(&self, partition: Partition, key: Bytes, value: Bytes, opts: &WriteOptions) -> Result<u64> {
        let store = self.partition(partition)?;
        let seq = store.put(key, value)?;
        if opts.sync {
            store.flush()?;
        }
        Ok(seq)
    }

    pub fn delete(&self, partition: Partition, key: Bytes, opts: &WriteOptions) -> Result<u64> {
        let store = self.partition(partition)?;
        let seq = store.delete(key)?;
        if opts.sync {
            store.flush()?;
        }
        Ok(seq)
    }

    /// Tombstone every live key in `range`; returns how many keys were deleted.
    pub fn delete_range(&self, partition: Partition, range: &KeyRange) -> Result<u64> {
        self.partition(partition)?.delete_range(range)
    }

    pub fn get(&self, partition: Partition, key: &[u8], opts: &ReadOptions) -> Result<Option<Bytes>> {
        let store = self.partition(partition)?;
        Ok(match &opts.snapshot {
            Some(snapshot) => snapshot.get(partition, key),
            None => store.get(key, u64::MAX),
        })
    }

    /// Pin the current state of every partition.
    pub fn snapshot(&self) -> Result<Arc<Snapshot>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        // Exclusive on every partition: no write is half-applied while the sequence is read
        let guards: Vec<_> = self.partitions.iter().map(|p| p.lock_exclusive()).collect();
        let sequence = self.sequence.load(Ordering::SeqCst);
        let views = self
            .partitions
            .iter()
            .zip(guards.iter())
            .map(|(store, state)| state.view(store.partition()))
            .collect();
        drop(guards);

        debug!(sequence, "Snapshot taken");
        Ok(Arc::new(Snapshot::new(sequence, views)))
    }

    /// Materialize the current state into `dest`.
    pub fn checkpoint(&self, dest: impl AsRef<Path>) -> Result<Checkpoint> {
        self.snapshot()?.materialize(dest)
    }

    pub fn flush(&self, partition: Partition) -> Result<()> {
        self.partition(partition)?.flush()?;
        Ok(())
    }

    pub fn property_int(&self, partition: Partition, name: &str) -> Result<u64> {
        self.partition(partition)?
            .property_int(name)
            .ok_or_else(|| Error::Property {
                partition: partition.name().to_string(),
                property: name.to_string(),
            })
    }

    pub fn property_text(&self, partition: Partition, name: &str) -> Result<String> {
        let store = self.partition(partition)?;
        match name {
            "stats" => Ok(store.stats_text()),
            _ => store
                .property_int(name)
                .map(|v| v.to_string())
                .ok_or_else(|| Error::Property {
                    partition: partition.name().to_string(),
                    property: name.to_string(),
                }),
        }
    }

    /// Bytes used by every file under the engine directory.
    pub fn total_disk_size(&self) -> Result<u64> {
        dir_size(&self.dir)
    }

    /// Apply dynamic options after open.
    pub fn set_options(&self, options: &[(&str, &str)]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        for (name, value) in options {
            match *name {
                "periodic_flush_seconds" => {
                    let secs: u64 = value.parse().map_err(|_| Error::Configuration {
                        message: format!("invalid value for {}: {:?}", name, value),
                    })?;
                    self.periodic_flush_secs.store(secs, Ordering::Relaxed);
                }
                _ => {
                    return Err(Error::Configuration {
                        message: format!("unknown dynamic option {}", name),
                    })
                }
            }
        }
        Ok(())
    }

    pub fn periodic_flush_secs(&self) -> u64 {
        self.periodic_flush_secs.load(Ordering::Relaxed)
    }

    pub fn last_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !self.is_closed() {
            self.cancel_background_work(self.options.cancel_timeout);
        }
    }
}

fn dir_size(path: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in std::fs::read_dir(path).with_path("read dir", path)? {
        let entry = entry.with_path("read dir entry", path)?;
        // Temp files may be renamed away between listing and stat
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e).with_path("stat", &entry.path()),
        };
        total += if meta.is_dir() {
            dir_size(&entry.path())?
        } else {
            meta.len()
        };
    }
    Ok(total)
}
