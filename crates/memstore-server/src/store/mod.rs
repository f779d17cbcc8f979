//! # Keyed store
//!
//! Capacity-bounded map from file name to [`FileRecord`], with LRU eviction
//! and per-file open/lock bookkeeping. Every operation runs under one store
//! mutex, so eviction decisions always see a consistent snapshot.
//!
//! Mutating operations plan their evictions before touching anything: either
//! the whole operation (evictions included) is applied, or it fails and the
//! store is unchanged.

mod record;
mod table;

pub use record::{ClientId, FileLock, FileRecord, LockKind};

use std::sync::{Arc, Mutex, MutexGuard};

use memstore_config::log_store_debug;
use memstore_ipc::{OpenFlags, MAX_NAME_LEN};
use thiserror::Error;

use crate::oplog::{OpEvent, OpLog};
use record::Clock;
use table::BucketTable;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("file name too long: {0} bytes")]
    NameTooLong(usize),

    #[error("file name is empty")]
    InvalidName,

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("file already exists: {0}")]
    AlreadyExists(String),

    #[error("file already opened by this client: {0}")]
    AlreadyOpen(String),

    #[error("file not opened by this client: {0}")]
    NotOpened(String),

    #[error("file locked by another client: {0}")]
    Locked(String),

    #[error("lock not held by this client: {0}")]
    LockNotHeld(String),

    #[error("not enough storage space")]
    OutOfMemory,

    #[error("store mutex poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A file handed back to a client: read back, or ejected to make room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub name: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLimits {
    pub capacity_bytes: usize,
    pub max_files: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub stored_bytes: usize,
    pub stored_files: usize,
    pub max_stored_bytes: usize,
    pub max_stored_files: usize,
    pub replaced_files: u64,
}

struct StoreInner {
    table: BucketTable,
    clock: Clock,
    stored_bytes: usize,
    max_stored_bytes: usize,
    max_stored_files: usize,
    replaced_files: u64,
}

pub struct FileStore {
    inner: Mutex<StoreInner>,
    limits: StoreLimits,
    oplog: Arc<OpLog>,
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(StoreError::InvalidName);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(StoreError::NameTooLong(name.len()));
    }
    Ok(())
}

impl FileStore {
    pub fn new(limits: StoreLimits) -> Self {
        Self::with_oplog(limits, Arc::new(OpLog::disabled()))
    }

    pub fn with_oplog(limits: StoreLimits, oplog: Arc<OpLog>) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                table: BucketTable::new(limits.max_files),
                clock: Clock::new(),
                stored_bytes: 0,
                max_stored_bytes: 0,
                max_stored_files: 0,
                replaced_files: 0,
            }),
            limits,
            oplog,
        }
    }

    fn lock_inner(&self) -> Result<MutexGuard<'_, StoreInner>> {
        self.inner.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Open `name` for `client`, creating and/or locking it per `flags`.
    /// Creating into a full store ejects the least recently used file.
    pub fn open(&self, client: ClientId, name: &str, flags: OpenFlags) -> Result<Vec<StoredFile>> {
        check_name(name)?;
        let create = flags.contains(OpenFlags::CREATE);
        let lock = flags.contains(OpenFlags::LOCK);
        let mut inner = self.lock_inner()?;

        let mut ejected = Vec::new();
        match inner.table.get_mut(name) {
            Some(_) if create => return Err(StoreError::AlreadyExists(name.to_owned())),
            Some(record) => {
                if record.is_open_by(client) {
                    return Err(StoreError::AlreadyOpen(name.to_owned()));
                }
                if lock && record.is_locked_by_other(client) {
                    return Err(StoreError::Locked(name.to_owned()));
                }
                record.mark_open(client);
                if lock {
                    record.acquire_lock(client, LockKind::Implicit);
                }
            }
            None if !create => return Err(StoreError::NotFound(name.to_owned())),
            None => {
                let files_over = (inner.table.len() + 1).saturating_sub(self.limits.max_files);
                let victims = inner.plan_eviction(name, 0, files_over)?;
                ejected = inner.evict(victims, &self.oplog);

                let tick = inner.clock.tick();
                let mut record = FileRecord::new(name.to_owned(), tick);
                record.mark_open(client);
                if lock {
                    record.acquire_lock(client, LockKind::Implicit);
                }
                inner.table.insert(record);
                inner.max_stored_files = inner.max_stored_files.max(inner.table.len());
            }
        }

        self.oplog.record(if lock {
            OpEvent::OpenLock { name }
        } else {
            OpEvent::Open { name }
        });
        log_store_debug!("File opened", name = name, client = client.0, create = create, lock = lock);
        Ok(ejected)
    }

    /// Release `client`'s open slot; an implicit lock from that open goes with it
    pub fn close(&self, client: ClientId, name: &str) -> Result<()> {
        check_name(name)?;
        let mut inner = self.lock_inner()?;
        let record = inner
            .table
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_owned()))?;
        if !record.mark_closed(client) {
            return Err(StoreError::NotOpened(name.to_owned()));
        }
        if let Some(FileLock {
            holder,
            kind: LockKind::Implicit,
        }) = record.lock()
        {
            if holder == client {
                record.release_lock();
            }
        }
        self.oplog.record(OpEvent::Close { name });
        Ok(())
    }

    /// Replace the content of `name`, ejecting other files if needed
    pub fn write(&self, client: ClientId, name: &str, content: Vec<u8>) -> Result<Vec<StoredFile>> {
        self.store_content(client, name, content, false)
    }

    /// Append to `name`, ejecting other files if needed
    pub fn append(&self, client: ClientId, name: &str, content: Vec<u8>) -> Result<Vec<StoredFile>> {
        self.store_content(client, name, content, true)
    }

    fn store_content(
        &self,
        client: ClientId,
        name: &str,
        content: Vec<u8>,
        append: bool,
    ) -> Result<Vec<StoredFile>> {
        check_name(name)?;
        let mut inner = self.lock_inner()?;

        let old_size = {
            let record = inner
                .table
                .get(name)
                .ok_or_else(|| StoreError::NotFound(name.to_owned()))?;
            if record.is_locked_by_other(client) {
                return Err(StoreError::Locked(name.to_owned()));
            }
            if !record.is_open_by(client) {
                return Err(StoreError::NotOpened(name.to_owned()));
            }
            record.size()
        };
        let new_size = if append {
            old_size + content.len()
        } else {
            content.len()
        };
        if new_size > self.limits.capacity_bytes {
            return Err(StoreError::OutOfMemory);
        }

        let projected = inner.stored_bytes - old_size + new_size;
        let bytes_over = projected.saturating_sub(self.limits.capacity_bytes);
        let victims = inner.plan_eviction(name, bytes_over, 0)?;
        let ejected = inner.evict(victims, &self.oplog);

        let tick = inner.clock.tick();
        let record = inner
            .table
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_owned()))?;
        if append {
            record.append(&content);
        } else {
            record.replace_content(content);
        }
        record.touch(tick);
        inner.stored_bytes = inner.stored_bytes - old_size + new_size;
        inner.max_stored_bytes = inner.max_stored_bytes.max(inner.stored_bytes);

        self.oplog.record(OpEvent::Write {
            name,
            size: new_size,
        });
        Ok(ejected)
    }

    pub fn read(&self, client: ClientId, name: &str) -> Result<Vec<u8>> {
        check_name(name)?;
        let mut inner = self.lock_inner()?;
        let StoreInner { table, clock, .. } = &mut *inner;
        let record = table
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_owned()))?;
        if record.is_locked_by_other(client) {
            return Err(StoreError::Locked(name.to_owned()));
        }
        record.touch(clock.tick());
        self.oplog.record(OpEvent::Read {
            name,
            size: record.size(),
        });
        Ok(record.content().to_vec())
    }

    /// Up to `count` files not locked by another client, in traversal order.
    /// A count of 0 reads every such file.
    pub fn read_n(&self, client: ClientId, count: usize) -> Result<Vec<StoredFile>> {
        let limit = if count == 0 { usize::MAX } else { count };
        let mut inner = self.lock_inner()?;
        let StoreInner { table, clock, .. } = &mut *inner;

        let mut files = Vec::new();
        for record in table
            .iter_mut()
            .filter(|r| !r.is_locked_by_other(client))
            .take(limit)
        {
            record.touch(clock.tick());
            self.oplog.record(OpEvent::Read {
                name: record.name(),
                size: record.size(),
            });
            files.push(StoredFile {
                name: record.name().to_owned(),
                content: record.content().to_vec(),
            });
        }
        Ok(files)
    }

    /// Take an explicit lock. Re-locking a file the client already holds is a no-op.
    pub fn lock(&self, client: ClientId, name: &str) -> Result<()> {
        check_name(name)?;
        let mut inner = self.lock_inner()?;
        let record = inner
            .table
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_owned()))?;
        if record.is_locked_by_other(client) {
            return Err(StoreError::Locked(name.to_owned()));
        }
        record.acquire_lock(client, LockKind::Explicit);
        self.oplog.record(OpEvent::Lock { name });
        Ok(())
    }

    pub fn unlock(&self, client: ClientId, name: &str) -> Result<()> {
        check_name(name)?;
        let mut inner = self.lock_inner()?;
        let record = inner
            .table
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_owned()))?;
        if record.is_locked_by_other(client) {
            return Err(StoreError::Locked(name.to_owned()));
        }
        if !record.is_locked_by(client) {
            return Err(StoreError::LockNotHeld(name.to_owned()));
        }
        record.release_lock();
        self.oplog.record(OpEvent::Unlock { name });
        Ok(())
    }

    /// Delete `name`. The client must hold its lock.
    pub fn remove(&self, client: ClientId, name: &str) -> Result<()> {
        check_name(name)?;
        let mut inner = self.lock_inner()?;
        let record = inner
            .table
            .get(name)
            .ok_or_else(|| StoreError::NotFound(name.to_owned()))?;
        if record.is_locked_by_other(client) {
            return Err(StoreError::Locked(name.to_owned()));
        }
        if !record.is_locked_by(client) {
            return Err(StoreError::LockNotHeld(name.to_owned()));
        }
        if let Some(record) = inner.table.remove(name) {
            inner.stored_bytes -= record.size();
        }
        self.oplog.record(OpEvent::Remove { name });
        Ok(())
    }

    /// Forget `client`: drop it from every open set and release every lock it holds
    pub fn connection_closed(&self, client: ClientId) -> Result<()> {
        let mut inner = self.lock_inner()?;
        let mut released = 0usize;
        for record in inner.table.iter_mut() {
            record.mark_closed(client);
            if record.is_locked_by(client) {
                record.release_lock();
                released += 1;
            }
        }
        log_store_debug!("Connection cleaned up", client = client.0, locks_released = released);
        Ok(())
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let inner = self.lock_inner()?;
        Ok(StoreStats {
            stored_bytes: inner.stored_bytes,
            stored_files: inner.table.len(),
            max_stored_bytes: inner.max_stored_bytes,
            max_stored_files: inner.max_stored_files,
            replaced_files: inner.replaced_files,
        })
    }

    /// Copy of the record for `name`, if present
    pub fn snapshot(&self, name: &str) -> Result<Option<FileRecord>> {
        let inner = self.lock_inner()?;
        Ok(inner.table.get(name).cloned())
    }
}

impl StoreInner {
    /// Names to evict, least recently used first, so that `bytes` bytes and
    /// `files` records are freed. `exonerated` and empty records are never
    /// chosen. Ties keep traversal order.
    fn plan_eviction(&self, exonerated: &str, bytes: usize, files: usize) -> Result<Vec<String>> {
        if bytes == 0 && files == 0 {
            return Ok(Vec::new());
        }

        let mut candidates: Vec<&FileRecord> = self
            .table
            .iter()
            .filter(|r| r.name() != exonerated && r.size() > 0)
            .collect();
        candidates.sort_by_key(|r| r.last_used());

        let (mut bytes, mut files) = (bytes, files);
        let mut victims = Vec::new();
        for record in candidates {
            if bytes == 0 && files == 0 {
                break;
            }
            victims.push(record.name().to_owned());
            bytes = bytes.saturating_sub(record.size());
            files = files.saturating_sub(1);
        }

        if bytes > 0 || files > 0 {
            return Err(StoreError::OutOfMemory);
        }
        Ok(victims)
    }

    fn evict(&mut self, victims: Vec<String>, oplog: &OpLog) -> Vec<StoredFile> {
        let mut ejected = Vec::with_capacity(victims.len());
        for name in victims {
            if let Some(record) = self.table.remove(&name) {
                self.stored_bytes -= record.size();
                self.replaced_files += 1;
                oplog.record(OpEvent::Replace {
                    name: &name,
                    size: record.size(),
                });
                log_store_debug!("File ejected", name = name.as_str(), size = record.size());
                let (name, content) = record.into_content();
                ejected.push(StoredFile { name, content });
            }
        }
        ejected
    }
}
