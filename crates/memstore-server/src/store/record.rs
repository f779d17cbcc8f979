use std::collections::BTreeSet;
use std::fmt;
use std::time::Instant;

/// Identity of a client connection, assigned at accept and never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Taken with a lock request
    Explicit,
    /// Taken by opening with the lock flag, released by the matching close
    Implicit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileLock {
    pub holder: ClientId,
    pub kind: LockKind,
}

/// One stored file. Size is always the length of `content`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    name: String,
    content: Vec<u8>,
    last_used: u64,
    lock: Option<FileLock>,
    opened_by: BTreeSet<ClientId>,
}

impl FileRecord {
    pub(crate) fn new(name: String, tick: u64) -> Self {
        Self {
            name,
            content: Vec::new(),
            last_used: tick,
            lock: None,
            opened_by: BTreeSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn size(&self) -> usize {
        self.content.len()
    }

    pub fn last_used(&self) -> u64 {
        self.last_used
    }

    pub fn lock(&self) -> Option<FileLock> {
        self.lock
    }

    pub fn is_open_by(&self, client: ClientId) -> bool {
        self.opened_by.contains(&client)
    }

    pub fn opened_by(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.opened_by.iter().copied()
    }

    pub fn is_locked_by_other(&self, client: ClientId) -> bool {
        matches!(self.lock, Some(lock) if lock.holder != client)
    }

    pub fn is_locked_by(&self, client: ClientId) -> bool {
        matches!(self.lock, Some(lock) if lock.holder == client)
    }

    pub(crate) fn touch(&mut self, tick: u64) {
        self.last_used = tick;
    }

    pub(crate) fn replace_content(&mut self, content: Vec<u8>) {
        self.content = content;
    }

    pub(crate) fn append(&mut self, bytes: &[u8]) {
        self.content.extend_from_slice(bytes);
    }

    pub(crate) fn mark_open(&mut self, client: ClientId) {
        self.opened_by.insert(client);
    }

    /// Returns false if the client did not have the file open
    pub(crate) fn mark_closed(&mut self, client: ClientId) -> bool {
        self.opened_by.remove(&client)
    }

    /// Take the lock unless `client` already holds it; an existing hold keeps its kind
    pub(crate) fn acquire_lock(&mut self, client: ClientId, kind: LockKind) {
        if self.lock.is_none() {
            self.lock = Some(FileLock {
                holder: client,
                kind,
            });
        }
    }

    pub(crate) fn release_lock(&mut self) {
        self.lock = None;
    }

    pub(crate) fn into_content(self) -> (String, Vec<u8>) {
        (self.name, self.content)
    }
}

/// Source of strictly increasing nanosecond ticks for last-used stamps
pub(crate) struct Clock {
    origin: Instant,
    last: u64,
}

impl Clock {
    pub(crate) fn new() -> Self {
        Self {
            origin: Instant::now(),
            last: 0,
        }
    }

    pub(crate) fn tick(&mut self) -> u64 {
        let now = u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.last = now.max(self.last.saturating_add(1));
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_strictly_increases() {
        let mut clock = Clock::new();
        let mut prev = clock.tick();
        for _ in 0..1000 {
            let next = clock.tick();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn test_lock_kind_is_kept_on_reacquire() {
        let mut record = FileRecord::new("/f".into(), 1);
        let me = ClientId(1);
        record.acquire_lock(me, LockKind::Implicit);
        record.acquire_lock(me, LockKind::Explicit);
        assert_eq!(record.lock().map(|l| l.kind), Some(LockKind::Implicit));
        assert!(record.is_locked_by(me));
        assert!(record.is_locked_by_other(ClientId(2)));
    }

    #[test]
    fn test_size_tracks_content() {
        let mut record = FileRecord::new("/f".into(), 1);
        assert_eq!(record.size(), 0);
        record.replace_content(b"abc".to_vec());
        record.append(b"de");
        assert_eq!(record.size(), 5);
        assert_eq!(record.content(), b"abcde");
    }
}
