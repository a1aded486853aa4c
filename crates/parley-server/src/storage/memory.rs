#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::{BTreeMap, HashMap},
    io::{self, Cursor, Write},
    sync::{Arc, Mutex, MutexGuard},
};

use super::{FileStore, StorageError, candidate_names, check_component};

type Files = HashMap<String, BTreeMap<String, Vec<u8>>>;

/// In-memory group storage for testing and simulation.
///
/// Writers append straight into the shared map, so a file can be re-read the
/// moment its writer is dropped. Uses `lock().expect()`, which panics if the
/// mutex is poisoned. Acceptable for test code.
#[derive(Debug, Clone, Default)]
pub struct MemoryFileStore {
    inner: Arc<Mutex<Files>>,
}

/// Writer handed out by [`MemoryFileStore::create_unique`].
pub struct MemoryWriter {
    inner: Arc<Mutex<Files>>,
    group: String,
    filename: String,
}

impl MemoryFileStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::expect_used)]
    fn lock(&self) -> MutexGuard<'_, Files> {
        self.inner.lock().expect("Mutex poisoned")
    }

    /// Place a file directly (test setup).
    pub fn insert(&self, group: &str, filename: &str, content: impl Into<Vec<u8>>) {
        self.lock()
            .entry(group.to_string())
            .or_default()
            .insert(filename.to_string(), content.into());
    }

    /// Content of a stored file.
    pub fn contents(&self, group: &str, filename: &str) -> Option<Vec<u8>> {
        self.lock().get(group)?.get(filename).cloned()
    }

    /// Stored file names of a group, sorted.
    pub fn files(&self, group: &str) -> Vec<String> {
        self.lock().get(group).map(|files| files.keys().cloned().collect()).unwrap_or_default()
    }

    /// True if the group has a directory.
    pub fn has_group(&self, group: &str) -> bool {
        self.lock().contains_key(group)
    }
}

impl FileStore for MemoryFileStore {
    type Writer = MemoryWriter;
    type Reader = Cursor<Vec<u8>>;

    fn create_unique(
        &self,
        group: &str,
        filename: &str,
    ) -> Result<(String, MemoryWriter), StorageError> {
        check_component(group)?;
        check_component(filename)?;

        let mut files = self.lock();
        let dir = files.entry(group.to_string()).or_default();

        let name = candidate_names(filename)
            .find(|candidate| !dir.contains_key(candidate))
            .ok_or_else(|| StorageError::NamesExhausted(filename.to_string()))?;
        dir.insert(name.clone(), Vec::new());

        let writer = MemoryWriter {
            inner: Arc::clone(&self.inner),
            group: group.to_string(),
            filename: name.clone(),
        };
        Ok((name, writer))
    }

    fn open_read(&self, group: &str, filename: &str) -> Result<Self::Reader, StorageError> {
        self.contents(group, filename).map(Cursor::new).ok_or_else(|| StorageError::NotFound {
            group: group.to_string(),
            filename: filename.to_string(),
        })
    }

    fn remove(&self, group: &str, filename: &str) -> Result<(), StorageError> {
        if let Some(dir) = self.lock().get_mut(group) {
            dir.remove(filename);
        }
        Ok(())
    }

    fn remove_group(&self, group: &str) -> Result<(), StorageError> {
        self.lock().remove(group);
        Ok(())
    }
}

impl Write for MemoryWriter {
    #[allow(clippy::expect_used)]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut files = self.inner.lock().expect("Mutex poisoned");
        let file = files
            .get_mut(&self.group)
            .and_then(|dir| dir.get_mut(&self.filename))
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "file removed while open"))?;
        file.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
