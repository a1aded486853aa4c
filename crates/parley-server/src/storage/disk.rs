//! File-system backed group storage.

use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
};

use super::{FileStore, StorageError, candidate_names, check_component};

/// Stores group files under `<root>/<group>/<file>`.
///
/// Clone is cheap (a path). Nothing is cached: every call goes to the file
/// system.
#[derive(Debug, Clone)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    /// Open (and create if needed) the storage root.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the root cannot be created.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Storage root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn group_dir(&self, group: &str) -> Result<PathBuf, StorageError> {
        check_component(group)?;
        Ok(self.root.join(group))
    }
}

impl FileStore for DiskStore {
    type Writer = File;
    type Reader = File;

    fn create_unique(&self, group: &str, filename: &str) -> Result<(String, File), StorageError> {
        check_component(filename)?;
        let dir = self.group_dir(group)?;
        fs::create_dir_all(&dir)?;

        for candidate in candidate_names(filename) {
            match OpenOptions::new().write(true).create_new(true).open(dir.join(&candidate)) {
                Ok(file) => return Ok((candidate, file)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {},
                Err(e) => return Err(e.into()),
            }
        }

        Err(StorageError::NamesExhausted(filename.to_string()))
    }

    fn open_read(&self, group: &str, filename: &str) -> Result<File, StorageError> {
        check_component(filename)?;
        let path = self.group_dir(group)?.join(filename);
        File::open(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound {
                group: group.to_string(),
                filename: filename.to_string(),
            },
            _ => e.into(),
        })
    }

    fn remove(&self, group: &str, filename: &str) -> Result<(), StorageError> {
        check_component(filename)?;
        match fs::remove_file(self.group_dir(group)?.join(filename)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn remove_group(&self, group: &str) -> Result<(), StorageError> {
        match fs::remove_dir_all(self.group_dir(group)?) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use super::*;

    #[test]
    fn create_read_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();

        let (name, mut writer) = store.create_unique("team", "notes.txt").unwrap();
        assert_eq!(name, "notes.txt");
        writer.write_all(b"hello").unwrap();
        drop(writer);

        let mut content = String::new();
        store.open_read("team", "notes.txt").unwrap().read_to_string(&mut content).unwrap();
        assert_eq!(content, "hello");

        store.remove("team", "notes.txt").unwrap();
        assert!(matches!(store.open_read("team", "notes.txt"), Err(StorageError::NotFound { .. })));
    }

    #[test]
    fn existing_files_are_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();

        let (first, mut writer) = store.create_unique("team", "a.txt").unwrap();
        writer.write_all(b"first").unwrap();
        let (second, _) = store.create_unique("team", "a.txt").unwrap();
        let (third, _) = store.create_unique("team", "a.txt").unwrap();

        assert_eq!((first.as_str(), second.as_str(), third.as_str()), ("a.txt", "a_1.txt", "a_2.txt"));
        assert_eq!(fs::read(dir.path().join("team/a.txt")).unwrap(), b"first");
    }

    #[test]
    fn remove_group_deletes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();
        store.create_unique("team", "a.txt").unwrap();

        store.remove_group("team").unwrap();
        assert!(!dir.path().join("team").exists());
        store.remove_group("team").unwrap();
    }

    #[test]
    fn traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();

        assert!(matches!(
            store.create_unique("team", "../escape"),
            Err(StorageError::InvalidName(_))
        ));
        assert!(matches!(store.create_unique("..", "a.txt"), Err(StorageError::InvalidName(_))));
    }
}
