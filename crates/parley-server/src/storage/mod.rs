//! Storage abstraction for group files.
//!
//! Group uploads live under `<root>/<group>/<file>`. The trait is synchronous
//! (no async) and is only called while the server lock is held, so
//! implementations see one caller at a time.

mod disk;
mod error;
mod memory;

use std::io::{Read, Write};

pub use disk::DiskStore;
pub use error::StorageError;
pub use memory::MemoryFileStore;

/// Upper bound on `_N` suffixes tried by [`candidate_names`].
pub const MAX_DEDUP_SUFFIX: u32 = 9_999;

/// File storage for group uploads.
///
/// Must be Clone (shared by the driver and the relay) and Send + Sync.
/// Implementations typically share internal state via Arc, so clones access
/// the same files.
///
/// # Panics
///
/// Implementations may panic if internal synchronization primitives are
/// poisoned. Acceptable for test code, production implementations go to the
/// file system directly.
pub trait FileStore: Clone + Send + Sync + 'static {
    /// Handle receiving upload bytes.
    type Writer: Write + Send;

    /// Handle streaming download bytes.
    type Reader: Read + Send;

    /// Create a new file in `group`, de-duplicating `filename`.
    ///
    /// Returns the name actually used together with a writer.
    ///
    /// # Invariants
    ///
    /// - Post: no existing file was truncated or overwritten
    fn create_unique(
        &self,
        group: &str,
        filename: &str,
    ) -> Result<(String, Self::Writer), StorageError>;

    /// Open a stored file for reading.
    fn open_read(&self, group: &str, filename: &str) -> Result<Self::Reader, StorageError>;

    /// Remove one stored file. Missing files are not an error.
    fn remove(&self, group: &str, filename: &str) -> Result<(), StorageError>;

    /// Remove a group's directory and everything in it. Missing groups are not
    /// an error.
    fn remove_group(&self, group: &str) -> Result<(), StorageError>;
}

/// Candidate names for a new file: `name.ext`, `name_1.ext`, `name_2.ext`, …
///
/// The extension is everything after the last dot, unless that dot is the
/// first character (`.profile` has no extension).
pub fn candidate_names(filename: &str) -> impl Iterator<Item = String> + '_ {
    let (stem, ext) = match filename.rfind('.') {
        Some(idx) if idx > 0 => filename.split_at(idx),
        _ => (filename, ""),
    };

    std::iter::once(filename.to_string())
        .chain((1..=MAX_DEDUP_SUFFIX).map(move |n| format!("{stem}_{n}{ext}")))
}

/// Reject names that would leave the group directory.
pub(crate) fn check_component(name: &str) -> Result<(), StorageError> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);

    if bad { Err(StorageError::InvalidName(name.to_string())) } else { Ok(()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_inserts_suffix_before_extension() {
        let names: Vec<_> = candidate_names("report.txt").take(3).collect();
        assert_eq!(names, vec!["report.txt", "report_1.txt", "report_2.txt"]);
    }

    #[test]
    fn dedup_without_extension() {
        let names: Vec<_> = candidate_names("README").take(2).collect();
        assert_eq!(names, vec!["README", "README_1"]);

        let names: Vec<_> = candidate_names(".profile").take(2).collect();
        assert_eq!(names, vec![".profile", ".profile_1"]);
    }

    #[test]
    fn dedup_uses_last_dot() {
        let names: Vec<_> = candidate_names("archive.tar.gz").take(2).collect();
        assert_eq!(names[1], "archive.tar_1.gz");
    }

    #[test]
    fn path_components_are_checked() {
        assert!(check_component("ok.txt").is_ok());
        assert!(check_component("..").is_err());
        assert!(check_component("a/b").is_err());
        assert!(check_component("").is_err());
    }
}
