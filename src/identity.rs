//! Instance id allocation: `{name}-{YYYY-MM-DD}` with a `-NN` tie breaker

use crate::{Error, Result};
use chrono::NaiveDate;
use std::path::{Path, PathBuf};

/// Existence check over a directory namespace
pub trait Namespace {
    fn exists(&self, path: &Path) -> bool;
}

/// The real filesystem
#[derive(Debug, Default, Clone, Copy)]
pub struct Filesystem;

impl Namespace for Filesystem {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

/// Today in local time
pub fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

/// Candidate ids in allocation order. Unbounded; the suffix widens past two digits.
pub fn candidates(base_name: &str, today: NaiveDate) -> impl Iterator<Item = String> + '_ {
    let stem = format!("{}-{}", base_name, today.format("%Y-%m-%d"));
    std::iter::once(stem.clone()).chain((1u64..).map(move |n| format!("{}-{:02}", stem, n)))
}

/// First candidate that does not exist in `directory`.
///
/// Check-then-act: two callers probing the same snapshot can both get the
/// same answer. Use [`claim`] when creation must not race.
pub fn allocate(
    namespace: &impl Namespace,
    directory: &Path,
    base_name: &str,
    today: NaiveDate,
) -> String {
    candidates(base_name, today)
        .find(|candidate| !namespace.exists(&directory.join(candidate)))
        .unwrap_or_default()
}

/// Create `path` exclusively, reporting an existing entry as a conflict.
pub fn create_instance_dir(path: &Path) -> Result<()> {
    match std::fs::create_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            Err(Error::DirectoryConflict(path.to_path_buf()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Allocate an id and create its directory in one step.
///
/// Each candidate is claimed with an exclusive `mkdir`; losing a race to
/// another allocator moves on to the next candidate.
pub fn claim(directory: &Path, base_name: &str, today: NaiveDate) -> Result<(String, PathBuf)> {
    for candidate in candidates(base_name, today) {
        let path = directory.join(&candidate);
        match create_instance_dir(&path) {
            Ok(()) => {
                tracing::debug!(instance_id = %candidate, "claimed instance directory");
                return Ok((candidate, path));
            }
            Err(Error::DirectoryConflict(_)) => continue,
            Err(e) => return Err(e),
        }
    }
    unreachable!("candidate sequence is unbounded")
}
