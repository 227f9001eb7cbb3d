//! Populates a mounted secret volume
//!
//! File names come from secret backends, which in turn may copy them from
//! user-controlled Secrets, so every name is checked to stay directly inside
//! the target directory before anything is written.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Component, Path};

use tracing::debug;

use crate::{Error, Result};

/// Mode of every written secret file
pub const FILE_MODE: u32 = 0o644;

/// Reject names that are empty, absolute, or would leave the target directory
pub fn validate_file_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::internal_with_context("write", "empty file name"));
    }
    if name.contains('/') || name.contains('\\') || name.contains('\0') {
        return Err(Error::internal_with_context(
            "write",
            format!("file name {:?} contains a path separator", name),
        ));
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(Error::internal_with_context(
            "write",
            format!("file name {:?} is not a plain file name", name),
        )),
    }
}

/// Write `files` into `target`, one file per entry
///
/// All names are validated first. Writing stops at the first failure and
/// leaves already written files in place.
pub fn write_files(target: &Path, files: &BTreeMap<String, Vec<u8>>) -> Result<()> {
    for name in files.keys() {
        validate_file_name(name)?;
    }

    for (name, content) in files {
        let path = target.join(name);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(FILE_MODE)
            .open(&path)
            .map_err(|e| Error::io(format!("open {}", name), e))?;
        file.write_all(content)
            .map_err(|e| Error::io(format!("write {}", name), e))?;
        debug!(file = %path.display(), "file written");
    }

    debug!(target = %target.display(), count = files.len(), "data written");
    Ok(())
}
