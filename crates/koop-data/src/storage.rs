//! JSON persistence for datasets, lifting sets and reports.

use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use koop_model::LiftingSet;
use koop_types::{DataError, KoopResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Read a JSON document.
pub fn read_json<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> KoopResult<T> {
    let path = path.as_ref();
    let file = fs::File::open(path).map_err(|e| DataError::LoadingFailed {
        message: format!("Failed to open {}: {}", path.display(), e),
    })?;
    let value = serde_json::from_reader(BufReader::new(file))?;
    tracing::debug!("Read {}", path.display());
    Ok(value)
}

/// Write a JSON document, creating parent directories as needed.
pub fn write_json<T: Serialize, P: AsRef<Path>>(path: P, value: &T) -> KoopResult<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut writer = BufWriter::new(fs::File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush()?;
    tracing::debug!("Wrote {}", path.display());
    Ok(())
}

/// Persist the shared lifting set.
pub fn save_lifting_set<P: AsRef<Path>>(path: P, set: &LiftingSet) -> KoopResult<()> {
    write_json(path, set)
}

/// Load the shared lifting set written by [`save_lifting_set`].
pub fn load_lifting_set<P: AsRef<Path>>(path: P) -> KoopResult<LiftingSet> {
    let set: LiftingSet = read_json(path.as_ref())?;
    tracing::info!(
        "Loaded lifting set with {} step(s) from {}",
        set.steps.len(),
        path.as_ref().display()
    );
    Ok(set)
}
