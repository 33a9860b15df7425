use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::detect::record_is_affected;
use crate::error::Result;
use crate::store::MetadataRecord;

pub(crate) const DEFAULT_REPORT_FILE: &str = "affected.cvs";

/// Append-only list of affected records: `meta_id,meta_key,owner_id` per line,
/// no header, no escaping.
pub(crate) struct Reporter {
    path: PathBuf,
}

impl Reporter {
    pub(crate) fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Append a line for `record` if it is affected. Returns whether it was.
    pub(crate) fn record(&self, record: &MetadataRecord) -> Result<bool> {
        if !record_is_affected(record) {
            return Ok(false);
        }
        self.append_line(&report_line(record))?;
        debug!(meta_id = record.id, path = %self.path.display(), "reported affected meta");
        Ok(true)
    }

    // Open, write the whole line at once, close: an interrupted run leaves
    // only complete lines behind.
    fn append_line(&self, line: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

pub(crate) fn report_line(record: &MetadataRecord) -> String {
    format!("{},{},{}\n", record.id, record.key, record.owner_id)
}
