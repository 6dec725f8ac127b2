//! Result sinks.
//!
//! Experiments decide *what* to write and *where*; a [`ResultSink`] decides
//! *how*. The file sink writes tab-delimited ASCII through the `csv` crate;
//! the memory sink keeps everything in a map for tests and dry runs.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::data::table::ColumnTable;
use crate::error::{AppResult, DaqError};

/// Destination for result tables and log text.
pub trait ResultSink: Send + Sync {
    /// Write `table` to `path`, replacing any previous content.
    fn write_table(&self, path: &Path, table: &ColumnTable) -> AppResult<()>;

    /// Append `text` to `path`, creating it if needed.
    fn append_text(&self, path: &Path, text: &str) -> AppResult<()>;
}

// =============================================================================
// File sink
// =============================================================================

/// Writes tab-delimited ASCII files, one row per sample.
#[derive(Debug, Clone, Copy, Default)]
pub struct TsvFileSink;

impl TsvFileSink {
    /// New file sink.
    pub fn new() -> Self {
        Self
    }

    fn ensure_parent(path: &Path) -> AppResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

impl ResultSink for TsvFileSink {
    fn write_table(&self, path: &Path, table: &ColumnTable) -> AppResult<()> {
        Self::ensure_parent(path)?;
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .from_path(path)?;
        for row in table.rows() {
            writer.write_record(row.iter().map(f64::to_string))?;
        }
        writer
            .flush()
            .map_err(|e| DaqError::Storage(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), rows = table.row_count(), "table written");
        Ok(())
    }

    fn append_text(&self, path: &Path, text: &str) -> AppResult<()> {
        Self::ensure_parent(path)?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(text.as_bytes())?;
        Ok(())
    }
}

// =============================================================================
// Memory sink
// =============================================================================

/// Keeps written tables and text in memory, keyed by path.
#[derive(Debug, Default)]
pub struct MemorySink {
    tables: Mutex<BTreeMap<PathBuf, ColumnTable>>,
    texts: Mutex<BTreeMap<PathBuf, String>>,
}

impl MemorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Last table written to `path`.
    pub fn table(&self, path: impl AsRef<Path>) -> Option<ColumnTable> {
        self.tables.lock().get(path.as_ref()).cloned()
    }

    /// Text accumulated at `path`.
    pub fn text(&self, path: impl AsRef<Path>) -> Option<String> {
        self.texts.lock().get(path.as_ref()).cloned()
    }

    /// Every table path written so far, sorted.
    pub fn table_paths(&self) -> Vec<PathBuf> {
        self.tables.lock().keys().cloned().collect()
    }
}

impl ResultSink for MemorySink {
    fn write_table(&self, path: &Path, table: &ColumnTable) -> AppResult<()> {
        self.tables.lock().insert(path.to_path_buf(), table.clone());
        Ok(())
    }

    fn append_text(&self, path: &Path, text: &str) -> AppResult<()> {
        self.texts
            .lock()
            .entry(path.to_path_buf())
            .or_default()
            .push_str(text);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_sink_writes_tab_delimited_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("run_p150gr2");
        let table = ColumnTable::from_columns([vec![0.5, 1.5], vec![2.0, 3.0]]).unwrap();

        TsvFileSink::new().write_table(&path, &table).unwrap();

        let written = fs::read_to_string(&path).unwrap();
        assert_eq!(written, "0.5\t2\n1.5\t3\n");
    }

    #[test]
    fn test_file_sink_appends_text() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("faultLog.txt");
        let sink = TsvFileSink::new();
        sink.append_text(&path, "first\n").unwrap();
        sink.append_text(&path, "second\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }

    #[test]
    fn test_memory_sink_records_everything() {
        let sink = MemorySink::new();
        let table = ColumnTable::from_columns([vec![1.0]]).unwrap();
        sink.write_table(Path::new("a"), &table).unwrap();
        sink.append_text(Path::new("log"), "x").unwrap();
        sink.append_text(Path::new("log"), "y").unwrap();

        assert_eq!(sink.table("a"), Some(table));
        assert_eq!(sink.text("log").as_deref(), Some("xy"));
        assert_eq!(sink.table_paths(), vec![PathBuf::from("a")]);
    }
}
