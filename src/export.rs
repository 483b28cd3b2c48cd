//! Persisting finished test sessions.
//!
//! The controller does not care about the artifact format; it hands a
//! [`TestSession`] and a destination name to an [`ExportSink`] and reports what the
//! sink returns.

use crate::discharge::TestSession;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use serde::Serialize;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Destination for finished sessions.
#[async_trait]
pub trait ExportSink: Send + Sync {
    /// Write `session` under `destination` and return where it ended up.
    async fn export(&self, session: &TestSession, destination: &str) -> AppResult<PathBuf>;
}

#[derive(Serialize)]
struct SessionHeader<'a> {
    cell_id: &'a str,
    start_time: String,
    stop_reason: Option<String>,
    samples: usize,
    final_capacity_ah: Option<f64>,
}

/// Writes a CSV file with one row per sample.
///
/// The file starts with the session metadata as pretty-printed JSON, every line
/// prefixed with `# `, followed by the CSV header and rows.
#[derive(Debug, Clone)]
pub struct CsvExporter {
    output_dir: PathBuf,
}

impl CsvExporter {
    /// Write into `output_dir`, creating it on first export.
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// Directory the files land in.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn write_file(&self, session: &TestSession, path: &Path) -> AppResult<()> {
        let mut file = File::create(path)?;

        let header = SessionHeader {
            cell_id: session.cell_id(),
            start_time: session.start_time().to_rfc3339(),
            stop_reason: session.stop_reason().map(|r| r.to_string()),
            samples: session.len(),
            final_capacity_ah: session.final_capacity(),
        };
        let json = serde_json::to_string_pretty(&header)
            .map_err(|e| DaqError::Export(format!("Failed to encode metadata: {e}")))?;
        for line in json.lines() {
            writeln!(file, "# {line}")?;
        }

        let mut writer = csv::Writer::from_writer(file);
        for sample in session.samples() {
            writer
                .serialize(sample)
                .map_err(|e| DaqError::Export(format!("Failed to write CSV row: {e}")))?;
        }
        writer.flush()?;
        Ok(())
    }
}

#[async_trait]
impl ExportSink for CsvExporter {
    async fn export(&self, session: &TestSession, destination: &str) -> AppResult<PathBuf> {
        if destination.trim().is_empty() {
            return Err(DaqError::Export("destination name is empty".into()));
        }
        if destination.contains(['/', '\\']) || destination == ".." {
            return Err(DaqError::Export(format!(
                "destination '{destination}' must be a plain file name"
            )));
        }
        if !self.output_dir.exists() {
            fs::create_dir_all(&self.output_dir)?;
        }
        let path = self.output_dir.join(format!("{destination}.csv"));
        self.write_file(session, &path)?;
        debug!(path = %path.display(), rows = session.len(), "CSV written");
        Ok(path)
    }
}
