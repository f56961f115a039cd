//! Result reading collaborator.
//!
//! Decoding the engine's raw waveform container belongs to an external library;
//! sessions only see the [`ResultReader`] trait. [`JsonPlotReader`] reads a
//! line-delimited JSON rendition of the same plots and is what the bundled
//! fake engine writes.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{SessionError, SessionResult};

/// Key some decoders use to report the next read position alongside the plots.
pub const OFFSET_KEY: &str = "offset";

/// One decoded plot: named columns of samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultTable {
    pub variables: Vec<String>,
    /// Row-major samples, one entry per variable in each row.
    pub values: Vec<Vec<f64>>,
}

impl ResultTable {
    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let idx = self.variables.iter().position(|var| var == name)?;
        Some(
            self.values
                .iter()
                .filter_map(|row| row.get(idx).copied())
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Plots keyed by analysis name.
pub type ResultSet = BTreeMap<String, ResultTable>;

/// Output of a single read: the plots found after `offset` and where the next read starts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadBatch {
    pub tables: ResultSet,
    pub next_offset: u64,
}

/// Reads newly available plots from a raw results file.
pub trait ResultReader: Send + Sync {
    fn read(&self, raw_path: &Path, offset: u64) -> SessionResult<ReadBatch>;
}

/// Fail unless `path` is an existing, readable regular file.
pub fn check_readable(path: &Path) -> SessionResult<()> {
    if !path.is_file() {
        return Err(SessionError::MissingFile(path.to_path_buf()));
    }
    File::open(path)
        .map(|_| ())
        .map_err(|source| SessionError::Unreadable {
            path: path.to_path_buf(),
            source,
        })
}

/// One line of the JSON plot stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlotRecord {
    pub plotname: String,
    #[serde(flatten)]
    pub table: ResultTable,
}

/// Reads newline-terminated [`PlotRecord`]s. The offset is a byte position;
/// a trailing line without its newline is left for the next read.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPlotReader;

impl ResultReader for JsonPlotReader {
    fn read(&self, raw_path: &Path, offset: u64) -> SessionResult<ReadBatch> {
        check_readable(raw_path)?;
        let mut file = File::open(raw_path)?;
        let len = file.metadata()?.len();
        if offset >= len {
            return Ok(ReadBatch {
                tables: ResultSet::new(),
                next_offset: offset.max(len),
            });
        }
        file.seek(SeekFrom::Start(offset))?;

        let mut reader = BufReader::new(file);
        let mut tables = ResultSet::new();
        let mut position = offset;
        let mut line = String::new();
        loop {
            line.clear();
            let read = reader.read_line(&mut line)?;
            if read == 0 || !line.ends_with('\n') {
                break;
            }
            position += read as u64;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let record: PlotRecord = serde_json::from_str(trimmed).map_err(|err| {
                SessionError::ResultRead(format!("{} at byte {position}: {err}", raw_path.display()))
            })?;
            tables.insert(record.plotname, record.table);
        }

        Ok(ReadBatch {
            tables,
            next_offset: position,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn record(name: &str, sample: f64) -> String {
        let record = PlotRecord {
            plotname: name.to_string(),
            table: ResultTable {
                variables: vec!["time".to_string(), "out".to_string()],
                values: vec![vec![0.0, sample], vec![1.0, sample * 2.0]],
            },
        };
        serde_json::to_string(&record).unwrap()
    }

    #[test]
    fn reads_only_records_after_offset() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{}", record("tran1", 1.0)).unwrap();
        let first = JsonPlotReader.read(file.path(), 0).unwrap();
        assert_eq!(first.tables.len(), 1);
        assert!(first.next_offset > 0);

        writeln!(file, "{}", record("ac1", 3.0)).unwrap();
        let second = JsonPlotReader.read(file.path(), first.next_offset).unwrap();
        assert_eq!(second.tables.keys().collect::<Vec<_>>(), vec!["ac1"]);
        assert_eq!(
            second.tables["ac1"].column("out"),
            Some(vec![3.0, 6.0])
        );
        assert!(second.next_offset > first.next_offset);
    }

    #[test]
    fn partial_trailing_line_is_deferred() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{}", record("tran1", 1.0)).unwrap();
        write!(file, "{{\"plotname\": \"ac").unwrap();
        let batch = JsonPlotReader.read(file.path(), 0).unwrap();
        assert_eq!(batch.tables.len(), 1);
        let full_len = std::fs::metadata(file.path()).unwrap().len();
        assert!(batch.next_offset < full_len);
    }

    #[test]
    fn missing_raw_file_is_a_precondition_error() {
        let err = JsonPlotReader
            .read(Path::new("/nonexistent/results.raw"), 0)
            .unwrap_err();
        assert!(matches!(err, SessionError::MissingFile(_)));
    }
}
