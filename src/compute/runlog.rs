//! Per-generation run log.
//!
//! One line per generation:
//!
//! ```text
//! generation;best_score
//! generation;best_score;{"machines":[{"machineId":0,"posX":1,"posY":2},...]}
//! ```
//!
//! The second form is written on snapshot generations and carries the best
//! layout of that generation.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use super::{EvolutionError, Layout, LayoutSnapshot};

/// One line of the run log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRecord {
    pub generation: u64,
    pub best_score: u64,
    pub best_layout: Option<LayoutSnapshot>,
}

impl GenerationRecord {
    /// Format as a log line, without the trailing newline.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        Ok(match &self.best_layout {
            Some(snapshot) => format!(
                "{};{};{}",
                self.generation,
                self.best_score,
                serde_json::to_string(snapshot)?
            ),
            None => format!("{};{}", self.generation, self.best_score),
        })
    }

    /// Parse a log line. A layout snapshot must describe a valid layout.
    pub fn parse_line(line: &str, line_no: usize) -> Result<Self, RunLogError> {
        let malformed = |reason: &str| RunLogError::MalformedLine {
            line: line_no,
            reason: reason.to_string(),
        };

        let mut parts = line.trim().splitn(3, ';');
        let generation = parts
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| malformed("invalid generation"))?;
        let best_score = parts
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| malformed("invalid best score"))?;

        let best_layout = match parts.next() {
            Some(json) => {
                let snapshot: LayoutSnapshot =
                    serde_json::from_str(json).map_err(|source| RunLogError::Snapshot {
                        line: line_no,
                        source,
                    })?;
                Layout::from_snapshot(&snapshot).map_err(|source| RunLogError::Layout {
                    line: line_no,
                    source,
                })?;
                Some(snapshot)
            }
            None => None,
        };

        Ok(Self {
            generation,
            best_score,
            best_layout,
        })
    }
}

/// Buffered writer for a run log file.
pub struct RunLogWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    records_written: u64,
}

impl RunLogWriter {
    /// Create the log file, truncating a previous attempt's log.
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path,
            records_written: 0,
        })
    }

    /// Reopen the log of an interrupted run that continues at
    /// `next_generation`.
    ///
    /// Records of earlier generations are kept up to the first line that
    /// does not parse or is out of order. Everything after that is dropped.
    /// A missing log starts empty.
    pub fn resume<P: AsRef<Path>>(path: P, next_generation: u64) -> io::Result<Self> {
        let content = match fs::read_to_string(path.as_ref()) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e),
        };

        let kept: Vec<&str> = content
            .lines()
            .enumerate()
            .map_while(|(index, line)| {
                GenerationRecord::parse_line(line, index + 1)
                    .ok()
                    .filter(|record| record.generation == index as u64)
                    .filter(|record| record.generation < next_generation)
                    .map(|_| line)
            })
            .collect();

        let mut writer = Self::create(path)?;
        for line in &kept {
            writeln!(writer.writer, "{}", line)?;
        }
        writer.writer.flush()?;
        writer.records_written = kept.len() as u64;
        Ok(writer)
    }

    /// Append a record. Snapshot records are flushed immediately.
    pub fn write_record(&mut self, record: &GenerationRecord) -> io::Result<()> {
        let line = record.to_line().map_err(io::Error::other)?;
        writeln!(self.writer, "{}", line)?;
        if record.best_layout.is_some() {
            self.writer.flush()?;
        }
        self.records_written += 1;
        Ok(())
    }

    /// Flush and close the log. Returns the number of records written.
    pub fn finish(mut self) -> io::Result<u64> {
        self.writer.flush()?;
        Ok(self.records_written)
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records written so far.
    pub fn records_written(&self) -> u64 {
        self.records_written
    }
}

/// Read every record of a run log.
pub fn read_run_log<P: AsRef<Path>>(path: P) -> Result<Vec<GenerationRecord>, RunLogError> {
    let content = fs::read_to_string(path)?;
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| GenerationRecord::parse_line(line, index + 1))
        .collect()
}

/// Run log errors.
#[derive(Debug, thiserror::Error)]
pub enum RunLogError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Line {line}: {reason}")]
    MalformedLine { line: usize, reason: String },
    #[error("Line {line}: invalid layout snapshot: {source}")]
    Snapshot {
        line: usize,
        source: serde_json::Error,
    },
    #[error("Line {line}: layout snapshot is not a valid layout: {source}")]
    Layout {
        line: usize,
        source: EvolutionError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn layout() -> Layout {
        let mut layout = Layout::generate(2);
        layout.set_position(0, 0, 0).unwrap();
        layout.set_position(1, 1, 0).unwrap();
        layout.set_position(2, 2, 1).unwrap();
        layout
    }

    #[test]
    fn test_line_format() {
        let plain = GenerationRecord {
            generation: 3,
            best_score: 42,
            best_layout: None,
        };
        assert_eq!(plain.to_line().unwrap(), "3;42");

        let with_layout = GenerationRecord {
            generation: 10,
            best_score: 7,
            best_layout: Some(layout().snapshot()),
        };
        let line = with_layout.to_line().unwrap();
        assert!(line.starts_with("10;7;{\"machines\":["));
        assert_eq!(GenerationRecord::parse_line(&line, 1).unwrap(), with_layout);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            GenerationRecord::parse_line("x;1", 4),
            Err(RunLogError::MalformedLine { line: 4, .. })
        ));
        assert!(matches!(
            GenerationRecord::parse_line("1", 2),
            Err(RunLogError::MalformedLine { line: 2, .. })
        ));
        assert!(matches!(
            GenerationRecord::parse_line("1;2;{\"machines\":[{\"id\":0}]}", 1),
            Err(RunLogError::Snapshot { line: 1, .. })
        ));

        let duplicate = r#"1;2;{"machines":[{"machineId":0,"posX":0,"posY":0},{"machineId":0,"posX":1,"posY":0}]}"#;
        assert!(matches!(
            GenerationRecord::parse_line(duplicate, 1),
            Err(RunLogError::Layout {
                source: EvolutionError::DuplicateMachineId(0),
                ..
            })
        ));

        let out_of_range = r#"0;1;{"machines":[{"machineId":18446744073709551615,"posX":0,"posY":0}]}"#;
        assert!(matches!(
            GenerationRecord::parse_line(out_of_range, 3),
            Err(RunLogError::Layout {
                line: 3,
                source: EvolutionError::UnknownMachineId(usize::MAX),
            })
        ));
    }

    #[test]
    fn test_write_and_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs").join("run_1.log");

        let records = vec![
            GenerationRecord {
                generation: 0,
                best_score: 20,
                best_layout: Some(layout().snapshot()),
            },
            GenerationRecord {
                generation: 1,
                best_score: 18,
                best_layout: None,
            },
        ];

        let mut writer = RunLogWriter::create(&path).unwrap();
        for record in &records {
            writer.write_record(record).unwrap();
        }
        assert_eq!(writer.records_written(), 2);
        assert_eq!(writer.finish().unwrap(), 2);

        assert_eq!(read_run_log(&path).unwrap(), records);
    }

    #[test]
    fn test_create_truncates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.log");
        fs::write(&path, "garbage\n").unwrap();

        let writer = RunLogWriter::create(&path).unwrap();
        writer.finish().unwrap();
        assert!(read_run_log(&path).unwrap().is_empty());
    }

    #[test]
    fn test_resume_keeps_earlier_generations() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.log");
        let mut content = String::new();
        for generation in 0..15 {
            content.push_str(&format!("{};{}\n", generation, 100 - generation));
        }
        // A line cut short by the interruption.
        content.push_str("15;8");
        fs::write(&path, &content).unwrap();

        let mut writer = RunLogWriter::resume(&path, 10).unwrap();
        assert_eq!(writer.records_written(), 10);
        writer
            .write_record(&GenerationRecord {
                generation: 10,
                best_score: 1,
                best_layout: Some(layout().snapshot()),
            })
            .unwrap();
        assert_eq!(writer.finish().unwrap(), 11);

        let records = read_run_log(&path).unwrap();
        assert_eq!(records.len(), 11);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.generation, i as u64);
        }
        assert_eq!(records[9].best_score, 91);
        assert_eq!(records[10].best_score, 1);
    }

    #[test]
    fn test_resume_stops_at_damaged_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.log");
        fs::write(&path, "0;5\n1;5\nx;5\n3;5\n").unwrap();

        let writer = RunLogWriter::resume(&path, 10).unwrap();
        assert_eq!(writer.finish().unwrap(), 2);
        assert_eq!(fs::read_to_string(&path).unwrap(), "0;5\n1;5\n");

        let missing = dir.path().join("new").join("run.log");
        let writer = RunLogWriter::resume(&missing, 10).unwrap();
        assert_eq!(writer.finish().unwrap(), 0);
        assert!(read_run_log(&missing).unwrap().is_empty());
    }
}
