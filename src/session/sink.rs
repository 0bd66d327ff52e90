//! Data sink for session samples
//!
//! Buffers samples in arrival order and commits them to a CSV file once the
//! session ends. The file is written to a temporary file in the destination
//! directory, synced, then renamed into place, so the final path never holds
//! a partial file. A failed commit keeps the samples in memory for a retry.

use crate::error::{EngineError, Result};
use crate::types::{Sample, SessionMode};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Highest version suffix tried before giving up
const MAX_VERSION_SUFFIX: u32 = 9999;

/// What to do when the save path already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverwritePolicy {
    /// Keep the existing file and save as `name_1.csv`, `name_2.csv`, ...
    #[default]
    VersionSuffix,
    /// Atomically replace the existing file
    Overwrite,
}

#[derive(Serialize)]
struct SweepRow {
    sequence_index: u64,
    timestamp_s: f64,
    applied_voltage_v: Option<f64>,
    measured_current_a: f64,
}

#[derive(Serialize)]
struct CollectionRow {
    sequence_index: u64,
    timestamp_s: f64,
    measured_current_a: f64,
}

/// File name generated from the session mode and start time
pub fn generated_file_name(mode: SessionMode, started_at: &DateTime<Local>) -> String {
    format!("{}_{}.csv", mode.file_stem(), started_at.format("%Y%m%d_%H%M%S"))
}

/// `dir/name_<n>.ext` for a path `dir/name.ext`
fn versioned_path(path: &Path, version: u32) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "session".to_string());
    let name = match path.extension() {
        Some(ext) => format!("{}_{}.{}", stem, version, ext.to_string_lossy()),
        None => format!("{}_{}", stem, version),
    };
    path.with_file_name(name)
}

/// In-memory buffer of one session's samples
#[derive(Debug)]
pub struct DataSink {
    mode: SessionMode,
    started_at: DateTime<Local>,
    target: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    policy: OverwritePolicy,
    samples: Vec<Sample>,
    committed: Option<PathBuf>,
}

impl DataSink {
    /// Create a sink
    ///
    /// Without a `target`, the file is named after the mode and start time
    /// inside `output_dir` (or the working directory).
    pub fn new(
        mode: SessionMode,
        started_at: DateTime<Local>,
        target: Option<PathBuf>,
        output_dir: Option<PathBuf>,
        policy: OverwritePolicy,
    ) -> Self {
        Self {
            mode,
            started_at,
            target,
            output_dir,
            policy,
            samples: Vec::new(),
            committed: None,
        }
    }

    pub fn push(&mut self, sample: Sample) {
        self.samples.push(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    /// Path the samples are saved to, before any version suffix
    pub fn target_path(&self) -> PathBuf {
        match &self.target {
            Some(path) => path.clone(),
            None => {
                let name = generated_file_name(self.mode, &self.started_at);
                match &self.output_dir {
                    Some(dir) => dir.join(name),
                    None => PathBuf::from(name),
                }
            }
        }
    }

    /// Path of the last successful commit
    pub fn committed_path(&self) -> Option<&Path> {
        self.committed.as_deref()
    }

    /// Commit the buffered samples
    ///
    /// Returns the final path. Calling it again after a successful commit
    /// returns the same path without writing.
    pub fn flush(&mut self) -> Result<PathBuf> {
        if let Some(path) = &self.committed {
            return Ok(path.clone());
        }

        let target = self.target_path();
        let dir = match target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let mut temp = NamedTempFile::new_in(&dir)?;
        self.write_csv(temp.as_file_mut())?;
        temp.as_file().sync_all()?;

        let path = match self.policy {
            OverwritePolicy::Overwrite => {
                temp.persist(&target).map_err(|e| e.error)?;
                target
            }
            OverwritePolicy::VersionSuffix => persist_versioned(temp, &target)?,
        };

        tracing::info!(
            "Saved {} {} samples to {}",
            self.samples.len(),
            self.mode,
            path.display()
        );
        self.committed = Some(path.clone());
        Ok(path)
    }

    fn write_csv<W: Write>(&self, out: W) -> Result<()> {
        let mut writer = csv::Writer::from_writer(out);
        for sample in &self.samples {
            let timestamp_s = sample.timestamp.as_secs_f64();
            match self.mode {
                SessionMode::Sweep => writer.serialize(SweepRow {
                    sequence_index: sample.sequence_index,
                    timestamp_s,
                    applied_voltage_v: sample.applied_voltage,
                    measured_current_a: sample.measured_current,
                }),
                SessionMode::Collection => writer.serialize(CollectionRow {
                    sequence_index: sample.sequence_index,
                    timestamp_s,
                    measured_current_a: sample.measured_current,
                }),
            }
            .map_err(std::io::Error::from)?;
        }
        writer.flush()?;
        Ok(())
    }
}

fn persist_versioned(mut temp: NamedTempFile, target: &Path) -> Result<PathBuf> {
    for version in 0..=MAX_VERSION_SUFFIX {
        let candidate = if version == 0 {
            target.to_path_buf()
        } else {
            versioned_path(target, version)
        };
        match temp.persist_noclobber(&candidate) {
            Ok(_) => return Ok(candidate),
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                temp = e.file;
            }
            Err(e) => return Err(EngineError::Io(e.error)),
        }
    }
    Err(EngineError::Io(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        format!(
            "{} and {} numbered variants already exist",
            target.display(),
            MAX_VERSION_SUFFIX
        ),
    )))
}
