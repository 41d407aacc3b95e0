//! Cycle samples and their on-disk time series
//!
//! When a metrics directory is configured, the configuration banner goes to
//! `config.txt` and every cycle sample is appended to `times.csv`.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// One monitor sample. `cycle` increases by one per sample; `value` is the
/// rate (free-running) or the cycle length in milliseconds (barrier mode).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleSample {
    pub cycle: u64,
    pub value: f64,
}

/// Receiver of periodic cycle samples.
pub trait SampleSink: Send {
    fn record(&mut self, sample: &CycleSample) -> Result<(), SeriesError>;
}

impl SampleSink for Vec<CycleSample> {
    fn record(&mut self, sample: &CycleSample) -> Result<(), SeriesError> {
        self.push(*sample);
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum SeriesError {
    #[error("metrics file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn create(path: PathBuf) -> Result<BufWriter<File>, SeriesError> {
    File::create(&path)
        .map(BufWriter::new)
        .map_err(|source| SeriesError::Io { path, source })
}

/// A metrics output directory holding `config.txt` and `times.csv`.
pub struct MetricsDir {
    root: PathBuf,
    config: BufWriter<File>,
}

impl MetricsDir {
    /// Create the directory if needed and truncate both files.
    pub fn create(root: impl AsRef<Path>) -> Result<Self, SeriesError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|source| SeriesError::Io {
            path: root.clone(),
            source,
        })?;
        let config = create(root.join("config.txt"))?;
        tracing::info!(dir = %root.display(), "writing metrics");
        Ok(Self { root, config })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Append one line to `config.txt`.
    pub fn config_line(&mut self, line: &str) -> Result<(), SeriesError> {
        let path = self.root.join("config.txt");
        writeln!(self.config, "{line}")
            .and_then(|_| self.config.flush())
            .map_err(|source| SeriesError::Io { path, source })
    }

    /// Open `times.csv` with its header.
    pub fn time_series(&self, header: &str) -> Result<TimeSeries, SeriesError> {
        let path = self.root.join("times.csv");
        let mut out = create(path.clone())?;
        writeln!(out, "# {header}")
            .and_then(|_| out.flush())
            .map_err(|source| SeriesError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(TimeSeries { path, out })
    }
}

/// `cycle,value` lines, flushed per sample.
pub struct TimeSeries {
    path: PathBuf,
    out: BufWriter<File>,
}

impl SampleSink for TimeSeries {
    fn record(&mut self, sample: &CycleSample) -> Result<(), SeriesError> {
        writeln!(self.out, "{},{}", sample.cycle, sample.value)
            .and_then(|_| self.out.flush())
            .map_err(|source| SeriesError::Io {
                path: self.path.clone(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("flotilla-{name}-{}", std::process::id()))
    }

    #[test]
    fn writes_config_and_samples() {
        let root = scratch_dir("series");
        let mut dir = MetricsDir::create(&root).unwrap();
        dir.config_line("N: 4").unwrap();
        let mut series = dir.time_series("cycle, rate").unwrap();
        series.record(&CycleSample { cycle: 0, value: 1.5 }).unwrap();
        series.record(&CycleSample { cycle: 1, value: 2.0 }).unwrap();

        let config = fs::read_to_string(root.join("config.txt")).unwrap();
        assert_eq!(config, "N: 4\n");
        let times = fs::read_to_string(root.join("times.csv")).unwrap();
        assert_eq!(times, "# cycle, rate\n0,1.5\n1,2\n");

        // reopening truncates
        let dir = MetricsDir::create(&root).unwrap();
        drop(dir.time_series("cycle, rate").unwrap());
        let times = fs::read_to_string(root.join("times.csv")).unwrap();
        assert_eq!(times, "# cycle, rate\n");
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn vec_sink_collects() {
        let mut sink: Vec<CycleSample> = Vec::new();
        sink.record(&CycleSample { cycle: 3, value: 0.5 }).unwrap();
        assert_eq!(sink, vec![CycleSample { cycle: 3, value: 0.5 }]);
    }
}
