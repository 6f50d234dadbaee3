//src/reestimate.rs

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::config::{Config, Layout};
use crate::error::{Error, Result};

/// Abundance re-estimation of one per-barcode report at one taxonomic level.
///
/// Called from the worker pool, so implementations must be shareable across
/// threads. A failure only concerns the barcode at hand.
pub trait Reestimator: Sync {
    /// Re-estimates `report` for `barcode` at `level` and returns the output path.
    fn reestimate(&self, report: &Path, barcode: &str, level: &str) -> Result<PathBuf>;
}

/// Runs the Bracken executable:
/// ```text
/// bracken -d <db> -i <report> -o <output> -r <read_length> -l <level>
/// ```
/// stdout and stderr go to a per-barcode log in the layout's tmp dir.
#[derive(Debug, Clone)]
pub struct BrackenRunner {
    binary: PathBuf,
    database: PathBuf,
    read_length: u32,
    layout: Layout,
}

impl BrackenRunner {
    pub fn new(binary: PathBuf, database: PathBuf, read_length: u32, layout: Layout) -> Self {
        Self {
            binary,
            database,
            read_length,
            layout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.bracken.clone(),
            config.kraken_db.clone(),
            config.read_length,
            config.layout(),
        )
    }

    /// The command line for one invocation, without any stdio redirection.
    pub fn command(&self, report: &Path, output: &Path, level: &str) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-d")
            .arg(&self.database)
            .arg("-i")
            .arg(report)
            .arg("-o")
            .arg(output)
            .arg("-r")
            .arg(self.read_length.to_string())
            .arg("-l")
            .arg(level);
        cmd
    }
}

impl Reestimator for BrackenRunner {
    fn reestimate(&self, report: &Path, barcode: &str, level: &str) -> Result<PathBuf> {
        let failure = |reason: String| Error::Reestimation {
            barcode: barcode.to_string(),
            level: level.to_string(),
            reason,
        };

        let output = self.layout.reestimated_report(barcode, level);
        let log_path = self.layout.reestimate_log(barcode, level);
        let log = File::create(&log_path)
            .map_err(|e| failure(format!("cannot create log {}: {e}", log_path.display())))?;
        let log_err = log
            .try_clone()
            .map_err(|e| failure(format!("cannot share log handle: {e}")))?;

        let status = self
            .command(report, &output, level)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .status()
            .map_err(|e| failure(format!("cannot run {}: {e}", self.binary.display())))?;

        if !status.success() {
            return Err(failure(format!(
                "{} exited with {status}, see {}",
                self.binary.display(),
                log_path.display()
            )));
        }
        Ok(output)
    }
}
