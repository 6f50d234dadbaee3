//src/config.rs

use std::fs;
use std::path::{Path, PathBuf};

use crate::assignments::RecordPolicy;
use crate::error::{Error, Result};

/// Taxonomic levels the re-estimation tool accepts.
pub const REESTIMATION_LEVELS: &[&str] = &["D", "P", "C", "O", "F", "G", "S", "S1"];

/// What to do with a barcode whose counts name a taxon the report lacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingTaxonPolicy {
    /// Log it, skip the barcode and keep going.
    #[default]
    Skip,
    /// Stop starting new barcodes; in-flight ones still finish.
    Abort,
}

/// Pipeline configuration, read from a `key=value` file:
/// ```text
/// # comment
/// sample=S1
/// outdir=/data/run1
/// braken=/opt/bracken/bracken
/// krakenDb=/db/k2_standard
/// process=8
/// ```
/// Keys this crate does not know are ignored, the same file also drives the
/// upstream steps.
#[derive(Debug, Clone)]
pub struct Config {
    pub sample: String,
    pub outdir: PathBuf,
    /// Number of barcode workers
    pub process: usize,
    /// Re-estimation executable
    pub bracken: PathBuf,
    pub kraken_db: PathBuf,
    pub read_length: u32,
    /// Levels to re-estimate every barcode at
    pub levels: Vec<String>,
    pub missing_taxon: MissingTaxonPolicy,
    pub malformed_records: RecordPolicy,
    /// Taxonomy report written by the classifier
    pub kraken_report: PathBuf,
    /// Per-read classification output
    pub kraken_output: PathBuf,
}

impl Config {
    /// A config with every optional key at its default.
    pub fn new<P, Q, R>(sample: &str, outdir: P, bracken: Q, kraken_db: R) -> Self
    where
        P: Into<PathBuf>,
        Q: Into<PathBuf>,
        R: Into<PathBuf>,
    {
        let outdir = outdir.into();
        let result_dir = outdir.join("Result");
        Self {
            sample: sample.to_string(),
            kraken_report: result_dir.join(format!("{sample}_kraken.report")),
            kraken_output: result_dir.join(format!("{sample}_kraken.output")),
            outdir,
            process: 4,
            bracken: bracken.into(),
            kraken_db: kraken_db.into(),
            read_length: 100,
            levels: vec!["S".to_string(), "G".to_string()],
            missing_taxon: MissingTaxonPolicy::default(),
            malformed_records: RecordPolicy::default(),
        }
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config = Self::parse(&contents)?;
        log::info!("Configuration loaded for sample {}", config.sample);
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let mut sample = None;
        let mut outdir = None;
        let mut bracken = None;
        let mut kraken_db = None;
        let mut process = None;
        let mut read_length = None;
        let mut levels = None;
        let mut missing_taxon = None;
        let mut malformed_records = None;
        let mut kraken_report = None;
        let mut kraken_output = None;

        for (i, raw) in contents.lines().enumerate() {
            if raw.starts_with('#') || raw.trim().is_empty() {
                continue;
            }
            let line: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
            let (key, value) = line.split_once('=').ok_or_else(|| {
                Error::Config(format!("line {}: expected key=value, found {raw:?}", i + 1))
            })?;

            match key {
                "sample" => sample = Some(value.to_string()),
                "outdir" => outdir = Some(PathBuf::from(value)),
                "braken" | "bracken" => bracken = Some(PathBuf::from(value)),
                "krakenDb" => kraken_db = Some(PathBuf::from(value)),
                "process" => process = Some(parse_number::<usize>(key, value)?),
                "read_length" => read_length = Some(parse_number::<u32>(key, value)?),
                "levels" => levels = Some(parse_levels(value)?),
                "on_missing_taxon" => missing_taxon = Some(parse_missing_taxon(value)?),
                "on_malformed_record" => malformed_records = Some(parse_record_policy(value)?),
                "kreport" => kraken_report = Some(PathBuf::from(value)),
                "koutput" => kraken_output = Some(PathBuf::from(value)),
                other => log::debug!("Ignoring config key {other}"),
            }
        }

        let sample = sample.ok_or_else(|| missing_key("sample"))?;
        let outdir = outdir.ok_or_else(|| missing_key("outdir"))?;
        let bracken = bracken.ok_or_else(|| missing_key("braken"))?;
        let kraken_db = kraken_db.ok_or_else(|| missing_key("krakenDb"))?;

        let mut config = Self::new(&sample, outdir, bracken, kraken_db);
        if let Some(process) = process {
            config.process = process;
        }
        if let Some(read_length) = read_length {
            config.read_length = read_length;
        }
        if let Some(levels) = levels {
            config.levels = levels;
        }
        if let Some(policy) = missing_taxon {
            config.missing_taxon = policy;
        }
        if let Some(policy) = malformed_records {
            config.malformed_records = policy;
        }
        if let Some(path) = kraken_report {
            config.kraken_report = path;
        }
        if let Some(path) = kraken_output {
            config.kraken_output = path;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.process == 0 {
            return Err(Error::Config("process must be at least 1".to_string()));
        }
        if self.levels.is_empty() {
            return Err(Error::Config("levels must name at least one level".to_string()));
        }
        for level in &self.levels {
            if !REESTIMATION_LEVELS.contains(&level.as_str()) {
                return Err(Error::Config(format!(
                    "unknown level {level}, expected one of {}",
                    REESTIMATION_LEVELS.join(",")
                )));
            }
        }
        Ok(())
    }

    pub fn result_dir(&self) -> PathBuf {
        self.outdir.join("Result")
    }

    pub fn layout(&self) -> Layout {
        Layout::new(self.result_dir())
    }
}

fn missing_key(key: &str) -> Error {
    Error::Config(format!("missing required key {key}"))
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("{key} must be a non-negative integer, found {value:?}")))
}

fn parse_levels(value: &str) -> Result<Vec<String>> {
    Ok(value
        .split(',')
        .filter(|level| !level.is_empty())
        .map(|level| level.to_uppercase())
        .collect())
}

fn parse_missing_taxon(value: &str) -> Result<MissingTaxonPolicy> {
    match value.to_lowercase().as_str() {
        "skip" => Ok(MissingTaxonPolicy::Skip),
        "abort" => Ok(MissingTaxonPolicy::Abort),
        _ => Err(Error::Config(format!(
            "on_missing_taxon must be skip or abort, found {value:?}"
        ))),
    }
}

fn parse_record_policy(value: &str) -> Result<RecordPolicy> {
    match value.to_lowercase().as_str() {
        "skip" => Ok(RecordPolicy::Skip),
        "abort" => Ok(RecordPolicy::Abort),
        _ => Err(Error::Config(format!(
            "on_malformed_record must be skip or abort, found {value:?}"
        ))),
    }
}

/// Where per-barcode files go, relative to `<outdir>/Result`:
/// ```text
/// bracken_tmp/<cb>.kreport                propagated per-barcode report
/// bracken_tmp/<cb>.<L>.bracken.log        re-estimation stdout/stderr
/// bracken_report_<l>/<cb>.<L>.bracken     re-estimated report per level
/// ```
///
/// Every level, species included, gets its own `bracken_report_<l>`
/// directory and a `<cb>.<L>.bracken` file name. Older pipelines wrote
/// species results to `braken_report/<cb>.braken` and genus results to
/// `braken_report_g/<cb>.G.braken`; consumers that split those names on `.`
/// expecting exactly two parts must be updated for this layout.
#[derive(Debug, Clone)]
pub struct Layout {
    pub result_dir: PathBuf,
    pub tmp_dir: PathBuf,
}

impl Layout {
    pub fn new<P: Into<PathBuf>>(result_dir: P) -> Self {
        let result_dir = result_dir.into();
        let tmp_dir = result_dir.join("bracken_tmp");
        Self {
            result_dir,
            tmp_dir,
        }
    }

    /// Creates every directory the run writes into. Safe to call twice.
    pub fn prepare(&self, levels: &[String]) -> Result<()> {
        fs::create_dir_all(&self.tmp_dir)?;
        for level in levels {
            fs::create_dir_all(self.level_dir(level))?;
        }
        Ok(())
    }

    pub fn barcode_report(&self, barcode: &str) -> PathBuf {
        self.tmp_dir.join(format!("{barcode}.kreport"))
    }

    pub fn level_dir(&self, level: &str) -> PathBuf {
        self.result_dir
            .join(format!("bracken_report_{}", level.to_lowercase()))
    }

    pub fn reestimated_report(&self, barcode: &str, level: &str) -> PathBuf {
        self.level_dir(level).join(format!("{barcode}.{level}.bracken"))
    }

    pub fn reestimate_log(&self, barcode: &str, level: &str) -> PathBuf {
        self.tmp_dir.join(format!("{barcode}.{level}.bracken.log"))
    }
}
