//! Positional, tab-delimited run manifest.
//!
//! Columns are read by position, not by header name. A reordered manifest
//! would silently misassign fields, so an unexpected header is reported but
//! never auto-corrected.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use serde::Serialize;
use tracing::warn;

use crate::domain::{RunId, SampleKey};
use crate::error::KiraError;

pub const RUN_COLUMN: usize = 0;
pub const SAMPLE_COLUMN: usize = 4;
pub const HEADER_SENTINEL: &str = "run_accession";
pub const COLUMN_NAMES: [&str; 5] = [
    "run_accession",
    "study_accession",
    "sample_accession",
    "experiment_accession",
    "library_name",
];

#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub run: RunId,
    pub sample: SampleKey,
    /// Every column other than run and sample, in file order.
    pub metadata: Vec<String>,
    pub line: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedRow {
    pub line: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SampleRuns {
    pub sample: SampleKey,
    pub runs: Vec<RunId>,
}

impl SampleRuns {
    pub fn expected_run_count(&self) -> usize {
        self.runs.len()
    }

    /// 1-based lane of each run, in manifest order.
    pub fn lanes(&self) -> impl Iterator<Item = (usize, &RunId)> {
        self.runs.iter().enumerate().map(|(idx, run)| (idx + 1, run))
    }

    pub fn lane_of(&self, run: &RunId) -> Option<usize> {
        self.runs.iter().position(|item| item == run).map(|idx| idx + 1)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Manifest {
    pub records: Vec<RunRecord>,
    pub samples: Vec<SampleRuns>,
    pub skipped: Vec<SkippedRow>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self, KiraError> {
        if !path.is_file() {
            return Err(KiraError::MissingManifest(path.to_path_buf()));
        }
        let content = fs::read_to_string(path).map_err(|err| KiraError::ManifestRead {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        Ok(Self::parse(&content))
    }

    pub fn parse(content: &str) -> Self {
        let mut manifest = Manifest::default();
        let mut seen_runs = HashSet::new();
        let mut sample_index: HashMap<SampleKey, usize> = HashMap::new();

        for (idx, raw_line) in content.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw_line.trim_end_matches('\r');
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            let first = fields.first().map(|v| v.trim()).unwrap_or_default();
            if first.eq_ignore_ascii_case(HEADER_SENTINEL) {
                check_header(&fields);
                continue;
            }

            let run_raw = fields.get(RUN_COLUMN).map(|v| v.trim()).unwrap_or_default();
            let sample_raw = fields
                .get(SAMPLE_COLUMN)
                .map(|v| v.trim())
                .unwrap_or_default();
            if run_raw.is_empty() || sample_raw.is_empty() {
                manifest.skip(line_no, "empty run accession or sample key".to_string());
                continue;
            }
            let run = match run_raw.parse::<RunId>() {
                Ok(run) => run,
                Err(err) => {
                    manifest.skip(line_no, err.to_string());
                    continue;
                }
            };
            let sample = match sample_raw.parse::<SampleKey>() {
                Ok(sample) => sample,
                Err(err) => {
                    manifest.skip(line_no, err.to_string());
                    continue;
                }
            };
            if !seen_runs.insert(run.clone()) {
                manifest.skip(line_no, format!("duplicate run accession {run}"));
                continue;
            }

            let metadata = fields
                .iter()
                .enumerate()
                .filter(|(col, _)| *col != RUN_COLUMN && *col != SAMPLE_COLUMN)
                .map(|(_, value)| value.to_string())
                .collect();

            let slot = *sample_index.entry(sample.clone()).or_insert_with(|| {
                manifest.samples.push(SampleRuns {
                    sample: sample.clone(),
                    runs: Vec::new(),
                });
                manifest.samples.len() - 1
            });
            manifest.samples[slot].runs.push(run.clone());
            manifest.records.push(RunRecord {
                run,
                sample,
                metadata,
                line: line_no,
            });
        }

        manifest
    }

    fn skip(&mut self, line: usize, reason: String) {
        warn!(line, %reason, "skipping manifest row");
        self.skipped.push(SkippedRow { line, reason });
    }

    pub fn sample(&self, key: &SampleKey) -> Option<&SampleRuns> {
        self.samples.iter().find(|entry| &entry.sample == key)
    }

    pub fn run_count(&self) -> usize {
        self.records.len()
    }
}

fn check_header(fields: &[&str]) {
    let sample_header = fields
        .get(SAMPLE_COLUMN)
        .map(|v| v.trim())
        .unwrap_or_default();
    if !sample_header.eq_ignore_ascii_case(COLUMN_NAMES[SAMPLE_COLUMN]) {
        warn!(
            column = SAMPLE_COLUMN + 1,
            header = sample_header,
            expected = COLUMN_NAMES[SAMPLE_COLUMN],
            "manifest header differs from the positional schema; using the column by position"
        );
    }
}
