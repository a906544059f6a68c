//! Per-sample state machine from "all runs acquired" to "inputs deleted".
//!
//! Every pass re-derives where a sample stands from the ledger and walks the
//! phases in order, skipping the ones whose marker already exists. The pass
//! ends in `Complete` or in `Blocked`, which is absorbing for the pass.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use crate::acquire::repair_options;
use crate::classify;
use crate::config::PipelineConfig;
use crate::domain::{SampleKey, Stage};
use crate::error::KiraError;
use crate::fastq;
use crate::fs_util::{fs_err, list_read_files, remove_dir_if_empty, sweep_temp_dirs, walk_read_files};
use crate::layout::Layout;
use crate::ledger::{ClaimGuard, StatusLedger};
use crate::manifest::SampleRuns;
use crate::tools::{QuantClient, QuantRequest};

/// Intermediate directories the quantifier leaves next to its outputs.
pub const CLEANUP_DIRS: [&str; 3] = ["SC_RNA_COUNTER_CS", "SC_MULTI_CS", "_tmp"];
pub const FILTERED_MATRIX: &str = "filtered_feature_bc_matrix";
pub const RAW_MATRIX: &str = "raw_feature_bc_matrix";
const MATRIX_FILE: &str = "matrix.mtx.gz";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplePhase {
    CollectingRuns,
    AwaitingAcquisition,
    Organizing,
    ReadyForQuantification,
    Quantifying,
    Verifying,
    CleaningUp,
    DeletingInputs,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SampleState {
    Complete { inputs_retained: bool },
    Blocked { at: SamplePhase, reason: String },
}

impl SampleState {
    pub fn is_complete(&self) -> bool {
        matches!(self, SampleState::Complete { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SampleReport {
    pub sample: SampleKey,
    pub expected_runs: usize,
    pub acquired_runs: usize,
    pub state: SampleState,
    /// Whether the quantifier was invoked during this pass.
    pub quantified: bool,
    pub repaired_files: usize,
}

enum Step {
    Next(SamplePhase),
    Done { inputs_retained: bool },
    Blocked(String),
}

pub struct SampleDriver<'a, Q: QuantClient> {
    quant: &'a Q,
    ledger: &'a StatusLedger,
    layout: &'a Layout,
    config: &'a PipelineConfig,
}

struct Pass<'r> {
    runs: &'r SampleRuns,
    sample_dir: PathBuf,
    quant_dir: PathBuf,
    acquired: usize,
    quantified: bool,
    repaired: usize,
    quant_claim: Option<ClaimGuard>,
}

impl<'a, Q: QuantClient> SampleDriver<'a, Q> {
    pub fn new(
        quant: &'a Q,
        ledger: &'a StatusLedger,
        layout: &'a Layout,
        config: &'a PipelineConfig,
    ) -> Self {
        Self {
            quant,
            ledger,
            layout,
            config,
        }
    }

    pub fn drive(&self, runs: &SampleRuns) -> SampleReport {
        let sample = &runs.sample;
        let mut pass = Pass {
            runs,
            sample_dir: self.layout.sample_dir(sample).into_std_path_buf(),
            quant_dir: self.layout.quant_dir(sample).into_std_path_buf(),
            acquired: 0,
            quantified: false,
            repaired: 0,
            quant_claim: None,
        };

        let mut phase = SamplePhase::CollectingRuns;
        let state = loop {
            let step = match self.step(phase, &mut pass) {
                Ok(step) => step,
                Err(err) => Step::Blocked(err.to_string()),
            };
            match step {
                Step::Next(next) => phase = next,
                Step::Done { inputs_retained } => {
                    break SampleState::Complete { inputs_retained };
                }
                Step::Blocked(reason) => {
                    warn!(sample = %sample, phase = ?phase, %reason, "sample blocked");
                    break SampleState::Blocked { at: phase, reason };
                }
            }
        };
        drop(pass.quant_claim.take());

        SampleReport {
            sample: sample.clone(),
            expected_runs: runs.expected_run_count(),
            acquired_runs: pass.acquired,
            state,
            quantified: pass.quantified,
            repaired_files: pass.repaired,
        }
    }

    fn step(&self, phase: SamplePhase, pass: &mut Pass<'_>) -> Result<Step, KiraError> {
        let runs = pass.runs;
        let sample = &runs.sample;
        match phase {
            SamplePhase::CollectingRuns => {
                pass.acquired = self.ledger.count_done(
                    pass.runs.runs.iter().map(|run| run.as_str()),
                    Stage::Acquired,
                );
                Ok(Step::Next(SamplePhase::AwaitingAcquisition))
            }
            SamplePhase::AwaitingAcquisition => {
                let expected = pass.runs.expected_run_count();
                if pass.acquired < expected {
                    return Ok(Step::Blocked(format!(
                        "{} of {expected} runs acquired",
                        pass.acquired
                    )));
                }
                Ok(Step::Next(SamplePhase::Organizing))
            }
            SamplePhase::Organizing => {
                if !self.ledger.is_done(sample.as_str(), Stage::TenxFormatted) {
                    let Some(_claim) = self.claim(sample, Stage::TenxFormatted)? else {
                        return Ok(Step::Blocked(self.claimed_reason(sample, Stage::TenxFormatted)));
                    };
                    let organized = self.organize(pass)?;
                    let expected = pass.runs.expected_run_count();
                    if organized != expected {
                        return Ok(Step::Blocked(format!(
                            "{organized} of {expected} runs organized"
                        )));
                    }
                    self.ledger.mark_done(sample.as_str(), Stage::TenxFormatted)?;
                    info!(sample = %sample, runs = organized, "sample organized");
                }
                Ok(Step::Next(SamplePhase::ReadyForQuantification))
            }
            SamplePhase::ReadyForQuantification => {
                if !self.ledger.is_done(sample.as_str(), Stage::QuantificationComplete) {
                    self.validate_inputs(pass)?;
                }
                Ok(Step::Next(SamplePhase::Quantifying))
            }
            SamplePhase::Quantifying => {
                if self.ledger.is_done(sample.as_str(), Stage::QuantificationComplete) {
                    return Ok(Step::Next(SamplePhase::Verifying));
                }
                let Some(claim) = self.claim(sample, Stage::QuantificationComplete)? else {
                    return Ok(Step::Blocked(
                        self.claimed_reason(sample, Stage::QuantificationComplete),
                    ));
                };
                pass.quant_claim = Some(claim);
                let reference = self.config.require_reference()?;
                info!(sample = %sample, "starting quantification");
                pass.quantified = true;
                self.quant.quantify(&QuantRequest {
                    sample,
                    reference,
                    fastq_dir: &pass.sample_dir,
                    out_dir: &pass.quant_dir,
                    cores: self.config.threads_per_job,
                    memory_gb: self.config.quant_memory_gb,
                    timeout: self.config.quant_timeout(),
                })?;
                Ok(Step::Next(SamplePhase::Verifying))
            }
            SamplePhase::Verifying => {
                let missing = missing_matrices(&pass.quant_dir, sample);
                if !missing.is_empty() {
                    let err = KiraError::QuantVerification {
                        sample: sample.to_string(),
                        missing: missing.join(", "),
                    };
                    return Ok(Step::Blocked(format!("{err}; inputs preserved")));
                }
                self.ledger
                    .mark_done(sample.as_str(), Stage::QuantificationComplete)?;
                pass.quant_claim = None;
                Ok(Step::Next(SamplePhase::CleaningUp))
            }
            SamplePhase::CleaningUp => {
                if !self.ledger.is_done(sample.as_str(), Stage::TempCleaned) {
                    let removed = clean_quant_intermediates(&pass.quant_dir, sample)?;
                    self.ledger.mark_done(sample.as_str(), Stage::TempCleaned)?;
                    info!(sample = %sample, removed, "quantification intermediates removed");
                }
                Ok(Step::Next(SamplePhase::DeletingInputs))
            }
            SamplePhase::DeletingInputs => {
                if self.config.keep_inputs
                    || self.ledger.is_done(sample.as_str(), Stage::InputsDeleted)
                {
                    return Ok(Step::Next(SamplePhase::Complete));
                }
                let Some(_claim) = self.claim(sample, Stage::InputsDeleted)? else {
                    return Ok(Step::Blocked(self.claimed_reason(sample, Stage::InputsDeleted)));
                };
                let deleted = self.delete_inputs(pass)?;
                self.ledger.mark_done(sample.as_str(), Stage::InputsDeleted)?;
                info!(sample = %sample, deleted, "input reads deleted");
                Ok(Step::Next(SamplePhase::Complete))
            }
            SamplePhase::Complete => Ok(Step::Done {
                inputs_retained: !self.ledger.is_done(sample.as_str(), Stage::InputsDeleted),
            }),
        }
    }

    fn claim(&self, sample: &SampleKey, stage: Stage) -> Result<Option<ClaimGuard>, KiraError> {
        self.ledger.claim(sample.as_str(), stage)
    }

    fn claimed_reason(&self, sample: &SampleKey, stage: Stage) -> String {
        KiraError::Claimed {
            entity: sample.to_string(),
            stage: stage.to_string(),
            holder: self
                .ledger
                .claim_holder(sample.as_str(), stage)
                .unwrap_or_else(|| "unknown".to_string()),
        }
        .to_string()
    }

    /// Move every run's positional files into the sample directory under
    /// canonical names. Returns how many runs ended up organized.
    fn organize(&self, pass: &Pass<'_>) -> Result<usize, KiraError> {
        let sample = &pass.runs.sample;
        fs::create_dir_all(&pass.sample_dir).map_err(fs_err)?;
        let mut organized = 0;
        for (lane, run) in pass.runs.lanes() {
            let run_dir = self.layout.run_dir(sample, run).into_std_path_buf();
            match classify::rename_to_canonical(&run_dir, run, sample, lane, &pass.sample_dir) {
                Ok(_) => organized += 1,
                Err(err) => {
                    warn!(sample = %sample, run = %run, lane, error = %err, "run not organized")
                }
            }
        }
        Ok(organized)
    }

    fn validate_inputs(&self, pass: &mut Pass<'_>) -> Result<(), KiraError> {
        let runs = pass.runs;
        let sample = &runs.sample;
        let files = canonical_files(&pass.sample_dir, sample)?;
        if files.is_empty() {
            return Err(KiraError::Organize {
                sample: sample.to_string(),
                message: "no canonical read files in the sample directory".to_string(),
            });
        }
        for path in files {
            if fastq::validate(&path, self.config.validation_records)?.is_valid() {
                continue;
            }
            if !self.config.repair {
                warn!(sample = %sample, path = %path.display(), "invalid FASTQ handed to quantification");
                continue;
            }
            match fastq::repair(&path, repair_options(self.config)) {
                Ok(_) => pass.repaired += 1,
                Err(err) => {
                    warn!(sample = %sample, path = %path.display(), error = %err, "repair failed; continuing")
                }
            }
        }
        Ok(())
    }

    fn delete_inputs(&self, pass: &Pass<'_>) -> Result<usize, KiraError> {
        let sample = &pass.runs.sample;
        let files = walk_read_files(&pass.sample_dir, &[pass.quant_dir.as_path()])?;
        for path in &files {
            fs::remove_file(path).map_err(fs_err)?;
        }
        for run in &pass.runs.runs {
            let run_dir = self.layout.run_dir(sample, run).into_std_path_buf();
            sweep_temp_dirs(&run_dir)?;
            remove_dir_if_empty(&run_dir)?;
        }
        Ok(files.len())
    }
}

fn canonical_files(sample_dir: &Path, sample: &SampleKey) -> Result<Vec<PathBuf>, KiraError> {
    Ok(list_read_files(sample_dir)?
        .into_iter()
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .and_then(classify::parse_canonical)
                .map(|parsed| parsed.sample == sample.as_str())
                .unwrap_or(false)
        })
        .collect())
}

fn output_roots(quant_dir: &Path, sample: &SampleKey) -> [PathBuf; 2] {
    [quant_dir.join(sample.as_str()), quant_dir.to_path_buf()]
}

/// Matrix directories missing from both accepted output locations.
pub fn missing_matrices(quant_dir: &Path, sample: &SampleKey) -> Vec<String> {
    [FILTERED_MATRIX, RAW_MATRIX]
        .into_iter()
        .filter(|matrix| {
            !output_roots(quant_dir, sample)
                .iter()
                .any(|root| root.join("outs").join(matrix).join(MATRIX_FILE).is_file())
        })
        .map(|matrix| format!("{matrix}/{MATRIX_FILE}"))
        .collect()
}

fn clean_quant_intermediates(quant_dir: &Path, sample: &SampleKey) -> Result<usize, KiraError> {
    let mut removed = 0;
    for root in output_roots(quant_dir, sample) {
        for name in CLEANUP_DIRS {
            let dir = root.join(name);
            if dir.is_dir() {
                fs::remove_dir_all(&dir).map_err(fs_err)?;
                removed += 1;
            }
        }
    }
    Ok(removed)
}
