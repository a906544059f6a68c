use std::path::Path;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::acquire::{RunAcquirer, RunOutcome, WorkItem};
use crate::config::PipelineConfig;
use crate::domain::{RunId, SampleKey, Stage};
use crate::error::KiraError;
use crate::fastq::{self, FastqCheck, RepairOptions, RepairOutcome};
use crate::layout::Layout;
use crate::ledger::StatusLedger;
use crate::manifest::Manifest;
use crate::pool;
use crate::sample::{SampleDriver, SampleReport, SampleState};
use crate::tools::{AcquisitionClient, QuantClient};

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone, Serialize)]
pub struct StageCount {
    pub stage: Stage,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunFailure {
    pub run: RunId,
    pub sample: SampleKey,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run: RunId,
    pub sample: SampleKey,
    pub lane: usize,
    #[serde(flatten)]
    pub outcome: RunOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletedSample {
    pub sample: SampleKey,
    pub inputs_retained: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SampleBlocker {
    pub sample: SampleKey,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineSummary {
    pub base_dir: String,
    pub stage_counts: Vec<StageCount>,
    pub runs: Vec<RunResult>,
    pub run_failures: Vec<RunFailure>,
    pub samples: Vec<SampleReport>,
    pub completed: Vec<CompletedSample>,
    pub blocked: Vec<SampleBlocker>,
    pub skipped_manifest_rows: usize,
}

impl PipelineSummary {
    pub fn has_failures(&self) -> bool {
        !self.run_failures.is_empty() || !self.blocked.is_empty()
    }
}

/// Where one sample stands according to the manifest and the ledger.
#[derive(Debug, Clone, Serialize)]
pub struct SampleProgress {
    pub sample: SampleKey,
    pub expected_runs: usize,
    pub acquired_runs: usize,
    pub pending_runs: Vec<RunId>,
    pub stages_done: Vec<Stage>,
}

impl SampleProgress {
    pub fn ready_for_quantification(&self) -> bool {
        self.acquired_runs == self.expected_runs
    }
}

/// Rebuilt on every invocation; never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRunState {
    pub samples: Vec<SampleProgress>,
}

impl PipelineRunState {
    pub fn rebuild(manifest: &Manifest, ledger: &StatusLedger) -> Self {
        let samples = manifest
            .samples
            .iter()
            .map(|entry| {
                let pending_runs: Vec<RunId> = entry
                    .runs
                    .iter()
                    .filter(|run| !ledger.is_done(run.as_str(), Stage::Acquired))
                    .cloned()
                    .collect();
                let stages_done = Stage::ALL
                    .into_iter()
                    .filter(|stage| *stage != Stage::Acquired)
                    .filter(|stage| ledger.is_done(entry.sample.as_str(), *stage))
                    .collect();
                SampleProgress {
                    sample: entry.sample.clone(),
                    expected_runs: entry.expected_run_count(),
                    acquired_runs: entry.expected_run_count() - pending_runs.len(),
                    pending_runs,
                    stages_done,
                }
            })
            .collect();
        Self { samples }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub base_dir: String,
    pub status_root: String,
    pub stage_counts: Vec<StageCount>,
    pub state: PipelineRunState,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedSample {
    pub sample: SampleKey,
    pub pending_runs: usize,
    /// First sample stage that has not been marked yet, if any.
    pub next_stage: Option<Stage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DryRunPlan {
    pub acquisitions: Vec<WorkItem>,
    pub samples: Vec<PlannedSample>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResetResult {
    pub stage: Stage,
    pub entity: Option<String>,
    pub removed: usize,
}

pub struct App<A: AcquisitionClient, Q: QuantClient> {
    config: PipelineConfig,
    layout: Layout,
    ledger: StatusLedger,
    acquisition: A,
    quant: Q,
}

impl<A: AcquisitionClient, Q: QuantClient> App<A, Q> {
    pub fn new(config: PipelineConfig, acquisition: A, quant: Q) -> Result<Self, KiraError> {
        let layout = Layout::from_config(&config)?;
        let ledger = StatusLedger::new(layout.status_root().to_path_buf(), config.claim_ttl());
        Ok(Self {
            config,
            layout,
            ledger,
            acquisition,
            quant,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &StatusLedger {
        &self.ledger
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn load_manifest(&self) -> Result<Manifest, KiraError> {
        Manifest::load(&self.config.manifest)
    }

    /// One full pass: acquire pending runs in parallel, then drive every
    /// sample in manifest order. Per-entity failures end up in the summary;
    /// only setup problems return `Err`.
    pub fn run(
        &self,
        manifest: &Manifest,
        sink: &dyn ProgressSink,
    ) -> Result<PipelineSummary, KiraError> {
        let started = Instant::now();
        self.config.require_reference()?;
        self.layout.ensure_base()?;

        let items = pending_work(manifest, &self.ledger);
        sink.event(ProgressEvent {
            message: format!(
                "phase=Acquire; {} of {} runs pending",
                items.len(),
                manifest.run_count()
            ),
            elapsed: Some(started.elapsed()),
        });

        let acquirer = RunAcquirer::new(&self.acquisition, &self.ledger, &self.layout, &self.config);
        let outcomes = pool::run_all(&items, self.config.parallel_jobs, |item| acquirer.acquire(item));

        let mut runs = Vec::with_capacity(items.len());
        let mut run_failures = Vec::new();
        for (item, outcome) in items.iter().zip(outcomes) {
            match outcome {
                Ok(outcome) => {
                    if let RunOutcome::ClassificationFailed { count } = &outcome {
                        run_failures.push(RunFailure {
                            run: item.run.clone(),
                            sample: item.sample.clone(),
                            message: KiraError::Classification {
                                run: item.run.to_string(),
                                count: *count,
                            }
                            .to_string(),
                        });
                    }
                    runs.push(RunResult {
                        run: item.run.clone(),
                        sample: item.sample.clone(),
                        lane: item.lane,
                        outcome,
                    });
                }
                Err(err) => {
                    warn!(run = %item.run, sample = %item.sample, error = %err, "run acquisition failed");
                    run_failures.push(RunFailure {
                        run: item.run.clone(),
                        sample: item.sample.clone(),
                        message: err.to_string(),
                    });
                }
            }
        }
        sink.event(ProgressEvent {
            message: format!(
                "phase=Acquire; {} runs done, {} failed",
                runs.iter().filter(|run| run.outcome.is_acquired()).count(),
                run_failures.len()
            ),
            elapsed: Some(started.elapsed()),
        });

        let state = PipelineRunState::rebuild(manifest, &self.ledger);
        let driver = SampleDriver::new(&self.quant, &self.ledger, &self.layout, &self.config);
        let mut samples = Vec::with_capacity(manifest.samples.len());
        for (entry, progress) in manifest.samples.iter().zip(&state.samples) {
            sink.event(ProgressEvent {
                message: format!(
                    "phase=Sample; {} ({}/{} runs acquired)",
                    entry.sample, progress.acquired_runs, progress.expected_runs
                ),
                elapsed: Some(started.elapsed()),
            });
            samples.push(driver.drive(entry));
        }

        let summary = self.summarize(manifest, runs, run_failures, samples);
        info!(
            completed = summary.completed.len(),
            blocked = summary.blocked.len(),
            failed_runs = summary.run_failures.len(),
            "pipeline pass finished"
        );
        sink.event(ProgressEvent {
            message: "phase=Done".to_string(),
            elapsed: Some(started.elapsed()),
        });
        Ok(summary)
    }

    fn summarize(
        &self,
        manifest: &Manifest,
        runs: Vec<RunResult>,
        run_failures: Vec<RunFailure>,
        samples: Vec<SampleReport>,
    ) -> PipelineSummary {
        let mut completed = Vec::new();
        let mut blocked = Vec::new();
        for report in &samples {
            match &report.state {
                SampleState::Complete { inputs_retained } => completed.push(CompletedSample {
                    sample: report.sample.clone(),
                    inputs_retained: *inputs_retained,
                }),
                SampleState::Blocked { at, reason } => blocked.push(SampleBlocker {
                    sample: report.sample.clone(),
                    reason: format!("{at:?}: {reason}"),
                }),
            }
        }
        PipelineSummary {
            base_dir: self.layout.base_dir().to_string(),
            stage_counts: self.stage_counts(),
            runs,
            run_failures,
            samples,
            completed,
            blocked,
            skipped_manifest_rows: manifest.skipped.len(),
        }
    }

    fn stage_counts(&self) -> Vec<StageCount> {
        Stage::ALL
            .into_iter()
            .map(|stage| StageCount {
                stage,
                count: self.ledger.count(stage),
            })
            .collect()
    }

    /// Ledger and manifest view with no side effects.
    pub fn status(&self, manifest: &Manifest) -> StatusReport {
        StatusReport {
            base_dir: self.layout.base_dir().to_string(),
            status_root: self.layout.status_root().to_string(),
            stage_counts: self.stage_counts(),
            state: PipelineRunState::rebuild(manifest, &self.ledger),
        }
    }

    /// What a `run` would do next, without touching anything.
    pub fn dry_run(&self, manifest: &Manifest) -> DryRunPlan {
        let state = PipelineRunState::rebuild(manifest, &self.ledger);
        let samples = state
            .samples
            .iter()
            .map(|progress| PlannedSample {
                sample: progress.sample.clone(),
                pending_runs: progress.pending_runs.len(),
                next_stage: [
                    Stage::TenxFormatted,
                    Stage::QuantificationComplete,
                    Stage::TempCleaned,
                    Stage::InputsDeleted,
                ]
                .into_iter()
                .filter(|stage| !(self.config.keep_inputs && *stage == Stage::InputsDeleted))
                .find(|stage| !progress.stages_done.contains(stage)),
            })
            .collect();
        DryRunPlan {
            acquisitions: pending_work(manifest, &self.ledger),
            samples,
        }
    }

    /// Operator reset: forget `stage` for one entity or for all of them.
    pub fn reset(&self, stage: Stage, entity: Option<&str>) -> Result<ResetResult, KiraError> {
        let removed = self.ledger.reset(stage, entity)?;
        info!(stage = %stage, entity = entity.unwrap_or("*"), removed, "markers reset");
        Ok(ResetResult {
            stage,
            entity: entity.map(str::to_string),
            removed,
        })
    }
}

/// Work items for every run not yet marked `Acquired`, lanes in manifest order.
pub fn pending_work(manifest: &Manifest, ledger: &StatusLedger) -> Vec<WorkItem> {
    manifest
        .samples
        .iter()
        .flat_map(|entry| {
            entry.lanes().map(|(lane, run)| WorkItem {
                run: run.clone(),
                sample: entry.sample.clone(),
                lane,
            })
        })
        .filter(|item| !ledger.is_done(item.run.as_str(), Stage::Acquired))
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub path: String,
    pub check: FastqCheck,
    pub repaired: Option<RepairOutcome>,
}

/// Standalone check of one FASTQ file, optionally repairing it when the
/// sampled prefix is malformed.
pub fn validate_file(
    path: &Path,
    records: usize,
    repair: Option<RepairOptions>,
) -> Result<ValidationReport, KiraError> {
    fastq::check_stream(path)?;
    let check = fastq::validate(path, records)?;
    let repaired = match repair {
        Some(options) if !check.is_valid() => Some(fastq::repair(path, options)?),
        _ => None,
    };
    let check = if repaired.is_some() {
        fastq::validate(path, records)?
    } else {
        check
    };
    Ok(ValidationReport {
        path: path.display().to_string(),
        check,
        repaired,
    })
}
