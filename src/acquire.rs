//! Acquisition of one run: download, layout normalization, integrity checks,
//! and positional naming, ending in the `Acquired` marker.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::classify::{self, NamingStrategy};
use crate::config::PipelineConfig;
use crate::domain::{RunId, SampleKey, Stage};
use crate::error::KiraError;
use crate::fastq::{self, RepairOptions};
use crate::fs_util::{
    TEMP_PREFIX, fs_err, install_dir, is_gzip_name, list_read_files, move_file, sweep_prefixed,
    sweep_temp_dirs,
};
use crate::layout::Layout;
use crate::ledger::StatusLedger;
use crate::tools::AcquisitionClient;

pub const FETCH_FORMAT: &str = "fastq.gz";
const KNOWN_SUBDIRS: [&str; 2] = ["fastq", "fastqs"];
const FETCH_DIR: &str = "fetch";
const READS_DIR: &str = "reads";

/// One unit of acquisition work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkItem {
    pub run: RunId,
    pub sample: SampleKey,
    pub lane: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    AlreadyAcquired,
    /// Files from an earlier, unrecorded acquisition were found and marked.
    Backfilled,
    Acquired {
        files: usize,
        strategy: NamingStrategy,
        downloaded: bool,
        repaired: usize,
        recovered: usize,
    },
    /// File count outside 1..=4; nothing was renamed or marked.
    ClassificationFailed { count: usize },
}

impl RunOutcome {
    pub fn is_acquired(&self) -> bool {
        !matches!(self, RunOutcome::ClassificationFailed { .. })
    }
}

pub struct RunAcquirer<'a, A: AcquisitionClient> {
    client: &'a A,
    ledger: &'a StatusLedger,
    layout: &'a Layout,
    config: &'a PipelineConfig,
}

impl<'a, A: AcquisitionClient> RunAcquirer<'a, A> {
    pub fn new(
        client: &'a A,
        ledger: &'a StatusLedger,
        layout: &'a Layout,
        config: &'a PipelineConfig,
    ) -> Self {
        Self {
            client,
            ledger,
            layout,
            config,
        }
    }

    pub fn acquire(&self, item: &WorkItem) -> Result<RunOutcome, KiraError> {
        self.acquire_run(&item.run, &item.sample, item.lane)
    }

    pub fn acquire_run(
        &self,
        run: &RunId,
        sample: &SampleKey,
        lane: usize,
    ) -> Result<RunOutcome, KiraError> {
        if self.ledger.is_done(run.as_str(), Stage::Acquired) {
            return Ok(RunOutcome::AlreadyAcquired);
        }
        let Some(_claim) = self.ledger.claim(run.as_str(), Stage::Acquired)? else {
            return Err(KiraError::Claimed {
                entity: run.to_string(),
                stage: Stage::Acquired.to_string(),
                holder: self
                    .ledger
                    .claim_holder(run.as_str(), Stage::Acquired)
                    .unwrap_or_else(|| "unknown".to_string()),
            });
        };
        // Another process may have finished between the check and the claim.
        if self.ledger.is_done(run.as_str(), Stage::Acquired) {
            return Ok(RunOutcome::AlreadyAcquired);
        }

        let sample_dir = self.layout.sample_dir(sample).into_std_path_buf();
        let run_dir = self.layout.run_dir(sample, run).into_std_path_buf();
        fs::create_dir_all(&sample_dir).map_err(fs_err)?;
        let swept = sweep_temp_dirs(&run_dir)? + sweep_prefixed(&sample_dir, &scratch_prefix(run))?;
        if swept > 0 {
            info!(run = %run, swept, "removed leftovers of an interrupted acquisition");
        }

        if self.has_prior_output(run, sample, lane, &sample_dir, &run_dir)? {
            self.ledger.mark_done(run.as_str(), Stage::Acquired)?;
            info!(run = %run, sample = %sample, "existing files found; acquisition back-filled");
            return Ok(RunOutcome::Backfilled);
        }

        // Downloads are verified and named inside a scratch folder and only
        // reach `run_dir` as a whole; staged files are worked on in place.
        let downloaded = list_read_files(&run_dir)?.is_empty();
        let scratch = if downloaded {
            Some(self.download(run, &sample_dir)?)
        } else {
            info!(run = %run, "read files already staged; skipping download");
            None
        };
        let work_dir = match &scratch {
            Some(scratch) => scratch.path().join(READS_DIR),
            None => run_dir.clone(),
        };

        let mut files = compress_plain(list_read_files(&work_dir)?)?;
        let mut recovered = 0;
        if files.len() == 2 && self.config.expects_technical_reads(sample.as_str()) {
            warn!(
                run = %run,
                sample = %sample,
                "only two read files for a sample that looks chip-based; index reads may be missing"
            );
            if self.config.recover_technical_reads {
                recovered = self.recover(run, &work_dir);
                files = list_read_files(&work_dir)?;
            }
        }

        let repaired = self.check_integrity(run, &files)?;

        let standardized = classify::standardize(&work_dir, run);
        if scratch.is_some() {
            install_dir(&work_dir, &run_dir)?;
            debug!(run = %run, dir = %run_dir.display(), "verified download committed");
        }
        let set = match standardized {
            Ok(set) => set,
            Err(KiraError::Classification { count, .. }) => {
                warn!(run = %run, count, "unexpected read-file count; run left unmarked");
                return Ok(RunOutcome::ClassificationFailed { count });
            }
            Err(err) => return Err(err),
        };

        self.ledger.mark_done(run.as_str(), Stage::Acquired)?;
        info!(run = %run, sample = %sample, files = set.files.len(), "run acquired");
        Ok(RunOutcome::Acquired {
            files: set.files.len(),
            strategy: set.strategy,
            downloaded,
            repaired,
            recovered,
        })
    }

    fn has_prior_output(
        &self,
        run: &RunId,
        sample: &SampleKey,
        lane: usize,
        sample_dir: &Path,
        run_dir: &Path,
    ) -> Result<bool, KiraError> {
        let canonical = classify::canonical_files_for_lane(sample_dir, sample, lane)?;
        if classify::role_template(canonical.len()).is_some() {
            return Ok(true);
        }
        let staged = list_read_files(run_dir)?;
        let standardized = classify::role_template(staged.len()).is_some()
            && staged.iter().enumerate().all(|(idx, path)| {
                path.file_name().and_then(|name| name.to_str())
                    == Some(classify::standardized_name(run, idx + 1).as_str())
            });
        if !standardized {
            return Ok(false);
        }
        // A positional set that does not decode is handled as staged input.
        Ok(staged.iter().all(|path| fastq::check_stream(path).is_ok()))
    }

    /// Fetch into a fresh scratch folder in `sample_dir`, leaving the read
    /// files gathered under its `reads/` subdirectory.
    fn download(&self, run: &RunId, sample_dir: &Path) -> Result<TempDir, KiraError> {
        let attempts = self.config.download_attempts.max(1);
        let mut attempt = 1;
        loop {
            let scratch = tempfile::Builder::new()
                .prefix(&scratch_prefix(run))
                .tempdir_in(sample_dir)
                .map_err(fs_err)?;
            let fetch_dir = scratch.path().join(FETCH_DIR);
            let reads_dir = scratch.path().join(READS_DIR);
            fs::create_dir_all(&fetch_dir).map_err(fs_err)?;
            fs::create_dir_all(&reads_dir).map_err(fs_err)?;
            debug!(run = %run, attempt, dir = %fetch_dir.display(), "fetching run");
            let result = self.client.fetch_run(
                run,
                &self.config.retrieval_methods,
                self.config.threads_per_job,
                FETCH_FORMAT,
                &fetch_dir,
                self.config.download_timeout(),
            );
            match result {
                Ok(()) => {
                    let moved = normalize_layout(run, &fetch_dir, &reads_dir)?;
                    debug!(run = %run, moved, "download gathered for verification");
                    return Ok(scratch);
                }
                Err(err @ KiraError::ToolTimeout { .. }) => return Err(err),
                Err(err) if attempt < attempts => {
                    warn!(run = %run, attempt, error = %err, "download failed; retrying");
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Best effort: any failure is logged and the run proceeds with what it has.
    fn recover(&self, run: &RunId, work_dir: &Path) -> usize {
        let result = scratch_dir(work_dir).and_then(|scratch| {
            self.client.recover_technical_reads(
                run,
                scratch.path(),
                self.config.threads_per_job,
                self.config.download_timeout(),
            )?;
            merge_new_files(scratch.path(), work_dir)
        });
        match result {
            Ok(merged) => {
                info!(run = %run, merged, "technical-read recovery finished");
                merged
            }
            Err(err) => {
                warn!(run = %run, error = %err, "technical-read recovery failed; continuing");
                0
            }
        }
    }

    fn check_integrity(&self, run: &RunId, files: &[PathBuf]) -> Result<usize, KiraError> {
        let mut repaired = 0;
        for path in files {
            if let Err(err) = fastq::check_stream(path) {
                warn!(run = %run, path = %path.display(), error = %err, "deleting corrupt archive");
                fs::remove_file(path).map_err(fs_err)?;
                return Err(err);
            }
            if fastq::validate(path, self.config.validation_records)?.is_valid() {
                continue;
            }
            if !self.config.repair {
                warn!(run = %run, path = %path.display(), "invalid FASTQ kept; repair disabled");
                continue;
            }
            match fastq::repair(path, repair_options(self.config)) {
                Ok(_) => repaired += 1,
                Err(err) => {
                    warn!(run = %run, path = %path.display(), error = %err, "repair failed; keeping file")
                }
            }
        }
        Ok(repaired)
    }
}

pub fn repair_options(config: &PipelineConfig) -> RepairOptions {
    RepairOptions {
        max_bytes: config.repair_max_bytes,
        validation_records: config.repair_validation_records,
    }
}

fn scratch_dir(dir: &Path) -> Result<TempDir, KiraError> {
    tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempdir_in(dir)
        .map_err(fs_err)
}

/// Scratch folders in the sample directory carry the run name; only that
/// run's acquisition sweeps them.
fn scratch_prefix(run: &RunId) -> String {
    format!("{TEMP_PREFIX}-{run}-")
}

fn compress_plain(files: Vec<PathBuf>) -> Result<Vec<PathBuf>, KiraError> {
    files
        .into_iter()
        .map(|path| {
            if is_gzip_name(&path) {
                Ok(path)
            } else {
                fastq::compress_in_place(&path)
            }
        })
        .collect()
}

/// Move read files the tool left in `fetch_dir` (top level or a known
/// subdirectory) into `reads_dir`.
fn normalize_layout(run: &RunId, fetch_dir: &Path, reads_dir: &Path) -> Result<usize, KiraError> {
    let mut sources = vec![fetch_dir.to_path_buf(), fetch_dir.join(run.as_str())];
    sources.extend(KNOWN_SUBDIRS.iter().map(|name| fetch_dir.join(name)));

    let mut moved = 0;
    for dir in sources {
        for path in list_read_files(&dir)? {
            let Some(name) = path.file_name() else {
                continue;
            };
            move_file(&path, &reads_dir.join(name))?;
            moved += 1;
        }
    }
    Ok(moved)
}

/// Gzip recovered files and add those whose names `work_dir` lacks.
fn merge_new_files(scratch: &Path, work_dir: &Path) -> Result<usize, KiraError> {
    let existing: HashSet<_> = list_read_files(work_dir)?
        .into_iter()
        .filter_map(|path| path.file_name().map(|name| name.to_owned()))
        .collect();
    let mut merged = 0;
    for path in compress_plain(list_read_files(scratch)?)? {
        let Some(name) = path.file_name() else {
            continue;
        };
        if existing.contains(name) {
            continue;
        }
        move_file(&path, &work_dir.join(name))?;
        merged += 1;
    }
    Ok(merged)
}
