use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use flate2::Compression;
use flate2::write::GzEncoder;
use tempfile::TempDir;

use kira_sc_prep::acquire::RunOutcome;
use kira_sc_prep::app::{App, PipelineSummary};
use kira_sc_prep::config::{Config, ConfigLoader, PipelineConfig};
use kira_sc_prep::domain::{RunId, Stage};
use kira_sc_prep::error::KiraError;
use kira_sc_prep::output::JsonOutput;
use kira_sc_prep::sample::{SamplePhase, SampleState};
use kira_sc_prep::tools::{AcquisitionClient, QuantClient, QuantRequest};

const HEADER: &str =
    "run_accession\tstudy_accession\tsample_accession\texperiment_accession\tlibrary_name";

fn records(tag: &str, n: usize) -> String {
    (0..n)
        .map(|i| format!("@{tag}.{i}\nACGTACGT\n+\nIIIIIIII\n"))
        .collect()
}

fn gz(text: &str) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(text.as_bytes()).unwrap();
    encoder.finish().unwrap()
}

fn write_file(path: &Path, bytes: &[u8]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, bytes).unwrap();
}

fn read_gz(path: &Path) -> String {
    use std::io::Read;
    let mut text = String::new();
    flate2::read::MultiGzDecoder::new(fs::File::open(path).unwrap())
        .read_to_string(&mut text)
        .unwrap();
    text
}

type FileSpec = Vec<(String, Vec<u8>)>;

/// Writes canned files per run; file names may include a subdirectory.
#[derive(Default)]
struct MockAcquisition {
    fetched: HashMap<String, FileSpec>,
    recovered: HashMap<String, FileSpec>,
    failing: HashSet<String>,
    fetch_calls: Arc<Mutex<Vec<String>>>,
    recovery_calls: Arc<Mutex<Vec<String>>>,
}

impl MockAcquisition {
    fn with_run(mut self, run: &str, names: &[&str]) -> Self {
        let files = names
            .iter()
            .map(|name| (name.to_string(), gz(&records(name, 8))))
            .collect();
        self.fetched.insert(run.to_string(), files);
        self
    }

    fn with_raw(mut self, run: &str, name: &str, bytes: Vec<u8>) -> Self {
        self.fetched
            .entry(run.to_string())
            .or_default()
            .push((name.to_string(), bytes));
        self
    }

    fn failing(mut self, run: &str) -> Self {
        self.failing.insert(run.to_string());
        self
    }
}

fn place(files: &FileSpec, out_dir: &Path) {
    for (name, bytes) in files {
        write_file(&out_dir.join(name), bytes);
    }
}

impl AcquisitionClient for MockAcquisition {
    fn fetch_run(
        &self,
        run: &RunId,
        _methods: &[String],
        _threads: usize,
        format: &str,
        out_dir: &Path,
        _timeout: Duration,
    ) -> Result<(), KiraError> {
        assert_eq!(format, "fastq.gz");
        self.fetch_calls.lock().unwrap().push(run.to_string());
        if self.failing.contains(run.as_str()) {
            return Err(KiraError::ToolFailed {
                tool: "mock".to_string(),
                message: "network unreachable".to_string(),
            });
        }
        place(self.fetched.get(run.as_str()).unwrap_or(&Vec::new()), out_dir);
        Ok(())
    }

    fn recover_technical_reads(
        &self,
        run: &RunId,
        out_dir: &Path,
        _threads: usize,
        _timeout: Duration,
    ) -> Result<(), KiraError> {
        self.recovery_calls.lock().unwrap().push(run.to_string());
        place(self.recovered.get(run.as_str()).unwrap_or(&Vec::new()), out_dir);
        Ok(())
    }
}

#[derive(Default)]
struct MockQuant {
    raw_only: bool,
    calls: Arc<Mutex<Vec<String>>>,
    inputs_seen: Arc<Mutex<Vec<String>>>,
}

impl QuantClient for MockQuant {
    fn quantify(&self, request: &QuantRequest<'_>) -> Result<(), KiraError> {
        self.calls.lock().unwrap().push(request.sample.to_string());
        let mut names: Vec<String> = fs::read_dir(request.fastq_dir)
            .unwrap()
            .flatten()
            .filter(|entry| entry.path().is_file())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        self.inputs_seen.lock().unwrap().extend(names);

        let outs = request.out_dir.join(request.sample.as_str()).join("outs");
        write_file(&outs.join("raw_feature_bc_matrix/matrix.mtx.gz"), b"raw");
        if !self.raw_only {
            write_file(&outs.join("filtered_feature_bc_matrix/matrix.mtx.gz"), b"filtered");
        }
        write_file(
            &request
                .out_dir
                .join(request.sample.as_str())
                .join("SC_RNA_COUNTER_CS/chunk.bin"),
            b"scratch",
        );
        Ok(())
    }
}

struct Fixture {
    temp: TempDir,
}

impl Fixture {
    fn new(rows: &[(&str, &str)]) -> Self {
        let temp = tempfile::tempdir().unwrap();
        let mut text = format!("{HEADER}\n");
        for (run, sample) in rows {
            text.push_str(&format!("{run}\tPRJ1\tSAMN1\tSRX1\t{sample}\n"));
        }
        fs::write(temp.path().join("manifest.tsv"), text).unwrap();
        fs::create_dir_all(temp.path().join("reference")).unwrap();
        Self { temp }
    }

    fn base(&self) -> PathBuf {
        self.temp.path().join("out")
    }

    fn config(&self, tweak: impl FnOnce(&mut Config)) -> PipelineConfig {
        let mut config = Config {
            manifest: Some(self.temp.path().join("manifest.tsv")),
            base_dir: Some(self.base()),
            reference: Some(self.temp.path().join("reference")),
            parallel_jobs: Some(2),
            threads_per_job: Some(1),
            technical_read_markers: Some(Vec::new()),
            ..Config::default()
        };
        tweak(&mut config);
        ConfigLoader::resolve_config(config).unwrap()
    }

    fn run(
        &self,
        config: PipelineConfig,
        acquisition: MockAcquisition,
        quant: MockQuant,
    ) -> PipelineSummary {
        let app = App::new(config, acquisition, quant).unwrap();
        let manifest = app.load_manifest().unwrap();
        app.run(&manifest, &JsonOutput).unwrap()
    }

    /// Every file below the output tree with its bytes, sorted by path.
    fn snapshot(&self) -> Vec<(String, Vec<u8>)> {
        let mut out = Vec::new();
        let mut stack = vec![self.base()];
        while let Some(dir) = stack.pop() {
            for entry in fs::read_dir(&dir).unwrap().flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    let rel = path.strip_prefix(self.base()).unwrap();
                    out.push((rel.display().to_string(), fs::read(&path).unwrap()));
                }
            }
        }
        out.sort();
        out
    }
}

fn calls(handle: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
    handle.lock().unwrap().clone()
}

#[test]
fn two_runs_become_two_lanes_of_one_sample() {
    let fx = Fixture::new(&[("RUN1", "S1"), ("RUN2", "S1")]);
    let acquisition = MockAcquisition::default()
        .with_run("RUN1", &["RUN1_1.fastq.gz", "RUN1_2.fastq.gz"])
        .with_run("RUN2", &["RUN2_1.fastq.gz", "RUN2_2.fastq.gz"]);
    let quant = MockQuant::default();
    let quant_calls = quant.calls.clone();
    let inputs_seen = quant.inputs_seen.clone();

    let summary = fx.run(fx.config(|c| c.keep_inputs = Some(true)), acquisition, quant);

    assert_eq!(calls(&quant_calls), vec!["S1"]);
    assert_eq!(
        calls(&inputs_seen),
        vec![
            "S1_S1_L001_R1_001.fastq.gz",
            "S1_S1_L001_R2_001.fastq.gz",
            "S1_S1_L002_R1_001.fastq.gz",
            "S1_S1_L002_R2_001.fastq.gz",
        ]
    );
    let sample_dir = fx.base().join("S1");
    assert!(read_gz(&sample_dir.join("S1_S1_L002_R1_001.fastq.gz")).starts_with("@RUN2_1.fastq.gz.0"));
    assert!(read_gz(&sample_dir.join("S1_S1_L001_R2_001.fastq.gz")).starts_with("@RUN1_2.fastq.gz.0"));

    assert!(!summary.has_failures());
    assert_eq!(summary.completed.len(), 1);
    assert!(summary.completed[0].inputs_retained);
    let counts: HashMap<Stage, usize> = summary
        .stage_counts
        .iter()
        .map(|entry| (entry.stage, entry.count))
        .collect();
    assert_eq!(counts[&Stage::Acquired], 2);
    assert_eq!(counts[&Stage::TenxFormatted], 1);
    assert_eq!(counts[&Stage::QuantificationComplete], 1);
    assert_eq!(counts[&Stage::TempCleaned], 1);
    assert_eq!(counts[&Stage::InputsDeleted], 0);
    assert!(!sample_dir.join("quant/S1/SC_RNA_COUNTER_CS").exists());
}

#[test]
fn second_pass_does_no_redundant_work() {
    let fx = Fixture::new(&[("RUN1", "S1"), ("RUN2", "S1"), ("RUN3", "S2")]);
    let build = || {
        MockAcquisition::default()
            .with_run("RUN1", &["RUN1_1.fastq.gz", "RUN1_2.fastq.gz"])
            .with_run("RUN2", &["RUN2_1.fastq.gz", "RUN2_2.fastq.gz"])
            .with_run("RUN3", &["RUN3_1.fastq.gz"])
    };

    let first = fx.run(fx.config(|_| {}), build(), MockQuant::default());
    assert_eq!(first.completed.len(), 2);
    let before = fx.snapshot();

    let acquisition = build();
    let fetches = acquisition.fetch_calls.clone();
    let quant = MockQuant::default();
    let quant_calls = quant.calls.clone();
    let second = fx.run(fx.config(|_| {}), acquisition, quant);

    assert!(calls(&fetches).is_empty());
    assert!(calls(&quant_calls).is_empty());
    assert!(second.runs.is_empty());
    assert_eq!(second.completed.len(), 2);
    assert_eq!(fx.snapshot(), before);
}

#[test]
fn inputs_are_deleted_only_after_both_matrices_exist() {
    let fx = Fixture::new(&[("RUN1", "S1")]);
    let acquisition =
        MockAcquisition::default().with_run("RUN1", &["RUN1_1.fastq.gz", "RUN1_2.fastq.gz"]);

    let summary = fx.run(fx.config(|_| {}), acquisition, MockQuant::default());

    assert!(summary.completed[0].sample.as_str() == "S1");
    assert!(!summary.completed[0].inputs_retained);
    let sample_dir = fx.base().join("S1");
    assert!(!sample_dir.join("S1_S1_L001_R1_001.fastq.gz").exists());
    assert!(!sample_dir.join("RUN1").exists());
    assert!(sample_dir
        .join("quant/S1/outs/filtered_feature_bc_matrix/matrix.mtx.gz")
        .is_file());
}

#[test]
fn raw_only_output_preserves_inputs() {
    let fx = Fixture::new(&[("RUN1", "S1")]);
    let acquisition =
        MockAcquisition::default().with_run("RUN1", &["RUN1_1.fastq.gz", "RUN1_2.fastq.gz"]);
    let quant = MockQuant {
        raw_only: true,
        ..MockQuant::default()
    };

    let summary = fx.run(fx.config(|_| {}), acquisition, quant);

    assert_matches!(
        &summary.samples[0].state,
        SampleState::Blocked { at: SamplePhase::Verifying, reason } if reason.contains("filtered_feature_bc_matrix")
    );
    let sample_dir = fx.base().join("S1");
    assert!(sample_dir.join("S1_S1_L001_R1_001.fastq.gz").is_file());
    assert!(sample_dir.join("S1_S1_L001_R2_001.fastq.gz").is_file());
    let counts: HashMap<Stage, usize> = summary
        .stage_counts
        .iter()
        .map(|entry| (entry.stage, entry.count))
        .collect();
    assert_eq!(counts[&Stage::QuantificationComplete], 0);
    assert_eq!(counts[&Stage::InputsDeleted], 0);
}

#[test]
fn quantification_waits_for_every_run() {
    let fx = Fixture::new(&[("RUN1", "S1"), ("RUN2", "S1")]);
    let build = || {
        MockAcquisition::default()
            .with_run("RUN1", &["RUN1_1.fastq.gz", "RUN1_2.fastq.gz"])
            .with_run("RUN2", &["RUN2_1.fastq.gz", "RUN2_2.fastq.gz"])
    };

    let quant = MockQuant::default();
    let quant_calls = quant.calls.clone();
    let summary = fx.run(fx.config(|_| {}), build().failing("RUN2"), quant);

    assert!(calls(&quant_calls).is_empty());
    assert_eq!(summary.run_failures.len(), 1);
    assert_eq!(summary.run_failures[0].run.as_str(), "RUN2");
    assert_matches!(
        &summary.samples[0].state,
        SampleState::Blocked { at: SamplePhase::AwaitingAcquisition, .. }
    );
    assert_eq!(summary.samples[0].acquired_runs, 1);

    let acquisition = build();
    let fetches = acquisition.fetch_calls.clone();
    let quant = MockQuant::default();
    let quant_calls = quant.calls.clone();
    let summary = fx.run(fx.config(|_| {}), acquisition, quant);

    assert_eq!(calls(&fetches), vec!["RUN2"]);
    assert_eq!(calls(&quant_calls), vec!["S1"]);
    assert!(summary.samples[0].state.is_complete());
}

#[test]
fn five_file_run_blocks_its_sample() {
    let fx = Fixture::new(&[("RUN1", "S1"), ("RUN9", "S9")]);
    let acquisition = MockAcquisition::default()
        .with_run(
            "RUN1",
            &["a.fastq.gz", "b.fastq.gz", "c.fastq.gz", "d.fastq.gz", "e.fastq.gz"],
        )
        .with_run("RUN9", &["RUN9_1.fastq.gz"]);
    let quant = MockQuant::default();
    let quant_calls = quant.calls.clone();

    let summary = fx.run(fx.config(|_| {}), acquisition, quant);

    let run1 = summary
        .runs
        .iter()
        .find(|result| result.run.as_str() == "RUN1")
        .unwrap();
    assert_eq!(run1.outcome, RunOutcome::ClassificationFailed { count: 5 });
    assert_eq!(summary.run_failures.len(), 1);

    let run_dir = fx.base().join("S1/RUN1");
    for name in ["a", "b", "c", "d", "e"] {
        assert!(run_dir.join(format!("{name}.fastq.gz")).is_file());
    }
    let s1 = summary
        .samples
        .iter()
        .find(|report| report.sample.as_str() == "S1")
        .unwrap();
    assert_matches!(
        s1.state,
        SampleState::Blocked { at: SamplePhase::AwaitingAcquisition, .. }
    );
    // the sibling sample is unaffected
    assert_eq!(calls(&quant_calls), vec!["S9"]);
}

#[test]
fn hinted_names_order_index_before_reads() {
    let fx = Fixture::new(&[("RUN1", "S1")]);
    let acquisition = MockAcquisition::default().with_run(
        "RUN1",
        &[
            "fastq/lib_S1_L001_R1_001.fastq.gz",
            "fastq/lib_S1_L001_R2_001.fastq.gz",
            "fastq/lib_S1_L001_I1_001.fastq.gz",
        ],
    );

    fx.run(fx.config(|c| c.keep_inputs = Some(true)), acquisition, MockQuant::default());

    let sample_dir = fx.base().join("S1");
    assert!(read_gz(&sample_dir.join("S1_S1_L001_I1_001.fastq.gz")).starts_with("@fastq/lib_S1_L001_I1"));
    assert!(read_gz(&sample_dir.join("S1_S1_L001_R1_001.fastq.gz")).starts_with("@fastq/lib_S1_L001_R1"));
    assert!(read_gz(&sample_dir.join("S1_S1_L001_R2_001.fastq.gz")).starts_with("@fastq/lib_S1_L001_R2"));
}

#[test]
fn corrupt_download_is_discarded() {
    let fx = Fixture::new(&[("RUN1", "S1")]);
    let mut broken = gz(&records("x", 400));
    broken.truncate(broken.len() / 2);
    let acquisition = MockAcquisition::default()
        .with_run("RUN1", &["RUN1_1.fastq.gz"])
        .with_raw("RUN1", "RUN1_2.fastq.gz", broken);

    let summary = fx.run(fx.config(|_| {}), acquisition, MockQuant::default());

    assert_eq!(summary.run_failures.len(), 1);
    assert!(summary.run_failures[0].message.contains("corrupt"));
    assert!(!fx.base().join("S1/RUN1/RUN1_2.fastq.gz").exists());
    // the intact sibling is dropped with the rest of the download
    assert!(!fx.base().join("S1/RUN1/RUN1_1.fastq.gz").exists());
    assert!(!summary.stage_counts.iter().any(|c| c.stage == Stage::Acquired && c.count > 0));

    let healthy =
        MockAcquisition::default().with_run("RUN1", &["RUN1_1.fastq.gz", "RUN1_2.fastq.gz"]);
    let fetches = healthy.fetch_calls.clone();
    let quant = MockQuant::default();
    let inputs = quant.inputs_seen.clone();

    let summary = fx.run(fx.config(|_| {}), healthy, quant);

    assert_eq!(calls(&fetches), vec!["RUN1"]);
    assert_matches!(
        summary.runs[0].outcome,
        RunOutcome::Acquired { files: 2, downloaded: true, .. }
    );
    assert_eq!(
        calls(&inputs),
        vec!["S1_S1_L001_R1_001.fastq.gz", "S1_S1_L001_R2_001.fastq.gz"]
    );
    assert!(summary.samples[0].state.is_complete());
}

#[test]
fn staged_files_skip_the_download() {
    let fx = Fixture::new(&[("RUN1", "S1")]);
    let run_dir = fx.base().join("S1/RUN1");
    write_file(&run_dir.join("staged_R1.fastq"), records("staged", 4).as_bytes());
    let acquisition = MockAcquisition::default();
    let fetches = acquisition.fetch_calls.clone();

    let summary = fx.run(fx.config(|c| c.keep_inputs = Some(true)), acquisition, MockQuant::default());

    assert!(calls(&fetches).is_empty());
    assert_matches!(
        summary.runs[0].outcome,
        RunOutcome::Acquired { downloaded: false, files: 1, .. }
    );
    assert!(fx.base().join("S1/S1_S1_L001_R1_001.fastq.gz").is_file());
}

#[test]
fn technical_reads_are_recovered_for_chip_samples() {
    let fx = Fixture::new(&[("RUN1", "pbmc_10x")]);
    let mut acquisition =
        MockAcquisition::default().with_run("RUN1", &["RUN1_1.fastq.gz", "RUN1_2.fastq.gz"]);
    acquisition.recovered.insert(
        "RUN1".to_string(),
        vec![
            ("RUN1_1.fastq".to_string(), records("dup", 2).into_bytes()),
            ("RUN1_3.fastq".to_string(), records("tech", 2).into_bytes()),
        ],
    );
    let recoveries = acquisition.recovery_calls.clone();

    let summary = fx.run(
        fx.config(|c| {
            c.keep_inputs = Some(true);
            c.recover_technical_reads = Some(true);
            c.technical_read_markers = None;
        }),
        acquisition,
        MockQuant::default(),
    );

    assert_eq!(calls(&recoveries), vec!["RUN1"]);
    assert_matches!(
        summary.runs[0].outcome,
        RunOutcome::Acquired { files: 3, recovered: 1, .. }
    );
    let sample_dir = fx.base().join("pbmc_10x");
    assert!(read_gz(&sample_dir.join("pbmc_10x_S1_L001_I1_001.fastq.gz")).starts_with("@RUN1_1.fastq.gz"));
    assert!(read_gz(&sample_dir.join("pbmc_10x_S1_L001_R2_001.fastq.gz")).starts_with("@tech"));
}

#[test]
fn missing_reference_stops_before_any_work() {
    let fx = Fixture::new(&[("RUN1", "S1")]);
    let acquisition = MockAcquisition::default().with_run("RUN1", &["RUN1_1.fastq.gz"]);
    let fetches = acquisition.fetch_calls.clone();
    let config = fx.config(|c| c.reference = Some(PathBuf::from("/nonexistent/reference")));

    let app = App::new(config, acquisition, MockQuant::default()).unwrap();
    let manifest = app.load_manifest().unwrap();
    let err = app.run(&manifest, &JsonOutput).unwrap_err();

    assert_matches!(err, KiraError::MissingReference(_));
    assert!(err.is_fatal());
    assert!(calls(&fetches).is_empty());
}

#[test]
fn status_and_dry_run_have_no_side_effects() {
    let fx = Fixture::new(&[("RUN1", "S1"), ("RUN2", "S1")]);
    let app = App::new(fx.config(|_| {}), MockAcquisition::default(), MockQuant::default()).unwrap();
    let manifest = app.load_manifest().unwrap();

    let plan = app.dry_run(&manifest);
    assert_eq!(plan.acquisitions.len(), 2);
    assert_eq!(plan.acquisitions[1].lane, 2);
    assert_eq!(plan.samples[0].next_stage, Some(Stage::TenxFormatted));

    let status = app.status(&manifest);
    assert_eq!(status.state.samples[0].expected_runs, 2);
    assert_eq!(status.state.samples[0].acquired_runs, 0);
    assert!(!fx.base().exists());
}

#[test]
fn reset_lets_a_stage_run_again() {
    let fx = Fixture::new(&[("RUN1", "S1")]);
    let acquisition = MockAcquisition::default().with_run("RUN1", &["RUN1_1.fastq.gz"]);
    fx.run(fx.config(|c| c.keep_inputs = Some(true)), acquisition, MockQuant::default());

    let quant = MockQuant::default();
    let quant_calls = quant.calls.clone();
    let app = App::new(fx.config(|c| c.keep_inputs = Some(true)), MockAcquisition::default(), quant).unwrap();
    let reset = app.reset(Stage::QuantificationComplete, Some("S1")).unwrap();
    assert_eq!(reset.removed, 1);

    let manifest = app.load_manifest().unwrap();
    let summary = app.run(&manifest, &JsonOutput).unwrap();
    assert_eq!(calls(&quant_calls), vec!["S1"]);
    assert!(summary.samples[0].state.is_complete());
}
