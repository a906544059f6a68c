use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::domain::{RunId, SampleKey};
use crate::error::KiraError;
use crate::fs_util::fs_err;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const STDERR_TAIL_LINES: usize = 20;

/// Fetches run archives as compressed FASTQ.
pub trait AcquisitionClient: Send + Sync {
    /// Download `run` into `out_dir`. Output files may land directly in
    /// `out_dir` or in a tool-specific subdirectory.
    fn fetch_run(
        &self,
        run: &RunId,
        methods: &[String],
        threads: usize,
        format: &str,
        out_dir: &Path,
        timeout: Duration,
    ) -> Result<(), KiraError>;

    /// Re-extract `run` including technical (index) reads into `out_dir`.
    fn recover_technical_reads(
        &self,
        run: &RunId,
        out_dir: &Path,
        threads: usize,
        timeout: Duration,
    ) -> Result<(), KiraError>;
}

#[derive(Debug, Clone)]
pub struct QuantRequest<'a> {
    pub sample: &'a SampleKey,
    pub reference: &'a Path,
    pub fastq_dir: &'a Path,
    pub out_dir: &'a Path,
    pub cores: usize,
    pub memory_gb: Option<u32>,
    pub timeout: Duration,
}

/// Runs single-cell quantification for one sample.
///
/// Implementations write under `request.out_dir`; success is judged later by
/// looking for the feature-barcode matrices, not by the return value alone.
pub trait QuantClient: Send + Sync {
    fn quantify(&self, request: &QuantRequest<'_>) -> Result<(), KiraError>;
}

#[derive(Debug, Clone)]
pub struct SystemAcquisitionClient {
    fetcher_name: String,
    fetcher: PathBuf,
    recovery_name: String,
    recovery: Option<PathBuf>,
}

impl SystemAcquisitionClient {
    /// Locate the configured tools. A missing fetcher is fatal; a missing
    /// recovery tool only disables recovery.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, KiraError> {
        let fetcher = find_in_path(&config.acquisition_tool)
            .ok_or_else(|| KiraError::MissingTool(config.acquisition_tool.clone()))?;
        let recovery = find_in_path(&config.recovery_tool);
        if recovery.is_none() && config.recover_technical_reads {
            warn!(
                tool = %config.recovery_tool,
                "recovery tool not found; technical-read recovery disabled"
            );
        }
        Ok(Self {
            fetcher_name: config.acquisition_tool.clone(),
            fetcher,
            recovery_name: config.recovery_tool.clone(),
            recovery,
        })
    }
}

impl AcquisitionClient for SystemAcquisitionClient {
    fn fetch_run(
        &self,
        run: &RunId,
        methods: &[String],
        threads: usize,
        format: &str,
        out_dir: &Path,
        timeout: Duration,
    ) -> Result<(), KiraError> {
        let mut args = vec![
            "get".to_string(),
            "-r".to_string(),
            run.to_string(),
            "-m".to_string(),
        ];
        args.extend(methods.iter().cloned());
        args.extend([
            "-t".to_string(),
            threads.to_string(),
            "-f".to_string(),
            format.to_string(),
        ]);
        run_cmd(&self.fetcher_name, &self.fetcher, &args, Some(out_dir), timeout)
    }

    fn recover_technical_reads(
        &self,
        run: &RunId,
        out_dir: &Path,
        threads: usize,
        timeout: Duration,
    ) -> Result<(), KiraError> {
        let program = self
            .recovery
            .as_ref()
            .ok_or_else(|| KiraError::MissingTool(self.recovery_name.clone()))?;
        let args = vec![
            run.to_string(),
            "--include-technical".to_string(),
            "--split-files".to_string(),
            "--threads".to_string(),
            threads.to_string(),
            "--outdir".to_string(),
            out_dir.to_string_lossy().to_string(),
        ];
        run_cmd(&self.recovery_name, program, &args, Some(out_dir), timeout)
    }
}

#[derive(Debug, Clone)]
pub struct SystemQuantClient {
    name: String,
    program: PathBuf,
    extra_args: Vec<String>,
}

impl SystemQuantClient {
    pub fn from_config(config: &PipelineConfig) -> Result<Self, KiraError> {
        let program = find_in_path(&config.quant_tool)
            .ok_or_else(|| KiraError::MissingTool(config.quant_tool.clone()))?;
        Ok(Self {
            name: config.quant_tool.clone(),
            program,
            extra_args: config.quant_extra_args.clone(),
        })
    }
}

impl QuantClient for SystemQuantClient {
    fn quantify(&self, request: &QuantRequest<'_>) -> Result<(), KiraError> {
        std::fs::create_dir_all(request.out_dir).map_err(fs_err)?;
        let mut args = vec![
            "count".to_string(),
            format!("--id={}", request.sample),
            format!("--transcriptome={}", request.reference.display()),
            format!("--fastqs={}", request.fastq_dir.display()),
            format!("--sample={}", request.sample),
            format!("--localcores={}", request.cores),
        ];
        if let Some(memory) = request.memory_gb {
            args.push(format!("--localmem={memory}"));
        }
        args.extend(self.extra_args.iter().cloned());
        run_cmd(
            &self.name,
            &self.program,
            &args,
            Some(request.out_dir),
            request.timeout,
        )
    }
}

/// Resolve `name` against `PATH`. Names containing a path separator are
/// taken as-is when they exist.
pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let direct = Path::new(name);
    if direct.components().count() > 1 {
        return direct.is_file().then(|| direct.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.is_file() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.is_file() {
            return Some(plain);
        }
    }
    None
}

/// Run `program` to completion or until `timeout`, killing it at the deadline.
/// stderr is captured to an anonymous temp file so a chatty tool cannot fill
/// a pipe and stall; its tail becomes the failure message.
pub fn run_cmd(
    tool: &str,
    program: &Path,
    args: &[String],
    cwd: Option<&Path>,
    timeout: Duration,
) -> Result<(), KiraError> {
    let failed = |message: String| KiraError::ToolFailed {
        tool: tool.to_string(),
        message,
    };

    let mut stderr_file = tempfile::tempfile().map_err(fs_err)?;
    let stderr_handle = stderr_file.try_clone().map_err(fs_err)?;
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::from(stderr_handle));
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    debug!(tool, ?args, "spawning external tool");
    let mut child = cmd.spawn().map_err(|err| failed(err.to_string()))?;
    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() >= deadline => {
                if let Err(err) = child.kill() {
                    warn!(tool, error = %err, "failed to kill timed-out tool");
                }
                let _ = child.wait();
                return Err(KiraError::ToolTimeout {
                    tool: tool.to_string(),
                    seconds: timeout.as_secs(),
                });
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(err) => return Err(failed(err.to_string())),
        }
    };
    if status.success() {
        return Ok(());
    }

    let tail = stderr_tail(&mut stderr_file);
    let message = if tail.is_empty() {
        format!("{} exited with {status}", program.display())
    } else {
        tail
    };
    Err(failed(message))
}

fn stderr_tail(file: &mut File) -> String {
    let mut bytes = Vec::new();
    if file.seek(SeekFrom::Start(0)).is_err() || file.read_to_end(&mut bytes).is_err() {
        return String::new();
    }
    let text = String::from_utf8_lossy(&bytes);
    let lines: Vec<&str> = text.trim().lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}
