use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::KiraError;

pub const DEFAULT_CONFIG_FILE: &str = "kira-scprep.json";
pub const ENV_PREFIX: &str = "KIRA_SCPREP_";

/// One configuration layer. Every field is optional so file, environment and
/// command-line layers can be stacked with [`Config::merge`].
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub manifest: Option<PathBuf>,
    #[serde(default)]
    pub base_dir: Option<PathBuf>,
    #[serde(default)]
    pub status_dir: Option<PathBuf>,
    #[serde(default)]
    pub reference: Option<PathBuf>,
    #[serde(default)]
    pub parallel_jobs: Option<usize>,
    #[serde(default)]
    pub threads_per_job: Option<usize>,
    #[serde(default)]
    pub keep_inputs: Option<bool>,
    #[serde(default)]
    pub recover_technical_reads: Option<bool>,
    #[serde(default)]
    pub repair: Option<bool>,
    #[serde(default)]
    pub download_timeout_secs: Option<u64>,
    #[serde(default)]
    pub quant_timeout_secs: Option<u64>,
    #[serde(default)]
    pub download_attempts: Option<u32>,
    #[serde(default)]
    pub retrieval_methods: Option<Vec<String>>,
    #[serde(default)]
    pub validation_records: Option<usize>,
    #[serde(default)]
    pub repair_validation_records: Option<usize>,
    #[serde(default)]
    pub repair_max_bytes: Option<u64>,
    #[serde(default)]
    pub technical_read_markers: Option<Vec<String>>,
    #[serde(default)]
    pub acquisition_tool: Option<String>,
    #[serde(default)]
    pub recovery_tool: Option<String>,
    #[serde(default)]
    pub quant_tool: Option<String>,
    #[serde(default)]
    pub quant_memory_gb: Option<u32>,
    #[serde(default)]
    pub quant_extra_args: Option<Vec<String>>,
    #[serde(default)]
    pub claim_ttl_secs: Option<u64>,
}

impl Config {
    /// Stack `upper` on top of `self`; values set in `upper` win.
    pub fn merge(self, upper: Config) -> Config {
        Config {
            manifest: upper.manifest.or(self.manifest),
            base_dir: upper.base_dir.or(self.base_dir),
            status_dir: upper.status_dir.or(self.status_dir),
            reference: upper.reference.or(self.reference),
            parallel_jobs: upper.parallel_jobs.or(self.parallel_jobs),
            threads_per_job: upper.threads_per_job.or(self.threads_per_job),
            keep_inputs: upper.keep_inputs.or(self.keep_inputs),
            recover_technical_reads: upper
                .recover_technical_reads
                .or(self.recover_technical_reads),
            repair: upper.repair.or(self.repair),
            download_timeout_secs: upper.download_timeout_secs.or(self.download_timeout_secs),
            quant_timeout_secs: upper.quant_timeout_secs.or(self.quant_timeout_secs),
            download_attempts: upper.download_attempts.or(self.download_attempts),
            retrieval_methods: upper.retrieval_methods.or(self.retrieval_methods),
            validation_records: upper.validation_records.or(self.validation_records),
            repair_validation_records: upper
                .repair_validation_records
                .or(self.repair_validation_records),
            repair_max_bytes: upper.repair_max_bytes.or(self.repair_max_bytes),
            technical_read_markers: upper
                .technical_read_markers
                .or(self.technical_read_markers),
            acquisition_tool: upper.acquisition_tool.or(self.acquisition_tool),
            recovery_tool: upper.recovery_tool.or(self.recovery_tool),
            quant_tool: upper.quant_tool.or(self.quant_tool),
            quant_memory_gb: upper.quant_memory_gb.or(self.quant_memory_gb),
            quant_extra_args: upper.quant_extra_args.or(self.quant_extra_args),
            claim_ttl_secs: upper.claim_ttl_secs.or(self.claim_ttl_secs),
        }
    }

    /// Build a layer from `KIRA_SCPREP_*` variables through `lookup`, so tests
    /// can supply a map instead of the process environment.
    pub fn from_env<F>(lookup: F) -> Result<Config, KiraError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(&format!("{ENV_PREFIX}{key}"))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let list = |key: &str| {
            lookup(&format!("{ENV_PREFIX}{key}")).map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
        };

        Ok(Config {
            manifest: get("MANIFEST").map(PathBuf::from),
            base_dir: get("BASE_DIR").map(PathBuf::from),
            status_dir: get("STATUS_DIR").map(PathBuf::from),
            reference: get("REFERENCE").map(PathBuf::from),
            parallel_jobs: parse_opt(get("PARALLEL_JOBS"), "PARALLEL_JOBS")?,
            threads_per_job: parse_opt(get("THREADS"), "THREADS")?,
            keep_inputs: parse_bool_opt(get("KEEP_INPUTS"), "KEEP_INPUTS")?,
            recover_technical_reads: parse_bool_opt(
                get("RECOVER_TECHNICAL_READS"),
                "RECOVER_TECHNICAL_READS",
            )?,
            repair: parse_bool_opt(get("REPAIR"), "REPAIR")?,
            download_timeout_secs: parse_opt(get("DOWNLOAD_TIMEOUT"), "DOWNLOAD_TIMEOUT")?,
            quant_timeout_secs: parse_opt(get("QUANT_TIMEOUT"), "QUANT_TIMEOUT")?,
            download_attempts: parse_opt(get("DOWNLOAD_ATTEMPTS"), "DOWNLOAD_ATTEMPTS")?,
            retrieval_methods: list("RETRIEVAL_METHODS"),
            validation_records: None,
            repair_validation_records: None,
            repair_max_bytes: None,
            technical_read_markers: list("TECHNICAL_READ_MARKERS"),
            acquisition_tool: get("ACQUISITION_TOOL"),
            recovery_tool: get("RECOVERY_TOOL"),
            quant_tool: get("QUANT_TOOL"),
            quant_memory_gb: parse_opt(get("QUANT_MEMORY_GB"), "QUANT_MEMORY_GB")?,
            quant_extra_args: None,
            claim_ttl_secs: None,
        })
    }
}

fn parse_opt<T: std::str::FromStr>(value: Option<String>, key: &str) -> Result<Option<T>, KiraError> {
    value
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|_| KiraError::InvalidConfig(format!("{ENV_PREFIX}{key}={raw}")))
        })
        .transpose()
}

fn parse_bool_opt(value: Option<String>, key: &str) -> Result<Option<bool>, KiraError> {
    value
        .map(|raw| match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(KiraError::InvalidConfig(format!("{ENV_PREFIX}{key}={raw}"))),
        })
        .transpose()
}

/// Fully resolved settings used by every pipeline stage.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineConfig {
    pub manifest: PathBuf,
    pub base_dir: PathBuf,
    pub status_dir: PathBuf,
    pub reference: Option<PathBuf>,
    pub parallel_jobs: usize,
    pub threads_per_job: usize,
    pub keep_inputs: bool,
    pub recover_technical_reads: bool,
    pub repair: bool,
    pub download_timeout_secs: u64,
    pub quant_timeout_secs: u64,
    pub download_attempts: u32,
    pub retrieval_methods: Vec<String>,
    pub validation_records: usize,
    pub repair_validation_records: usize,
    pub repair_max_bytes: u64,
    pub technical_read_markers: Vec<String>,
    pub acquisition_tool: String,
    pub recovery_tool: String,
    pub quant_tool: String,
    pub quant_memory_gb: Option<u32>,
    pub quant_extra_args: Vec<String>,
    pub claim_ttl_secs: u64,
}

impl PipelineConfig {
    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn quant_timeout(&self) -> Duration {
        Duration::from_secs(self.quant_timeout_secs)
    }

    pub fn claim_ttl(&self) -> Duration {
        Duration::from_secs(self.claim_ttl_secs)
    }

    /// The reference must exist as a directory before any sample is quantified.
    pub fn require_reference(&self) -> Result<&Path, KiraError> {
        match &self.reference {
            Some(path) if path.is_dir() => Ok(path.as_path()),
            Some(path) => Err(KiraError::MissingReference(path.clone())),
            None => Err(KiraError::MissingReference(PathBuf::from("<unset>"))),
        }
    }

    /// Whether the sample name suggests a chip-based protocol whose index
    /// reads are often missing from archive downloads.
    pub fn expects_technical_reads(&self, sample: &str) -> bool {
        let lowered = sample.to_ascii_lowercase();
        self.technical_read_markers
            .iter()
            .any(|marker| !marker.is_empty() && lowered.contains(&marker.to_ascii_lowercase()))
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Resolve defaults < config file < process environment < `overrides`.
    pub fn resolve(path: Option<&str>, overrides: Config) -> Result<PipelineConfig, KiraError> {
        let file = Self::load_file(path)?;
        let env = Config::from_env(|key| std::env::var(key).ok())?;
        Self::resolve_config(file.merge(env).merge(overrides))
    }

    /// An explicit path must exist; the default file is optional.
    pub fn load_file(path: Option<&str>) -> Result<Config, KiraError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Ok(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| KiraError::ConfigRead(config_path.clone()))?;
        serde_json::from_str(&content).map_err(|err| KiraError::ConfigParse(err.to_string()))
    }

    pub fn resolve_config(config: Config) -> Result<PipelineConfig, KiraError> {
        let base_dir = config.base_dir.unwrap_or_else(|| PathBuf::from("kira-scprep-output"));
        let status_dir = config
            .status_dir
            .unwrap_or_else(|| base_dir.join(".kira-scprep").join("status"));

        let parallel_jobs = config.parallel_jobs.unwrap_or(2);
        if parallel_jobs == 0 {
            return Err(KiraError::InvalidConfig(
                "parallel_jobs must be at least 1".to_string(),
            ));
        }
        let threads_per_job = config.threads_per_job.unwrap_or(4);
        if threads_per_job == 0 {
            return Err(KiraError::InvalidConfig(
                "threads_per_job must be at least 1".to_string(),
            ));
        }
        let download_attempts = config.download_attempts.unwrap_or(1);
        if download_attempts == 0 {
            return Err(KiraError::InvalidConfig(
                "download_attempts must be at least 1".to_string(),
            ));
        }
        let validation_records = config.validation_records.unwrap_or(1000);
        let repair_validation_records = config.repair_validation_records.unwrap_or(5000);
        if validation_records == 0 || repair_validation_records == 0 {
            return Err(KiraError::InvalidConfig(
                "validation sample sizes must be at least 1".to_string(),
            ));
        }

        Ok(PipelineConfig {
            manifest: config
                .manifest
                .unwrap_or_else(|| PathBuf::from("manifest.tsv")),
            base_dir,
            status_dir,
            reference: config.reference,
            parallel_jobs,
            threads_per_job,
            keep_inputs: config.keep_inputs.unwrap_or(false),
            recover_technical_reads: config.recover_technical_reads.unwrap_or(false),
            repair: config.repair.unwrap_or(true),
            download_timeout_secs: config.download_timeout_secs.unwrap_or(2 * 60 * 60),
            quant_timeout_secs: config.quant_timeout_secs.unwrap_or(48 * 60 * 60),
            download_attempts,
            retrieval_methods: config
                .retrieval_methods
                .unwrap_or_else(default_retrieval_methods),
            validation_records,
            repair_validation_records,
            repair_max_bytes: config.repair_max_bytes.unwrap_or(16 * 1024 * 1024 * 1024),
            technical_read_markers: config
                .technical_read_markers
                .unwrap_or_else(default_technical_read_markers),
            acquisition_tool: config
                .acquisition_tool
                .unwrap_or_else(|| "kingfisher".to_string()),
            recovery_tool: config
                .recovery_tool
                .unwrap_or_else(|| "fasterq-dump".to_string()),
            quant_tool: config.quant_tool.unwrap_or_else(|| "cellranger".to_string()),
            quant_memory_gb: config.quant_memory_gb,
            quant_extra_args: config
                .quant_extra_args
                .unwrap_or_else(|| vec!["--create-bam".to_string(), "false".to_string()]),
            claim_ttl_secs: config.claim_ttl_secs.unwrap_or(72 * 60 * 60),
        })
    }
}

pub fn default_retrieval_methods() -> Vec<String> {
    vec![
        "ena-ascp".to_string(),
        "ena-ftp".to_string(),
        "prefetch".to_string(),
        "aws-http".to_string(),
    ]
}

pub fn default_technical_read_markers() -> Vec<String> {
    vec!["10x".to_string(), "chromium".to_string()]
}
