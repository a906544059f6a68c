use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum KiraError {
    #[error("manifest not found: {0}")]
    MissingManifest(PathBuf),

    #[error("failed to read manifest at {path}: {message}")]
    ManifestRead { path: PathBuf, message: String },

    #[error("reference path is not a directory: {0}")]
    MissingReference(PathBuf),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid run accession: {0}")]
    InvalidRunId(String),

    #[error("invalid sample key: {0}")]
    InvalidSampleKey(String),

    #[error("unknown pipeline stage: {0}")]
    InvalidStage(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("status ledger error: {0}")]
    Ledger(String),

    #[error("{entity} is already claimed for {stage} by {holder}")]
    Claimed {
        entity: String,
        stage: String,
        holder: String,
    },

    #[error("{tool} failed: {message}")]
    ToolFailed { tool: String, message: String },

    #[error("{tool} timed out after {seconds}s")]
    ToolTimeout { tool: String, seconds: u64 },

    #[error("run {run} produced {count} read files; expected 1 to 4")]
    Classification { run: String, count: usize },

    #[error("corrupt compressed stream in {path}: {message}")]
    CorruptArchive { path: PathBuf, message: String },

    #[error("repair refused for {path}: {reason}")]
    RepairRefused { path: PathBuf, reason: String },

    #[error("failed to organize sample {sample}: {message}")]
    Organize { sample: String, message: String },

    #[error("quantification output incomplete for {sample}: missing {missing}")]
    QuantVerification { sample: String, missing: String },
}

impl KiraError {
    /// Errors that must stop the pipeline before any work is attempted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KiraError::MissingManifest(_)
                | KiraError::ManifestRead { .. }
                | KiraError::MissingReference(_)
                | KiraError::MissingTool(_)
                | KiraError::ConfigRead(_)
                | KiraError::ConfigParse(_)
                | KiraError::InvalidConfig(_)
        )
    }
}
