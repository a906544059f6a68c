use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::KiraError;

const MAX_ID_LEN: usize = 128;

fn is_safe_identifier(value: &str, allow_dot: bool) -> bool {
    !value.is_empty()
        && value.len() <= MAX_ID_LEN
        && !value.starts_with('.')
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' || (allow_dot && ch == '.'))
}

/// Sequencing-run accession (SRR/ERR/DRR or any locally staged run name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(String);

impl RunId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        if !is_safe_identifier(normalized, true) {
            return Err(KiraError::InvalidRunId(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

/// Library / sample name that runs are grouped under. Restricted to the
/// character set the quantification tool accepts for `--sample`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SampleKey(String);

impl SampleKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SampleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SampleKey {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        if !is_safe_identifier(normalized, false) {
            return Err(KiraError::InvalidSampleKey(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChannelRole {
    Index1,
    Index2,
    Read1,
    Read2,
    Unclassified,
}

impl ChannelRole {
    /// Read-type token used in bcl2fastq-style file names.
    pub fn code(self) -> Option<&'static str> {
        match self {
            ChannelRole::Read1 => Some("R1"),
            ChannelRole::Read2 => Some("R2"),
            ChannelRole::Index1 => Some("I1"),
            ChannelRole::Index2 => Some("I2"),
            ChannelRole::Unclassified => None,
        }
    }
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code().unwrap_or("unclassified"))
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Acquired,
    TenxFormatted,
    QuantificationComplete,
    TempCleaned,
    InputsDeleted,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Acquired,
        Stage::TenxFormatted,
        Stage::QuantificationComplete,
        Stage::TempCleaned,
        Stage::InputsDeleted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Acquired => "acquired",
            Stage::TenxFormatted => "tenx_formatted",
            Stage::QuantificationComplete => "quantification_complete",
            Stage::TempCleaned => "temp_cleaned",
            Stage::InputsDeleted => "inputs_deleted",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Stage {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == normalized)
            .ok_or_else(|| KiraError::InvalidStage(value.to_string()))
    }
}
