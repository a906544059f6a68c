use std::fs;
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};

use crate::config::PipelineConfig;
use crate::domain::{RunId, SampleKey};
use crate::error::KiraError;
use crate::fs_util::fs_err;

/// Directory layout of one pipeline output tree:
///
/// ```text
/// <base>/<sample>/                 canonical FASTQs for the sample
/// <base>/<sample>/<run>/           acquisition directory of one run
/// <base>/<sample>/quant/           quantification output
/// <status_root>/<stage>/<id>.done  ledger markers
/// ```
#[derive(Debug, Clone)]
pub struct Layout {
    base_dir: Utf8PathBuf,
    status_root: Utf8PathBuf,
}

impl Layout {
    pub fn from_config(config: &PipelineConfig) -> Result<Self, KiraError> {
        Ok(Self::new_with_paths(
            utf8(&config.base_dir)?,
            utf8(&config.status_dir)?,
        ))
    }

    pub fn new_with_paths(base_dir: Utf8PathBuf, status_root: Utf8PathBuf) -> Self {
        Self {
            base_dir,
            status_root,
        }
    }

    pub fn base_dir(&self) -> &Utf8Path {
        &self.base_dir
    }

    pub fn status_root(&self) -> &Utf8Path {
        &self.status_root
    }

    pub fn sample_dir(&self, sample: &SampleKey) -> Utf8PathBuf {
        self.base_dir.join(sample.as_str())
    }

    pub fn run_dir(&self, sample: &SampleKey, run: &RunId) -> Utf8PathBuf {
        self.sample_dir(sample).join(run.as_str())
    }

    pub fn quant_dir(&self, sample: &SampleKey) -> Utf8PathBuf {
        self.sample_dir(sample).join("quant")
    }

    pub fn ensure_base(&self) -> Result<(), KiraError> {
        fs::create_dir_all(self.base_dir.as_std_path()).map_err(fs_err)?;
        fs::create_dir_all(self.status_root.as_std_path()).map_err(fs_err)
    }
}

fn utf8(path: &Path) -> Result<Utf8PathBuf, KiraError> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().map_err(fs_err)?.join(path)
    };
    Utf8PathBuf::from_path_buf(absolute)
        .map_err(|_| KiraError::Filesystem(format!("non-utf8 path: {}", path.display())))
}
