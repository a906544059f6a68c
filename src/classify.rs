//! Read-file classification and the two naming passes.
//!
//! Phase one (`standardize`) gives a run's files positional names
//! `{run}_{n}.fastq.gz`. Phase two (`rename_to_canonical`) maps those
//! positions onto channel roles by file count and moves them into the sample
//! directory under bcl2fastq-style names.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, info};

use crate::domain::{ChannelRole, RunId, SampleKey};
use crate::error::KiraError;
use crate::fs_util::{list_read_files, move_file};

static CANONICAL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9_-]+)_S1_L(\d{3})_([RI][12])_001\.fastq\.gz$")
        .unwrap_or_else(|err| panic!("canonical filename regex: {err}"))
});

/// How a run's files were put in order before positional naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NamingStrategy {
    /// Every expected role was named by exactly one file.
    Hinted,
    /// Plain lexicographic order.
    Positional,
    /// Files already carried their positional names.
    AlreadyStandardized,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassifiedFile {
    pub path: PathBuf,
    pub role: ChannelRole,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileSet {
    pub files: Vec<ClassifiedFile>,
    pub strategy: NamingStrategy,
}

impl FileSet {
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.files.iter().map(|file| file.path.as_path())
    }
}

/// Role order assigned to positional files, by file count.
pub fn role_template(count: usize) -> Option<&'static [ChannelRole]> {
    use ChannelRole::*;
    match count {
        1 => Some(&[Read1]),
        2 => Some(&[Read1, Read2]),
        3 => Some(&[Index1, Read1, Read2]),
        4 => Some(&[Index1, Index2, Read1, Read2]),
        _ => None,
    }
}

/// Role suggested by a file name, if any.
pub fn hint_role(name: &str) -> ChannelRole {
    if name.contains("_I2_") {
        ChannelRole::Index2
    } else if name.contains("_I1_") || name.contains("_index") {
        ChannelRole::Index1
    } else if name.contains("_R1_") {
        ChannelRole::Read1
    } else if name.contains("_R2_") {
        ChannelRole::Read2
    } else {
        ChannelRole::Unclassified
    }
}

fn file_name(path: &Path) -> &str {
    path.file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default()
}

/// Order `files` for positional naming.
///
/// Hints are trusted only when every role of the count's template is named
/// by exactly one file; anything else falls back to lexicographic order.
/// Counts outside 1..=4 are refused.
pub fn order_files(
    run: &RunId,
    mut files: Vec<PathBuf>,
) -> Result<(Vec<PathBuf>, NamingStrategy), KiraError> {
    let template = role_template(files.len()).ok_or_else(|| KiraError::Classification {
        run: run.to_string(),
        count: files.len(),
    })?;
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

    if files.len() < 3 {
        return Ok((files, NamingStrategy::Positional));
    }

    let roles: Vec<ChannelRole> = files.iter().map(|path| hint_role(file_name(path))).collect();
    let unambiguous = template
        .iter()
        .all(|role| roles.iter().filter(|hinted| *hinted == role).count() == 1);
    if !unambiguous {
        debug!(run = %run, ?roles, "filename hints ambiguous; using positional order");
        return Ok((files, NamingStrategy::Positional));
    }

    let mut ordered = Vec::with_capacity(files.len());
    for role in template {
        if let Some(idx) = roles.iter().position(|hinted| hinted == role) {
            ordered.push(files[idx].clone());
        }
    }
    Ok((ordered, NamingStrategy::Hinted))
}

pub fn standardized_name(run: &RunId, position: usize) -> String {
    format!("{run}_{position}.fastq.gz")
}

fn is_standardized(run: &RunId, files: &[PathBuf]) -> bool {
    files
        .iter()
        .enumerate()
        .all(|(idx, path)| file_name(path) == standardized_name(run, idx + 1))
}

/// Phase one: rename the read files in `run_dir` to `{run}_{n}.fastq.gz`.
///
/// On a count outside 1..=4 nothing is renamed.
pub fn standardize(run_dir: &Path, run: &RunId) -> Result<FileSet, KiraError> {
    let files = list_read_files(run_dir)?;
    if role_template(files.len()).is_some() && is_standardized(run, &files) {
        return Ok(build_file_set(files, NamingStrategy::AlreadyStandardized));
    }

    let (ordered, strategy) = order_files(run, files)?;

    // Two steps so a permutation of already-positional names cannot clobber.
    let mut pending = Vec::with_capacity(ordered.len());
    for (idx, path) in ordered.iter().enumerate() {
        let staging = run_dir.join(format!("{run}__pending_{}.fastq.gz", idx + 1));
        move_file(path, &staging)?;
        pending.push(staging);
    }
    let mut renamed = Vec::with_capacity(pending.len());
    for (idx, path) in pending.iter().enumerate() {
        let target = run_dir.join(standardized_name(run, idx + 1));
        move_file(path, &target)?;
        renamed.push(target);
    }

    info!(run = %run, files = renamed.len(), ?strategy, "read files standardized");
    Ok(build_file_set(renamed, strategy))
}

fn build_file_set(files: Vec<PathBuf>, strategy: NamingStrategy) -> FileSet {
    let template = role_template(files.len()).unwrap_or_default();
    FileSet {
        files: files
            .into_iter()
            .enumerate()
            .map(|(idx, path)| ClassifiedFile {
                path,
                role: template
                    .get(idx)
                    .copied()
                    .unwrap_or(ChannelRole::Unclassified),
            })
            .collect(),
        strategy,
    }
}

pub fn canonical_name(sample: &SampleKey, lane: usize, role: ChannelRole) -> Option<String> {
    role.code()
        .map(|code| format!("{sample}_S1_L{lane:03}_{code}_001.fastq.gz"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalName {
    pub sample: String,
    pub lane: usize,
    pub role: ChannelRole,
}

pub fn parse_canonical(name: &str) -> Option<CanonicalName> {
    let caps = CANONICAL_REGEX.captures(name)?;
    let role = match caps.get(3)?.as_str() {
        "R1" => ChannelRole::Read1,
        "R2" => ChannelRole::Read2,
        "I1" => ChannelRole::Index1,
        "I2" => ChannelRole::Index2,
        _ => return None,
    };
    Some(CanonicalName {
        sample: caps.get(1)?.as_str().to_string(),
        lane: caps.get(2)?.as_str().parse().ok()?,
        role,
    })
}

/// Canonical files already in `sample_dir` for one lane.
pub fn canonical_files_for_lane(
    sample_dir: &Path,
    sample: &SampleKey,
    lane: usize,
) -> Result<Vec<PathBuf>, KiraError> {
    Ok(list_read_files(sample_dir)?
        .into_iter()
        .filter(|path| {
            parse_canonical(file_name(path))
                .map(|parsed| parsed.sample == sample.as_str() && parsed.lane == lane)
                .unwrap_or(false)
        })
        .collect())
}

/// Position `n` of a file named `{run}_{n}.fastq.gz`.
fn positional_index(run: &RunId, path: &Path) -> Option<usize> {
    file_name(path)
        .strip_prefix(run.as_str())?
        .strip_prefix('_')?
        .strip_suffix(".fastq.gz")?
        .parse()
        .ok()
        .filter(|position| *position > 0)
}

/// Phase two: move a run's positional files into `sample_dir` under
/// canonical names for `lane`.
///
/// A run directory with no read files whose lane is already present in the
/// sample directory counts as organized. Lane files left by an earlier,
/// partly finished pass count toward the role template, and the remaining
/// files take their roles from their positions. Counts outside 1..=4 are
/// refused, as is any move onto an existing file; in both cases nothing
/// moves.
pub fn rename_to_canonical(
    run_dir: &Path,
    run: &RunId,
    sample: &SampleKey,
    lane: usize,
    sample_dir: &Path,
) -> Result<Vec<PathBuf>, KiraError> {
    let files = list_read_files(run_dir)?;
    let existing = canonical_files_for_lane(sample_dir, sample, lane)?;
    if files.is_empty() {
        if role_template(existing.len()).is_some() {
            return Ok(existing);
        }
        return Err(KiraError::Classification {
            run: run.to_string(),
            count: 0,
        });
    }

    let total = existing.len() + files.len();
    let refuse = || KiraError::Classification {
        run: run.to_string(),
        count: total,
    };
    let template = role_template(total).ok_or_else(refuse)?;

    let mut plan: Vec<(&Path, PathBuf)> = Vec::with_capacity(files.len());
    for (idx, path) in files.iter().enumerate() {
        let position = match positional_index(run, path) {
            Some(position) => position,
            None if existing.is_empty() => idx + 1,
            None => return Err(refuse()),
        };
        let role = template.get(position - 1).copied().ok_or_else(refuse)?;
        let name = canonical_name(sample, lane, role).ok_or_else(refuse)?;
        let target = sample_dir.join(name);
        if target.exists() || plan.iter().any(|(_, planned)| *planned == target) {
            return Err(KiraError::Organize {
                sample: sample.to_string(),
                message: format!(
                    "{} would overwrite {}",
                    file_name(path),
                    target.display()
                ),
            });
        }
        plan.push((path.as_path(), target));
    }

    for (path, target) in &plan {
        move_file(path, target)?;
    }
    if !existing.is_empty() {
        info!(run = %run, lane, completed = plan.len(), "finished a partly organized lane");
    }
    info!(run = %run, sample = %sample, lane, files = total, "renamed to canonical names");
    canonical_files_for_lane(sample_dir, sample, lane)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, names: &[&str]) {
        for name in names {
            std::fs::write(dir.join(name), name.as_bytes()).unwrap();
        }
    }

    fn names(paths: &[PathBuf]) -> Vec<String> {
        paths.iter().map(|p| file_name(p).to_string()).collect()
    }

    #[test]
    fn template_covers_one_to_four() {
        assert_eq!(role_template(1), Some(&[ChannelRole::Read1][..]));
        assert_eq!(
            role_template(3),
            Some(&[ChannelRole::Index1, ChannelRole::Read1, ChannelRole::Read2][..])
        );
        assert_eq!(role_template(0), None);
        assert_eq!(role_template(5), None);
    }

    #[test]
    fn hinted_order_puts_index_first() {
        let run: RunId = "SRR9".parse().unwrap();
        let files = vec![
            PathBuf::from("x_S1_L001_R1_001.fastq.gz"),
            PathBuf::from("x_S1_L001_R2_001.fastq.gz"),
            PathBuf::from("x_S1_L001_I1_001.fastq.gz"),
        ];
        let (ordered, strategy) = order_files(&run, files).unwrap();
        assert_eq!(strategy, NamingStrategy::Hinted);
        assert_eq!(
            names(&ordered),
            vec![
                "x_S1_L001_I1_001.fastq.gz",
                "x_S1_L001_R1_001.fastq.gz",
                "x_S1_L001_R2_001.fastq.gz"
            ]
        );
    }

    #[test]
    fn ambiguous_hints_fall_back_to_positional() {
        let run: RunId = "SRR9".parse().unwrap();
        let files = vec![
            PathBuf::from("c_R1_.fastq.gz"),
            PathBuf::from("a_R1_.fastq.gz"),
            PathBuf::from("b_index.fastq.gz"),
        ];
        let (ordered, strategy) = order_files(&run, files).unwrap();
        assert_eq!(strategy, NamingStrategy::Positional);
        assert_eq!(
            names(&ordered),
            vec!["a_R1_.fastq.gz", "b_index.fastq.gz", "c_R1_.fastq.gz"]
        );
    }

    #[test]
    fn standardize_renames_and_is_idempotent() {
        let temp = tempfile::tempdir().unwrap();
        let run: RunId = "SRR1".parse().unwrap();
        touch(temp.path(), &["SRR1_2.fastq.gz", "SRR1_1.fastq.gz", "SRR1_3.fastq.gz"]);

        let set = standardize(temp.path(), &run).unwrap();
        assert_eq!(set.strategy, NamingStrategy::AlreadyStandardized);
        assert_eq!(set.files[0].role, ChannelRole::Index1);

        let again = standardize(temp.path(), &run).unwrap();
        assert_eq!(again.strategy, NamingStrategy::AlreadyStandardized);
    }

    #[test]
    fn standardize_permutes_without_clobbering() {
        let temp = tempfile::tempdir().unwrap();
        let run: RunId = "SRR1".parse().unwrap();
        touch(
            temp.path(),
            &["a_R2_x.fastq.gz", "b_I1_x.fastq.gz", "c_R1_x.fastq.gz"],
        );

        let set = standardize(temp.path(), &run).unwrap();
        assert_eq!(set.strategy, NamingStrategy::Hinted);
        let first = std::fs::read_to_string(temp.path().join("SRR1_1.fastq.gz")).unwrap();
        let third = std::fs::read_to_string(temp.path().join("SRR1_3.fastq.gz")).unwrap();
        assert_eq!(first, "b_I1_x.fastq.gz");
        assert_eq!(third, "a_R2_x.fastq.gz");
        assert_eq!(list_read_files(temp.path()).unwrap().len(), 3);
    }

    #[test]
    fn canonical_name_round_trips() {
        let sample: SampleKey = "pbmc_10k".parse().unwrap();
        let name = canonical_name(&sample, 2, ChannelRole::Index2).unwrap();
        assert_eq!(name, "pbmc_10k_S1_L002_I2_001.fastq.gz");
        assert_eq!(
            parse_canonical(&name),
            Some(CanonicalName {
                sample: "pbmc_10k".to_string(),
                lane: 2,
                role: ChannelRole::Index2
            })
        );
        assert_eq!(canonical_name(&sample, 1, ChannelRole::Unclassified), None);
    }
}
