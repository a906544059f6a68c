//! Durable completion markers keyed by `(entity, stage)`.
//!
//! Each marker is one file at `<root>/<stage>/<entity>.done`. Markers are
//! only ever added by the pipeline; removing them is an operator action
//! (`kira-scprep reset`). Claims at `<root>/claims/<stage>/<entity>.claim`
//! give one process at a time the right to perform a stage's side effects
//! for an entity.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::Stage;
use crate::error::KiraError;
use crate::fs_util::write_bytes_atomic;

const MARKER_EXT: &str = "done";
const CLAIM_EXT: &str = "claim";
const TORN_CLAIM_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkerRecord {
    pub entity: String,
    pub stage: Stage,
    pub marked_at: String,
    pub tool: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub host: String,
    pub pid: u32,
    pub claimed_at: String,
}

impl ClaimRecord {
    fn current() -> Self {
        Self {
            host: hostname(),
            pid: std::process::id(),
            claimed_at: Utc::now().to_rfc3339(),
        }
    }

    pub fn holder(&self) -> String {
        format!("{}:{}", self.host, self.pid)
    }
}

#[derive(Debug, Clone)]
pub struct StatusLedger {
    root: Utf8PathBuf,
    claim_ttl: Duration,
}

impl StatusLedger {
    pub fn new(root: Utf8PathBuf, claim_ttl: Duration) -> Self {
        Self { root, claim_ttl }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn marker_path(&self, entity: &str, stage: Stage) -> Utf8PathBuf {
        self.root
            .join(stage.as_str())
            .join(format!("{entity}.{MARKER_EXT}"))
    }

    fn claim_path(&self, entity: &str, stage: Stage) -> Utf8PathBuf {
        self.root
            .join("claims")
            .join(stage.as_str())
            .join(format!("{entity}.{CLAIM_EXT}"))
    }

    pub fn is_done(&self, entity: &str, stage: Stage) -> bool {
        self.marker_path(entity, stage).as_std_path().is_file()
    }

    /// Record that `stage` finished for `entity`. Marking twice is a no-op.
    pub fn mark_done(&self, entity: &str, stage: Stage) -> Result<(), KiraError> {
        validate_entity(entity)?;
        let path = self.marker_path(entity, stage);
        if path.as_std_path().is_file() {
            return Ok(());
        }
        let record = MarkerRecord {
            entity: entity.to_string(),
            stage,
            marked_at: Utc::now().to_rfc3339(),
            tool: format!("kira-scprep/{}", env!("CARGO_PKG_VERSION")),
        };
        let content = serde_json::to_vec_pretty(&record)
            .map_err(|err| KiraError::Ledger(err.to_string()))?;
        write_bytes_atomic(path.as_std_path(), &content)?;
        debug!(entity, stage = %stage, "marker written");
        Ok(())
    }

    pub fn count(&self, stage: Stage) -> usize {
        self.done_entities(stage).len()
    }

    /// How many of `entities` have reached `stage`.
    pub fn count_done<'a, I>(&self, entities: I, stage: Stage) -> usize
    where
        I: IntoIterator<Item = &'a str>,
    {
        entities
            .into_iter()
            .filter(|entity| self.is_done(entity, stage))
            .count()
    }

    pub fn done_entities(&self, stage: Stage) -> Vec<String> {
        let dir = self.root.join(stage.as_str());
        let Ok(entries) = fs::read_dir(dir.as_std_path()) else {
            return Vec::new();
        };
        let mut out: Vec<String> = entries
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                let is_marker = path.extension().and_then(|ext| ext.to_str()) == Some(MARKER_EXT);
                if !is_marker || !path.is_file() {
                    return None;
                }
                path.file_stem()
                    .and_then(|stem| stem.to_str())
                    .map(str::to_string)
            })
            .collect();
        out.sort();
        out
    }

    pub fn read_marker(&self, entity: &str, stage: Stage) -> Option<MarkerRecord> {
        let content = fs::read(self.marker_path(entity, stage).as_std_path()).ok()?;
        serde_json::from_slice(&content).ok()
    }

    /// Remove markers for `stage`, either for one entity or all of them.
    /// Returns the number of markers removed.
    pub fn reset(&self, stage: Stage, entity: Option<&str>) -> Result<usize, KiraError> {
        let targets = match entity {
            Some(entity) => vec![entity.to_string()],
            None => self.done_entities(stage),
        };
        let mut removed = 0;
        for entity in targets {
            let path = self.marker_path(&entity, stage);
            match fs::remove_file(path.as_std_path()) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(KiraError::Ledger(err.to_string())),
            }
        }
        Ok(removed)
    }

    /// Try to become the single writer for `(entity, stage)`.
    ///
    /// Returns `Ok(None)` when another live process holds the claim. Claims
    /// whose owner is gone, or that are older than the ledger's TTL, are
    /// broken and re-taken.
    pub fn claim(&self, entity: &str, stage: Stage) -> Result<Option<ClaimGuard>, KiraError> {
        validate_entity(entity)?;
        let path = self.claim_path(entity, stage);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| KiraError::Ledger(err.to_string()))?;
        }

        for _ in 0..2 {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path.as_std_path())
            {
                Ok(mut file) => {
                    let record = ClaimRecord::current();
                    let body = serde_json::to_vec(&record)
                        .map_err(|err| KiraError::Ledger(err.to_string()))?;
                    file.write_all(&body)
                        .map_err(|err| KiraError::Ledger(err.to_string()))?;
                    return Ok(Some(ClaimGuard { path }));
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    let existing = read_claim(&path);
                    if !self.is_stale(&path, existing.as_ref()) {
                        return Ok(None);
                    }
                    let holder = existing
                        .as_ref()
                        .map(ClaimRecord::holder)
                        .unwrap_or_default();
                    warn!(entity, stage = %stage, holder = %holder, "breaking stale claim");
                    match fs::remove_file(path.as_std_path()) {
                        Ok(()) => {}
                        Err(err) if err.kind() == ErrorKind::NotFound => {}
                        Err(err) => return Err(KiraError::Ledger(err.to_string())),
                    }
                }
                Err(err) => return Err(KiraError::Ledger(err.to_string())),
            }
        }
        Ok(None)
    }

    /// Holder of the current claim, if any.
    pub fn claim_holder(&self, entity: &str, stage: Stage) -> Option<String> {
        read_claim(&self.claim_path(entity, stage)).map(|record| record.holder())
    }

    fn is_stale(&self, path: &Utf8Path, record: Option<&ClaimRecord>) -> bool {
        let Some(record) = record else {
            // Unreadable: either being written right now or torn by a crash.
            return fs::metadata(path.as_std_path())
                .and_then(|meta| meta.modified())
                .ok()
                .and_then(|modified| modified.elapsed().ok())
                .map(|age| age > TORN_CLAIM_GRACE)
                .unwrap_or(false);
        };
        if record.host == hostname() && !process_alive(record.pid) {
            return true;
        }
        DateTime::parse_from_rfc3339(&record.claimed_at)
            .map(|at| {
                let age = Utc::now().signed_duration_since(at.with_timezone(&Utc));
                age.to_std().map(|age| age > self.claim_ttl).unwrap_or(false)
            })
            .unwrap_or(true)
    }
}

/// Releases its claim when dropped.
#[derive(Debug)]
pub struct ClaimGuard {
    path: Utf8PathBuf,
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(self.path.as_std_path()) {
            if err.kind() != ErrorKind::NotFound {
                warn!(path = %self.path, error = %err, "failed to release claim");
            }
        }
    }
}

fn read_claim(path: &Utf8Path) -> Option<ClaimRecord> {
    let content = fs::read(path.as_std_path()).ok()?;
    serde_json::from_slice(&content).ok()
}

fn validate_entity(entity: &str) -> Result<(), KiraError> {
    let ok = !entity.is_empty()
        && !entity.starts_with('.')
        && !entity.contains(['/', '\\'])
        && entity != "..";
    if ok {
        Ok(())
    } else {
        Err(KiraError::Ledger(format!("invalid entity id: {entity:?}")))
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| fs::read_to_string("/etc/hostname").ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    pid == std::process::id() || Utf8Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> (tempfile::TempDir, StatusLedger) {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().join("status")).unwrap();
        (temp, StatusLedger::new(root, Duration::from_secs(3600)))
    }

    #[test]
    fn mark_done_is_idempotent() {
        let (_temp, ledger) = ledger();
        assert!(!ledger.is_done("SRR1", Stage::Acquired));
        ledger.mark_done("SRR1", Stage::Acquired).unwrap();
        let first = ledger.read_marker("SRR1", Stage::Acquired).unwrap();
        ledger.mark_done("SRR1", Stage::Acquired).unwrap();
        let second = ledger.read_marker("SRR1", Stage::Acquired).unwrap();

        assert!(ledger.is_done("SRR1", Stage::Acquired));
        assert_eq!(first.marked_at, second.marked_at);
        assert_eq!(ledger.count(Stage::Acquired), 1);
        assert_eq!(ledger.count(Stage::TenxFormatted), 0);
    }

    #[test]
    fn count_done_filters_by_entity() {
        let (_temp, ledger) = ledger();
        ledger.mark_done("A", Stage::Acquired).unwrap();
        ledger.mark_done("C", Stage::Acquired).unwrap();
        assert_eq!(ledger.count_done(["A", "B"], Stage::Acquired), 1);
        assert_eq!(ledger.done_entities(Stage::Acquired), vec!["A", "C"]);
    }

    #[test]
    fn rejects_path_like_entities() {
        let (_temp, ledger) = ledger();
        assert!(ledger.mark_done("../x", Stage::Acquired).is_err());
    }

    #[test]
    fn claim_is_exclusive_until_dropped() {
        let (_temp, ledger) = ledger();
        let guard = ledger.claim("S1", Stage::QuantificationComplete).unwrap();
        assert!(guard.is_some());
        assert!(ledger
            .claim("S1", Stage::QuantificationComplete)
            .unwrap()
            .is_none());
        assert!(ledger.claim("S2", Stage::QuantificationComplete).unwrap().is_some());
        drop(guard);
        assert!(ledger
            .claim("S1", Stage::QuantificationComplete)
            .unwrap()
            .is_some());
    }

    #[test]
    fn expired_claim_is_broken() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().join("status")).unwrap();
        let ledger = StatusLedger::new(root, Duration::from_secs(60));
        let path = ledger.claim_path("RUN1", Stage::Acquired);
        fs::create_dir_all(path.parent().unwrap().as_std_path()).unwrap();
        let record = ClaimRecord {
            host: "elsewhere".to_string(),
            pid: 1,
            claimed_at: (Utc::now() - chrono::Duration::hours(2)).to_rfc3339(),
        };
        fs::write(path.as_std_path(), serde_json::to_vec(&record).unwrap()).unwrap();

        assert!(ledger.claim("RUN1", Stage::Acquired).unwrap().is_some());
    }

    #[test]
    fn fresh_foreign_claim_is_respected() {
        let (_temp, ledger) = ledger();
        let path = ledger.claim_path("RUN1", Stage::Acquired);
        fs::create_dir_all(path.parent().unwrap().as_std_path()).unwrap();
        let record = ClaimRecord {
            host: "another-host".to_string(),
            pid: 4242,
            claimed_at: Utc::now().to_rfc3339(),
        };
        fs::write(path.as_std_path(), serde_json::to_vec(&record).unwrap()).unwrap();

        assert!(ledger.claim("RUN1", Stage::Acquired).unwrap().is_none());
        assert_eq!(
            ledger.claim_holder("RUN1", Stage::Acquired).as_deref(),
            Some("another-host:4242")
        );
    }

    #[test]
    fn reset_removes_markers() {
        let (_temp, ledger) = ledger();
        ledger.mark_done("A", Stage::InputsDeleted).unwrap();
        ledger.mark_done("B", Stage::InputsDeleted).unwrap();
        assert_eq!(ledger.reset(Stage::InputsDeleted, Some("A")).unwrap(), 1);
        assert_eq!(ledger.reset(Stage::InputsDeleted, None).unwrap(), 1);
        assert_eq!(ledger.count(Stage::InputsDeleted), 0);
    }
}
