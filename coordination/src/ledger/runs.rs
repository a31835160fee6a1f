//! Run snapshots: one mutable document per run under `runs/`.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use super::{LedgerError, LedgerResult};
use crate::debate::{DebateStatus, SessionStore};
use crate::fs_store::{self, Record};

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(LedgerError::Invalid(format!("unknown run status '{other}'"))),
        }
    }
}

/// Token totals for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Ledger snapshot of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    #[serde(default)]
    pub request_id: Option<String>,
    pub kind: String,
    pub status: RunStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub tokens: TokenUsage,
    #[serde(default)]
    pub estimated_cost_usd: f64,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial run update. Every `Some` field replaces the stored value.
///
/// Clears are applied before replacements, so `clear_outcome().error(..)` leaves
/// only the new error behind.
#[derive(Debug, Clone, Default)]
pub struct RunPatch {
    pub id: String,
    pub request_id: Option<String>,
    pub kind: Option<String>,
    pub status: Option<RunStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub tokens: Option<TokenUsage>,
    pub estimated_cost_usd: Option<f64>,
    pub score: Option<f64>,
    pub error: Option<String>,
    pub metadata: Option<Map<String, Value>>,
    pub clear_finished: bool,
    pub clear_error: bool,
}

impl RunPatch {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn finished_at(mut self, at: DateTime<Utc>) -> Self {
        self.finished_at = Some(at);
        self
    }

    pub fn duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    pub fn tokens(mut self, tokens: TokenUsage, estimated_cost_usd: f64) -> Self {
        self.tokens = Some(tokens);
        self.estimated_cost_usd = Some(estimated_cost_usd);
        self
    }

    pub fn score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Drop `finishedAt`, `durationMs` and `error` left by an earlier attempt.
    pub fn clear_outcome(mut self) -> Self {
        self.clear_finished = true;
        self.clear_error = true;
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.clear_error = true;
        self
    }

    fn into_new_run(self, now: DateTime<Utc>) -> LedgerResult<Run> {
        let kind = self
            .kind
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| LedgerError::Invalid(format!("run {} has no kind", self.id)))?;
        Ok(Run {
            id: self.id,
            request_id: self.request_id,
            kind,
            status: self.status.unwrap_or(RunStatus::Queued),
            started_at: self.started_at,
            finished_at: self.finished_at,
            duration_ms: self.duration_ms,
            tokens: self.tokens.unwrap_or_default(),
            estimated_cost_usd: self.estimated_cost_usd.unwrap_or(0.0),
            score: self.score,
            error: self.error,
            metadata: self.metadata.unwrap_or_default(),
            created_at: now,
            updated_at: now,
        })
    }

    fn merge_into(self, run: &mut Run) -> LedgerResult<()> {
        if let Some(kind) = self.kind {
            if kind.trim().is_empty() {
                return Err(LedgerError::Invalid(format!("run {} has no kind", run.id)));
            }
            run.kind = kind;
        }
        if self.clear_finished {
            run.finished_at = None;
            run.duration_ms = None;
        }
        if self.clear_error {
            run.error = None;
        }
        if let Some(v) = self.request_id {
            run.request_id = Some(v);
        }
        if let Some(v) = self.status {
            run.status = v;
        }
        if let Some(v) = self.started_at {
            run.started_at = Some(v);
        }
        if let Some(v) = self.finished_at {
            run.finished_at = Some(v);
        }
        if let Some(v) = self.duration_ms {
            run.duration_ms = Some(v);
        }
        if let Some(v) = self.tokens {
            run.tokens = v;
        }
        if let Some(v) = self.estimated_cost_usd {
            run.estimated_cost_usd = v;
        }
        if let Some(v) = self.score {
            run.score = Some(v);
        }
        if let Some(v) = self.error {
            run.error = Some(v);
        }
        if let Some(v) = self.metadata {
            run.metadata = v;
        }
        Ok(())
    }
}

/// File-backed run repository.
///
/// Upserts are read-merge-write under a process-local mutex; across
/// processes the last writer wins, which is safe because exactly one worker
/// owns a run at a time.
pub struct RunRepository {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl RunRepository {
    /// Open (or create) the repository under `<root>/runs`.
    pub fn open(root: impl AsRef<Path>) -> LedgerResult<Self> {
        let dir = root.as_ref().join("runs");
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn path(&self, id: &str) -> PathBuf {
        fs_store::record_path(&self.dir, id, "json")
    }

    /// Merge `patch` over the stored run (or create it) and persist.
    pub fn upsert(&self, patch: RunPatch) -> LedgerResult<Run> {
        if patch.id.trim().is_empty() {
            return Err(LedgerError::Invalid("run id must not be empty".into()));
        }
        let _guard = self.write_lock.lock().map_err(|_| LedgerError::LockPoisoned)?;

        let path = self.path(&patch.id);
        let existing = fs_store::read_json::<Run>(&path)?.ok_or_log(&path);
        let now = Utc::now();

        let run = match existing {
            Some(mut run) => {
                let previous = run.updated_at;
                patch.merge_into(&mut run)?;
                run.updated_at = if now > previous {
                    now
                } else {
                    previous + Duration::microseconds(1)
                };
                run
            }
            None => patch.into_new_run(now)?,
        };

        fs_store::write_json_atomic(&path, &run)?;
        debug!(run_id = %run.id, status = %run.status, "Run upserted");
        Ok(run)
    }

    pub fn get_by_id(&self, id: &str) -> LedgerResult<Option<Run>> {
        let path = self.path(id);
        Ok(fs_store::read_json::<Run>(&path)?.ok_or_log(&path))
    }

    /// Runs ordered by most recent update. `limit == 0` returns all.
    pub fn list(&self, limit: usize) -> LedgerResult<Vec<Run>> {
        let mut runs: Vec<Run> = fs_store::scan_json_dir(&self.dir)?;
        runs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        if limit > 0 {
            runs.truncate(limit);
        }
        Ok(runs)
    }

    /// Import completed debate sessions that predate the ledger.
    ///
    /// Idempotent: sessions that already have a run are skipped. Returns the
    /// number of runs created. `limit == 0` imports without bound.
    pub fn migrate_from_legacy_debates(
        &self,
        sessions: &dyn SessionStore,
        limit: usize,
    ) -> LedgerResult<usize> {
        let mut imported = 0;
        for session in sessions.list()? {
            if limit > 0 && imported >= limit {
                break;
            }
            if session.status != DebateStatus::Completed {
                continue;
            }
            if self.get_by_id(&session.debate_id)?.is_some() {
                continue;
            }

            let started_at = session.started_at.unwrap_or(session.created_at);
            let finished_at = session.completed_at.unwrap_or(session.updated_at);
            let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;

            let mut metadata = Map::new();
            metadata.insert("migrated".into(), Value::Bool(true));
            metadata.insert("topic".into(), json!(session.topic));
            metadata.insert("turns".into(), json!(session.turns.len()));
            metadata.insert("rounds".into(), json!(session.settings.rounds));

            self.upsert(
                RunPatch::new(&session.debate_id)
                    .kind("debate")
                    .status(RunStatus::Completed)
                    .started_at(started_at)
                    .finished_at(finished_at)
                    .duration_ms(duration_ms)
                    .metadata(metadata),
            )?;
            imported += 1;
        }
        info!(imported, "Legacy debate migration finished");
        Ok(imported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_upsert_preserves_created_at_and_advances_updated_at() {
        let dir = tempdir().unwrap();
        let repo = RunRepository::open(dir.path()).unwrap();

        let first = repo
            .upsert(RunPatch::new("run-1").kind("debate").status(RunStatus::Running))
            .unwrap();
        let second = repo
            .upsert(RunPatch::new("run-1").status(RunStatus::Completed))
            .unwrap();

        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at > first.updated_at);
        assert_eq!(second.kind, "debate");
        assert_eq!(second.status, RunStatus::Completed);
    }

    #[test]
    fn test_metadata_replaced_wholesale() {
        let dir = tempdir().unwrap();
        let repo = RunRepository::open(dir.path()).unwrap();

        let mut a = Map::new();
        a.insert("a".into(), json!(1));
        repo.upsert(RunPatch::new("r").kind("k").metadata(a)).unwrap();

        let mut b = Map::new();
        b.insert("b".into(), json!(2));
        let run = repo.upsert(RunPatch::new("r").metadata(b)).unwrap();
        assert!(run.metadata.get("a").is_none());
        assert_eq!(run.metadata["b"], 2);
    }

    #[test]
    fn test_clear_outcome_resets_previous_attempt() {
        let dir = tempdir().unwrap();
        let repo = RunRepository::open(dir.path()).unwrap();
        let now = Utc::now();

        repo.upsert(
            RunPatch::new("r")
                .kind("k")
                .status(RunStatus::Failed)
                .finished_at(now)
                .duration_ms(12)
                .error("UPSTREAM_DOWN: 503"),
        )
        .unwrap();

        let running = repo
            .upsert(RunPatch::new("r").status(RunStatus::Running).clear_outcome())
            .unwrap();
        assert!(running.finished_at.is_none());
        assert!(running.duration_ms.is_none());
        assert!(running.error.is_none());

        let failed_again = repo
            .upsert(RunPatch::new("r").clear_error().error("TIMEOUT: slow"))
            .unwrap();
        assert_eq!(failed_again.error.as_deref(), Some("TIMEOUT: slow"));
    }

    #[test]
    fn test_ids_differing_only_in_punctuation_stay_separate() {
        let dir = tempdir().unwrap();
        let repo = RunRepository::open(dir.path()).unwrap();
        repo.upsert(RunPatch::new("a:b").kind("first")).unwrap();
        repo.upsert(RunPatch::new("a_b").kind("second")).unwrap();

        assert_eq!(repo.get_by_id("a:b").unwrap().unwrap().kind, "first");
        assert_eq!(repo.get_by_id("a_b").unwrap().unwrap().kind, "second");
        assert_eq!(repo.list(0).unwrap().len(), 2);
    }

    #[test]
    fn test_validation() {
        let dir = tempdir().unwrap();
        let repo = RunRepository::open(dir.path()).unwrap();

        assert!(matches!(
            repo.upsert(RunPatch::new("")),
            Err(LedgerError::Invalid(_))
        ));
        assert!(matches!(
            repo.upsert(RunPatch::new("no-kind")),
            Err(LedgerError::Invalid(_))
        ));
        assert!(repo.get_by_id("no-kind").unwrap().is_none());
    }

    #[test]
    fn test_list_newest_first_and_skips_corrupt() {
        let dir = tempdir().unwrap();
        let repo = RunRepository::open(dir.path()).unwrap();
        repo.upsert(RunPatch::new("old").kind("k")).unwrap();
        repo.upsert(RunPatch::new("new").kind("k")).unwrap();
        std::fs::write(dir.path().join("runs").join("broken.json"), "{nope").unwrap();

        let runs = repo.list(0).unwrap();
        let ids: Vec<_> = runs.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "old"]);
        assert_eq!(repo.list(1).unwrap().len(), 1);
    }

    #[test]
    fn test_status_wire_format() {
        assert_eq!(serde_json::to_value(RunStatus::Queued).unwrap(), "queued");
        assert_eq!("failed".parse::<RunStatus>().unwrap(), RunStatus::Failed);
        assert!("bogus".parse::<RunStatus>().is_err());
    }
}
