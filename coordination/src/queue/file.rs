//! File-backed job queue
//!
//! Layout under the queue root:
//!
//! ```text
//! jobs/<id>.json    one document per job, replaced atomically (temp + rename)
//! locks/<id>.lock   exclusive mutation lock, created with O_EXCL
//! ```
//!
//! Every mutation of an existing job (claim, ack, fail) happens while holding
//! that job's lock file, and the job is re-read and re-validated under the
//! lock. Two processes scanning the same candidate therefore cannot both claim
//! it: the loser either fails to create the lock or finds the job no longer
//! claimable once it gets it.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::{
    DequeueOptions, EnqueueOptions, EnqueueOutcome, FailOptions, Job, JobError, JobFilter,
};
use super::{JobQueue, QueueError, QueueResult};
use crate::fs_store::{read_json, record_path, scan_json_dir, write_json_atomic, Record};

/// A lock older than this is assumed abandoned by a crashed process.
const STALE_LOCK_AGE: Duration = Duration::from_secs(30);

/// How long ack/fail wait for a busy lock before giving up.
const LOCK_WAIT: Duration = Duration::from_secs(5);

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Queue persisted as one JSON file per job.
pub struct FileJobQueue {
    jobs_dir: PathBuf,
    locks_dir: PathBuf,
}

impl FileJobQueue {
    /// Open or create a queue rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> QueueResult<Self> {
        let root = root.as_ref();
        let jobs_dir = root.join("jobs");
        let locks_dir = root.join("locks");
        fs::create_dir_all(&jobs_dir)?;
        fs::create_dir_all(&locks_dir)?;
        Ok(Self {
            jobs_dir,
            locks_dir,
        })
    }

    fn job_path(&self, job_id: &str) -> PathBuf {
        record_path(&self.jobs_dir, job_id, "json")
    }

    fn lock_path(&self, job_id: &str) -> PathBuf {
        record_path(&self.locks_dir, job_id, "lock")
    }

    fn read_job(&self, job_id: &str) -> QueueResult<Option<Job>> {
        let path = self.job_path(job_id);
        Ok(read_json::<Job>(&path)?.ok_or_log(&path))
    }

    fn write_job(&self, job: &Job) -> QueueResult<()> {
        write_json_atomic(&self.job_path(&job.id), job)?;
        Ok(())
    }

    fn scan(&self) -> QueueResult<Vec<Job>> {
        Ok(scan_json_dir(&self.jobs_dir)?)
    }

    /// Apply `mutate` to a job while holding its lock, waiting for the lock
    /// if another process holds it.
    fn mutate_locked(
        &self,
        job_id: &str,
        mutate: impl FnOnce(&mut Job) -> QueueResult<()>,
    ) -> QueueResult<Job> {
        let _lock = JobLock::acquire_waiting(&self.lock_path(job_id), job_id, LOCK_WAIT)?;
        let path = self.job_path(job_id);
        let mut job = match read_json::<Job>(&path)? {
            Record::Present(job) => job,
            Record::Missing => return Err(QueueError::NotFound(job_id.to_string())),
            Record::Corrupt(reason) => {
                warn!(job_id, %reason, "Job record unreadable");
                return Err(QueueError::NotFound(job_id.to_string()));
            }
        };
        mutate(&mut job)?;
        self.write_job(&job)?;
        Ok(job)
    }

    /// Try to claim one candidate. `None` if another worker got there first.
    fn try_claim(&self, candidate: &Job, opts: &DequeueOptions) -> QueueResult<Option<Job>> {
        let Some(_lock) = JobLock::try_acquire(&self.lock_path(&candidate.id))? else {
            debug!(job_id = %candidate.id, "Candidate locked by another worker");
            return Ok(None);
        };

        // Re-read under the lock: the scan may be stale.
        let now = Utc::now();
        let Some(mut job) = self.read_job(&candidate.id)? else {
            return Ok(None);
        };
        if !job.is_claimable(&opts.job_types, now) {
            return Ok(None);
        }

        if job.is_reclaim() {
            info!(
                job_id = %job.id,
                previous_worker = ?job.worker_id,
                attempts = job.attempts,
                "Reclaiming expired lease"
            );
        }
        job.claim(&opts.worker_id, opts.lease_ms, now);
        self.write_job(&job)?;
        Ok(Some(job))
    }
}

impl JobQueue for FileJobQueue {
    fn enqueue(
        &self,
        job_type: &str,
        payload: Value,
        opts: EnqueueOptions,
    ) -> QueueResult<EnqueueOutcome> {
        let now = Utc::now();
        let job = Job::new(job_type, payload, &opts, now)?;

        if let Some(key) = opts.idempotency_key.as_deref() {
            if let Some(existing) = self.scan()?.into_iter().find(|j| j.dedupes(key)) {
                debug!(job_id = %existing.id, key, "Enqueue deduped");
                return Ok(EnqueueOutcome {
                    job: existing,
                    deduped: true,
                });
            }
        }

        self.write_job(&job)?;
        info!(job_id = %job.id, run_id = %job.run_id, job_type, "Job enqueued");
        Ok(EnqueueOutcome {
            job,
            deduped: false,
        })
    }

    fn dequeue(&self, opts: &DequeueOptions) -> QueueResult<Option<Job>> {
        let now = Utc::now();
        let mut candidates: Vec<Job> = self
            .scan()?
            .into_iter()
            .filter(|job| job.is_claimable(&opts.job_types, now))
            .collect();
        candidates.sort_by(|a, b| a.claim_order().cmp(&b.claim_order()));

        for candidate in &candidates {
            if let Some(job) = self.try_claim(candidate, opts)? {
                debug!(job_id = %job.id, worker_id = %opts.worker_id, attempt = job.attempts, "Job claimed");
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    fn ack(&self, job_id: &str, result: Value) -> QueueResult<Job> {
        self.mutate_locked(job_id, |job| job.complete(result, Utc::now()))
    }

    fn fail(&self, job_id: &str, error: &JobError, opts: &FailOptions) -> QueueResult<Job> {
        self.mutate_locked(job_id, |job| job.record_failure(error, opts, Utc::now()))
    }

    fn get(&self, job_id: &str) -> QueueResult<Option<Job>> {
        self.read_job(job_id)
    }

    fn list(&self, filter: &JobFilter) -> QueueResult<Vec<Job>> {
        Ok(filter.apply(self.scan()?))
    }
}

/// Exclusive lock on one job, released on drop.
///
/// The lock file holds a per-acquisition token; release and stale-lock
/// breaking only ever remove a file whose token they have seen.
struct JobLock {
    path: PathBuf,
    token: String,
}

impl JobLock {
    /// Create the lock file if nobody holds it.
    fn try_acquire(path: &Path) -> QueueResult<Option<Self>> {
        if let Some(lock) = Self::try_create(path)? {
            return Ok(Some(lock));
        }
        if Self::break_if_stale(path)? {
            return Self::try_create(path);
        }
        Ok(None)
    }

    fn try_create(path: &Path) -> QueueResult<Option<Self>> {
        let token = format!("{} {}", std::process::id(), Uuid::new_v4().simple());
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                file.write_all(token.as_bytes())?;
                Ok(Some(Self {
                    path: path.to_path_buf(),
                    token,
                }))
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Poll for the lock, sleeping the calling thread between attempts.
    /// Async callers run this on the blocking pool.
    fn acquire_waiting(path: &Path, job_id: &str, wait: Duration) -> QueueResult<Self> {
        let deadline = std::time::Instant::now() + wait;
        loop {
            if let Some(lock) = Self::try_acquire(path)? {
                return Ok(lock);
            }
            if std::time::Instant::now() >= deadline {
                return Err(QueueError::LockTimeout(job_id.to_string()));
            }
            std::thread::sleep(LOCK_RETRY_INTERVAL);
        }
    }

    /// Remove a lock abandoned by a crashed process. Returns true if the
    /// path is now free.
    ///
    /// The stale file is first renamed to a unique tombstone. If the tombstone
    /// turns out to hold a different token than the one judged stale, another
    /// claimer broke the lock and re-acquired it in between; its lock is put
    /// back and nothing is removed.
    fn break_if_stale(path: &Path) -> QueueResult<bool> {
        let modified = match fs::metadata(path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        };
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or_default();
        if age < STALE_LOCK_AGE {
            return Ok(false);
        }
        let stale_token = match fs::read_to_string(path) {
            Ok(token) => token,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        };

        let tombstone = path.with_extension(format!("stale-{}", Uuid::new_v4().simple()));
        match fs::rename(path, &tombstone) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        }
        if fs::read_to_string(&tombstone)? != stale_token {
            // Someone else's live lock. Restore it unless the path was
            // taken again meanwhile.
            if let Err(e) = fs::hard_link(&tombstone, path) {
                warn!(path = %path.display(), error = %e, "Could not restore job lock");
            }
            fs::remove_file(&tombstone)?;
            return Ok(false);
        }
        warn!(path = %path.display(), age_secs = age.as_secs(), "Breaking stale job lock");
        fs::remove_file(&tombstone)?;
        Ok(true)
    }

    fn release(&self) -> io::Result<()> {
        match fs::read_to_string(&self.path) {
            Ok(token) if token == self.token => fs::remove_file(&self.path),
            Ok(_) => {
                warn!(path = %self.path.display(), "Job lock was taken over, leaving it in place");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for JobLock {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(path = %self.path.display(), error = %e, "Failed to release job lock");
        }
    }
}
