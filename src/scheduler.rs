//! Bulk job scheduling: a single background worker drains a FIFO queue of
//! jobs, each job being an ordered list of face/audio pairs processed
//! independently. Cancellation takes effect at pair boundaries.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::Result;

pub type JobId = Uuid;

/// One face/audio input pair inside a bulk job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilePair {
    pub face_path: PathBuf,
    pub audio_path: PathBuf,
}

/// Everything needed to enqueue a bulk job.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub pairs: Vec<FilePair>,
    pub checkpoint: PathBuf,
    pub settings: Settings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Processing,
    Completed,
    CompletedWithErrors,
    Failed,
    Cancelled,
}

impl JobState {
    fn is_terminal(self) -> bool {
        !matches!(self, JobState::Queued | JobState::Processing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PairStatus {
    Success,
    Failed,
}

/// Outcome of one pair, recorded in submission order.
#[derive(Debug, Clone, Serialize)]
pub struct PairResult {
    pub index: usize,
    pub face_file: PathBuf,
    pub audio_file: PathBuf,
    pub status: PairStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub processed_at: DateTime<Utc>,
}

/// Full snapshot of one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub id: JobId,
    pub state: JobState,
    /// Percentage of pairs attempted, 0..=100.
    pub progress: u8,
    pub total_files: usize,
    pub processed_files: usize,
    pub failed_files: usize,
    pub results: Vec<PairResult>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Compact entry for job listings.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub id: JobId,
    pub state: JobState,
    pub progress: u8,
    pub total_files: usize,
    pub processed_files: usize,
    pub failed_files: usize,
    pub created_at: DateTime<Utc>,
}

/// All known jobs, grouped by lifecycle stage.
#[derive(Debug, Clone, Serialize)]
pub struct JobOverview {
    pub queued: Vec<JobSummary>,
    pub active: Vec<JobSummary>,
    pub completed: Vec<JobSummary>,
    pub failed: Vec<JobSummary>,
}

struct Job {
    request: JobRequest,
    status: JobStatus,
}

/// Executes one pair end to end and returns the produced output path.
///
/// Implemented by the full pipeline in production; tests substitute their own.
pub trait PairRunner: Send {
    fn run_pair(
        &mut self,
        job_id: JobId,
        index: usize,
        pair: &FilePair,
        checkpoint: &Path,
        settings: &Settings,
    ) -> Result<PathBuf>;
}

type Registry = HashMap<JobId, Job>;

/// Owns the worker thread and the job registry.
pub struct JobScheduler {
    registry: Arc<Mutex<Registry>>,
    tx: mpsc::Sender<JobId>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl JobScheduler {
    pub fn start(runner: Box<dyn PairRunner>) -> Result<Self> {
        let registry: Arc<Mutex<Registry>> = Arc::new(Mutex::new(HashMap::new()));
        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel();

        let worker = Worker {
            registry: registry.clone(),
            running: running.clone(),
            runner,
        };
        let handle = thread::Builder::new()
            .name("bulk-worker".to_string())
            .spawn(move || worker.run(rx))?;

        Ok(Self {
            registry,
            tx,
            running,
            worker: Some(handle),
        })
    }

    /// Enqueue a job and return its id immediately.
    pub fn submit(&self, request: JobRequest) -> JobId {
        let id = Uuid::new_v4();
        let total = request.pairs.len();
        let job = Job {
            request,
            status: JobStatus {
                id,
                state: JobState::Queued,
                progress: 0,
                total_files: total,
                processed_files: 0,
                failed_files: 0,
                results: Vec::new(),
                created_at: Utc::now(),
                started_at: None,
                finished_at: None,
                error: None,
            },
        };
        self.registry.lock().insert(id, job);
        // Worker gone means shutdown; the job stays queued in the registry.
        if self.tx.send(id).is_err() {
            warn!("Worker is not running, job {} will not be processed", id);
        }
        info!("Queued bulk job {} with {} pairs", id, total);
        id
    }

    /// Snapshot of one job, if known.
    pub fn status(&self, id: JobId) -> Option<JobStatus> {
        self.registry.lock().get(&id).map(|job| job.status.clone())
    }

    /// Every known job, grouped. Cancelled jobs are listed with the failed.
    pub fn list_all(&self) -> JobOverview {
        let registry = self.registry.lock();
        let mut overview = JobOverview {
            queued: Vec::new(),
            active: Vec::new(),
            completed: Vec::new(),
            failed: Vec::new(),
        };
        for job in registry.values() {
            let summary = JobSummary {
                id: job.status.id,
                state: job.status.state,
                progress: job.status.progress,
                total_files: job.status.total_files,
                processed_files: job.status.processed_files,
                failed_files: job.status.failed_files,
                created_at: job.status.created_at,
            };
            match job.status.state {
                JobState::Queued => overview.queued.push(summary),
                JobState::Processing => overview.active.push(summary),
                JobState::Completed | JobState::CompletedWithErrors => {
                    overview.completed.push(summary)
                }
                JobState::Failed | JobState::Cancelled => overview.failed.push(summary),
            }
        }
        for group in [
            &mut overview.queued,
            &mut overview.active,
            &mut overview.completed,
            &mut overview.failed,
        ] {
            group.sort_by_key(|s| s.created_at);
        }
        overview
    }

    /// Request cancellation. Returns false for unknown or already-terminal
    /// jobs. A processing job stops at the next pair boundary.
    pub fn cancel(&self, id: JobId) -> bool {
        let mut registry = self.registry.lock();
        match registry.get_mut(&id) {
            Some(job) if !job.status.state.is_terminal() => {
                let was_queued = job.status.state == JobState::Queued;
                job.status.state = JobState::Cancelled;
                if was_queued {
                    job.status.finished_at = Some(Utc::now());
                }
                info!("Cancelled job {}", id);
                true
            }
            _ => false,
        }
    }

    /// Stop accepting work and join the worker thread.
    pub fn shutdown(mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

struct Worker {
    registry: Arc<Mutex<Registry>>,
    running: Arc<AtomicBool>,
    runner: Box<dyn PairRunner>,
}

impl Worker {
    fn run(mut self, rx: mpsc::Receiver<JobId>) {
        while self.running.load(Ordering::SeqCst) {
            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(id) => self.process_job(id),
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn process_job(&mut self, id: JobId) {
        let Some((pairs, checkpoint, settings)) = self.begin_job(id) else {
            return;
        };

        let total = pairs.len();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            for (index, pair) in pairs.iter().enumerate() {
                if self.cancelled(id) {
                    info!("Job {} cancelled after {} of {} pairs", id, index, total);
                    self.finish(id, None);
                    return;
                }

                let result = self
                    .runner
                    .run_pair(id, index, pair, &checkpoint, &settings);
                self.record_pair(id, index, pair, result, total);
            }
            self.finish(id, None);
        }));

        if let Err(payload) = outcome {
            let message = panic_message(payload);
            error!("Job {} aborted: {}", id, message);
            self.finish(id, Some(message));
        }
    }

    /// Mark the job as processing and copy out what the loop needs. Returns
    /// None when the job was cancelled while still queued.
    fn begin_job(&self, id: JobId) -> Option<(Vec<FilePair>, PathBuf, Settings)> {
        let mut registry = self.registry.lock();
        let job = registry.get_mut(&id)?;
        if job.status.state != JobState::Queued {
            return None;
        }
        job.status.state = JobState::Processing;
        job.status.started_at = Some(Utc::now());
        info!("Job {} started", id);
        Some((
            job.request.pairs.clone(),
            job.request.checkpoint.clone(),
            job.request.settings.clone(),
        ))
    }

    fn cancelled(&self, id: JobId) -> bool {
        self.registry
            .lock()
            .get(&id)
            .map(|job| job.status.state == JobState::Cancelled)
            .unwrap_or(true)
    }

    fn record_pair(
        &self,
        id: JobId,
        index: usize,
        pair: &FilePair,
        result: Result<PathBuf>,
        total: usize,
    ) {
        let mut registry = self.registry.lock();
        let Some(job) = registry.get_mut(&id) else {
            return;
        };
        match result {
            Ok(output) => {
                job.status.processed_files += 1;
                job.status.results.push(PairResult {
                    index,
                    face_file: pair.face_path.clone(),
                    audio_file: pair.audio_path.clone(),
                    status: PairStatus::Success,
                    output_path: Some(output),
                    error: None,
                    processed_at: Utc::now(),
                });
            }
            Err(e) => {
                warn!("Job {} pair {} failed: {}", id, index, e);
                job.status.failed_files += 1;
                job.status.results.push(PairResult {
                    index,
                    face_file: pair.face_path.clone(),
                    audio_file: pair.audio_path.clone(),
                    status: PairStatus::Failed,
                    output_path: None,
                    error: Some(e.to_string()),
                    processed_at: Utc::now(),
                });
            }
        }
        job.status.progress = (((index + 1) as f64 / total as f64) * 100.0) as u8;
    }

    /// Seal the job: keep Cancelled as-is, otherwise derive the final state
    /// from the per-pair counts (or Failed when a job-level error is given).
    fn finish(&self, id: JobId, job_error: Option<String>) {
        let mut registry = self.registry.lock();
        let Some(job) = registry.get_mut(&id) else {
            return;
        };
        if job.status.state != JobState::Cancelled {
            job.status.state = match job_error {
                Some(message) => {
                    job.status.error = Some(message);
                    JobState::Failed
                }
                None if job.status.failed_files == 0 => JobState::Completed,
                None => JobState::CompletedWithErrors,
            };
        }
        job.status.finished_at = Some(Utc::now());
        info!(
            "Job {} finished as {:?} ({} ok, {} failed)",
            id, job.status.state, job.status.processed_files, job.status.failed_files
        );
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown worker panic".to_string()
    }
}

/// Output filename for one pair of a bulk job.
pub fn bulk_output_name(job_id: JobId, index: usize) -> String {
    format!("bulk_{}_{:03}.mp4", job_id, index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_names_are_zero_padded() {
        let id = Uuid::nil();
        assert_eq!(
            bulk_output_name(id, 7),
            format!("bulk_{}_007.mp4", id)
        );
        assert_eq!(
            bulk_output_name(id, 123),
            format!("bulk_{}_123.mp4", id)
        );
    }

    #[test]
    fn terminal_states_are_not_cancellable() {
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Processing.is_terminal());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(JobState::CompletedWithErrors.is_terminal());
    }
}
