//! Background refresh jobs.
//!
//! A [`JobManager`] owns one job table keyed by `(project_id, agent_kind)`.
//! Each key moves through `none → processing → completed | failed`, and at
//! most one `processing` job exists per key.
//!
//! Runs execute on spawned tokio tasks. A [`Semaphore`] limits how many run
//! at once (`workers`); jobs beyond that wait for a permit while still
//! reported as `processing`. Once `workers + queue_capacity` jobs are in
//! flight, further starts are rejected with [`PipelineError::JobRejected`].
//!
//! The table lock is a `std::sync::Mutex` held only for map reads and
//! writes, never across an `.await`. [`JobManager::poll`] returns a cloned
//! [`JobSnapshot`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinError;

use crate::config::JobsConfig;
use crate::error::PipelineError;
use crate::models::EntityKind;

/// Work executed by a job. Implemented by [`Pipeline`](crate::pipeline::Pipeline).
#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    async fn run(&self, project_id: &str, kind: EntityKind) -> Result<Value>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Processing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub project_id: String,
    pub agent_kind: EntityKind,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

type JobKey = (String, EntityKind);
type JobTable = Arc<Mutex<HashMap<JobKey, JobSnapshot>>>;

#[derive(Clone)]
pub struct JobManager {
    runner: Arc<dyn JobRunner>,
    jobs: JobTable,
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl JobManager {
    pub fn new(runner: Arc<dyn JobRunner>, config: &JobsConfig) -> Self {
        let workers = config.workers.max(1);
        Self {
            runner,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            permits: Arc::new(Semaphore::new(workers)),
            capacity: workers + config.queue_capacity,
        }
    }

    /// Maximum number of jobs that may be `processing` at once.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Start a refresh for `(project_id, kind)`, or return the job already there.
    ///
    /// A `processing` job is always returned as-is. A terminal job is
    /// replaced by a fresh one only when `explicit` is set. Must be called
    /// from within a tokio runtime.
    pub fn start(
        &self,
        project_id: &str,
        kind: EntityKind,
        explicit: bool,
    ) -> Result<JobSnapshot, PipelineError> {
        let key: JobKey = (project_id.to_string(), kind);
        let snapshot = {
            let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(existing) = jobs.get(&key) {
                if !existing.status.is_terminal() || !explicit {
                    return Ok(existing.clone());
                }
            }

            let running = jobs
                .values()
                .filter(|j| j.status == JobStatus::Processing)
                .count();
            if running >= self.capacity {
                tracing::warn!(project_id, agent_kind = %kind, running, capacity = self.capacity, "refresh rejected");
                return Err(PipelineError::JobRejected {
                    running,
                    capacity: self.capacity,
                });
            }

            let snapshot = JobSnapshot {
                job_id: uuid::Uuid::new_v4().to_string(),
                project_id: project_id.to_string(),
                agent_kind: kind,
                status: JobStatus::Processing,
                started_at: Utc::now(),
                completed_at: None,
                failed_at: None,
                result: None,
                error: None,
            };
            jobs.insert(key.clone(), snapshot.clone());
            snapshot
        };

        tracing::info!(job_id = %snapshot.job_id, project_id, agent_kind = %kind, "job started");
        self.spawn(key, snapshot.job_id.clone());
        Ok(snapshot)
    }

    /// Current snapshot for `(project_id, kind)`, if a job was ever started.
    pub fn poll(&self, project_id: &str, kind: EntityKind) -> Option<JobSnapshot> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.get(&(project_id.to_string(), kind)).cloned()
    }

    fn spawn(&self, key: JobKey, job_id: String) {
        let runner = self.runner.clone();
        let jobs = self.jobs.clone();
        let permits = self.permits.clone();

        tokio::spawn(async move {
            let outcome = match permits.acquire_owned().await {
                Ok(permit) => {
                    let (project_id, kind) = key.clone();
                    // Inner task so a panic surfaces as a JoinError.
                    let handle = tokio::spawn(async move {
                        let _permit = permit;
                        runner.run(&project_id, kind).await
                    });
                    match handle.await {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(e)) => Err(PipelineError::JobExecution(format!("{:#}", e))),
                        Err(join_err) => Err(PipelineError::JobExecution(describe_join_error(join_err))),
                    }
                }
                Err(_) => Err(PipelineError::JobExecution("worker pool closed".to_string())),
            };
            finish(&jobs, &key, &job_id, outcome);
        });
    }
}

fn describe_join_error(err: JoinError) -> String {
    if !err.is_panic() {
        return "job was cancelled".to_string();
    }
    let payload = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("job panicked: {}", message)
}

fn finish(jobs: &JobTable, key: &JobKey, job_id: &str, outcome: Result<Value, PipelineError>) {
    let mut jobs = jobs.lock().unwrap_or_else(|e| e.into_inner());
    let Some(job) = jobs.get_mut(key) else {
        return;
    };
    if job.job_id != job_id {
        return;
    }
    let now = Utc::now();
    match outcome {
        Ok(value) => {
            job.status = JobStatus::Completed;
            job.completed_at = Some(now);
            job.result = Some(value);
            tracing::info!(job_id, project_id = %key.0, agent_kind = %key.1, "job completed");
        }
        Err(err) => {
            job.status = JobStatus::Failed;
            job.failed_at = Some(now);
            job.error = Some(err.to_string());
            tracing::error!(job_id, project_id = %key.0, agent_kind = %key.1, error = %err, "job failed");
        }
    }
}
