//! Addressable, replayable ingestion jobs.

mod approve;

pub use approve::{ApprovalFailure, ApprovalItem, ApprovalReport};

use crate::error::{IngestError, JobError};
use crate::events::{
    parse_local_image_ref, ErrorStage, IngestEvent, IngestEventKind, LocalImage, PipelineMessage,
    StageError,
};
use crate::ingest::{IngestionPipeline, PipelineDeps};
use crate::models::{IngestionOptions, JobLimits, QaCandidate, UploadedFile};
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Instant;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

/// Live events buffered per subscriber before it is considered stalled and dropped.
const SUBSCRIBER_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Uploading,
    Processing,
    Done,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }

    fn rank(self) -> u8 {
        match self {
            JobStatus::Uploading => 0,
            JobStatus::Processing => 1,
            JobStatus::Done | JobStatus::Error => 2,
        }
    }

    /// Only forward moves out of a non-terminal state.
    pub fn can_advance_to(self, next: JobStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

/// Point-in-time view of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub error: Option<String>,
    pub file_names: Vec<String>,
    pub candidates: Vec<QaCandidate>,
    pub events: Vec<IngestEvent>,
}

/// Replayed history followed, for a running job, by live events.
pub struct Subscription {
    pub backlog: Vec<IngestEvent>,
    pub live: Option<mpsc::Receiver<IngestEvent>>,
}

impl Subscription {
    /// Ends after the terminal event, or right after the backlog for a finished job.
    pub fn into_stream(self) -> BoxStream<'static, IngestEvent> {
        let live = stream::iter(self.live.map(ReceiverStream::new)).flatten();
        stream::iter(self.backlog).chain(live).boxed()
    }
}

struct JobState {
    status: JobStatus,
    files: Vec<UploadedFile>,
    candidates: Vec<QaCandidate>,
    events: Vec<IngestEvent>,
    images: HashMap<String, LocalImage>,
    listeners: Vec<mpsc::Sender<IngestEvent>>,
    error: Option<String>,
}

pub struct Job {
    id: String,
    created_at: DateTime<Utc>,
    file_names: Vec<String>,
    state: Mutex<JobState>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Job {
    fn new(files: Vec<UploadedFile>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            file_names: files.iter().map(|file| file.name.clone()).collect(),
            state: Mutex::new(JobState {
                status: JobStatus::Uploading,
                files,
                candidates: Vec::new(),
                events: Vec::new(),
                images: HashMap::new(),
                listeners: Vec::new(),
                error: None,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> JobStatus {
        lock(&self.state).status
    }

    fn advance(state: &mut JobState, next: JobStatus) -> bool {
        if state.status.can_advance_to(next) {
            state.status = next;
            true
        } else {
            false
        }
    }

    fn start(&self) -> Vec<UploadedFile> {
        let mut state = lock(&self.state);
        Self::advance(&mut state, JobStatus::Processing);
        state.files.clone()
    }

    /// Stashes attached images, appends the event and relays it to live listeners.
    /// Candidate `local://` references are replaced with their served URL first,
    /// so the log, its replays and the candidate list all carry the same URL.
    fn record(&self, message: PipelineMessage, image_base: &str) {
        let PipelineMessage { mut event, images } = message;
        let mut state = lock(&self.state);

        for image in images {
            state.images.insert(image.key.clone(), image);
        }
        match &mut event.kind {
            IngestEventKind::QaGenerated { candidates, .. } => {
                self.serve_local_refs(candidates, &state.images, image_base);
            }
            IngestEventKind::FileDone { candidates, .. } => {
                self.serve_local_refs(candidates, &state.images, image_base);
                state.candidates.extend(candidates.iter().cloned());
            }
            _ => {}
        }
        Self::append(&mut state, event);
    }

    fn serve_local_refs(
        &self,
        candidates: &mut [QaCandidate],
        images: &HashMap<String, LocalImage>,
        image_base: &str,
    ) {
        for candidate in candidates.iter_mut() {
            let served = candidate
                .image_url
                .as_deref()
                .and_then(parse_local_image_ref)
                .filter(|key| images.contains_key(*key))
                .map(|key| served_image_url(image_base, &self.id, key));
            if let Some(url) = served {
                candidate.image_url = Some(url);
            }
        }
    }

    fn append(state: &mut JobState, event: IngestEvent) {
        state
            .listeners
            .retain(|listener| listener.try_send(event.clone()).is_ok());
        state.events.push(event);
    }

    /// Moves to a terminal status and releases upload buffers.
    fn finish(&self, failure: Option<String>) {
        let mut state = lock(&self.state);

        let next = if failure.is_some() {
            JobStatus::Error
        } else {
            JobStatus::Done
        };
        if !Self::advance(&mut state, next) {
            return;
        }

        if let Some(message) = &failure {
            let event = IngestEvent {
                seq: state.events.len() as u64,
                at: Utc::now(),
                kind: IngestEventKind::Error(StageError::new(
                    ErrorStage::Pipeline,
                    None,
                    message.clone(),
                )),
            };
            Self::append(&mut state, event);
            state.error = Some(message.clone());
        }

        state.files = Vec::new();
        state.listeners.clear();
    }

    fn subscribe(&self) -> Subscription {
        let mut state = lock(&self.state);
        let backlog = state.events.clone();
        if state.status.is_terminal() {
            return Subscription {
                backlog,
                live: None,
            };
        }

        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        state.listeners.push(tx);
        Subscription {
            backlog,
            live: Some(rx),
        }
    }

    fn snapshot(&self) -> JobSnapshot {
        let state = lock(&self.state);
        JobSnapshot {
            id: self.id.clone(),
            status: state.status,
            created_at: self.created_at,
            error: state.error.clone(),
            file_names: self.file_names.clone(),
            candidates: state.candidates.clone(),
            events: state.events.clone(),
        }
    }

    fn image(&self, key: &str) -> Option<LocalImage> {
        lock(&self.state).images.get(key).cloned()
    }

    #[cfg(test)]
    fn held_file_bytes(&self) -> usize {
        lock(&self.state).files.iter().map(UploadedFile::len).sum()
    }
}

/// `{image_base}/{job_id}/images/{key}`
pub fn served_image_url(image_base: &str, job_id: &str, key: &str) -> String {
    format!("{}/{job_id}/images/{key}", image_base.trim_end_matches('/'))
}

pub fn validate_upload(files: &[UploadedFile], limits: &JobLimits) -> Result<(), JobError> {
    if files.is_empty() {
        return Err(JobError::NoFiles);
    }
    if files.len() > limits.max_files {
        return Err(JobError::TooManyFiles {
            count: files.len(),
            limit: limits.max_files,
        });
    }

    let mut total = 0usize;
    for file in files {
        if file.len() > limits.max_file_bytes {
            return Err(JobError::FileTooLarge {
                name: file.name.clone(),
                size: file.len(),
                limit: limits.max_file_bytes,
            });
        }
        total += file.len();
    }

    if total > limits.max_batch_bytes {
        return Err(JobError::BatchTooLarge {
            size: total,
            limit: limits.max_batch_bytes,
        });
    }
    Ok(())
}

/// Registry of jobs with a TTL index and a ceiling on concurrent runs.
pub struct JobStore {
    deps: PipelineDeps,
    pipeline: Arc<IngestionPipeline>,
    limits: JobLimits,
    jobs: RwLock<HashMap<String, Arc<Job>>>,
    expiry: Mutex<VecDeque<(Instant, String)>>,
    slots: Arc<Semaphore>,
}

impl JobStore {
    pub fn new(
        deps: PipelineDeps,
        options: IngestionOptions,
        limits: JobLimits,
    ) -> Result<Self, IngestError> {
        let pipeline = Arc::new(IngestionPipeline::new(deps.clone(), options)?);
        Ok(Self {
            deps,
            pipeline,
            slots: Arc::new(Semaphore::new(limits.max_concurrent_jobs)),
            limits,
            jobs: RwLock::new(HashMap::new()),
            expiry: Mutex::new(VecDeque::new()),
        })
    }

    pub fn limits(&self) -> &JobLimits {
        &self.limits
    }

    /// Jobs currently holding a processing slot.
    pub fn active_jobs(&self) -> usize {
        self.limits
            .max_concurrent_jobs
            .saturating_sub(self.slots.available_permits())
    }

    pub fn len(&self) -> usize {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Validates the batch, claims a slot and starts the job in the background.
    /// Over-limit submissions are rejected here; nothing is queued.
    pub fn submit(self: &Arc<Self>, files: Vec<UploadedFile>) -> Result<String, JobError> {
        validate_upload(&files, &self.limits)?;

        let permit = self
            .slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| JobError::AtCapacity {
                active: self.active_jobs(),
                limit: self.limits.max_concurrent_jobs,
            })?;

        let job = Arc::new(Job::new(files));
        let id = job.id.clone();
        self.jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), job.clone());
        lock(&self.expiry).push_back((Instant::now() + self.limits.ttl, id.clone()));

        info!(job_id = %id, files = job.file_names.len(), "job submitted");
        tokio::spawn(self.clone().supervise(job, permit));
        Ok(id)
    }

    /// Relays pipeline output into the job and records how the run ended,
    /// including a panicked pipeline task.
    async fn supervise(self: Arc<Self>, job: Arc<Job>, permit: OwnedSemaphorePermit) {
        let _permit = permit;
        let files = job.start();
        info!(job_id = %job.id, "job processing");

        let (mut rx, handle) = self.pipeline.clone().spawn(files);
        while let Some(message) = rx.recv().await {
            job.record(message, &self.limits.public_image_base);
        }

        let failure = match handle.await {
            Ok(Ok(_)) => None,
            Ok(Err(error)) => Some(error.to_string()),
            Err(error) => Some(format!("pipeline task failed: {error}")),
        };
        match &failure {
            None => info!(job_id = %job.id, "job done"),
            Some(message) => {
                warn!(job_id = %job.id, stage = "pipeline", reason = %message, "job failed")
            }
        }
        job.finish(failure);
    }

    fn get(&self, id: &str) -> Result<Arc<Job>, JobError> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| JobError::NotFound(id.to_string()))
    }

    pub fn snapshot(&self, id: &str) -> Result<JobSnapshot, JobError> {
        Ok(self.get(id)?.snapshot())
    }

    pub fn subscribe(&self, id: &str) -> Result<Subscription, JobError> {
        Ok(self.get(id)?.subscribe())
    }

    pub fn image(&self, id: &str, key: &str) -> Result<LocalImage, JobError> {
        self.get(id)?
            .image(key)
            .ok_or_else(|| JobError::ImageNotFound {
                job_id: id.to_string(),
                key: key.to_string(),
            })
    }

    /// Drops every job whose retention window has passed. Returns how many went.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut expired = Vec::new();
        {
            let mut expiry = lock(&self.expiry);
            while expiry.front().is_some_and(|(deadline, _)| *deadline <= now) {
                if let Some((_, id)) = expiry.pop_front() {
                    expired.push(id);
                }
            }
        }
        if expired.is_empty() {
            return 0;
        }

        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let removed = expired
            .iter()
            .filter(|id| jobs.remove(id.as_str()).is_some())
            .count();
        info!(removed, remaining = jobs.len(), "swept expired jobs");
        removed
    }

    /// Periodic sweep; stops once the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        let period = self.limits.sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                store.sweep_expired();
            }
        })
    }
}
