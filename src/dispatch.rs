#![forbid(unsafe_code)]

//! Out-of-band execution of download jobs.
//!
//! Request handlers push a [`DownloadJob`] onto a bounded [`JobQueue`] and
//! return at once. A single consumer ([`JobReceiver::run`]) pulls jobs and
//! runs each on its own task, at most `max_concurrent` at a time, through
//! [`Pipeline::process_job`].

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;

use crate::chat::ChatApi;
use crate::delivery::{DeliveryContext, DeliveryError, DeliveryOutcome, DeliverySelector, size_mb};
use crate::fetcher::{FetchError, MediaFetcher, resolve_tag};
use crate::messages;

const MAX_FINISHED_JOBS: usize = 1024;

/// One accepted download request. `resolution` stays a free-form tag on the
/// wire; the fetcher resolves it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadJob {
    pub chat_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    pub url: String,
    pub resolution: String,
}

impl DownloadJob {
    pub fn context(&self) -> DeliveryContext {
        DeliveryContext {
            chat_id: self.chat_id,
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
        }
    }
}

/// Wire envelope: `{"type": "process_video", ...job fields}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    ProcessVideo(DownloadJob),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("job queue is full")]
    Full,
    #[error("job queue is closed")]
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobRecord {
    pub id: String,
    pub status: JobStatus,
    pub message: String,
}

/// In-memory job status table. Finished jobs beyond a fixed count are
/// forgotten oldest first.
#[derive(Default)]
pub struct JobRegistry {
    inner: Mutex<RegistryInner>,
    counter: AtomicUsize,
}

#[derive(Default)]
struct RegistryInner {
    jobs: HashMap<String, JobRecord>,
    finished: VecDeque<String>,
}

impl JobRegistry {
    fn next_id(&self) -> String {
        let id = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("job-{id}")
    }

    fn insert(&self, id: &str) {
        self.inner.lock().jobs.insert(
            id.to_string(),
            JobRecord {
                id: id.to_string(),
                status: JobStatus::Queued,
                message: "Queued".to_string(),
            },
        );
    }

    fn remove(&self, id: &str) {
        self.inner.lock().jobs.remove(id);
    }

    fn update(&self, id: &str, status: JobStatus, message: impl Into<String>) {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.jobs.get_mut(id) {
            record.status = status;
            record.message = message.into();
        }
        if status.is_finished() {
            inner.finished.push_back(id.to_string());
            while inner.finished.len() > MAX_FINISHED_JOBS {
                if let Some(old) = inner.finished.pop_front() {
                    inner.jobs.remove(&old);
                }
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<JobRecord> {
        self.inner.lock().jobs.get(id).cloned()
    }
}

struct QueuedJob {
    id: String,
    job: DownloadJob,
}

/// Producer side of the task queue.
#[derive(Clone)]
pub struct JobQueue {
    sender: mpsc::Sender<QueuedJob>,
    registry: Arc<JobRegistry>,
}

pub struct JobReceiver {
    receiver: mpsc::Receiver<QueuedJob>,
    registry: Arc<JobRegistry>,
}

impl JobQueue {
    pub fn bounded(capacity: usize) -> (Self, JobReceiver) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let registry = Arc::new(JobRegistry::default());
        (
            Self {
                sender,
                registry: registry.clone(),
            },
            JobReceiver { receiver, registry },
        )
    }

    /// Schedules `job` without waiting for capacity and returns its id.
    pub fn enqueue(&self, job: DownloadJob) -> Result<String, DispatchError> {
        let id = self.registry.next_id();
        self.registry.insert(&id);
        match self.sender.try_send(QueuedJob {
            id: id.clone(),
            job,
        }) {
            Ok(()) => {
                tracing::info!(job_id = %id, "job queued");
                Ok(id)
            }
            Err(err) => {
                self.registry.remove(&id);
                Err(match err {
                    mpsc::error::TrySendError::Full(_) => DispatchError::Full,
                    mpsc::error::TrySendError::Closed(_) => DispatchError::Closed,
                })
            }
        }
    }

    pub fn status(&self, id: &str) -> Option<JobRecord> {
        self.registry.get(id)
    }

    /// Status table that outlives the queue handle.
    pub fn registry(&self) -> Arc<JobRegistry> {
        self.registry.clone()
    }
}

impl JobReceiver {
    /// Consumes jobs until every [`JobQueue`] handle is dropped, then waits
    /// for in-flight jobs to finish.
    pub async fn run(mut self, pipeline: Arc<Pipeline>, max_concurrent: usize) {
        let limit = Arc::new(Semaphore::new(max_concurrent.max(1)));
        let mut in_flight: Vec<(String, JoinHandle<()>)> = Vec::new();

        while let Some(QueuedJob { id, job }) = self.receiver.recv().await {
            let Ok(permit) = limit.clone().acquire_owned().await else {
                break;
            };
            let (finished, running): (Vec<_>, Vec<_>) = in_flight
                .into_iter()
                .partition(|(_, handle)| handle.is_finished());
            in_flight = running;
            for (finished_id, handle) in finished {
                self.settle(&finished_id, handle).await;
            }

            let pipeline = pipeline.clone();
            let registry = self.registry.clone();
            let task_id = id.clone();
            in_flight.push((
                id,
                tokio::spawn(async move {
                    let _permit = permit;
                    registry.update(&task_id, JobStatus::Running, "Running");
                    match pipeline.process_job(&job).await {
                        Ok(_) => registry.update(&task_id, JobStatus::Completed, "Done"),
                        Err(err) => registry.update(
                            &task_id,
                            JobStatus::Failed,
                            format!("Failed: {}", err.kind()),
                        ),
                    }
                }),
            ));
        }

        for (id, handle) in in_flight {
            self.settle(&id, handle).await;
        }
    }

    /// Awaits a job task; a panicked task is marked failed.
    async fn settle(&self, id: &str, handle: JoinHandle<()>) {
        if let Err(err) = handle.await {
            tracing::error!(job_id = %id, error = %err, "job task panicked");
            self.registry.update(id, JobStatus::Failed, "Failed: internal error");
        }
    }

    pub fn spawn(self, pipeline: Arc<Pipeline>, max_concurrent: usize) -> JoinHandle<()> {
        tokio::spawn(self.run(pipeline, max_concurrent))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("cannot prepare working directory: {0}")]
    WorkDir(#[source] std::io::Error),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

impl JobError {
    /// Short label for the job status table. Tool output stays in the logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WorkDir(_) => "working directory unavailable",
            Self::Fetch(FetchError::TimedOut(_)) => "download timed out",
            Self::Fetch(FetchError::NoOutput(_)) => "download produced no file",
            Self::Fetch(_) => "download failed",
            Self::Delivery(DeliveryError::Artifact(_)) => "artifact unreadable",
            Self::Delivery(DeliveryError::Send(_)) => "sending failed",
            Self::Delivery(DeliveryError::Compress(_)) => "compression failed",
            Self::Delivery(DeliveryError::Upload(_)) => "upload failed",
            Self::Delivery(DeliveryError::Link(_)) => "link generation failed",
        }
    }
}

/// Fetch then deliver, inside a working directory unique to the job.
pub struct Pipeline {
    fetcher: MediaFetcher,
    delivery: DeliverySelector,
    chat: Arc<dyn ChatApi>,
    work_root: PathBuf,
}

impl Pipeline {
    pub fn new(
        fetcher: MediaFetcher,
        delivery: DeliverySelector,
        chat: Arc<dyn ChatApi>,
        work_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            fetcher,
            delivery,
            chat,
            work_root: work_root.into(),
        }
    }

    pub async fn process_job(&self, job: &DownloadJob) -> Result<DeliveryOutcome, JobError> {
        let resolution = resolve_tag(&job.resolution);
        let work_dir = match self.make_work_dir() {
            Ok(dir) => dir,
            Err(err) => {
                tracing::error!(chat_id = job.chat_id, error = %err, "job aborted before download");
                self.notify(job.chat_id, messages::DOWNLOAD_FAILED).await;
                return Err(JobError::WorkDir(err));
            }
        };

        let artifact = match self.fetcher.fetch(&job.url, resolution, work_dir.path()).await {
            Ok(path) => path,
            Err(err) => {
                tracing::error!(
                    alert = "download_failed",
                    chat_id = job.chat_id,
                    url = %job.url,
                    resolution = %resolution,
                    error = %err,
                    "download failed"
                );
                self.notify(job.chat_id, messages::DOWNLOAD_FAILED).await;
                return Err(err.into());
            }
        };

        let file_name = artifact
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let size = tokio::fs::metadata(&artifact)
            .await
            .map(|meta| meta.len())
            .unwrap_or_default();
        self.notify(
            job.chat_id,
            &messages::sending(&file_name, resolution.as_str(), size_mb(size)),
        )
        .await;

        let outcome = self.delivery.deliver(&artifact, &job.context()).await?;
        tracing::info!(chat_id = job.chat_id, file_name = %file_name, ?outcome, "job delivered");
        Ok(outcome)
    }

    fn make_work_dir(&self) -> std::io::Result<tempfile::TempDir> {
        std::fs::create_dir_all(&self.work_root)?;
        tempfile::Builder::new()
            .prefix("job-")
            .tempdir_in(&self.work_root)
    }

    async fn notify(&self, chat_id: i64, text: &str) {
        if let Err(err) = self.chat.send_message(chat_id, text).await {
            tracing::warn!(chat_id, error = %format!("{err:#}"), "chat notice not delivered");
        }
    }
}
