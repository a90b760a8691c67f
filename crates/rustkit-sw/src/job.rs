//! Jobs and per-scope job queues.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use url::Url;

use rustkit_common::LockExt;

use crate::context::WebContext;
use crate::origin::StorageKey;
use crate::promise::JobPromise;
use crate::{UpdateViaCache, WorkerType};

/// Kind of job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Register,
    Update,
    Unregister,
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobType::Register => f.write_str("register"),
            JobType::Update => f.write_str("update"),
            JobType::Unregister => f.write_str("unregister"),
        }
    }
}

/// Unique identifier for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

impl JobId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Promise and coalesced duplicates, guarded together.
#[derive(Debug, Default)]
pub(crate) struct JobShared {
    /// Taken when the job is settled; a job without a promise accepts no
    /// more equivalent jobs.
    pub promise: Option<JobPromise>,
    pub equivalent_jobs: Vec<Arc<Job>>,
}

/// One requested register, update or unregister operation.
pub struct Job {
    pub(crate) id: JobId,
    pub(crate) job_type: JobType,
    pub(crate) storage_key: StorageKey,
    pub(crate) scope_url: Url,
    pub(crate) script_url: Option<Url>,
    pub(crate) referrer: Option<Url>,
    pub(crate) client: Option<Arc<WebContext>>,
    pub(crate) worker_type: WorkerType,
    pub(crate) update_via_cache: UpdateViaCache,
    pub(crate) force_bypass_cache: bool,
    pub(crate) shared: Mutex<JobShared>,
}

impl Job {
    /// Create Job. The referrer is the client's creation URL.
    pub(crate) fn new(
        job_type: JobType,
        storage_key: StorageKey,
        scope_url: Url,
        script_url: Option<Url>,
        promise: Option<JobPromise>,
        client: Option<Arc<WebContext>>,
    ) -> Self {
        let referrer = client.as_ref().map(|client| client.creation_url().clone());
        Self {
            id: JobId::new(),
            job_type,
            storage_key,
            scope_url,
            script_url,
            referrer,
            client,
            worker_type: WorkerType::Classic,
            update_via_cache: UpdateViaCache::Imports,
            force_bypass_cache: false,
            shared: Mutex::new(JobShared {
                promise,
                equivalent_jobs: Vec::new(),
            }),
        }
    }

    pub(crate) fn with_update_via_cache(mut self, mode: UpdateViaCache) -> Self {
        self.update_via_cache = mode;
        self
    }

    pub(crate) fn with_worker_type(mut self, worker_type: WorkerType) -> Self {
        self.worker_type = worker_type;
        self
    }

    pub(crate) fn with_force_bypass_cache(mut self) -> Self {
        self.force_bypass_cache = true;
        self
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn job_type(&self) -> JobType {
        self.job_type
    }

    pub fn scope_url(&self) -> &Url {
        &self.scope_url
    }

    pub fn script_url(&self) -> Option<&Url> {
        self.script_url.as_ref()
    }

    /// Two jobs are equivalent when their type matches and, for register and
    /// update jobs, scope, script and cache mode match; for unregister jobs,
    /// scope matches.
    pub fn is_equivalent(&self, other: &Job) -> bool {
        if self.job_type != other.job_type {
            return false;
        }
        match self.job_type {
            JobType::Register | JobType::Update => {
                self.scope_url == other.scope_url
                    && self.script_url == other.script_url
                    && self.update_via_cache == other.update_via_cache
            }
            JobType::Unregister => self.scope_url == other.scope_url,
        }
    }

    /// Whether the job's promise is present and still pending.
    pub(crate) fn has_pending_promise(&self) -> bool {
        self.shared
            .lock_or_recover()
            .promise
            .as_ref()
            .map_or(false, JobPromise::is_pending)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("type", &self.job_type)
            .field("scope_url", &self.scope_url.as_str())
            .field("script_url", &self.script_url.as_ref().map(Url::as_str))
            .finish_non_exhaustive()
    }
}

/// Outcome of [`JobQueue::coalesce_or_enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scheduled {
    /// The queue was empty; the job is now running.
    Started,
    /// Appended behind other jobs.
    Queued,
    /// Folded into the last queued job's equivalent jobs.
    Coalesced,
}

/// FIFO of jobs for one scope. The first job is the running one.
pub struct JobQueue {
    scope: String,
    jobs: Mutex<VecDeque<Arc<Job>>>,
}

impl JobQueue {
    pub(crate) fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            jobs: Mutex::new(VecDeque::new()),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Schedule Job steps 5-6.
    pub(crate) fn coalesce_or_enqueue(&self, job: Arc<Job>) -> Scheduled {
        let mut jobs = self.jobs.lock_or_recover();
        let Some(last) = jobs.back().cloned() else {
            jobs.push_back(job);
            return Scheduled::Started;
        };

        if last.has_pending_promise() && job.is_equivalent(&last) {
            last.shared.lock_or_recover().equivalent_jobs.push(job);
            return Scheduled::Coalesced;
        }

        jobs.push_back(job);
        Scheduled::Queued
    }

    pub fn first_item(&self) -> Option<Arc<Job>> {
        self.jobs.lock_or_recover().front().cloned()
    }

    pub(crate) fn dequeue(&self) -> Option<Arc<Job>> {
        self.jobs.lock_or_recover().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock_or_recover().is_empty()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock_or_recover().len()
    }
}

impl fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobQueue")
            .field("scope", &self.scope)
            .field("len", &self.len())
            .finish()
    }
}
