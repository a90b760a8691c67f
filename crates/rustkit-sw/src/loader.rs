//! Script loading.
//!
//! The engine never fetches scripts itself. It hands a [`ScriptRequest`] and a
//! [`ScriptSink`] to the embedder's [`ScriptLoader`]; the loader answers
//! through the sink, which re-enters the engine sequence.

use hashbrown::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};
use url::Url;

use rustkit_common::{EventLoop, LockExt, Result, TaskRunner};

use crate::engine::JobsEngine;
use crate::job::JobId;
use crate::origin::Origin;

/// Content-security check applied to a request URL.
pub type CspCallback = Arc<dyn Fn(&Url) -> bool + Send + Sync>;

/// CSP callback that allows every URL.
pub fn permit_any_url() -> CspCallback {
    Arc::new(|_| true)
}

/// A script fetch.
#[derive(Clone)]
pub struct ScriptRequest {
    pub url: Url,
    pub origin: Origin,
    pub bypass_cache: bool,
    pub csp: CspCallback,
}

impl ScriptRequest {
    pub fn new(url: Url) -> Self {
        let origin = Origin::from_url(&url);
        Self {
            url,
            origin,
            bypass_cache: false,
            csp: permit_any_url(),
        }
    }

    pub fn with_bypass_cache(mut self, bypass_cache: bool) -> Self {
        self.bypass_cache = bypass_cache;
        self
    }

    /// Whether the CSP callback allows the request.
    pub fn is_allowed(&self) -> bool {
        (self.csp)(&self.url)
    }
}

impl fmt::Debug for ScriptRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptRequest")
            .field("url", &self.url.as_str())
            .field("origin", &self.origin)
            .field("bypass_cache", &self.bypass_cache)
            .finish_non_exhaustive()
    }
}

/// What a load is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoadTarget {
    MainScript,
    ImportedScript,
}

/// Receiver for one script load.
///
/// Call [`content_produced`](Self::content_produced) with the full body at
/// most once, then [`loading_complete`](Self::loading_complete) exactly once.
pub struct ScriptSink {
    engine: TaskRunner<JobsEngine>,
    job_id: JobId,
    url: Url,
    target: LoadTarget,
}

impl ScriptSink {
    pub(crate) fn new(
        engine: TaskRunner<JobsEngine>,
        job_id: JobId,
        url: Url,
        target: LoadTarget,
    ) -> Self {
        Self {
            engine,
            job_id,
            url,
            target,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Deliver the script body.
    pub fn content_produced(&self, content: String) {
        let (job_id, url, target) = (self.job_id, self.url.clone(), self.target);
        let posted = self.engine.post_task(move |engine| {
            engine.update_on_content_produced(job_id, url, target, content)
        });
        if let Err(e) = posted {
            debug!(job = %self.job_id, error = %e, "Engine gone; dropping script content");
        }
    }

    /// Finish the load. `error` describes a failed fetch.
    pub fn loading_complete(self, error: Option<String>) {
        let Self {
            engine,
            job_id,
            url,
            target,
        } = self;
        let posted = engine.post_task(move |engine| {
            engine.update_on_loading_complete(job_id, url, target, error)
        });
        if let Err(e) = posted {
            debug!(job = %job_id, error = %e, "Engine gone; dropping load completion");
        }
    }
}

impl fmt::Debug for ScriptSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptSink")
            .field("job", &self.job_id)
            .field("url", &self.url.as_str())
            .field("target", &self.target)
            .finish()
    }
}

/// Asynchronous script fetcher supplied by the embedder.
pub trait ScriptLoader: Send + Sync {
    /// Start loading. Must return without waiting for the result.
    fn load(&self, request: ScriptRequest, sink: ScriptSink);
}

// ==================== In-memory loader ====================

type Deferred = Vec<(ScriptRequest, ScriptSink)>;

/// Loader serving scripts from memory on its own thread.
///
/// Unknown URLs fail like a network error. While paused, requests are recorded
/// but held until [`resume`](Self::resume).
#[derive(Clone)]
pub struct InMemoryScriptLoader {
    event_loop: Arc<EventLoop>,
    scripts: Arc<Mutex<HashMap<Url, String>>>,
    requests: Arc<Mutex<Vec<ScriptRequest>>>,
    paused: Arc<Mutex<Option<Deferred>>>,
}

impl InMemoryScriptLoader {
    pub fn new() -> Result<Self> {
        Ok(Self {
            event_loop: Arc::new(EventLoop::new("ScriptLoader")?),
            scripts: Arc::new(Mutex::new(HashMap::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
            paused: Arc::new(Mutex::new(None)),
        })
    }

    /// Serve `source` for `url`, replacing any previous body.
    pub fn insert(&self, url: Url, source: impl Into<String>) {
        self.scripts.lock_or_recover().insert(url, source.into());
    }

    pub fn remove(&self, url: &Url) -> Option<String> {
        self.scripts.lock_or_recover().remove(url)
    }

    /// Body currently served for `url`.
    pub fn source(&self, url: &Url) -> Option<String> {
        self.scripts.lock_or_recover().get(url).cloned()
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<ScriptRequest> {
        self.requests.lock_or_recover().clone()
    }

    /// Number of requests received for `url`.
    pub fn request_count(&self, url: &Url) -> usize {
        self.requests
            .lock_or_recover()
            .iter()
            .filter(|request| &request.url == url)
            .count()
    }

    pub fn pause(&self) {
        let mut paused = self.paused.lock_or_recover();
        if paused.is_none() {
            *paused = Some(Vec::new());
        }
    }

    /// Answer held requests and stop holding new ones.
    pub fn resume(&self) {
        let held = self.paused.lock_or_recover().take().unwrap_or_default();
        for (request, sink) in held {
            self.answer(request, sink);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.lock_or_recover().is_some()
    }

    fn answer(&self, request: ScriptRequest, sink: ScriptSink) {
        let scripts = self.scripts.clone();
        let posted = self.event_loop.runner().post_task(move |_| {
            if !request.is_allowed() {
                sink.loading_complete(Some(format!(
                    "{} blocked by content security policy",
                    request.url
                )));
                return;
            }
            let body = scripts.lock_or_recover().get(&request.url).cloned();
            match body {
                Some(body) => {
                    trace!(url = %request.url, bytes = body.len(), "Serving script");
                    sink.content_produced(body);
                    sink.loading_complete(None);
                }
                None => sink.loading_complete(Some(format!("{} not found", request.url))),
            }
        });
        if let Err(e) = posted {
            debug!(error = %e, "Script loader stopped");
        }
    }
}

impl ScriptLoader for InMemoryScriptLoader {
    fn load(&self, request: ScriptRequest, sink: ScriptSink) {
        self.requests.lock_or_recover().push(request.clone());
        {
            let mut paused = self.paused.lock_or_recover();
            if let Some(held) = paused.as_mut() {
                held.push((request, sink));
                return;
            }
        }
        self.answer(request, sink);
    }
}

impl fmt::Debug for InMemoryScriptLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryScriptLoader")
            .field("scripts", &self.scripts.lock_or_recover().len())
            .field("requests", &self.requests.lock_or_recover().len())
            .field("paused", &self.is_paused())
            .finish()
    }
}
