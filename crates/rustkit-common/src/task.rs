//! Single-threaded task sequences.
//!
//! An [`EventLoop`] owns a dedicated thread and a piece of state `S`. Work is
//! posted to it through cloneable [`TaskRunner`] handles, either
//! fire-and-forget ([`TaskRunner::post_task`]) or post-and-wait
//! ([`TaskRunner::post_blocking_task`]). Tasks run strictly in posting order
//! and are the only code that touches `S`.
//!
//! ```text
//! client thread ──post_task──▶ ┌──────────────┐
//! client thread ──post_task──▶ │ channel (FIFO)│──▶ loop thread: task(&mut S)
//! engine thread ──blocking───▶ └──────────────┘
//! ```

use crossbeam_channel::{Receiver, Sender};
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{error, trace};

use crate::{Result, RustKitError};

/// A unit of work run against a sequence's state.
pub type Task<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

enum Message<S> {
    Run(Task<S>),
    Quit,
}

/// Handle for posting tasks to an [`EventLoop`].
pub struct TaskRunner<S: 'static = ()> {
    name: Arc<str>,
    sender: Sender<Message<S>>,
    thread_id: Arc<OnceLock<ThreadId>>,
}

impl<S: 'static> Clone for TaskRunner<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            sender: self.sender.clone(),
            thread_id: self.thread_id.clone(),
        }
    }
}

impl<S: 'static> fmt::Debug for TaskRunner<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRunner")
            .field("name", &self.name)
            .field("thread_id", &self.thread_id.get())
            .finish_non_exhaustive()
    }
}

impl<S: 'static> TaskRunner<S> {
    /// Name of the sequence (also its thread name).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Post a task without waiting for it to run.
    ///
    /// Fails with [`RustKitError::Cancelled`] once the loop has shut down.
    pub fn post_task<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.sender
            .send(Message::Run(Box::new(task)))
            .map_err(|_| RustKitError::Cancelled)
    }

    /// Post a task and block until it has run, returning its result.
    ///
    /// Calling this from the loop's own thread would deadlock, so it is
    /// reported as an internal error instead.
    pub fn post_blocking_task<F, R>(&self, task: F) -> Result<R>
    where
        F: FnOnce(&mut S) -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.runs_tasks_on_current_thread() {
            return Err(RustKitError::internal(format!(
                "blocking post to '{}' from its own thread",
                self.name
            )));
        }
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.post_task(move |state| {
            let _ = tx.send(task(state));
        })?;
        rx.recv().map_err(|_| RustKitError::Cancelled)
    }

    /// Whether the calling thread is this sequence's thread.
    pub fn runs_tasks_on_current_thread(&self) -> bool {
        self.thread_id.get() == Some(&thread::current().id())
    }
}

/// Owner of a sequence thread. Dropping it stops the loop and joins the thread.
pub struct EventLoop<S: 'static = ()> {
    runner: TaskRunner<S>,
    handle: Option<JoinHandle<()>>,
}

impl<S: 'static> fmt::Debug for EventLoop<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("runner", &self.runner)
            .finish_non_exhaustive()
    }
}

impl<S: 'static> EventLoop<S> {
    /// Spawn a named sequence whose state is built on the new thread by `init`.
    pub fn spawn<F>(name: impl Into<String>, init: F) -> Result<Self>
    where
        F: FnOnce(&TaskRunner<S>) -> S + Send + 'static,
    {
        let name = name.into();
        let (sender, receiver) = crossbeam_channel::unbounded();
        let runner = TaskRunner {
            name: Arc::from(name.as_str()),
            sender,
            thread_id: Arc::new(OnceLock::new()),
        };

        let thread_runner = runner.clone();
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || run_loop(thread_runner, receiver, init))?;
        let _ = runner.thread_id.set(handle.thread().id());

        Ok(Self {
            runner,
            handle: Some(handle),
        })
    }

    /// Spawn a sequence with default state.
    pub fn new(name: impl Into<String>) -> Result<Self>
    where
        S: Default,
    {
        Self::spawn(name, |_| S::default())
    }

    pub fn runner(&self) -> TaskRunner<S> {
        self.runner.clone()
    }

    pub fn name(&self) -> &str {
        self.runner.name()
    }

    /// Block until every task posted before this call has run.
    pub fn flush(&self) -> Result<()> {
        self.runner.post_blocking_task(|_| ())
    }

    /// Ask the loop to stop after its queued tasks, without joining the thread.
    pub fn detach(mut self) {
        let _ = self.runner.sender.send(Message::Quit);
        self.handle.take();
    }
}

impl<S: 'static> Drop for EventLoop<S> {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let _ = self.runner.sender.send(Message::Quit);
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            error!(sequence = %self.runner.name, "Event loop thread panicked");
        }
    }
}

fn run_loop<S, F>(runner: TaskRunner<S>, receiver: Receiver<Message<S>>, init: F)
where
    F: FnOnce(&TaskRunner<S>) -> S,
{
    let _ = runner.thread_id.set(thread::current().id());
    let mut state = init(&runner);
    trace!(sequence = %runner.name, "Event loop started");
    drop(runner);

    for message in receiver.iter() {
        match message {
            Message::Run(task) => task(&mut state),
            Message::Quit => break,
        }
    }
    trace!("Event loop stopped");
}
