//! Single render worker backed by a dedicated thread.
//!
//! The worker thread creates and exclusively owns the browser session (an
//! [`Engine`]); nothing else ever touches it. Async callers hand it work
//! through a bounded queue and receive exactly one outcome per task on a
//! oneshot channel. When the queue is full, [`RenderWorker::submit`] suspends
//! the caller until the worker drains a slot.

use log::{debug, info, warn};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use url::Url;

use crate::cache::RequestKey;
use crate::route::Route;
use crate::{Engine, Error, Result};

/// Default time budget for a single render task.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of tasks that may wait in the queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

/// What the worker extracts from a rendered page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedFragment {
    pub title: String,
    pub inner_html: String,
}

/// Terminal outcome of a render task.
pub type RenderOutcome = Result<RenderedFragment>;

/// A single-use unit of work for the render worker.
#[derive(Debug)]
pub struct RenderTask {
    pub key: RequestKey,
    /// URL the browser navigates to.
    pub target: Url,
    pub route: Arc<Route>,
    result: oneshot::Sender<RenderOutcome>,
}

impl RenderTask {
    /// Creates a task and the receiver its outcome will arrive on.
    pub fn new(
        key: RequestKey,
        target: Url,
        route: Arc<Route>,
    ) -> (Self, oneshot::Receiver<RenderOutcome>) {
        let (result, outcome) = oneshot::channel();
        (
            Self {
                key,
                target,
                route,
                result,
            },
            outcome,
        )
    }

    fn resolve(self, outcome: RenderOutcome) {
        // the submitter may have stopped waiting; nothing to do then
        let _ = self.result.send(outcome);
    }
}

/// Tunables for the worker.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Budget for navigate + wait + extract of one task.
    pub task_timeout: Duration,
    /// Bounded queue size; submissions beyond it suspend.
    pub queue_capacity: usize,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            task_timeout: DEFAULT_TASK_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Handle to the worker thread and its task queue.
#[derive(Debug)]
pub struct RenderWorker {
    queue: Option<mpsc::Sender<RenderTask>>,
    thread: Option<JoinHandle<()>>,
    options: WorkerOptions,
}

impl RenderWorker {
    /// Spawns the worker thread and builds the engine on it.
    ///
    /// `factory` runs on the worker thread, so the engine itself does not
    /// need to be `Send`. Returns once the engine is up, or with the error
    /// the factory produced.
    pub async fn spawn<E, F>(factory: F, options: WorkerOptions) -> Result<Self>
    where
        E: Engine + 'static,
        F: FnOnce() -> Result<E> + Send + 'static,
    {
        let (queue_tx, queue_rx) = mpsc::channel::<RenderTask>(options.queue_capacity.max(1));
        let (init_tx, init_rx) = oneshot::channel::<Result<()>>();
        let task_timeout = options.task_timeout;

        let thread = thread::Builder::new()
            .name("render-worker".to_string())
            .spawn(move || {
                let mut engine = match factory() {
                    Ok(engine) => engine,
                    Err(err) => {
                        let _ = init_tx.send(Err(err));
                        return;
                    }
                };
                let _ = init_tx.send(Ok(()));

                drain_queue(&mut engine, queue_rx, task_timeout);

                if let Err(err) = engine.close() {
                    warn!("Failed to close render engine: {}", err);
                }
                info!("Render worker stopped");
            })
            .map_err(|e| {
                Error::InitializationError(format!("Failed to spawn render worker: {}", e))
            })?;

        init_rx
            .await
            .map_err(|e| Error::InitializationError(format!("Worker init canceled: {}", e)))??;

        Ok(Self {
            queue: Some(queue_tx),
            thread: Some(thread),
            options,
        })
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    /// Enqueues `task`, suspending while the queue is at capacity.
    pub async fn submit(&self, task: RenderTask) -> Result<()> {
        let queue = self.queue.as_ref().ok_or(Error::WorkerClosed)?;
        queue.send(task).await.map_err(|_| Error::WorkerClosed)
    }

    /// Closes the queue and waits for the worker to finish queued tasks and
    /// release the browser session.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.queue.take();
        if let Some(thread) = self.thread.take() {
            tokio::task::spawn_blocking(move || thread.join())
                .await
                .map_err(|e| Error::Other(format!("Failed to join render worker: {}", e)))?
                .map_err(|_| Error::Other("Render worker panicked".to_string()))?;
        }
        Ok(())
    }
}

fn drain_queue<E: Engine>(
    engine: &mut E,
    mut queue: mpsc::Receiver<RenderTask>,
    task_timeout: Duration,
) {
    while let Some(task) = queue.blocking_recv() {
        let started = Instant::now();
        let outcome = execute(engine, &task, task_timeout);
        match &outcome {
            Ok(_) => debug!("Rendered {} in {:?}", task.key, started.elapsed()),
            Err(err) => warn!("Render of {} failed: {}", task.key, err),
        }
        task.resolve(outcome);
    }
}

/// Runs the navigate / wait-visible / extract protocol for one task.
fn execute<E: Engine>(engine: &mut E, task: &RenderTask, budget: Duration) -> RenderOutcome {
    let selector = task.route.body_selector.as_str();
    let deadline = Instant::now() + budget;

    engine.load_url(task.target.as_str(), remaining(deadline, budget)?)?;
    engine.wait_visible(selector, remaining(deadline, budget)?)?;
    let title = engine.title()?;
    let inner_html = engine.inner_html(selector)?;
    remaining(deadline, budget)?;

    Ok(RenderedFragment { title, inner_html })
}

fn remaining(deadline: Instant, budget: Duration) -> Result<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .filter(|left| !left.is_zero())
        .ok_or_else(|| Error::timeout(budget))
}
