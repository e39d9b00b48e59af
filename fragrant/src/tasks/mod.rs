//! FIFO task queue and the single worker that drains it.
//!
//! Request handlers enqueue lifecycle commands and return immediately. One
//! worker executes them strictly in submission order, one at a time, so the
//! external tool is never invoked twice concurrently. On shutdown the worker
//! finishes the in-flight command, if any, and abandons everything still
//! queued.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::vagrant::EnvironmentTool;

/// A deferred invocation of the external tool against one environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub environment_id: String,
    pub args: Vec<String>,
}

impl Task {
    pub fn new<I, S>(environment_id: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            environment_id: environment_id.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// Worker lifecycle.
///
/// `Idle` and `Executing` alternate while running. A shutdown request moves
/// an executing worker to `Draining` until its command returns. `Stopped` and
/// `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Idle,
    Executing,
    Draining,
    Stopped,
    Failed,
}

impl WorkerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Executing => write!(f, "executing"),
            Self::Draining => write!(f, "draining"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Producer side of the queue. Cheap to clone; safe for many producers.
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<Task>,
    depth: Arc<AtomicUsize>,
}

/// Consumer side of the queue, owned by exactly one [`Worker`].
pub struct TaskReceiver {
    rx: mpsc::UnboundedReceiver<Task>,
    depth: Arc<AtomicUsize>,
}

impl TaskQueue {
    pub fn new() -> (Self, TaskReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        (
            Self {
                tx,
                depth: depth.clone(),
            },
            TaskReceiver { rx, depth },
        )
    }

    /// Append `task` to the tail of the queue. Never blocks, never rejects.
    ///
    /// Once the worker has stopped there is nobody left to run the task; it
    /// is dropped with a warning, exactly like tasks abandoned at shutdown.
    pub fn enqueue(&self, task: Task) {
        self.depth.fetch_add(1, Ordering::SeqCst);
        info!(
            environment_id = %task.environment_id,
            args = ?task.args,
            "task queued"
        );
        if let Err(mpsc::error::SendError(task)) = self.tx.send(task) {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            warn!(
                environment_id = %task.environment_id,
                args = ?task.args,
                "worker is not running, task abandoned"
            );
        }
    }

    /// Tasks queued but not yet picked up.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }
}

impl TaskReceiver {
    async fn recv(&mut self) -> Option<Task> {
        let task = self.rx.recv().await?;
        self.depth.fetch_sub(1, Ordering::SeqCst);
        Some(task)
    }
}

/// The single background executor.
pub struct Worker {
    rx: TaskReceiver,
    tool: Arc<dyn EnvironmentTool>,
    env_dir: PathBuf,
    state: watch::Sender<WorkerState>,
    shutdown: watch::Receiver<bool>,
}

/// Owner's handle on a spawned [`Worker`].
///
/// Dropping the handle and every [`ShutdownTrigger`] taken from it also asks
/// the worker to stop after its current task.
pub struct WorkerHandle {
    shutdown: ShutdownTrigger,
    state: watch::Receiver<WorkerState>,
    join: JoinHandle<Result<()>>,
}

/// Requests worker shutdown from anywhere, without owning the [`WorkerHandle`].
#[derive(Clone)]
pub struct ShutdownTrigger(Arc<watch::Sender<bool>>);

impl ShutdownTrigger {
    /// Stop picking up queued tasks. The in-flight one still completes.
    pub fn trigger(&self) {
        self.0.send_replace(true);
    }
}

impl Worker {
    /// Spawn the worker on the tokio runtime. Commands run with the
    /// environment's directory (`env_dir/<id>`) as working directory.
    pub fn spawn(rx: TaskReceiver, tool: Arc<dyn EnvironmentTool>, env_dir: PathBuf) -> WorkerHandle {
        let (state_tx, state_rx) = watch::channel(WorkerState::Idle);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = Worker {
            rx,
            tool,
            env_dir,
            state: state_tx,
            shutdown: shutdown_rx,
        };
        let join = tokio::spawn(worker.run());

        WorkerHandle {
            shutdown: ShutdownTrigger(Arc::new(shutdown_tx)),
            state: state_rx,
            join,
        }
    }

    async fn run(mut self) -> Result<()> {
        info!("task worker started");
        let result = self.drain().await;
        match &result {
            Ok(()) => {
                self.state.send_replace(WorkerState::Stopped);
                info!(abandoned = self.rx.depth.load(Ordering::SeqCst), "task worker stopped");
            }
            Err(e) => {
                self.state.send_replace(WorkerState::Failed);
                error!(error = %format!("{:#}", e), "task worker failed, queue is no longer draining");
            }
        }
        result
    }

    async fn drain(&mut self) -> Result<()> {
        loop {
            if *self.shutdown.borrow() {
                return Ok(());
            }
            self.state.send_replace(WorkerState::Idle);

            let task = tokio::select! {
                biased;
                _ = shutdown_requested(&mut self.shutdown) => return Ok(()),
                task = self.rx.recv() => match task {
                    Some(task) => task,
                    None => {
                        info!("task queue closed");
                        return Ok(());
                    }
                },
            };

            self.execute(task).await?;
        }
    }

    async fn execute(&mut self, task: Task) -> Result<()> {
        self.state.send_replace(WorkerState::Executing);
        let dir = self.env_dir.join(&task.environment_id);
        info!(
            environment_id = %task.environment_id,
            args = ?task.args,
            "executing task"
        );
        let started = Instant::now();

        // The in-flight command is never interrupted; a shutdown request
        // only marks the worker as draining. It runs on its own task so a
        // panicking tool surfaces here as an error.
        let tool = Arc::clone(&self.tool);
        let args = task.args.clone();
        let mut run = tokio::spawn(async move { tool.run(&dir, &args).await });
        let mut draining = false;
        let result = loop {
            tokio::select! {
                joined = &mut run => break match joined {
                    Ok(result) => result,
                    Err(e) => Err(anyhow::anyhow!("tool invocation panicked: {}", e)),
                },
                _ = shutdown_requested(&mut self.shutdown), if !draining => {
                    draining = true;
                    self.state.send_replace(WorkerState::Draining);
                    info!(
                        environment_id = %task.environment_id,
                        "shutdown requested, waiting for in-flight task"
                    );
                }
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(()) => {
                info!(environment_id = %task.environment_id, elapsed_ms, "task complete");
                Ok(())
            }
            Err(e) => Err(e.context(format!(
                "task {:?} for environment {} failed after {}ms",
                task.args, task.environment_id, elapsed_ms
            ))),
        }
    }
}

/// Resolves once shutdown has been requested or the handle is gone.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

impl WorkerHandle {
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// A receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<WorkerState> {
        self.state.clone()
    }

    /// Ask the worker to stop after its current task, without waiting.
    pub fn request_shutdown(&self) {
        self.shutdown.trigger();
    }

    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        self.shutdown.clone()
    }

    /// Request shutdown and wait for the worker to finish its in-flight task.
    ///
    /// Returns the worker's failure if it died before shutdown.
    pub async fn shutdown(self) -> Result<()> {
        self.request_shutdown();
        info!("waiting for any running task to complete");
        match self.join.await {
            Ok(result) => result,
            Err(e) => Err(anyhow::anyhow!("task worker panicked: {}", e)),
        }
    }
}
