//! In-process stand-ins for the external tool, shared by unit tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::Notify;

use crate::vagrant::{EnvironmentStatus, EnvironmentTool, MachineState};

fn env_id(dir: &Path) -> String {
    dir.file_name().unwrap().to_string_lossy().into_owned()
}

async fn wait_until(notify: &Notify, mut done: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let notified = notify.notified();
            if done() {
                return;
            }
            notified.await;
        }
    })
    .await
    .expect("timed out waiting for stub tool");
}

#[derive(Debug, Clone)]
pub(crate) struct Call {
    pub seq: usize,
    pub dir: PathBuf,
    pub args: Vec<String>,
}

/// Records every invocation with a sequence marker; reports a configurable status.
#[derive(Default)]
pub(crate) struct RecordingTool {
    calls: Mutex<Vec<Call>>,
    delay: Option<Duration>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    notify: Notify,
    status: Mutex<EnvironmentStatus>,
    status_queries: AtomicUsize,
}

impl RecordingTool {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn set_status(&self, machine: &str, state: MachineState) {
        self.status.lock().unwrap().insert(machine.to_string(), state);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn status_queries(&self) -> usize {
        self.status_queries.load(Ordering::SeqCst)
    }

    pub async fn wait_for_calls(&self, n: usize) {
        wait_until(&self.notify, || self.calls.lock().unwrap().len() >= n).await;
    }
}

#[async_trait]
impl EnvironmentTool for RecordingTool {
    async fn run(&self, env_dir: &Path, args: &[String]) -> Result<()> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        {
            let mut calls = self.calls.lock().unwrap();
            let seq = calls.len();
            calls.push(Call {
                seq,
                dir: env_dir.to_path_buf(),
                args: args.to_vec(),
            });
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn status(&self, _env_dir: &Path) -> Result<EnvironmentStatus> {
        self.status_queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.status.lock().unwrap().clone())
    }
}

/// Blocks every invocation until [`GatedTool::release`] is called.
#[derive(Default)]
pub(crate) struct GatedTool {
    started: AtomicUsize,
    started_notify: Notify,
    gate: Notify,
    finished: Mutex<Vec<String>>,
}

impl GatedTool {
    pub async fn wait_started(&self) {
        wait_until(&self.started_notify, || self.started.load(Ordering::SeqCst) > 0).await;
    }

    pub fn release(&self) {
        self.gate.notify_one();
    }

    pub fn finished(&self) -> Vec<String> {
        self.finished.lock().unwrap().clone()
    }
}

#[async_trait]
impl EnvironmentTool for GatedTool {
    async fn run(&self, env_dir: &Path, _args: &[String]) -> Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.started_notify.notify_waiters();
        self.gate.notified().await;
        self.finished.lock().unwrap().push(env_id(env_dir));
        Ok(())
    }

    async fn status(&self, _env_dir: &Path) -> Result<EnvironmentStatus> {
        Ok(EnvironmentStatus::new())
    }
}

/// Fails any invocation against one environment id.
pub(crate) struct FailingTool {
    fail_on: String,
    attempted: Mutex<Vec<String>>,
}

impl FailingTool {
    pub fn new(fail_on: &str) -> Self {
        Self {
            fail_on: fail_on.to_string(),
            attempted: Mutex::new(Vec::new()),
        }
    }

    pub fn attempted(&self) -> Vec<String> {
        self.attempted.lock().unwrap().clone()
    }
}

#[async_trait]
impl EnvironmentTool for FailingTool {
    async fn run(&self, env_dir: &Path, _args: &[String]) -> Result<()> {
        let id = env_id(env_dir);
        self.attempted.lock().unwrap().push(id.clone());
        if id == self.fail_on {
            bail!("vagrant exited with status 1");
        }
        Ok(())
    }

    async fn status(&self, _env_dir: &Path) -> Result<EnvironmentStatus> {
        bail!("status unavailable")
    }
}

/// Panics on every invocation.
pub(crate) struct PanickingTool;

#[async_trait]
impl EnvironmentTool for PanickingTool {
    async fn run(&self, env_dir: &Path, _args: &[String]) -> Result<()> {
        panic!("tool crashed in {}", env_dir.display());
    }

    async fn status(&self, _env_dir: &Path) -> Result<EnvironmentStatus> {
        Ok(EnvironmentStatus::new())
    }
}
