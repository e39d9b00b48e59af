pub mod id;

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use anyhow::Context;
use regex::Regex;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::config::EnvironmentsConfig;
use crate::network::{AddressAllocator, AllocError};
use crate::tasks::{Task, TaskQueue};
use crate::vagrant::vagrantfile::VAGRANTFILE;
use crate::vagrant::{EnvironmentStatus, EnvironmentTool, MachineState, VagrantfileGenerator};

pub use id::EnvironmentId;

/// Errors surfaced to whoever asked for an environment operation.
#[derive(Debug, thiserror::Error)]
pub enum EnvironmentError {
    #[error("invalid environment id: {0:?}")]
    InvalidId(String),

    #[error("invalid box name: {0:?}")]
    InvalidBoxName(String),

    #[error("invalid machine name: {0:?}")]
    InvalidMachineName(String),

    #[error("{} already exists", .0.display())]
    AlreadyExists(PathBuf),

    #[error("environment {0} not found")]
    UnknownEnvironment(String),

    #[error("environment {0} contains undestroyed machines")]
    NotClean(String),

    #[error(transparent)]
    Address(#[from] AllocError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn box_name_pattern() -> &'static Regex {
    static BOX_RE: OnceLock<Regex> = OnceLock::new();
    BOX_RE.get_or_init(|| Regex::new(r"^[\w-]+$").expect("invalid box name regex"))
}

fn name_pattern() -> &'static Regex {
    static NAME_RE: OnceLock<Regex> = OnceLock::new();
    NAME_RE.get_or_init(|| Regex::new(r"^\w[\w.-]*$").expect("invalid name regex"))
}

fn validate_box_name(name: &str) -> Result<(), EnvironmentError> {
    if box_name_pattern().is_match(name) {
        Ok(())
    } else {
        Err(EnvironmentError::InvalidBoxName(name.to_string()))
    }
}

fn validate_machine_name(name: Option<&str>) -> Result<(), EnvironmentError> {
    match name {
        Some(n) if !name_pattern().is_match(n) => Err(EnvironmentError::InvalidMachineName(n.to_string())),
        _ => Ok(()),
    }
}

/// Parameters for a provisioned environment.
#[derive(Debug, Default, Clone)]
pub struct CreateParams {
    pub box_name: Option<String>,
    pub box_url: Option<String>,
    pub scripts: Vec<String>,
}

/// Parameters for a bare environment.
#[derive(Debug, Default, Clone)]
pub struct InitParams {
    pub box_name: Option<String>,
    pub box_url: Option<String>,
    /// Use this `Vagrantfile` verbatim instead of running `vagrant init`.
    pub vagrantfile: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedEnvironment {
    pub id: EnvironmentId,
    pub ips: Vec<Ipv4Addr>,
}

/// Sequences address allocation, environment directories, and queued
/// lifecycle commands.
///
/// Address bookkeeping and directory changes happen synchronously on the
/// caller's task. Every mutating tool command is queued for the worker; only
/// read-only status queries reach the tool directly.
///
/// Callers must not destroy an environment while a command for it is still
/// queued; nothing here detects that.
pub struct EnvironmentManager {
    config: EnvironmentsConfig,
    allocator: Arc<AddressAllocator>,
    queue: TaskQueue,
    tool: Arc<dyn EnvironmentTool>,
}

impl EnvironmentManager {
    pub fn new(
        config: EnvironmentsConfig,
        allocator: Arc<AddressAllocator>,
        queue: TaskQueue,
        tool: Arc<dyn EnvironmentTool>,
    ) -> Self {
        Self {
            config,
            allocator,
            queue,
            tool,
        }
    }

    pub fn allocator(&self) -> &AddressAllocator {
        &self.allocator
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    fn dir_for(&self, id: &EnvironmentId) -> PathBuf {
        self.config.env_dir.join(id.as_str())
    }

    /// Generate an id nobody uses yet and create its directory.
    async fn make_environment_dir(&self) -> Result<(EnvironmentId, PathBuf), EnvironmentError> {
        tokio::fs::create_dir_all(&self.config.env_dir)
            .await
            .with_context(|| format!("creating environment root: {}", self.config.env_dir.display()))?;

        for _ in 0..self.config.id_attempts {
            let id = EnvironmentId::generate();
            let dir = self.dir_for(&id);
            if tokio::fs::symlink_metadata(&dir).await.is_ok() {
                warn!(environment_id = %id, "generated id already in use, retrying");
                continue;
            }
            return match tokio::fs::create_dir(&dir).await {
                Ok(()) => Ok((id, dir)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    Err(EnvironmentError::AlreadyExists(dir))
                }
                Err(e) => Err(anyhow::Error::new(e)
                    .context(format!("creating environment directory: {}", dir.display()))
                    .into()),
            };
        }

        Err(anyhow::anyhow!(
            "no unused environment id after {} attempts",
            self.config.id_attempts
        )
        .into())
    }

    /// Best-effort removal of a directory from a half-finished create.
    async fn discard_dir(&self, dir: &Path) {
        if let Err(e) = tokio::fs::remove_dir_all(dir).await {
            warn!(dir = %dir.display(), error = %e, "failed to remove environment directory during rollback");
        }
    }

    /// Create an environment with a dedicated address and queue `up --provision`.
    ///
    /// Returns as soon as the command is queued; the machine boots later.
    #[instrument(skip(self, params), fields(box_name = ?params.box_name))]
    pub async fn create(&self, params: CreateParams) -> Result<CreatedEnvironment, EnvironmentError> {
        let box_name = params
            .box_name
            .unwrap_or_else(|| self.config.default_box_name.clone());
        validate_box_name(&box_name)?;
        let box_url = params
            .box_url
            .unwrap_or_else(|| self.config.default_box_url.clone());

        let (id, dir) = self.make_environment_dir().await?;

        let addr = match self.allocator.claim_address(id.as_str()).await {
            Ok(addr) => addr,
            Err(e) => {
                self.discard_dir(&dir).await;
                return Err(e.into());
            }
        };

        let mut generator = VagrantfileGenerator::new(box_name, box_url).address(addr);
        let added = params
            .scripts
            .into_iter()
            .try_for_each(|script| generator.add_script(script));
        let written = match added {
            Ok(()) => generator.write(&dir).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            if let Err(e2) = self.allocator.release_addresses(id.as_str()).await {
                warn!(environment_id = %id, error = %e2, "failed to release address during rollback");
            }
            self.discard_dir(&dir).await;
            return Err(e.context("failed to write Vagrantfile").into());
        }

        self.queue.enqueue(Task::new(id.as_str(), ["up", "--provision"]));

        info!(environment_id = %id, ip = %addr, "environment created, provisioning queued");
        Ok(CreatedEnvironment { id, ips: vec![addr] })
    }

    /// Create an environment without an address.
    ///
    /// With caller-supplied contents the `Vagrantfile` is written directly;
    /// otherwise `vagrant init <box> <url>` is queued.
    #[instrument(skip(self, params))]
    pub async fn init(&self, params: InitParams) -> Result<EnvironmentId, EnvironmentError> {
        let box_name = params
            .box_name
            .unwrap_or_else(|| self.config.default_box_name.clone());
        validate_box_name(&box_name)?;
        let box_url = params
            .box_url
            .unwrap_or_else(|| self.config.default_box_url.clone());

        let (id, dir) = self.make_environment_dir().await?;

        match params.vagrantfile {
            Some(contents) => {
                if let Err(e) = VagrantfileGenerator::with_contents(contents).write(&dir).await {
                    self.discard_dir(&dir).await;
                    return Err(e.into());
                }
                info!(environment_id = %id, "environment initialized from supplied Vagrantfile");
            }
            None => {
                self.queue
                    .enqueue(Task::new(id.as_str(), ["init".to_string(), box_name, box_url]));
                info!(environment_id = %id, "environment created, init queued");
            }
        }
        Ok(id)
    }

    /// Ids of every environment directory holding a `Vagrantfile`, sorted.
    pub async fn list(&self) -> Result<Vec<EnvironmentId>, EnvironmentError> {
        let mut entries = match tokio::fs::read_dir(&self.config.env_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("reading {}", self.config.env_dir.display()))
                    .into())
            }
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await.context("reading environment directory entry")? {
            let name = entry.file_name();
            let Ok(id) = EnvironmentId::parse(&name.to_string_lossy()) else {
                continue;
            };
            if tokio::fs::metadata(entry.path().join(VAGRANTFILE)).await.is_ok() {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Validate `id` and confirm its directory holds a `Vagrantfile`.
    async fn existing(&self, id: &str) -> Result<(EnvironmentId, PathBuf), EnvironmentError> {
        let id = EnvironmentId::parse(id)?;
        let dir = self.dir_for(&id);
        match tokio::fs::metadata(dir.join(VAGRANTFILE)).await {
            Ok(meta) if meta.is_file() => Ok((id, dir)),
            _ => Err(EnvironmentError::UnknownEnvironment(id.to_string())),
        }
    }

    async fn submit(
        &self,
        id: &str,
        verb: &str,
        vm_name: Option<&str>,
        flag: Option<&str>,
    ) -> Result<EnvironmentId, EnvironmentError> {
        validate_machine_name(vm_name)?;
        let (id, _) = self.existing(id).await?;
        let args = std::iter::once(verb)
            .chain(vm_name)
            .chain(flag)
            .map(String::from);
        self.queue.enqueue(Task::new(id.as_str(), args));
        Ok(id)
    }

    fn provision_flag(no_provision: bool) -> &'static str {
        if no_provision {
            "--no-provision"
        } else {
            "--provision"
        }
    }

    pub async fn up(&self, id: &str, vm_name: Option<&str>, no_provision: bool) -> Result<EnvironmentId, EnvironmentError> {
        self.submit(id, "up", vm_name, Some(Self::provision_flag(no_provision))).await
    }

    pub async fn halt(&self, id: &str, vm_name: Option<&str>, force: bool) -> Result<EnvironmentId, EnvironmentError> {
        self.submit(id, "halt", vm_name, force.then_some("--force")).await
    }

    pub async fn suspend(&self, id: &str, vm_name: Option<&str>) -> Result<EnvironmentId, EnvironmentError> {
        self.submit(id, "suspend", vm_name, None).await
    }

    pub async fn resume(&self, id: &str, vm_name: Option<&str>) -> Result<EnvironmentId, EnvironmentError> {
        self.submit(id, "resume", vm_name, None).await
    }

    pub async fn provision(&self, id: &str, vm_name: Option<&str>) -> Result<EnvironmentId, EnvironmentError> {
        self.submit(id, "provision", vm_name, None).await
    }

    pub async fn reload(&self, id: &str, vm_name: Option<&str>, no_provision: bool) -> Result<EnvironmentId, EnvironmentError> {
        self.submit(id, "reload", vm_name, Some(Self::provision_flag(no_provision))).await
    }

    /// Queue `vagrant destroy --force` for the environment's machines.
    pub async fn destroy_machines(&self, id: &str, vm_name: Option<&str>) -> Result<EnvironmentId, EnvironmentError> {
        self.submit(id, "destroy", vm_name, Some("--force")).await
    }

    /// Per-machine state as reported by the tool.
    pub async fn status(&self, id: &str) -> Result<EnvironmentStatus, EnvironmentError> {
        let (_, dir) = self.existing(id).await?;
        Ok(self.tool.status(&dir).await?)
    }

    pub async fn addresses(&self, id: &str) -> Result<Option<Ipv4Addr>, EnvironmentError> {
        let id = EnvironmentId::parse(id)?;
        Ok(self.allocator.address_of(id.as_str()).await?)
    }

    /// Remove an environment whose machines have all been destroyed, and
    /// return its address to the pool.
    ///
    /// The tool is asked first; if any machine exists in any state the
    /// environment is left untouched. A directory without a `Vagrantfile`
    /// (an `init` whose queued command never ran) has no machines and is
    /// removed without asking.
    #[instrument(skip(self))]
    pub async fn destroy_environment(&self, id: &str) -> Result<(), EnvironmentError> {
        let id = EnvironmentId::parse(id)?;
        let dir = self.dir_for(&id);

        if tokio::fs::metadata(dir.join(VAGRANTFILE)).await.is_ok() {
            let status = self
                .tool
                .status(&dir)
                .await
                .context("failed to query machine states")?;
            if let Some((machine, state)) = status.iter().find(|(_, s)| **s != MachineState::NotCreated) {
                warn!(
                    environment_id = %id,
                    machine = %machine,
                    state = %state,
                    "refusing to remove environment with live machines"
                );
                return Err(EnvironmentError::NotClean(id.to_string()));
            }
        } else if tokio::fs::metadata(&dir).await.is_ok_and(|m| m.is_dir()) {
            warn!(environment_id = %id, "environment has no Vagrantfile, removing without status check");
        } else {
            return Err(EnvironmentError::UnknownEnvironment(id.to_string()));
        }

        tokio::fs::remove_dir_all(&dir)
            .await
            .with_context(|| format!("removing environment directory: {}", dir.display()))?;

        if self.allocator.address_of(id.as_str()).await?.is_some() {
            self.allocator.release_addresses(id.as_str()).await?;
        }

        info!(environment_id = %id, "environment removed");
        Ok(())
    }
}
