use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::{EnvironmentStatus, EnvironmentTool, MachineState};

/// Drives environments through the `vagrant` binary.
#[derive(Debug, Clone)]
pub struct VagrantCli {
    binary: PathBuf,
}

impl VagrantCli {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }
}

#[async_trait]
impl EnvironmentTool for VagrantCli {
    async fn run(&self, env_dir: &Path, args: &[String]) -> Result<()> {
        info!(dir = %env_dir.display(), args = ?args, "running vagrant");

        let output = Command::new(&self.binary)
            .args(args)
            .current_dir(env_dir)
            .output()
            .await
            .with_context(|| format!("failed to execute {}", self.binary.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "vagrant {} failed ({}): {}",
                args.first().map(String::as_str).unwrap_or(""),
                output.status,
                stderr.trim()
            );
        }
        Ok(())
    }

    async fn status(&self, env_dir: &Path) -> Result<EnvironmentStatus> {
        debug!(dir = %env_dir.display(), "querying vagrant status");

        let output = Command::new(&self.binary)
            .args(["status", "--machine-readable"])
            .current_dir(env_dir)
            .output()
            .await
            .with_context(|| format!("failed to execute {}", self.binary.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("vagrant status failed ({}): {}", output.status, stderr.trim());
        }

        Ok(parse_machine_readable_status(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Extract `state` records from `vagrant status --machine-readable` output.
///
/// Each line is `timestamp,target,type,data...`; only lines of type `state`
/// with a non-empty target describe a machine.
pub(crate) fn parse_machine_readable_status(stdout: &str) -> EnvironmentStatus {
    let mut status = EnvironmentStatus::new();
    for line in stdout.lines() {
        let mut fields = line.splitn(4, ',');
        let (Some(_ts), Some(target), Some(kind), Some(data)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if kind == "state" && !target.is_empty() {
            status.insert(target.to_string(), MachineState::parse(data));
        }
    }
    status
}

/// List VirtualBox VMs (`VBoxManage list vms` or `list runningvms`).
pub async fn list_vms(vboxmanage: &Path, running_only: bool) -> Result<Vec<String>> {
    let what = if running_only { "runningvms" } else { "vms" };
    let output = Command::new(vboxmanage)
        .args(["list", what])
        .output()
        .await
        .with_context(|| format!("failed to execute {}", vboxmanage.display()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("VBoxManage list {} failed: {}", what, stderr.trim());
    }

    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}
