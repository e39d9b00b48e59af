//! The external environment-management tool, seen only through its contract:
//! run a command in an environment directory, or report per-machine state.

pub mod cli;
pub mod vagrantfile;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Serialize, Serializer};

pub use cli::{list_vms, VagrantCli};
pub use vagrantfile::VagrantfileGenerator;

/// Machine states reported by `vagrant status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineState {
    NotCreated,
    Running,
    Poweroff,
    Saved,
    Aborted,
    Other(String),
}

impl MachineState {
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "not_created" => Self::NotCreated,
            "running" => Self::Running,
            "poweroff" => Self::Poweroff,
            "saved" => Self::Saved,
            "aborted" => Self::Aborted,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::NotCreated => "not_created",
            Self::Running => "running",
            Self::Poweroff => "poweroff",
            Self::Saved => "saved",
            Self::Aborted => "aborted",
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MachineState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Per-machine status of one environment, keyed by machine name.
pub type EnvironmentStatus = BTreeMap<String, MachineState>;

/// Executes lifecycle commands against an environment directory.
///
/// `run` blocks until the command finishes. Only the task worker calls it.
#[async_trait]
pub trait EnvironmentTool: Send + Sync {
    async fn run(&self, env_dir: &Path, args: &[String]) -> Result<()>;

    async fn status(&self, env_dir: &Path) -> Result<EnvironmentStatus>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_state_parse_known() {
        assert_eq!(MachineState::parse("not_created"), MachineState::NotCreated);
        assert_eq!(MachineState::parse("running\n"), MachineState::Running);
        assert_eq!(MachineState::parse("poweroff"), MachineState::Poweroff);
        assert_eq!(MachineState::parse("saved"), MachineState::Saved);
        assert_eq!(MachineState::parse("aborted"), MachineState::Aborted);
    }

    #[test]
    fn machine_state_keeps_unknown_names() {
        let state = MachineState::parse("gurumeditation");
        assert_eq!(state, MachineState::Other("gurumeditation".into()));
        assert_eq!(state.to_string(), "gurumeditation");
    }

    #[test]
    fn machine_state_serializes_as_tool_name() {
        let status = EnvironmentStatus::from([
            ("default".to_string(), MachineState::NotCreated),
            ("db".to_string(), MachineState::Running),
        ]);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json, serde_json::json!({"db": "running", "default": "not_created"}));
    }
}
