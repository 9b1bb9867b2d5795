//! The Ops Manager public API, as far as this crate talks to it.
//!
//! [`OpsManagerApi`] is the seam between the merge logic and the network. Implementations are
//! expected to be cheap to share between tasks, e.g. by wrapping a connection pool.
//! [`crate::om::mock::MockedOmConnection`] implements it in memory.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use snafu::Snafu;

use crate::om::{
    agent_config::AgentKind,
    backup::{BackupConfig, BackupStatus, HostCluster},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{path} does not exist"))]
    NotFound { path: String },

    #[snafu(display("Ops Manager rejected the request to {path}: {message}"))]
    Rejected { path: String, message: String },

    #[snafu(display("failed to decode the response of {path}"))]
    Decode {
        source: serde_json::Error,
        path: String,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub fn automation_config_path(project_id: &str) -> String {
    format!("/api/public/v1.0/groups/{project_id}/automationConfig")
}

pub fn automation_status_path(project_id: &str) -> String {
    format!("/api/public/v1.0/groups/{project_id}/automationStatus")
}

pub fn agent_config_path(project_id: &str, kind: AgentKind) -> String {
    format!(
        "/api/public/v1.0/groups/{project_id}/automationConfig/{}",
        kind.path_segment()
    )
}

pub fn backup_configs_path(project_id: &str) -> String {
    format!("/api/public/v1.0/groups/{project_id}/backupConfigs")
}

pub fn backup_config_path(project_id: &str, cluster_id: &str) -> String {
    format!("/api/public/v1.0/groups/{project_id}/backupConfigs/{cluster_id}")
}

pub fn host_cluster_path(project_id: &str, cluster_id: &str) -> String {
    format!("/api/public/v1.0/groups/{project_id}/clusters/{cluster_id}")
}

pub fn agent_api_keys_path(project_id: &str) -> String {
    format!("/api/public/v1.0/groups/{project_id}/agentapikeys")
}

/// Requests against a single Ops Manager project.
///
/// Documents are exchanged untyped, decoding them is up to the caller so that fields unknown to
/// this crate survive the round trip.
#[async_trait]
pub trait OpsManagerApi: Send + Sync {
    async fn read_automation_config(&self) -> Result<Value>;

    async fn update_automation_config(&self, document: Value) -> Result<()>;

    async fn read_automation_status(&self) -> Result<AutomationStatus>;

    async fn read_agent_config(&self, kind: AgentKind) -> Result<Map<String, Value>>;

    async fn update_agent_config(
        &self,
        kind: AgentKind,
        document: Map<String, Value>,
    ) -> Result<()>;

    async fn read_backup_configs(&self) -> Result<Vec<BackupConfig>>;

    async fn read_backup_config(&self, cluster_id: &str) -> Result<BackupConfig>;

    /// Requests a status change of the backup configuration of the cluster `cluster_id`.
    async fn update_backup_config(&self, cluster_id: &str, status: BackupStatus) -> Result<()>;

    async fn read_host_cluster(&self, cluster_id: &str) -> Result<HostCluster>;

    /// Creates a new agent API key for the project and returns it.
    async fn generate_agent_key(&self) -> Result<String>;
}

/// Goal state progress of the automation agents.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationStatus {
    /// The revision of the deployment document the agents should reach.
    pub goal_version: i64,

    #[serde(default)]
    pub processes: Vec<ProcessStatus>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStatus {
    pub name: String,

    #[serde(default)]
    pub hostname: String,

    pub last_goal_version_achieved: i64,

    #[serde(default)]
    pub plan: Vec<String>,
}

impl AutomationStatus {
    /// Names of the processes among `relevant` that did not reach the goal version yet. All
    /// processes are relevant if `relevant` is empty.
    ///
    /// Processes the agents don't report (yet) are not waited for.
    pub fn processes_not_in_goal_state(&self, relevant: &[String]) -> Vec<&str> {
        self.processes
            .iter()
            .filter(|process| relevant.is_empty() || relevant.contains(&process.name))
            .filter(|process| process.last_goal_version_achieved != self.goal_version)
            .map(|process| process.name.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    fn status() -> AutomationStatus {
        serde_json::from_value(json!({
            "goalVersion": 5,
            "processes": [
                {"name": "rs-0", "hostname": "rs-0.svc", "lastGoalVersionAchieved": 5, "plan": []},
                {"name": "rs-1", "hostname": "rs-1.svc", "lastGoalVersionAchieved": 4, "plan": ["Download"]},
                {"name": "other-0", "lastGoalVersionAchieved": 3},
            ],
        }))
        .expect("fixture is a valid status")
    }

    #[rstest]
    #[case::all(&[], &["rs-1", "other-0"])]
    #[case::relevant_only(&["rs-0", "rs-1"], &["rs-1"])]
    #[case::reached(&["rs-0"], &[])]
    #[case::unknown_processes_are_ignored(&["rs-0", "rs-7"], &[])]
    fn goal_state(#[case] relevant: &[&str], #[case] expected: &[&str]) {
        let relevant: Vec<String> = relevant.iter().map(ToString::to_string).collect();
        assert_eq!(status().processes_not_in_goal_state(&relevant), expected);
    }

    #[test]
    fn paths() {
        assert_eq!(
            agent_config_path("5f3a", AgentKind::Monitoring),
            "/api/public/v1.0/groups/5f3a/automationConfig/monitoringAgentConfig"
        );
        assert_eq!(
            backup_config_path("5f3a", "c1"),
            "/api/public/v1.0/groups/5f3a/backupConfigs/c1"
        );
    }
}
