use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::Deployment;

pub const MONITORING_AGENT_DEFAULT_VERSION: &str = "6.4.0.433-1";
pub const BACKUP_AGENT_DEFAULT_VERSION: &str = "6.6.0.959-1";

/// An entry of `monitoringVersions` or `backupVersions`: which agent runs on which host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentVersion {
    pub hostname: String,

    #[serde(default)]
    pub name: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AgentVersion {
    fn new(hostname: &str, name: &str) -> Self {
        Self {
            hostname: hostname.to_owned(),
            name: name.to_owned(),
            extra: Map::new(),
        }
    }
}

impl Deployment {
    /// Makes sure every process host runs a monitoring and a backup agent.
    pub fn add_monitoring_and_backup(&mut self) {
        let hostnames: Vec<String> = self
            .processes
            .iter()
            .map(|process| process.hostname.clone())
            .collect();

        for hostname in &hostnames {
            if !self
                .monitoring_versions
                .iter()
                .any(|agent| &agent.hostname == hostname)
            {
                self.monitoring_versions.push(AgentVersion::new(
                    hostname,
                    MONITORING_AGENT_DEFAULT_VERSION,
                ));
            }
            if !self
                .backup_versions
                .iter()
                .any(|agent| &agent.hostname == hostname)
            {
                self.backup_versions
                    .push(AgentVersion::new(hostname, BACKUP_AGENT_DEFAULT_VERSION));
            }
        }
    }

    /// Removes the monitoring and backup agents running on the hosts of the named processes.
    pub fn remove_monitoring_and_backup(&mut self, process_names: &[String]) {
        let hostnames: Vec<&str> = self
            .processes
            .iter()
            .filter(|process| process_names.contains(&process.name))
            .map(|process| process.hostname.as_str())
            .collect();
        if hostnames.is_empty() {
            return;
        }

        let before = (self.monitoring_versions.len(), self.backup_versions.len());
        self.monitoring_versions
            .retain(|agent| !hostnames.contains(&agent.hostname.as_str()));
        self.backup_versions
            .retain(|agent| !hostnames.contains(&agent.hostname.as_str()));

        tracing::debug!(
            ?hostnames,
            monitoring_removed = before.0 - self.monitoring_versions.len(),
            backup_removed = before.1 - self.backup_versions.len(),
            "removed agents of removed processes"
        );
    }
}
