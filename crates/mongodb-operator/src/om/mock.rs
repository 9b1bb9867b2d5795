//! An in-memory Ops Manager project.
//!
//! Besides storing documents, [`MockedOmConnection`] emulates the bits of Ops Manager behavior
//! the merge logic relies on: the deployment revision is bumped on every write, the agents pick
//! their active mechanism from `autoAuthMechanisms`, terminated backups become inactive and the
//! agents can be made to lag behind for a number of status polls.

use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};

use async_trait::async_trait;
use mongodb_shared::retry::RetrySettings;
use serde_json::{Map, Value, json};
use strum::Display;
use tokio::sync::Mutex;

use crate::om::{
    agent_config::AgentKind,
    api::{self, AutomationStatus, OpsManagerApi, ProcessStatus},
    automation_config::{AUTOMATION_AGENT_NAME, KEY_FILE_PATH, KEY_FILE_WINDOWS_PATH},
    backup::{BackupConfig, BackupStatus, HostCluster},
    client::Client,
    deployment::{self, CA_FILE_PATH, Deployment, OPTIONAL_CLIENT_CERTIFICATES},
    lock::{LockRegistry, ProjectKey},
};

pub const MOCKED_AGENT_API_KEY: &str = "mocked-agent-api-key";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Method {
    Get,
    Put,
    Patch,
    Post,
}

/// A request the mock received.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub path: String,
}

#[derive(Debug)]
struct State {
    document: Value,
    deployment_history: Vec<Value>,
    agent_configs: HashMap<AgentKind, Map<String, Value>>,
    backup_configs: BTreeMap<String, BackupConfig>,
    host_clusters: BTreeMap<String, HostCluster>,
    agents_delay_count: usize,
    requests: Vec<Request>,
}

#[derive(Debug)]
pub struct MockedOmConnection {
    project_id: String,
    state: Mutex<State>,
}

impl MockedOmConnection {
    /// A project without processes and with authentication disabled.
    pub fn new(project_id: impl Into<String>) -> Self {
        let document = json!({
            "version": 1,
            "processes": [],
            "replicaSets": [],
            "sharding": [],
            "monitoringVersions": [],
            "backupVersions": [],
            "auth": {
                "disabled": true,
                "authoritativeSet": true,
                "autoAuthMechanism": "MONGODB-CR",
                "autoUser": AUTOMATION_AGENT_NAME,
                "keyfile": KEY_FILE_PATH,
                "keyfileWindows": KEY_FILE_WINDOWS_PATH,
            },
            "ssl": {
                "clientCertificateMode": OPTIONAL_CLIENT_CERTIFICATES,
                "CAFilePath": CA_FILE_PATH,
            },
        });

        Self {
            project_id: project_id.into(),
            state: Mutex::new(State {
                document,
                deployment_history: Vec::new(),
                agent_configs: HashMap::new(),
                backup_configs: BTreeMap::new(),
                host_clusters: BTreeMap::new(),
                agents_delay_count: 0,
                requests: Vec::new(),
            }),
        }
    }

    /// Wraps the mock into a client that retries goal state checks without pausing.
    pub fn into_client(self, project: ProjectKey) -> Client<Self> {
        Client::new(
            self,
            project,
            LockRegistry::default(),
            RetrySettings::new(RetrySettings::default().attempts, Duration::ZERO),
        )
    }

    /// Replaces the stored deployment without recording a request.
    pub async fn set_deployment(&self, deployment: &Deployment) -> Result<(), deployment::Error> {
        self.state.lock().await.document = deployment.to_value()?;
        Ok(())
    }

    pub async fn deployment(&self) -> Result<Deployment, deployment::Error> {
        Deployment::from_value(self.state.lock().await.document.clone())
    }

    /// Every deployment written so far, oldest first.
    pub async fn deployment_history(&self) -> Vec<Value> {
        self.state.lock().await.deployment_history.clone()
    }

    /// The next `count` status polls report all processes as not in goal state.
    pub async fn set_agents_delay_count(&self, count: usize) {
        self.state.lock().await.agents_delay_count = count;
    }

    pub async fn add_backup_config(&self, config: BackupConfig, cluster: HostCluster) {
        let mut state = self.state.lock().await;
        state
            .host_clusters
            .insert(config.cluster_id.clone(), cluster);
        state
            .backup_configs
            .insert(config.cluster_id.clone(), config);
    }

    pub async fn requests(&self) -> Vec<Request> {
        self.state.lock().await.requests.clone()
    }

    /// How many requests with `method` were sent to `path`.
    pub async fn count_requests(&self, method: Method, path: &str) -> usize {
        self.state
            .lock()
            .await
            .requests
            .iter()
            .filter(|request| request.method == method && request.path == path)
            .count()
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }
}

impl State {
    fn record(&mut self, method: Method, path: String) {
        self.requests.push(Request { method, path });
    }

    fn process_names(&self) -> Vec<String> {
        self.document
            .get("processes")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|process| process.get("name").and_then(Value::as_str))
            .map(ToOwned::to_owned)
            .collect()
    }
}

/// The agents settle on one of the mechanisms they were allowed to use.
fn emulate_auto_auth_mechanism(document: &mut Value) {
    let Some(auth) = document.get_mut("auth").and_then(Value::as_object_mut) else {
        return;
    };
    let allowed: Vec<&str> = auth
        .get("autoAuthMechanisms")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .collect();

    let active: Option<&'static str> = ["SCRAM-SHA-256", "MONGODB-CR", "MONGODB-X509", "PLAIN"]
        .into_iter()
        .find(|mechanism| allowed.contains(mechanism));
    if let Some(active) = active {
        auth.insert("autoAuthMechanism".to_owned(), json!(active));
    }
}

#[async_trait]
impl OpsManagerApi for MockedOmConnection {
    async fn read_automation_config(&self) -> api::Result<Value> {
        let mut state = self.state.lock().await;
        state.record(Method::Get, api::automation_config_path(&self.project_id));
        Ok(state.document.clone())
    }

    async fn update_automation_config(&self, mut document: Value) -> api::Result<()> {
        let mut state = self.state.lock().await;
        state.record(Method::Put, api::automation_config_path(&self.project_id));

        let version = state
            .document
            .get("version")
            .and_then(Value::as_i64)
            .unwrap_or_default();
        if let Some(document) = document.as_object_mut() {
            document.insert("version".to_owned(), json!(version + 1));
        }
        emulate_auto_auth_mechanism(&mut document);

        state.deployment_history.push(document.clone());
        state.document = document;
        Ok(())
    }

    async fn read_automation_status(&self) -> api::Result<AutomationStatus> {
        let mut state = self.state.lock().await;
        state.record(Method::Get, api::automation_status_path(&self.project_id));

        let goal_version = state
            .document
            .get("version")
            .and_then(Value::as_i64)
            .unwrap_or_default();
        let achieved = if state.agents_delay_count > 0 {
            state.agents_delay_count -= 1;
            goal_version - 1
        } else {
            goal_version
        };

        let processes = state
            .process_names()
            .into_iter()
            .map(|name| ProcessStatus {
                hostname: format!("{name}.example.com"),
                name,
                last_goal_version_achieved: achieved,
                plan: Vec::new(),
            })
            .collect();
        Ok(AutomationStatus {
            goal_version,
            processes,
        })
    }

    async fn read_agent_config(&self, kind: AgentKind) -> api::Result<Map<String, Value>> {
        let mut state = self.state.lock().await;
        state.record(Method::Get, api::agent_config_path(&self.project_id, kind));
        Ok(state.agent_configs.get(&kind).cloned().unwrap_or_default())
    }

    async fn update_agent_config(
        &self,
        kind: AgentKind,
        document: Map<String, Value>,
    ) -> api::Result<()> {
        let mut state = self.state.lock().await;
        state.record(Method::Put, api::agent_config_path(&self.project_id, kind));
        state.agent_configs.insert(kind, document);
        Ok(())
    }

    async fn read_backup_configs(&self) -> api::Result<Vec<BackupConfig>> {
        let mut state = self.state.lock().await;
        state.record(Method::Get, api::backup_configs_path(&self.project_id));
        Ok(state.backup_configs.values().cloned().collect())
    }

    async fn read_backup_config(&self, cluster_id: &str) -> api::Result<BackupConfig> {
        let mut state = self.state.lock().await;
        let path = api::backup_config_path(&self.project_id, cluster_id);
        state.record(Method::Get, path.clone());
        state
            .backup_configs
            .get(cluster_id)
            .cloned()
            .ok_or(api::Error::NotFound { path })
    }

    async fn update_backup_config(
        &self,
        cluster_id: &str,
        status: BackupStatus,
    ) -> api::Result<()> {
        let mut state = self.state.lock().await;
        let path = api::backup_config_path(&self.project_id, cluster_id);
        state.record(Method::Patch, path.clone());

        let config = state
            .backup_configs
            .get_mut(cluster_id)
            .ok_or(api::Error::NotFound { path })?;
        config.status = match status {
            BackupStatus::Terminating => BackupStatus::Inactive,
            status => status,
        };
        Ok(())
    }

    async fn read_host_cluster(&self, cluster_id: &str) -> api::Result<HostCluster> {
        let mut state = self.state.lock().await;
        let path = api::host_cluster_path(&self.project_id, cluster_id);
        state.record(Method::Get, path.clone());
        state
            .host_clusters
            .get(cluster_id)
            .cloned()
            .ok_or(api::Error::NotFound { path })
    }

    async fn generate_agent_key(&self) -> api::Result<String> {
        let mut state = self.state.lock().await;
        state.record(Method::Post, api::agent_api_keys_path(&self.project_id));
        Ok(MOCKED_AGENT_API_KEY.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_backup_config_is_not_found() {
        let om = MockedOmConnection::new("5f3a");

        let expected_path = api::backup_config_path("5f3a", "c1");
        assert!(matches!(
            om.read_backup_config("c1").await,
            Err(api::Error::NotFound { ref path }) if *path == expected_path
        ));
        assert!(matches!(
            om.update_backup_config("c1", BackupStatus::Stopped).await,
            Err(api::Error::NotFound { .. })
        ));
        assert!(matches!(
            om.read_host_cluster("c1").await,
            Err(api::Error::NotFound { .. })
        ));
        assert_eq!(om.requests().await.len(), 3);
    }
}
