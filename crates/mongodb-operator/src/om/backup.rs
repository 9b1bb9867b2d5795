//! Starting, stopping and terminating the backup of a replica set or sharded cluster.
//!
//! Ops Manager creates one backup configuration per replica set once the monitoring agents have
//! discovered the deployment. Their status can only be changed along
//! `INACTIVE -> STARTED <-> STOPPED -> TERMINATING`, so some requested modes take two
//! reconciliations to reach.

use mongodb_shared::retry::{self, Attempt, RetrySettings, do_and_retry};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use snafu::{ResultExt, Snafu};
use strum::Display;

use crate::{
    om::{
        api::{self, OpsManagerApi},
        client::Client,
        deployment::ResourceKind,
    },
    reconcile::{
        ReconcileFunctionAction, ReconcileResult, create_requeuing_reconcile_function_action,
    },
};

const CONFIGS_MISSING_RETRY_SECS: u64 = 10;
const STATUS_PENDING_RETRY_SECS: u64 = 1;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read the backup configurations"))]
    ReadBackupConfigs { source: api::Error },

    #[snafu(display("failed to read the host cluster {cluster_id:?}"))]
    ReadHostCluster {
        source: api::Error,
        cluster_id: String,
    },

    #[snafu(display("failed to change the backup status of cluster {cluster_id:?} to {status}"))]
    UpdateBackupConfig {
        source: api::Error,
        cluster_id: String,
        status: BackupStatus,
    },

    #[snafu(display("failed to read the backup configuration of cluster {cluster_id:?}"))]
    ReadBackupConfig {
        source: api::Error,
        cluster_id: String,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupStatus {
    Inactive,
    Started,
    Stopped,
    Terminating,
}

/// The backup mode requested for a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum BackupMode {
    Enabled,
    Disabled,
    Terminated,
}

impl From<BackupMode> for BackupStatus {
    fn from(mode: BackupMode) -> Self {
        match mode {
            BackupMode::Enabled => Self::Started,
            BackupMode::Disabled => Self::Stopped,
            BackupMode::Terminated => Self::Terminating,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupConfig {
    pub cluster_id: String,

    #[serde(default)]
    pub group_id: String,

    #[serde(rename = "statusName")]
    pub status: BackupStatus,

    #[serde(default)]
    pub storage_engine_name: String,

    #[serde(default)]
    pub sync_source: String,

    #[serde(default)]
    pub encryption_enabled: bool,

    #[serde(default)]
    pub excluded_namespaces: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub included_namespaces: Option<Vec<String>>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl BackupConfig {
    /// A configuration as Ops Manager creates it for a newly discovered replica set.
    pub fn new(cluster_id: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            group_id: group_id.into(),
            status: BackupStatus::Inactive,
            storage_engine_name: "WIRED_TIGER".to_owned(),
            sync_source: "PRIMARY".to_owned(),
            encryption_enabled: false,
            excluded_namespaces: Vec::new(),
            included_namespaces: None,
            extra: Map::new(),
        }
    }
}

/// The deployment component a backup configuration belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostCluster {
    pub cluster_name: String,

    /// `REPLICA_SET`, `SHARDED_REPLICA_SET` or `CONFIG_SERVER_REPLICA_SET`.
    pub type_name: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl HostCluster {
    /// Whether this is the component the backup of the resource `name` is controlled through.
    ///
    /// Sharded clusters get a configuration per shard and for the config server as well, only
    /// the one of the whole cluster may be changed.
    fn controls_backup_of(&self, name: &str, kind: ResourceKind) -> bool {
        self.cluster_name == name
            && match kind {
                ResourceKind::ReplicaSet => self.type_name == "REPLICA_SET",
                ResourceKind::ShardedCluster => self.type_name == "SHARDED_REPLICA_SET",
                ResourceKind::Standalone => false,
            }
    }
}

/// The status to request next on the way from `current` to `desired`.
fn next_status(desired: BackupStatus, current: BackupStatus) -> BackupStatus {
    match (desired, current) {
        (BackupStatus::Terminating, BackupStatus::Started) => BackupStatus::Stopped,
        (BackupStatus::Stopped, BackupStatus::Terminating) => BackupStatus::Started,
        (desired, _) => desired,
    }
}

/// Moves the backup of the resource `name` towards `mode`.
///
/// Requeues while Ops Manager has not created the backup configurations yet, while the status
/// change has not been applied and after an intermediate step.
#[tracing::instrument(skip(client), fields(project.name = %client.project().project_name))]
pub async fn ensure_backup_status<A: OpsManagerApi>(
    client: &Client<A>,
    name: &str,
    kind: ResourceKind,
    mode: BackupMode,
) -> ReconcileResult<Error> {
    let api = client.api();
    let configs = api.read_backup_configs().await.context(ReadBackupConfigsSnafu)?;
    if configs.is_empty() {
        return Ok(create_requeuing_reconcile_function_action(
            CONFIGS_MISSING_RETRY_SECS,
            "Waiting for backup configuration to be created in Ops Manager",
        ));
    }

    let requested = BackupStatus::from(mode);
    let mut action = ReconcileFunctionAction::Continue;

    for config in configs {
        let cluster = api
            .read_host_cluster(&config.cluster_id)
            .await
            .context(ReadHostClusterSnafu {
                cluster_id: &config.cluster_id,
            })?;
        if !cluster.controls_backup_of(name, kind) {
            continue;
        }

        let desired = next_status(requested, config.status);
        if desired != requested {
            tracing::info!(
                cluster_id = %config.cluster_id,
                current = %config.status,
                %requested,
                intermediate = %desired,
                "backup status needs an intermediate step"
            );
            action = create_requeuing_reconcile_function_action(
                STATUS_PENDING_RETRY_SECS,
                format!("Backup of {name} is moving to {requested} via {desired}"),
            );
        }

        if desired == BackupStatus::Stopped && config.status == BackupStatus::Inactive {
            tracing::debug!(
                cluster_id = %config.cluster_id,
                "backup was never started, not stopping it"
            );
            continue;
        }
        if desired == config.status {
            tracing::debug!(
                cluster_id = %config.cluster_id,
                status = %desired,
                "backup is already in the desired status"
            );
            continue;
        }

        api.update_backup_config(&config.cluster_id, desired)
            .await
            .with_context(|_| UpdateBackupConfigSnafu {
                cluster_id: &config.cluster_id,
                status: desired,
            })?;

        if !wait_for_status(api, &config.cluster_id, desired).await? {
            return Ok(create_requeuing_reconcile_function_action(
                STATUS_PENDING_RETRY_SECS,
                format!(
                    "Backup configuration {} has not yet reached the desired status",
                    config.cluster_id
                ),
            ));
        }
        tracing::info!(
            cluster_id = %config.cluster_id,
            status = %desired,
            "backup reached the desired status"
        );
        return Ok(action);
    }

    Ok(action)
}

/// Polls the configuration until it reports `status`. Returns `false` if it didn't in time.
async fn wait_for_status<A: OpsManagerApi>(
    api: &A,
    cluster_id: &str,
    status: BackupStatus,
) -> Result<bool> {
    let result =
        do_and_retry(RetrySettings::default(), move || status_reached(api, cluster_id, status))
            .await;

    match result {
        Ok(()) => Ok(true),
        Err(retry::Error::Exhausted { .. }) => Ok(false),
        Err(retry::Error::Aborted { source }) => Err(source),
    }
}

async fn status_reached<A: OpsManagerApi>(
    api: &A,
    cluster_id: &str,
    status: BackupStatus,
) -> Result<Attempt<()>> {
    let config = api
        .read_backup_config(cluster_id)
        .await
        .context(ReadBackupConfigSnafu { cluster_id })?;

    // Ops Manager reports a terminated backup as inactive right away
    let reached = config.status == status
        || (status == BackupStatus::Terminating && config.status == BackupStatus::Inactive);
    if reached {
        return Ok(Attempt::Done(()));
    }
    Ok(Attempt::Retry {
        reason: format!("backup status is {}", config.status),
    })
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::om::{lock::ProjectKey, mock::MockedOmConnection};

    #[rstest]
    #[case::start(BackupStatus::Started, BackupStatus::Inactive, BackupStatus::Started)]
    #[case::terminate_started(BackupStatus::Terminating, BackupStatus::Started, BackupStatus::Stopped)]
    #[case::terminate_stopped(BackupStatus::Terminating, BackupStatus::Stopped, BackupStatus::Terminating)]
    #[case::stop_terminating(BackupStatus::Stopped, BackupStatus::Terminating, BackupStatus::Started)]
    #[case::stop_started(BackupStatus::Stopped, BackupStatus::Started, BackupStatus::Stopped)]
    fn transitions(
        #[case] desired: BackupStatus,
        #[case] current: BackupStatus,
        #[case] expected: BackupStatus,
    ) {
        assert_eq!(next_status(desired, current), expected);
    }

    #[test]
    fn config_decodes_status_name() {
        let config: BackupConfig = serde_json::from_value(json!({
            "clusterId": "c1",
            "groupId": "g1",
            "statusName": "TERMINATING",
            "storageEngineName": "WIRED_TIGER",
            "sslEnabled": false,
        }))
        .expect("fixture is a valid backup config");

        assert_eq!(config.status, BackupStatus::Terminating);
        assert_eq!(config.extra.get("sslEnabled"), Some(&json!(false)));
    }

    fn client() -> Client<MockedOmConnection> {
        MockedOmConnection::new("project-id").into_client(ProjectKey::new("my-project", "org"))
    }

    async fn add_cluster(
        client: &Client<MockedOmConnection>,
        id: &str,
        name: &str,
        type_name: &str,
        status: BackupStatus,
    ) {
        let mut config = BackupConfig::new(id, "project-id");
        config.status = status;
        client
            .api()
            .add_backup_config(
                config,
                HostCluster {
                    cluster_name: name.to_owned(),
                    type_name: type_name.to_owned(),
                    extra: Map::new(),
                },
            )
            .await;
    }

    async fn status_of(client: &Client<MockedOmConnection>, id: &str) -> BackupStatus {
        client
            .api()
            .read_backup_config(id)
            .await
            .expect("backup config exists")
            .status
    }

    #[tokio::test]
    async fn requeues_until_configs_exist() {
        let client = client();
        let action =
            ensure_backup_status(&client, "my-rs", ResourceKind::ReplicaSet, BackupMode::Enabled)
                .await
                .expect("backup status is ensured");
        assert_eq!(
            action,
            create_requeuing_reconcile_function_action(
                CONFIGS_MISSING_RETRY_SECS,
                "Waiting for backup configuration to be created in Ops Manager"
            )
        );
    }

    #[tokio::test]
    async fn enables_backup_of_matching_cluster_only() {
        let client = client();
        add_cluster(&client, "c1", "other-rs", "REPLICA_SET", BackupStatus::Inactive).await;
        add_cluster(&client, "c2", "my-rs", "REPLICA_SET", BackupStatus::Inactive).await;

        let action =
            ensure_backup_status(&client, "my-rs", ResourceKind::ReplicaSet, BackupMode::Enabled)
                .await
                .expect("backup status is ensured");

        assert_eq!(action, ReconcileFunctionAction::Continue);
        assert_eq!(status_of(&client, "c1").await, BackupStatus::Inactive);
        assert_eq!(status_of(&client, "c2").await, BackupStatus::Started);
    }

    #[tokio::test]
    async fn sharded_cluster_is_controlled_through_cluster_config() {
        let client = client();
        add_cluster(&client, "shard", "sh", "REPLICA_SET", BackupStatus::Inactive).await;
        add_cluster(&client, "cluster", "sh", "SHARDED_REPLICA_SET", BackupStatus::Inactive).await;

        ensure_backup_status(&client, "sh", ResourceKind::ShardedCluster, BackupMode::Enabled)
            .await
            .expect("backup status is ensured");

        assert_eq!(status_of(&client, "shard").await, BackupStatus::Inactive);
        assert_eq!(status_of(&client, "cluster").await, BackupStatus::Started);
    }

    #[tokio::test]
    async fn terminating_goes_through_stopped() {
        let client = client();
        add_cluster(&client, "c1", "my-rs", "REPLICA_SET", BackupStatus::Started).await;

        let action =
            ensure_backup_status(&client, "my-rs", ResourceKind::ReplicaSet, BackupMode::Terminated)
                .await
                .expect("backup status is ensured");
        assert!(action.is_requeue());
        assert_eq!(status_of(&client, "c1").await, BackupStatus::Stopped);

        let action =
            ensure_backup_status(&client, "my-rs", ResourceKind::ReplicaSet, BackupMode::Terminated)
                .await
                .expect("backup status is ensured");
        assert_eq!(action, ReconcileFunctionAction::Continue);
        assert_eq!(status_of(&client, "c1").await, BackupStatus::Inactive);
    }

    #[tokio::test]
    async fn never_started_backup_is_not_stopped() {
        let client = client();
        add_cluster(&client, "c1", "my-rs", "REPLICA_SET", BackupStatus::Inactive).await;

        let action =
            ensure_backup_status(&client, "my-rs", ResourceKind::ReplicaSet, BackupMode::Disabled)
                .await
                .expect("backup status is ensured");

        assert_eq!(action, ReconcileFunctionAction::Continue);
        assert_eq!(status_of(&client, "c1").await, BackupStatus::Inactive);
        assert!(
            client
                .api()
                .requests()
                .await
                .iter()
                .all(|request| request.method != crate::om::mock::Method::Patch)
        );
    }
}
