//! Read-modify-write cycles against the documents of an Ops Manager project.
//!
//! Every cycle takes the project lock, reads the current document, hands a typed view of it to
//! a transform and writes it back only if the transform changed anything. The lock is released
//! when the cycle ends, whether it succeeded or not. A failing transform never causes a write.

use mongodb_shared::retry::{self, Attempt, RetrySettings, do_and_retry};
use snafu::{ResultExt, Snafu};

use crate::om::{
    agent_config::{self, Agent, AgentConfig, Backup, Monitoring},
    api::{self, OpsManagerApi},
    automation_config::{self, AutomationConfig},
    deployment::{self, Deployment},
    lock::{LockRegistry, ProjectKey},
};

type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("request to Ops Manager failed"))]
    Api { source: api::Error },

    #[snafu(display("failed to process the deployment"))]
    Deployment { source: deployment::Error },

    #[snafu(display("failed to process the automation config"))]
    AutomationConfig { source: automation_config::Error },

    #[snafu(display("failed to process the agent configuration"))]
    AgentConfig { source: agent_config::Error },

    #[snafu(display("failed to transform the document, nothing was written"))]
    Transform { source: BoxedError },

    #[snafu(display(
        "processes {processes:?} did not reach goal state after {attempts} attempts: {reason}"
    ))]
    GoalStateTimeout {
        processes: Vec<String>,
        attempts: usize,
        reason: String,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

fn transform_failed<E>(source: E) -> Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    Error::Transform {
        source: Box::new(source),
    }
}

/// A connection to one Ops Manager project.
pub struct Client<Api> {
    api: Api,
    project: ProjectKey,
    locks: LockRegistry,
    retry: RetrySettings,
}

impl<Api: OpsManagerApi> Client<Api> {
    /// `locks` must be shared by all clients of this process talking to the same Ops Manager.
    pub fn new(api: Api, project: ProjectKey, locks: LockRegistry, retry: RetrySettings) -> Self {
        Self {
            api,
            project,
            locks,
            retry,
        }
    }

    pub fn api(&self) -> &Api {
        &self.api
    }

    pub fn project(&self) -> &ProjectKey {
        &self.project
    }

    pub async fn read_deployment(&self) -> Result<Deployment> {
        let document = self.api.read_automation_config().await.context(ApiSnafu)?;
        Deployment::from_value(document).context(DeploymentSnafu)
    }

    pub async fn read_automation_config(&self) -> Result<AutomationConfig> {
        AutomationConfig::from_deployment(self.read_deployment().await?)
            .context(AutomationConfigSnafu)
    }

    /// Runs `transform` on the current deployment and writes the result back if it changed.
    #[tracing::instrument(skip_all, fields(project.name = %self.project.project_name))]
    pub async fn read_update_deployment<T, E, F>(&self, transform: F) -> Result<T>
    where
        F: FnOnce(&mut Deployment) -> Result<T, E>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let _guard = self.locks.lock(&self.project).await;

        let original = self.read_deployment().await?;
        let mut deployment = original.clone();
        let output = transform(&mut deployment).map_err(transform_failed)?;

        if deployment == original {
            tracing::debug!("deployment is unchanged, skipping update");
            return Ok(output);
        }
        self.write_deployment(&deployment).await?;
        Ok(output)
    }

    /// Like [`Client::read_update_deployment`], with the authentication related sections decoded.
    ///
    /// The typed sections are merged back before the comparison, so `transform` only needs to
    /// mutate them.
    #[tracing::instrument(skip_all, fields(project.name = %self.project.project_name))]
    pub async fn read_update_automation_config<T, E, F>(&self, transform: F) -> Result<T>
    where
        F: FnOnce(&mut AutomationConfig) -> Result<T, E>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let _guard = self.locks.lock(&self.project).await;

        let mut baseline = AutomationConfig::from_deployment(self.read_deployment().await?)
            .context(AutomationConfigSnafu)?;
        baseline.apply().context(AutomationConfigSnafu)?;

        let mut config = baseline.clone();
        let output = transform(&mut config).map_err(transform_failed)?;
        config.apply().context(AutomationConfigSnafu)?;

        if config.deployment == baseline.deployment {
            tracing::debug!("automation config is unchanged, skipping update");
            return Ok(output);
        }
        self.write_deployment(&config.deployment).await?;
        Ok(output)
    }

    #[tracing::instrument(
        skip_all,
        fields(project.name = %self.project.project_name, agent = %A::KIND)
    )]
    pub async fn read_update_agent_config<A, T, E, F>(&self, transform: F) -> Result<T>
    where
        A: Agent,
        F: FnOnce(&mut AgentConfig<A>) -> Result<T, E>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let _guard = self.locks.lock(&self.project).await;

        let original = self
            .api
            .read_agent_config(A::KIND)
            .await
            .context(ApiSnafu)?;
        let mut config = AgentConfig::<A>::from_map(original.clone()).context(AgentConfigSnafu)?;
        let output = transform(&mut config).map_err(transform_failed)?;
        config.apply().context(AgentConfigSnafu)?;

        if config.backing() == &original {
            tracing::debug!("agent configuration is unchanged, skipping update");
            return Ok(output);
        }
        self.api
            .update_agent_config(A::KIND, config.into_backing())
            .await
            .context(ApiSnafu)?;
        Ok(output)
    }

    pub async fn read_update_monitoring_agent_config<T, E, F>(&self, transform: F) -> Result<T>
    where
        F: FnOnce(&mut AgentConfig<Monitoring>) -> Result<T, E>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.read_update_agent_config(transform).await
    }

    pub async fn read_update_backup_agent_config<T, E, F>(&self, transform: F) -> Result<T>
    where
        F: FnOnce(&mut AgentConfig<Backup>) -> Result<T, E>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.read_update_agent_config(transform).await
    }

    /// Waits until the agents running `process_names` (all processes if empty) have applied the
    /// latest deployment.
    pub async fn wait_for_ready_state(&self, process_names: &[String]) -> Result<()> {
        let api = &self.api;
        let result = do_and_retry(self.retry, move || goal_state_reached(api, process_names)).await;

        match result {
            Ok(()) => {
                tracing::debug!(processes = ?process_names, "agents reached goal state");
                Ok(())
            }
            Err(retry::Error::Exhausted { attempts, reason }) => GoalStateTimeoutSnafu {
                processes: process_names.to_vec(),
                attempts,
                reason,
            }
            .fail(),
            Err(retry::Error::Aborted { source }) => Err(Error::Api { source }),
        }
    }

    pub async fn generate_agent_key(&self) -> Result<String> {
        self.api.generate_agent_key().await.context(ApiSnafu)
    }

    async fn write_deployment(&self, deployment: &Deployment) -> Result<()> {
        let document = deployment.to_value().context(DeploymentSnafu)?;
        self.api
            .update_automation_config(document)
            .await
            .context(ApiSnafu)?;
        tracing::info!(version = deployment.version(), "updated automation config");
        Ok(())
    }
}

async fn goal_state_reached<A: OpsManagerApi>(
    api: &A,
    process_names: &[String],
) -> api::Result<Attempt<()>> {
    let status = api.read_automation_status().await?;
    let pending = status.processes_not_in_goal_state(process_names);
    if pending.is_empty() {
        return Ok(Attempt::Done(()));
    }

    Ok(Attempt::Retry {
        reason: format!(
            "processes {pending:?} did not reach goal version {}",
            status.goal_version
        ),
    })
}
