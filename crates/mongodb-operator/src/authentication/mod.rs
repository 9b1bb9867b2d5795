//! Enabling and disabling authentication in an Ops Manager project.
//!
//! Changing how the agents authenticate is done in small steps. Every step is written on its
//! own and the agents have to reach goal state before the next one starts, otherwise they can
//! lose the ability to authenticate halfway through a transition.

use std::convert::Infallible;

use mongodb_shared::merge::DELETION_SENTINEL;
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use strum::{Display, EnumString, IntoStaticStr};

use crate::om::{
    api::OpsManagerApi,
    automation_config::{
        AGENT_PEM_KEY_FILE_PATH, AUTOMATION_AGENT_NAME, AutomationConfig, ClientCertificateMode,
        KEY_FILE_PATH, KEY_FILE_WINDOWS_PATH, Ldap,
    },
    client::{self, Client},
};

pub mod ldap;
pub mod scram;
pub mod x509;


#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read the automation config"))]
    ReadAutomationConfig { source: client::Error },

    #[snafu(display("failed to {step}"))]
    Step { source: client::Error, step: Step },

    #[snafu(display("agents did not reach goal state after the attempt to {step}"))]
    GoalState { source: client::Error, step: Step },

    #[snafu(display("no authentication mode was requested, authentication must be disabled instead"))]
    NoAuthenticationModes,

    #[snafu(display(
        "the {agent} agent subject {subject:?} must contain the CN, C and OU attributes"
    ))]
    InvalidSubject {
        agent: &'static str,
        subject: String,
    },

    #[snafu(display("X.509 authentication requires TLS to be enabled on all processes"))]
    X509RequiresTls,

    #[snafu(display("LDAP authentication requires an LDAP configuration"))]
    LdapConfigurationMissing,

    #[snafu(display("agents authenticating with LDAP require an LDAP user"))]
    LdapAgentUserMissing,
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// The individual changes made while configuring authentication.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum Step {
    #[strum(to_string = "enable the deployment authentication mechanisms")]
    EnableDeploymentMechanisms,

    #[strum(to_string = "configure the authoritative set")]
    ConfigureAuthoritativeSet,

    #[strum(to_string = "enable agent authentication")]
    EnableAgentMechanism,

    #[strum(to_string = "disable unused agent authentication mechanisms")]
    DisableAgentMechanisms,

    #[strum(to_string = "remove unused deployment authentication mechanisms")]
    RemoveDeploymentMechanisms,

    #[strum(to_string = "configure the agent client certificate")]
    ConfigureAgentCertificate,

    #[strum(to_string = "remove unused agent users")]
    RemoveAgentUsers,

    #[strum(to_string = "disable authentication")]
    DisableAuthentication,

    #[strum(to_string = "reset the authentication settings")]
    ResetAuthentication,
}

/// An authentication mode as requested for a MongoDB resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
pub enum AuthMode {
    /// The strongest SCRAM variant the deployment supports.
    #[strum(serialize = "SCRAM")]
    Scram,

    #[strum(serialize = "SCRAM-SHA-1")]
    ScramSha1,

    #[strum(serialize = "SCRAM-SHA-256")]
    ScramSha256,

    #[strum(serialize = "MONGODB-CR")]
    MongoDbCr,

    #[strum(serialize = "X509")]
    X509,

    #[strum(serialize = "LDAP")]
    Ldap,
}

/// An authentication mechanism, named the way the automation config names it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
pub enum Mechanism {
    /// SCRAM-SHA-1, which Ops Manager still files under its legacy name.
    #[strum(serialize = "MONGODB-CR")]
    MongoDbCr,

    #[strum(serialize = "SCRAM-SHA-256")]
    ScramSha256,

    #[strum(serialize = "MONGODB-X509")]
    X509,

    #[strum(serialize = "PLAIN")]
    LdapPlain,
}

/// The X.509 subjects the agents authenticate as.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AgentSubjects {
    pub automation: String,
    pub monitoring: String,
    pub backup: String,
}

/// The LDAP user the automation agent authenticates as.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LdapAgentUser {
    pub username: String,
    pub password: String,
    pub group_dn: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuthenticationOptions {
    /// Decides between SCRAM-SHA-1 and SCRAM-SHA-256 for [`AuthMode::Scram`].
    pub minimum_major_version: u64,

    pub modes: Vec<AuthMode>,

    /// The mode the agents authenticate with, derived from `modes` if unset.
    pub agent_mode: Option<AuthMode>,

    /// The processes to wait for between the steps, all of them if empty.
    pub process_names: Vec<String>,

    pub authoritative_set: bool,
    pub client_certificates: ClientCertificateMode,
    pub ca_file_path: Option<String>,
    pub agents_use_client_authentication: bool,
    pub agent_subjects: AgentSubjects,
    pub ldap: Option<Ldap>,
    pub ldap_agent: Option<LdapAgentUser>,
}

impl Mechanism {
    /// Every mechanism that is managed here.
    pub const ALL: [Self; 4] = [Self::ScramSha256, Self::MongoDbCr, Self::X509, Self::LdapPlain];

    /// Resolves `mode` against the current state of the project.
    ///
    /// A generic SCRAM request keeps SCRAM-SHA-1 once agents use it, switching between the SCRAM
    /// variants has to be done by hand.
    pub fn for_mode(mode: AuthMode, config: &AutomationConfig, minimum_major_version: u64) -> Self {
        match mode {
            AuthMode::X509 => Self::X509,
            AuthMode::Ldap => Self::LdapPlain,
            AuthMode::ScramSha1 | AuthMode::MongoDbCr => Self::MongoDbCr,
            AuthMode::ScramSha256 => Self::ScramSha256,
            AuthMode::Scram => {
                let legacy_scram_active = config.auth.is_enabled()
                    && config.agent_auth_mode() == Some(Self::MongoDbCr.name());
                if legacy_scram_active || minimum_major_version < 4 {
                    Self::MongoDbCr
                } else {
                    Self::ScramSha256
                }
            }
        }
    }

    pub fn name(self) -> &'static str {
        self.into()
    }

    pub fn enable_deployment_authentication(
        self,
        config: &mut AutomationConfig,
        opts: &AuthenticationOptions,
    ) {
        if self == Self::LdapPlain {
            config.ldap.clone_from(&opts.ldap);
        }
        add_mechanism(&mut config.auth.deployment_auth_mechanisms, self);
    }

    pub fn disable_deployment_authentication(self, config: &mut AutomationConfig) {
        if self == Self::LdapPlain {
            config.ldap = None;
        }
        remove_mechanism(&mut config.auth.deployment_auth_mechanisms, self);
    }

    pub fn is_deployment_authentication_configured(self, config: &AutomationConfig) -> bool {
        let allowed = contains_mechanism(&config.auth.deployment_auth_mechanisms, self);
        match self {
            Self::LdapPlain => allowed && config.ldap.is_some(),
            _ => allowed,
        }
    }

    pub fn is_agent_authentication_configured(
        self,
        config: &AutomationConfig,
        opts: &AuthenticationOptions,
    ) -> bool {
        match self {
            Self::MongoDbCr | Self::ScramSha256 => scram::is_agent_configured(config, self),
            Self::X509 => x509::is_agent_configured(config, &opts.agent_subjects),
            Self::LdapPlain => opts
                .ldap_agent
                .as_ref()
                .is_some_and(|agent| ldap::is_agent_configured(config, agent)),
        }
    }

    /// Whether the agents are allowed to authenticate with this mechanism.
    pub fn is_agent_mechanism(self, config: &AutomationConfig) -> bool {
        contains_mechanism(&config.auth.auto_auth_mechanisms, self)
    }

    /// Makes the agents authenticate with this mechanism, replacing the one they used before.
    pub async fn enable_agent_authentication<A: OpsManagerApi>(
        self,
        client: &Client<A>,
        opts: &AuthenticationOptions,
    ) -> Result<(), client::Error> {
        let enabled = client
            .read_update_automation_config(|config| {
                if self.is_agent_authentication_configured(config, opts) {
                    tracing::info!(mechanism = %self, "agent authentication is already configured");
                    return Ok::<_, Infallible>(false);
                }
                tracing::info!(mechanism = %self, "enabling agent authentication");
                match self {
                    Self::MongoDbCr | Self::ScramSha256 => scram::enable_agent(config, self, opts),
                    Self::X509 => x509::enable_agent(config, opts),
                    Self::LdapPlain => {
                        if let Some(agent) = &opts.ldap_agent {
                            ldap::enable_agent(config, agent, opts);
                        }
                    }
                }
                Ok(true)
            })
            .await?;

        if self == Self::X509 && enabled {
            x509::enable_monitoring_and_backup_agents(client, &opts.agent_subjects).await?;
        }
        Ok(())
    }

    pub async fn disable_agent_authentication<A: OpsManagerApi>(
        self,
        client: &Client<A>,
    ) -> Result<(), client::Error> {
        tracing::info!(mechanism = %self, "disabling agent authentication");
        client
            .read_update_automation_config(|config| {
                match self {
                    Self::MongoDbCr | Self::ScramSha256 => scram::disable_agent(config, self),
                    Self::X509 => x509::disable_agent(config),
                    Self::LdapPlain => ldap::disable_agent(config),
                }
                Ok::<_, Infallible>(())
            })
            .await?;

        if self == Self::X509 {
            x509::disable_monitoring_and_backup_agents(client).await?;
        }
        Ok(())
    }
}

impl AuthenticationOptions {
    /// The mechanisms the deployment should accept. Always includes the agent mechanism.
    pub fn deployment_mechanisms(&self, config: &AutomationConfig) -> Vec<Mechanism> {
        let mut mechanisms = Vec::new();
        for mode in &self.modes {
            let mechanism = Mechanism::for_mode(*mode, config, self.minimum_major_version);
            if !mechanisms.contains(&mechanism) {
                mechanisms.push(mechanism);
            }
        }
        if let Some(agent) = self.agent_mechanism(config) {
            if !mechanisms.contains(&agent) {
                mechanisms.push(agent);
            }
        }
        mechanisms
    }

    /// The mechanism the agents should use.
    ///
    /// Without an explicit agent mode X.509 is only picked if it is the sole mode, and legacy
    /// SCRAM is preferred over SCRAM-SHA-256 to avoid a forced upgrade.
    pub fn agent_mechanism(&self, config: &AutomationConfig) -> Option<Mechanism> {
        if let Some(mode) = self.agent_mode {
            return Some(Mechanism::for_mode(mode, config, self.minimum_major_version));
        }

        let desired: Vec<Mechanism> = self
            .modes
            .iter()
            .map(|mode| Mechanism::for_mode(*mode, config, self.minimum_major_version))
            .collect();
        match desired.as_slice() {
            [] => None,
            [sole] => Some(*sole),
            _ if desired.contains(&Mechanism::MongoDbCr) => Some(Mechanism::MongoDbCr),
            _ if desired.contains(&Mechanism::ScramSha256) => Some(Mechanism::ScramSha256),
            [first, ..] => Some(*first),
        }
    }

    fn validate(&self, config: &AutomationConfig, agent: Mechanism) -> Result<()> {
        let mechanisms = self.deployment_mechanisms(config);

        if mechanisms.contains(&Mechanism::X509) {
            ensure!(
                config.deployment.all_processes_are_tls_enabled(),
                X509RequiresTlsSnafu
            );
        }
        if agent == Mechanism::X509 {
            let subjects = &self.agent_subjects;
            validate_subject("automation", &subjects.automation)?;
            for (name, subject) in [
                ("monitoring", &subjects.monitoring),
                ("backup", &subjects.backup),
            ] {
                if !subject.is_empty() {
                    validate_subject(name, subject)?;
                }
            }
        }
        if mechanisms.contains(&Mechanism::LdapPlain) {
            ensure!(self.ldap.is_some(), LdapConfigurationMissingSnafu);
        }
        if agent == Mechanism::LdapPlain {
            ensure!(self.ldap_agent.is_some(), LdapAgentUserMissingSnafu);
        }
        Ok(())
    }
}

fn validate_subject(agent: &'static str, subject: &str) -> Result<()> {
    ensure!(
        x509::is_valid_subject(subject),
        InvalidSubjectSnafu { agent, subject }
    );
    Ok(())
}

/// Configures authentication for the project, waiting for goal state after every step.
///
/// Every step is idempotent, a failed run can simply be repeated.
#[tracing::instrument(
    skip_all,
    fields(project.name = %client.project().project_name, modes = ?opts.modes)
)]
pub async fn configure<A: OpsManagerApi>(
    client: &Client<A>,
    opts: &AuthenticationOptions,
) -> Result<()> {
    let current = client
        .read_automation_config()
        .await
        .context(ReadAutomationConfigSnafu)?;
    let agent = opts
        .agent_mechanism(&current)
        .context(NoAuthenticationModesSnafu)?;
    opts.validate(&current, agent)?;
    let desired = opts.deployment_mechanisms(&current);
    tracing::info!(mechanisms = ?desired, agent = %agent, "configuring authentication");

    ensure_deployment_mechanisms(client, opts, &desired).await?;
    wait_for_ready_state(client, opts, Step::EnableDeploymentMechanisms).await?;

    ensure_authoritative_set(client, opts.authoritative_set).await?;
    wait_for_ready_state(client, opts, Step::ConfigureAuthoritativeSet).await?;

    agent
        .enable_agent_authentication(client, opts)
        .await
        .context(StepSnafu {
            step: Step::EnableAgentMechanism,
        })?;
    wait_for_ready_state(client, opts, Step::EnableAgentMechanism).await?;

    disable_unused_agent_mechanisms(client, &desired).await?;
    wait_for_ready_state(client, opts, Step::DisableAgentMechanisms).await?;

    remove_unused_deployment_mechanisms(client, &desired).await?;
    wait_for_ready_state(client, opts, Step::RemoveDeploymentMechanisms).await?;

    configure_agent_client_certificate(client, opts, agent).await?;
    wait_for_ready_state(client, opts, Step::ConfigureAgentCertificate).await?;

    remove_unused_agent_users(client, opts).await?;
    wait_for_ready_state(client, opts, Step::RemoveAgentUsers).await
}

/// Disables authentication in two phases.
///
/// Agents first switch authentication off while their credentials are still in place, only
/// then are mechanisms, agent users and certificates removed. With `delete_users` all users and
/// the automation agent credentials are removed as well.
#[tracing::instrument(
    skip_all,
    fields(project.name = %client.project().project_name, delete_users = delete_users)
)]
pub async fn disable<A: OpsManagerApi>(
    client: &Client<A>,
    opts: &AuthenticationOptions,
    delete_users: bool,
) -> Result<()> {
    let current = client
        .read_automation_config()
        .await
        .context(ReadAutomationConfigSnafu)?;

    if current.auth.is_enabled() {
        tracing::info!("disabling authentication");
        client
            .read_update_automation_config(|config| {
                config.auth.disabled = true;
                Ok::<_, Infallible>(())
            })
            .await
            .context(StepSnafu {
                step: Step::DisableAuthentication,
            })?;
        wait_for_ready_state(client, opts, Step::DisableAuthentication).await?;
    }

    client
        .read_update_automation_config(|config| {
            reset_authentication(config, opts, delete_users);
            Ok::<_, Infallible>(())
        })
        .await
        .context(StepSnafu {
            step: Step::ResetAuthentication,
        })?;
    x509::disable_monitoring_and_backup_agents(client)
        .await
        .context(StepSnafu {
            step: Step::ResetAuthentication,
        })?;
    wait_for_ready_state(client, opts, Step::ResetAuthentication).await
}

fn reset_authentication(
    config: &mut AutomationConfig,
    opts: &AuthenticationOptions,
    delete_users: bool,
) {
    config.ensure_key_file_contents();
    if delete_users {
        config.auth.users.iter_mut().for_each(|user| *user = None);
        config.auth.auto_user = DELETION_SENTINEL.to_owned();
        config.auth.auto_pwd = DELETION_SENTINEL.to_owned();
    } else {
        remove_agent_users(config, &opts.agent_subjects);
        config.ensure_password();
        config.auth.auto_user = AUTOMATION_AGENT_NAME.to_owned();
    }

    let auth = &mut config.auth;
    auth.auto_auth_mechanisms.clear();
    auth.deployment_auth_mechanisms.clear();
    auth.key_file = KEY_FILE_PATH.to_owned();
    auth.key_file_windows = KEY_FILE_WINDOWS_PATH.to_owned();
    auth.authoritative_set = opts.authoritative_set;
    if !auth.auto_ldap_group_dn.is_empty() {
        auth.auto_ldap_group_dn = DELETION_SENTINEL.to_owned();
    }

    config.agent_ssl.client_certificate_mode = Some(ClientCertificateMode::Optional.to_string());
    config.agent_ssl.auto_pem_key_file_path = Some(DELETION_SENTINEL.to_owned());
}

fn remove_agent_users(config: &mut AutomationConfig, subjects: &AgentSubjects) {
    for user in scram::agent_users("")
        .into_iter()
        .chain(x509::agent_users(subjects))
    {
        config
            .auth
            .ensure_user_removed(&user.username, &user.database);
    }
}

async fn wait_for_ready_state<A: OpsManagerApi>(
    client: &Client<A>,
    opts: &AuthenticationOptions,
    step: Step,
) -> Result<()> {
    client
        .wait_for_ready_state(&opts.process_names)
        .await
        .context(GoalStateSnafu { step })
}

async fn ensure_deployment_mechanisms<A: OpsManagerApi>(
    client: &Client<A>,
    opts: &AuthenticationOptions,
    desired: &[Mechanism],
) -> Result<()> {
    client
        .read_update_automation_config(|config| {
            for mechanism in desired {
                if mechanism.is_deployment_authentication_configured(config) {
                    tracing::debug!(%mechanism, "deployment mechanism is already configured");
                } else {
                    tracing::info!(%mechanism, "enabling deployment mechanism");
                    mechanism.enable_deployment_authentication(config, opts);
                }
            }
            Ok::<_, Infallible>(())
        })
        .await
        .context(StepSnafu {
            step: Step::EnableDeploymentMechanisms,
        })
}

async fn ensure_authoritative_set<A: OpsManagerApi>(
    client: &Client<A>,
    authoritative_set: bool,
) -> Result<()> {
    client
        .read_update_automation_config(|config| {
            config.auth.authoritative_set = authoritative_set;
            Ok::<_, Infallible>(())
        })
        .await
        .context(StepSnafu {
            step: Step::ConfigureAuthoritativeSet,
        })
}

async fn disable_unused_agent_mechanisms<A: OpsManagerApi>(
    client: &Client<A>,
    desired: &[Mechanism],
) -> Result<()> {
    let step = Step::DisableAgentMechanisms;
    let current = client
        .read_automation_config()
        .await
        .context(StepSnafu { step })?;

    for mechanism in Mechanism::ALL
        .into_iter()
        .filter(|mechanism| !desired.contains(mechanism))
    {
        if mechanism.is_agent_mechanism(&current) {
            mechanism
                .disable_agent_authentication(client)
                .await
                .context(StepSnafu { step })?;
        }
    }

    // A new agent mechanism replaces X.509 in the automation config only
    if !desired.contains(&Mechanism::X509) {
        x509::disable_monitoring_and_backup_agents(client)
            .await
            .context(StepSnafu { step })?;
    }
    Ok(())
}

async fn remove_unused_deployment_mechanisms<A: OpsManagerApi>(
    client: &Client<A>,
    desired: &[Mechanism],
) -> Result<()> {
    client
        .read_update_automation_config(|config| {
            for mechanism in Mechanism::ALL
                .into_iter()
                .filter(|mechanism| !desired.contains(mechanism))
            {
                if contains_mechanism(&config.auth.deployment_auth_mechanisms, mechanism) {
                    tracing::info!(%mechanism, "removing deployment mechanism");
                    mechanism.disable_deployment_authentication(config);
                }
            }
            Ok::<_, Infallible>(())
        })
        .await
        .context(StepSnafu {
            step: Step::RemoveDeploymentMechanisms,
        })
}

/// Adds or removes the certificate the agents present when client certificates are required.
///
/// X.509 agent authentication manages the certificate itself.
async fn configure_agent_client_certificate<A: OpsManagerApi>(
    client: &Client<A>,
    opts: &AuthenticationOptions,
    agent: Mechanism,
) -> Result<()> {
    if agent == Mechanism::X509 {
        return Ok(());
    }

    client
        .read_update_automation_config(|config| {
            let ssl = &mut config.agent_ssl;
            if opts.agents_use_client_authentication {
                ssl.auto_pem_key_file_path = Some(AGENT_PEM_KEY_FILE_PATH.to_owned());
                ssl.ca_file_path.clone_from(&opts.ca_file_path);
                ssl.client_certificate_mode = Some(opts.client_certificates.to_string());
            } else {
                ssl.auto_pem_key_file_path = Some(DELETION_SENTINEL.to_owned());
                ssl.client_certificate_mode = Some(ClientCertificateMode::Optional.to_string());
            }
            Ok::<_, Infallible>(())
        })
        .await
        .context(StepSnafu {
            step: Step::ConfigureAgentCertificate,
        })
}

/// Removes the agent users of the mechanisms the agents no longer authenticate with.
async fn remove_unused_agent_users<A: OpsManagerApi>(
    client: &Client<A>,
    opts: &AuthenticationOptions,
) -> Result<()> {
    client
        .read_update_automation_config(|config| {
            let unused = if config.auth.disabled {
                let mut users = scram::agent_users("");
                users.extend(x509::agent_users(&opts.agent_subjects));
                users
            } else {
                match config.agent_auth_mode() {
                    Some("SCRAM-SHA-256" | "MONGODB-CR") => {
                        x509::agent_users(&opts.agent_subjects)
                    }
                    Some("MONGODB-X509") => scram::agent_users(""),
                    _ => Vec::new(),
                }
            };

            for user in unused {
                if config
                    .auth
                    .ensure_user_removed(&user.username, &user.database)
                {
                    tracing::info!(
                        user.name = %user.username,
                        user.database = %user.database,
                        "removed agent user"
                    );
                }
            }
            Ok::<_, Infallible>(())
        })
        .await
        .context(StepSnafu {
            step: Step::RemoveAgentUsers,
        })
}

/// Settings shared by all mechanisms once the agents authenticate.
fn enable_agent_auth_basics(config: &mut AutomationConfig, opts: &AuthenticationOptions) {
    config.ensure_key_file_contents();
    let auth = &mut config.auth;
    auth.disabled = false;
    auth.authoritative_set = opts.authoritative_set;
    auth.key_file = KEY_FILE_PATH.to_owned();
    auth.key_file_windows = KEY_FILE_WINDOWS_PATH.to_owned();
}

fn contains_mechanism(mechanisms: &[String], mechanism: Mechanism) -> bool {
    mechanisms.iter().any(|name| name == mechanism.name())
}

fn add_mechanism(mechanisms: &mut Vec<String>, mechanism: Mechanism) {
    if !contains_mechanism(mechanisms, mechanism) {
        mechanisms.push(mechanism.to_string());
    }
}

fn remove_mechanism(mechanisms: &mut Vec<String>, mechanism: Mechanism) {
    mechanisms.retain(|name| name != mechanism.name());
}
