//! X.509 agent authentication.
//!
//! The automation agent authenticates with the shared agent certificate as the automation
//! subject. Monitoring and backup agents get their own users in the `$external` database.

use std::convert::Infallible;

use mongodb_shared::merge::DELETION_SENTINEL;

use super::{
    AgentSubjects, AuthenticationOptions, Mechanism, contains_mechanism, enable_agent_auth_basics,
};
use crate::om::{
    api::OpsManagerApi,
    automation_config::{
        AGENT_PEM_KEY_FILE_PATH, AutomationConfig, ClientCertificateMode, MongoDbUser,
    },
    client::{self, Client},
};

pub const EXTERNAL_DATABASE: &str = "$external";

const ADMIN_DATABASE: &str = "admin";

/// Whether `subject` names a CN, a C and an OU.
pub fn is_valid_subject(subject: &str) -> bool {
    let attributes: Vec<&str> = subject
        .split(',')
        .filter_map(|rdn| rdn.split_once('='))
        .map(|(attribute, _)| attribute.trim())
        .collect();
    ["CN", "C", "OU"]
        .iter()
        .all(|required| attributes.contains(required))
}

/// The users of the monitoring and backup agents. Agents without a subject get none.
pub fn agent_users(subjects: &AgentSubjects) -> Vec<MongoDbUser> {
    let mut users = Vec::new();
    if !subjects.backup.is_empty() {
        users.push(
            MongoDbUser::new(&subjects.backup, EXTERNAL_DATABASE)
                .with_role("clusterAdmin", ADMIN_DATABASE)
                .with_role("readAnyDatabase", ADMIN_DATABASE)
                .with_role("userAdminAnyDatabase", ADMIN_DATABASE)
                .with_role("readWrite", "local")
                .with_role("readWrite", ADMIN_DATABASE),
        );
    }
    if !subjects.monitoring.is_empty() {
        users.push(
            MongoDbUser::new(&subjects.monitoring, EXTERNAL_DATABASE)
                .with_role("clusterMonitor", ADMIN_DATABASE),
        );
    }
    users
}

pub(super) fn enable_agent(config: &mut AutomationConfig, opts: &AuthenticationOptions) {
    config.ensure_password();
    enable_agent_auth_basics(config, opts);

    for user in agent_users(&opts.agent_subjects) {
        config.auth.ensure_user(user);
    }

    let auth = &mut config.auth;
    auth.auto_user.clone_from(&opts.agent_subjects.automation);
    auth.auto_auth_mechanisms = vec![Mechanism::X509.to_string()];

    let ssl = &mut config.agent_ssl;
    ssl.auto_pem_key_file_path = Some(AGENT_PEM_KEY_FILE_PATH.to_owned());
    ssl.client_certificate_mode = Some(opts.client_certificates.to_string());
    if opts.ca_file_path.is_some() {
        ssl.ca_file_path.clone_from(&opts.ca_file_path);
    }
}

pub(super) fn disable_agent(config: &mut AutomationConfig) {
    super::remove_mechanism(&mut config.auth.auto_auth_mechanisms, Mechanism::X509);
    config.agent_ssl.auto_pem_key_file_path = Some(DELETION_SENTINEL.to_owned());
    config.agent_ssl.client_certificate_mode = Some(ClientCertificateMode::Optional.to_string());
}

pub(super) fn is_agent_configured(config: &AutomationConfig, subjects: &AgentSubjects) -> bool {
    let auth = &config.auth;
    let agent_users_exist = agent_users(subjects)
        .iter()
        .all(|user| auth.has_user(&user.username, &user.database));

    auth.is_enabled()
        && contains_mechanism(&auth.auto_auth_mechanisms, Mechanism::X509)
        && !subjects.automation.is_empty()
        && auth.auto_user == subjects.automation
        && !auth.key.is_empty()
        && config.agent_ssl.auto_pem_key_file_path.as_deref() == Some(AGENT_PEM_KEY_FILE_PATH)
        && agent_users_exist
}

pub(super) async fn enable_monitoring_and_backup_agents<A: OpsManagerApi>(
    client: &Client<A>,
    subjects: &AgentSubjects,
) -> Result<(), client::Error> {
    if !subjects.monitoring.is_empty() {
        client
            .read_update_monitoring_agent_config(|config| {
                config.enable_x509_authentication(&subjects.monitoring);
                Ok::<_, Infallible>(())
            })
            .await?;
    }
    if !subjects.backup.is_empty() {
        client
            .read_update_backup_agent_config(|config| {
                config.enable_x509_authentication(&subjects.backup);
                Ok::<_, Infallible>(())
            })
            .await?;
    }
    Ok(())
}

pub(super) async fn disable_monitoring_and_backup_agents<A: OpsManagerApi>(
    client: &Client<A>,
) -> Result<(), client::Error> {
    client
        .read_update_monitoring_agent_config(|config| {
            config.disable_x509_authentication();
            Ok::<_, Infallible>(())
        })
        .await?;
    client
        .read_update_backup_agent_config(|config| {
            config.disable_x509_authentication();
            Ok::<_, Infallible>(())
        })
        .await
}
