//! SCRAM agent authentication, used for both `MONGODB-CR` (SCRAM-SHA-1) and `SCRAM-SHA-256`.

use mongodb_shared::merge::DELETION_SENTINEL;

use super::{AuthenticationOptions, Mechanism, contains_mechanism, enable_agent_auth_basics};
use crate::om::automation_config::{
    AUTOMATION_AGENT_NAME, AutomationConfig, INVALID_AUTOMATION_AGENT_PASSWORD, MongoDbUser,
};

pub const BACKUP_AGENT_USER: &str = "mms-backup-agent";
pub const MONITORING_AGENT_USER: &str = "mms-monitoring-agent";

const ADMIN_DATABASE: &str = "admin";

/// The users the monitoring and backup agents authenticate as.
pub fn agent_users(password: &str) -> Vec<MongoDbUser> {
    vec![
        MongoDbUser::new(BACKUP_AGENT_USER, ADMIN_DATABASE)
            .with_role("clusterAdmin", ADMIN_DATABASE)
            .with_role("readAnyDatabase", ADMIN_DATABASE)
            .with_role("userAdminAnyDatabase", ADMIN_DATABASE)
            .with_role("readWrite", "local")
            .with_role("readWrite", ADMIN_DATABASE)
            .with_init_password(password),
        MongoDbUser::new(MONITORING_AGENT_USER, ADMIN_DATABASE)
            .with_role("clusterMonitor", ADMIN_DATABASE)
            .with_init_password(password),
    ]
}

pub(super) fn enable_agent(
    config: &mut AutomationConfig,
    mechanism: Mechanism,
    opts: &AuthenticationOptions,
) {
    let password = config.ensure_password().to_owned();
    enable_agent_auth_basics(config, opts);

    for user in agent_users(&password) {
        config.auth.ensure_user(user);
    }

    let auth = &mut config.auth;
    auth.auto_user = AUTOMATION_AGENT_NAME.to_owned();
    // Ops Manager rejects SCRAM next to any other agent mechanism
    auth.auto_auth_mechanisms = vec![mechanism.to_string()];
    if !auth.auto_ldap_group_dn.is_empty() {
        auth.auto_ldap_group_dn = DELETION_SENTINEL.to_owned();
    }
}

pub(super) fn disable_agent(config: &mut AutomationConfig, mechanism: Mechanism) {
    super::remove_mechanism(&mut config.auth.auto_auth_mechanisms, mechanism);
}

pub(super) fn is_agent_configured(config: &AutomationConfig, mechanism: Mechanism) -> bool {
    let auth = &config.auth;
    let password_is_set = !auth.auto_pwd.is_empty()
        && auth.auto_pwd != DELETION_SENTINEL
        && auth.auto_pwd != INVALID_AUTOMATION_AGENT_PASSWORD;

    auth.is_enabled()
        && contains_mechanism(&auth.auto_auth_mechanisms, mechanism)
        && auth.auto_user == AUTOMATION_AGENT_NAME
        && password_is_set
        && !auth.key.is_empty()
        && !auth.key_file.is_empty()
        && !auth.key_file_windows.is_empty()
        && auth.has_user(BACKUP_AGENT_USER, ADMIN_DATABASE)
        && auth.has_user(MONITORING_AGENT_USER, ADMIN_DATABASE)
}
