//! LDAP authentication, which the automation config calls `PLAIN`.

use mongodb_shared::merge::DELETION_SENTINEL;

use super::{
    AuthenticationOptions, LdapAgentUser, Mechanism, contains_mechanism, enable_agent_auth_basics,
};
use crate::om::automation_config::AutomationConfig;

pub(super) fn enable_agent(
    config: &mut AutomationConfig,
    agent: &LdapAgentUser,
    opts: &AuthenticationOptions,
) {
    enable_agent_auth_basics(config, opts);

    let auth = &mut config.auth;
    auth.auto_user.clone_from(&agent.username);
    auth.auto_pwd.clone_from(&agent.password);
    auth.auto_ldap_group_dn = match &agent.group_dn {
        Some(group_dn) => group_dn.clone(),
        None if !auth.auto_ldap_group_dn.is_empty() => DELETION_SENTINEL.to_owned(),
        None => String::new(),
    };
    auth.auto_auth_mechanisms = vec![Mechanism::LdapPlain.to_string()];
}

pub(super) fn disable_agent(config: &mut AutomationConfig) {
    let auth = &mut config.auth;
    super::remove_mechanism(&mut auth.auto_auth_mechanisms, Mechanism::LdapPlain);
    if !auth.auto_ldap_group_dn.is_empty() {
        auth.auto_ldap_group_dn = DELETION_SENTINEL.to_owned();
    }
}

pub(super) fn is_agent_configured(config: &AutomationConfig, agent: &LdapAgentUser) -> bool {
    let auth = &config.auth;
    auth.is_enabled()
        && contains_mechanism(&auth.auto_auth_mechanisms, Mechanism::LdapPlain)
        && auth.auto_user == agent.username
        && auth.auto_pwd == agent.password
        && auth.auto_ldap_group_dn == agent.group_dn.as_deref().unwrap_or_default()
}
