//! Typed projections of the `auth`, `ssl` and `ldap` sections of a [`Deployment`].
//!
//! The sections are decoded into structs when an [`AutomationConfig`] is built and merged back
//! into the deployment document by [`AutomationConfig::apply`]. Only fields the structs know
//! about are ever changed, setting a field to [`DELETION_SENTINEL`] removes it from the document.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use mongodb_shared::merge::{self, DELETION_SENTINEL, merge_with};
use rand::{Rng as _, distr::Alphanumeric};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use snafu::{ResultExt, Snafu};
use strum::Display;

use crate::om::deployment::{AUTH_KEY, Deployment, LDAP_KEY, TLS_KEY};

pub const AUTOMATION_AGENT_NAME: &str = "mms-automation";
pub const KEY_FILE_PATH: &str = "/var/lib/mongodb-mms-automation/authentication/keyfile";
pub const KEY_FILE_WINDOWS_PATH: &str = "%SystemDrive%\\MMSAutomation\\versions\\keyfile";
pub const AGENT_PEM_KEY_FILE_PATH: &str = "/mongodb-automation/agent-certs/agent.pem";

/// Placeholder contents agents are shipped with, they must be replaced before enabling auth.
pub const INVALID_KEY_FILE_CONTENTS: &str = "DUMMYFILE";
pub const INVALID_AUTOMATION_AGENT_PASSWORD: &str = "D9XK2SfdR2obIevI9aKsYlVH";

const KEY_FILE_BYTES: usize = 500;
const PASSWORD_LENGTH: usize = 24;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to decode the {section:?} section of the deployment"))]
    DecodeSection {
        source: serde_json::Error,
        section: &'static str,
    },

    #[snafu(display("failed to merge the {section:?} section into the deployment"))]
    MergeSection {
        source: merge::Error,
        section: &'static str,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Whether clients (including the agents) must present a certificate when connecting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum ClientCertificateMode {
    #[default]
    Optional,
    Require,
}

/// A deployment document together with typed views of its authentication related sections.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AutomationConfig {
    pub auth: Auth,
    pub agent_ssl: AgentSsl,
    pub ldap: Option<Ldap>,
    pub deployment: Deployment,
}

impl AutomationConfig {
    /// Decodes the `auth`, `ssl` and `ldap` sections. Missing sections get their defaults.
    pub fn from_deployment(deployment: Deployment) -> Result<Self> {
        let auth = decode_section(&deployment, AUTH_KEY)?.unwrap_or_else(Auth::new);
        let agent_ssl = decode_section(&deployment, TLS_KEY)?.unwrap_or_default();
        let ldap = decode_section(&deployment, LDAP_KEY)?;

        Ok(Self {
            auth,
            agent_ssl,
            ldap,
            deployment,
        })
    }

    /// Merges the typed sections back into the deployment.
    ///
    /// `auth` and `ssl` are only written if the deployment already has them, the agents create
    /// them. `ldap` is created once it is configured.
    pub fn apply(&mut self) -> Result<()> {
        if let Some(merged) = merge_section(&self.deployment, AUTH_KEY, &self.auth)? {
            self.deployment.set_section(AUTH_KEY, merged);
            // removed users are gone from the document now
            self.auth.users.retain(Option::is_some);
        }
        if let Some(merged) = merge_section(&self.deployment, TLS_KEY, &self.agent_ssl)? {
            self.deployment.set_section(TLS_KEY, merged);
        }
        if let Some(ldap) = &self.ldap {
            let original = self
                .deployment
                .section(LDAP_KEY)
                .cloned()
                .unwrap_or_default();
            let merged = merge_with(ldap, &original).context(MergeSectionSnafu {
                section: LDAP_KEY,
            })?;
            self.deployment.set_section(LDAP_KEY, merged);
        }
        Ok(())
    }

    /// Makes sure the agents have a usable keyfile for internal cluster authentication.
    pub fn ensure_key_file_contents(&mut self) {
        if self.auth.key.is_empty() || self.auth.key == INVALID_KEY_FILE_CONTENTS {
            self.auth.key = generate_key_file_contents();
        }
    }

    /// Makes sure the automation agent has a password and returns it.
    pub fn ensure_password(&mut self) -> &str {
        if self.auth.auto_pwd.is_empty()
            || self.auth.auto_pwd == INVALID_AUTOMATION_AGENT_PASSWORD
            || self.auth.auto_pwd == DELETION_SENTINEL
        {
            self.auth.auto_pwd = generate_password();
        }
        &self.auth.auto_pwd
    }

    /// The mechanism the automation agent currently authenticates with, if any.
    pub fn agent_auth_mode(&self) -> Option<&str> {
        Some(self.auth.auto_auth_mechanism.as_str()).filter(|mode| !mode.is_empty())
    }
}

fn decode_section<T: DeserializeOwned>(
    deployment: &Deployment,
    section: &'static str,
) -> Result<Option<T>> {
    deployment
        .section(section)
        .map(|map| serde_json::from_value(Value::Object(map.clone())))
        .transpose()
        .context(DecodeSectionSnafu { section })
}

fn merge_section<T: Serialize>(
    deployment: &Deployment,
    section: &'static str,
    desired: &T,
) -> Result<Option<Map<String, Value>>> {
    deployment
        .section(section)
        .map(|original| merge_with(desired, original))
        .transpose()
        .context(MergeSectionSnafu { section })
}

fn generate_key_file_contents() -> String {
    let bytes: Vec<u8> = (0..KEY_FILE_BYTES).map(|_| rand::random::<u8>()).collect();
    STANDARD.encode(bytes)
}

fn generate_password() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LENGTH)
        .map(char::from)
        .collect()
}

/// The `auth` section: agent credentials, enabled mechanisms and the users the agents maintain.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Auth {
    /// Users at the project level. A `None` entry is removed from the document on apply.
    #[serde(rename = "usersWanted", default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<Option<MongoDbUser>>,

    #[serde(default)]
    pub disabled: bool,

    /// Whether users not listed in `usersWanted` are removed from the deployment.
    #[serde(default)]
    pub authoritative_set: bool,

    /// Mechanisms the automation agent may use, at most one at a time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub auto_auth_mechanisms: Vec<String>,

    /// Maintained by Ops Manager.
    #[serde(default)]
    pub auto_auth_mechanism: String,

    /// Mechanisms clients may use to authenticate against the deployment.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deployment_auth_mechanisms: Vec<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auto_user: String,

    /// Contents of the keyfile at [`Auth::key_file`].
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,

    #[serde(rename = "keyfile", default, skip_serializing_if = "String::is_empty")]
    pub key_file: String,

    #[serde(rename = "keyfileWindows", default, skip_serializing_if = "String::is_empty")]
    pub key_file_windows: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auto_pwd: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub new_auto_pwd: String,

    #[serde(rename = "autoLdapGroupDN", default, skip_serializing_if = "String::is_empty")]
    pub auto_ldap_group_dn: String,
}

impl Auth {
    /// An `auth` section with authentication disabled.
    pub fn new() -> Self {
        Self {
            disabled: true,
            authoritative_set: true,
            auto_auth_mechanism: "MONGODB-CR".to_owned(),
            auto_user: AUTOMATION_AGENT_NAME.to_owned(),
            key_file: KEY_FILE_PATH.to_owned(),
            key_file_windows: KEY_FILE_WINDOWS_PATH.to_owned(),
            ..Self::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.disabled
    }

    pub fn add_user(&mut self, user: MongoDbUser) {
        self.users.push(Some(user));
    }

    /// Returns the position and the user identified by `username` and `database`.
    pub fn user(&self, username: &str, database: &str) -> Option<(usize, &MongoDbUser)> {
        self.users.iter().enumerate().find_map(|(i, user)| {
            user.as_ref()
                .filter(|user| user.is(username, database))
                .map(|user| (i, user))
        })
    }

    pub fn has_user(&self, username: &str, database: &str) -> bool {
        self.user(username, database).is_some()
    }

    /// Replaces the user with the same username and database. Returns `false` if there is none.
    pub fn update_user(&mut self, user: MongoDbUser) -> bool {
        let Some((i, _)) = self.user(&user.username, &user.database) else {
            return false;
        };
        self.users[i] = Some(user);
        true
    }

    /// Adds the user, or replaces the one with the same username and database.
    pub fn ensure_user(&mut self, user: MongoDbUser) {
        if !self.has_user(&user.username, &user.database) {
            self.add_user(user);
        } else {
            self.update_user(user);
        }
    }

    /// Marks the user for removal. Returns whether there was such a user.
    pub fn ensure_user_removed(&mut self, username: &str, database: &str) -> bool {
        match self.user(username, database) {
            Some((i, _)) => {
                self.users[i] = None;
                true
            }
            None => false,
        }
    }

    pub fn users(&self) -> impl Iterator<Item = &MongoDbUser> {
        self.users.iter().flatten()
    }
}

/// The `ssl` section, as far as it concerns the agents.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSsl {
    #[serde(rename = "CAFilePath", default, skip_serializing_if = "Option::is_none")]
    pub ca_file_path: Option<String>,

    /// Certificate the agents authenticate with.
    #[serde(
        rename = "autoPEMKeyFilePath",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub auto_pem_key_file_path: Option<String>,

    #[serde(
        rename = "clientCertificateMode",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub client_certificate_mode: Option<String>,
}

impl AgentSsl {
    pub fn uses_client_certificate(&self) -> bool {
        self.auto_pem_key_file_path
            .as_deref()
            .is_some_and(|path| !path.is_empty() && path != DELETION_SENTINEL)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MongoDbUser {
    #[serde(default)]
    pub mechanisms: Vec<String>,

    #[serde(default)]
    pub roles: Vec<Role>,

    #[serde(rename = "user")]
    pub username: String,

    #[serde(rename = "db")]
    pub database: String,

    #[serde(default)]
    pub authentication_restrictions: Vec<Value>,

    /// Clear text password, consumed by the agents when they create the user.
    #[serde(rename = "initPwd", default, skip_serializing_if = "Option::is_none")]
    pub init_password: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scram_sha256_creds: Option<ScramShaCreds>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scram_sha1_creds: Option<ScramShaCreds>,
}

impl MongoDbUser {
    pub fn new(username: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            database: database.into(),
            ..Self::default()
        }
    }

    pub fn with_role(mut self, role: &str, database: &str) -> Self {
        self.roles.push(Role {
            role: role.to_owned(),
            database: database.to_owned(),
        });
        self
    }

    pub fn with_init_password(mut self, password: impl Into<String>) -> Self {
        self.init_password = Some(password.into());
        self
    }

    fn is(&self, username: &str, database: &str) -> bool {
        self.username == username && self.database == database
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub role: String,

    #[serde(rename = "db")]
    pub database: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScramShaCreds {
    pub iteration_count: u32,
    pub salt: String,
    pub server_key: String,
    pub stored_key: String,
}

/// The `ldap` section, configuring LDAP authentication and authorization of the deployment.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ldap {
    /// Comma separated `host:port` list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub servers: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_security: Option<String>,

    #[serde(
        rename = "validateLDAPServerConfig",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub validate_ldap_server_config: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_method: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_query_user: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_query_password: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_sasl_mechanisms: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authz_query_template: Option<String>,

    #[serde(
        rename = "userToDNMapping",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub user_to_dn_mapping: Option<String>,

    #[serde(rename = "timeoutMS", default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_cache_invalidation_interval: Option<u64>,

    #[serde(rename = "CAFileContents", default, skip_serializing_if = "Option::is_none")]
    pub ca_file_contents: Option<String>,
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use serde_json::json;

    use super::*;

    fn automation_config(document: Value) -> AutomationConfig {
        let deployment = Deployment::from_value(document).expect("fixture is a valid deployment");
        AutomationConfig::from_deployment(deployment).expect("sections are valid")
    }

    fn user(username: &str) -> MongoDbUser {
        MongoDbUser::new(username, "admin").with_role("read", "admin")
    }

    #[test]
    fn sections_are_decoded() {
        let document: Value = serde_yaml::from_str(indoc! {"
            auth:
              disabled: false
              authoritativeSet: false
              autoUser: mms-automation
              autoAuthMechanisms: [SCRAM-SHA-256]
              deploymentAuthMechanisms: [SCRAM-SHA-256, MONGODB-X509]
              usersWanted:
                - user: app
                  db: admin
                  roles: [{role: readWrite, db: app}]
            ssl:
              CAFilePath: /mongodb-automation/ca.pem
              clientCertificateMode: REQUIRE
            ldap:
              servers: ldap.example.com:636
              timeoutMS: 10000
        "})
        .expect("test YAML is valid");

        let ac = automation_config(document);

        assert!(ac.auth.is_enabled());
        assert_eq!(ac.auth.deployment_auth_mechanisms, vec!["SCRAM-SHA-256", "MONGODB-X509"]);
        assert_eq!(ac.auth.users().count(), 1);
        assert_eq!(ac.agent_ssl.client_certificate_mode.as_deref(), Some("REQUIRE"));
        assert!(!ac.agent_ssl.uses_client_certificate());
        assert_eq!(ac.ldap.and_then(|ldap| ldap.timeout_ms), Some(10000));
    }

    #[test]
    fn missing_auth_section_gets_defaults() {
        let ac = automation_config(json!({}));
        assert_eq!(ac.auth, Auth::new());
        assert_eq!(ac.agent_ssl, AgentSsl::default());
        assert_eq!(ac.ldap, None);
    }

    #[test]
    fn apply_keeps_unknown_fields() {
        let mut ac = automation_config(json!({
            "auth": {
                "disabled": true,
                "autoUser": "mms-automation",
                "usersWantedHistory": [1, 2],
                "usersWanted": [
                    {"user": "app", "db": "admin", "roles": [], "customData": {"team": "a"}},
                ],
            },
            "ssl": {"clientCertificateMode": "OPTIONAL", "CAFilePath": "/ca.pem", "sslCustom": true},
        }));

        ac.auth.disabled = false;
        ac.apply().expect("sections merge");

        let auth = ac.deployment.section(AUTH_KEY).expect("auth exists");
        assert_eq!(auth.get("disabled"), Some(&json!(false)));
        assert_eq!(
            auth.get("usersWanted"),
            Some(&json!([
                {
                    "mechanisms": [],
                    "roles": [],
                    "user": "app",
                    "db": "admin",
                    "authenticationRestrictions": [],
                    "customData": {"team": "a"},
                },
            ]))
        );
        // arrays the typed section doesn't know are not carried over
        assert_eq!(auth.get("usersWantedHistory"), Some(&json!([])));
        assert_eq!(
            ac.deployment
                .section(TLS_KEY)
                .and_then(|tls| tls.get("sslCustom")),
            Some(&json!(true))
        );
    }

    #[test]
    fn deletion_sentinel_removes_field() {
        let mut ac = automation_config(json!({
            "ssl": {
                "autoPEMKeyFilePath": "/mongodb-automation/agent-certs/agent.pem",
                "clientCertificateMode": "REQUIRE",
            },
        }));
        assert!(ac.agent_ssl.uses_client_certificate());

        ac.agent_ssl.auto_pem_key_file_path = Some(DELETION_SENTINEL.to_owned());
        ac.agent_ssl.client_certificate_mode = Some(ClientCertificateMode::Optional.to_string());
        ac.apply().expect("sections merge");

        assert_eq!(
            ac.deployment.section(TLS_KEY).cloned(),
            json!({"clientCertificateMode": "OPTIONAL"}).as_object().cloned()
        );
    }

    #[test]
    fn agent_sections_missing_from_the_deployment_are_not_written() {
        let mut ac = automation_config(json!({}));
        ac.auth.disabled = false;
        ac.agent_ssl.client_certificate_mode = Some("REQUIRE".to_owned());
        ac.apply().expect("sections merge");

        assert_eq!(ac.deployment.section(AUTH_KEY), None);
        assert_eq!(ac.deployment.section(TLS_KEY), None);
    }

    #[test]
    fn ldap_section_is_created() {
        let mut ac = automation_config(json!({}));
        ac.ldap = Some(Ldap {
            servers: Some("ldap.example.com:636".to_owned()),
            ..Ldap::default()
        });
        ac.apply().expect("sections merge");

        assert_eq!(
            ac.deployment.section(LDAP_KEY).cloned(),
            json!({"servers": "ldap.example.com:636"}).as_object().cloned()
        );
    }

    #[test]
    fn apply_is_idempotent() {
        let mut ac = automation_config(json!({
            "auth": {"disabled": false, "autoUser": "mms-automation", "custom": "x"},
            "ssl": {"clientCertificateMode": "OPTIONAL"},
        }));
        ac.auth.ensure_user(user("app"));

        ac.apply().expect("sections merge");
        let once = ac.deployment.clone();
        ac.apply().expect("sections merge");
        assert_eq!(ac.deployment, once);
    }

    #[test]
    fn users_are_unique_per_name_and_database() {
        let mut auth = Auth::new();
        auth.ensure_user(user("app"));
        auth.ensure_user(user("app").with_role("readWrite", "app"));
        auth.ensure_user(MongoDbUser::new("app", "$external"));

        assert_eq!(auth.users().count(), 2);
        let (position, stored) = auth.user("app", "admin").expect("user exists");
        assert_eq!(position, 0);
        assert_eq!(stored.roles.len(), 2);
    }

    #[test]
    fn removed_users_are_dropped_on_apply() {
        let mut ac = automation_config(json!({"auth": {"disabled": true}}));
        ac.auth.ensure_user(user("a"));
        ac.auth.ensure_user(user("b"));
        ac.apply().expect("sections merge");

        let mut ac = AutomationConfig::from_deployment(ac.deployment).expect("sections are valid");
        assert!(ac.auth.ensure_user_removed("a", "admin"));
        assert!(!ac.auth.ensure_user_removed("a", "admin"));
        assert!(!ac.auth.has_user("a", "admin"));
        ac.apply().expect("sections merge");

        let users = ac
            .deployment
            .section(AUTH_KEY)
            .and_then(|auth| auth.get("usersWanted"))
            .and_then(Value::as_array)
            .expect("users exist");
        assert_eq!(users.len(), 1);
        assert_eq!(users[0]["user"], json!("b"));
    }

    #[test]
    fn reapplying_after_a_removal_keeps_the_remaining_users() {
        let mut ac = automation_config(json!({
            "auth": {
                "disabled": false,
                "usersWanted": [
                    {"user": "a", "db": "admin", "roles": []},
                    {"user": "b", "db": "admin", "roles": [], "customData": {"team": "b"}},
                ],
            },
        }));
        assert!(ac.auth.ensure_user_removed("a", "admin"));

        ac.apply().expect("sections merge");
        let once = ac.deployment.clone();
        ac.apply().expect("sections merge");

        assert_eq!(ac.deployment, once);
        assert_eq!(ac.auth.users.len(), 1);
        let users = ac
            .deployment
            .section(AUTH_KEY)
            .and_then(|auth| auth.get("usersWanted"))
            .and_then(Value::as_array)
            .expect("users exist");
        assert_eq!(users.len(), 1);
        assert_eq!(users[0]["user"], json!("b"));
        assert_eq!(users[0]["customData"], json!({"team": "b"}));
    }

    #[test]
    fn key_file_and_password_are_generated_once() {
        let mut ac = automation_config(json!({"auth": {"key": INVALID_KEY_FILE_CONTENTS}}));

        ac.ensure_key_file_contents();
        let key = ac.auth.key.clone();
        assert_ne!(key, INVALID_KEY_FILE_CONTENTS);
        assert!(key.len() > KEY_FILE_BYTES);
        ac.ensure_key_file_contents();
        assert_eq!(ac.auth.key, key);

        let password = ac.ensure_password().to_owned();
        assert_eq!(password.len(), PASSWORD_LENGTH);
        assert_eq!(ac.ensure_password(), password);
    }
}
